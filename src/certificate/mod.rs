//! Certificate parsing, trust stores and chain validation.

pub mod trust;
pub mod validate;

pub use trust::TrustStore;
pub use validate::{CertificateValidator, ValidationResult};

use crate::tls::ProtocolVersion;
use crate::util::hex::to_hex;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("certificate {index} in the chain cannot be parsed: {reason}")]
pub struct CertificateParseError {
    pub index: usize,
    pub reason: String,
}

/// Decoded view of one X.509 certificate. The DER bytes travel along for
/// signature checks but are not serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
    /// Basic constraints `cA`, absent when the extension is missing.
    pub is_ca: Option<bool>,
    pub path_len: Option<u32>,
    pub key_cert_sign: Option<bool>,
    pub server_auth: Option<bool>,
    pub self_issued: bool,
    pub signature_algorithm: String,
    pub sha256: String,
    #[serde(skip)]
    der: Vec<u8>,
    #[serde(skip)]
    subject_raw: Vec<u8>,
    #[serde(skip)]
    issuer_raw: Vec<u8>,
}

impl CertificateInfo {
    pub fn from_der(der: &[u8]) -> Result<Self, String> {
        let (rest, cert) = X509Certificate::from_der(der).map_err(|err| err.to_string())?;
        if !rest.is_empty() {
            return Err(format!("{} trailing bytes after certificate", rest.len()));
        }

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let (is_ca, path_len) = match cert.basic_constraints() {
            Ok(Some(bc)) => (Some(bc.value.ca), bc.value.path_len_constraint),
            _ => (None, None),
        };
        let key_cert_sign = match cert.key_usage() {
            Ok(Some(ku)) => Some(ku.value.key_cert_sign()),
            _ => None,
        };
        let server_auth = match cert.extended_key_usage() {
            Ok(Some(eku)) => Some(eku.value.server_auth || eku.value.any),
            _ => None,
        };

        let subject_raw = cert.subject().as_raw().to_vec();
        let issuer_raw = cert.issuer().as_raw().to_vec();
        let subject = cert.subject();
        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial: cert.raw_serial_as_string(),
            not_before: timestamp(cert.validity().not_before.timestamp()),
            not_after: timestamp(cert.validity().not_after.timestamp()),
            common_name,
            dns_names,
            ip_addresses,
            is_ca,
            path_len,
            key_cert_sign,
            server_auth,
            self_issued: subject_raw == issuer_raw,
            signature_algorithm: cert.signature_algorithm.algorithm.to_id_string(),
            sha256: to_hex(&openssl::sha::sha256(der)),
            der: der.to_vec(),
            subject_raw,
            issuer_raw,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject_raw(&self) -> &[u8] {
        &self.subject_raw
    }

    pub fn issuer_raw(&self) -> &[u8] {
        &self.issuer_raw
    }

    pub fn issued(&self, child: &CertificateInfo) -> bool {
        self.subject_raw == child.issuer_raw
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<String> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(std::net::Ipv4Addr::from(octets).to_string())
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(std::net::Ipv6Addr::from(octets).to_string())
        }
        _ => None,
    }
}

/// Certificates as presented by the server, leaf first. Never modified after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateChain {
    certificates: Vec<CertificateInfo>,
}

impl CertificateChain {
    pub fn from_der_list(ders: &[Vec<u8>]) -> Result<Self, CertificateParseError> {
        let certificates = ders
            .iter()
            .enumerate()
            .map(|(index, der)| {
                CertificateInfo::from_der(der)
                    .map_err(|reason| CertificateParseError { index, reason })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { certificates })
    }

    pub fn leaf(&self) -> Option<&CertificateInfo> {
        self.certificates.first()
    }

    pub fn get(&self, index: usize) -> Option<&CertificateInfo> {
        self.certificates.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CertificateInfo> {
        self.certificates.iter()
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Each certificate is followed by its issuer.
    pub fn is_ordered(&self) -> bool {
        self.certificates
            .windows(2)
            .all(|pair| pair[1].issued(&pair[0]))
    }

    pub fn facts(&self) -> ChainFacts {
        ChainFacts {
            length: self.len(),
            ordered: self.is_ordered(),
            leaf_self_signed: self.leaf().map(|l| l.self_issued).unwrap_or(false),
            root_included: self
                .certificates
                .iter()
                .skip(1)
                .any(|c| c.self_issued),
            leaf_sha256: self.leaf().map(|l| l.sha256.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainFacts {
    pub length: usize,
    pub ordered: bool,
    pub leaf_self_signed: bool,
    /// A self-issued certificate was sent after the leaf.
    pub root_included: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf_sha256: Option<String>,
}

/// Payload of the certificate probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateFindings {
    pub chain: CertificateChain,
    pub facts: ChainFacts,
    pub validation: BTreeMap<String, ValidationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiated_version: Option<ProtocolVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiated_cipher: Option<String>,
}

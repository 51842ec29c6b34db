use super::CertificateInfo;
use crate::error::TrustStoreError;
use openssl::x509::X509;
use std::path::Path;
use tracing::{debug, warn};

/// Well-known locations of the operating system's CA bundle.
const SYSTEM_BUNDLES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/ca-trust/extracted/pem/tls-ca-bundle.pem",
    "/etc/ssl/cert.pem",
    "/usr/local/etc/openssl/cert.pem",
];

pub(crate) struct Anchor {
    pub(crate) info: CertificateInfo,
    pub(crate) x509: X509,
}

/// A named set of trust anchors.
pub struct TrustStore {
    name: String,
    anchors: Vec<Anchor>,
}

impl std::fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustStore")
            .field("name", &self.name)
            .field("anchors", &self.anchors.len())
            .finish()
    }
}

impl TrustStore {
    pub fn from_pem(name: impl Into<String>, pem: &[u8]) -> Result<Self, TrustStoreError> {
        let name = name.into();
        let certs = X509::stack_from_pem(pem).map_err(|source| TrustStoreError::Parse {
            name: name.clone(),
            source,
        })?;

        let mut anchors = Vec::with_capacity(certs.len());
        for x509 in certs {
            let parsed = x509
                .to_der()
                .map_err(|err| err.to_string())
                .and_then(|der| CertificateInfo::from_der(&der));
            match parsed {
                Ok(info) => anchors.push(Anchor { info, x509 }),
                Err(reason) => warn!(store = %name, %reason, "skipping unparsable anchor"),
            }
        }
        if anchors.is_empty() {
            return Err(TrustStoreError::Empty(name));
        }
        debug!(store = %name, anchors = anchors.len(), "loaded trust store");
        Ok(Self { name, anchors })
    }

    /// Load a PEM bundle; the store is named after the file stem.
    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self, TrustStoreError> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|source| TrustStoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::from_pem(name, &pem)
    }

    pub fn system() -> Result<Self, TrustStoreError> {
        for candidate in SYSTEM_BUNDLES {
            let path = Path::new(candidate);
            if !path.is_file() {
                continue;
            }
            let pem = std::fs::read(path).map_err(|source| TrustStoreError::Io {
                path: candidate.to_string(),
                source,
            })?;
            return Self::from_pem("system", &pem);
        }
        Err(TrustStoreError::NoSystemStore)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    pub(crate) fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn contains(&self, cert: &CertificateInfo) -> bool {
        self.anchors.iter().any(|a| a.info.der() == cert.der())
    }
}

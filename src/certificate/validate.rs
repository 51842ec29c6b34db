//! Chain validation, performed independently against each trust store.
//!
//! Validation never fails as a whole: every problem is recorded in the
//! [`ValidationResult`] of the store it concerns.

use super::trust::TrustStore;
use super::{CertificateChain, CertificateInfo};
use chrono::{DateTime, Utc};
use openssl::x509::{X509Ref, X509};
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use tracing::debug;

const DEFAULT_MAX_DEPTH: usize = 8;
const DEFAULT_SIGNATURE_BUDGET: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub trusted: bool,
    /// Subjects from leaf to anchor.
    pub path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_error: Option<PathError>,
    pub hostname_match: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub time_violations: Vec<TimeViolation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub constraint_violations: Vec<ConstraintViolation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chain_issues: Vec<ChainIssue>,
}

impl ValidationResult {
    fn untrusted(hostname_match: bool, error: PathError) -> Self {
        Self {
            trusted: false,
            path: Vec::new(),
            path_error: Some(error),
            hostname_match,
            time_violations: Vec::new(),
            constraint_violations: Vec::new(),
            chain_issues: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.trusted
            && self.hostname_match
            && self.time_violations.is_empty()
            && self.constraint_violations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PathError {
    EmptyChain,
    UnparsableCertificate { reason: String },
    NoTrustedIssuer { subject: String },
    DepthExceeded { limit: usize },
    /// Path building gave up after this many signature verifications.
    BudgetExceeded { signature_checks: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeViolationKind {
    NotYetValid,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeViolation {
    pub subject: String,
    pub kind: TimeViolationKind,
    pub boundary: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    NotCa,
    PathLenExceeded,
    MissingKeyCertSign,
    NotServerAuth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintViolation {
    pub subject: String,
    pub kind: ConstraintKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainIssue {
    OutOfOrder,
    UnusedCertificates { count: usize },
    AnchorSent,
}

#[derive(Debug, Clone)]
pub struct CertificateValidator {
    max_depth: usize,
    signature_budget: usize,
    at: Option<DateTime<Utc>>,
}

impl Default for CertificateValidator {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            signature_budget: DEFAULT_SIGNATURE_BUDGET,
            at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Node {
    Presented(usize),
    Anchor(usize),
}

struct Search<'a> {
    chain: &'a CertificateChain,
    x509s: &'a [X509],
    store: &'a TrustStore,
    max_depth: usize,
    /// (node, path length) states already known to lead nowhere.
    dead_ends: RefCell<HashSet<(Node, usize)>>,
    signature_checks: Cell<usize>,
    signature_budget: usize,
}

impl<'a> Search<'a> {
    fn new(
        chain: &'a CertificateChain,
        x509s: &'a [X509],
        store: &'a TrustStore,
        max_depth: usize,
        signature_budget: usize,
    ) -> Self {
        Self {
            chain,
            x509s,
            store,
            max_depth,
            dead_ends: RefCell::new(HashSet::new()),
            signature_checks: Cell::new(0),
            signature_budget,
        }
    }

    fn info(&self, node: Node) -> &'a CertificateInfo {
        match node {
            Node::Presented(i) => &self.chain.certificates[i],
            Node::Anchor(i) => &self.store.anchors()[i].info,
        }
    }

    fn x509(&self, node: Node) -> &'a X509Ref {
        match node {
            Node::Presented(i) => &self.x509s[i],
            Node::Anchor(i) => &self.store.anchors()[i].x509,
        }
    }

    fn verify(&self, child: Node, issuer: &X509Ref) -> Result<bool, PathError> {
        let used = self.signature_checks.get();
        if used >= self.signature_budget {
            return Err(PathError::BudgetExceeded {
                signature_checks: used,
            });
        }
        self.signature_checks.set(used + 1);
        Ok(signed_by(self.x509(child), issuer))
    }

    /// Depth-first search for an issuer path from the last node of `path`
    /// to an anchor. Anchors are preferred over presented intermediates.
    fn extend(&self, path: &mut Vec<Node>) -> Result<(), PathError> {
        let current = match path.last() {
            Some(node) => *node,
            None => return Err(PathError::EmptyChain),
        };
        let cert = self.info(current);
        match current {
            Node::Anchor(_) => return Ok(()),
            Node::Presented(_) if self.store.contains(cert) => return Ok(()),
            Node::Presented(_) => {}
        }
        if path.len() > self.max_depth {
            return Err(PathError::DepthExceeded {
                limit: self.max_depth,
            });
        }
        let state = (current, path.len());
        let no_issuer = || PathError::NoTrustedIssuer {
            subject: cert.subject.clone(),
        };
        if self.dead_ends.borrow().contains(&state) {
            return Err(no_issuer());
        }

        for (idx, anchor) in self.store.anchors().iter().enumerate() {
            if anchor.info.issued(cert) && self.verify(current, &anchor.x509)? {
                path.push(Node::Anchor(idx));
                return Ok(());
            }
        }

        let mut tried: HashSet<&[u8]> = HashSet::new();
        let mut last_err = None;
        for (idx, candidate) in self.chain.certificates.iter().enumerate() {
            let node = Node::Presented(idx);
            if path.contains(&node)
                || candidate.der() == cert.der()
                || !candidate.issued(cert)
                || !tried.insert(candidate.der())
            {
                continue;
            }
            if !self.verify(current, &self.x509s[idx])? {
                continue;
            }
            path.push(node);
            match self.extend(path) {
                Ok(()) => return Ok(()),
                Err(err @ PathError::BudgetExceeded { .. }) => return Err(err),
                Err(err) => {
                    last_err = Some(err);
                    path.pop();
                }
            }
        }

        self.dead_ends.borrow_mut().insert(state);
        Err(last_err.unwrap_or_else(no_issuer))
    }
}

fn signed_by(child: &X509Ref, issuer: &X509Ref) -> bool {
    issuer
        .public_key()
        .and_then(|key| child.verify(&key))
        .unwrap_or(false)
}

impl CertificateValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth.max(1);
        self
    }

    /// Cap on signature verifications per store; a search that hits it ends
    /// untrusted with [`PathError::BudgetExceeded`].
    pub fn with_signature_budget(mut self, budget: usize) -> Self {
        self.signature_budget = budget.max(1);
        self
    }

    /// Evaluate validity periods at a fixed instant instead of now.
    pub fn at(mut self, instant: DateTime<Utc>) -> Self {
        self.at = Some(instant);
        self
    }

    pub fn validate(
        &self,
        chain: &CertificateChain,
        hostname: &str,
        stores: &[TrustStore],
    ) -> BTreeMap<String, ValidationResult> {
        stores
            .iter()
            .map(|store| {
                let result = self.validate_against(chain, hostname, store);
                debug!(store = store.name(), trusted = result.trusted, "validated chain");
                (store.name().to_string(), result)
            })
            .collect()
    }

    fn validate_against(
        &self,
        chain: &CertificateChain,
        hostname: &str,
        store: &TrustStore,
    ) -> ValidationResult {
        let now = self.at.unwrap_or_else(Utc::now);
        let leaf = match chain.leaf() {
            Some(leaf) => leaf,
            None => return ValidationResult::untrusted(false, PathError::EmptyChain),
        };
        let hostname_match = matches_hostname(leaf, hostname);

        let x509s = match chain
            .iter()
            .map(|c| X509::from_der(c.der()))
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(x509s) => x509s,
            Err(err) => {
                return ValidationResult::untrusted(
                    hostname_match,
                    PathError::UnparsableCertificate {
                        reason: err.to_string(),
                    },
                )
            }
        };

        let search = Search::new(chain, &x509s, store, self.max_depth, self.signature_budget);
        let mut path = vec![Node::Presented(0)];
        let path_result = search.extend(&mut path);

        let mut result = match path_result {
            Ok(()) => ValidationResult {
                trusted: true,
                path: path.iter().map(|n| search.info(*n).subject.clone()).collect(),
                path_error: None,
                hostname_match,
                time_violations: Vec::new(),
                constraint_violations: Vec::new(),
                chain_issues: Vec::new(),
            },
            Err(err) => {
                path = vec![Node::Presented(0)];
                ValidationResult::untrusted(hostname_match, err)
            }
        };

        for node in &path {
            let cert = search.info(*node);
            if let Some(kind) = time_violation(cert, now) {
                result.time_violations.push(TimeViolation {
                    subject: cert.subject.clone(),
                    kind,
                    boundary: match kind {
                        TimeViolationKind::NotYetValid => cert.not_before,
                        TimeViolationKind::Expired => cert.not_after,
                    },
                });
            }
        }

        if leaf.server_auth == Some(false) {
            result.constraint_violations.push(ConstraintViolation {
                subject: leaf.subject.clone(),
                kind: ConstraintKind::NotServerAuth,
            });
        }
        if result.trusted {
            result
                .constraint_violations
                .extend(issuer_constraints(&search, &path));
        }

        if !chain.is_ordered() {
            result.chain_issues.push(ChainIssue::OutOfOrder);
        }
        if result.trusted {
            let unused = (0..chain.len())
                .filter(|i| !path.contains(&Node::Presented(*i)))
                .count();
            if unused > 0 {
                result
                    .chain_issues
                    .push(ChainIssue::UnusedCertificates { count: unused });
            }
        }
        if chain.iter().any(|c| store.contains(c)) {
            result.chain_issues.push(ChainIssue::AnchorSent);
        }
        result
    }
}

fn time_violation(cert: &CertificateInfo, now: DateTime<Utc>) -> Option<TimeViolationKind> {
    if now < cert.not_before {
        Some(TimeViolationKind::NotYetValid)
    } else if now > cert.not_after {
        Some(TimeViolationKind::Expired)
    } else {
        None
    }
}

/// Basic constraints and key usage of presented issuers. Anchors are trusted
/// as configured.
fn issuer_constraints(search: &Search<'_>, path: &[Node]) -> Vec<ConstraintViolation> {
    let mut violations = Vec::new();
    let mut intermediates_below = 0u32;
    for node in path.iter().skip(1) {
        let cert = search.info(*node);
        if let Node::Presented(_) = node {
            if cert.is_ca != Some(true) {
                violations.push(ConstraintViolation {
                    subject: cert.subject.clone(),
                    kind: ConstraintKind::NotCa,
                });
            }
            if cert.key_cert_sign == Some(false) {
                violations.push(ConstraintViolation {
                    subject: cert.subject.clone(),
                    kind: ConstraintKind::MissingKeyCertSign,
                });
            }
        }
        if let Some(limit) = cert.path_len {
            if intermediates_below > limit {
                violations.push(ConstraintViolation {
                    subject: cert.subject.clone(),
                    kind: ConstraintKind::PathLenExceeded,
                });
            }
        }
        if !cert.self_issued {
            intermediates_below += 1;
        }
    }
    violations
}

/// RFC 6125 style matching: SAN entries when present, otherwise the subject
/// common name. A wildcard covers exactly one left-most label.
pub fn matches_hostname(cert: &CertificateInfo, hostname: &str) -> bool {
    let host = hostname.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return cert
            .ip_addresses
            .iter()
            .any(|candidate| candidate.parse::<IpAddr>().ok() == Some(ip));
    }
    if cert.dns_names.is_empty() {
        return cert
            .common_name
            .as_deref()
            .map(|cn| matches_pattern(cn, &host))
            .unwrap_or(false);
    }
    cert.dns_names
        .iter()
        .any(|pattern| matches_pattern(pattern, &host))
}

fn matches_pattern(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            if !suffix.contains('.') {
                return false;
            }
            match host.split_once('.') {
                Some((label, rest)) => !label.is_empty() && rest == suffix,
                None => false,
            }
        }
        None => pattern == host,
    }
}

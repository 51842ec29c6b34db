use crate::certificate::CertificateFindings;
use crate::error::{ConnectError, ScanError};
use crate::net::proxy::HttpProxy;
use crate::tls::{Alert, ProtocolVersion};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// A server to scan. Immutable once handed to the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    /// Connect here instead of resolving `host`.
    pub ip: Option<IpAddr>,
    /// SNI and hostname-validation name when it differs from `host`.
    pub server_name: Option<String>,
    pub starttls: Option<StartTlsProtocol>,
    pub client_auth: Option<ClientAuth>,
    pub proxy: Option<HttpProxy>,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ip: None,
            server_name: None,
            starttls: None,
            client_auth: None,
            proxy: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_starttls(mut self, protocol: StartTlsProtocol) -> Self {
        self.starttls = Some(protocol);
        self
    }

    pub fn with_client_auth(mut self, auth: ClientAuth) -> Self {
        self.client_auth = Some(auth);
        self
    }

    pub fn with_proxy(mut self, proxy: HttpProxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Name sent as SNI and matched against the certificate.
    pub fn tls_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.host)
    }

    /// Identity used to detect the same server being queued twice.
    pub fn key(&self) -> (String, u16, Option<StartTlsProtocol>) {
        (self.host.to_ascii_lowercase(), self.port, self.starttls)
    }

    pub fn view(&self) -> TargetView {
        TargetView {
            host: self.host.clone(),
            port: self.port,
            ip: self.ip.map(|ip| ip.to_string()),
            server_name: self.tls_name().to_string(),
            starttls: self.starttls,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetView {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starttls: Option<StartTlsProtocol>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum StartTlsProtocol {
    Smtp,
    Imap,
    Pop3,
    Ftp,
    Ldap,
    Xmpp,
    XmppServer,
    Postgres,
}

impl StartTlsProtocol {
    pub fn default_port(self) -> u16 {
        match self {
            StartTlsProtocol::Smtp => 587,
            StartTlsProtocol::Imap => 143,
            StartTlsProtocol::Pop3 => 110,
            StartTlsProtocol::Ftp => 21,
            StartTlsProtocol::Ldap => 389,
            StartTlsProtocol::Xmpp => 5222,
            StartTlsProtocol::XmppServer => 5269,
            StartTlsProtocol::Postgres => 5432,
        }
    }
}

impl fmt::Display for StartTlsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StartTlsProtocol::Smtp => "smtp",
            StartTlsProtocol::Imap => "imap",
            StartTlsProtocol::Pop3 => "pop3",
            StartTlsProtocol::Ftp => "ftp",
            StartTlsProtocol::Ldap => "ldap",
            StartTlsProtocol::Xmpp => "xmpp",
            StartTlsProtocol::XmppServer => "xmpp_server",
            StartTlsProtocol::Postgres => "postgres",
        };
        write!(f, "{}", label)
    }
}

/// PEM files presented when a server asks for a client certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAuth {
    pub certificate_chain: PathBuf,
    pub private_key: PathBuf,
}

/// Limits and timeouts for one scanner.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub max_concurrent_targets: usize,
    pub max_concurrent_per_target: usize,
    pub per_probe_timeout: Duration,
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// How long in-flight probes may keep running after a stop request.
    pub cancel_grace: Duration,
    pub retry_backoff: Duration,
    /// New connections per second across the whole scanner.
    pub connect_rate: Option<u32>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_concurrent_targets: 8,
            max_concurrent_per_target: 5,
            per_probe_timeout: Duration::from_secs(10),
            max_retries: 2,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(250),
            connect_rate: None,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.max_concurrent_targets == 0 {
            return Err(ScanError::InvalidConfig(
                "max_concurrent_targets must be greater than zero".into(),
            ));
        }
        if self.max_concurrent_per_target == 0 {
            return Err(ScanError::InvalidConfig(
                "max_concurrent_per_target must be greater than zero".into(),
            ));
        }
        if self.per_probe_timeout.is_zero() {
            return Err(ScanError::InvalidConfig(
                "per_probe_timeout must be greater than zero".into(),
            ));
        }
        if self.connect_rate == Some(0) {
            return Err(ScanError::InvalidConfig(
                "connect_rate must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProbeId(pub String);

impl ProbeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeCategory {
    Capability,
    Extension,
    Vulnerability,
    Certificate,
}

/// Result of a single probe attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success(ProbePayload),
    Rejected(RejectReason),
    Timeout,
    ConnectionError(ConnectError),
    Inconclusive(InconclusiveReason),
}

impl ProbeOutcome {
    /// Outcomes that would come out the same on a retry.
    pub fn is_deterministic(&self) -> bool {
        matches!(self, ProbeOutcome::Success(_) | ProbeOutcome::Rejected(_))
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ProbeOutcome::Timeout => true,
            ProbeOutcome::ConnectionError(err) => err.is_transient(),
            _ => false,
        }
    }

    pub fn payload(&self) -> Option<&ProbePayload> {
        match self {
            ProbeOutcome::Success(payload) => Some(payload),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    Alert(Alert),
    Malformed(String),
    ConnectionClosed,
    VersionMismatch { offered: u16, negotiated: u16 },
    Ssl2Error(u16),
    HandshakeFailed(String),
    ClientCertificateRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum InconclusiveReason {
    Cancelled,
    ProbeFault(String),
    Undecided(String),
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbePayload {
    CipherAccepted(AcceptedSuite),
    Extension(ExtensionFinding),
    Vulnerability(VulnerabilityFinding),
    Certificate(Box<CertificateFindings>),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AcceptedSuite {
    pub version: ProtocolVersion,
    pub cipher_id: u32,
    pub cipher: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hello_retry: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionFinding {
    pub name: String,
    pub supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Vulnerable,
    NotVulnerable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VulnerabilityFinding {
    pub policy: String,
    pub policy_version: u32,
    pub verdict: Verdict,
    /// The decision-table row that produced the verdict.
    pub matched: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Rejected,
    TimedOut,
    Errored,
}

impl UnitState {
    pub fn terminal_for(outcome: &ProbeOutcome) -> Self {
        match outcome {
            ProbeOutcome::Success(_) => UnitState::Succeeded,
            ProbeOutcome::Rejected(_) => UnitState::Rejected,
            ProbeOutcome::Timeout => UnitState::TimedOut,
            ProbeOutcome::ConnectionError(_) | ProbeOutcome::Inconclusive(_) => UnitState::Errored,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            UnitState::Pending | UnitState::Running | UnitState::Retrying
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub outcome: ProbeOutcome,
    pub elapsed_ms: u64,
}

/// Everything the scheduler knows about one probe once it stopped running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub probe: ProbeId,
    pub category: ProbeCategory,
    pub state: UnitState,
    pub outcome: ProbeOutcome,
    pub attempts: Vec<AttemptRecord>,
}

impl ProbeRecord {
    /// Build the record from the attempt history, choosing the terminal
    /// outcome by precedence: deterministic outcomes beat transient ones,
    /// and among equals the latest attempt wins.
    pub fn from_attempts(
        probe: ProbeId,
        category: ProbeCategory,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        let outcome = attempts
            .iter()
            .rev()
            .find(|a| a.outcome.is_deterministic())
            .or_else(|| attempts.last())
            .map(|a| a.outcome.clone())
            .unwrap_or(ProbeOutcome::Inconclusive(InconclusiveReason::Cancelled));
        Self {
            probe,
            category,
            state: UnitState::terminal_for(&outcome),
            outcome,
            attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSupport {
    Accepted,
    Rejected,
    Undetermined,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScanStatus {
    Complete,
    Partial { gaps: Vec<Gap> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub probe: ProbeId,
    pub reason: GapReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapReason {
    TimedOut,
    Unreachable,
    Cancelled,
    Faulted,
    Undecided,
}

/// Signals from different probes that cannot all be true at once. Kept side
/// by side instead of being resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub subject: String,
    pub description: String,
    pub outcomes: BTreeMap<ProbeId, ProbeOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub target: TargetView,
    pub status: ScanStatus,
    pub protocol_support: BTreeMap<ProtocolVersion, VersionSupport>,
    pub accepted_suites: BTreeSet<AcceptedSuite>,
    pub weak_suites: BTreeSet<String>,
    pub extensions: BTreeMap<String, ExtensionFinding>,
    pub vulnerabilities: BTreeMap<String, VulnerabilityFinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateFindings>,
    pub probes: BTreeMap<ProbeId, ProbeRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<Conflict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScanReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.status, ScanStatus::Complete)
    }

    pub fn accepts(&self, version: ProtocolVersion, cipher: &str) -> bool {
        self.accepted_suites
            .iter()
            .any(|s| s.version == version && s.cipher == cipher)
    }
}

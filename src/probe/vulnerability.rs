//! Vulnerability probes driven by decision tables.
//!
//! A [`DecisionPolicy`] names the hello to send, an optional follow-up record
//! and an ordered list of response patterns with the verdict each implies.
//! Rules on the handshake response are tried first; the follow-up is only
//! sent when none of them matched an accepted handshake. The first matching
//! rule wins.

use super::{settle, Probe, ProbeContext, ProbeSpec, Requirement};
use crate::model::{
    InconclusiveReason, ProbeCategory, ProbeOutcome, ProbePayload, RejectReason, Verdict,
    VulnerabilityFinding,
};
use crate::net::Connection;
use crate::tls::ciphers::{self, TLS_FALLBACK_SCSV};
use crate::tls::codec::encode_heartbeat_request;
use crate::tls::{
    Alert, ClientHelloSpec, FollowUp, HandshakeResponse, ProtocolVersion, ReadUntil,
    CONTENT_HEARTBEAT, EXT_HEARTBEAT,
};
use async_trait::async_trait;
use tracing::{debug, instrument};

/// A record sent after the server accepted the hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpRequest {
    /// Heartbeat request whose payload length field claims more bytes than
    /// are actually sent.
    Heartbeat { claimed_len: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpPattern {
    Record { content_type: u8 },
    Alert,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePattern {
    /// A fatal alert; `None` matches any description.
    Alert { description: Option<u8> },
    ConnectionClosed,
    ServerHello,
    CompressionSelected,
    MissingExtension(u16),
    FollowUp(FollowUpPattern),
}

impl ResponsePattern {
    fn matches_handshake(&self, response: &HandshakeResponse) -> bool {
        match (self, response) {
            (ResponsePattern::Alert { description }, HandshakeResponse::Alert { alert, .. }) => {
                description.map_or(true, |d| d == alert.description)
            }
            (ResponsePattern::ConnectionClosed, HandshakeResponse::ConnectionClosed) => true,
            (ResponsePattern::ServerHello, HandshakeResponse::Accepted(flight)) => {
                flight.server_hello.is_some()
            }
            (ResponsePattern::CompressionSelected, HandshakeResponse::Accepted(flight)) => flight
                .server_hello
                .as_ref()
                .is_some_and(|hello| hello.compression != 0),
            (ResponsePattern::MissingExtension(kind), HandshakeResponse::Accepted(flight)) => {
                flight
                    .server_hello
                    .as_ref()
                    .is_some_and(|hello| !hello.has_extension(*kind))
            }
            _ => false,
        }
    }

    fn matches_follow_up(&self, reply: &FollowUp) -> bool {
        let ResponsePattern::FollowUp(pattern) = self else {
            return false;
        };
        match (pattern, reply) {
            (FollowUpPattern::Record { content_type }, FollowUp::Record { content_type: got, .. }) => {
                content_type == got
            }
            (FollowUpPattern::Alert, FollowUp::Alert(_)) => true,
            (FollowUpPattern::Closed, FollowUp::Closed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionRule {
    pub name: String,
    pub pattern: ResponsePattern,
    pub verdict: Verdict,
}

impl DecisionRule {
    pub fn new(name: impl Into<String>, pattern: ResponsePattern, verdict: Verdict) -> Self {
        Self {
            name: name.into(),
            pattern,
            verdict,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionPolicy {
    pub name: String,
    pub version: u32,
    /// The server name is filled in per target.
    pub hello: ClientHelloSpec,
    pub read_until: ReadUntil,
    pub follow_up: Option<FollowUpRequest>,
    pub rules: Vec<DecisionRule>,
}

impl DecisionPolicy {
    /// TLS_FALLBACK_SCSV in a TLS 1.1 hello must be refused with
    /// inappropriate_fallback by a server that speaks anything newer.
    pub fn fallback_scsv() -> Self {
        let mut suites = ciphers::suite_ids_for(ProtocolVersion::Tls11);
        suites.push(TLS_FALLBACK_SCSV);
        Self {
            name: "fallback_scsv".into(),
            version: 1,
            hello: ClientHelloSpec::new(ProtocolVersion::Tls11).with_ciphers(suites),
            read_until: ReadUntil::ServerHello,
            follow_up: None,
            rules: vec![
                DecisionRule::new(
                    "inappropriate_fallback alert",
                    ResponsePattern::Alert {
                        description: Some(Alert::INAPPROPRIATE_FALLBACK),
                    },
                    Verdict::NotVulnerable,
                ),
                DecisionRule::new(
                    "downgraded hello accepted",
                    ResponsePattern::ServerHello,
                    Verdict::Vulnerable,
                ),
            ],
        }
    }

    /// CVE-2014-0160: a heartbeat request that over-claims its payload is
    /// answered with server memory.
    /// Version 2: a heartbeat that draws no reply before the read timeout is
    /// undecided, since a slow server and a patched one look the same.
    pub fn heartbleed() -> Self {
        Self {
            name: "heartbleed".into(),
            version: 2,
            hello: ClientHelloSpec::new(ProtocolVersion::Tls12)
                .with_ciphers(ciphers::suite_ids_for(ProtocolVersion::Tls12))
                .with_extension(EXT_HEARTBEAT, &[0x01]),
            read_until: ReadUntil::HelloDone,
            follow_up: Some(FollowUpRequest::Heartbeat {
                claimed_len: 0x4000,
            }),
            rules: vec![
                DecisionRule::new(
                    "heartbeat not negotiated",
                    ResponsePattern::MissingExtension(EXT_HEARTBEAT),
                    Verdict::NotVulnerable,
                ),
                DecisionRule::new(
                    "heartbeat response leaked",
                    ResponsePattern::FollowUp(FollowUpPattern::Record {
                        content_type: CONTENT_HEARTBEAT,
                    }),
                    Verdict::Vulnerable,
                ),
                DecisionRule::new(
                    "heartbeat answered with alert",
                    ResponsePattern::FollowUp(FollowUpPattern::Alert),
                    Verdict::NotVulnerable,
                ),
                DecisionRule::new(
                    "connection closed on heartbeat",
                    ResponsePattern::FollowUp(FollowUpPattern::Closed),
                    Verdict::NotVulnerable,
                ),
            ],
        }
    }

    /// CRIME: the server agrees to TLS-level DEFLATE.
    pub fn compression() -> Self {
        Self {
            name: "compression".into(),
            version: 1,
            hello: ClientHelloSpec::new(ProtocolVersion::Tls12)
                .with_ciphers(ciphers::suite_ids_for(ProtocolVersion::Tls12))
                .with_compression(&[1, 0]),
            read_until: ReadUntil::ServerHello,
            follow_up: None,
            rules: vec![
                DecisionRule::new(
                    "compression selected",
                    ResponsePattern::CompressionSelected,
                    Verdict::Vulnerable,
                ),
                DecisionRule::new(
                    "null compression selected",
                    ResponsePattern::ServerHello,
                    Verdict::NotVulnerable,
                ),
            ],
        }
    }

    pub fn builtin() -> Vec<DecisionPolicy> {
        vec![Self::fallback_scsv(), Self::heartbleed(), Self::compression()]
    }

    fn verdict(&self, rule: &DecisionRule) -> ProbeOutcome {
        ProbeOutcome::Success(ProbePayload::Vulnerability(VulnerabilityFinding {
            policy: self.name.clone(),
            policy_version: self.version,
            verdict: rule.verdict,
            matched: rule.name.clone(),
        }))
    }
}

pub struct VulnerabilityProbe {
    spec: ProbeSpec,
    policy: DecisionPolicy,
}

impl VulnerabilityProbe {
    pub fn new(policy: DecisionPolicy) -> Self {
        Self {
            spec: ProbeSpec::new(
                format!("vuln/{}", policy.name),
                ProbeCategory::Vulnerability,
                Requirement::ServerHello,
            ),
            policy,
        }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }
}

fn undecided(what: &str) -> ProbeOutcome {
    ProbeOutcome::Inconclusive(InconclusiveReason::Undecided(format!(
        "no rule matched {what}"
    )))
}

#[async_trait]
impl Probe for VulnerabilityProbe {
    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    #[instrument(level = "debug", skip_all, fields(probe = %self.spec.id))]
    async fn run(&self, mut conn: Connection, ctx: &ProbeContext) -> ProbeOutcome {
        let policy = &self.policy;
        let hello = policy
            .hello
            .clone()
            .with_server_name(Some(ctx.target.tls_name()));
        let attempt = ctx
            .adapter
            .exchange(&mut conn, &hello, policy.read_until, &ctx.cancel)
            .await;

        if let Some(rule) = policy
            .rules
            .iter()
            .find(|r| r.pattern.matches_handshake(&attempt.response))
        {
            debug!(rule = %rule.name, "handshake matched");
            return policy.verdict(rule);
        }

        let accepted = match settle(attempt.response) {
            Ok(flight) => flight,
            Err(outcome @ ProbeOutcome::Rejected(RejectReason::Malformed(_))) => return outcome,
            Err(ProbeOutcome::Rejected(_)) => return undecided("the refusal"),
            Err(outcome) => return outcome,
        };

        let Some(request) = policy.follow_up else {
            return undecided("the accepted handshake");
        };
        let version = accepted
            .server_hello
            .as_ref()
            .and_then(|h| h.negotiated_version())
            .unwrap_or(hello.version);
        let encoded = match request {
            FollowUpRequest::Heartbeat { claimed_len } => {
                encode_heartbeat_request(version, claimed_len)
            }
        };
        let record = match encoded {
            Ok(record) => record,
            Err(err) => {
                return ProbeOutcome::Inconclusive(InconclusiveReason::Internal(err.to_string()))
            }
        };
        let reply = ctx.adapter.follow_up(&mut conn, &record, &ctx.cancel).await;
        match policy
            .rules
            .iter()
            .find(|r| r.pattern.matches_follow_up(&reply))
        {
            Some(rule) => {
                debug!(rule = %rule.name, ?reply, "follow-up matched");
                policy.verdict(rule)
            }
            None => match reply {
                FollowUp::Cancelled => ProbeOutcome::Inconclusive(InconclusiveReason::Cancelled),
                FollowUp::Io(detail) => ProbeOutcome::ConnectionError(
                    crate::error::ConnectError::Network(detail),
                ),
                _ => undecided("the follow-up reply"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Target;
    use crate::probe::testing::{context, replying};
    use crate::tls::codec::encode_record;
    use crate::tls::codec::testing::{alert_record, hello_done_record, server_hello_record};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn verdict(outcome: ProbeOutcome) -> (Verdict, String) {
        match outcome {
            ProbeOutcome::Success(ProbePayload::Vulnerability(found)) => {
                (found.verdict, found.matched)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    fn ctx() -> ProbeContext {
        context(Target::new("example.com", 443))
    }

    #[tokio::test]
    async fn inappropriate_fallback_is_not_vulnerable() {
        let probe = VulnerabilityProbe::new(DecisionPolicy::fallback_scsv());
        let conn = replying(vec![alert_record(Alert::INAPPROPRIATE_FALLBACK)]);
        let (verdict, _) = verdict(probe.run(conn, &ctx()).await);
        assert_eq!(verdict, Verdict::NotVulnerable);
    }

    #[tokio::test]
    async fn accepted_fallback_is_vulnerable() {
        let probe = VulnerabilityProbe::new(DecisionPolicy::fallback_scsv());
        let conn = replying(vec![server_hello_record(0x0302, 0x002f, &[])]);
        let (verdict, matched) = verdict(probe.run(conn, &ctx()).await);
        assert_eq!(verdict, Verdict::Vulnerable);
        assert_eq!(matched, "downgraded hello accepted");
    }

    #[tokio::test]
    async fn unmatched_alert_is_undecided() {
        let probe = VulnerabilityProbe::new(DecisionPolicy::fallback_scsv());
        let conn = replying(vec![alert_record(Alert::HANDSHAKE_FAILURE)]);
        assert!(matches!(
            probe.run(conn, &ctx()).await,
            ProbeOutcome::Inconclusive(InconclusiveReason::Undecided(_))
        ));
    }

    #[tokio::test]
    async fn heartbeat_echo_is_vulnerable() {
        let probe = VulnerabilityProbe::new(DecisionPolicy::heartbleed());
        let mut flight = server_hello_record(0x0303, 0xc02f, &[(EXT_HEARTBEAT, vec![0x01])]);
        flight.extend(hello_done_record());
        let leak = encode_record(CONTENT_HEARTBEAT, 0x0303, &[0x02; 64]).unwrap();
        let conn = replying(vec![flight, leak]);

        let (verdict, _) = verdict(probe.run(conn, &ctx()).await);
        assert_eq!(verdict, Verdict::Vulnerable);
    }

    #[tokio::test]
    async fn missing_heartbeat_extension_is_not_vulnerable() {
        let probe = VulnerabilityProbe::new(DecisionPolicy::heartbleed());
        let mut flight = server_hello_record(0x0303, 0xc02f, &[]);
        flight.extend(hello_done_record());
        let conn = replying(vec![flight]);

        let (verdict, matched) = verdict(probe.run(conn, &ctx()).await);
        assert_eq!(verdict, Verdict::NotVulnerable);
        assert_eq!(matched, "heartbeat not negotiated");
    }

    #[tokio::test]
    async fn alert_after_heartbeat_is_not_vulnerable() {
        let probe = VulnerabilityProbe::new(DecisionPolicy::heartbleed());
        let mut flight = server_hello_record(0x0303, 0xc02f, &[(EXT_HEARTBEAT, vec![0x01])]);
        flight.extend(hello_done_record());
        let conn = replying(vec![flight, alert_record(10)]);

        let (verdict, _) = verdict(probe.run(conn, &ctx()).await);
        assert_eq!(verdict, Verdict::NotVulnerable);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_heartbeat_is_undecided() {
        let (client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 16 * 1024];
            let _ = server.read(&mut buf).await;
            let mut flight = server_hello_record(0x0303, 0xc02f, &[(EXT_HEARTBEAT, vec![0x01])]);
            flight.extend(hello_done_record());
            let _ = server.write_all(&flight).await;
            let _ = server.read(&mut buf).await;
            std::future::pending::<()>().await;
        });
        let probe = VulnerabilityProbe::new(DecisionPolicy::heartbleed());

        assert!(matches!(
            probe.run(Connection::new(client, None), &ctx()).await,
            ProbeOutcome::Inconclusive(InconclusiveReason::Undecided(_))
        ));
    }

    #[tokio::test]
    async fn null_compression_is_not_vulnerable() {
        let probe = VulnerabilityProbe::new(DecisionPolicy::compression());
        let conn = replying(vec![server_hello_record(0x0303, 0xc02f, &[])]);
        let (verdict, _) = verdict(probe.run(conn, &ctx()).await);
        assert_eq!(verdict, Verdict::NotVulnerable);
    }

    #[test]
    fn builtin_policies_are_versioned() {
        for policy in DecisionPolicy::builtin() {
            let expected = if policy.name == "heartbleed" { 2 } else { 1 };
            assert_eq!(policy.version, expected, "{}", policy.name);
            assert!(!policy.rules.is_empty());
        }
    }
}

use super::{settle, Probe, ProbeContext, ProbeSpec, Requirement};
use crate::error::ProtocolError;
use crate::model::{AcceptedSuite, ProbeCategory, ProbeOutcome, ProbePayload, RejectReason};
use crate::net::Connection;
use crate::tls::ciphers::{self, CipherSuite, Ssl2Cipher};
use crate::tls::{ClientHelloSpec, ProtocolVersion, ReadUntil};
use async_trait::async_trait;
use tracing::{debug, instrument};

/// Offers exactly one cipher suite at one protocol version.
pub struct CipherProbe {
    spec: ProbeSpec,
    version: ProtocolVersion,
    cipher: u32,
    name: &'static str,
}

impl CipherProbe {
    pub fn new(version: ProtocolVersion, suite: &'static CipherSuite) -> Self {
        Self::build(version, suite.id as u32, suite.name)
    }

    pub fn ssl2(cipher: &'static Ssl2Cipher) -> Self {
        Self::build(ProtocolVersion::Ssl2, cipher.id, cipher.name)
    }

    fn build(version: ProtocolVersion, cipher: u32, name: &'static str) -> Self {
        Self {
            spec: ProbeSpec::new(
                format!("cipher/{}/{}", version.label(), name),
                ProbeCategory::Capability,
                Requirement::ServerHello,
            ),
            version,
            cipher,
            name,
        }
    }

    /// One probe for every (version, suite) pair in the catalog.
    pub fn catalog() -> Vec<CipherProbe> {
        let mut probes: Vec<CipherProbe> =
            ciphers::SSL2_CIPHERS.iter().map(CipherProbe::ssl2).collect();
        for version in ProtocolVersion::ALL {
            probes.extend(ciphers::suites_for(version).map(|s| CipherProbe::new(version, s)));
        }
        probes
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    fn hello(&self, server_name: &str) -> ClientHelloSpec {
        let hello = ClientHelloSpec::new(self.version).with_server_name(Some(server_name));
        if self.version == ProtocolVersion::Ssl2 {
            hello.with_ssl2_ciphers([self.cipher])
        } else {
            // Catalog ids outside SSLv2 always fit in two bytes.
            hello.with_ciphers(u16::try_from(self.cipher).ok())
        }
    }
}

#[async_trait]
impl Probe for CipherProbe {
    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    #[instrument(level = "debug", skip_all, fields(probe = %self.spec.id))]
    async fn run(&self, mut conn: Connection, ctx: &ProbeContext) -> ProbeOutcome {
        let hello = self.hello(ctx.target.tls_name());
        let attempt = ctx
            .adapter
            .exchange(&mut conn, &hello, ReadUntil::ServerHello, &ctx.cancel)
            .await;
        let flight = match settle(attempt.response) {
            Ok(flight) => flight,
            Err(outcome) => return outcome,
        };
        let Some(server_hello) = flight.server_hello else {
            return ProbeOutcome::Rejected(RejectReason::Malformed(
                ProtocolError::Truncated("ServerHello").to_string(),
            ));
        };

        if server_hello.version != self.version.wire() {
            debug!(negotiated = server_hello.version, "server picked another version");
            return ProbeOutcome::Rejected(RejectReason::VersionMismatch {
                offered: self.version.wire(),
                negotiated: server_hello.version,
            });
        }
        if !hello.offers(server_hello.cipher_suite) {
            return ProbeOutcome::Rejected(RejectReason::Malformed(
                ProtocolError::UnofferedCipher(server_hello.cipher_suite).to_string(),
            ));
        }

        ProbeOutcome::Success(ProbePayload::CipherAccepted(AcceptedSuite {
            version: self.version,
            cipher_id: self.cipher,
            cipher: self.name.to_string(),
            hello_retry: server_hello.hello_retry_request,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Target;
    use crate::probe::testing::{context, replying};
    use crate::tls::codec::testing::{alert_record, server_hello_record};
    use crate::tls::Alert;

    fn suite(name: &str) -> &'static CipherSuite {
        ciphers::by_name(name).unwrap()
    }

    #[test]
    fn ids_name_version_and_suite() {
        let probe = CipherProbe::new(ProtocolVersion::Tls12, suite("TLS_RSA_WITH_RC4_128_SHA"));
        assert_eq!(probe.spec().id.as_str(), "cipher/tls1_2/TLS_RSA_WITH_RC4_128_SHA");
        assert_eq!(probe.spec().category, ProbeCategory::Capability);
    }

    #[test]
    fn catalog_has_unique_ids() {
        let probes = CipherProbe::catalog();
        let mut ids: Vec<_> = probes.iter().map(|p| p.spec().id.clone()).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert!(probes.iter().any(|p| p.version() == ProtocolVersion::Ssl2));
    }

    #[tokio::test]
    async fn accepted_suite_is_reported() {
        let rc4 = suite("TLS_RSA_WITH_RC4_128_SHA");
        let probe = CipherProbe::new(ProtocolVersion::Tls12, rc4);
        let conn = replying(vec![server_hello_record(0x0303, rc4.id, &[])]);
        let ctx = context(Target::new("example.com", 443));

        match probe.run(conn, &ctx).await {
            ProbeOutcome::Success(ProbePayload::CipherAccepted(accepted)) => {
                assert_eq!(accepted.version, ProtocolVersion::Tls12);
                assert_eq!(accepted.cipher, rc4.name);
                assert!(!accepted.hello_retry);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn handshake_failure_alert_is_a_rejection() {
        let probe = CipherProbe::new(ProtocolVersion::Tls10, suite("TLS_RSA_WITH_RC4_128_SHA"));
        let conn = replying(vec![alert_record(Alert::HANDSHAKE_FAILURE)]);
        let ctx = context(Target::new("example.com", 443));

        assert_eq!(
            probe.run(conn, &ctx).await,
            ProbeOutcome::Rejected(RejectReason::Alert(Alert {
                level: 2,
                description: Alert::HANDSHAKE_FAILURE,
            }))
        );
    }

    #[tokio::test]
    async fn downgraded_version_is_a_mismatch() {
        let rc4 = suite("TLS_RSA_WITH_RC4_128_SHA");
        let probe = CipherProbe::new(ProtocolVersion::Tls12, rc4);
        let conn = replying(vec![server_hello_record(0x0301, rc4.id, &[])]);
        let ctx = context(Target::new("example.com", 443));

        assert_eq!(
            probe.run(conn, &ctx).await,
            ProbeOutcome::Rejected(RejectReason::VersionMismatch {
                offered: 0x0303,
                negotiated: 0x0301,
            })
        );
    }

    #[tokio::test]
    async fn unoffered_cipher_is_malformed() {
        let probe = CipherProbe::new(ProtocolVersion::Tls12, suite("TLS_RSA_WITH_RC4_128_SHA"));
        let conn = replying(vec![server_hello_record(0x0303, 0x002f, &[])]);
        let ctx = context(Target::new("example.com", 443));

        assert!(matches!(
            probe.run(conn, &ctx).await,
            ProbeOutcome::Rejected(RejectReason::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn cancellation_is_inconclusive() {
        let probe = CipherProbe::new(ProtocolVersion::Tls12, suite("TLS_RSA_WITH_RC4_128_SHA"));
        let conn = replying(Vec::new());
        let ctx = context(Target::new("example.com", 443));
        ctx.cancel.cancel();

        assert!(matches!(
            probe.run(conn, &ctx).await,
            ProbeOutcome::Inconclusive(crate::model::InconclusiveReason::Cancelled)
        ));
    }
}

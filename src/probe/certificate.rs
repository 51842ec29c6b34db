use super::{Probe, ProbeContext, ProbeSpec, Requirement};
use crate::certificate::{CertificateChain, CertificateFindings};
use crate::error::ConnectError;
use crate::model::{InconclusiveReason, ProbeCategory, ProbeOutcome, ProbePayload, RejectReason};
use crate::net::Connection;
use crate::tls::full::{self, FullHandshakeError};
use async_trait::async_trait;
use tracing::{debug, instrument};

/// Completes a real handshake, collects the presented chain and validates
/// it against every configured trust store.
pub struct CertificateProbe {
    spec: ProbeSpec,
}

impl CertificateProbe {
    pub fn new() -> Self {
        Self {
            spec: ProbeSpec::new(
                "cert/chain",
                ProbeCategory::Certificate,
                Requirement::FullHandshake,
            ),
        }
    }
}

impl Default for CertificateProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for CertificateProbe {
    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    #[instrument(level = "debug", skip_all, fields(probe = %self.spec.id))]
    async fn run(&self, conn: Connection, ctx: &ProbeContext) -> ProbeOutcome {
        let target = &ctx.target;
        let handshake = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return ProbeOutcome::Inconclusive(InconclusiveReason::Cancelled);
            }
            result = full::handshake(conn, target.tls_name(), target.client_auth.as_ref()) => result,
        };

        let handshake = match handshake {
            Ok(handshake) => handshake,
            Err(FullHandshakeError::ClientCertificateRequired) => {
                return ProbeOutcome::Rejected(RejectReason::ClientCertificateRequired);
            }
            Err(FullHandshakeError::Rejected(reason)) => {
                return ProbeOutcome::Rejected(RejectReason::HandshakeFailed(reason));
            }
            Err(FullHandshakeError::Closed) => {
                return ProbeOutcome::Rejected(RejectReason::ConnectionClosed);
            }
            Err(FullHandshakeError::Io(err)) => {
                return ProbeOutcome::ConnectionError(ConnectError::from_io(&err));
            }
            Err(FullHandshakeError::Setup(err)) => {
                return ProbeOutcome::Inconclusive(InconclusiveReason::Internal(err.to_string()));
            }
        };

        let chain = match CertificateChain::from_der_list(&handshake.chain) {
            Ok(chain) => chain,
            Err(err) => return ProbeOutcome::Rejected(RejectReason::Malformed(err.to_string())),
        };
        // Path building is CPU bound and may be slow on hostile chains.
        let validator = ctx.validator.clone();
        let stores = ctx.trust_stores.clone();
        let hostname = target.tls_name().to_string();
        let task = tokio::task::spawn_blocking(move || {
            let validation = validator.validate(&chain, &hostname, &stores);
            (chain, validation)
        });
        let (chain, validation) = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                return ProbeOutcome::Inconclusive(InconclusiveReason::Cancelled);
            }
            joined = task => match joined {
                Ok(done) => done,
                Err(err) => {
                    return ProbeOutcome::Inconclusive(InconclusiveReason::Internal(err.to_string()));
                }
            },
        };
        debug!(certificates = chain.len(), stores = validation.len(), "chain collected");

        ProbeOutcome::Success(ProbePayload::Certificate(Box::new(CertificateFindings {
            facts: chain.facts(),
            chain,
            validation,
            negotiated_version: handshake.version,
            negotiated_cipher: handshake.cipher,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::testing::{issue, issue_with_key, key, Issued, Profile};
    use crate::certificate::validate::PathError;
    use crate::certificate::TrustStore;
    use crate::model::Target;
    use crate::probe::testing::context;
    use openssl::ssl::{Ssl, SslAcceptor, SslMethod, SslVerifyMode, SslVersion};
    use std::pin::Pin;
    use std::sync::Arc;
    use tokio::io::duplex;
    use tokio_openssl::SslStream;

    /// `client_cert_at` pins the server to one version and makes it demand a
    /// client certificate.
    fn serve(
        leaf: &Issued,
        intermediates: &[&Issued],
        client_cert_at: Option<SslVersion>,
    ) -> Connection {
        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls()).unwrap();
        builder.set_private_key(&leaf.key).unwrap();
        builder.set_certificate(&leaf.cert).unwrap();
        for extra in intermediates {
            builder.add_extra_chain_cert(extra.cert.clone()).unwrap();
        }
        if let Some(version) = client_cert_at {
            builder.set_max_proto_version(Some(version)).unwrap();
            builder.set_min_proto_version(Some(version)).unwrap();
            builder.set_verify_callback(
                SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
                |_, _| true,
            );
        }
        let acceptor = builder.build();

        let (client, server) = duplex(64 * 1024);
        tokio::spawn(async move {
            let ssl = Ssl::new(acceptor.context()).unwrap();
            let mut stream = SslStream::new(ssl, server).unwrap();
            if Pin::new(&mut stream).accept().await.is_ok() {
                let mut buf = [0u8; 64];
                let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
            }
        });
        Connection::new(client, None)
    }

    #[tokio::test]
    async fn collects_and_validates_chain() {
        let root = issue(&Profile::ca("Test Root"), None);
        let leaf = issue(&Profile::leaf("example.com", &["example.com"]), Some(&root));
        let conn = serve(&leaf, &[], None);

        let mut ctx = context(Target::new("example.com", 443));
        ctx.trust_stores = Arc::new(vec![TrustStore::from_pem("lab", &root.pem()).unwrap()]);

        let findings = match CertificateProbe::new().run(conn, &ctx).await {
            ProbeOutcome::Success(ProbePayload::Certificate(findings)) => findings,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(findings.chain.len(), 1);
        assert_eq!(findings.facts.leaf_sha256.as_ref().map(String::len), Some(64));
        assert!(findings.validation["lab"].trusted);
        assert!(findings.validation["lab"].hostname_match);
        assert!(findings.negotiated_version.is_some());
    }

    #[tokio::test]
    async fn missing_client_certificate_is_reported() {
        let root = issue(&Profile::ca("Test Root"), None);
        let leaf = issue(&Profile::leaf("example.com", &["example.com"]), Some(&root));
        let conn = serve(&leaf, &[], Some(SslVersion::TLS1_3));
        let ctx = context(Target::new("example.com", 443));

        assert_eq!(
            CertificateProbe::new().run(conn, &ctx).await,
            ProbeOutcome::Rejected(RejectReason::ClientCertificateRequired)
        );
    }

    #[tokio::test]
    async fn missing_client_certificate_is_reported_on_tls12() {
        let root = issue(&Profile::ca("Test Root"), None);
        let leaf = issue(&Profile::leaf("example.com", &["example.com"]), Some(&root));
        let conn = serve(&leaf, &[], Some(SslVersion::TLS1_2));
        let ctx = context(Target::new("example.com", 443));

        assert_eq!(
            CertificateProbe::new().run(conn, &ctx).await,
            ProbeOutcome::Rejected(RejectReason::ClientCertificateRequired)
        );
    }

    #[tokio::test]
    async fn oversized_path_search_stays_bounded() {
        // Twelve self-issued CA certificates sharing one key and one name:
        // every one of them verifies every other.
        let shared = key();
        let loop_certs: Vec<Issued> = (0..12)
            .map(|_| issue_with_key(&Profile::ca("loop"), None, shared.clone()))
            .collect();
        let extra: Vec<&Issued> = loop_certs[1..].iter().collect();
        let conn = serve(&loop_certs[0], &extra, None);

        let unrelated = issue(&Profile::ca("Unrelated Root"), None);
        let mut ctx = context(Target::new("loop", 443));
        ctx.trust_stores = Arc::new(vec![TrustStore::from_pem("lab", &unrelated.pem()).unwrap()]);

        let findings = match CertificateProbe::new().run(conn, &ctx).await {
            ProbeOutcome::Success(ProbePayload::Certificate(findings)) => findings,
            other => panic!("unexpected outcome {other:?}"),
        };
        let lab = &findings.validation["lab"];
        assert!(!lab.trusted);
        assert!(matches!(
            lab.path_error,
            Some(PathError::BudgetExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_before_handshake() {
        let root = issue(&Profile::ca("Test Root"), None);
        let conn = serve(&root, &[], None);
        let ctx = context(Target::new("example.com", 443));
        ctx.cancel.cancel();

        assert_eq!(
            CertificateProbe::new().run(conn, &ctx).await,
            ProbeOutcome::Inconclusive(InconclusiveReason::Cancelled)
        );
    }
}

use super::{settle, Probe, ProbeContext, ProbeSpec, Requirement};
use crate::model::{
    ExtensionFinding, InconclusiveReason, ProbeCategory, ProbeOutcome, ProbePayload, RejectReason,
};
use crate::net::Connection;
use crate::tls::ciphers;
use crate::tls::{
    ClientHelloSpec, ProtocolVersion, ReadUntil, ServerHello, EXT_ENCRYPT_THEN_MAC,
    EXT_EXTENDED_MASTER_SECRET, EXT_RENEGOTIATION_INFO, EXT_SERVER_NAME, EXT_SESSION_TICKET,
    EXT_STATUS_REQUEST, GROUP_SECP256R1, GROUP_SECP384R1, GROUP_SECP521R1, GROUP_X25519,
    GROUP_X448,
};
use async_trait::async_trait;
use std::net::IpAddr;
use tracing::instrument;

const ALPN_OFFER: &[&str] = &["h2", "http/1.1"];

/// status_request with an OCSP type, no responder ids and no extensions.
const OCSP_REQUEST: &[u8] = &[0x01, 0x00, 0x00, 0x00, 0x00];

pub const NAMED_GROUPS: &[(u16, &str)] = &[
    (GROUP_X25519, "x25519"),
    (GROUP_SECP256R1, "secp256r1"),
    (GROUP_SECP384R1, "secp384r1"),
    (GROUP_SECP521R1, "secp521r1"),
    (GROUP_X448, "x448"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionKind {
    Alpn,
    Sni,
    SecureRenegotiation,
    ExtendedMasterSecret,
    SessionTicket,
    EncryptThenMac,
    OcspStapling,
    Compression,
    Group(u16, &'static str),
}

impl ExtensionKind {
    pub const FIXED: [ExtensionKind; 8] = [
        ExtensionKind::Alpn,
        ExtensionKind::Sni,
        ExtensionKind::SecureRenegotiation,
        ExtensionKind::ExtendedMasterSecret,
        ExtensionKind::SessionTicket,
        ExtensionKind::EncryptThenMac,
        ExtensionKind::OcspStapling,
        ExtensionKind::Compression,
    ];

    pub fn name(self) -> String {
        match self {
            ExtensionKind::Alpn => "alpn".into(),
            ExtensionKind::Sni => "sni".into(),
            ExtensionKind::SecureRenegotiation => "secure_renegotiation".into(),
            ExtensionKind::ExtendedMasterSecret => "extended_master_secret".into(),
            ExtensionKind::SessionTicket => "session_ticket".into(),
            ExtensionKind::EncryptThenMac => "encrypt_then_mac".into(),
            ExtensionKind::OcspStapling => "ocsp_stapling".into(),
            ExtensionKind::Compression => "compression".into(),
            ExtensionKind::Group(_, name) => format!("group/{name}"),
        }
    }
}

/// Checks whether the server honours one extension or named group in an
/// otherwise ordinary TLS 1.2 hello.
pub struct ExtensionProbe {
    spec: ProbeSpec,
    kind: ExtensionKind,
}

impl ExtensionProbe {
    pub fn new(kind: ExtensionKind) -> Self {
        Self {
            spec: ProbeSpec::new(
                format!("ext/{}", kind.name()),
                ProbeCategory::Extension,
                Requirement::ServerHello,
            ),
            kind,
        }
    }

    pub fn catalog() -> Vec<ExtensionProbe> {
        ExtensionKind::FIXED
            .into_iter()
            .chain(NAMED_GROUPS.iter().map(|(id, name)| ExtensionKind::Group(*id, name)))
            .map(ExtensionProbe::new)
            .collect()
    }

    fn hello(&self, server_name: &str) -> ClientHelloSpec {
        let base = ClientHelloSpec::new(ProtocolVersion::Tls12).with_server_name(Some(server_name));
        match self.kind {
            ExtensionKind::Group(group, _) => base
                .with_ciphers(
                    ciphers::suites_for(ProtocolVersion::Tls12)
                        .filter(|s| s.is_ecdhe())
                        .map(|s| s.id),
                )
                .with_groups(&[group]),
            kind => {
                let base = base.with_ciphers(ciphers::suite_ids_for(ProtocolVersion::Tls12));
                match kind {
                    ExtensionKind::Alpn => base.with_alpn(ALPN_OFFER),
                    ExtensionKind::SecureRenegotiation => {
                        base.with_extension(EXT_RENEGOTIATION_INFO, &[0x00])
                    }
                    ExtensionKind::ExtendedMasterSecret => {
                        base.with_extension(EXT_EXTENDED_MASTER_SECRET, &[])
                    }
                    ExtensionKind::SessionTicket => base.with_extension(EXT_SESSION_TICKET, &[]),
                    ExtensionKind::EncryptThenMac => base.with_extension(EXT_ENCRYPT_THEN_MAC, &[]),
                    ExtensionKind::OcspStapling => {
                        base.with_extension(EXT_STATUS_REQUEST, OCSP_REQUEST)
                    }
                    ExtensionKind::Compression => base.with_compression(&[1, 0]),
                    ExtensionKind::Sni | ExtensionKind::Group(..) => base,
                }
            }
        }
    }

    fn interpret(&self, hello: &ServerHello) -> ExtensionFinding {
        let echoed = |kind: u16| (hello.has_extension(kind), None);
        let (supported, detail) = match self.kind {
            ExtensionKind::Alpn => {
                let chosen = hello.alpn_protocol();
                (chosen.is_some(), chosen)
            }
            ExtensionKind::Sni => echoed(EXT_SERVER_NAME),
            ExtensionKind::SecureRenegotiation => echoed(EXT_RENEGOTIATION_INFO),
            ExtensionKind::ExtendedMasterSecret => echoed(EXT_EXTENDED_MASTER_SECRET),
            ExtensionKind::SessionTicket => echoed(EXT_SESSION_TICKET),
            ExtensionKind::EncryptThenMac => echoed(EXT_ENCRYPT_THEN_MAC),
            ExtensionKind::OcspStapling => echoed(EXT_STATUS_REQUEST),
            ExtensionKind::Compression => match hello.compression {
                0 => (false, None),
                1 => (true, Some("deflate".to_string())),
                other => (true, Some(format!("method {other}"))),
            },
            ExtensionKind::Group(..) => (true, None),
        };
        ExtensionFinding {
            name: self.kind.name(),
            supported,
            detail,
        }
    }
}

#[async_trait]
impl Probe for ExtensionProbe {
    fn spec(&self) -> &ProbeSpec {
        &self.spec
    }

    #[instrument(level = "debug", skip_all, fields(probe = %self.spec.id))]
    async fn run(&self, mut conn: Connection, ctx: &ProbeContext) -> ProbeOutcome {
        let server_name = ctx.target.tls_name();
        if self.kind == ExtensionKind::Sni && server_name.parse::<IpAddr>().is_ok() {
            return ProbeOutcome::Inconclusive(InconclusiveReason::Undecided(
                "no host name to send as SNI".into(),
            ));
        }

        let hello = self.hello(server_name);
        let attempt = ctx
            .adapter
            .exchange(&mut conn, &hello, ReadUntil::ServerHello, &ctx.cancel)
            .await;
        let flight = match settle(attempt.response) {
            Ok(flight) => flight,
            // A handshake alert to a hello that differs only in the group list
            // means the group is not supported.
            Err(ProbeOutcome::Rejected(RejectReason::Alert(_)))
                if matches!(self.kind, ExtensionKind::Group(..)) =>
            {
                return ProbeOutcome::Success(ProbePayload::Extension(ExtensionFinding {
                    name: self.kind.name(),
                    supported: false,
                    detail: None,
                }));
            }
            Err(outcome) => return outcome,
        };
        match flight.server_hello {
            Some(server_hello) => {
                ProbeOutcome::Success(ProbePayload::Extension(self.interpret(&server_hello)))
            }
            None => ProbeOutcome::Rejected(RejectReason::Malformed(
                "server flight without ServerHello".into(),
            )),
        }
    }
}

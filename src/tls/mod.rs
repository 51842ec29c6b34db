pub mod adapter;
pub mod ciphers;
pub mod codec;
pub mod full;

pub use adapter::{FollowUp, HandshakeAdapter, HandshakeAttempt, HandshakeResponse};
pub use ciphers::{CipherSuite, Ssl2Cipher};
pub use codec::{ClientHelloSpec, ReadUntil, ServerFlight, ServerHello};

use serde::{Deserialize, Serialize};
use std::fmt;

pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const CONTENT_ALERT: u8 = 0x15;
pub const CONTENT_HANDSHAKE: u8 = 0x16;
pub const CONTENT_APPLICATION_DATA: u8 = 0x17;
pub const CONTENT_HEARTBEAT: u8 = 0x18;

pub const HS_HELLO_REQUEST: u8 = 0x00;
pub const HS_CLIENT_HELLO: u8 = 0x01;
pub const HS_SERVER_HELLO: u8 = 0x02;
pub const HS_CERTIFICATE: u8 = 0x0b;
pub const HS_SERVER_KEY_EXCHANGE: u8 = 0x0c;
pub const HS_CERTIFICATE_REQUEST: u8 = 0x0d;
pub const HS_SERVER_HELLO_DONE: u8 = 0x0e;
pub const HS_CERTIFICATE_STATUS: u8 = 0x16;

pub const EXT_SERVER_NAME: u16 = 0x0000;
pub const EXT_STATUS_REQUEST: u16 = 0x0005;
pub const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
pub const EXT_EC_POINT_FORMATS: u16 = 0x000b;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
pub const EXT_HEARTBEAT: u16 = 0x000f;
pub const EXT_ALPN: u16 = 0x0010;
pub const EXT_ENCRYPT_THEN_MAC: u16 = 0x0016;
pub const EXT_EXTENDED_MASTER_SECRET: u16 = 0x0017;
pub const EXT_SESSION_TICKET: u16 = 0x0023;
pub const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;
pub const EXT_KEY_SHARE: u16 = 0x0033;
pub const EXT_RENEGOTIATION_INFO: u16 = 0xff01;

pub const GROUP_SECP256R1: u16 = 0x0017;
pub const GROUP_SECP384R1: u16 = 0x0018;
pub const GROUP_SECP521R1: u16 = 0x0019;
pub const GROUP_X25519: u16 = 0x001d;
pub const GROUP_X448: u16 = 0x001e;

/// Largest record fragment a conforming peer may send (2^14 plus expansion).
pub const MAX_RECORD_LEN: usize = 16384 + 2048;

/// Protocol versions the engine can speak, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "SSL2.0")]
    Ssl2,
    #[serde(rename = "SSL3.0")]
    Ssl3,
    #[serde(rename = "TLS1.0")]
    Tls10,
    #[serde(rename = "TLS1.1")]
    Tls11,
    #[serde(rename = "TLS1.2")]
    Tls12,
    #[serde(rename = "TLS1.3")]
    Tls13,
}

impl ProtocolVersion {
    pub const ALL: [ProtocolVersion; 6] = [
        ProtocolVersion::Ssl2,
        ProtocolVersion::Ssl3,
        ProtocolVersion::Tls10,
        ProtocolVersion::Tls11,
        ProtocolVersion::Tls12,
        ProtocolVersion::Tls13,
    ];

    pub fn wire(self) -> u16 {
        match self {
            ProtocolVersion::Ssl2 => 0x0002,
            ProtocolVersion::Ssl3 => 0x0300,
            ProtocolVersion::Tls10 => 0x0301,
            ProtocolVersion::Tls11 => 0x0302,
            ProtocolVersion::Tls12 => 0x0303,
            ProtocolVersion::Tls13 => 0x0304,
        }
    }

    pub fn from_wire(value: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.wire() == value)
    }

    /// Short identifier used in probe names.
    pub fn label(self) -> &'static str {
        match self {
            ProtocolVersion::Ssl2 => "ssl2_0",
            ProtocolVersion::Ssl3 => "ssl3_0",
            ProtocolVersion::Tls10 => "tls1_0",
            ProtocolVersion::Tls11 => "tls1_1",
            ProtocolVersion::Tls12 => "tls1_2",
            ProtocolVersion::Tls13 => "tls1_3",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.label() == label)
    }

    /// Parse the `version_str()` form OpenSSL reports for a session.
    pub fn from_openssl(name: &str) -> Option<Self> {
        match name {
            "SSLv2" => Some(ProtocolVersion::Ssl2),
            "SSLv3" => Some(ProtocolVersion::Ssl3),
            "TLSv1" => Some(ProtocolVersion::Tls10),
            "TLSv1.1" => Some(ProtocolVersion::Tls11),
            "TLSv1.2" => Some(ProtocolVersion::Tls12),
            "TLSv1.3" => Some(ProtocolVersion::Tls13),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProtocolVersion::Ssl2 => "SSL2.0",
            ProtocolVersion::Ssl3 => "SSL3.0",
            ProtocolVersion::Tls10 => "TLS1.0",
            ProtocolVersion::Tls11 => "TLS1.1",
            ProtocolVersion::Tls12 => "TLS1.2",
            ProtocolVersion::Tls13 => "TLS1.3",
        };
        write!(f, "{}", label)
    }
}

/// A TLS alert as received on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub level: u8,
    pub description: u8,
}

impl Alert {
    pub const HANDSHAKE_FAILURE: u8 = 40;
    pub const PROTOCOL_VERSION: u8 = 70;
    pub const INSUFFICIENT_SECURITY: u8 = 71;
    pub const INAPPROPRIATE_FALLBACK: u8 = 86;
    pub const CERTIFICATE_REQUIRED: u8 = 116;

    pub fn is_fatal(&self) -> bool {
        self.level == 2
    }

    pub fn name(&self) -> &'static str {
        match self.description {
            0 => "close_notify",
            10 => "unexpected_message",
            20 => "bad_record_mac",
            22 => "record_overflow",
            40 => "handshake_failure",
            42 => "bad_certificate",
            47 => "illegal_parameter",
            50 => "decode_error",
            51 => "decrypt_error",
            70 => "protocol_version",
            71 => "insufficient_security",
            80 => "internal_error",
            86 => "inappropriate_fallback",
            90 => "user_canceled",
            100 => "no_renegotiation",
            109 => "missing_extension",
            110 => "unsupported_extension",
            112 => "unrecognized_name",
            116 => "certificate_required",
            120 => "no_application_protocol",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_round_trip_through_labels() {
        for version in ProtocolVersion::ALL {
            assert_eq!(ProtocolVersion::from_label(version.label()), Some(version));
            assert_eq!(ProtocolVersion::from_wire(version.wire()), Some(version));
        }
        assert_eq!(ProtocolVersion::from_openssl("TLSv1"), Some(ProtocolVersion::Tls10));
        assert!(ProtocolVersion::Tls10 < ProtocolVersion::Tls13);
    }

    #[test]
    fn alert_names() {
        let alert = Alert {
            level: 2,
            description: 40,
        };
        assert!(alert.is_fatal());
        assert_eq!(alert.to_string(), "handshake_failure (40)");
    }
}

use super::{read_failed, reader, rejected, send, StartTls};
use crate::error::ConnectError;
use crate::model::{StartTlsProtocol, Target};
use crate::net::Connection;
use async_trait::async_trait;
use std::time::Duration;

pub(super) struct LdapStartTls;

/// ExtendedRequest (message id 1) for OID 1.3.6.1.4.1.1466.20037.
const EXTENDED_REQUEST: &[u8] = &[
    0x30, 0x1d, 0x02, 0x01, 0x01, 0x77, 0x18, 0x80, 0x16, b'1', b'.', b'3', b'.', b'6', b'.', b'1',
    b'.', b'4', b'.', b'1', b'.', b'1', b'4', b'6', b'6', b'.', b'2', b'0', b'0', b'3', b'7',
];

#[async_trait]
impl StartTls for LdapStartTls {
    fn protocol(&self) -> StartTlsProtocol {
        StartTlsProtocol::Ldap
    }

    async fn negotiate(
        &self,
        conn: &mut Connection,
        _target: &Target,
        read_timeout: Duration,
    ) -> Result<(), ConnectError> {
        send(conn, EXTENDED_REQUEST).await?;

        let mut reader = reader(read_timeout);
        let header = reader.read_exact(conn, 2).await.map_err(read_failed)?;
        if header[0] != 0x30 {
            return Err(rejected(format!("unexpected LDAP tag {:#04x}", header[0])));
        }
        let length = if header[1] & 0x80 == 0 {
            header[1] as usize
        } else {
            let octets = (header[1] & 0x7f) as usize;
            if octets == 0 || octets > 4 {
                return Err(rejected("unsupported LDAP length encoding"));
            }
            let bytes = reader.read_exact(conn, octets).await.map_err(read_failed)?;
            bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
        };
        let body = reader.read_exact(conn, length).await.map_err(read_failed)?;

        match result_code(&body) {
            Some(0) => Ok(()),
            Some(code) => Err(rejected(format!("StartTLS extended operation returned {code}"))),
            None => Err(rejected("no resultCode in LDAP response")),
        }
    }
}

/// First ENUMERATED value of the response, which is the LDAPResult code.
fn result_code(body: &[u8]) -> Option<u8> {
    body.windows(3)
        .find(|w| w[0] == 0x0a && w[1] == 0x01)
        .map(|w| w[2])
}

use super::{read_failed, reader, rejected, send, StartTls};
use crate::error::ConnectError;
use crate::model::{StartTlsProtocol, Target};
use crate::net::Connection;
use async_trait::async_trait;
use std::time::Duration;

pub(super) struct PostgresStartTls;

/// Length 8, request code 80877103.
const SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];

#[async_trait]
impl StartTls for PostgresStartTls {
    fn protocol(&self) -> StartTlsProtocol {
        StartTlsProtocol::Postgres
    }

    async fn negotiate(
        &self,
        conn: &mut Connection,
        _target: &Target,
        read_timeout: Duration,
    ) -> Result<(), ConnectError> {
        send(conn, &SSL_REQUEST).await?;
        let answer = reader(read_timeout)
            .read_exact(conn, 1)
            .await
            .map_err(read_failed)?;
        match answer[0] {
            b'S' => Ok(()),
            b'N' => Err(rejected("server does not accept SSL")),
            other => Err(rejected(format!("unexpected SSLRequest answer {other:#04x}"))),
        }
    }
}

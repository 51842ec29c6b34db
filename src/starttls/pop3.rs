use super::{read_failed, reader, rejected, send, StartTls};
use crate::error::ConnectError;
use crate::model::{StartTlsProtocol, Target};
use crate::util::sanitize_text;
use crate::net::Connection;
use async_trait::async_trait;
use std::time::Duration;

pub(super) struct Pop3StartTls;

#[async_trait]
impl StartTls for Pop3StartTls {
    fn protocol(&self) -> StartTlsProtocol {
        StartTlsProtocol::Pop3
    }

    async fn negotiate(
        &self,
        conn: &mut Connection,
        _target: &Target,
        read_timeout: Duration,
    ) -> Result<(), ConnectError> {
        let mut reader = reader(read_timeout);
        let greeting = reader.read_line(conn).await.map_err(read_failed)?;
        if !greeting.starts_with(b"+OK") {
            return Err(rejected(format!(
                "greeting: {}",
                sanitize_text(&greeting).trim_end()
            )));
        }
        send(conn, b"STLS\r\n").await?;
        let reply = reader.read_line(conn).await.map_err(read_failed)?;
        if !reply.starts_with(b"+OK") {
            return Err(rejected(format!(
                "STLS: {}",
                sanitize_text(&reply).trim_end()
            )));
        }
        Ok(())
    }
}

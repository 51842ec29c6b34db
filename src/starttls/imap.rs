use super::{read_failed, reader, rejected, send, StartTls};
use crate::error::ConnectError;
use crate::model::{StartTlsProtocol, Target};
use crate::util::sanitize_text;
use crate::net::Connection;
use async_trait::async_trait;
use std::time::Duration;

pub(super) struct ImapStartTls;

const TAG: &str = ". ";

#[async_trait]
impl StartTls for ImapStartTls {
    fn protocol(&self) -> StartTlsProtocol {
        StartTlsProtocol::Imap
    }

    async fn negotiate(
        &self,
        conn: &mut Connection,
        _target: &Target,
        read_timeout: Duration,
    ) -> Result<(), ConnectError> {
        let mut reader = reader(read_timeout);
        let greeting = reader.read_line(conn).await.map_err(read_failed)?;
        let greeting = sanitize_text(&greeting);
        if !greeting.starts_with("* OK") {
            return Err(rejected(format!("greeting: {}", greeting.trim_end())));
        }

        send(conn, b". STARTTLS\r\n").await?;
        // Untagged lines may precede the tagged completion.
        loop {
            let line = reader.read_line(conn).await.map_err(read_failed)?;
            let line = sanitize_text(&line);
            if let Some(status) = line.strip_prefix(TAG) {
                if status.to_ascii_uppercase().starts_with("OK") {
                    return Ok(());
                }
                return Err(rejected(format!("STARTTLS: {}", line.trim_end())));
            }
        }
    }
}

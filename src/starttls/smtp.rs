use super::{read_coded_reply, reader, rejected, send, StartTls};
use crate::error::ConnectError;
use crate::model::{StartTlsProtocol, Target};
use crate::net::Connection;
use async_trait::async_trait;
use std::time::Duration;

pub(super) struct SmtpStartTls;

#[async_trait]
impl StartTls for SmtpStartTls {
    fn protocol(&self) -> StartTlsProtocol {
        StartTlsProtocol::Smtp
    }

    async fn negotiate(
        &self,
        conn: &mut Connection,
        _target: &Target,
        read_timeout: Duration,
    ) -> Result<(), ConnectError> {
        let mut reader = reader(read_timeout);
        let (code, greeting) = read_coded_reply(&mut reader, conn).await?;
        if code != 220 {
            return Err(rejected(format!("greeting: {}", greeting.trim_end())));
        }

        send(conn, b"EHLO tls-prober\r\n").await?;
        let (code, ehlo) = read_coded_reply(&mut reader, conn).await?;
        if code != 250 {
            return Err(rejected(format!("EHLO: {}", ehlo.trim_end())));
        }
        if !ehlo.to_ascii_uppercase().contains("STARTTLS") {
            return Err(rejected("STARTTLS not advertised"));
        }

        send(conn, b"STARTTLS\r\n").await?;
        let (code, reply) = read_coded_reply(&mut reader, conn).await?;
        if code != 220 {
            return Err(rejected(format!("STARTTLS: {}", reply.trim_end())));
        }
        Ok(())
    }
}

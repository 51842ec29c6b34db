use super::{read_coded_reply, reader, rejected, send, StartTls};
use crate::error::ConnectError;
use crate::model::{StartTlsProtocol, Target};
use crate::net::Connection;
use async_trait::async_trait;
use std::time::Duration;

pub(super) struct FtpStartTls;

#[async_trait]
impl StartTls for FtpStartTls {
    fn protocol(&self) -> StartTlsProtocol {
        StartTlsProtocol::Ftp
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
        send(conn, b"AUTH TLS\r\n").await?;
        let (code, reply) = read_coded_reply(&mut reader, conn).await?;
        if code != 234 {
            return Err(rejected(format!("AUTH TLS: {}", reply.trim_end())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::starttls::testing::scripted;

    #[tokio::test]
    async fn auth_tls_accepted() {
        let mut conn = scripted(
            b"220-Welcome\r\n220 FTP ready\r\n",
            vec![b"234 Proceed with negotiation.\r\n"],
        );
        FtpStartTls
            .negotiate(&mut conn, &Target::new("ftp.example.com", 21), Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn auth_tls_refused() {
        let mut conn = scripted(b"220 FTP ready\r\n", vec![b"500 Unknown command.\r\n"]);
        assert!(FtpStartTls
            .negotiate(&mut conn, &Target::new("ftp.example.com", 21), Duration::from_secs(1))
            .await
            .is_err());
    }
}

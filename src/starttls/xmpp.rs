use super::{read_failed, reader, rejected, send, StartTls};
use crate::error::ConnectError;
use crate::model::{StartTlsProtocol, Target};
use crate::util::sanitize_text;
use crate::net::Connection;
use async_trait::async_trait;
use std::time::Duration;

pub(super) struct XmppStartTls {
    pub(super) server: bool,
}

impl XmppStartTls {
    fn stream_header(&self, domain: &str) -> String {
        let namespace = if self.server {
            "jabber:server"
        } else {
            "jabber:client"
        };
        format!(
            "<stream:stream xmlns='{namespace}' xmlns:stream='http://etherx.jabber.org/streams' \
             xmlns:tls='http://www.ietf.org/rfc/rfc2595.txt' to='{domain}' xml:lang='en' version='1.0'>"
        )
    }
}

#[async_trait]
impl StartTls for XmppStartTls {
    fn protocol(&self) -> StartTlsProtocol {
        if self.server {
            StartTlsProtocol::XmppServer
        } else {
            StartTlsProtocol::Xmpp
        }
    }

    async fn negotiate(
        &self,
        conn: &mut Connection,
        target: &Target,
        read_timeout: Duration,
    ) -> Result<(), ConnectError> {
        send(conn, self.stream_header(target.tls_name()).as_bytes()).await?;

        let mut reader = reader(read_timeout);
        let features = reader
            .read_until(conn, b"</stream:features>")
            .await
            .map_err(read_failed)?;
        if !sanitize_text(&features).contains("starttls") {
            return Err(rejected("starttls not offered in stream features"));
        }

        send(conn, b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>").await?;
        let reply = reader.read_until(conn, b">").await.map_err(read_failed)?;
        let reply = sanitize_text(&reply);
        if reply.contains("<proceed") {
            Ok(())
        } else {
            Err(rejected(format!("starttls: {}", reply.trim())))
        }
    }
}

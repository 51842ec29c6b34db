//! Plaintext upgrade negotiations that run before the ClientHello.

mod ftp;
mod imap;
mod ldap;
mod pop3;
mod postgres;
mod smtp;
mod xmpp;

use crate::error::ConnectError;
use crate::model::{StartTlsProtocol, Target};
use crate::net::reader::{ReadError, ReplyReader};
use crate::util::sanitize_text;
use crate::net::Connection;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use ftp::FtpStartTls;
use imap::ImapStartTls;
use ldap::LdapStartTls;
use pop3::Pop3StartTls;
use postgres::PostgresStartTls;
use smtp::SmtpStartTls;
use xmpp::XmppStartTls;

const MAX_REPLY_BYTES: usize = 16 * 1024;

#[async_trait]
pub trait StartTls: Send + Sync {
    fn protocol(&self) -> StartTlsProtocol;

    /// Drive the plaintext exchange until the server is ready for a
    /// ClientHello.
    async fn negotiate(
        &self,
        conn: &mut Connection,
        target: &Target,
        read_timeout: Duration,
    ) -> Result<(), ConnectError>;
}

static SMTP: SmtpStartTls = SmtpStartTls;
static IMAP: ImapStartTls = ImapStartTls;
static POP3: Pop3StartTls = Pop3StartTls;
static FTP: FtpStartTls = FtpStartTls;
static LDAP: LdapStartTls = LdapStartTls;
static XMPP_CLIENT: XmppStartTls = XmppStartTls { server: false };
static XMPP_SERVER: XmppStartTls = XmppStartTls { server: true };
static POSTGRES: PostgresStartTls = PostgresStartTls;

pub fn negotiator(protocol: StartTlsProtocol) -> &'static dyn StartTls {
    match protocol {
        StartTlsProtocol::Smtp => &SMTP,
        StartTlsProtocol::Imap => &IMAP,
        StartTlsProtocol::Pop3 => &POP3,
        StartTlsProtocol::Ftp => &FTP,
        StartTlsProtocol::Ldap => &LDAP,
        StartTlsProtocol::Xmpp => &XMPP_CLIENT,
        StartTlsProtocol::XmppServer => &XMPP_SERVER,
        StartTlsProtocol::Postgres => &POSTGRES,
    }
}

fn reader(read_timeout: Duration) -> ReplyReader {
    ReplyReader::new(MAX_REPLY_BYTES, read_timeout)
}

fn rejected(detail: impl Into<String>) -> ConnectError {
    ConnectError::StartTlsRejected(detail.into())
}

fn read_failed(err: ReadError) -> ConnectError {
    match err {
        ReadError::Io(io) => ConnectError::from_io(&io),
        other => rejected(other.to_string()),
    }
}

async fn send(conn: &mut Connection, bytes: &[u8]) -> Result<(), ConnectError> {
    conn.write_all(bytes)
        .await
        .map_err(|err| ConnectError::from_io(&err))
}

/// Read a `NNN-...`/`NNN ...` style reply (SMTP, FTP) and return its code
/// with the full text.
async fn read_coded_reply(
    reader: &mut ReplyReader,
    conn: &mut Connection,
) -> Result<(u16, String), ConnectError> {
    let mut text = String::new();
    loop {
        let line = reader.read_line(conn).await.map_err(read_failed)?;
        let line = sanitize_text(&line);
        text.push_str(&line);
        let code = line
            .get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| rejected(format!("unexpected reply {:?}", line.trim_end())))?;
        if line.as_bytes().get(3) != Some(&b'-') {
            return Ok((code, text));
        }
    }
}

//! Complete handshakes through OpenSSL, used where a probe needs the server's
//! certificate chain or has to present a client certificate.

use super::{
    ProtocolVersion, CONTENT_CHANGE_CIPHER_SPEC, CONTENT_HANDSHAKE, HS_CERTIFICATE_REQUEST,
    MAX_RECORD_LEN,
};
use crate::model::ClientAuth;
use openssl::error::ErrorStack;
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use std::io;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tokio_openssl::SslStream;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullHandshake {
    pub version: Option<ProtocolVersion>,
    pub cipher: Option<String>,
    /// DER certificates, leaf first, as sent by the server.
    pub chain: Vec<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum FullHandshakeError {
    #[error("server requires a client certificate")]
    ClientCertificateRequired,

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("connection closed during handshake")]
    Closed,

    #[error("i/o error during handshake: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot set up TLS client: {0}")]
    Setup(#[from] ErrorStack),
}

const POST_HANDSHAKE_WAIT: Duration = Duration::from_millis(250);

fn anonymous_connector() -> Result<SslConnector, ErrorStack> {
    static CONNECTOR: OnceLock<Result<SslConnector, ErrorStack>> = OnceLock::new();
    CONNECTOR
        .get_or_init(|| build_connector(None))
        .as_ref()
        .map(Clone::clone)
        .map_err(Clone::clone)
}

fn build_connector(client_auth: Option<&ClientAuth>) -> Result<SslConnector, ErrorStack> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    // Certificates are judged by the validator, never by the handshake.
    builder.set_verify(SslVerifyMode::NONE);
    if let Some(auth) = client_auth {
        builder.set_certificate_chain_file(&auth.certificate_chain)?;
        builder.set_private_key_file(&auth.private_key, SslFiletype::PEM)?;
        builder.check_private_key()?;
    }
    Ok(builder.build())
}

pub async fn handshake<S>(
    stream: S,
    server_name: &str,
    client_auth: Option<&ClientAuth>,
) -> Result<FullHandshake, FullHandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connector = match client_auth {
        Some(auth) => build_connector(Some(auth))?,
        None => anonymous_connector()?,
    };
    let mut config = connector.configure()?;
    config.set_verify_hostname(false);
    let ssl = config.into_ssl(server_name)?;

    let mut tls = SslStream::new(ssl, Tapped::new(stream))?;
    if let Err(err) = Pin::new(&mut tls).connect().await {
        // Up to TLS 1.2 the CertificateRequest travels in clear, so a refusal
        // after one arrived is the server insisting on a client certificate.
        if client_auth.is_none() && tls.get_ref().certificate_requested() {
            return Err(FullHandshakeError::ClientCertificateRequired);
        }
        return Err(classify(err));
    }

    let ssl = tls.ssl();
    let mut chain: Vec<Vec<u8>> = ssl
        .peer_cert_chain()
        .map(|stack| stack.iter().filter_map(|c| c.to_der().ok()).collect())
        .unwrap_or_default();
    if chain.is_empty() {
        if let Some(der) = ssl.peer_certificate().and_then(|c| c.to_der().ok()) {
            chain.push(der);
        }
    }

    let result = FullHandshake {
        version: ProtocolVersion::from_openssl(ssl.version_str()),
        cipher: ssl
            .current_cipher()
            .and_then(|c| c.standard_name())
            .map(str::to_string),
        chain,
    };

    // TLS 1.3 servers reject a missing client certificate only after the
    // client has sent its Finished, so the refusal shows up on the first read.
    if result.version == Some(ProtocolVersion::Tls13) && client_auth.is_none() {
        let mut byte = [0u8; 1];
        if let Ok(Err(err)) = timeout(POST_HANDSHAKE_WAIT, tls.read(&mut byte)).await {
            if mentions_certificate_required(&err.to_string()) {
                return Err(FullHandshakeError::ClientCertificateRequired);
            }
        }
    }
    Ok(result)
}

fn classify(err: openssl::ssl::Error) -> FullHandshakeError {
    let text = err.to_string();
    if let Some(io) = err.io_error() {
        return match io.kind() {
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe => FullHandshakeError::Closed,
            kind => FullHandshakeError::Io(std::io::Error::new(kind, text)),
        };
    }
    if err.code() == openssl::ssl::ErrorCode::SYSCALL && err.ssl_error().is_none() {
        return FullHandshakeError::Closed;
    }
    let reason = err
        .ssl_error()
        .map(|stack| stack.to_string())
        .unwrap_or(text);
    if mentions_certificate_required(&reason) {
        FullHandshakeError::ClientCertificateRequired
    } else {
        FullHandshakeError::Rejected(reason)
    }
}

fn mentions_certificate_required(reason: &str) -> bool {
    reason.to_ascii_lowercase().contains("certificate required")
}

/// Watches the plaintext part of the server's handshake for a
/// CertificateRequest. Scanning stops at the first ChangeCipherSpec.
#[derive(Debug, Default)]
struct HandshakeTap {
    records: Vec<u8>,
    messages: Vec<u8>,
    certificate_request: bool,
    done: bool,
}

impl HandshakeTap {
    fn feed(&mut self, bytes: &[u8]) {
        if self.done {
            return;
        }
        self.records.extend_from_slice(bytes);
        while self.records.len() >= 5 {
            let len = u16::from_be_bytes([self.records[3], self.records[4]]) as usize;
            if self.records.len() < 5 + len {
                break;
            }
            let content_type = self.records[0];
            let record: Vec<u8> = self.records.drain(..5 + len).skip(5).collect();
            match content_type {
                CONTENT_HANDSHAKE => self.scan_messages(&record),
                CONTENT_CHANGE_CIPHER_SPEC => self.done = true,
                _ => {}
            }
            if self.done {
                return;
            }
        }
        if self.records.len() > 2 * MAX_RECORD_LEN || self.messages.len() > 4 * MAX_RECORD_LEN {
            self.done = true;
        }
    }

    fn scan_messages(&mut self, payload: &[u8]) {
        self.messages.extend_from_slice(payload);
        while self.messages.len() >= 4 {
            let len = u32::from_be_bytes([0, self.messages[1], self.messages[2], self.messages[3]])
                as usize;
            if self.messages.len() < 4 + len {
                return;
            }
            if self.messages[0] == HS_CERTIFICATE_REQUEST {
                self.certificate_request = true;
                self.done = true;
                return;
            }
            self.messages.drain(..4 + len);
        }
    }
}

/// Transport wrapper feeding every byte read into a [`HandshakeTap`].
struct Tapped<S> {
    inner: S,
    tap: HandshakeTap,
}

impl<S> Tapped<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            tap: HandshakeTap::default(),
        }
    }

    fn certificate_requested(&self) -> bool {
        self.tap.certificate_request
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Tapped<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            this.tap.feed(&buf.filled()[before..]);
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tapped<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

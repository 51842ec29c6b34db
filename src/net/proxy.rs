//! HTTP CONNECT tunnelling.

use super::reader::{ReadError, ReplyReader};
use crate::error::{ConnectError, ScanError};
use crate::util::sanitize_text;
use base64::Engine;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use url::Url;

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpProxy {
    pub host: String,
    pub port: u16,
    /// Base64 `user:password`, sent as Basic proxy authorization.
    credentials: Option<String>,
}

impl HttpProxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    /// Parse `http://[user:pass@]host[:port]`.
    pub fn parse(raw: &str) -> Result<Self, ScanError> {
        let url = Url::parse(raw)
            .map_err(|err| ScanError::InvalidConfig(format!("invalid proxy url {raw}: {err}")))?;
        if url.scheme() != "http" {
            return Err(ScanError::InvalidConfig(format!(
                "unsupported proxy scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| ScanError::InvalidConfig(format!("proxy url {raw} has no host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let credentials = if url.username().is_empty() {
            None
        } else {
            let pair = format!("{}:{}", url.username(), url.password().unwrap_or(""));
            Some(base64::engine::general_purpose::STANDARD.encode(pair))
        };

        Ok(Self {
            host,
            port,
            credentials,
        })
    }

    pub fn connect_request(&self, host: &str, port: u16) -> String {
        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(credentials) = &self.credentials {
            request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
        }
        request.push_str("\r\n");
        request
    }

    /// Ask the proxy for a tunnel to `host:port` over an open connection.
    pub async fn tunnel<S>(
        &self,
        stream: &mut S,
        host: &str,
        port: u16,
        read_timeout: Duration,
    ) -> Result<(), ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let request = self.connect_request(host, port);
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|err| ConnectError::ProxyFailed(err.to_string()))?;

        let mut reader = ReplyReader::new(MAX_RESPONSE_HEAD, read_timeout);
        let head = reader
            .read_until(stream, b"\r\n\r\n")
            .await
            .map_err(|err| match err {
                ReadError::Io(io) => ConnectError::from_io(&io),
                other => ConnectError::ProxyFailed(other.to_string()),
            })?;

        let head = sanitize_text(&head);
        let status_line = head.lines().next().unwrap_or_default().trim().to_string();
        let status = status_line.split_whitespace().nth(1);
        if status_line.starts_with("HTTP/1.") && status == Some("200") {
            Ok(())
        } else {
            Err(ConnectError::ProxyFailed(status_line))
        }
    }
}

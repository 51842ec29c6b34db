//! Sends a crafted ClientHello over an established connection and reads the
//! server's answer until it can be classified.

use super::codec::{self, ClientHelloSpec, ReadUntil, ServerFlight, ServerHello};
use super::{Alert, ProtocolVersion, CONTENT_ALERT};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

const DEFAULT_MAX_RESPONSE: usize = 64 * 1024;

/// The server's reaction to one hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResponse {
    Accepted(ServerFlight),
    Alert {
        alert: Alert,
        server_hello: Option<ServerHello>,
    },
    Ssl2Error(u16),
    ConnectionClosed,
    Malformed(String),
    /// The hello never left the client: a field outgrew its length prefix.
    Unencodable(String),
    NoResponse,
    Io(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAttempt {
    pub version: ProtocolVersion,
    pub response: HandshakeResponse,
}

impl HandshakeAttempt {
    pub fn server_hello(&self) -> Option<&ServerHello> {
        match &self.response {
            HandshakeResponse::Accepted(flight) => flight.server_hello.as_ref(),
            _ => None,
        }
    }
}

/// What came back after a follow-up record sent on an accepted handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    Record { content_type: u8, len: usize },
    Alert(Alert),
    Closed,
    Silent,
    Io(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct HandshakeAdapter {
    read_timeout: Duration,
    max_response_bytes: usize,
}

impl HandshakeAdapter {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            max_response_bytes: DEFAULT_MAX_RESPONSE,
        }
    }

    pub fn with_max_response(mut self, bytes: usize) -> Self {
        self.max_response_bytes = bytes.max(1);
        self
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    #[instrument(level = "debug", skip_all, fields(version = %hello.version))]
    pub async fn exchange<S>(
        &self,
        stream: &mut S,
        hello: &ClientHelloSpec,
        until: ReadUntil,
        cancel: &CancellationToken,
    ) -> HandshakeAttempt
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        let encoded = {
            let mut rng = rand::thread_rng();
            codec::encode_client_hello(hello, &mut rng)
        };
        let record = match encoded {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, "client hello cannot be encoded");
                return HandshakeAttempt {
                    version: hello.version,
                    response: HandshakeResponse::Unencodable(err.to_string()),
                };
            }
        };
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => HandshakeResponse::Cancelled,
            response = self.send_and_read(stream, &record, hello.version, until) => response,
        };
        debug!(?response, "hello answered");
        HandshakeAttempt {
            version: hello.version,
            response,
        }
    }

    async fn send_and_read<S>(
        &self,
        stream: &mut S,
        record: &[u8],
        version: ProtocolVersion,
        until: ReadUntil,
    ) -> HandshakeResponse
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        if let Err(err) = stream.write_all(record).await {
            return io_response(&err);
        }

        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            match timeout(self.read_timeout, stream.read(&mut chunk)).await {
                Err(_) => return settle_partial(&buf, version, until, HandshakeResponse::NoResponse),
                Ok(Ok(0)) => {
                    if buf.is_empty() {
                        return HandshakeResponse::ConnectionClosed;
                    }
                    let truncated =
                        HandshakeResponse::Malformed("connection closed mid-record".into());
                    return settle_partial(&buf, version, until, truncated);
                }
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    match codec::decode_response(&buf, version, until) {
                        Err(err) => return HandshakeResponse::Malformed(err.to_string()),
                        Ok(progress) if progress.complete => return classify(progress.flight),
                        Ok(_) if buf.len() >= self.max_response_bytes => {
                            return HandshakeResponse::Malformed(format!(
                                "no complete server flight within {} bytes",
                                self.max_response_bytes
                            ));
                        }
                        Ok(_) => {}
                    }
                }
                Ok(Err(err)) => {
                    let fallback = io_response(&err);
                    return settle_partial(&buf, version, until, fallback);
                }
            }
        }
    }

    /// Send one more record on a connection whose hello was accepted and
    /// report the first record the server sends back.
    pub async fn follow_up<S>(
        &self,
        stream: &mut S,
        record: &[u8],
        cancel: &CancellationToken,
    ) -> FollowUp
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => FollowUp::Cancelled,
            result = self.send_follow_up(stream, record) => result,
        }
    }

    async fn send_follow_up<S>(&self, stream: &mut S, record: &[u8]) -> FollowUp
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        if let Err(err) = stream.write_all(record).await {
            return follow_up_io(&err);
        }
        let mut header = [0u8; 5];
        let mut filled = 0usize;
        while filled < header.len() {
            match timeout(self.read_timeout, stream.read(&mut header[filled..])).await {
                Err(_) => return FollowUp::Silent,
                Ok(Ok(0)) => return FollowUp::Closed,
                Ok(Ok(n)) => filled += n,
                Ok(Err(err)) => return follow_up_io(&err),
            }
        }
        let content_type = header[0];
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if content_type == CONTENT_ALERT && len >= 2 {
            let mut body = [0u8; 2];
            if let Ok(Ok(_)) = timeout(self.read_timeout, stream.read_exact(&mut body)).await {
                return FollowUp::Alert(Alert {
                    level: body[0],
                    description: body[1],
                });
            }
        }
        FollowUp::Record { content_type, len }
    }
}

fn classify(flight: ServerFlight) -> HandshakeResponse {
    if let Some(alert) = flight.alert {
        return HandshakeResponse::Alert {
            alert,
            server_hello: flight.server_hello,
        };
    }
    if let Some(code) = flight.ssl2_error {
        return HandshakeResponse::Ssl2Error(code);
    }
    HandshakeResponse::Accepted(flight)
}

/// The stream ended before the decoder finished. Whatever was decoded so far
/// still counts if it includes a ServerHello.
fn settle_partial(
    buf: &[u8],
    version: ProtocolVersion,
    until: ReadUntil,
    otherwise: HandshakeResponse,
) -> HandshakeResponse {
    if buf.is_empty() {
        return otherwise;
    }
    match codec::decode_response(buf, version, until) {
        Err(err) => HandshakeResponse::Malformed(err.to_string()),
        Ok(progress) if progress.flight.server_hello.is_some() => classify(progress.flight),
        Ok(_) => otherwise,
    }
}

fn is_peer_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

fn io_response(err: &io::Error) -> HandshakeResponse {
    if is_peer_close(err) {
        HandshakeResponse::ConnectionClosed
    } else {
        HandshakeResponse::Io(err.to_string())
    }
}

fn follow_up_io(err: &io::Error) -> FollowUp {
    if is_peer_close(err) {
        FollowUp::Closed
    } else {
        FollowUp::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::codec::testing::*;
    use tokio::io::duplex;

    fn hello() -> ClientHelloSpec {
        ClientHelloSpec::new(ProtocolVersion::Tls12).with_ciphers([0xc02f])
    }

    async fn serve(reply: Vec<u8>, close: bool) -> tokio::io::DuplexStream {
        let (client, mut server) = duplex(64 * 1024);
        tokio::spawn(async move {
            let mut scratch = [0u8; 1024];
            let _ = server.read(&mut scratch).await;
            let _ = server.write_all(&reply).await;
            if !close {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });
        client
    }

    #[tokio::test]
    async fn accepted_server_hello() {
        let mut client = serve(server_hello_record(0x0303, 0xc02f, &[]), false).await;
        let adapter = HandshakeAdapter::new(Duration::from_secs(2));
        let attempt = adapter
            .exchange(&mut client, &hello(), ReadUntil::ServerHello, &CancellationToken::new())
            .await;
        assert_eq!(attempt.server_hello().map(|h| h.cipher_suite), Some(0xc02f));
    }

    #[tokio::test]
    async fn alert_is_reported() {
        let mut client = serve(alert_record(40), false).await;
        let adapter = HandshakeAdapter::new(Duration::from_secs(2));
        let attempt = adapter
            .exchange(&mut client, &hello(), ReadUntil::ServerHello, &CancellationToken::new())
            .await;
        assert!(matches!(
            attempt.response,
            HandshakeResponse::Alert { alert, server_hello: None } if alert.description == 40
        ));
    }

    #[tokio::test]
    async fn unencodable_hello_is_never_sent() {
        let (mut client, mut server) = duplex(1024);
        let long_name = "h".repeat(256);
        let spec = hello().with_alpn(&[long_name.as_str()]);
        let adapter = HandshakeAdapter::new(Duration::from_secs(2));
        let attempt = adapter
            .exchange(&mut client, &spec, ReadUntil::ServerHello, &CancellationToken::new())
            .await;
        assert!(matches!(attempt.response, HandshakeResponse::Unencodable(_)));

        drop(client);
        let mut sent = Vec::new();
        server.read_to_end(&mut sent).await.unwrap();
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn immediate_close_is_connection_closed() {
        let mut client = serve(Vec::new(), true).await;
        let adapter = HandshakeAdapter::new(Duration::from_secs(2));
        let attempt = adapter
            .exchange(&mut client, &hello(), ReadUntil::ServerHello, &CancellationToken::new())
            .await;
        assert_eq!(attempt.response, HandshakeResponse::ConnectionClosed);
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let mut client = serve(b"SSH-2.0-OpenSSH_9.6\r\n".to_vec(), false).await;
        let adapter = HandshakeAdapter::new(Duration::from_secs(2));
        let attempt = adapter
            .exchange(&mut client, &hello(), ReadUntil::ServerHello, &CancellationToken::new())
            .await;
        assert!(matches!(attempt.response, HandshakeResponse::Malformed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_no_response() {
        let mut client = serve(Vec::new(), false).await;
        let adapter = HandshakeAdapter::new(Duration::from_millis(500));
        let attempt = adapter
            .exchange(&mut client, &hello(), ReadUntil::ServerHello, &CancellationToken::new())
            .await;
        assert_eq!(attempt.response, HandshakeResponse::NoResponse);
    }

    #[tokio::test]
    async fn cancellation_wins() {
        let mut client = serve(Vec::new(), false).await;
        let adapter = HandshakeAdapter::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempt = adapter
            .exchange(&mut client, &hello(), ReadUntil::ServerHello, &cancel)
            .await;
        assert_eq!(attempt.response, HandshakeResponse::Cancelled);
    }

    #[tokio::test]
    async fn hello_done_flight_with_early_close_keeps_server_hello() {
        let mut reply = server_hello_record(0x0303, 0x002f, &[]);
        reply.extend(certificate_record(&[b"leaf"]));
        let mut client = serve(reply, true).await;
        let adapter = HandshakeAdapter::new(Duration::from_secs(2));
        let attempt = adapter
            .exchange(&mut client, &hello(), ReadUntil::HelloDone, &CancellationToken::new())
            .await;
        match attempt.response {
            HandshakeResponse::Accepted(flight) => {
                assert!(!flight.hello_done);
                assert_eq!(flight.certificates, vec![b"leaf".to_vec()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

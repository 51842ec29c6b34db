//! Connection factory: one fresh socket per probe, optionally tunnelled
//! through a proxy and upgraded with STARTTLS.

pub mod proxy;
pub mod reader;

use crate::engine::rate::RateLimiter;
use crate::error::ConnectError;
use crate::model::{ScanConfig, Target};
use crate::starttls;
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A byte stream positioned right before the ClientHello.
pub struct Connection {
    stream: Box<dyn Stream>,
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(stream: impl Stream + 'static, peer: Option<SocketAddr>) -> Self {
        Self {
            stream: Box::new(stream),
            peer,
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection for one probe attempt. Dropping the returned
    /// future releases any socket it opened.
    async fn open(
        &self,
        target: &Target,
        cancel: &CancellationToken,
    ) -> Result<Connection, ConnectError>;
}

pub struct TcpConnector {
    connect_timeout: Duration,
    read_timeout: Duration,
    limiter: Option<RateLimiter>,
}

impl TcpConnector {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            limiter: config.connect_rate.map(RateLimiter::new),
        }
    }

    async fn establish(&self, target: &Target) -> Result<Connection, ConnectError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let stream = match &target.proxy {
            Some(proxy) => {
                let mut stream = self.dial(&proxy.host, proxy.port, None).await?;
                proxy
                    .tunnel(&mut stream, &target.host, target.port, self.read_timeout)
                    .await?;
                stream
            }
            None => self.dial(&target.host, target.port, target.ip).await?,
        };

        let peer = stream.peer_addr().ok();
        let mut conn = Connection::new(stream, peer);
        if let Some(protocol) = target.starttls {
            starttls::negotiator(protocol)
                .negotiate(&mut conn, target, self.read_timeout)
                .await?;
            debug!(%protocol, "starttls upgrade accepted");
        }
        Ok(conn)
    }

    async fn dial(
        &self,
        host: &str,
        port: u16,
        ip: Option<std::net::IpAddr>,
    ) -> Result<TcpStream, ConnectError> {
        let addrs: Vec<SocketAddr> = match ip {
            Some(ip) => vec![SocketAddr::new(ip, port)],
            None => lookup_host((host, port))
                .await
                .map_err(|err| ConnectError::DnsFailure {
                    host: host.to_string(),
                    reason: err.to_string(),
                })?
                .collect(),
        };
        if addrs.is_empty() {
            return Err(ConnectError::DnsFailure {
                host: host.to_string(),
                reason: "no addresses".into(),
            });
        }

        let mut last_err = None;
        for addr in addrs {
            match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Ok(Err(err)) => {
                    let err = ConnectError::from_io(&err);
                    if matches!(err, ConnectError::ResourceExhausted(_)) {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
                Err(_) => last_err = Some(ConnectError::TcpTimeout(self.connect_timeout)),
            }
        }
        Err(last_err.unwrap_or(ConnectError::TcpTimeout(self.connect_timeout)))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    #[instrument(level = "debug", skip_all, fields(target = %target))]
    async fn open(
        &self,
        target: &Target,
        cancel: &CancellationToken,
    ) -> Result<Connection, ConnectError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            result = self.establish(target) => result,
        }
    }
}

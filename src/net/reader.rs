use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("connection closed by the server")]
    Closed,
    #[error("reply exceeds {0} bytes")]
    Oversized(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Buffered reader for plaintext protocol replies. Bytes after a delimiter
/// stay buffered for the next call.
pub struct ReplyReader {
    buf: Vec<u8>,
    max_bytes: usize,
    read_timeout: Duration,
}

impl ReplyReader {
    pub fn new(max_bytes: usize, read_timeout: Duration) -> Self {
        Self {
            buf: Vec::new(),
            max_bytes,
            read_timeout,
        }
    }

    pub async fn read_line<S>(&mut self, stream: &mut S) -> Result<Vec<u8>, ReadError>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        self.read_until(stream, b"\n").await
    }

    pub async fn read_until<S>(
        &mut self,
        stream: &mut S,
        delimiter: &[u8],
    ) -> Result<Vec<u8>, ReadError>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if let Some(end) = find_delimiter(&self.buf, delimiter) {
                let rest = self.buf.split_off(end);
                return Ok(std::mem::replace(&mut self.buf, rest));
            }
            if self.buf.len() >= self.max_bytes {
                return Err(ReadError::Oversized(self.max_bytes));
            }
            self.fill(stream).await?;
        }
    }

    /// Read until at least `len` bytes are buffered and return exactly those.
    pub async fn read_exact<S>(&mut self, stream: &mut S, len: usize) -> Result<Vec<u8>, ReadError>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        if len > self.max_bytes {
            return Err(ReadError::Oversized(self.max_bytes));
        }
        while self.buf.len() < len {
            self.fill(stream).await?;
        }
        let rest = self.buf.split_off(len);
        Ok(std::mem::replace(&mut self.buf, rest))
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    async fn fill<S>(&mut self, stream: &mut S) -> Result<(), ReadError>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let mut chunk = [0u8; 1024];
        match timeout(self.read_timeout, stream.read(&mut chunk)).await {
            Err(_) => Err(ReadError::Timeout),
            Ok(Ok(0)) => Err(ReadError::Closed),
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(())
            }
            Ok(Err(err)) => Err(err.into()),
        }
    }
}

fn find_delimiter(buf: &[u8], delimiter: &[u8]) -> Option<usize> {
    if delimiter.is_empty() {
        return None;
    }
    buf.windows(delimiter.len())
        .position(|window| window == delimiter)
        .map(|pos| pos + delimiter.len())
}

//! Loopback servers and a throwaway PKI shared by the integration tests.

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, SubjectAlternativeName};
use openssl::x509::{X509NameBuilder, X509};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What a client offered in its first flight.
#[derive(Debug, Clone)]
pub struct Hello {
    /// Wire version the client is asking for; `0x0002` for SSLv2.
    pub version: u16,
    pub ciphers: Vec<u16>,
}

pub enum Reply {
    Send(Vec<u8>),
    Close,
    Silent,
}

pub async fn read_hello<S: AsyncRead + Unpin>(stream: &mut S) -> Option<Hello> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await.ok()?;
    if header[0] & 0x80 != 0 {
        return Some(Hello {
            version: 0x0002,
            ciphers: Vec::new(),
        });
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.ok()?;
    if payload.first() != Some(&0x01) {
        return None;
    }
    parse_hello_body(payload.get(4..)?)
}

fn parse_hello_body(body: &[u8]) -> Option<Hello> {
    let mut version = u16::from_be_bytes([*body.first()?, *body.get(1)?]);
    let mut pos = 34;
    pos += 1 + *body.get(pos)? as usize;
    let suites_len = u16::from_be_bytes([*body.get(pos)?, *body.get(pos + 1)?]) as usize;
    pos += 2;
    let ciphers = body
        .get(pos..pos + suites_len)?
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    pos += suites_len;
    pos += 1 + *body.get(pos)? as usize;

    if let Some(exts) = body.get(pos + 2..) {
        let mut at = 0;
        while at + 4 <= exts.len() {
            let kind = u16::from_be_bytes([exts[at], exts[at + 1]]);
            let len = u16::from_be_bytes([exts[at + 2], exts[at + 3]]) as usize;
            let data = exts.get(at + 4..at + 4 + len)?;
            if kind == 0x002b
                && data
                    .get(1..)
                    .is_some_and(|v| v.chunks(2).any(|c| c == [0x03, 0x04]))
            {
                version = 0x0304;
            }
            at += 4 + len;
        }
    }
    Some(Hello { version, ciphers })
}

pub fn server_hello(version: u16, cipher: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&version.to_be_bytes());
    body.extend_from_slice(&[0x42; 32]);
    body.push(0);
    body.extend_from_slice(&cipher.to_be_bytes());
    body.push(0);
    let mut handshake = vec![0x02, 0, (body.len() >> 8) as u8, body.len() as u8];
    handshake.extend_from_slice(&body);
    record(0x16, &handshake)
}

pub fn alert(description: u8) -> Vec<u8> {
    record(0x15, &[2, description])
}

fn record(content_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![content_type, 0x03, 0x03];
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub async fn answer<S, F>(mut stream: S, respond: &F)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&Hello) -> Reply,
{
    let reply = match read_hello(&mut stream).await {
        Some(hello) => respond(&hello),
        None => Reply::Close,
    };
    match reply {
        Reply::Send(bytes) => {
            let _ = stream.write_all(&bytes).await;
            let mut sink = [0u8; 256];
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(200),
                stream.read(&mut sink),
            )
            .await;
        }
        Reply::Close => {}
        Reply::Silent => {
            let mut sink = [0u8; 256];
            while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
        }
    }
}

/// Accepts connections forever, answering each ClientHello with `respond`.
pub async fn spawn_tls<F>(respond: F) -> SocketAddr
where
    F: Fn(&Hello) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = Arc::new(respond);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let respond = respond.clone();
            tokio::spawn(async move { answer(socket, respond.as_ref()).await });
        }
    });
    addr
}

/// Accepts connections and never writes a byte.
pub async fn spawn_silent() -> SocketAddr {
    spawn_tls(|_| Reply::Silent).await
}

/// Plain helper for servers that need to drive the socket themselves.
pub async fn spawn_raw<F, Fut>(handle: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(handle(socket));
        }
    });
    addr
}

pub struct Issued {
    pub cert: X509,
    pub key: PKey<Private>,
}

impl Issued {
    pub fn pem(&self) -> Vec<u8> {
        self.cert.to_pem().unwrap()
    }
}

static SERIAL: AtomicU32 = AtomicU32::new(100);

/// Issue a CA (no `san`) or a leaf for `san`, self-signed when `issuer` is
/// `None`.
pub fn issue(cn: &str, san: Option<&str>, issuer: Option<&Issued>) -> Issued {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(SERIAL.fetch_add(1, Ordering::Relaxed))
        .unwrap()
        .to_asn1_integer()
        .unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    match issuer {
        Some(issuer) => builder.set_issuer_name(issuer.cert.subject_name()).unwrap(),
        None => builder.set_issuer_name(&name).unwrap(),
    }
    builder.set_pubkey(&key).unwrap();
    let yesterday = chrono::Utc::now().timestamp() - 86_400;
    builder
        .set_not_before(&Asn1Time::from_unix(yesterday).unwrap())
        .unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();

    match san {
        None => {
            builder
                .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
                .unwrap();
        }
        Some(dns) => {
            let ext = SubjectAlternativeName::new()
                .dns(dns)
                .build(&builder.x509v3_context(issuer.map(|i| &*i.cert), None))
                .unwrap();
            builder.append_extension(ext).unwrap();
        }
    }

    let signer = issuer.map(|i| &i.key).unwrap_or(&key);
    builder.sign(signer, MessageDigest::sha256()).unwrap();
    Issued {
        cert: builder.build(),
        key,
    }
}

//! Byte-level encoding of ClientHello records and decoding of the server's
//! first flight.
//!
//! The encoder builds exactly the hello it is asked for, including hellos a
//! regular TLS client would refuse to send (single weak suite, compression,
//! heartbeat). The decoder never panics on hostile input; anything that does
//! not follow the wire format is a [`ProtocolError`].

use super::{
    Alert, ProtocolVersion, CONTENT_ALERT, CONTENT_APPLICATION_DATA, CONTENT_CHANGE_CIPHER_SPEC,
    CONTENT_HANDSHAKE, CONTENT_HEARTBEAT, EXT_ALPN, EXT_EC_POINT_FORMATS, EXT_KEY_SHARE,
    EXT_SERVER_NAME, EXT_SIGNATURE_ALGORITHMS, EXT_SUPPORTED_GROUPS, EXT_SUPPORTED_VERSIONS,
    GROUP_SECP256R1, GROUP_SECP384R1, GROUP_SECP521R1, GROUP_X25519, GROUP_X448, HS_CERTIFICATE,
    HS_CERTIFICATE_REQUEST, HS_CLIENT_HELLO, HS_HELLO_REQUEST, HS_SERVER_HELLO,
    HS_SERVER_HELLO_DONE, MAX_RECORD_LEN,
};
use crate::error::ProtocolError;
use rand::RngCore;
use std::net::IpAddr;

pub const DEFAULT_GROUPS: &[u16] = &[
    GROUP_X25519,
    GROUP_SECP256R1,
    GROUP_SECP384R1,
    GROUP_SECP521R1,
    GROUP_X448,
];

pub const DEFAULT_SIGNATURE_ALGORITHMS: &[u16] = &[
    0x0403, 0x0503, 0x0603, // ecdsa_secp256r1_sha256 .. secp521r1_sha512
    0x0804, 0x0805, 0x0806, // rsa_pss_rsae_sha256 .. sha512
    0x0401, 0x0501, 0x0601, // rsa_pkcs1_sha256 .. sha512
    0x0201, 0x0203, // rsa_pkcs1_sha1, ecdsa_sha1
];

/// SHA-256("HelloRetryRequest"), sent as the ServerHello random of a HRR.
const HELLO_RETRY_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8, 0x91,
    0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8, 0x33, 0x9c,
];

/// How far into the server flight the decoder has to read before a probe can
/// interpret the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadUntil {
    ServerHello,
    HelloDone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExtension {
    pub kind: u16,
    pub data: Vec<u8>,
}

/// Everything that goes into one ClientHello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHelloSpec {
    pub version: ProtocolVersion,
    pub cipher_suites: Vec<u16>,
    pub ssl2_ciphers: Vec<u32>,
    pub server_name: Option<String>,
    pub alpn: Vec<String>,
    pub supported_groups: Vec<u16>,
    pub signature_algorithms: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Vec<RawExtension>,
}

impl ClientHelloSpec {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            cipher_suites: Vec::new(),
            ssl2_ciphers: Vec::new(),
            server_name: None,
            alpn: Vec::new(),
            supported_groups: DEFAULT_GROUPS.to_vec(),
            signature_algorithms: DEFAULT_SIGNATURE_ALGORITHMS.to_vec(),
            compression_methods: vec![0],
            extensions: Vec::new(),
        }
    }

    pub fn with_ciphers(mut self, ciphers: impl IntoIterator<Item = u16>) -> Self {
        self.cipher_suites = ciphers.into_iter().collect();
        self
    }

    pub fn with_ssl2_ciphers(mut self, ciphers: impl IntoIterator<Item = u32>) -> Self {
        self.ssl2_ciphers = ciphers.into_iter().collect();
        self
    }

    /// IP literals are never sent as SNI.
    pub fn with_server_name(mut self, name: Option<&str>) -> Self {
        self.server_name = name
            .filter(|n| !n.is_empty() && n.parse::<IpAddr>().is_err())
            .map(str::to_string);
        self
    }

    pub fn with_alpn(mut self, protocols: &[&str]) -> Self {
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_groups(mut self, groups: &[u16]) -> Self {
        self.supported_groups = groups.to_vec();
        self
    }

    pub fn with_compression(mut self, methods: &[u8]) -> Self {
        self.compression_methods = methods.to_vec();
        self
    }

    pub fn with_extension(mut self, kind: u16, data: &[u8]) -> Self {
        self.extensions.push(RawExtension {
            kind,
            data: data.to_vec(),
        });
        self
    }

    pub fn offers(&self, cipher: u32) -> bool {
        if self.version == ProtocolVersion::Ssl2 {
            self.ssl2_ciphers.contains(&cipher)
        } else {
            u16::try_from(cipher)
                .map(|id| self.cipher_suites.contains(&id))
                .unwrap_or(false)
        }
    }
}

/// Encode the hello described by `spec` as a single record. Fails when a
/// field outgrows its length prefix.
pub fn encode_client_hello(
    spec: &ClientHelloSpec,
    rng: &mut impl RngCore,
) -> Result<Vec<u8>, ProtocolError> {
    if spec.version == ProtocolVersion::Ssl2 {
        encode_ssl2_hello(spec, rng)
    } else {
        encode_tls_hello(spec, rng)
    }
}

pub fn encode_record(
    content_type: u8,
    version: u16,
    payload: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let len = len_u16("record payload", payload.len())?;
    let mut record = Vec::with_capacity(payload.len() + 5);
    record.push(content_type);
    put_u16(&mut record, version);
    put_u16(&mut record, len);
    record.extend_from_slice(payload);
    Ok(record)
}

/// A heartbeat request whose declared payload length is larger than the
/// payload actually sent.
pub fn encode_heartbeat_request(
    version: ProtocolVersion,
    claimed_len: u16,
) -> Result<Vec<u8>, ProtocolError> {
    let mut message = vec![0x01];
    put_u16(&mut message, claimed_len);
    encode_record(CONTENT_HEARTBEAT, version.wire(), &message)
}

fn encode_tls_hello(spec: &ClientHelloSpec, rng: &mut impl RngCore) -> Result<Vec<u8>, ProtocolError> {
    let legacy_version = spec.version.min(ProtocolVersion::Tls12).wire();
    let mut body = Vec::with_capacity(512);
    put_u16(&mut body, legacy_version);

    let mut random = [0u8; 32];
    rng.fill_bytes(&mut random);
    body.extend_from_slice(&random);

    if spec.version == ProtocolVersion::Tls13 {
        let mut session_id = [0u8; 32];
        rng.fill_bytes(&mut session_id);
        body.push(session_id.len() as u8);
        body.extend_from_slice(&session_id);
    } else {
        body.push(0);
    }

    put_u16(&mut body, len_u16("cipher suite list", spec.cipher_suites.len() * 2)?);
    for suite in &spec.cipher_suites {
        put_u16(&mut body, *suite);
    }

    body.push(len_u8("compression methods", spec.compression_methods.len())?);
    body.extend_from_slice(&spec.compression_methods);

    let extensions = encode_extensions(spec, rng)?;
    if !extensions.is_empty() {
        put_u16(&mut body, len_u16("extension block", extensions.len())?);
        body.extend_from_slice(&extensions);
    }

    let mut handshake = Vec::with_capacity(body.len() + 4);
    handshake.push(HS_CLIENT_HELLO);
    put_u24(&mut handshake, body.len());
    handshake.extend_from_slice(&body);

    let record_version = if spec.version == ProtocolVersion::Ssl3 {
        ProtocolVersion::Ssl3.wire()
    } else {
        ProtocolVersion::Tls10.wire()
    };
    encode_record(CONTENT_HANDSHAKE, record_version, &handshake)
}

fn encode_extensions(spec: &ClientHelloSpec, rng: &mut impl RngCore) -> Result<Vec<u8>, ProtocolError> {
    let mut exts = Vec::new();

    // SSL 3.0 servers commonly choke on extensions; only explicit ones go out.
    if spec.version != ProtocolVersion::Ssl3 {
        if let Some(name) = &spec.server_name {
            let name_len = len_u16("server name", name.len())?;
            let mut data = Vec::with_capacity(name.len() + 5);
            put_u16(&mut data, len_u16("server name list", name.len() + 3)?);
            data.push(0x00);
            put_u16(&mut data, name_len);
            data.extend_from_slice(name.as_bytes());
            append_extension(&mut exts, EXT_SERVER_NAME, &data)?;
        }

        if !spec.supported_groups.is_empty() {
            let mut data = Vec::new();
            put_u16(&mut data, len_u16("supported groups", spec.supported_groups.len() * 2)?);
            for group in &spec.supported_groups {
                put_u16(&mut data, *group);
            }
            append_extension(&mut exts, EXT_SUPPORTED_GROUPS, &data)?;
            append_extension(&mut exts, EXT_EC_POINT_FORMATS, &[0x01, 0x00])?;
        }

        if spec.version >= ProtocolVersion::Tls12 && !spec.signature_algorithms.is_empty() {
            let mut data = Vec::new();
            put_u16(
                &mut data,
                len_u16("signature algorithms", spec.signature_algorithms.len() * 2)?,
            );
            for alg in &spec.signature_algorithms {
                put_u16(&mut data, *alg);
            }
            append_extension(&mut exts, EXT_SIGNATURE_ALGORITHMS, &data)?;
        }

        if !spec.alpn.is_empty() {
            let mut list = Vec::new();
            for proto in &spec.alpn {
                list.push(len_u8("ALPN protocol name", proto.len())?);
                list.extend_from_slice(proto.as_bytes());
            }
            let mut data = Vec::with_capacity(list.len() + 2);
            put_u16(&mut data, len_u16("ALPN list", list.len())?);
            data.extend_from_slice(&list);
            append_extension(&mut exts, EXT_ALPN, &data)?;
        }

        if spec.version == ProtocolVersion::Tls13 {
            let mut versions = vec![2];
            put_u16(&mut versions, ProtocolVersion::Tls13.wire());
            append_extension(&mut exts, EXT_SUPPORTED_VERSIONS, &versions)?;

            // Any 32 bytes form a valid x25519 public value; without x25519 an
            // empty share list makes the server answer with a HelloRetryRequest.
            let mut shares = Vec::new();
            if spec.supported_groups.contains(&GROUP_X25519) {
                let mut key = [0u8; 32];
                rng.fill_bytes(&mut key);
                put_u16(&mut shares, GROUP_X25519);
                put_u16(&mut shares, key.len() as u16);
                shares.extend_from_slice(&key);
            }
            let mut data = Vec::with_capacity(shares.len() + 2);
            put_u16(&mut data, shares.len() as u16);
            data.extend_from_slice(&shares);
            append_extension(&mut exts, EXT_KEY_SHARE, &data)?;
        }
    }

    for ext in &spec.extensions {
        append_extension(&mut exts, ext.kind, &ext.data)?;
    }
    Ok(exts)
}

fn encode_ssl2_hello(spec: &ClientHelloSpec, rng: &mut impl RngCore) -> Result<Vec<u8>, ProtocolError> {
    let mut challenge = [0u8; 16];
    rng.fill_bytes(&mut challenge);

    let mut msg = vec![0x01];
    put_u16(&mut msg, ProtocolVersion::Ssl2.wire());
    put_u16(&mut msg, len_u16("SSLv2 cipher specs", spec.ssl2_ciphers.len() * 3)?);
    put_u16(&mut msg, 0);
    put_u16(&mut msg, challenge.len() as u16);
    for cipher in &spec.ssl2_ciphers {
        msg.extend_from_slice(&cipher.to_be_bytes()[1..]);
    }
    msg.extend_from_slice(&challenge);

    // Two-byte SSLv2 header: the top bit is a flag, 15 bits remain for the length.
    let len = len_u16("SSLv2 record", msg.len())?;
    if len > 0x7fff {
        return Err(ProtocolError::FieldTooLong {
            field: "SSLv2 record",
            len: msg.len(),
        });
    }
    let mut record = Vec::with_capacity(msg.len() + 2);
    record.extend_from_slice(&(0x8000 | len).to_be_bytes());
    record.extend_from_slice(&msg);
    Ok(record)
}

fn append_extension(buf: &mut Vec<u8>, kind: u16, data: &[u8]) -> Result<(), ProtocolError> {
    let len = len_u16("extension", data.len())?;
    put_u16(buf, kind);
    put_u16(buf, len);
    buf.extend_from_slice(data);
    Ok(())
}

fn len_u16(field: &'static str, len: usize) -> Result<u16, ProtocolError> {
    u16::try_from(len).map_err(|_| ProtocolError::FieldTooLong { field, len })
}

fn len_u8(field: &'static str, len: usize) -> Result<u8, ProtocolError> {
    u8::try_from(len).map_err(|_| ProtocolError::FieldTooLong { field, len })
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_u24(buf: &mut Vec<u8>, value: usize) {
    buf.push((value >> 16) as u8);
    buf.push((value >> 8) as u8);
    buf.push(value as u8);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerExtension {
    pub kind: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    /// Negotiated version, taken from supported_versions when present.
    pub version: u16,
    pub legacy_version: u16,
    pub cipher_suite: u32,
    pub compression: u8,
    pub session_id: Vec<u8>,
    pub extensions: Vec<ServerExtension>,
    pub hello_retry_request: bool,
}

impl ServerHello {
    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        ProtocolVersion::from_wire(self.version)
    }

    pub fn extension(&self, kind: u16) -> Option<&[u8]> {
        self.extensions
            .iter()
            .find(|e| e.kind == kind)
            .map(|e| e.data.as_slice())
    }

    pub fn has_extension(&self, kind: u16) -> bool {
        self.extension(kind).is_some()
    }

    pub fn alpn_protocol(&self) -> Option<String> {
        let data = self.extension(EXT_ALPN)?;
        let mut reader = Reader::new(data, "ALPN");
        let list = reader.u16().ok()? as usize;
        let mut list = Reader::new(reader.take(list).ok()?, "ALPN");
        let len = list.u8().ok()? as usize;
        let proto = list.take(len).ok()?;
        Some(String::from_utf8_lossy(proto).into_owned())
    }
}

/// What the server sent before the decoder stopped reading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerFlight {
    pub server_hello: Option<ServerHello>,
    pub certificates: Vec<Vec<u8>>,
    pub certificate_requested: bool,
    pub hello_done: bool,
    pub alert: Option<Alert>,
    pub ssl2_error: Option<u16>,
    pub heartbeat: Option<usize>,
    pub encrypted_records: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub flight: ServerFlight,
    pub complete: bool,
}

/// Decode the bytes received so far in answer to a hello of `version`.
pub fn decode_response(
    buf: &[u8],
    version: ProtocolVersion,
    until: ReadUntil,
) -> Result<Progress, ProtocolError> {
    match buf.first() {
        Some(first) if version == ProtocolVersion::Ssl2 && first & 0x80 != 0 => {
            decode_ssl2_server_hello(buf)
        }
        _ => decode_server_flight(buf, until),
    }
}

pub fn decode_server_flight(buf: &[u8], until: ReadUntil) -> Result<Progress, ProtocolError> {
    let mut flight = ServerFlight::default();
    let mut handshake = Vec::new();
    let mut hs_pos = 0usize;
    let mut pos = 0usize;

    while pos + 5 <= buf.len() {
        let content_type = buf[pos];
        let version = u16::from_be_bytes([buf[pos + 1], buf[pos + 2]]);
        let len = u16::from_be_bytes([buf[pos + 3], buf[pos + 4]]) as usize;

        if !(CONTENT_CHANGE_CIPHER_SPEC..=CONTENT_HEARTBEAT).contains(&content_type) {
            return Err(ProtocolError::UnexpectedContentType(content_type));
        }
        if version >> 8 != 0x03 {
            return Err(ProtocolError::InvalidRecordVersion(version));
        }
        if len > MAX_RECORD_LEN {
            return Err(ProtocolError::OversizedRecord(len));
        }
        if pos + 5 + len > buf.len() {
            break;
        }
        let fragment = &buf[pos + 5..pos + 5 + len];
        pos += 5 + len;

        match content_type {
            CONTENT_ALERT => {
                if fragment.len() < 2 {
                    return Err(ProtocolError::Truncated("alert"));
                }
                flight.alert = Some(Alert {
                    level: fragment[0],
                    description: fragment[1],
                });
                return Ok(done(flight));
            }
            CONTENT_HANDSHAKE => {
                if fragment.is_empty() {
                    return Err(ProtocolError::EmptyRecord("handshake"));
                }
                handshake.extend_from_slice(fragment);
                while hs_pos + 4 <= handshake.len() {
                    let kind = handshake[hs_pos];
                    let body_len = read_u24(&handshake[hs_pos + 1..hs_pos + 4]);
                    if hs_pos + 4 + body_len > handshake.len() {
                        break;
                    }
                    let body = &handshake[hs_pos + 4..hs_pos + 4 + body_len];
                    hs_pos += 4 + body_len;

                    match kind {
                        HS_HELLO_REQUEST => {}
                        HS_SERVER_HELLO => {
                            if flight.server_hello.is_some() {
                                return Err(ProtocolError::Invalid("duplicate ServerHello".into()));
                            }
                            let hello = parse_server_hello(body)?;
                            let tls13 = hello.version == ProtocolVersion::Tls13.wire();
                            flight.server_hello = Some(hello);
                            if until == ReadUntil::ServerHello || tls13 {
                                return Ok(done(flight));
                            }
                        }
                        _ if flight.server_hello.is_none() => {
                            return Err(ProtocolError::UnexpectedHandshake(kind));
                        }
                        HS_CERTIFICATE => flight.certificates = parse_certificate_list(body)?,
                        HS_CERTIFICATE_REQUEST => flight.certificate_requested = true,
                        HS_SERVER_HELLO_DONE => {
                            flight.hello_done = true;
                            return Ok(done(flight));
                        }
                        _ => {}
                    }
                }
            }
            CONTENT_CHANGE_CIPHER_SPEC => {
                if flight.server_hello.is_none() {
                    return Err(ProtocolError::Invalid(
                        "ChangeCipherSpec before ServerHello".into(),
                    ));
                }
            }
            CONTENT_APPLICATION_DATA => {
                if flight.server_hello.is_none() {
                    return Err(ProtocolError::Invalid(
                        "application data before ServerHello".into(),
                    ));
                }
                flight.encrypted_records = true;
                return Ok(done(flight));
            }
            _ => {
                flight.heartbeat = Some(fragment.len());
                return Ok(done(flight));
            }
        }
    }

    Ok(Progress {
        flight,
        complete: false,
    })
}

fn done(flight: ServerFlight) -> Progress {
    Progress {
        flight,
        complete: true,
    }
}

fn decode_ssl2_server_hello(buf: &[u8]) -> Result<Progress, ProtocolError> {
    if buf.len() < 2 {
        return Ok(Progress {
            flight: ServerFlight::default(),
            complete: false,
        });
    }
    let len = (((buf[0] & 0x7f) as usize) << 8) | buf[1] as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyRecord("SSLv2"));
    }
    if buf.len() < 2 + len {
        return Ok(Progress {
            flight: ServerFlight::default(),
            complete: false,
        });
    }

    let mut reader = Reader::new(&buf[2..2 + len], "SSLv2 message");
    let mut flight = ServerFlight::default();
    match reader.u8()? {
        0x00 => {
            flight.ssl2_error = Some(reader.u16()?);
        }
        0x04 => {
            let _session_id_hit = reader.u8()?;
            let _certificate_type = reader.u8()?;
            let version = reader.u16()?;
            let cert_len = reader.u16()? as usize;
            let specs_len = reader.u16()? as usize;
            let connection_id_len = reader.u16()? as usize;
            if specs_len % 3 != 0 {
                return Err(ProtocolError::Invalid(format!(
                    "SSLv2 cipher spec list length {specs_len} is not a multiple of 3"
                )));
            }
            let certificate = reader.take(cert_len)?;
            let specs = reader.take(specs_len)?;
            reader.take(connection_id_len)?;

            let cipher = specs
                .chunks_exact(3)
                .next()
                .map(|c| u32::from_be_bytes([0, c[0], c[1], c[2]]))
                .ok_or_else(|| ProtocolError::Invalid("SSLv2 ServerHello without ciphers".into()))?;
            if !certificate.is_empty() {
                flight.certificates.push(certificate.to_vec());
            }
            flight.server_hello = Some(ServerHello {
                version,
                legacy_version: version,
                cipher_suite: cipher,
                compression: 0,
                session_id: Vec::new(),
                extensions: Vec::new(),
                hello_retry_request: false,
            });
        }
        other => {
            return Err(ProtocolError::Invalid(format!(
                "unexpected SSLv2 message type {other}"
            )))
        }
    }
    Ok(done(flight))
}

fn parse_server_hello(body: &[u8]) -> Result<ServerHello, ProtocolError> {
    let mut reader = Reader::new(body, "ServerHello");
    let legacy_version = reader.u16()?;
    if legacy_version >> 8 != 0x03 {
        return Err(ProtocolError::Invalid(format!(
            "ServerHello version {legacy_version:#06x}"
        )));
    }
    let random = reader.take(32)?;
    let hello_retry_request = random == HELLO_RETRY_RANDOM;
    let session_id_len = reader.u8()? as usize;
    if session_id_len > 32 {
        return Err(ProtocolError::Invalid(format!(
            "session id length {session_id_len}"
        )));
    }
    let session_id = reader.take(session_id_len)?.to_vec();
    let cipher_suite = reader.u16()? as u32;
    let compression = reader.u8()?;

    let mut extensions = Vec::new();
    let mut version = legacy_version;
    if !reader.is_empty() {
        let ext_len = reader.u16()? as usize;
        let mut ext_reader = Reader::new(reader.take(ext_len)?, "ServerHello extensions");
        while !ext_reader.is_empty() {
            let kind = ext_reader.u16()?;
            let len = ext_reader.u16()? as usize;
            let data = ext_reader.take(len)?.to_vec();
            if kind == EXT_SUPPORTED_VERSIONS && data.len() == 2 {
                version = u16::from_be_bytes([data[0], data[1]]);
            }
            extensions.push(ServerExtension { kind, data });
        }
        if !reader.is_empty() {
            return Err(ProtocolError::Invalid(
                "trailing bytes after ServerHello extensions".into(),
            ));
        }
    }

    Ok(ServerHello {
        version,
        legacy_version,
        cipher_suite,
        compression,
        session_id,
        extensions,
        hello_retry_request,
    })
}

fn parse_certificate_list(body: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut reader = Reader::new(body, "Certificate");
    let total = reader.u24()?;
    let mut list = Reader::new(reader.take(total)?, "Certificate");
    let mut certs = Vec::new();
    while !list.is_empty() {
        let len = list.u24()?;
        certs.push(list.take(len)?.to_vec());
    }
    Ok(certs)
}

fn read_u24(bytes: &[u8]) -> usize {
    ((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], context: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            context,
        }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.data.len() - self.pos < len {
            return Err(ProtocolError::Truncated(self.context));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<usize, ProtocolError> {
        Ok(read_u24(self.take(3)?))
    }
}

//! TLS 1.2 wire codec.
//!
//! # Responsibilities
//! - Record and handshake headers
//! - ClientHello / ServerHello with the extensions we speak
//! - Certificate, ServerKeyExchange (named curve) and ClientKeyExchange
//!
//! Decoding is strict: any truncation, trailing garbage or length mismatch
//! is reported as [`AlertDescription::DecodeError`].

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};
use rand::RngCore;

use crate::tls::alert::AlertDescription;

pub type DecodeResult<T> = Result<T, AlertDescription>;

pub const RECORD_HEADER_LEN: usize = 5;
pub const HANDSHAKE_HEADER_LEN: usize = 4;
/// Largest plaintext fragment in one record.
pub const MAX_FRAGMENT_LEN: usize = 1 << 14;
/// Largest ciphertext body we accept.
pub const MAX_CIPHERTEXT_LEN: usize = MAX_FRAGMENT_LEN + 2048;

pub const VERSION_TLS12: u16 = 0x0303;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            20 => Some(Self::ChangeCipherSpec),
            21 => Some(Self::Alert),
            22 => Some(Self::Handshake),
            23 => Some(Self::ApplicationData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    HelloRequest = 0,
    ClientHello = 1,
    ServerHello = 2,
    Certificate = 11,
    ServerKeyExchange = 12,
    CertificateRequest = 13,
    ServerHelloDone = 14,
    CertificateVerify = 15,
    ClientKeyExchange = 16,
    Finished = 20,
}

impl HandshakeType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use HandshakeType::*;
        Some(match value {
            0 => HelloRequest,
            1 => ClientHello,
            2 => ServerHello,
            11 => Certificate,
            12 => ServerKeyExchange,
            13 => CertificateRequest,
            14 => ServerHelloDone,
            15 => CertificateVerify,
            16 => ClientKeyExchange,
            20 => Finished,
            _ => return None,
        })
    }
}

pub mod extension {
    pub const SERVER_NAME: u16 = 0;
    pub const ELLIPTIC_CURVES: u16 = 10;
    pub const EC_POINT_FORMATS: u16 = 11;
    pub const SIGNATURE_ALGORITHMS: u16 = 13;
    pub const EXTENDED_MASTER_SECRET: u16 = 23;
    pub const SUPPORTED_VERSIONS: u16 = 43;
}

pub mod named_curve {
    pub const SECP256R1: u16 = 23;
    pub const SECP384R1: u16 = 24;
    pub const X25519: u16 = 29;
}

pub mod signature_scheme {
    pub const RSA_PKCS1_SHA1: u16 = 0x0201;
    pub const ECDSA_SHA1: u16 = 0x0203;
    pub const RSA_PKCS1_SHA256: u16 = 0x0401;
    pub const ECDSA_SECP256R1_SHA256: u16 = 0x0403;
    pub const RSA_PKCS1_SHA384: u16 = 0x0501;
    pub const ECDSA_SECP384R1_SHA384: u16 = 0x0503;
}

// ---- primitive readers ----------------------------------------------------

fn need(buf: &&[u8], n: usize) -> DecodeResult<()> {
    if buf.remaining() < n {
        Err(AlertDescription::DecodeError)
    } else {
        Ok(())
    }
}

fn read_u8(buf: &mut &[u8]) -> DecodeResult<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut &[u8]) -> DecodeResult<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn read_bytes<'a>(buf: &mut &'a [u8], n: usize) -> DecodeResult<&'a [u8]> {
    need(buf, n)?;
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn read_vec_u8<'a>(buf: &mut &'a [u8]) -> DecodeResult<&'a [u8]> {
    let len = read_u8(buf)? as usize;
    read_bytes(buf, len)
}

fn read_vec_u16<'a>(buf: &mut &'a [u8]) -> DecodeResult<&'a [u8]> {
    let len = read_u16(buf)? as usize;
    read_bytes(buf, len)
}

fn read_vec_u24<'a>(buf: &mut &'a [u8]) -> DecodeResult<&'a [u8]> {
    need(buf, 3)?;
    let len = buf.get_uint(3) as usize;
    read_bytes(buf, len)
}

fn finish(buf: &[u8]) -> DecodeResult<()> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(AlertDescription::DecodeError)
    }
}

fn put_vec_u8(out: &mut Vec<u8>, data: &[u8]) {
    out.put_u8(data.len() as u8);
    out.put_slice(data);
}

fn put_vec_u16(out: &mut Vec<u8>, data: &[u8]) {
    out.put_u16(data.len() as u16);
    out.put_slice(data);
}

fn put_vec_u24(out: &mut Vec<u8>, data: &[u8]) {
    out.put_uint(data.len() as u64, 3);
    out.put_slice(data);
}

fn u16_list(items: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(items.len() * 2);
    for item in items {
        out.put_u16(*item);
    }
    out
}

fn parse_u16_list(mut data: &[u8]) -> DecodeResult<Vec<u16>> {
    if data.len() % 2 != 0 {
        return Err(AlertDescription::DecodeError);
    }
    let mut items = Vec::with_capacity(data.len() / 2);
    while data.has_remaining() {
        items.push(data.get_u16());
    }
    Ok(items)
}

// ---- record and handshake framing -----------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub version: u16,
    pub length: u16,
}

impl RecordHeader {
    pub fn new(content_type: ContentType, length: usize) -> Self {
        debug_assert!(length <= u16::MAX as usize, "record body of {length} bytes");
        Self {
            content_type,
            version: VERSION_TLS12,
            length: length as u16,
        }
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let [vmaj, vmin] = self.version.to_be_bytes();
        let [l0, l1] = self.length.to_be_bytes();
        [self.content_type as u8, vmaj, vmin, l0, l1]
    }

    pub fn decode(header: &[u8]) -> DecodeResult<Self> {
        let mut buf = header;
        let content_type = read_u8(&mut buf)?;
        let version = read_u16(&mut buf)?;
        let length = read_u16(&mut buf)?;
        finish(buf)?;

        if version >> 8 != 3 {
            return Err(AlertDescription::DecodeError);
        }
        if length as usize > MAX_CIPHERTEXT_LEN {
            return Err(AlertDescription::RecordOverflow);
        }
        let content_type = ContentType::from_u8(content_type).ok_or(AlertDescription::UnexpectedMessage)?;
        Ok(Self {
            content_type,
            version,
            length,
        })
    }
}

/// Frame a handshake message: type, 24-bit length, body.
pub fn encode_handshake(handshake_type: HandshakeType, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HANDSHAKE_HEADER_LEN + body.len());
    out.put_u8(handshake_type as u8);
    put_vec_u24(&mut out, body);
    out
}

/// Parse a handshake header, returning the raw type and announced length.
pub fn decode_handshake_header(data: &[u8]) -> DecodeResult<(u8, usize)> {
    let mut buf = data;
    let handshake_type = read_u8(&mut buf)?;
    need(&buf, 3)?;
    Ok((handshake_type, buf.get_uint(3) as usize))
}

// ---- hello messages -------------------------------------------------------

/// 32-byte hello random: unix time followed by 28 random bytes.
pub fn hello_random() -> [u8; 32] {
    let mut random = [0u8; 32];
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    random[..4].copy_from_slice(&now.to_be_bytes());
    rand::thread_rng().fill_bytes(&mut random[4..]);
    random
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub id: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extensions(pub Vec<Extension>);

impl Extensions {
    pub fn add(&mut self, id: u16, data: Vec<u8>) {
        self.0.push(Extension { id, data });
    }

    pub fn get(&self, id: u16) -> Option<&[u8]> {
        self.0.iter().find(|e| e.id == id).map(|e| e.data.as_slice())
    }

    pub fn contains(&self, id: u16) -> bool {
        self.get(id).is_some()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        if self.0.is_empty() {
            return;
        }
        let mut body = Vec::new();
        for ext in &self.0 {
            body.put_u16(ext.id);
            put_vec_u16(&mut body, &ext.data);
        }
        put_vec_u16(out, &body);
    }

    /// Extensions are optional at the end of a hello message.
    fn decode(buf: &mut &[u8]) -> DecodeResult<Self> {
        let mut extensions = Self::default();
        if buf.is_empty() {
            return Ok(extensions);
        }
        let mut list = read_vec_u16(buf)?;
        while !list.is_empty() {
            let id = read_u16(&mut list)?;
            let data = read_vec_u16(&mut list)?;
            extensions.add(id, data.to_vec());
        }
        Ok(extensions)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: Extensions,
}

impl ClientHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.put_u16(self.version);
        out.put_slice(&self.random);
        put_vec_u8(&mut out, &self.session_id);
        put_vec_u16(&mut out, &u16_list(&self.cipher_suites));
        put_vec_u8(&mut out, &self.compression_methods);
        self.extensions.encode(&mut out);
        out
    }

    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        let mut buf = data;
        let version = read_u16(&mut buf)?;
        let mut random = [0u8; 32];
        random.copy_from_slice(read_bytes(&mut buf, 32)?);
        let session_id = read_vec_u8(&mut buf)?.to_vec();
        let cipher_suites = parse_u16_list(read_vec_u16(&mut buf)?)?;
        let compression_methods = read_vec_u8(&mut buf)?.to_vec();
        let extensions = Extensions::decode(&mut buf)?;
        finish(buf)?;
        Ok(Self {
            version,
            random,
            session_id,
            cipher_suites,
            compression_methods,
            extensions,
        })
    }

    /// Host name from the server_name extension, if present and well-formed.
    pub fn server_name(&self) -> Option<String> {
        self.extensions
            .get(extension::SERVER_NAME)
            .and_then(|data| decode_server_name(data).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub version: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub compression_method: u8,
    pub extensions: Extensions,
}

impl ServerHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(80);
        out.put_u16(self.version);
        out.put_slice(&self.random);
        put_vec_u8(&mut out, &self.session_id);
        out.put_u16(self.cipher_suite);
        out.put_u8(self.compression_method);
        self.extensions.encode(&mut out);
        out
    }

    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        let mut buf = data;
        let version = read_u16(&mut buf)?;
        let mut random = [0u8; 32];
        random.copy_from_slice(read_bytes(&mut buf, 32)?);
        let session_id = read_vec_u8(&mut buf)?.to_vec();
        let cipher_suite = read_u16(&mut buf)?;
        let compression_method = read_u8(&mut buf)?;
        let extensions = Extensions::decode(&mut buf)?;
        finish(buf)?;
        Ok(Self {
            version,
            random,
            session_id,
            cipher_suite,
            compression_method,
            extensions,
        })
    }
}

// ---- extension bodies -----------------------------------------------------

pub fn encode_server_name(host: &str) -> Vec<u8> {
    let mut entry = Vec::with_capacity(host.len() + 3);
    entry.put_u8(0); // host_name
    put_vec_u16(&mut entry, host.as_bytes());
    let mut out = Vec::with_capacity(entry.len() + 2);
    put_vec_u16(&mut out, &entry);
    out
}

pub fn decode_server_name(data: &[u8]) -> DecodeResult<String> {
    let mut buf = data;
    let mut list = read_vec_u16(&mut buf)?;
    finish(buf)?;
    while !list.is_empty() {
        let name_type = read_u8(&mut list)?;
        let name = read_vec_u16(&mut list)?;
        if name_type == 0 {
            return String::from_utf8(name.to_vec()).map_err(|_| AlertDescription::DecodeError);
        }
    }
    Err(AlertDescription::DecodeError)
}

/// `u16`-length-prefixed list of `u16`s, the layout shared by the
/// elliptic_curves and signature_algorithms extensions.
pub fn encode_u16_vector(items: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + items.len() * 2);
    put_vec_u16(&mut out, &u16_list(items));
    out
}

pub fn decode_u16_vector(data: &[u8]) -> DecodeResult<Vec<u16>> {
    let mut buf = data;
    let list = read_vec_u16(&mut buf)?;
    finish(buf)?;
    parse_u16_list(list)
}

// ---- certificate and key exchange -----------------------------------------

/// DER certificates, leaf first.
pub fn encode_certificate(chain: &[Vec<u8>]) -> Vec<u8> {
    let mut list = Vec::new();
    for cert in chain {
        put_vec_u24(&mut list, cert);
    }
    let mut out = Vec::with_capacity(list.len() + 3);
    put_vec_u24(&mut out, &list);
    out
}

pub fn decode_certificate(data: &[u8]) -> DecodeResult<Vec<Vec<u8>>> {
    let mut buf = data;
    let mut list = read_vec_u24(&mut buf)?;
    finish(buf)?;
    let mut chain = Vec::new();
    while !list.is_empty() {
        chain.push(read_vec_u24(&mut list)?.to_vec());
    }
    Ok(chain)
}

/// `ServerECDHParams` for a named curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdhParams {
    pub curve_type: u8,
    pub named_curve: u16,
    pub point: Vec<u8>,
}

impl EcdhParams {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.point.len());
        out.put_u8(self.curve_type);
        out.put_u16(self.named_curve);
        put_vec_u8(&mut out, &self.point);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKeyExchange {
    pub params: EcdhParams,
    pub signature_scheme: u16,
    pub signature: Vec<u8>,
}

impl ServerKeyExchange {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.params.encode();
        out.put_u16(self.signature_scheme);
        put_vec_u16(&mut out, &self.signature);
        out
    }

    pub fn decode(data: &[u8]) -> DecodeResult<Self> {
        let mut buf = data;
        let curve_type = read_u8(&mut buf)?;
        let named_curve = read_u16(&mut buf)?;
        let point = read_vec_u8(&mut buf)?.to_vec();
        let signature_scheme = read_u16(&mut buf)?;
        let signature = read_vec_u16(&mut buf)?.to_vec();
        finish(buf)?;
        Ok(Self {
            params: EcdhParams {
                curve_type,
                named_curve,
                point,
            },
            signature_scheme,
            signature,
        })
    }
}

/// RSA ClientKeyExchange: the encrypted pre-master secret, `u16`-prefixed.
pub fn encode_rsa_client_key_exchange(encrypted: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + encrypted.len());
    put_vec_u16(&mut out, encrypted);
    out
}

pub fn decode_rsa_client_key_exchange(data: &[u8]) -> DecodeResult<Vec<u8>> {
    let mut buf = data;
    let encrypted = read_vec_u16(&mut buf)?;
    finish(buf)?;
    if encrypted.is_empty() {
        return Err(AlertDescription::DecodeError);
    }
    Ok(encrypted.to_vec())
}

/// ECDHE ClientKeyExchange: our public point, `u8`-prefixed.
pub fn encode_ecdhe_client_key_exchange(point: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + point.len());
    put_vec_u8(&mut out, point);
    out
}

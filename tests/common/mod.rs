//! Shared helpers for the loopback integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::Sha256;

use reactor_tls::config::NetConfig;
use reactor_tls::net::{Listener, Socket};
use reactor_tls::sched::Scheduler;
use reactor_tls::tls::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256;
use reactor_tls::tls::key_exchange::CURVE_TYPE_NAMED;
use reactor_tls::tls::wire::{
    self, named_curve, signature_scheme, ClientHello, ContentType, EcdhParams, Extensions, HandshakeType,
    RecordHeader, ServerHello, ServerKeyExchange, HANDSHAKE_HEADER_LEN, RECORD_HEADER_LEN, VERSION_TLS12,
};
use reactor_tls::tls::{CertStore, TrustStore};

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

/// Server identity `<prefix>-localhost.{pem,key}`.
pub fn cert_store(prefix: &str) -> Arc<CertStore> {
    let mut store = CertStore::new();
    store
        .load_pem_files(
            &fixture(&format!("{prefix}-localhost.pem")),
            &fixture(&format!("{prefix}-localhost.key")),
        )
        .unwrap();
    Arc::new(store)
}

pub fn trusted_roots() -> TrustStore {
    let mut roots = TrustStore::new();
    roots.load_pem_file(&fixture("trusted-ca.pem")).unwrap();
    roots
}

/// Client configuration trusting the test root.
pub fn client_config() -> NetConfig {
    NetConfig::default().with_verifier(Arc::new(trusted_roots()))
}

/// Bind a TLS echo listener on loopback and add it to `scheduler`.
pub fn start_echo_server(scheduler: &Scheduler, config: &NetConfig, store: Arc<CertStore>) -> SocketAddr {
    let config = config.clone();
    let listener = Listener::bind_addr("127.0.0.1:0".parse().unwrap(), move |socket: &mut Socket| {
        socket.enable_crypto_server(&config, store.clone(), Box::new(echo));
    })
    .unwrap();
    let addr = listener.local_addr().unwrap();
    scheduler.add_socket(listener);
    addr
}

pub fn echo(socket: &mut Socket) {
    socket.recv(Box::new(|s: &mut Socket, data: Vec<u8>| {
        if data.is_empty() {
            return;
        }
        if s.send(&data).is_ok() {
            echo(s);
        }
    }));
}

/// Tick `scheduler` until `done` holds or `limit` passes. Returns whether
/// `done` held.
pub fn drive(scheduler: &mut Scheduler, limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        scheduler.tick();
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    done()
}

/// A record as seen on the wire: content type and body.
pub type WireRecord = (u8, Vec<u8>);

/// A hand-written ECDHE_RSA server for one connection. It answers the
/// ClientHello with ServerHello, the trusted localhost Certificate, an x25519
/// ServerKeyExchange signed with the matching key (with its signature
/// corrupted when asked) and ServerHelloDone. The thread then returns up to
/// `max_records` records the client sends back.
pub fn scripted_ecdhe_server(corrupt_signature: bool, max_records: usize) -> (SocketAddr, JoinHandle<Vec<WireRecord>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let (content_type, hello) = read_record(&mut stream).unwrap();
        assert_eq!(content_type, ContentType::Handshake as u8);
        assert_eq!(hello[0], HandshakeType::ClientHello as u8);
        let hello = ClientHello::decode(&hello[HANDSHAKE_HEADER_LEN..]).unwrap();
        assert!(hello.cipher_suites.contains(&TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256));

        let store = cert_store("trusted");
        let identity = store.find_entry_for_domain("localhost").unwrap();
        let server_random = wire::hello_random();
        let reply = ServerHello {
            version: VERSION_TLS12,
            random: server_random,
            session_id: Vec::new(),
            cipher_suite: TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            compression_method: 0,
            extensions: Extensions::default(),
        };

        let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
        let params = EcdhParams {
            curve_type: CURVE_TYPE_NAMED,
            named_curve: named_curve::X25519,
            point: x25519_dalek::PublicKey::from(&secret).as_bytes().to_vec(),
        };
        let mut signed = Vec::new();
        signed.extend_from_slice(&hello.random);
        signed.extend_from_slice(&server_random);
        signed.extend_from_slice(&params.encode());
        let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(identity.private_key.clone());
        let mut signature = signing_key.sign(&signed).to_vec();
        if corrupt_signature {
            signature[0] ^= 0x01;
        }
        let exchange = ServerKeyExchange {
            params,
            signature_scheme: signature_scheme::RSA_PKCS1_SHA256,
            signature,
        };

        let messages = [
            wire::encode_handshake(HandshakeType::ServerHello, &reply.encode()),
            wire::encode_handshake(HandshakeType::Certificate, &wire::encode_certificate(&identity.chain)),
            wire::encode_handshake(HandshakeType::ServerKeyExchange, &exchange.encode()),
            wire::encode_handshake(HandshakeType::ServerHelloDone, &[]),
        ];
        for message in messages {
            stream
                .write_all(&RecordHeader::new(ContentType::Handshake, message.len()).encode())
                .unwrap();
            stream.write_all(&message).unwrap();
        }

        let mut records = Vec::new();
        while records.len() < max_records {
            match read_record(&mut stream) {
                Some(record) => records.push(record),
                None => break,
            }
        }
        records
    });
    (addr, handle)
}

/// Read one record, or `None` once the connection ends or stalls.
pub fn read_record(stream: &mut TcpStream) -> Option<WireRecord> {
    let mut header = [0u8; RECORD_HEADER_LEN];
    stream.read_exact(&mut header).ok()?;
    let header = RecordHeader::decode(&header).ok()?;
    let mut body = vec![0u8; header.length as usize];
    stream.read_exact(&mut body).ok()?;
    Some((header.content_type as u8, body))
}

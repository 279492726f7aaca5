//! Client ECDHE handshakes against a hand-written server.

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reactor_tls::net::Socket;
use reactor_tls::sched::worker::lock;
use reactor_tls::sched::Scheduler;
use reactor_tls::tls::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256;
use reactor_tls::tls::wire::{ContentType, HandshakeType};
use reactor_tls::tls::AlertDescription;

use common::{client_config, drive, scripted_ecdhe_server};

const LIMIT: Duration = Duration::from_secs(15);

fn ecdhe_client(addr: SocketAddr) -> (Scheduler, Arc<Mutex<Socket>>) {
    let config = client_config().with_client_suites(vec![TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256]);
    let mut scheduler = Scheduler::with_config(config.clone());
    scheduler.set_catch_panics(false);

    let mut socket = Socket::new();
    socket.connect_addr(addr, Duration::from_secs(2)).unwrap();
    socket.enable_crypto_client(&config, "localhost", Box::new(|_: &mut Socket| {}));
    let client = scheduler.add_socket(socket);
    (scheduler, client)
}

#[test]
fn signed_key_exchange_leads_to_client_key_exchange() {
    let (addr, server) = scripted_ecdhe_server(false, 3);
    let (mut scheduler, _client) = ecdhe_client(addr);
    assert!(drive(&mut scheduler, LIMIT, || server.is_finished()));
    let records = server.join().unwrap();

    assert_eq!(records.len(), 3);
    let (content_type, key_exchange) = &records[0];
    assert_eq!(*content_type, ContentType::Handshake as u8);
    // Type, 24-bit length 33, then the client's 32-byte x25519 point.
    assert_eq!(&key_exchange[..5], &[HandshakeType::ClientKeyExchange as u8, 0, 0, 33, 32]);
    assert_eq!(key_exchange.len(), 4 + 33);

    assert_eq!(records[1], (ContentType::ChangeCipherSpec as u8, vec![1]));

    // Finished under AES-GCM: explicit nonce, 16 bytes of framed
    // verify_data, tag.
    let (content_type, finished) = &records[2];
    assert_eq!(*content_type, ContentType::Handshake as u8);
    assert_eq!(finished.len(), 8 + 16 + 16);
}

#[test]
fn corrupted_signature_is_decrypt_error() {
    let (addr, server) = scripted_ecdhe_server(true, 3);
    let (mut scheduler, client) = ecdhe_client(addr);
    assert!(drive(&mut scheduler, LIMIT, || server.is_finished()));
    let records = server.join().unwrap();

    assert_eq!(records, vec![(ContentType::Alert as u8, vec![2, AlertDescription::DecryptError as u8])]);
    let client = lock(&client);
    assert_eq!(client.last_alert_sent(), Some(AlertDescription::DecryptError));
    assert!(!client.has_connection());
}

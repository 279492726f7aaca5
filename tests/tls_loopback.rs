//! Client and server handshakes against each other on one scheduler.

mod common;

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reactor_tls::config::NetConfig;
use reactor_tls::net::{Listener, Socket};
use reactor_tls::sched::worker::lock;
use reactor_tls::sched::Scheduler;
use reactor_tls::tls::cipher_suite::{
    TLS_RSA_WITH_AES_128_CBC_SHA, TLS_RSA_WITH_AES_128_CBC_SHA256, TLS_RSA_WITH_AES_256_CBC_SHA,
    TLS_RSA_WITH_AES_256_CBC_SHA256,
};
use reactor_tls::tls::wire::ClientHello;
use reactor_tls::tls::{AlertDescription, CertStore};

use common::{cert_store, client_config, drive, echo, fixture, start_echo_server};

const LIMIT: Duration = Duration::from_secs(15);

fn scheduler(config: &NetConfig) -> Scheduler {
    let mut scheduler = Scheduler::with_config(config.clone());
    scheduler.set_catch_panics(false);
    scheduler
}

fn connected(addr: std::net::SocketAddr) -> Socket {
    let mut socket = Socket::new();
    socket.connect_addr(addr, Duration::from_secs(2)).unwrap();
    socket
}

fn ping_pong(suite: u16, extended_master_secret: bool) {
    let mut server_config = NetConfig::default();
    server_config.extended_master_secret = extended_master_secret;
    let mut scheduler = scheduler(&server_config);
    let addr = start_echo_server(&scheduler, &server_config, cert_store("trusted"));

    let mut config = client_config().with_client_suites(vec![suite]);
    config.extended_master_secret = extended_master_secret;

    let reply = Arc::new(Mutex::new(Vec::new()));
    let sink = reply.clone();
    let mut socket = connected(addr);
    socket.enable_crypto_client(
        &config,
        "localhost",
        Box::new(move |s: &mut Socket| {
            s.send(b"ping").unwrap();
            s.recv(Box::new(move |s: &mut Socket, data: Vec<u8>| {
                *sink.lock().unwrap() = data;
                s.close();
            }));
        }),
    );
    let client = scheduler.add_socket(socket);

    let done = drive(&mut scheduler, LIMIT, || *reply.lock().unwrap() == b"ping");
    let client = lock(&client);
    assert!(done, "suite {suite:#06x} ems={extended_master_secret}: close reason {:?}", client.close_reason());
    assert_eq!(client.last_alert_sent(), Some(AlertDescription::CloseNotify));
}

#[test]
fn rsa_suites_with_extended_master_secret() {
    for suite in [
        TLS_RSA_WITH_AES_128_CBC_SHA,
        TLS_RSA_WITH_AES_256_CBC_SHA,
        TLS_RSA_WITH_AES_128_CBC_SHA256,
        TLS_RSA_WITH_AES_256_CBC_SHA256,
    ] {
        ping_pong(suite, true);
    }
}

#[test]
fn rsa_suites_with_classic_master_secret() {
    for suite in [
        TLS_RSA_WITH_AES_128_CBC_SHA,
        TLS_RSA_WITH_AES_256_CBC_SHA,
        TLS_RSA_WITH_AES_128_CBC_SHA256,
        TLS_RSA_WITH_AES_256_CBC_SHA256,
    ] {
        ping_pong(suite, false);
    }
}

#[test]
fn default_offer_negotiates_with_server() {
    let server_config = NetConfig::default();
    let mut scheduler = scheduler(&server_config);
    let addr = start_echo_server(&scheduler, &server_config, cert_store("trusted"));

    let ready = Arc::new(Mutex::new(false));
    let flag = ready.clone();
    let mut socket = connected(addr);
    socket.enable_crypto_client(
        &client_config(),
        "localhost",
        Box::new(move |s: &mut Socket| {
            *flag.lock().unwrap() = s.is_encrypted() && !s.is_handshaking();
        }),
    );
    scheduler.add_socket(socket);
    assert!(drive(&mut scheduler, LIMIT, || *ready.lock().unwrap()));
}

#[test]
fn initial_data_follows_client_finished() {
    let server_config = NetConfig::default();
    let mut scheduler = scheduler(&server_config);
    let addr = start_echo_server(&scheduler, &server_config, cert_store("trusted"));

    let reply = Arc::new(Mutex::new(Vec::new()));
    let sink = reply.clone();
    let mut socket = connected(addr);
    socket.enable_crypto_client_with_data(
        &client_config(),
        "localhost",
        b"early".to_vec(),
        Box::new(move |s: &mut Socket| {
            s.recv(Box::new(move |_: &mut Socket, data: Vec<u8>| *sink.lock().unwrap() = data));
        }),
    );
    scheduler.add_socket(socket);
    assert!(drive(&mut scheduler, LIMIT, || *reply.lock().unwrap() == b"early"));
}

#[test]
fn untrusted_server_is_rejected_with_bad_certificate() {
    let server_config = NetConfig::default();
    let mut scheduler = scheduler(&server_config);
    let lost = Arc::new(Mutex::new(Vec::new()));
    let reasons = lost.clone();
    scheduler.on_connection_lost(move |s: &mut Socket| {
        reasons.lock().unwrap().push(s.close_reason().map(str::to_string));
    });
    let addr = start_echo_server(&scheduler, &server_config, cert_store("rogue"));

    let ready = Arc::new(Mutex::new(false));
    let flag = ready.clone();
    let mut socket = connected(addr);
    socket.enable_crypto_client(
        &client_config(),
        "localhost",
        Box::new(move |_: &mut Socket| *flag.lock().unwrap() = true),
    );
    let client = scheduler.add_socket(socket);

    let server_saw_alert = || {
        lost.lock()
            .unwrap()
            .iter()
            .any(|r| r.as_deref() == Some("Received fatal TLS alert: 42"))
    };
    assert!(drive(&mut scheduler, LIMIT, server_saw_alert));
    assert!(!*ready.lock().unwrap());

    let client = lock(&client);
    assert!(!client.has_connection());
    assert_eq!(client.last_alert_sent(), Some(AlertDescription::BadCertificate));
    assert!(client
        .close_reason()
        .is_some_and(|r| r.starts_with("Certificate validation failed")));
}

#[test]
fn unknown_server_name_is_unrecognized() {
    let mut store = CertStore::new();
    for prefix in ["trusted", "rogue"] {
        store
            .load_pem_files(
                &fixture(&format!("{prefix}-localhost.pem")),
                &fixture(&format!("{prefix}-localhost.key")),
            )
            .unwrap();
    }
    let server_config = NetConfig::default();
    let mut scheduler = scheduler(&server_config);
    let addr = start_echo_server(&scheduler, &server_config, Arc::new(store));

    let mut socket = connected(addr);
    socket.enable_crypto_client(&client_config(), "other.test", Box::new(|_: &mut Socket| {}));
    let client = scheduler.add_socket(socket);

    assert!(drive(&mut scheduler, LIMIT, || !lock(&client).has_connection()));
    let client = lock(&client);
    assert_eq!(client.last_alert_received(), Some(AlertDescription::UnrecognizedName as u8));
    assert_eq!(client.close_reason(), Some("Received fatal TLS alert: 112"));
}

#[test]
fn client_hello_hook_can_veto() {
    let server_config = NetConfig::default();
    let mut scheduler = scheduler(&server_config);
    let store = cert_store("trusted");
    let seen_sni = Arc::new(Mutex::new(None));
    let sni_sink = seen_sni.clone();
    let accept_config = server_config.clone();
    let listener = Listener::bind_addr("127.0.0.1:0".parse().unwrap(), move |socket: &mut Socket| {
        let sni_sink = sni_sink.clone();
        socket.enable_crypto_server_with_hook(
            &accept_config,
            store.clone(),
            Box::new(move |_: &mut Socket, hello: &ClientHello| {
                *sni_sink.lock().unwrap() = hello.server_name();
                Err(AlertDescription::HandshakeFailure)
            }),
            Box::new(echo),
        );
    })
    .unwrap();
    let addr = listener.local_addr().unwrap();
    scheduler.add_socket(listener);

    let mut socket = connected(addr);
    socket.enable_crypto_client(&client_config(), "localhost", Box::new(|_: &mut Socket| {}));
    let client = scheduler.add_socket(socket);

    assert!(drive(&mut scheduler, LIMIT, || !lock(&client).has_connection()));
    assert_eq!(seen_sni.lock().unwrap().as_deref(), Some("localhost"));
    assert_eq!(
        lock(&client).last_alert_received(),
        Some(AlertDescription::HandshakeFailure as u8)
    );
}

#[test]
fn silent_server_times_out() {
    let silent = TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = client_config();
    config.handshake_timeout = Duration::from_millis(200);
    let mut scheduler = scheduler(&config);

    let mut socket = connected(silent.local_addr().unwrap());
    socket.enable_crypto_client(&config, "localhost", Box::new(|_: &mut Socket| panic!("must not complete")));
    let client = scheduler.add_socket(socket);

    assert!(drive(&mut scheduler, Duration::from_secs(5), || !lock(&client).has_connection()));
    assert_eq!(lock(&client).close_reason(), Some("TLS handshake timed out"));
}

//! Server role of the TLS 1.2 handshake. RSA key transport only.
//!
//! ```text
//!                ◀─ ClientHello
//! ServerHello, Certificate, ServerHelloDone ─▶
//!                ◀─ ClientKeyExchange, CCS
//!                   (pre-master secret decrypted off-thread)
//!                ◀─ Finished
//! CCS, Finished ─▶
//! ```

use std::sync::Arc;
use std::time::Instant;

use crate::config::NetConfig;
use crate::net::socket::{ReadyCallback, Socket};
use crate::tls::alert::AlertDescription;
use crate::tls::cert_store::CertStore;
use crate::tls::cipher_suite;
use crate::tls::encrypter::{constant_time_eq, Encrypter};
use crate::tls::handshaker::{
    self, body, spawn_job, Abort, ClientHelloHook, HandshakeEvent, HandshakeState, Handshaker, Role, Step,
    StepResult, CLIENT_FINISHED, SERVER_FINISHED,
};
use crate::tls::wire::{self, extension, ClientHello, Extensions, HandshakeType, ServerHello, VERSION_TLS12};

impl Socket {
    /// Serve a TLS handshake on an accepted socket, presenting the identity
    /// from `store` that matches the client's SNI.
    pub fn enable_crypto_server(&mut self, config: &NetConfig, store: Arc<CertStore>, on_ready: ReadyCallback) {
        self.start_server_handshake(config, store, None, on_ready);
    }

    /// As [`enable_crypto_server`](Socket::enable_crypto_server), letting
    /// `on_client_hello` inspect (and veto) the ClientHello first.
    pub fn enable_crypto_server_with_hook(
        &mut self,
        config: &NetConfig,
        store: Arc<CertStore>,
        on_client_hello: ClientHelloHook,
        on_ready: ReadyCallback,
    ) {
        self.start_server_handshake(config, store, Some(on_client_hello), on_ready);
    }

    fn start_server_handshake(
        &mut self,
        config: &NetConfig,
        store: Arc<CertStore>,
        on_client_hello: Option<ClientHelloHook>,
        on_ready: ReadyCallback,
    ) {
        let mut handshaker = Box::new(Handshaker::new(Role::Server, config.extended_master_secret, on_ready));
        handshaker.cert_store = Some(store);
        handshaker.on_client_hello = on_client_hello;
        self.deadline = Some(Instant::now() + config.handshake_timeout);
        handshaker::resume(self, handshaker, Ok(Step::RecvHandshake));
    }
}

pub(crate) fn step(socket: &mut Socket, hs: &mut Handshaker, event: HandshakeEvent) -> StepResult {
    let state = std::mem::replace(&mut hs.state, HandshakeState::Transition);
    match (state, event) {
        (HandshakeState::AwaitClientHello, HandshakeEvent::Message { handshake_type, raw })
            if handshake_type == HandshakeType::ClientHello as u8 =>
        {
            on_client_hello(socket, hs, body(&raw))
        }
        (HandshakeState::AwaitClientKeyExchange, HandshakeEvent::Message { handshake_type, raw })
            if handshake_type == HandshakeType::ClientKeyExchange as u8 =>
        {
            let encrypted = wire::decode_rsa_client_key_exchange(body(&raw))?;
            let identity = hs
                .identity
                .clone()
                .ok_or(Abort::Alert(AlertDescription::InternalError))?;
            let client_version = hs.client_version;
            let promise = spawn_job(move || identity.decrypt_pre_master_secret(&encrypted, client_version));
            hs.state = HandshakeState::AwaitClientChangeCipherSpec(promise);
            Ok(Step::RecvChangeCipherSpec)
        }
        (HandshakeState::AwaitClientChangeCipherSpec(promise), HandshakeEvent::ChangeCipherSpec) => {
            Handshaker::send_change_cipher_spec(socket)?;
            hs.state = HandshakeState::DecryptingPreMaster(promise.clone());
            Ok(Step::Await(Box::new(promise)))
        }
        (HandshakeState::DecryptingPreMaster(promise), HandshakeEvent::Settled) => {
            let pre_master_secret = promise
                .take()
                .flatten()
                .ok_or(Abort::Drop("Pre-master secret decryption did not complete"))?;
            let suite = hs.negotiated_suite()?;
            hs.derive_master_secret(&pre_master_secret)?;
            let (client_keys, server_keys) = hs.key_block()?;
            socket.tls_recv = Encrypter::new(suite, client_keys);
            socket.tls_send = Encrypter::new(suite, server_keys);
            hs.expected_finished = hs.verify_data(CLIENT_FINISHED)?;
            hs.state = HandshakeState::AwaitClientFinished;
            Ok(Step::RecvHandshake)
        }
        (HandshakeState::AwaitClientFinished, HandshakeEvent::Message { handshake_type, raw })
            if handshake_type == HandshakeType::Finished as u8 =>
        {
            if !constant_time_eq(body(&raw), &hs.expected_finished) {
                return Err(AlertDescription::DecryptError.into());
            }
            let verify_data = hs.verify_data(SERVER_FINISHED)?;
            hs.send_message(socket, HandshakeType::Finished, &verify_data)?;
            Ok(Step::Done)
        }
        (state, HandshakeEvent::Message { handshake_type, .. }) => {
            tracing::debug!(state = state.name(), handshake_type, "Unexpected handshake message");
            Err(AlertDescription::UnexpectedMessage.into())
        }
        (state, _) => {
            tracing::debug!(state = state.name(), "Unexpected handshake event");
            Err(AlertDescription::UnexpectedMessage.into())
        }
    }
}

fn on_client_hello(socket: &mut Socket, hs: &mut Handshaker, body: &[u8]) -> StepResult {
    let hello = ClientHello::decode(body)?;
    if hello.version < VERSION_TLS12 {
        return Err(AlertDescription::ProtocolVersion.into());
    }
    let suite = cipher_suite::select_server_suite(&hello.cipher_suites)
        .ok_or(Abort::Alert(AlertDescription::HandshakeFailure))?;

    let store = hs.cert_store.clone().ok_or(Abort::Alert(AlertDescription::InternalError))?;
    let server_name = hello.server_name().unwrap_or_default();
    let identity = store.find_entry_for_domain(&server_name).ok_or_else(|| {
        tracing::debug!(peer = %socket.describe(), server_name = %server_name, "No identity for requested name");
        Abort::Alert(AlertDescription::UnrecognizedName)
    })?;

    if let Some(hook) = hs.on_client_hello.take() {
        hook(socket, &hello)?;
    }

    hs.suite = Some(suite);
    hs.client_version = hello.version;
    hs.client_random = hello.random;
    hs.server_random = wire::hello_random();
    hs.extended_master_secret =
        hs.offer_extended_master_secret && hello.extensions.contains(extension::EXTENDED_MASTER_SECRET);
    hs.server_name = server_name;

    let mut extensions = Extensions::default();
    if hs.extended_master_secret {
        extensions.add(extension::EXTENDED_MASTER_SECRET, Vec::new());
    }
    let reply = ServerHello {
        version: VERSION_TLS12,
        random: hs.server_random,
        session_id: Vec::new(),
        cipher_suite: suite.id,
        compression_method: 0,
        extensions,
    };
    hs.send_message(socket, HandshakeType::ServerHello, &reply.encode())?;
    hs.send_message(socket, HandshakeType::Certificate, &wire::encode_certificate(&identity.chain))?;
    hs.send_message(socket, HandshakeType::ServerHelloDone, &[])?;
    tracing::trace!(
        peer = %socket.describe(),
        suite = suite.id,
        server_name = %hs.server_name,
        "ServerHello sent"
    );

    hs.identity = Some(identity.clone());
    hs.state = HandshakeState::AwaitClientKeyExchange;
    Ok(Step::RecvHandshake)
}

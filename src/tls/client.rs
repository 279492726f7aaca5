//! Client role of the TLS 1.2 handshake.
//!
//! ```text
//! ClientHello ─▶
//!                ◀─ ServerHello, Certificate, [ServerKeyExchange],
//!                   [CertificateRequest], ServerHelloDone
//! [Certificate(empty)], ClientKeyExchange, CCS, Finished ─▶
//!                ◀─ CCS, Finished
//! ```
//!
//! Chain validation and the ServerKeyExchange signature check run off the
//! scheduler thread; the socket waits on a promise holdup meanwhile.

use std::net::IpAddr;
use std::time::Instant;

use rand::Rng;

use crate::config::NetConfig;
use crate::net::socket::{ReadyCallback, Socket};
use crate::tls::alert::AlertDescription;
use crate::tls::certchain::PeerChain;
use crate::tls::cipher_suite::{self, CipherSuite, KeyExchange};
use crate::tls::encrypter::{constant_time_eq, Encrypter};
use crate::tls::handshaker::{
    self, body, spawn_check, Abort, CheckOutcome, HandshakeEvent, HandshakeState, Handshaker, Role, Step,
    StepResult, CLIENT_FINISHED, SERVER_FINISHED,
};
use crate::tls::key_exchange::{self, SUPPORTED_CURVES};
use crate::tls::wire::{
    self, extension, signature_scheme, ClientHello, Extensions, HandshakeType, ServerHello,
    ServerKeyExchange, VERSION_TLS12,
};

/// Signature schemes advertised in signature_algorithms.
pub const SIGNATURE_SCHEMES: [u16; 6] = [
    signature_scheme::RSA_PKCS1_SHA1,
    signature_scheme::RSA_PKCS1_SHA256,
    signature_scheme::RSA_PKCS1_SHA384,
    signature_scheme::ECDSA_SHA1,
    signature_scheme::ECDSA_SECP256R1_SHA256,
    signature_scheme::ECDSA_SECP384R1_SHA384,
];

impl Socket {
    /// Start a client handshake on a connected socket. `on_ready` runs once
    /// the server's Finished has been verified; on failure the socket is
    /// closed with a close reason instead.
    pub fn enable_crypto_client(&mut self, config: &NetConfig, server_name: &str, on_ready: ReadyCallback) {
        self.enable_crypto_client_with_data(config, server_name, Vec::new(), on_ready);
    }

    /// As [`enable_crypto_client`](Socket::enable_crypto_client), sending
    /// `initial_data` right behind the client Finished without waiting for
    /// the server's.
    pub fn enable_crypto_client_with_data(
        &mut self,
        config: &NetConfig,
        server_name: &str,
        initial_data: Vec<u8>,
        on_ready: ReadyCallback,
    ) {
        let mut handshaker = Box::new(Handshaker::new(Role::Client, config.extended_master_secret, on_ready));
        handshaker.server_name = server_name.to_string();
        handshaker.verifier = Some(config.verifier.clone());
        handshaker.initial_data = initial_data;

        let mut hello = client_hello(server_name, handshaker.offer_extended_master_secret);
        if let Some(suites) = &config.client_suites {
            hello.cipher_suites = suites.clone();
        }
        handshaker.client_random = hello.random;
        handshaker.offered_suites = hello.cipher_suites.clone();

        self.deadline = Some(Instant::now() + config.handshake_timeout);
        tracing::trace!(peer = %self.describe(), server_name, "Sending ClientHello");
        let result = handshaker
            .send_message(self, HandshakeType::ClientHello, &hello.encode())
            .map(|()| Step::RecvHandshake);
        handshaker::resume(self, handshaker, result);
    }
}

fn client_hello(server_name: &str, offer_extended_master_secret: bool) -> ClientHello {
    let mut rng = rand::thread_rng();
    let mut extensions = Extensions::default();
    // SNI carries host names only, never address literals.
    if !server_name.is_empty() && server_name.parse::<IpAddr>().is_err() {
        extensions.add(extension::SERVER_NAME, wire::encode_server_name(server_name));
    }
    extensions.add(extension::ELLIPTIC_CURVES, wire::encode_u16_vector(&SUPPORTED_CURVES));
    if rng.gen_bool(0.5) {
        extensions.add(extension::EC_POINT_FORMATS, vec![1, 0]);
    }
    extensions.add(extension::SIGNATURE_ALGORITHMS, wire::encode_u16_vector(&SIGNATURE_SCHEMES));
    if offer_extended_master_secret {
        extensions.add(extension::EXTENDED_MASTER_SECRET, Vec::new());
    }
    if rng.gen_bool(0.5) {
        extensions.add(extension::SUPPORTED_VERSIONS, vec![2, 3, 3]);
    }
    ClientHello {
        version: VERSION_TLS12,
        random: wire::hello_random(),
        session_id: Vec::new(),
        cipher_suites: cipher_suite::client_offer(),
        compression_methods: vec![0],
        extensions,
    }
}

pub(crate) fn step(socket: &mut Socket, hs: &mut Handshaker, event: HandshakeEvent) -> StepResult {
    let state = std::mem::replace(&mut hs.state, HandshakeState::Transition);
    match (state, event) {
        (HandshakeState::AwaitServerHello, HandshakeEvent::Message { handshake_type, raw })
            if handshake_type == HandshakeType::ServerHello as u8 =>
        {
            on_server_hello(hs, body(&raw))
        }
        (HandshakeState::AwaitCertificate, HandshakeEvent::Message { handshake_type, raw })
            if handshake_type == HandshakeType::Certificate as u8 =>
        {
            on_certificate(hs, body(&raw))
        }
        (HandshakeState::ValidatingChain(promise), HandshakeEvent::Settled) => match promise.take() {
            Some(CheckOutcome::Passed) => {
                let suite = hs.negotiated_suite()?;
                hs.state = if suite.is_ecdhe() {
                    HandshakeState::AwaitServerKeyExchange
                } else {
                    HandshakeState::AwaitServerHelloDone {
                        certificate_requested: false,
                    }
                };
                Ok(Step::RecvHandshake)
            }
            Some(CheckOutcome::Failed(reason)) => {
                tracing::debug!(peer = %socket.describe(), reason = %reason, "Server certificate rejected");
                socket.close_reason = Some(format!("Certificate validation failed: {reason}"));
                Err(AlertDescription::BadCertificate.into())
            }
            Some(CheckOutcome::Panicked) | None => Err(Abort::Drop("Certificate validation did not complete")),
        },
        (HandshakeState::AwaitServerKeyExchange, HandshakeEvent::Message { handshake_type, raw })
            if handshake_type == HandshakeType::ServerKeyExchange as u8 =>
        {
            on_server_key_exchange(hs, body(&raw))
        }
        (HandshakeState::VerifyingSignature(promise, params), HandshakeEvent::Settled) => match promise.take() {
            Some(CheckOutcome::Passed) => {
                hs.server_params = Some(params);
                hs.state = HandshakeState::AwaitServerHelloDone {
                    certificate_requested: false,
                };
                Ok(Step::RecvHandshake)
            }
            Some(CheckOutcome::Failed(reason)) => {
                tracing::debug!(peer = %socket.describe(), reason = %reason, "ServerKeyExchange signature rejected");
                Err(AlertDescription::DecryptError.into())
            }
            Some(CheckOutcome::Panicked) | None => Err(Abort::Drop("Signature check did not complete")),
        },
        (HandshakeState::AwaitServerHelloDone { .. }, HandshakeEvent::Message { handshake_type, .. })
            if handshake_type == HandshakeType::CertificateRequest as u8 =>
        {
            hs.state = HandshakeState::AwaitServerHelloDone {
                certificate_requested: true,
            };
            Ok(Step::RecvHandshake)
        }
        (
            HandshakeState::AwaitServerHelloDone { certificate_requested },
            HandshakeEvent::Message { handshake_type, raw },
        ) if handshake_type == HandshakeType::ServerHelloDone as u8 => {
            if !body(&raw).is_empty() {
                return Err(AlertDescription::DecodeError.into());
            }
            on_server_hello_done(socket, hs, certificate_requested)
        }
        (HandshakeState::AwaitServerChangeCipherSpec, HandshakeEvent::ChangeCipherSpec) => {
            let pending = hs.pending_recv.take().ok_or(Abort::Alert(AlertDescription::InternalError))?;
            socket.tls_recv = pending;
            hs.expected_finished = hs.verify_data(SERVER_FINISHED)?;
            hs.state = HandshakeState::AwaitServerFinished;
            Ok(Step::RecvHandshake)
        }
        (HandshakeState::AwaitServerFinished, HandshakeEvent::Message { handshake_type, raw })
            if handshake_type == HandshakeType::Finished as u8 =>
        {
            if !constant_time_eq(body(&raw), &hs.expected_finished) {
                return Err(AlertDescription::DecryptError.into());
            }
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

fn on_server_hello(hs: &mut Handshaker, body: &[u8]) -> StepResult {
    let hello = ServerHello::decode(body)?;
    if hello.version != VERSION_TLS12 {
        return Err(AlertDescription::ProtocolVersion.into());
    }
    if !hs.offered_suites.contains(&hello.cipher_suite) || hello.compression_method != 0 {
        return Err(AlertDescription::IllegalParameter.into());
    }
    let suite = CipherSuite::from_id(hello.cipher_suite).ok_or(Abort::Alert(AlertDescription::IllegalParameter))?;
    hs.suite = Some(suite);
    hs.server_random = hello.random;
    hs.extended_master_secret =
        hs.offer_extended_master_secret && hello.extensions.contains(extension::EXTENDED_MASTER_SECRET);
    tracing::trace!(
        suite = suite.id,
        extended_master_secret = hs.extended_master_secret,
        "ServerHello accepted"
    );
    hs.state = HandshakeState::AwaitCertificate;
    Ok(Step::RecvHandshake)
}

fn on_certificate(hs: &mut Handshaker, body: &[u8]) -> StepResult {
    let certs = wire::decode_certificate(body)?;
    let chain = PeerChain::from_der(certs).map_err(|err| {
        tracing::debug!(error = %err, "Unusable server certificate");
        AlertDescription::BadCertificate
    })?;
    let verifier = hs.verifier.clone().ok_or(Abort::Alert(AlertDescription::InternalError))?;
    let domain = hs.server_name.clone();
    let job_chain = chain.clone();
    let promise = spawn_check(move || verifier.verify(&job_chain, &domain).map_err(|err| err.to_string()));
    hs.peer_chain = Some(chain);
    hs.state = HandshakeState::ValidatingChain(promise.clone());
    Ok(Step::Await(Box::new(promise)))
}

fn on_server_key_exchange(hs: &mut Handshaker, body: &[u8]) -> StepResult {
    let suite = hs.negotiated_suite()?;
    let exchange = ServerKeyExchange::decode(body)?;
    let leaf_key = hs
        .peer_chain
        .as_ref()
        .map(|chain| chain.leaf_key.clone())
        .ok_or(Abort::Alert(AlertDescription::InternalError))?;

    let key_fits_suite = match suite.key_exchange {
        KeyExchange::EcdheRsa => leaf_key.is_rsa(),
        KeyExchange::EcdheEcdsa => leaf_key.is_ec(),
        KeyExchange::Rsa => false,
    };
    if !key_fits_suite || !leaf_key.accepts_scheme(exchange.signature_scheme) {
        return Err(AlertDescription::IllegalParameter.into());
    }
    key_exchange::check_server_params(&exchange.params)?;

    let mut signed = Vec::with_capacity(64 + exchange.params.point.len() + 4);
    signed.extend_from_slice(&hs.client_random);
    signed.extend_from_slice(&hs.server_random);
    signed.extend_from_slice(&exchange.params.encode());
    let scheme = exchange.signature_scheme;
    let signature = exchange.signature;
    let promise = spawn_check(move || {
        if leaf_key.verify(scheme, &signed, &signature) {
            Ok(())
        } else {
            Err(format!("signature scheme {scheme:#06x} did not verify"))
        }
    });
    hs.state = HandshakeState::VerifyingSignature(promise.clone(), exchange.params);
    Ok(Step::Await(Box::new(promise)))
}

fn on_server_hello_done(socket: &mut Socket, hs: &mut Handshaker, certificate_requested: bool) -> StepResult {
    let suite = hs.negotiated_suite()?;
    if certificate_requested {
        hs.send_message(socket, HandshakeType::Certificate, &wire::encode_certificate(&[]))?;
    }

    let exchange = match suite.key_exchange {
        KeyExchange::Rsa => {
            let chain = hs.peer_chain.as_ref().ok_or(Abort::Alert(AlertDescription::InternalError))?;
            key_exchange::rsa_transport(&chain.leaf_key)?
        }
        KeyExchange::EcdheRsa | KeyExchange::EcdheEcdsa => {
            let params = hs
                .server_params
                .as_ref()
                .ok_or(Abort::Alert(AlertDescription::InternalError))?;
            key_exchange::ecdhe(params)?
        }
    };
    hs.send_message(socket, HandshakeType::ClientKeyExchange, &exchange.message)?;
    hs.derive_master_secret(&exchange.pre_master_secret)?;

    Handshaker::send_change_cipher_spec(socket)?;
    let (client_keys, server_keys) = hs.key_block()?;
    socket.tls_send = Encrypter::new(suite, client_keys);
    hs.pending_recv = Some(Encrypter::new(suite, server_keys));

    let verify_data = hs.verify_data(CLIENT_FINISHED)?;
    hs.send_message(socket, HandshakeType::Finished, &verify_data)?;

    if !hs.initial_data.is_empty() {
        let data = std::mem::take(&mut hs.initial_data);
        socket
            .send(&data)
            .map_err(|_| Abort::Drop("Connection lost during TLS handshake"))?;
    }
    hs.state = HandshakeState::AwaitServerChangeCipherSpec;
    Ok(Step::RecvChangeCipherSpec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cipher_suite::is_grease;

    #[test]
    fn hello_carries_expected_extensions() {
        let hello = client_hello("example.com", true);
        assert_eq!(hello.version, VERSION_TLS12);
        assert_eq!(hello.compression_methods, vec![0]);
        assert!(hello.session_id.is_empty());
        assert_eq!(hello.server_name().as_deref(), Some("example.com"));
        assert!(hello.extensions.contains(extension::EXTENDED_MASTER_SECRET));
        assert_eq!(
            hello.extensions.get(extension::SIGNATURE_ALGORITHMS),
            Some(wire::encode_u16_vector(&SIGNATURE_SCHEMES).as_slice())
        );
        assert_eq!(hello.cipher_suites.iter().filter(|id| is_grease(**id)).count(), 1);
    }

    #[test]
    fn address_literal_gets_no_sni() {
        let hello = client_hello("127.0.0.1", false);
        assert!(!hello.extensions.contains(extension::SERVER_NAME));
        assert!(!hello.extensions.contains(extension::EXTENDED_MASTER_SECRET));
    }

    #[test]
    fn optional_extensions_are_well_formed() {
        for _ in 0..32 {
            let hello = client_hello("example.com", true);
            if let Some(formats) = hello.extensions.get(extension::EC_POINT_FORMATS) {
                assert_eq!(formats, &[1, 0]);
            }
            if let Some(versions) = hello.extensions.get(extension::SUPPORTED_VERSIONS) {
                assert_eq!(versions, &[2, 3, 3]);
            }
        }
    }

    fn awaiting_server_hello() -> Handshaker {
        let mut hs = Handshaker::new(Role::Client, true, Box::new(|_| {}));
        hs.offered_suites = vec![cipher_suite::TLS_RSA_WITH_AES_128_CBC_SHA];
        hs
    }

    fn server_hello(version: u16, suite: u16) -> Vec<u8> {
        let mut extensions = Extensions::default();
        extensions.add(extension::EXTENDED_MASTER_SECRET, Vec::new());
        ServerHello {
            version,
            random: [5; 32],
            session_id: Vec::new(),
            cipher_suite: suite,
            compression_method: 0,
            extensions,
        }
        .encode()
    }

    #[test]
    fn server_hello_is_checked() {
        let mut hs = awaiting_server_hello();
        let err = on_server_hello(&mut hs, &server_hello(0x0302, cipher_suite::TLS_RSA_WITH_AES_128_CBC_SHA));
        assert_eq!(err.err(), Some(Abort::Alert(AlertDescription::ProtocolVersion)));

        let mut hs = awaiting_server_hello();
        let err = on_server_hello(&mut hs, &server_hello(VERSION_TLS12, cipher_suite::TLS_RSA_WITH_AES_256_CBC_SHA));
        assert_eq!(err.err(), Some(Abort::Alert(AlertDescription::IllegalParameter)));

        let mut hs = awaiting_server_hello();
        assert!(on_server_hello(&mut hs, &server_hello(VERSION_TLS12, cipher_suite::TLS_RSA_WITH_AES_128_CBC_SHA)).is_ok());
        assert_eq!(hs.server_random, [5; 32]);
        assert!(hs.extended_master_secret);
        assert!(matches!(hs.state, HandshakeState::AwaitCertificate));
    }
}

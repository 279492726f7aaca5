//! Handshake driver shared by both roles.
//!
//! # Responsibilities
//! - Hold everything negotiated so far: randoms, suite, transcript, master
//!   secret, the peer's chain and the keys waiting for ChangeCipherSpec
//! - Feed each received message, ChangeCipherSpec or settled promise into
//!   the role's state machine through one entry point, [`advance`]
//! - Turn the step's answer into the next receive, a promise holdup, the
//!   ready callback or an abort
//!
//! # Design Decisions
//! - The state is a tagged union; states waiting on off-thread work carry
//!   the promise they wait for
//! - While a step runs the handshaker is taken out of the socket, so a
//!   socket closed underneath it (timeout, transport error) is noticed
//!   when the step returns
//! - CPU-heavy checks (chain validation, signature verification, RSA
//!   decryption) run on detached threads under `catch_unwind`
//!
//! # Data Flow
//! ```text
//! record layer ──message / CCS──▶ advance ──▶ client::step | server::step
//!                                   ▲                 │
//!                 promise settled ──┘                 ▼
//!                                   RecvHandshake | RecvChangeCipherSpec
//!                                   Await(promise) | Done | Abort
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use rsa::RsaPrivateKey;

use crate::net::socket::{ReadyCallback, Socket};
use crate::observability::metrics;
use crate::sched::worker::Settle;
use crate::sched::Promise;
use crate::tls::alert::AlertDescription;
use crate::tls::cert_store::{CertStore, CertStoreEntry};
use crate::tls::certchain::{CertchainVerifier, PeerChain};
use crate::tls::cipher_suite::CipherSuite;
use crate::tls::encrypter::{DirectionKeys, Encrypter};
use crate::tls::prf::{prf, transcript_hash};
use crate::tls::wire::{
    self, ClientHello, ContentType, EcdhParams, HandshakeType, HANDSHAKE_HEADER_LEN, MAX_FRAGMENT_LEN,
};
use crate::tls::{client, server};

pub const MASTER_SECRET_LEN: usize = 48;
pub const VERIFY_DATA_LEN: usize = 12;

pub const CLIENT_FINISHED: &[u8] = b"client finished";
pub const SERVER_FINISHED: &[u8] = b"server finished";

/// Inspects the ClientHello before the server answers it. Returning an
/// alert aborts the handshake with that alert.
pub type ClientHelloHook = Box<dyn FnOnce(&mut Socket, &ClientHello) -> Result<(), AlertDescription> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// Result of an off-thread check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed,
    Failed(String),
    Panicked,
}

pub(crate) enum HandshakeState {
    AwaitServerHello,
    AwaitCertificate,
    ValidatingChain(Promise<CheckOutcome>),
    AwaitServerKeyExchange,
    VerifyingSignature(Promise<CheckOutcome>, EcdhParams),
    AwaitServerHelloDone { certificate_requested: bool },
    AwaitServerChangeCipherSpec,
    AwaitServerFinished,

    AwaitClientHello,
    AwaitClientKeyExchange,
    AwaitClientChangeCipherSpec(Promise<Option<Vec<u8>>>),
    DecryptingPreMaster(Promise<Option<Vec<u8>>>),
    AwaitClientFinished,

    /// Placeholder while a step owns the previous state.
    Transition,
}

impl HandshakeState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            HandshakeState::AwaitServerHello => "await_server_hello",
            HandshakeState::AwaitCertificate => "await_certificate",
            HandshakeState::ValidatingChain(_) => "validating_chain",
            HandshakeState::AwaitServerKeyExchange => "await_server_key_exchange",
            HandshakeState::VerifyingSignature(..) => "verifying_signature",
            HandshakeState::AwaitServerHelloDone { .. } => "await_server_hello_done",
            HandshakeState::AwaitServerChangeCipherSpec => "await_server_change_cipher_spec",
            HandshakeState::AwaitServerFinished => "await_server_finished",
            HandshakeState::AwaitClientHello => "await_client_hello",
            HandshakeState::AwaitClientKeyExchange => "await_client_key_exchange",
            HandshakeState::AwaitClientChangeCipherSpec(_) => "await_client_change_cipher_spec",
            HandshakeState::DecryptingPreMaster(_) => "decrypting_pre_master",
            HandshakeState::AwaitClientFinished => "await_client_finished",
            HandshakeState::Transition => "transition",
        }
    }
}

/// What woke the handshake up.
pub(crate) enum HandshakeEvent {
    /// A complete handshake message, header included.
    Message { handshake_type: u8, raw: Vec<u8> },
    ChangeCipherSpec,
    /// The promise the current state waits on has been fulfilled.
    Settled,
}

/// What a step wants next.
pub(crate) enum Step {
    RecvHandshake,
    RecvChangeCipherSpec,
    Await(Box<dyn Settle>),
    Done,
}

/// Why a step gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Abort {
    /// Protocol failure: send the alert and close.
    Alert(AlertDescription),
    /// Local failure (no thread, lost connection): close without an alert.
    Drop(&'static str),
}

impl From<AlertDescription> for Abort {
    fn from(desc: AlertDescription) -> Self {
        Abort::Alert(desc)
    }
}

pub(crate) type StepResult = Result<Step, Abort>;

pub struct Handshaker {
    pub(crate) role: Role,
    pub(crate) state: HandshakeState,
    pub(crate) suite: Option<CipherSuite>,
    pub(crate) client_random: [u8; 32],
    pub(crate) server_random: [u8; 32],
    pub(crate) transcript: Vec<u8>,
    pub(crate) master_secret: Vec<u8>,
    /// Whether extended_master_secret was negotiated.
    pub(crate) extended_master_secret: bool,
    /// Whether we are willing to use it.
    pub(crate) offer_extended_master_secret: bool,
    pub(crate) expected_finished: Vec<u8>,
    pub(crate) on_ready: Option<ReadyCallback>,
    started: Instant,

    // client
    pub(crate) server_name: String,
    pub(crate) offered_suites: Vec<u16>,
    pub(crate) verifier: Option<Arc<dyn CertchainVerifier>>,
    pub(crate) peer_chain: Option<PeerChain>,
    pub(crate) server_params: Option<EcdhParams>,
    pub(crate) pending_recv: Option<Encrypter>,
    pub(crate) initial_data: Vec<u8>,

    // server
    pub(crate) cert_store: Option<Arc<CertStore>>,
    pub(crate) identity: Option<CertStoreEntry>,
    pub(crate) on_client_hello: Option<ClientHelloHook>,
    /// Version from the ClientHello; leads the RSA pre-master secret.
    pub(crate) client_version: u16,
}

impl Handshaker {
    pub(crate) fn new(role: Role, offer_extended_master_secret: bool, on_ready: ReadyCallback) -> Self {
        let state = match role {
            Role::Client => HandshakeState::AwaitServerHello,
            Role::Server => HandshakeState::AwaitClientHello,
        };
        Self {
            role,
            state,
            suite: None,
            client_random: [0; 32],
            server_random: [0; 32],
            transcript: Vec::new(),
            master_secret: Vec::new(),
            extended_master_secret: false,
            offer_extended_master_secret,
            expected_finished: Vec::new(),
            on_ready: Some(on_ready),
            started: Instant::now(),
            server_name: String::new(),
            offered_suites: Vec::new(),
            verifier: None,
            peer_chain: None,
            server_params: None,
            pending_recv: None,
            initial_data: Vec::new(),
            cert_store: None,
            identity: None,
            on_client_hello: None,
            client_version: wire::VERSION_TLS12,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Count a finished handshake.
    pub fn record_outcome(&self, outcome: &'static str) {
        metrics::handshake_finished(self.role.as_str(), outcome);
    }

    pub(crate) fn negotiated_suite(&self) -> Result<CipherSuite, Abort> {
        self.suite.ok_or(Abort::Alert(AlertDescription::InternalError))
    }

    /// Frame a handshake message, add it to the transcript and send it,
    /// split over as many records as it needs.
    pub(crate) fn send_message(
        &mut self,
        socket: &mut Socket,
        handshake_type: HandshakeType,
        body: &[u8],
    ) -> Result<(), Abort> {
        let message = wire::encode_handshake(handshake_type, body);
        self.transcript.extend_from_slice(&message);
        for fragment in message.chunks(MAX_FRAGMENT_LEN) {
            socket
                .tls_send_record(ContentType::Handshake, fragment)
                .map_err(|_| Abort::Drop("Connection lost during TLS handshake"))?;
        }
        Ok(())
    }

    pub(crate) fn send_change_cipher_spec(socket: &mut Socket) -> Result<(), Abort> {
        socket
            .tls_send_record(ContentType::ChangeCipherSpec, &[1])
            .map_err(|_| Abort::Drop("Connection lost during TLS handshake"))
    }

    /// Derive the master secret from the pre-master secret. With the
    /// extended master secret the seed is the transcript hash up to and
    /// including ClientKeyExchange.
    pub(crate) fn derive_master_secret(&mut self, pre_master_secret: &[u8]) -> Result<(), Abort> {
        let suite = self.negotiated_suite()?;
        self.master_secret = if self.extended_master_secret {
            let session_hash = transcript_hash(suite.prf, &self.transcript);
            prf(suite.prf, pre_master_secret, b"extended master secret", &session_hash, MASTER_SECRET_LEN)
        } else {
            let mut seed = Vec::with_capacity(64);
            seed.extend_from_slice(&self.client_random);
            seed.extend_from_slice(&self.server_random);
            prf(suite.prf, pre_master_secret, b"master secret", &seed, MASTER_SECRET_LEN)
        };
        Ok(())
    }

    /// Expand the master secret into `(client_write, server_write)` keys.
    pub(crate) fn key_block(&self) -> Result<(DirectionKeys, DirectionKeys), Abort> {
        let suite = self.negotiated_suite()?;
        let mut seed = Vec::with_capacity(64);
        seed.extend_from_slice(&self.server_random);
        seed.extend_from_slice(&self.client_random);
        let block = prf(suite.prf, &self.master_secret, b"key expansion", &seed, suite.key_block_len());

        let mut rest = block.as_slice();
        let mut take = |n: usize| -> Vec<u8> {
            let (head, tail) = rest.split_at(n);
            rest = tail;
            head.to_vec()
        };
        let client_mac = take(suite.mac_key_len());
        let server_mac = take(suite.mac_key_len());
        let client_key = take(suite.enc_key_len());
        let server_key = take(suite.enc_key_len());
        let client_iv = take(suite.fixed_iv_len());
        let server_iv = take(suite.fixed_iv_len());
        Ok((
            DirectionKeys {
                mac_key: client_mac,
                cipher_key: client_key,
                implicit_iv: client_iv,
            },
            DirectionKeys {
                mac_key: server_mac,
                cipher_key: server_key,
                implicit_iv: server_iv,
            },
        ))
    }

    /// Finished verify_data over the transcript so far.
    pub(crate) fn verify_data(&self, label: &[u8]) -> Result<Vec<u8>, Abort> {
        let suite = self.negotiated_suite()?;
        let hash = transcript_hash(suite.prf, &self.transcript);
        Ok(prf(suite.prf, &self.master_secret, label, &hash, VERIFY_DATA_LEN))
    }
}

/// Run `job` on a detached thread. A panic inside the job, or a thread
/// that cannot be spawned, settles the promise as [`CheckOutcome::Panicked`].
pub(crate) fn spawn_check<F>(job: F) -> Promise<CheckOutcome>
where
    F: FnOnce() -> Result<(), String> + Send + 'static,
{
    let promise = Promise::new();
    let spawned = promise.fulfil_off_thread(move || match panic::catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => CheckOutcome::Passed,
        Ok(Err(reason)) => CheckOutcome::Failed(reason),
        Err(_) => CheckOutcome::Panicked,
    });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "Could not spawn handshake check");
        promise.fulfil(CheckOutcome::Panicked);
    }
    promise
}

/// Like [`spawn_check`] for jobs producing a value; `None` on panic.
pub(crate) fn spawn_job<T, F>(job: F) -> Promise<Option<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let promise = Promise::new();
    let spawned = promise.fulfil_off_thread(move || panic::catch_unwind(AssertUnwindSafe(job)).ok());
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "Could not spawn handshake job");
        promise.fulfil(None);
    }
    promise
}

/// Body of a handshake message.
pub(crate) fn body(raw: &[u8]) -> &[u8] {
    raw.get(HANDSHAKE_HEADER_LEN..).unwrap_or(&[])
}

/// Feed one event into the socket's handshake.
pub(crate) fn advance(socket: &mut Socket, event: HandshakeEvent) {
    let Some(mut handshaker) = socket.handshaker.take() else {
        return;
    };
    if !socket.has_connection() {
        handshaker.record_outcome("failed");
        return;
    }
    if let HandshakeEvent::Message { raw, .. } = &event {
        handshaker.transcript.extend_from_slice(raw);
    }
    let result = match handshaker.role {
        Role::Client => client::step(socket, &mut handshaker, event),
        Role::Server => server::step(socket, &mut handshaker, event),
    };
    resume(socket, handshaker, result);
}

/// Act on a step's answer.
pub(crate) fn resume(socket: &mut Socket, mut handshaker: Box<Handshaker>, result: StepResult) {
    if result.is_ok() && !socket.has_connection() {
        handshaker.record_outcome("failed");
        return;
    }
    match result {
        Ok(Step::RecvHandshake) => {
            socket.handshaker = Some(handshaker);
            socket.tls_recv_handshake(Box::new(|s: &mut Socket, handshake_type: u8, raw: Vec<u8>| {
                advance(s, HandshakeEvent::Message { handshake_type, raw });
            }));
        }
        Ok(Step::RecvChangeCipherSpec) => {
            socket.handshaker = Some(handshaker);
            socket.tls_recv_record(
                ContentType::ChangeCipherSpec,
                Box::new(|s: &mut Socket, body: Vec<u8>| {
                    if body.is_empty() {
                        return;
                    }
                    if body != [1] {
                        return s.tls_close(AlertDescription::DecodeError);
                    }
                    advance(s, HandshakeEvent::ChangeCipherSpec);
                }),
            );
        }
        Ok(Step::Await(probe)) => {
            socket.handshaker = Some(handshaker);
            socket
                .holdup
                .set_promise(probe, Box::new(|s: &mut Socket| advance(s, HandshakeEvent::Settled)));
        }
        Ok(Step::Done) => {
            socket.deadline = None;
            socket.handshake_carry.clear();
            handshaker.record_outcome("ok");
            tracing::debug!(
                peer = %socket.describe(),
                role = handshaker.role.as_str(),
                suite = handshaker.suite.map(|s| s.id),
                extended_master_secret = handshaker.extended_master_secret,
                elapsed_ms = handshaker.started.elapsed().as_millis() as u64,
                "TLS handshake complete"
            );
            if let Some(on_ready) = handshaker.on_ready.take() {
                on_ready(socket);
            }
        }
        Err(Abort::Alert(desc)) => {
            tracing::debug!(
                peer = %socket.describe(),
                role = handshaker.role.as_str(),
                state = handshaker.state.name(),
                alert = ?desc,
                "TLS handshake failed"
            );
            handshaker.record_outcome("failed");
            socket.tls_close(desc);
        }
        Err(Abort::Drop(reason)) => {
            tracing::warn!(peer = %socket.describe(), role = handshaker.role.as_str(), reason, "TLS handshake dropped");
            handshaker.record_outcome("failed");
            if socket.close_reason.is_none() {
                socket.close_reason = Some(reason.to_string());
            }
            socket.tls_send.reset();
            socket.tls_recv.reset();
            socket.handshake_carry.clear();
            socket.deadline = None;
            socket.transport_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::cipher_suite::{TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256, TLS_RSA_WITH_AES_256_CBC_SHA256};

    fn handshaker(suite: u16) -> Handshaker {
        let mut hs = Handshaker::new(Role::Client, true, Box::new(|_| {}));
        hs.suite = CipherSuite::from_id(suite);
        hs.client_random = [1; 32];
        hs.server_random = [2; 32];
        hs
    }

    #[test]
    fn key_block_is_split_per_direction() {
        let mut hs = handshaker(TLS_RSA_WITH_AES_256_CBC_SHA256);
        hs.derive_master_secret(&[7; 48]).unwrap();
        let (client, server) = hs.key_block().unwrap();
        assert_eq!(client.mac_key.len(), 32);
        assert_eq!(client.cipher_key.len(), 32);
        assert!(client.implicit_iv.is_empty());
        assert_ne!(client.mac_key, server.mac_key);
        assert_ne!(client.cipher_key, server.cipher_key);

        let gcm = {
            let mut hs = handshaker(TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256);
            hs.derive_master_secret(&[7; 32]).unwrap();
            hs.key_block().unwrap()
        };
        assert!(gcm.0.mac_key.is_empty());
        assert_eq!(gcm.0.cipher_key.len(), 16);
        assert_eq!(gcm.0.implicit_iv.len(), 4);
    }

    #[test]
    fn extended_master_secret_depends_on_transcript() {
        let mut a = handshaker(TLS_RSA_WITH_AES_256_CBC_SHA256);
        a.extended_master_secret = true;
        a.transcript = b"first".to_vec();
        a.derive_master_secret(&[7; 48]).unwrap();

        let mut b = handshaker(TLS_RSA_WITH_AES_256_CBC_SHA256);
        b.extended_master_secret = true;
        b.transcript = b"second".to_vec();
        b.derive_master_secret(&[7; 48]).unwrap();

        let mut classic = handshaker(TLS_RSA_WITH_AES_256_CBC_SHA256);
        classic.transcript = b"first".to_vec();
        classic.derive_master_secret(&[7; 48]).unwrap();

        assert_eq!(a.master_secret.len(), MASTER_SECRET_LEN);
        assert_ne!(a.master_secret, b.master_secret);
        assert_ne!(a.master_secret, classic.master_secret);
    }

    #[test]
    fn finished_labels_differ() {
        let mut hs = handshaker(TLS_RSA_WITH_AES_256_CBC_SHA256);
        hs.derive_master_secret(&[7; 48]).unwrap();
        hs.transcript = b"hello".to_vec();
        let client = hs.verify_data(CLIENT_FINISHED).unwrap();
        let server = hs.verify_data(SERVER_FINISHED).unwrap();
        assert_eq!(client.len(), VERIFY_DATA_LEN);
        assert_ne!(client, server);
    }

    #[test]
    fn missing_suite_is_internal_error() {
        let hs = Handshaker::new(Role::Server, false, Box::new(|_| {}));
        assert_eq!(hs.key_block().err(), Some(Abort::Alert(AlertDescription::InternalError)));
    }

    #[test]
    fn panicking_check_is_reported() {
        let promise = spawn_check(|| panic!("boom"));
        promise.await_fulfilment();
        assert_eq!(promise.take(), Some(CheckOutcome::Panicked));

        let promise = spawn_check(|| Err("bad chain".to_string()));
        promise.await_fulfilment();
        assert_eq!(promise.take(), Some(CheckOutcome::Failed("bad chain".to_string())));

        let promise = spawn_job(|| 5u8);
        promise.await_fulfilment();
        assert_eq!(promise.take(), Some(Some(5)));
    }

    #[test]
    fn large_message_spans_records() {
        use std::io::Read;
        use std::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let mut socket = Socket::from_stream(listener.accept().unwrap().0).unwrap();

        let mut hs = handshaker(TLS_RSA_WITH_AES_256_CBC_SHA256);
        let body = vec![0xAB; 40_000];
        hs.send_message(&mut socket, HandshakeType::Certificate, &body).unwrap();
        let expected = wire::encode_handshake(HandshakeType::Certificate, &body);
        assert_eq!(hs.transcript, expected);

        let mut received = Vec::new();
        let mut records = 0;
        while received.len() < expected.len() {
            let mut header = [0u8; wire::RECORD_HEADER_LEN];
            peer.read_exact(&mut header).unwrap();
            let header = wire::RecordHeader::decode(&header).unwrap();
            assert_eq!(header.content_type, ContentType::Handshake);
            assert!(header.length as usize <= MAX_FRAGMENT_LEN);
            let mut fragment = vec![0u8; header.length as usize];
            peer.read_exact(&mut fragment).unwrap();
            received.extend_from_slice(&fragment);
            records += 1;
        }
        assert_eq!(records, 3);
        assert_eq!(received, expected);
    }
}

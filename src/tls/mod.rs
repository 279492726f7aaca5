//! TLS 1.2 on top of [`Socket`](crate::net::Socket).
//!
//! # Data Flow
//! ```text
//! enable_crypto_client / enable_crypto_server
//!     → handshaker.rs (state machine, key schedule)
//!         → client.rs | server.rs (per-role steps)
//!         → key_exchange.rs, certchain.rs, cert_store.rs
//!     → record.rs (framing, alerts)
//!         → encrypter.rs (CBC + HMAC or GCM, per-direction sequence)
//!         → wire.rs (message codecs)
//! ```
//!
//! # Design Decisions
//! - No session resumption, renegotiation or client certificates
//! - The server speaks RSA key transport only; the client also speaks
//!   ECDHE with RSA and ECDSA certificates
//! - Protocol failures are [`AlertDescription`] values end to end

pub mod alert;
pub mod cert_store;
pub mod certchain;
pub mod cipher_suite;
pub mod client;
pub mod encrypter;
pub mod handshaker;
pub mod key_exchange;
pub mod prf;
pub mod record;
pub mod server;
pub mod wire;

pub use alert::AlertDescription;
pub use cert_store::CertStore;
pub use certchain::{AcceptAnyCertchain, CertchainVerifier, PeerChain, TrustStore};
pub use cipher_suite::CipherSuite;
pub use handshaker::{ClientHelloHook, Role};

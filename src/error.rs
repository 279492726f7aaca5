//! Error types shared across the reactor and socket layers.
//!
//! TLS protocol failures are not errors in this sense: they are reported to
//! the peer as an [`AlertDescription`](crate::tls::AlertDescription) and the
//! socket is closed. The types here cover everything that can fail before a
//! socket exists or outside of a protocol exchange.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while establishing connections.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("no DNS results for {0}")]
    NoDnsResults(String),

    #[error("DNS lookup for {host} failed: {source}")]
    DnsLookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} timed out after {timeout_ms} ms")]
    ConnectTimeout { addr: SocketAddr, timeout_ms: u64 },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("socket has no connection")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while parsing or validating certificates.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("certificate chain is empty")]
    EmptyChain,

    #[error("unsupported public key in leaf certificate")]
    UnsupportedKey,

    #[error("certificate is not valid for {0}")]
    DomainMismatch(String),

    #[error("certificate is outside its validity period")]
    Expired,

    #[error("certificate chain does not lead to a trusted root")]
    UntrustedRoot,

    #[error("{0} is not allowed to issue this chain")]
    InvalidIssuer(String),

    #[error("private key could not be loaded: {0}")]
    PrivateKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

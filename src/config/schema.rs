//! Configuration schema definitions.
//!
//! This module defines the on-disk configuration structure. All types
//! derive Serde traits for deserialization from TOML files, and every
//! field has a default so a minimal file (or none at all) is valid.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ReactorConfig {
    /// Outbound connection settings.
    pub connect: ConnectConfig,

    /// TLS client and handshake settings.
    pub tls: TlsConfig,

    /// Reactor loop tuning.
    pub scheduler: SchedulerConfig,

    /// TLS server identities (used by `serve`).
    pub server: ServerConfig,

    /// Log filter.
    pub logging: LoggingConfig,
}

/// Outbound connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Time allowed for a TCP connect to complete.
    pub timeout_ms: u64,

    /// Time a send may wait for the socket to drain.
    pub send_timeout_ms: u64,

    /// Try AAAA records before A records.
    pub prefer_ipv6: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            send_timeout_ms: 3_000,
            prefer_ipv6: false,
        }
    }
}

/// TLS settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Time allowed for a handshake to complete.
    pub handshake_timeout_ms: u64,

    /// Validate server certificate chains. Disabling accepts any chain.
    pub verify_certificates: bool,

    /// PEM files holding trusted root certificates.
    pub trust_roots: Vec<String>,

    /// Offer the extended master secret extension.
    pub extended_master_secret: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 30_000,
            verify_certificates: true,
            trust_roots: Vec::new(),
            extended_master_secret: true,
        }
    }
}

/// Reactor loop tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on a blocking poll when only sockets are waiting.
    pub poll_timeout_ms: u64,

    /// Sleep between ticks when non-socket work is pending.
    pub idle_sleep_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 50,
            idle_sleep_ms: 1,
        }
    }
}

/// TLS server settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on.
    pub port: u16,

    /// Certificate/key pairs, selected by SNI.
    pub identities: Vec<IdentityConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4433,
            identities: Vec::new(),
        }
    }
}

/// One server identity.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdentityConfig {
    /// PEM certificate chain, leaf first.
    pub cert_path: String,

    /// PEM RSA private key (PKCS#1 or PKCS#8).
    pub key_path: String,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive, overridden by `RUST_LOG`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "reactor_tls=info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: ReactorConfig = toml::from_str("").unwrap();
        assert_eq!(config.connect.timeout_ms, 3_000);
        assert_eq!(config.tls.handshake_timeout_ms, 30_000);
        assert_eq!(config.scheduler.poll_timeout_ms, 50);
        assert!(config.tls.verify_certificates);
        assert!(config.server.identities.is_empty());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: ReactorConfig = toml::from_str(
            r#"
            [tls]
            verify_certificates = false

            [[server.identities]]
            cert_path = "cert.pem"
            key_path = "key.pem"
            "#,
        )
        .unwrap();
        assert!(!config.tls.verify_certificates);
        assert!(config.tls.extended_master_secret);
        assert_eq!(config.server.port, 4433);
        assert_eq!(config.server.identities[0].key_path, "key.pem");
    }
}

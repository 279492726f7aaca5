//! Runtime view of the configuration.
//!
//! [`NetConfig`] is what workers actually consult: durations instead of
//! millisecond counts, and live resolver/verifier objects instead of file
//! paths. It travels with the [`SchedulerHandle`](crate::sched::SchedulerHandle).

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::loader::ConfigError;
use crate::config::schema::ReactorConfig;
use crate::net::resolve::{Resolver, SystemResolver};
use crate::tls::certchain::{AcceptAnyCertchain, CertchainVerifier, TrustStore};

#[derive(Clone)]
pub struct NetConfig {
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub prefer_ipv6: bool,
    pub handshake_timeout: Duration,
    pub extended_master_secret: bool,
    pub poll_timeout: Duration,
    pub idle_sleep: Duration,
    pub resolver: Arc<dyn Resolver>,
    pub verifier: Arc<dyn CertchainVerifier>,
    /// Exact cipher suite list for ClientHellos, in order. `None` sends the
    /// shuffled default offer.
    pub client_suites: Option<Vec<u16>>,
}

impl NetConfig {
    pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(3_000);

    /// Build the runtime configuration, loading trust roots from disk.
    pub fn from_config(config: &ReactorConfig) -> Result<Self, ConfigError> {
        let verifier: Arc<dyn CertchainVerifier> = if config.tls.verify_certificates {
            let mut store = TrustStore::new();
            for path in &config.tls.trust_roots {
                store.load_pem_file(Path::new(path))?;
            }
            Arc::new(store)
        } else {
            Arc::new(AcceptAnyCertchain)
        };

        Ok(Self {
            connect_timeout: Duration::from_millis(config.connect.timeout_ms),
            send_timeout: Duration::from_millis(config.connect.send_timeout_ms),
            prefer_ipv6: config.connect.prefer_ipv6,
            handshake_timeout: Duration::from_millis(config.tls.handshake_timeout_ms),
            extended_master_secret: config.tls.extended_master_secret,
            poll_timeout: Duration::from_millis(config.scheduler.poll_timeout_ms),
            idle_sleep: Duration::from_millis(config.scheduler.idle_sleep_ms),
            resolver: Arc::new(SystemResolver),
            verifier,
            client_suites: None,
        })
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn CertchainVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_client_suites(mut self, suites: Vec<u16>) -> Self {
        self.client_suites = Some(suites);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }
}

impl Default for NetConfig {
    /// Defaults match [`ReactorConfig::default`], with an empty trust store
    /// (every chain is rejected until roots are added).
    fn default() -> Self {
        let defaults = ReactorConfig::default();
        Self {
            connect_timeout: Duration::from_millis(defaults.connect.timeout_ms),
            send_timeout: Duration::from_millis(defaults.connect.send_timeout_ms),
            prefer_ipv6: defaults.connect.prefer_ipv6,
            handshake_timeout: Duration::from_millis(defaults.tls.handshake_timeout_ms),
            extended_master_secret: defaults.tls.extended_master_secret,
            poll_timeout: Duration::from_millis(defaults.scheduler.poll_timeout_ms),
            idle_sleep: Duration::from_millis(defaults.scheduler.idle_sleep_ms),
            resolver: Arc::new(SystemResolver),
            verifier: Arc::new(TrustStore::new()),
            client_suites: None,
        }
    }
}

impl fmt::Debug for NetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("send_timeout", &self.send_timeout)
            .field("prefer_ipv6", &self.prefer_ipv6)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("extended_master_secret", &self.extended_master_secret)
            .field("poll_timeout", &self.poll_timeout)
            .field("idle_sleep", &self.idle_sleep)
            .field("client_suites", &self.client_suites)
            .finish_non_exhaustive()
    }
}

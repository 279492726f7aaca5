//! Single-threaded cooperative reactor with a TLS 1.2 client and server.
//!
//! Workers (sockets and tasks) are driven by a [`Scheduler`](sched::Scheduler)
//! that polls socket readiness and fires continuations; CPU-heavy work runs
//! on detached threads and reports back through [`Promise`](sched::Promise)s.

pub mod config;
pub mod error;
pub mod net;
pub mod observability;
pub mod sched;
pub mod tls;

pub use config::{NetConfig, ReactorConfig};
pub use error::{CertError, NetError};
pub use net::{ConnectStatus, ConnectTask, Listener, ReuseTag, Socket};
pub use sched::{DetachedScheduler, Promise, Scheduler, SchedulerHandle, Task};
pub use tls::{AlertDescription, CertStore, TrustStore};

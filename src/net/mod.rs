//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! outgoing: ConnectTask (resolve off-thread → non-blocking connect)
//!     → Socket (transport) → enable_crypto_client → send / recv
//! incoming: Listener (passive accept loop)
//!     → on_accept(Socket) → enable_crypto_server → scheduler
//! ```
//!
//! # Design Decisions
//! - Sockets are scheduler workers; nothing in this layer blocks on reads
//! - DNS goes through the `Resolver` trait so tests can pin addresses
//! - Pooled sockets are found by their typed `ReuseTag`

pub mod connect_task;
pub mod listener;
pub mod resolve;
pub mod reuse;
pub mod socket;

pub use connect_task::{ConnectStatus, ConnectTask};
pub use listener::Listener;
pub use resolve::{AddrFamily, Resolver, StaticResolver, SystemResolver};
pub use reuse::ReuseTag;
pub use socket::{ReadyCallback, RecvCallback, Socket};

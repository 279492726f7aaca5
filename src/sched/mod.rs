//! Cooperative scheduling substrate.
//!
//! # Data Flow
//! ```text
//! caller / continuation
//!     → SchedulerHandle::add_worker (pending queue)
//!     → Scheduler::tick (merge pending, classify holdups)
//!         SOCKET  → poll set → readable: fire, hangup: closed-socket path
//!         IDLE    → fire every tick
//!         PROMISE → fire once settled
//!         NONE    → on_work_done, reclaim
//! ```
//!
//! # Design Decisions
//! - One scheduler per thread of control; the handle is passed explicitly
//! - Only sockets let the scheduler block in `poll`; anything else spins
//! - Continuations bound their own recursion (see `worker::RECURSION_CAP`)

pub mod detached;
pub mod poll;
pub mod promise;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use detached::DetachedScheduler;
pub use promise::Promise;
pub use scheduler::{Scheduler, SchedulerHandle};
pub use task::{Task, TaskWorker};
pub use worker::{Disposition, Holdup, HoldupKind, SharedWorker, Worker, WorkerKind};

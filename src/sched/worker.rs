//! Worker and holdup model.
//!
//! # Responsibilities
//! - Describe what a unit of schedulable state is waiting for (its holdup)
//! - Carry the continuation to run once that condition holds
//! - Bound stack growth for chains of synchronously satisfiable continuations
//!
//! # Design Decisions
//! - A worker never blocks; it declares a holdup and returns
//! - Continuations are boxed `FnOnce` closures over the concrete worker type
//! - `HoldupKind::None` means the scheduler may reclaim the worker

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::net::Socket;
use crate::sched::SchedulerHandle;

/// Maximum number of synchronous re-entries before an operation must defer
/// to the scheduler instead of recursing.
pub const RECURSION_CAP: u8 = 20;

/// Coarse worker classification, used for statistics and pooling lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Socket,
    Task,
    User,
}

/// What a worker is currently waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldupKind {
    /// Nothing; the worker is finished and may be reclaimed.
    None,
    /// Readability (or closure) of the worker's socket.
    Socket,
    /// Nothing external; fire on every tick.
    Idle,
    /// Fulfilment of a promise.
    Promise,
}

/// How eagerly an idle worker wants to be serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// Keeps the scheduler spinning without sleeping between ticks.
    HighFrequency,
    /// Keeps the scheduler out of the kernel poll, but allows a short sleep.
    #[default]
    Neutral,
    /// Does not by itself prevent the scheduler from blocking in poll.
    LowFrequency,
}

/// A continuation run once a holdup is satisfied.
pub type Continuation<W> = Box<dyn FnOnce(&mut W) + Send>;

/// Anything whose completion a worker can wait on.
pub trait Settle: Send {
    fn is_settled(&self) -> bool;
}

enum Pending<W> {
    None,
    Socket(Continuation<W>),
    Idle(Continuation<W>),
    Promise(Box<dyn Settle>, Continuation<W>),
}

/// Holdup descriptor owned by a worker of type `W`.
pub struct Holdup<W> {
    pending: Pending<W>,
    recursions: u8,
}

impl<W> Holdup<W> {
    pub fn new() -> Self {
        Self {
            pending: Pending::None,
            recursions: 0,
        }
    }

    pub fn kind(&self) -> HoldupKind {
        match self.pending {
            Pending::None => HoldupKind::None,
            Pending::Socket(_) => HoldupKind::Socket,
            Pending::Idle(_) => HoldupKind::Idle,
            Pending::Promise(..) => HoldupKind::Promise,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self.pending, Pending::None)
    }

    /// Whether a promise holdup has settled. Other holdups report `true`.
    pub fn is_ready(&self) -> bool {
        match &self.pending {
            Pending::Promise(probe, _) => probe.is_settled(),
            _ => true,
        }
    }

    pub fn set_socket(&mut self, cont: Continuation<W>) {
        self.pending = Pending::Socket(cont);
    }

    pub fn set_idle(&mut self, cont: Continuation<W>) {
        self.pending = Pending::Idle(cont);
    }

    pub fn set_promise(&mut self, probe: Box<dyn Settle>, cont: Continuation<W>) {
        self.pending = Pending::Promise(probe, cont);
    }

    /// Drop the pending continuation without running it.
    pub fn clear(&mut self) {
        self.pending = Pending::None;
    }

    /// Take the continuation for firing. Resets the recursion counter and
    /// leaves the holdup at `None`; the continuation re-arms it if needed.
    pub fn take(&mut self) -> Option<Continuation<W>> {
        self.recursions = 0;
        match std::mem::replace(&mut self.pending, Pending::None) {
            Pending::None => None,
            Pending::Socket(cont) | Pending::Idle(cont) | Pending::Promise(_, cont) => Some(cont),
        }
    }

    /// Account for one synchronous re-entry. Returns `false` once the cap is
    /// reached, in which case the caller must arm a holdup instead.
    pub fn can_recurse(&mut self) -> bool {
        if self.recursions >= RECURSION_CAP {
            return false;
        }
        self.recursions += 1;
        true
    }

    pub fn recursions(&self) -> u8 {
        self.recursions
    }
}

impl<W> Default for Holdup<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> fmt::Debug for Holdup<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Holdup")
            .field("kind", &self.kind())
            .field("recursions", &self.recursions)
            .finish()
    }
}

/// Base unit of schedulable state.
///
/// Implementations are owned by a [`Scheduler`](crate::sched::Scheduler)
/// through a [`SharedWorker`] handle, so external code may keep a clone to
/// inspect the worker after it has been reclaimed.
pub trait Worker: Send {
    fn kind(&self) -> WorkerKind {
        WorkerKind::User
    }

    fn holdup_kind(&self) -> HoldupKind;

    /// For promise holdups, whether the promise has settled.
    fn holdup_ready(&self) -> bool {
        true
    }

    /// Run the pending continuation, if any.
    fn fire_holdup(&mut self);

    /// Force the holdup to `None` without running the continuation.
    fn clear_holdup(&mut self);

    /// Called once when the worker moves from the pending queue into the
    /// live set.
    fn attach(&mut self, _scheduler: &SchedulerHandle) {}

    fn disposition(&self) -> Disposition {
        Disposition::Neutral
    }

    /// Passive workers (listeners) do not keep `Scheduler::run` alive.
    fn is_passive(&self) -> bool {
        false
    }

    fn as_socket(&self) -> Option<&Socket> {
        None
    }

    fn as_socket_mut(&mut self) -> Option<&mut Socket> {
        None
    }

    fn describe(&self) -> String;
}

/// Shared-ownership handle to a scheduled worker.
pub type SharedWorker = Arc<Mutex<dyn Worker>>;

/// Lock a worker, recovering from poisoning left behind by a panicking
/// continuation.
pub fn lock<W: ?Sized>(worker: &Mutex<W>) -> MutexGuard<'_, W> {
    worker.lock().unwrap_or_else(PoisonError::into_inner)
}

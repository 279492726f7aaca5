//! The reactor loop.
//!
//! # Responsibilities
//! - Own live workers and merge newly added ones at the start of each tick
//! - Build a poll set from socket holdups and dispatch readiness
//! - Fire idle and settled-promise holdups
//! - Reclaim finished workers and route closed sockets
//!
//! # Design Decisions
//! - Workers are serviced in registration order every tick
//! - A purely socket-driven workload blocks in `poll` with a bounded timeout;
//!   any other work switches to a zero-timeout spin
//! - Panics in continuations can be contained per worker and reported

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

use crate::config::NetConfig;
use crate::net::Socket;
use crate::observability::metrics;
use crate::sched::poll::{self, PollFd};
use crate::sched::task::{Task, TaskWorker};
use crate::sched::worker::{lock, Disposition, HoldupKind, SharedWorker, Worker, WorkerKind};

type WorkDoneHook = Box<dyn FnMut(&mut dyn Worker) + Send>;
type ExceptionHook = Box<dyn FnMut(&dyn Worker, &str) + Send>;
type ConnectionLostHook = Box<dyn FnMut(&mut Socket) + Send>;

struct HandleShared {
    pending: Mutex<Vec<SharedWorker>>,
    config: ArcSwap<NetConfig>,
    close_reusable: AtomicBool,
}

/// Cloneable, thread-safe entry point into a scheduler.
///
/// Continuations and tasks receive this instead of reaching for a global;
/// adding a worker only enqueues it, so it is safe while the scheduler is
/// mid-tick or running on another thread.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<HandleShared>,
}

impl SchedulerHandle {
    pub fn new(config: NetConfig) -> Self {
        Self {
            shared: Arc::new(HandleShared {
                pending: Mutex::new(Vec::new()),
                config: ArcSwap::from_pointee(config),
                close_reusable: AtomicBool::new(false),
            }),
        }
    }

    pub fn add_worker(&self, worker: SharedWorker) {
        lock(&self.shared.pending).push(worker);
    }

    pub fn add_socket(&self, socket: Socket) -> Arc<Mutex<Socket>> {
        let socket = Arc::new(Mutex::new(socket));
        self.add_worker(socket.clone());
        socket
    }

    pub fn add_task<T: Task>(&self, task: T) -> Arc<Mutex<TaskWorker<T>>> {
        let worker = Arc::new(Mutex::new(TaskWorker::new(task)));
        self.add_worker(worker.clone());
        worker
    }

    /// Current network configuration.
    pub fn config(&self) -> Arc<NetConfig> {
        self.shared.config.load_full()
    }

    /// Atomically replace the configuration seen by workers from now on.
    pub fn update_config(&self, config: NetConfig) {
        self.shared.config.store(Arc::new(config));
    }

    /// Ask the scheduler to close idle pooled sockets at its next tick.
    pub fn request_close_reusable_sockets(&self) {
        self.shared.close_reusable.store(true, Ordering::Release);
    }

    pub fn num_pending(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.num_pending() != 0
    }

    fn drain_pending(&self) -> Vec<SharedWorker> {
        std::mem::take(&mut *lock(&self.shared.pending))
    }

    fn take_close_reusable_request(&self) -> bool {
        self.shared.close_reusable.swap(false, Ordering::AcqRel)
    }

    fn pending_snapshot(&self) -> Vec<SharedWorker> {
        lock(&self.shared.pending).clone()
    }
}

impl Default for SchedulerHandle {
    fn default() -> Self {
        Self::new(NetConfig::default())
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("pending", &self.num_pending())
            .finish()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Workload {
    not_just_sockets: bool,
    high_frequency: bool,
}

impl Workload {
    fn absorb(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::HighFrequency => {
                self.not_just_sockets = true;
                self.high_frequency = true;
            }
            Disposition::Neutral => self.not_just_sockets = true,
            Disposition::LowFrequency => {}
        }
    }
}

/// Single-threaded cooperative reactor.
pub struct Scheduler {
    workers: Vec<SharedWorker>,
    handle: SchedulerHandle,
    passive_workers: usize,
    catch_panics: bool,
    on_work_done: Option<WorkDoneHook>,
    on_exception: Option<ExceptionHook>,
    on_connection_lost: Option<ConnectionLostHook>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(NetConfig::default())
    }

    pub fn with_config(config: NetConfig) -> Self {
        Self::with_handle(SchedulerHandle::new(config))
    }

    pub(crate) fn with_handle(handle: SchedulerHandle) -> Self {
        Self {
            workers: Vec::new(),
            handle,
            passive_workers: 0,
            catch_panics: !cfg!(debug_assertions),
            on_work_done: None,
            on_exception: None,
            on_connection_lost: None,
        }
    }

    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    pub fn add_worker(&self, worker: SharedWorker) {
        self.handle.add_worker(worker);
    }

    pub fn add_socket(&self, socket: Socket) -> Arc<Mutex<Socket>> {
        self.handle.add_socket(socket)
    }

    pub fn add_task<T: Task>(&self, task: T) -> Arc<Mutex<TaskWorker<T>>> {
        self.handle.add_task(task)
    }

    /// Contain panics raised by continuations instead of unwinding out of
    /// the scheduler. Enabled by default in release builds.
    pub fn set_catch_panics(&mut self, catch: bool) {
        self.catch_panics = catch;
    }

    pub fn on_work_done(&mut self, hook: impl FnMut(&mut dyn Worker) + Send + 'static) {
        self.on_work_done = Some(Box::new(hook));
    }

    pub fn on_exception(&mut self, hook: impl FnMut(&dyn Worker, &str) + Send + 'static) {
        self.on_exception = Some(Box::new(hook));
    }

    pub fn on_connection_lost(&mut self, hook: impl FnMut(&mut Socket) + Send + 'static) {
        self.on_connection_lost = Some(Box::new(hook));
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn num_pending(&self) -> usize {
        self.handle.num_pending()
    }

    pub fn num_sockets(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| lock(w).kind() == WorkerKind::Socket)
            .count()
    }

    pub fn should_keep_running(&self) -> bool {
        self.workers.len() != self.passive_workers || self.handle.has_pending()
    }

    /// Run until no live or pending workers remain (passive ones aside).
    pub fn run(&mut self) {
        let mut pollfds = Vec::new();
        while self.should_keep_running() {
            pollfds.clear();
            let workload = self.tick_workers(&mut pollfds);
            if workload.not_just_sockets {
                self.yield_busyspin(&mut pollfds, workload);
            } else {
                self.yield_kernel(&mut pollfds);
            }
        }
    }

    /// Like [`Scheduler::run`], but returns once `limit` has elapsed.
    pub fn run_for(&mut self, limit: Duration) {
        let deadline = Instant::now() + limit;
        let mut pollfds = Vec::new();
        while self.should_keep_running() {
            pollfds.clear();
            let workload = self.tick_workers(&mut pollfds);
            self.yield_busyspin(&mut pollfds, workload);
            if Instant::now() > deadline {
                break;
            }
        }
    }

    /// Run while any worker exists, passive ones included. A scheduler
    /// holding a listener therefore serves until the listener closes.
    pub fn serve(&mut self) {
        let mut pollfds = Vec::new();
        while !self.workers.is_empty() || self.handle.has_pending() {
            pollfds.clear();
            let workload = self.tick_workers(&mut pollfds);
            if workload.not_just_sockets {
                self.yield_busyspin(&mut pollfds, workload);
            } else {
                self.yield_kernel(&mut pollfds);
            }
        }
    }

    /// One tick followed by a non-blocking poll.
    pub fn tick(&mut self) {
        let mut pollfds = Vec::new();
        self.tick_workers(&mut pollfds);
        self.poll_and_dispatch(&mut pollfds, 0);
    }

    fn tick_workers(&mut self, pollfds: &mut Vec<PollFd>) -> Workload {
        for worker in self.handle.drain_pending() {
            {
                let mut guard = lock(&worker);
                guard.attach(&self.handle);
                if guard.is_passive() {
                    self.passive_workers += 1;
                }
            }
            self.workers.push(worker);
        }

        if self.handle.take_close_reusable_request() {
            self.close_reusable_sockets();
        }

        let now = Instant::now();
        let mut workload = Workload::default();
        pollfds.reserve(self.workers.len());

        let mut i = 0;
        while i < self.workers.len() {
            let worker = Arc::clone(&self.workers[i]);
            let mut guard = lock(&worker);

            let closed = match guard.as_socket_mut() {
                Some(socket) => {
                    socket.check_deadline(now);
                    !socket.has_connection()
                }
                None => false,
            };
            if closed {
                self.process_closed_socket(&mut *guard);
            }

            if guard.holdup_kind() == HoldupKind::None {
                if guard.is_passive() {
                    self.passive_workers = self.passive_workers.saturating_sub(1);
                }
                if let Some(hook) = self.on_work_done.as_mut() {
                    hook(&mut *guard);
                }
                drop(guard);
                self.workers.remove(i);
                continue;
            }

            self.tick_worker(&mut *guard, pollfds, &mut workload);
            i += 1;
        }
        workload
    }

    fn tick_worker(&mut self, worker: &mut dyn Worker, pollfds: &mut Vec<PollFd>, workload: &mut Workload) {
        match worker.holdup_kind() {
            HoldupKind::Socket => {
                let entry = worker
                    .as_socket()
                    .and_then(Socket::raw_fd)
                    .map(poll::readable)
                    .unwrap_or_else(poll::placeholder);
                pollfds.push(entry);
            }
            HoldupKind::Idle => {
                pollfds.push(poll::placeholder());
                let disposition = worker.disposition();
                self.fire(worker);
                workload.absorb(disposition);
            }
            HoldupKind::Promise => {
                pollfds.push(poll::placeholder());
                if worker.holdup_ready() {
                    self.fire(worker);
                }
                workload.absorb(Disposition::Neutral);
            }
            HoldupKind::None => pollfds.push(poll::placeholder()),
        }
    }

    fn yield_busyspin(&mut self, pollfds: &mut [PollFd], workload: Workload) {
        self.poll_and_dispatch(pollfds, 0);
        if !workload.high_frequency {
            thread::sleep(self.handle.config().idle_sleep);
        }
    }

    fn yield_kernel(&mut self, pollfds: &mut [PollFd]) {
        // Never block indefinitely: a hangup is not always reported, and
        // workers added from elsewhere must not wait forever.
        let timeout = self.handle.config().poll_timeout.as_millis().min(i32::MAX as u128) as i32;
        self.poll_and_dispatch(pollfds, timeout);
    }

    fn poll_and_dispatch(&mut self, pollfds: &mut [PollFd], timeout_ms: i32) {
        match poll::poll(pollfds, timeout_ms) {
            Ok(0) => {}
            Ok(_) => self.process_poll_results(pollfds),
            Err(err) => tracing::warn!(error = %err, "poll failed"),
        }
    }

    fn process_poll_results(&mut self, pollfds: &[PollFd]) {
        for (index, entry) in pollfds.iter().enumerate() {
            if entry.revents == 0 || entry.fd == -1 {
                continue;
            }
            let Some(worker) = self.workers.get(index).cloned() else {
                continue;
            };
            let mut guard = lock(&worker);
            if entry.revents & !libc::POLLIN != 0 {
                if let Some(socket) = guard.as_socket_mut() {
                    socket.mark_remote_closed();
                }
                self.process_closed_socket(&mut *guard);
            } else {
                self.fire(&mut *guard);
            }
        }
    }

    fn fire(&mut self, worker: &mut dyn Worker) {
        if !self.catch_panics {
            worker.fire_holdup();
            return;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| worker.fire_holdup()));
        if let Err(payload) = result {
            let message = panic_message(payload.as_ref());
            metrics::worker_panicked();
            match self.on_exception.as_mut() {
                Some(hook) => hook(&*worker, &message),
                None => tracing::error!(
                    worker = %worker.describe(),
                    error = %message,
                    "Exception while processing worker"
                ),
            }
            worker.clear_holdup();
        }
    }

    fn process_closed_socket(&mut self, worker: &mut dyn Worker) {
        let Some(socket) = worker.as_socket_mut() else {
            return;
        };
        if let Some(hook) = self.on_connection_lost.as_mut() {
            if socket.take_connection_lost_dispatch() {
                hook(socket);
            }
        }
        if socket.holdup_kind() != HoldupKind::Socket {
            return;
        }
        if !socket.has_connection() {
            socket.mark_remote_closed();
        }
        if socket.callback_recv_on_close() || socket.transport_has_data() {
            self.fire(worker);
        } else {
            socket.clear_holdup();
        }
    }

    /// First live or pending socket tagged for `(host, port, tls)` whose tag
    /// is not busy. Workers locked by a running continuation are skipped.
    pub fn find_reusable_socket(&self, host: &str, port: u16, tls: bool) -> Option<SharedWorker> {
        self.workers
            .iter()
            .cloned()
            .chain(self.handle.pending_snapshot())
            .find(|worker| {
                with_socket_if_free(worker, |socket| {
                    socket
                        .reuse_tag()
                        .is_some_and(|tag| !tag.is_busy && tag.matches(host, port, tls))
                })
            })
    }

    /// Close every pooled socket that is not currently in use.
    pub fn close_reusable_sockets(&mut self) {
        for worker in &self.workers {
            let mut guard = match worker.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => continue,
            };
            if let Some(socket) = guard.as_socket_mut() {
                if socket.reuse_tag().is_some_and(|tag| !tag.is_busy) {
                    tracing::debug!(peer = %socket.describe(), "Closing reusable socket");
                    socket.close();
                }
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn with_socket_if_free(worker: &SharedWorker, f: impl FnOnce(&Socket) -> bool) -> bool {
    let guard = match worker.try_lock() {
        Ok(guard) => guard,
        Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        Err(TryLockError::WouldBlock) => return false,
    };
    guard.as_socket().is_some_and(f)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

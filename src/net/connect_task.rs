//! Non-blocking connection establishment as a scheduler task.
//!
//! # Responsibilities
//! - Resolve the host off-thread: A records first, AAAA as the fallback
//!   (reversed with `prefer_ipv6`)
//! - Kick off a non-blocking connect to one random address and check for
//!   completion once per tick
//! - Give up after the configured connect timeout
//!
//! # Data Flow
//! ```text
//! Start ──lookup(first family)──▶ Resolving ──ips──▶ Connecting ──▶ Ok
//!                                    │ empty/error         │ error   ──▶ FailL4Error
//!                                    ▼                     │ timeout ──▶ FailL4Timeout
//!                     lookup(second family) or FailNoDns*
//! ```

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::task::Poll;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::config::NetConfig;
use crate::net::resolve::{spawn_lookup, AddrFamily};
use crate::net::socket::Socket;
use crate::observability::metrics;
use crate::sched::worker::lock;
use crate::sched::{Promise, Scheduler, SchedulerHandle, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Pending,
    Ok,
    /// Every lookup succeeded without returning an address.
    FailNoDnsResults,
    /// No lookup produced an answer (error or timeout).
    FailNoDnsResponse,
    FailL4Timeout,
    FailL4Error,
}

impl ConnectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectStatus::Pending => "pending",
            ConnectStatus::Ok => "ok",
            ConnectStatus::FailNoDnsResults => "no_dns_results",
            ConnectStatus::FailNoDnsResponse => "no_dns_response",
            ConnectStatus::FailL4Timeout => "l4_timeout",
            ConnectStatus::FailL4Error => "l4_error",
        }
    }

    pub fn is_ok(self) -> bool {
        self == ConnectStatus::Ok
    }
}

enum Phase {
    Start,
    Direct(SocketAddr),
    Resolving {
        families: Vec<AddrFamily>,
        lookup: Promise<io::Result<Vec<IpAddr>>>,
    },
    Connecting,
    Finished,
}

pub struct ConnectTask {
    host: String,
    port: u16,
    phase: Phase,
    socket: Option<Socket>,
    started: Option<Instant>,
    status: ConnectStatus,
    /// Whether some lookup answered, even if with nothing.
    dns_answered: bool,
}

impl ConnectTask {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            phase: Phase::Start,
            socket: None,
            started: None,
            status: ConnectStatus::Pending,
            dns_answered: false,
        }
    }

    /// Connect to a known address, skipping DNS.
    pub fn to_addr(addr: SocketAddr) -> Self {
        let mut task = Self::new(addr.ip().to_string(), addr.port());
        task.phase = Phase::Direct(addr);
        task
    }

    pub fn status(&self) -> ConnectStatus {
        self.status
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The connected socket, once the status is [`ConnectStatus::Ok`].
    pub fn take_socket(&mut self) -> Option<Socket> {
        if self.status.is_ok() {
            self.socket.take()
        } else {
            None
        }
    }

    /// Drive the task on a private scheduler and return the socket.
    pub fn connect(self, config: &NetConfig) -> Result<Socket, ConnectStatus> {
        let mut scheduler = Scheduler::with_config(config.clone());
        scheduler.set_catch_panics(false);
        let handle = scheduler.add_task(self);
        scheduler.run();
        let mut worker = lock(&handle);
        let status = worker.take_output().unwrap_or(ConnectStatus::FailL4Error);
        let socket = worker.task_mut().take_socket();
        socket.ok_or(status)
    }

    fn finish(&mut self, status: ConnectStatus) -> Poll<ConnectStatus> {
        self.status = status;
        self.phase = Phase::Finished;
        if !status.is_ok() {
            self.socket = None;
        }
        metrics::connect_finished(status.as_str());
        tracing::debug!(host = %self.host, port = self.port, status = status.as_str(), "Connect finished");
        Poll::Ready(status)
    }

    fn start_lookup(&mut self, scheduler: &SchedulerHandle, mut families: Vec<AddrFamily>) -> Poll<ConnectStatus> {
        if families.is_empty() {
            let status = if self.dns_answered {
                ConnectStatus::FailNoDnsResults
            } else {
                ConnectStatus::FailNoDnsResponse
            };
            return self.finish(status);
        }
        let family = families.remove(0);
        let resolver = scheduler.config().resolver.clone();
        let lookup = spawn_lookup(resolver, self.host.clone(), family);
        self.phase = Phase::Resolving { families, lookup };
        Poll::Pending
    }

    fn kick_off(&mut self, addr: SocketAddr) -> Poll<ConnectStatus> {
        let mut socket = Socket::new();
        if let Err(err) = socket.kick_off_connect(addr) {
            tracing::debug!(peer = %addr, error = %err, "Connect failed immediately");
            return self.finish(ConnectStatus::FailL4Error);
        }
        self.socket = Some(socket);
        self.phase = Phase::Connecting;
        Poll::Pending
    }

    fn elapsed(&self) -> Duration {
        self.started.map(|t| t.elapsed()).unwrap_or_default()
    }
}

impl Task for ConnectTask {
    type Output = ConnectStatus;

    fn on_tick(&mut self, scheduler: &SchedulerHandle) -> Poll<ConnectStatus> {
        let timeout = scheduler.config().connect_timeout;
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }

        match std::mem::replace(&mut self.phase, Phase::Finished) {
            Phase::Start => {
                let families = if scheduler.config().prefer_ipv6 {
                    vec![AddrFamily::V6, AddrFamily::V4]
                } else {
                    vec![AddrFamily::V4, AddrFamily::V6]
                };
                self.start_lookup(scheduler, families)
            }
            Phase::Direct(addr) => self.kick_off(addr),
            Phase::Resolving { families, lookup } => {
                if lookup.is_pending() {
                    if self.elapsed() >= timeout {
                        return self.finish(ConnectStatus::FailNoDnsResponse);
                    }
                    self.phase = Phase::Resolving { families, lookup };
                    return Poll::Pending;
                }
                match lookup.take() {
                    Some(Ok(ips)) => {
                        self.dns_answered = true;
                        match ips.choose(&mut rand::thread_rng()) {
                            Some(ip) => self.kick_off(SocketAddr::new(*ip, self.port)),
                            None => self.start_lookup(scheduler, families),
                        }
                    }
                    Some(Err(err)) => {
                        tracing::debug!(host = %self.host, error = %err, "Lookup failed");
                        self.start_lookup(scheduler, families)
                    }
                    None => self.start_lookup(scheduler, families),
                }
            }
            Phase::Connecting => {
                let status = match self.socket.as_mut().map(Socket::connect_status) {
                    Some(None) => None,
                    Some(Some(Ok(()))) => Some(ConnectStatus::Ok),
                    Some(Some(Err(err))) => {
                        tracing::debug!(host = %self.host, error = %err, "Connect failed");
                        Some(ConnectStatus::FailL4Error)
                    }
                    None => Some(ConnectStatus::FailL4Error),
                };
                match status {
                    Some(status) => self.finish(status),
                    None if self.elapsed() >= timeout => self.finish(ConnectStatus::FailL4Timeout),
                    None => {
                        self.phase = Phase::Connecting;
                        Poll::Pending
                    }
                }
            }
            Phase::Finished => Poll::Ready(self.status),
        }
    }

    fn describe(&self) -> String {
        format!("connect {}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::resolve::StaticResolver;
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::Arc;

    #[test]
    fn connects_to_listening_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = ConnectTask::to_addr(addr).connect(&NetConfig::default()).unwrap();
        assert!(socket.has_connection());
        assert_eq!(socket.peer_addr(), Some(addr));
    }

    #[test]
    fn resolves_through_configured_resolver() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut resolver = StaticResolver::new();
        resolver.insert("svc.test", IpAddr::V4(Ipv4Addr::LOCALHOST));

        let mut scheduler = Scheduler::with_config(NetConfig::default().with_resolver(Arc::new(resolver)));
        let handle = scheduler.add_task(ConnectTask::new("svc.test", port));
        scheduler.run_for(Duration::from_secs(5));

        let mut worker = lock(&handle);
        assert_eq!(worker.take_output(), Some(ConnectStatus::Ok));
        assert!(worker.task_mut().take_socket().is_some());
    }

    #[test]
    fn unknown_host_has_no_results() {
        let mut scheduler = Scheduler::with_config(NetConfig::default().with_resolver(Arc::new(StaticResolver::new())));
        let handle = scheduler.add_task(ConnectTask::new("missing.test", 80));
        scheduler.run_for(Duration::from_secs(5));
        assert_eq!(lock(&handle).take_output(), Some(ConnectStatus::FailNoDnsResults));
    }

    #[test]
    fn refused_connect_is_l4_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        assert_eq!(ConnectTask::to_addr(addr).connect(&NetConfig::default()).err(), Some(ConnectStatus::FailL4Error));
    }
}

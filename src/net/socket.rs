//! Socket worker: one OS socket plus its TLS state.
//!
//! # Responsibilities
//! - Establish connections (blocking with timeout, or kicked off for
//!   [`ConnectTask`](crate::net::ConnectTask)) and accept them
//! - Buffered, non-blocking transport send/recv with push-back (`unrecv`)
//! - Route `send`/`recv` through the TLS record layer once encrypted
//! - Expose what the scheduler needs to poll, time out and reap it
//!
//! # Design Decisions
//! - A socket never blocks on receive: when no data is buffered it arms a
//!   SOCKET holdup carrying the continuation and returns
//! - Receives that can complete synchronously are bounded by the holdup's
//!   recursion cap; past it the continuation is deferred to the next tick
//! - Side-channel metadata (reuse tag, close reason, last alerts) are plain
//!   typed fields
//!
//! # Data Flow
//! ```text
//! recv(cb)
//!     encrypted → tls_recv_record(application_data) → transport_recv_exact
//!     plain     → transport_recv
//! transport_recv
//!     unrecv / socket has data → cb(data)
//!     nothing yet               → SOCKET holdup → scheduler poll → retry
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use crate::config::NetConfig;
use crate::error::NetError;
use crate::net::resolve::AddrFamily;
use crate::net::reuse::ReuseTag;
use crate::sched::poll;
use crate::sched::worker::{Continuation, Disposition, Holdup, HoldupKind, Worker, WorkerKind};
use crate::sched::{Promise, SchedulerHandle};
use crate::tls::alert::AlertDescription;
use crate::tls::encrypter::Encrypter;
use crate::tls::handshaker::Handshaker;
use crate::tls::wire::{ContentType, MAX_FRAGMENT_LEN};

/// Receive size used by [`Socket::recv`] on plain sockets.
pub const DEFAULT_RECV_MAX: usize = 0x1000;

/// Continuation receiving a chunk of data. An empty buffer means the peer
/// closed the connection.
pub type RecvCallback = Box<dyn FnOnce(&mut Socket, Vec<u8>) + Send>;

/// Continuation run once an operation (connect, handshake) has completed.
pub type ReadyCallback = Box<dyn FnOnce(&mut Socket) + Send>;

pub(crate) type AcceptHook = Box<dyn FnMut(&mut Socket) + Send>;

enum Endpoint {
    None,
    Stream(TcpStream),
    Listener(TcpListener),
}

pub struct Socket {
    endpoint: Endpoint,
    peer: Option<SocketAddr>,
    unrecv: Vec<u8>,
    pub(crate) tls_send: Encrypter,
    pub(crate) tls_recv: Encrypter,
    pub(crate) handshaker: Option<Box<Handshaker>>,
    /// Decrypted handshake bytes past the last complete message.
    pub(crate) handshake_carry: Vec<u8>,
    pub(crate) remote_closed: bool,
    connection_lost_dispatched: bool,
    callback_recv_on_close: bool,
    passive: bool,
    reuse_tag: Option<ReuseTag>,
    pub(crate) close_reason: Option<String>,
    pub(crate) last_alert_sent: Option<AlertDescription>,
    pub(crate) last_alert_received: Option<u8>,
    pub(crate) holdup: Holdup<Socket>,
    scheduler: Option<SchedulerHandle>,
    pub(crate) deadline: Option<Instant>,
    send_timeout: Duration,
}

impl Socket {
    /// An unconnected socket.
    pub fn new() -> Self {
        Self {
            endpoint: Endpoint::None,
            peer: None,
            unrecv: Vec::new(),
            tls_send: Encrypter::default(),
            tls_recv: Encrypter::default(),
            handshaker: None,
            handshake_carry: Vec::new(),
            remote_closed: false,
            connection_lost_dispatched: false,
            callback_recv_on_close: false,
            passive: false,
            reuse_tag: None,
            close_reason: None,
            last_alert_sent: None,
            last_alert_received: None,
            holdup: Holdup::new(),
            scheduler: None,
            deadline: None,
            send_timeout: NetConfig::DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Wrap an already connected stream. The stream is switched to
    /// non-blocking mode.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let mut socket = Self::new();
        socket.peer = stream.peer_addr().ok();
        socket.endpoint = Endpoint::Stream(stream);
        Ok(socket)
    }

    // ---- connection establishment -----------------------------------------

    /// Blocking connect with default settings. See [`Socket::connect_with`].
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), NetError> {
        self.connect_with(&NetConfig::default(), host, port)
    }

    /// Resolve `host` and connect to one address of each family in turn
    /// (IPv4 first unless `prefer_ipv6`), each attempt bounded by the
    /// connect timeout.
    pub fn connect_with(&mut self, config: &NetConfig, host: &str, port: u16) -> Result<(), NetError> {
        let families = if config.prefer_ipv6 {
            [AddrFamily::V6, AddrFamily::V4]
        } else {
            [AddrFamily::V4, AddrFamily::V6]
        };

        let mut last_error = None;
        for family in families {
            let ips = match config.resolver.lookup(host, family) {
                Ok(ips) => ips,
                Err(source) => {
                    last_error = Some(NetError::DnsLookup {
                        host: host.to_string(),
                        source,
                    });
                    continue;
                }
            };
            let Some(ip) = ips.choose(&mut rand::thread_rng()) else {
                continue;
            };
            match self.connect_addr(SocketAddr::new(*ip, port), config.connect_timeout) {
                Ok(()) => {
                    self.send_timeout = config.send_timeout;
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(host = %host, ip = %ip, error = %err, "Connect attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| NetError::NoDnsResults(host.to_string())))
    }

    /// Blocking connect to one address.
    pub fn connect_addr(&mut self, addr: SocketAddr, timeout: Duration) -> Result<(), NetError> {
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|source| {
            if source.kind() == io::ErrorKind::TimedOut {
                NetError::ConnectTimeout {
                    addr,
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                NetError::Connect { addr, source }
            }
        })?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        self.endpoint = Endpoint::Stream(stream);
        self.peer = Some(addr);
        self.remote_closed = false;
        tracing::debug!(peer = %addr, "Connected");
        Ok(())
    }

    /// Start a non-blocking connect. Completion is signalled by the socket
    /// becoming writable; check it with [`Socket::connect_status`].
    pub fn kick_off_connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        let (storage, len) = sockaddr(&addr);
        let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };

        let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a freshly created socket owned by nobody else.
        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        stream.set_nonblocking(true)?;

        let ret = unsafe { libc::connect(fd, (&storage as *const libc::sockaddr_storage).cast(), len) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err);
            }
        }
        self.endpoint = Endpoint::Stream(stream);
        self.peer = Some(addr);
        self.remote_closed = false;
        Ok(())
    }

    /// Poll a kicked-off connect without blocking: `None` while in progress,
    /// then the outcome.
    pub fn connect_status(&mut self) -> Option<io::Result<()>> {
        let Endpoint::Stream(stream) = &self.endpoint else {
            return Some(Err(io::ErrorKind::NotConnected.into()));
        };
        match poll::wait_writable(stream.as_raw_fd(), 0) {
            Ok(None) => None,
            Ok(Some(_)) => match stream.take_error() {
                Ok(None) => Some(stream.set_nodelay(true)),
                Ok(Some(err)) | Err(err) => Some(Err(err)),
            },
            Err(err) => Some(Err(err)),
        }
    }

    /// Listen on all interfaces.
    pub fn bind(&mut self, port: u16) -> io::Result<()> {
        self.bind_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Listen on `addr`. The address is reusable immediately after a
    /// previous listener on it closes.
    pub fn bind_addr(&mut self, addr: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        self.peer = Some(listener.local_addr()?);
        self.endpoint = Endpoint::Listener(listener);
        tracing::info!(address = %self.describe(), "Listener bound");
        Ok(())
    }

    /// Accept one pending connection, if any.
    pub fn accept(&mut self) -> Option<Socket> {
        let Endpoint::Listener(listener) = &self.endpoint else {
            return None;
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    tracing::debug!(peer = %peer, error = %err, "Could not set TCP_NODELAY");
                }
                match Socket::from_stream(stream) {
                    Ok(mut socket) => {
                        socket.send_timeout = self.send_timeout;
                        Some(socket)
                    }
                    Err(err) => {
                        tracing::warn!(peer = %peer, error = %err, "Dropping accepted connection");
                        None
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => {
                tracing::warn!(error = %err, "Accept failed");
                None
            }
        }
    }

    /// Address of the peer, or the bound address for listeners.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.endpoint {
            Endpoint::Stream(stream) => stream.local_addr().ok(),
            Endpoint::Listener(listener) => listener.local_addr().ok(),
            Endpoint::None => None,
        }
    }

    // ---- state ------------------------------------------------------------

    pub fn has_connection(&self) -> bool {
        !matches!(self.endpoint, Endpoint::None)
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        match &self.endpoint {
            Endpoint::Stream(stream) => Some(stream.as_raw_fd()),
            Endpoint::Listener(listener) => Some(listener.as_raw_fd()),
            Endpoint::None => None,
        }
    }

    pub fn is_remote_closed(&self) -> bool {
        self.remote_closed
    }

    pub fn mark_remote_closed(&mut self) {
        self.remote_closed = true;
    }

    /// Whether application data goes through the record layer.
    pub fn is_encrypted(&self) -> bool {
        self.tls_send.is_active()
    }

    pub fn is_handshaking(&self) -> bool {
        self.handshaker.is_some()
    }

    /// Nothing pending, or nothing left to wait for.
    pub fn is_work_done_or_closed(&self) -> bool {
        self.holdup.is_none() || !self.has_connection() || self.remote_closed
    }

    pub fn callback_recv_on_close(&self) -> bool {
        self.callback_recv_on_close
    }

    /// Have a pending receive resolve with an empty buffer when the peer
    /// closes, instead of being dropped.
    pub fn set_callback_recv_on_close(&mut self, enabled: bool) {
        self.callback_recv_on_close = enabled;
    }

    pub fn reuse_tag(&self) -> Option<&ReuseTag> {
        self.reuse_tag.as_ref()
    }

    pub fn reuse_tag_mut(&mut self) -> Option<&mut ReuseTag> {
        self.reuse_tag.as_mut()
    }

    pub fn set_reuse_tag(&mut self, tag: Option<ReuseTag>) {
        self.reuse_tag = tag;
    }

    pub fn close_reason(&self) -> Option<&str> {
        self.close_reason.as_deref()
    }

    pub fn set_close_reason(&mut self, reason: impl Into<String>) {
        self.close_reason = Some(reason.into());
    }

    pub fn last_alert_sent(&self) -> Option<AlertDescription> {
        self.last_alert_sent
    }

    /// Raw description byte of the last alert the peer sent.
    pub fn last_alert_received(&self) -> Option<u8> {
        self.last_alert_received
    }

    /// Number of synchronous re-entries since the holdup last fired.
    pub fn recursion_depth(&self) -> u8 {
        self.holdup.recursions()
    }

    pub fn scheduler(&self) -> Option<&SchedulerHandle> {
        self.scheduler.as_ref()
    }

    pub(crate) fn set_passive(&mut self, passive: bool) {
        self.passive = passive;
    }

    /// Returns `true` exactly once, the first time a lost connection is
    /// reported to the scheduler's hook.
    pub fn take_connection_lost_dispatch(&mut self) -> bool {
        !mem::replace(&mut self.connection_lost_dispatched, true)
    }

    /// Enforce the handshake deadline. Called by the scheduler every tick.
    pub fn check_deadline(&mut self, now: Instant) {
        let Some(deadline) = self.deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        self.deadline = None;
        if let Some(handshaker) = self.handshaker.take() {
            handshaker.record_outcome("timeout");
        }
        tracing::warn!(peer = %self.describe(), "TLS handshake timed out");
        self.close_reason = Some("TLS handshake timed out".to_string());
        self.tls_send.reset();
        self.tls_recv.reset();
        self.transport_close();
    }

    pub fn describe(&self) -> String {
        match (&self.endpoint, self.peer) {
            (Endpoint::Listener(_), Some(addr)) => format!("listener {addr}"),
            (_, Some(addr)) => addr.to_string(),
            (_, None) => "unconnected".to_string(),
        }
    }

    // ---- transport layer --------------------------------------------------

    /// Write all of `data`, waiting for the socket to drain when the kernel
    /// buffer is full. Failure closes the socket.
    pub fn transport_send(&mut self, data: &[u8]) -> Result<(), NetError> {
        let timeout = self.send_timeout;
        let Endpoint::Stream(stream) = &mut self.endpoint else {
            return Err(NetError::NotConnected);
        };
        let result = write_all_nonblocking(stream, data, timeout);
        if let Err(err) = &result {
            tracing::debug!(peer = %self.describe(), error = %err, "Send failed, closing");
            self.transport_close();
        }
        result.map_err(NetError::from)
    }

    /// Receive up to `max` bytes (0 means no limit on buffered data).
    ///
    /// `cb` runs synchronously when data is already available, otherwise
    /// once the socket is readable. It receives an empty buffer when the
    /// connection is gone.
    pub fn transport_recv(&mut self, max: usize, cb: RecvCallback) {
        if self.holdup.can_recurse() {
            let data = self.recv_common(max);
            if !data.is_empty() || self.remote_closed || !self.has_connection() {
                cb(self, data);
                return;
            }
        } else if !self.unrecv.is_empty() {
            // Everything needed is buffered; resume next tick with a fresh
            // stack instead of waiting for readability.
            self.holdup.set_idle(Box::new(move |s: &mut Socket| s.transport_recv(max, cb)));
            return;
        }
        self.holdup.set_socket(Box::new(move |s: &mut Socket| s.transport_recv(max, cb)));
    }

    /// Receive exactly `n` bytes.
    ///
    /// If the connection closes first, `cb` gets an empty buffer when
    /// [`callback_recv_on_close`](Self::callback_recv_on_close) is set and
    /// is dropped otherwise.
    pub fn transport_recv_exact(&mut self, n: usize, cb: RecvCallback) {
        self.recv_exact_into(Vec::with_capacity(n), n, cb);
    }

    fn recv_exact_into(&mut self, acc: Vec<u8>, n: usize, cb: RecvCallback) {
        if acc.len() == n {
            cb(self, acc);
            return;
        }
        let want = n - acc.len();
        self.transport_recv(
            want,
            Box::new(move |s: &mut Socket, data: Vec<u8>| {
                if data.is_empty() {
                    s.deliver_close(cb);
                    return;
                }
                let mut acc = acc;
                acc.extend_from_slice(&data);
                s.recv_exact_into(acc, n, cb);
            }),
        );
    }

    /// Push bytes back so the next receive returns them first.
    pub fn transport_unrecv(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        let tail = mem::replace(&mut self.unrecv, data);
        self.unrecv.extend_from_slice(&tail);
    }

    /// Whether a receive would return data right now.
    pub fn transport_has_data(&self) -> bool {
        if !self.unrecv.is_empty() {
            return true;
        }
        match &self.endpoint {
            Endpoint::Stream(stream) => stream.peek(&mut [0u8; 1]).is_ok_and(|n| n > 0),
            _ => false,
        }
    }

    /// Close the descriptor without any protocol-level goodbye.
    pub fn transport_close(&mut self) {
        if self.has_connection() {
            tracing::trace!(peer = %self.describe(), "Closing transport");
        }
        self.endpoint = Endpoint::None;
    }

    fn recv_common(&mut self, max: usize) -> Vec<u8> {
        if !self.unrecv.is_empty() {
            if max == 0 || self.unrecv.len() <= max {
                return mem::take(&mut self.unrecv);
            }
            let rest = self.unrecv.split_off(max);
            return mem::replace(&mut self.unrecv, rest);
        }

        let Endpoint::Stream(stream) = &mut self.endpoint else {
            return Vec::new();
        };
        let mut buf = vec![0u8; if max == 0 { DEFAULT_RECV_MAX } else { max }];
        match stream.read(&mut buf) {
            Ok(0) => {
                self.remote_closed = true;
                self.transport_close();
                Vec::new()
            }
            Ok(n) => {
                buf.truncate(n);
                buf
            }
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Vec::new(),
            Err(err) => {
                tracing::debug!(peer = %self.describe(), error = %err, "Receive failed, closing");
                self.remote_closed = true;
                self.transport_close();
                Vec::new()
            }
        }
    }

    pub(crate) fn deliver_close(&mut self, cb: RecvCallback) {
        if self.callback_recv_on_close {
            cb(self, Vec::new());
        }
    }

    // ---- upper layer ------------------------------------------------------

    /// Send application data, through the record layer when encrypted.
    pub fn send(&mut self, data: &[u8]) -> Result<(), NetError> {
        if !self.tls_send.is_active() {
            return self.transport_send(data);
        }
        for fragment in data.chunks(MAX_FRAGMENT_LEN) {
            self.tls_send_record(ContentType::ApplicationData, fragment)?;
        }
        Ok(())
    }

    /// Receive the next chunk of application data.
    pub fn recv(&mut self, cb: RecvCallback) {
        if self.tls_recv.is_active() {
            self.tls_recv_application_data(cb);
        } else {
            self.transport_recv(DEFAULT_RECV_MAX, cb);
        }
    }

    /// Keep the socket scheduled, discarding anything the peer sends, until
    /// the connection closes.
    pub fn keep_alive(&mut self) {
        self.recv(Box::new(|s: &mut Socket, data: Vec<u8>| {
            if !data.is_empty() && s.has_connection() {
                s.keep_alive();
            }
        }));
    }

    /// Close the connection, saying goodbye with close_notify when
    /// encrypted.
    pub fn close(&mut self) {
        if self.tls_send.is_active() {
            self.tls_close(AlertDescription::CloseNotify);
        } else {
            self.transport_close();
        }
    }

    /// Run `cont` once `promise` has been fulfilled.
    pub fn await_promise<T: Send + 'static>(&mut self, promise: &Promise<T>, cont: ReadyCallback) {
        self.holdup.set_promise(Box::new(promise.clone()), cont);
    }

    /// Arm an idle holdup: `cont` runs on the next tick.
    pub fn defer(&mut self, cont: Continuation<Socket>) {
        self.holdup.set_idle(cont);
    }
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("peer", &self.peer)
            .field("connected", &self.has_connection())
            .field("encrypted", &self.is_encrypted())
            .field("holdup", &self.holdup)
            .field("close_reason", &self.close_reason)
            .finish_non_exhaustive()
    }
}

impl Worker for Socket {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Socket
    }

    fn holdup_kind(&self) -> HoldupKind {
        self.holdup.kind()
    }

    fn holdup_ready(&self) -> bool {
        self.holdup.is_ready()
    }

    fn fire_holdup(&mut self) {
        if let Some(cont) = self.holdup.take() {
            cont(self);
        }
    }

    fn clear_holdup(&mut self) {
        self.holdup.clear();
    }

    fn attach(&mut self, scheduler: &SchedulerHandle) {
        self.send_timeout = scheduler.config().send_timeout;
        self.scheduler = Some(scheduler.clone());
    }

    fn disposition(&self) -> Disposition {
        Disposition::Neutral
    }

    fn is_passive(&self) -> bool {
        self.passive
    }

    fn as_socket(&self) -> Option<&Socket> {
        Some(self)
    }

    fn as_socket_mut(&mut self) -> Option<&mut Socket> {
        Some(self)
    }

    fn describe(&self) -> String {
        Socket::describe(self)
    }
}

fn write_all_nonblocking(stream: &mut TcpStream, mut data: &[u8], timeout: Duration) -> io::Result<()> {
    let deadline = Instant::now() + timeout;
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out"));
                }
                let timeout_ms = remaining.as_millis().clamp(1, i32::MAX as u128) as i32;
                poll::wait_writable(stream.as_raw_fd(), timeout_ms)?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain old data; all-zero is a valid value
    // and is large and aligned enough for both address families.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

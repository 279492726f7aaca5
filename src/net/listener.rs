//! Accept loop as a passive socket worker.
//!
//! # Responsibilities
//! - Bind a listening socket
//! - Accept every pending connection whenever the socket polls readable
//! - Let the caller prepare each accepted socket (typically by starting a
//!   server handshake) before it joins the scheduler
//!
//! # Design Decisions
//! - The listener is passive: a scheduler left with only listeners stops
//! - Accepted sockets are queued through the listener's own
//!   [`SchedulerHandle`](crate::sched::SchedulerHandle)

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::net::socket::{AcceptHook, Socket};

pub struct Listener;

impl Listener {
    /// Listen on all interfaces. Add the returned socket to a scheduler to
    /// start accepting.
    pub fn bind<F>(port: u16, on_accept: F) -> io::Result<Socket>
    where
        F: FnMut(&mut Socket) + Send + 'static,
    {
        Self::bind_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port), on_accept)
    }

    pub fn bind_addr<F>(addr: SocketAddr, on_accept: F) -> io::Result<Socket>
    where
        F: FnMut(&mut Socket) + Send + 'static,
    {
        let mut socket = Socket::new();
        socket.bind_addr(addr)?;
        socket.set_passive(true);
        arm(&mut socket, Box::new(on_accept));
        Ok(socket)
    }
}

fn arm(listener: &mut Socket, mut on_accept: AcceptHook) {
    listener.holdup.set_socket(Box::new(move |s: &mut Socket| {
        let mut accepted = 0usize;
        while let Some(mut connection) = s.accept() {
            on_accept(&mut connection);
            match s.scheduler() {
                Some(scheduler) => {
                    scheduler.add_socket(connection);
                    accepted += 1;
                }
                None => {
                    tracing::warn!(listener = %s.describe(), "Listener is not attached to a scheduler, dropping connection");
                }
            }
        }
        if accepted > 0 {
            tracing::trace!(listener = %s.describe(), accepted, "Accepted connections");
        }
        if s.has_connection() {
            arm(s, on_accept);
        }
    }));
}

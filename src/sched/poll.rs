//! Thin wrapper over `poll(2)`.

use std::io;
use std::os::unix::io::RawFd;

pub type PollFd = libc::pollfd;

/// Entry that `poll` skips (negative descriptor), used as a placeholder for
/// workers that do not wait on a socket.
pub fn placeholder() -> PollFd {
    PollFd {
        fd: -1,
        events: 0,
        revents: 0,
    }
}

pub fn readable(fd: RawFd) -> PollFd {
    PollFd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

pub fn writable(fd: RawFd) -> PollFd {
    PollFd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    }
}

/// Poll the given set. Returns the number of entries with events; an
/// interrupted call reports zero.
pub fn poll(fds: &mut [PollFd], timeout_ms: i32) -> io::Result<usize> {
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(ret as usize)
}

/// Wait for a single descriptor to become writable. Returns the reported
/// events, or `None` on timeout.
pub fn wait_writable(fd: RawFd, timeout_ms: i32) -> io::Result<Option<i16>> {
    let mut fds = [writable(fd)];
    if poll(&mut fds, timeout_ms)? == 0 {
        return Ok(None);
    }
    Ok(Some(fds[0].revents))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn reports_readable_pipe() {
        let (r, w) = pipe();
        let mut fds = [readable(r), placeholder()];
        assert_eq!(poll(&mut fds, 0).unwrap(), 0);

        let n = unsafe { libc::write(w, b"x".as_ptr().cast(), 1) };
        assert_eq!(n, 1);
        assert_eq!(poll(&mut fds, 100).unwrap(), 1);
        assert_ne!(fds[0].revents & libc::POLLIN, 0);
        assert_eq!(fds[1].revents, 0);

        close(r);
        close(w);
    }

    #[test]
    fn empty_pipe_is_writable() {
        let (r, w) = pipe();
        let revents = wait_writable(w, 100).unwrap().unwrap();
        assert_ne!(revents & libc::POLLOUT, 0);
        close(r);
        close(w);
    }
}

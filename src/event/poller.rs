//! The polling side of the event dispatcher: whichever thread is elected
//! listener for a cycle calls [`Poller::poll`] to find out which registered
//! file descriptors became readable/writable.
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{Error, Result};

bitflags::bitflags! {
    pub struct Interest: u32 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub fd: RawFd,
    pub interest: Interest,
}

/// An edge-triggered, registration-based readiness poller.
///
/// The network acceptor and per-connection sockets are external
/// collaborators (see the crate's top-level docs); this trait is the seam
/// they plug `RawFd`s into. The bundled [`Poll`] implementation wraps a
/// plain `poll(2)` call, which is portable and adequate for the connection
/// counts a single dispatcher cycle needs to service; nothing here prevents
/// swapping in an epoll-backed implementation later.
pub trait EventSource {
    fn register(&mut self, fd: RawFd, interest: Interest);
    fn deregister(&mut self, fd: RawFd);
    /// Blocks up to `timeout` for at least one registered fd to become
    /// ready, appending readiness events to `out`. Returns the number of
    /// events appended.
    fn poll(&mut self, timeout: Duration, out: &mut Vec<Readiness>) -> Result<usize>;
}

/// A `poll(2)`-backed [`EventSource`].
pub struct Poll {
    fds: Vec<libc::pollfd>,
}

impl Default for Poll {
    fn default() -> Self {
        Self::new()
    }
}

impl Poll {
    pub fn new() -> Self {
        Poll { fds: Vec::new() }
    }
}

fn to_poll_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Interest::READABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::POLLOUT;
    }
    events as libc::c_short
}

impl EventSource for Poll {
    fn register(&mut self, fd: RawFd, interest: Interest) {
        self.deregister(fd);
        self.fds.push(libc::pollfd {
            fd,
            events: to_poll_events(interest),
            revents: 0,
        });
    }

    fn deregister(&mut self, fd: RawFd) {
        self.fds.retain(|p| p.fd != fd);
    }

    fn poll(&mut self, timeout: Duration, out: &mut Vec<Readiness>) -> Result<usize> {
        if self.fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(0);
        }
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                millis,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }
        let before = out.len();
        for entry in &self.fds {
            if entry.revents == 0 {
                continue;
            }
            let mut interest = Interest::empty();
            if entry.revents as i32 & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                interest |= Interest::READABLE;
            }
            if entry.revents as i32 & libc::POLLOUT != 0 {
                interest |= Interest::WRITABLE;
            }
            if !interest.is_empty() {
                out.push(Readiness {
                    fd: entry.fd,
                    interest,
                });
            }
        }
        Ok(out.len() - before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_with_no_registered_fds_times_out_without_error() {
        let mut poll = Poll::new();
        let mut out = Vec::new();
        let n = poll.poll(Duration::from_millis(1), &mut out).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn poll_reports_a_readable_pipe() {
        let mut fds = [0 as RawFd; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
        }
        let [read_fd, write_fd] = fds;
        let mut poll = Poll::new();
        poll.register(read_fd, Interest::READABLE);
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let mut out = Vec::new();
        let n = poll
            .poll(Duration::from_millis(500), &mut out)
            .expect("poll should succeed");
        assert_eq!(n, 1);
        assert_eq!(out[0].fd, read_fd);
        assert!(out[0].interest.contains(Interest::READABLE));
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}

use libc::{epoll_event, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD};
use std::io;
use std::os::fd::RawFd;
use tracing::trace;

/// Readiness flags raised alongside `EPOLLIN`/`EPOLLOUT` when the peer is
/// gone. Checked before normal read/write dispatch.
pub const EV_CLOSED: u32 =
    (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;

pub const EV_READ: u32 = libc::EPOLLIN as u32;
pub const EV_WRITE: u32 = libc::EPOLLOUT as u32;

/// Thin wrapper around the kernel event table.
///
/// One instance is shared between the dispatcher (register/wait/remove) and
/// the worker threads (re-arm after one-shot delivery). `epoll_ctl` is
/// thread-safe, so no locking is layered on top.
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd: RawFd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoll { epfd })
    }

    /// Registers `fd` for read readiness. Edge-triggered mode and one-shot
    /// delivery are independent bits: the listening socket and the signal
    /// pipe are never one-shot, connection sockets always are.
    pub fn register_read(&self, fd: RawFd, edge: bool, oneshot: bool) -> io::Result<()> {
        trace!("epoll add fd {fd} (et={edge}, oneshot={oneshot})");
        let mut ev = epoll_event {
            events: self.mask(EV_READ, edge, oneshot),
            u64: fd as u64,
        };
        self.ctl(EPOLL_CTL_ADD, fd, &mut ev)
    }

    /// Re-arms a one-shot connection fd for the next read or write event.
    pub fn rearm(&self, fd: RawFd, interest: u32, edge: bool) -> io::Result<()> {
        let mut ev = epoll_event {
            events: self.mask(interest, edge, true),
            u64: fd as u64,
        };
        self.ctl(EPOLL_CTL_MOD, fd, &mut ev)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        trace!("epoll del fd {fd}");
        let mut ev = epoll_event { events: 0, u64: 0 };
        self.ctl(EPOLL_CTL_DEL, fd, &mut ev)
    }

    /// Blocks until at least one registered fd is ready, filling `events`.
    /// An interrupting signal is not an error: the relay pipe carries the
    /// actual signal byte, so the wait just reports zero events.
    pub fn wait(&self, events: &mut Vec<epoll_event>) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                events.as_mut_ptr(),
                events.capacity() as i32,
                -1,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                unsafe { events.set_len(0) };
                return Ok(0);
            }
            return Err(err);
        }
        unsafe { events.set_len(n as usize) };
        Ok(n as usize)
    }

    fn mask(&self, interest: u32, edge: bool, oneshot: bool) -> u32 {
        let mut events: u32 = interest | libc::EPOLLRDHUP as u32;
        if edge {
            events |= libc::EPOLLET as u32;
        }
        if oneshot {
            events |= libc::EPOLLONESHOT as u32;
        }
        events
    }

    fn ctl(&self, op: i32, fd: RawFd, ev: &mut epoll_event) -> io::Result<()> {
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, ev) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

// Raw fd plus thread-safe syscalls only.
unsafe impl Send for Epoll {}
unsafe impl Sync for Epoll {}

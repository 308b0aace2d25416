use super::socket_helpers::set_nonblocking;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::trace;

/// Write end of the relay pipe, visible to the async-signal handler.
/// -1 until a [`SignalPipe`] is created; one relay per process.
static RELAY_FD: AtomicI32 = AtomicI32::new(-1);

/// Flags decoded from one drain of the relay pipe.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SignalFlags {
    pub tick_due: bool,
    pub stop_requested: bool,
}

/// The handler does nothing but push the signal number into the pipe.
/// Anything more would race with the dispatcher thread's state; this is
/// the only async-signal-safe hand-off the design allows.
extern "C" fn relay_handler(sig: libc::c_int) {
    unsafe {
        let errno_ptr = libc::__errno_location();
        let saved = *errno_ptr;
        let fd = RELAY_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            let byte = sig as u8;
            libc::send(fd, &byte as *const u8 as *const libc::c_void, 1, 0);
        }
        *errno_ptr = saved;
    }
}

/// Self-pipe relaying signal arrivals into the readiness multiplexer.
///
/// The read end is registered in epoll next to the sockets; the dispatcher
/// drains it and turns bytes back into tick/stop flags. Owns both fds.
pub struct SignalPipe {
    read_fd: RawFd,
    write_fd: RawFd,
    tick_secs: u64,
}

impl SignalPipe {
    /// Creates the pipe, installs the SIGALRM/SIGTERM relay handlers,
    /// ignores SIGPIPE and arms the first tick alarm.
    pub fn install(tick_secs: u64) -> io::Result<SignalPipe> {
        let mut fds: [RawFd; 2] = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        // A full pipe must never block the handler.
        set_nonblocking(write_fd);
        set_nonblocking(read_fd);
        RELAY_FD.store(write_fd, Ordering::SeqCst);

        Self::register(libc::SIGALRM, relay_handler as usize)?;
        Self::register(libc::SIGTERM, relay_handler as usize)?;
        Self::register(libc::SIGPIPE, libc::SIG_IGN)?;

        unsafe { libc::alarm(tick_secs as libc::c_uint) };
        Ok(SignalPipe {
            read_fd,
            write_fd,
            tick_secs,
        })
    }

    /// Builds an unarmed pipe with no handlers, for exercising the drain
    /// path without touching process signal state.
    #[cfg(test)]
    pub fn unarmed() -> io::Result<SignalPipe> {
        let mut fds: [RawFd; 2] = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        set_nonblocking(fds[0]);
        set_nonblocking(fds[1]);
        Ok(SignalPipe {
            read_fd: fds[0],
            write_fd: fds[1],
            tick_secs: 1,
        })
    }

    fn register(sig: libc::c_int, action: usize) -> io::Result<()> {
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = action;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigfillset(&mut sa.sa_mask);
            if libc::sigaction(sig, &sa, std::ptr::null_mut()) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    #[cfg(test)]
    pub fn write_fd(&self) -> RawFd {
        self.write_fd
    }

    /// Drains every buffered byte and folds the batch into flags. Several
    /// coalesced SIGALRMs still mean one tick.
    pub fn drain(&self) -> SignalFlags {
        let mut flags = SignalFlags::default();
        let mut buf = [0u8; 1024];
        loop {
            let n = unsafe {
                libc::recv(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n <= 0 {
                break;
            }
            for &byte in &buf[..n as usize] {
                match i32::from(byte) {
                    libc::SIGALRM => flags.tick_due = true,
                    libc::SIGTERM => flags.stop_requested = true,
                    other => trace!("unexpected signal byte {other} in relay"),
                }
            }
        }
        flags
    }

    /// Schedules the next tick. Called after every sweep.
    pub fn rearm_tick(&self) {
        unsafe { libc::alarm(self.tick_secs as libc::c_uint) };
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        RELAY_FD.compare_exchange(
            self.write_fd,
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .ok();
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(pipe: &SignalPipe, sig: i32) {
        let byte = sig as u8;
        let n = unsafe {
            libc::send(
                pipe.write_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
                0,
            )
        };
        assert_eq!(n, 1);
    }

    #[test]
    fn drain_decodes_tick_and_stop() {
        let pipe = SignalPipe::unarmed().unwrap();
        push(&pipe, libc::SIGALRM);
        push(&pipe, libc::SIGTERM);
        let flags = pipe.drain();
        assert!(flags.tick_due);
        assert!(flags.stop_requested);
    }

    #[test]
    fn coalesced_alarms_fold_into_one_tick() {
        let pipe = SignalPipe::unarmed().unwrap();
        for _ in 0..5 {
            push(&pipe, libc::SIGALRM);
        }
        let flags = pipe.drain();
        assert!(flags.tick_due);
        assert!(!flags.stop_requested);
        // Fully drained: a second drain sees nothing.
        assert_eq!(pipe.drain(), SignalFlags::default());
    }

    #[test]
    fn empty_pipe_reports_no_flags() {
        let pipe = SignalPipe::unarmed().unwrap();
        assert_eq!(pipe.drain(), SignalFlags::default());
    }
}

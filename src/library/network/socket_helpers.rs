use libc::{fcntl, O_NONBLOCK};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::size_of;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::trace;

const LISTEN_BACKLOG: i32 = 1024;

/// Builds the listening socket: reuse-addr, optional linger-on-close,
/// bind, listen, non-blocking. Port 0 asks the kernel for an ephemeral
/// port; the caller reads the bound address back off the listener.
pub fn build_listener(addr: SocketAddr, linger: bool) -> io::Result<TcpListener> {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    listener.set_reuse_address(true)?;
    if linger {
        // Graceful close: block up to a second flushing unsent bytes.
        listener.set_linger(Some(Duration::from_secs(1)))?;
    }
    listener.bind(&SockAddr::from(addr))?;
    listener.listen(LISTEN_BACKLOG)?;
    listener.set_nonblocking(true)?;
    Ok(listener.into())
}

/// Prepares a freshly accepted connection socket: no Nagle, non-blocking.
pub fn prepare_incoming_socket(client_fd: RawFd) {
    let flag: i32 = 1;
    unsafe {
        libc::setsockopt(
            client_fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &flag as *const _ as *const libc::c_void,
            size_of::<i32>() as libc::socklen_t,
        );
    }
    set_nonblocking(client_fd);
    trace!("prepared client fd {client_fd}");
}

pub fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = fcntl(fd, libc::F_GETFL);
        fcntl(fd, libc::F_SETFL, flags | O_NONBLOCK);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_ephemeral_port() {
        let listener =
            build_listener("127.0.0.1:0".parse().unwrap(), false).expect("bind");
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn listener_with_linger_binds() {
        let listener =
            build_listener("127.0.0.1:0".parse().unwrap(), true).expect("bind");
        assert!(listener.local_addr().is_ok());
    }
}

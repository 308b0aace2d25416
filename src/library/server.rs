use crate::library::{
    config::{Config, DispatchMode},
    db::Context,
    http::response::BUSY_RESPONSE,
    network::{
        epoll::{Epoll, EV_CLOSED, EV_READ, EV_WRITE},
        signal_pipe::SignalPipe,
        socket_helpers::{build_listener, prepare_incoming_socket},
    },
    server_internals::{Registry, MAX_EVENTS, MAX_FD, TICKS_PER_TIMEOUT},
    timer::TimerList,
    workers::{Task, TaskKind, WorkerPool},
};
use libc::epoll_event;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Everything the dispatch strategies operate on: the fd-indexed registry,
/// the multiplexer, the worker pool and the idle-timer list. Owned by the
/// dispatcher thread; only the registry and epoll handles are shared out.
pub struct ServerCore {
    registry: Arc<Registry>,
    epoll: Arc<Epoll>,
    workers: WorkerPool,
    timers: TimerList,
    conn_et: bool,
    idle_timeout: Duration,
}

impl ServerCore {
    /// Registers a fresh connection: slot init, epoll membership, timer.
    fn admit(&mut self, fd: RawFd, addr: SocketAddr) {
        let Some(slot) = self.registry.slot(fd) else {
            unsafe { libc::close(fd) };
            return;
        };
        slot.lock().init(fd, addr, self.conn_et);
        slot.done.store(false, Ordering::Release);
        slot.should_close.store(false, Ordering::Release);
        if let Err(e) = self.epoll.register_read(fd, self.conn_et, true) {
            error!("failed to register fd {fd}: {e}");
            slot.lock().finalize();
            return;
        }
        self.timers.add(fd, addr, Instant::now() + self.idle_timeout);
        self.registry.add_one();
        info!("accepted {addr} on fd {fd} ({} active)", self.registry.active());
    }

    /// Pushes the idle deadline out after I/O activity.
    fn renew(&mut self, fd: RawFd) {
        self.timers.renew(fd, Instant::now() + self.idle_timeout);
        debug!("adjust timer once");
    }

    /// Immediate expiry: unlink the timer, then run the close path. The
    /// timer removal gates the close, so a connection torn down here can
    /// never be closed again by the sweep (and vice versa).
    fn expire_now(&mut self, fd: RawFd) {
        if let Some(payload) = self.timers.remove(fd) {
            self.close_connection(payload.fd);
        }
    }

    fn close_connection(&mut self, fd: RawFd) {
        let _ = self.epoll.remove(fd);
        if let Some(slot) = self.registry.slot(fd) {
            slot.lock().finalize();
            slot.done.store(false, Ordering::Release);
            slot.should_close.store(false, Ordering::Release);
        }
        self.registry.drop_one();
        info!("closed connection on fd {fd}");
    }

    /// Reactor-mode completion wait: a literal spin on the done flag. The
    /// dispatcher does not advance to the next ready event until the
    /// submitted task finishes, which serializes reactor-mode dispatch.
    fn spin_wait_should_close(&self, fd: RawFd) -> bool {
        let Some(slot) = self.registry.slot(fd) else {
            return false;
        };
        while !slot.done.swap(false, Ordering::AcqRel) {
            std::hint::spin_loop();
        }
        slot.should_close.swap(false, Ordering::AcqRel)
    }
}

/// Connection-event handling, selected once at startup.
trait DispatchStrategy {
    fn on_readable(&self, core: &mut ServerCore, fd: RawFd);
    fn on_writable(&self, core: &mut ServerCore, fd: RawFd);
}

/// Workers perform the socket I/O themselves; the dispatcher renews the
/// timer up front and waits for the task to report back.
struct ReactorModel;

impl DispatchStrategy for ReactorModel {
    fn on_readable(&self, core: &mut ServerCore, fd: RawFd) {
        core.renew(fd);
        core.workers.submit(Task {
            fd,
            kind: TaskKind::Read,
        });
        if core.spin_wait_should_close(fd) {
            core.expire_now(fd);
        }
    }

    fn on_writable(&self, core: &mut ServerCore, fd: RawFd) {
        core.renew(fd);
        core.workers.submit(Task {
            fd,
            kind: TaskKind::Write,
        });
        if core.spin_wait_should_close(fd) {
            core.expire_now(fd);
        }
    }
}

/// The dispatcher drives the non-blocking I/O to exhaustion itself and
/// hands workers an already-read request; failures and orderly closes
/// expire the connection without involving a worker.
struct ProactorModel;

impl DispatchStrategy for ProactorModel {
    fn on_readable(&self, core: &mut ServerCore, fd: RawFd) {
        let read_ok = match core.registry.slot(fd) {
            Some(slot) => slot.lock().read_once(),
            None => return,
        };
        if read_ok {
            core.workers.submit(Task {
                fd,
                kind: TaskKind::Process,
            });
            core.renew(fd);
        } else {
            core.expire_now(fd);
        }
    }

    fn on_writable(&self, core: &mut ServerCore, fd: RawFd) {
        let write_ok = match core.registry.slot(fd) {
            Some(slot) => slot.lock().write(&core.epoll),
            None => return,
        };
        if write_ok {
            core.renew(fd);
        } else {
            core.expire_now(fd);
        }
    }
}

/// The event dispatcher. One instance per process: owns the listener, the
/// epoll set, the signal relay, the timer list and the worker pool, and
/// runs the main loop on the calling thread.
pub struct Server {
    core: ServerCore,
    strategy: Box<dyn DispatchStrategy + Send>,
    listener: TcpListener,
    pipe: SignalPipe,
    listen_et: bool,
    max_clients: usize,
}

impl Server {
    pub fn bind(cfg: &Config, ctx: Arc<Context>) -> io::Result<Server> {
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
        let listener = build_listener(addr, cfg.linger)?;
        let epoll = Arc::new(Epoll::new()?);
        epoll.register_read(listener.as_raw_fd(), cfg.listen_edge_triggered(), false)?;

        let pipe = SignalPipe::install(cfg.tick_secs)?;
        epoll.register_read(pipe.read_fd(), false, false)?;

        let registry = Arc::new(Registry::new(MAX_FD));
        let workers = WorkerPool::new(
            cfg.effective_threads(),
            cfg.queue_capacity,
            Arc::clone(&registry),
            Arc::clone(&epoll),
            ctx,
        )?;

        let strategy: Box<dyn DispatchStrategy + Send> = match cfg.dispatch_mode() {
            DispatchMode::Reactor => Box::new(ReactorModel),
            DispatchMode::Proactor => Box::new(ProactorModel),
        };
        info!(
            "dispatch model {:?}, listen {} / conn {} triggered",
            cfg.dispatch_mode(),
            if cfg.listen_edge_triggered() { "edge" } else { "level" },
            if cfg.conn_edge_triggered() { "edge" } else { "level" },
        );

        Ok(Server {
            core: ServerCore {
                registry,
                epoll,
                workers,
                timers: TimerList::new(MAX_FD),
                conn_et: cfg.conn_edge_triggered(),
                idle_timeout: Duration::from_secs(cfg.tick_secs) * TICKS_PER_TIMEOUT,
            },
            strategy,
            listener,
            pipe,
            listen_et: cfg.listen_edge_triggered(),
            max_clients: cfg.max_connections.min(MAX_FD),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The main loop: block on the multiplexer, classify each ready fd,
    /// then run the timer sweep if a tick landed during the batch. Exits
    /// after finishing the batch in which a termination signal arrived.
    pub fn run(mut self) -> io::Result<()> {
        let listen_fd = self.listener.as_raw_fd();
        let pipe_fd = self.pipe.read_fd();
        let mut events: Vec<epoll_event> = Vec::with_capacity(MAX_EVENTS);
        let mut tick_due = false;
        let mut stop = false;

        info!("dispatcher entering event loop");
        while !stop {
            self.core.epoll.wait(&mut events)?;
            for i in 0..events.len() {
                let mask = events[i].events;
                let fd = events[i].u64 as RawFd;
                if fd == listen_fd {
                    self.accept_burst();
                } else if mask & EV_CLOSED != 0 {
                    self.core.expire_now(fd);
                } else if fd == pipe_fd && mask & EV_READ != 0 {
                    let flags = self.pipe.drain();
                    tick_due |= flags.tick_due;
                    stop |= flags.stop_requested;
                } else if mask & EV_READ != 0 {
                    self.strategy.on_readable(&mut self.core, fd);
                } else if mask & EV_WRITE != 0 {
                    self.strategy.on_writable(&mut self.core, fd);
                }
            }
            if tick_due {
                let expired = self.core.timers.sweep(Instant::now());
                for payload in expired {
                    info!(
                        "idle timeout, evicting {} (fd {})",
                        payload.addr, payload.fd
                    );
                    self.core.close_connection(payload.fd);
                }
                debug!("timer tick");
                self.pipe.rearm_tick();
                tick_due = false;
            }
        }
        info!("stop requested; dispatcher exiting");
        Ok(())
    }

    /// Level-triggered listeners accept one connection per wakeup; edge-
    /// triggered ones must drain the whole pending backlog, because the
    /// edge fires only once per arrival burst.
    fn accept_burst(&mut self) {
        if !self.listen_et {
            let _ = self.accept_one();
        } else {
            while self.accept_one() {}
        }
    }

    fn accept_one(&mut self) -> bool {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let fd = stream.into_raw_fd();
                if self.core.registry.active() >= self.max_clients
                    || fd as usize >= self.core.registry.capacity()
                {
                    warn!(
                        "at capacity ({} active), refusing {addr}",
                        self.core.registry.active()
                    );
                    refuse_busy(fd);
                    return false;
                }
                prepare_incoming_socket(fd);
                self.core.admit(fd, addr);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                error!("accept failed: {e}");
                false
            }
        }
    }
}

/// Answers an over-capacity connection with the canned busy response and
/// drops it, before it ever touches the registry or the timer list.
fn refuse_busy(fd: RawFd) {
    unsafe {
        libc::send(
            fd,
            BUSY_RESPONSE.as_ptr() as *const libc::c_void,
            BUSY_RESPONSE.len(),
            0,
        );
        libc::close(fd);
    }
}

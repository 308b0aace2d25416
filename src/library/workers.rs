use crate::library::db::Context;
use crate::library::network::epoll::Epoll;
use crate::library::server_internals::Registry;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, trace};

/// What a submitted task asks the worker to do with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Reactor mode: perform the read, then parse and stage a response.
    Read,
    /// Reactor mode: perform the pending send.
    Write,
    /// Proactor mode: the dispatcher already read; parse and stage only.
    Process,
}

#[derive(Debug, Clone, Copy)]
pub struct Task {
    pub fd: RawFd,
    pub kind: TaskKind,
}

/// Fixed set of worker threads fed from one bounded queue.
///
/// Fire-and-forget submission; results travel back through each slot's
/// done/should_close flag pair. Workers block only on the queue and on the
/// resource pool, never inside socket I/O.
pub struct WorkerPool {
    tx: Sender<Task>,
}

impl WorkerPool {
    pub fn new(
        threads: usize,
        queue_capacity: usize,
        registry: Arc<Registry>,
        epoll: Arc<Epoll>,
        ctx: Arc<Context>,
    ) -> io::Result<WorkerPool> {
        let (tx, rx) = bounded::<Task>(queue_capacity);
        for id in 0..threads.max(1) {
            let rx: Receiver<Task> = rx.clone();
            let registry = Arc::clone(&registry);
            let epoll = Arc::clone(&epoll);
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name(format!("muon-worker-{id}"))
                .spawn(move || worker_loop(id, rx, registry, epoll, ctx))?;
        }
        info!("worker pool up with {} threads", threads.max(1));
        Ok(WorkerPool { tx })
    }

    /// Enqueues a task, blocking when the queue is at capacity. The
    /// dispatcher never has more than one task in flight per connection.
    pub fn submit(&self, task: Task) {
        if self.tx.send(task).is_err() {
            debug!("worker pool gone, dropping task for fd {}", task.fd);
        }
    }
}

fn worker_loop(
    id: usize,
    rx: Receiver<Task>,
    registry: Arc<Registry>,
    epoll: Arc<Epoll>,
    ctx: Arc<Context>,
) {
    trace!("worker {id} online");
    while let Ok(task) = rx.recv() {
        let Some(slot) = registry.slot(task.fd) else {
            continue;
        };
        let healthy = {
            let mut conn = slot.lock();
            match task.kind {
                TaskKind::Read => conn.read_once() && conn.process(&epoll, &ctx),
                TaskKind::Write => conn.write(&epoll),
                TaskKind::Process => conn.process(&epoll, &ctx),
            }
        };
        if !healthy {
            slot.should_close.store(true, Ordering::Release);
        }
        slot.done.store(true, Ordering::Release);
    }
    trace!("worker {id} draining out");
}

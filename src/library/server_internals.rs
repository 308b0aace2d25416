use crate::library::http::conn::HttpConn;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Upper bound on fd numbers the registry can index; one slot per fd.
pub const MAX_FD: usize = 65536;

/// Largest batch one multiplexer wait may deliver.
pub const MAX_EVENTS: usize = 10000;

/// Idle deadline is this many ticks out; renewed on every I/O.
pub const TICKS_PER_TIMEOUT: u32 = 3;

/// One connection slot: the state machine plus the completion flag pair
/// workers use to report back to the dispatcher.
///
/// `done` flips true when a submitted task finishes; `should_close` rides
/// along when the worker decided the connection is beyond saving. The
/// dispatcher is the only reader and resets both.
pub struct ConnSlot {
    pub conn: Mutex<HttpConn>,
    pub done: AtomicBool,
    pub should_close: AtomicBool,
}

impl Default for ConnSlot {
    fn default() -> Self {
        ConnSlot {
            conn: Mutex::new(HttpConn::default()),
            done: AtomicBool::new(false),
            should_close: AtomicBool::new(false),
        }
    }
}

impl ConnSlot {
    pub fn lock(&self) -> MutexGuard<'_, HttpConn> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-capacity fd-indexed table of connection slots. Slot membership is
/// mutated only by the dispatcher thread; workers reach slots through the
/// per-slot mutex, and never two at once for the same fd.
pub struct Registry {
    slots: Vec<ConnSlot>,
    active: AtomicUsize,
}

impl Registry {
    pub fn new(capacity: usize) -> Registry {
        Registry {
            slots: (0..capacity).map(|_| ConnSlot::default()).collect(),
            active: AtomicUsize::new(0),
        }
    }

    pub fn slot(&self, fd: RawFd) -> Option<&ConnSlot> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn add_one(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub fn drop_one(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_resolve_by_fd_and_reject_out_of_range() {
        let registry = Registry::new(8);
        assert!(registry.slot(0).is_some());
        assert!(registry.slot(7).is_some());
        assert!(registry.slot(8).is_none());
        assert!(registry.slot(-1).is_none());
    }

    #[test]
    fn active_count_tracks_adds_and_drops() {
        let registry = Registry::new(4);
        registry.add_one();
        registry.add_one();
        assert_eq!(registry.active(), 2);
        registry.drop_one();
        assert_eq!(registry.active(), 1);
    }
}

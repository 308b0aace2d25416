use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Instant;
use tracing::trace;

/// What the sweep hands back for each evicted connection. By the time the
/// caller sees a payload, its node is already unlinked: the list has exactly
/// one removal path, so a close can never run twice for the same timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerPayload {
    pub fd: RawFd,
    pub addr: SocketAddr,
}

#[derive(Debug)]
struct Node {
    expire: Instant,
    addr: SocketAddr,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Idle-timeout list: one timer per live connection, kept sorted ascending
/// by expiry in a doubly-linked chain threaded through an arena indexed by
/// fd. The arena owns every node; connections refer to theirs by fd only.
///
/// Only the dispatcher thread touches this structure, so it carries no
/// locking of its own.
pub struct TimerList {
    slots: Vec<Option<Node>>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl TimerList {
    pub fn new(capacity: usize) -> TimerList {
        TimerList {
            slots: (0..capacity).map(|_| None).collect(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.slots
            .get(fd as usize)
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Registers a timer for `fd`. A leftover entry for the same fd (a
    /// recycled descriptor) is unlinked first, so the one-timer-per-
    /// connection invariant holds across fd reuse.
    pub fn add(&mut self, fd: RawFd, addr: SocketAddr, expire: Instant) {
        let idx = fd as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        if self.slots[idx].is_some() {
            self.unlink(idx);
        }
        self.slots[idx] = Some(Node {
            expire,
            addr,
            prev: None,
            next: None,
        });
        self.splice_in(idx, self.head);
        self.len += 1;
    }

    /// Pushes the deadline of `fd` out to `expire`. Activity only ever moves
    /// a deadline later, so the node is re-spliced forward from its old
    /// successor, never backward.
    pub fn renew(&mut self, fd: RawFd, expire: Instant) {
        let idx = fd as usize;
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };
        let Some(node) = slot.as_mut() else {
            return;
        };
        debug_assert!(
            expire >= node.expire,
            "renewal may only move a deadline forward"
        );
        node.expire = expire;
        let next = node.next;
        let in_place = match next {
            Some(n) => self.node(n).expire >= expire,
            None => true,
        };
        if in_place {
            return;
        }
        trace!("timer for fd {fd} re-spliced forward");
        // unlink detaches the node but leaves it in its slot, ready to be
        // threaded back in from its old successor.
        self.unlink(idx);
        self.splice_in(idx, next);
        self.len += 1;
    }

    /// Unlinks and returns the timer for `fd`, if one is live.
    pub fn remove(&mut self, fd: RawFd) -> Option<TimerPayload> {
        let idx = fd as usize;
        if !self.contains(fd) {
            return None;
        }
        self.unlink(idx);
        self.slots[idx].take().map(|node| TimerPayload {
            fd,
            addr: node.addr,
        })
    }

    /// Evicts every entry whose deadline has passed, in ascending expiry
    /// order. Sortedness bounds the walk: it stops at the first entry still
    /// in the future. Each payload is unlinked before it is returned.
    pub fn sweep(&mut self, now: Instant) -> Vec<TimerPayload> {
        let mut expired: Vec<TimerPayload> = Vec::new();
        while let Some(h) = self.head {
            if self.node(h).expire > now {
                break;
            }
            self.unlink(h);
            if let Some(node) = self.slots[h].take() {
                expired.push(TimerPayload {
                    fd: h as RawFd,
                    addr: node.addr,
                });
            }
        }
        expired
    }

    fn node(&self, idx: usize) -> &Node {
        self.slots[idx].as_ref().unwrap()
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.slots[idx].as_mut().unwrap()
    }

    /// Links `idx` into the chain, scanning forward from `from` (or from the
    /// head when `from` is None / the node sorts before it).
    fn splice_in(&mut self, idx: usize, from: Option<usize>) {
        let expire = self.node(idx).expire;
        let start = match (from, self.head) {
            (_, None) => {
                self.head = Some(idx);
                self.tail = Some(idx);
                return;
            }
            (Some(f), Some(_)) => f,
            (None, Some(h)) => h,
        };
        if expire < self.node(start).expire {
            // Earliest deadline so far: prepend. Renewals never land here
            // (the scan start already sorts at or after them), only adds.
            let h = self.head.unwrap();
            self.node_mut(idx).next = Some(h);
            self.node_mut(h).prev = Some(idx);
            self.head = Some(idx);
            return;
        }
        let mut cur = start;
        while let Some(next) = self.node(cur).next {
            if self.node(next).expire > expire {
                break;
            }
            cur = next;
        }
        let next = self.node(cur).next;
        self.node_mut(idx).prev = Some(cur);
        self.node_mut(idx).next = next;
        self.node_mut(cur).next = Some(idx);
        match next {
            Some(n) => self.node_mut(n).prev = Some(idx),
            None => self.tail = Some(idx),
        }
    }

    /// The single place a node leaves the chain.
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
        self.len -= 1;
    }

    #[cfg(test)]
    fn chain(&self) -> Vec<(RawFd, Instant)> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            let node = self.node(idx);
            out.push((idx as RawFd, node.expire));
            cur = node.next;
        }
        out
    }

    #[cfg(test)]
    fn assert_sorted(&self) {
        let chain = self.chain();
        assert_eq!(chain.len(), self.len, "len out of sync with chain");
        for pair in chain.windows(2) {
            assert!(pair[0].1 <= pair[1].1, "chain out of order: {chain:?}");
        }
        // Walk backward too: prev pointers must mirror next pointers.
        let mut back = Vec::new();
        let mut cur = self.tail;
        while let Some(idx) = cur {
            back.push(idx as RawFd);
            cur = self.node(idx).prev;
        }
        back.reverse();
        let forward: Vec<RawFd> = chain.iter().map(|c| c.0).collect();
        assert_eq!(forward, back, "prev/next chains disagree");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:4242".parse().unwrap()
    }

    #[test]
    fn inserts_keep_ascending_order_for_any_arrival_order() {
        let base = Instant::now();
        let mut list = TimerList::new(64);
        // Deterministic scramble of deadlines.
        let offsets: [u64; 10] = [7, 1, 9, 3, 3, 8, 0, 5, 2, 6];
        for (fd, off) in offsets.iter().enumerate() {
            list.add(fd as RawFd, addr(), base + Duration::from_secs(*off));
            list.assert_sorted();
        }
        assert_eq!(list.len(), 10);
        assert_eq!(list.chain()[0].1, base);
    }

    #[test]
    fn one_timer_per_fd_even_when_added_twice() {
        let base = Instant::now();
        let mut list = TimerList::new(8);
        list.add(3, addr(), base + Duration::from_secs(1));
        list.add(3, addr(), base + Duration::from_secs(5));
        assert_eq!(list.len(), 1);
        list.assert_sorted();
    }

    #[test]
    fn renew_moves_forward_and_never_backward() {
        let base = Instant::now();
        let mut list = TimerList::new(16);
        for fd in 0..5 {
            list.add(fd, addr(), base + Duration::from_secs(fd as u64 + 1));
        }
        // fd 1 was second-earliest; pushing it past everyone must place it
        // last and keep order.
        list.renew(1, base + Duration::from_secs(30));
        list.assert_sorted();
        let chain = list.chain();
        assert_eq!(chain.last().unwrap().0, 1);
        // Renewing to a deadline that already fits in place is a no-op move.
        list.renew(0, base + Duration::from_millis(1100));
        list.assert_sorted();
        assert_eq!(list.chain()[0].0, 0);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn renew_of_unknown_fd_is_ignored() {
        let mut list = TimerList::new(8);
        list.renew(7, Instant::now());
        assert!(list.is_empty());
    }

    #[test]
    fn remove_unlinks_middle_head_and_tail() {
        let base = Instant::now();
        let mut list = TimerList::new(16);
        for fd in 0..4 {
            list.add(fd, addr(), base + Duration::from_secs(fd as u64));
        }
        assert!(list.remove(2).is_some());
        list.assert_sorted();
        assert!(list.remove(0).is_some());
        list.assert_sorted();
        assert!(list.remove(3).is_some());
        list.assert_sorted();
        assert_eq!(list.len(), 1);
        // Second removal of the same fd yields nothing.
        assert!(list.remove(2).is_none());
    }

    #[test]
    fn sweep_takes_due_entries_in_order_and_spares_the_rest() {
        let base = Instant::now();
        let mut list = TimerList::new(16);
        list.add(5, addr(), base + Duration::from_secs(2));
        list.add(6, addr(), base + Duration::from_secs(1));
        list.add(7, addr(), base + Duration::from_secs(10));
        list.add(8, addr(), base + Duration::from_secs(3));

        let now = base + Duration::from_secs(3);
        let expired = list.sweep(now);
        let fds: Vec<RawFd> = expired.iter().map(|p| p.fd).collect();
        // Ascending expiry order, boundary (== now) included.
        assert_eq!(fds, vec![6, 5, 8]);
        assert_eq!(list.len(), 1);
        assert!(list.contains(7));
        list.assert_sorted();
    }

    #[test]
    fn sweep_at_exact_boundary_is_inclusive() {
        let base = Instant::now();
        let mut list = TimerList::new(8);
        list.add(1, addr(), base);
        let expired = list.sweep(base);
        assert_eq!(expired.len(), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn renewed_connection_survives_the_sweep_that_would_have_taken_it() {
        let base = Instant::now();
        let tick = Duration::from_secs(5);
        let mut list = TimerList::new(8);
        list.add(4, addr(), base + 3 * tick);
        list.add(9, addr(), base + 3 * tick);

        // fd 4 sees traffic one tick in; fd 9 stays idle.
        list.renew(4, base + tick + 3 * tick);
        let expired = list.sweep(base + 3 * tick);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].fd, 9);
        assert!(list.contains(4));
    }

    #[test]
    fn interleaved_operations_preserve_order() {
        let base = Instant::now();
        let mut list = TimerList::new(64);
        // Small fixed-step generator keeps the sequence deterministic.
        let mut seed: u64 = 0x5eed;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            seed >> 33
        };
        for round in 0..200u64 {
            let fd = (next() % 32) as RawFd;
            match next() % 4 {
                0 => list.add(fd, addr(), base + Duration::from_millis(next() % 10_000)),
                // Renewal deadlines grow with the round counter, matching
                // the production pattern where now + 3*tick only advances.
                1 => list.renew(fd, base + Duration::from_millis(10_000 + round * 50)),
                2 => {
                    list.remove(fd);
                }
                _ => {
                    list.sweep(base + Duration::from_millis(round * 40));
                }
            }
            list.assert_sorted();
        }
    }
}

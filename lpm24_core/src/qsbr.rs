//! Quiescent-state-based reclamation.
//!
//! Readers register once, go online, and periodically report a quiescent
//! state: a point where they hold nothing obtained from a table. A writer
//! that unlinked an extension group calls [`Qsbr::start`] for a token and
//! may reuse the group once [`Qsbr::check`] confirms every online reader has
//! reported since that token was issued. [`Qsbr::synchronize`] is the
//! blocking form.
//!
//! A thread must not call `synchronize` while it is itself an online reader
//! of the same `Qsbr`: it would wait for itself forever.

use crate::constants::DQ_RECLAIM_MAX;
use crate::errors::Error;
use crossbeam_queue::ArrayQueue;
use crossbeam_utils::{Backoff, CachePadded};
use log::{debug, trace, warn};
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Counter value of a reader that is offline.
const OFFLINE: u64 = 0;

pub struct Qsbr {
    token: CachePadded<AtomicU64>,
    counters: Box<[CachePadded<AtomicU64>]>,
    registered: Box<[AtomicBool]>,
}

impl Qsbr {
    pub fn new(max_readers: usize) -> Arc<Self> {
        Arc::new(Self {
            token: CachePadded::new(AtomicU64::new(1)),
            counters: (0..max_readers)
                .map(|_| CachePadded::new(AtomicU64::new(OFFLINE)))
                .collect(),
            registered: (0..max_readers).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    pub fn max_readers(&self) -> usize {
        self.registered.len()
    }

    /// Claims a reader slot. The reader starts offline.
    pub fn register_reader(self: &Arc<Self>) -> Result<QsbrReader, Error> {
        for (id, slot) in self.registered.iter().enumerate() {
            if slot
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.counters[id].store(OFFLINE, Ordering::Relaxed);
                trace!("[QSBR] reader {} registered", id);
                return Ok(QsbrReader {
                    qsbr: Arc::clone(self),
                    id,
                });
            }
        }
        warn!("[QSBR] all {} reader slots taken", self.max_readers());
        Err(Error::OutOfSpace)
    }

    /// Opens a grace period and returns its token. Stores made before this
    /// call are visible to any reader that later reports quiescent.
    pub fn start(&self) -> u64 {
        self.token.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// True once every online reader has reported since `token` was issued.
    pub fn check(&self, token: u64) -> bool {
        self.registered
            .iter()
            .zip(self.counters.iter())
            .filter(|(reg, _)| reg.load(Ordering::Acquire))
            .all(|(_, c)| {
                let seen = c.load(Ordering::Acquire);
                seen == OFFLINE || seen >= token
            })
    }

    /// Blocks until all readers online at the time of the call have passed
    /// a quiescent state. No timeout.
    pub fn synchronize(&self) {
        let token = self.start();
        let backoff = Backoff::new();
        while !self.check(token) {
            backoff.snooze();
        }
        trace!("[QSBR] grace period {} complete", token);
    }
}

/// A registered reader thread. Unregisters on drop.
pub struct QsbrReader {
    qsbr: Arc<Qsbr>,
    id: usize,
}

impl QsbrReader {
    /// Marks the reader as holding table references from now on.
    pub fn online(&self) {
        let t = self.qsbr.token.load(Ordering::Relaxed);
        self.qsbr.counters[self.id].store(t, Ordering::Relaxed);
        // Later table loads must not be hoisted above the store.
        fence(Ordering::SeqCst);
    }

    pub fn offline(&self) {
        self.qsbr.counters[self.id].store(OFFLINE, Ordering::Release);
    }

    /// Reports that no table reference obtained so far is still held.
    pub fn quiescent(&self) {
        let t = self.qsbr.token.load(Ordering::Acquire);
        self.qsbr.counters[self.id].store(t, Ordering::Release);
    }
}

impl Drop for QsbrReader {
    fn drop(&mut self) {
        self.offline();
        self.qsbr.registered[self.id].store(false, Ordering::Release);
        trace!("[QSBR] reader {} unregistered", self.id);
    }
}

/// Bounded FIFO of released items waiting for their grace period.
pub struct DeferQueue {
    qsbr: Arc<Qsbr>,
    queue: ArrayQueue<(u64, u32)>,
    // Popped during a reclaim but not yet safe; always older than `queue`.
    head: Option<(u64, u32)>,
    reclaim_threshold: u32,
    reclaim_max: u32,
}

impl DeferQueue {
    pub fn new(
        qsbr: Arc<Qsbr>,
        capacity: u32,
        reclaim_threshold: u32,
        reclaim_max: u32,
    ) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("defer queue capacity must be non-zero"));
        }
        if reclaim_threshold > capacity {
            return Err(Error::InvalidArgument(
                "reclaim threshold exceeds defer queue capacity",
            ));
        }
        Ok(Self {
            qsbr,
            queue: ArrayQueue::new(capacity as usize),
            head: None,
            reclaim_threshold,
            reclaim_max: if reclaim_max == 0 {
                DQ_RECLAIM_MAX
            } else {
                reclaim_max
            },
        })
    }

    pub fn len(&self) -> usize {
        self.queue.len() + usize::from(self.head.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn reclaim_max(&self) -> u32 {
        self.reclaim_max
    }

    pub fn qsbr(&self) -> &Arc<Qsbr> {
        &self.qsbr
    }

    /// Queues `item` behind a fresh grace period. Crossing the threshold
    /// triggers a batch reclaim first; a queue that stays full after one
    /// reclaim attempt rejects the item.
    pub fn enqueue(&mut self, item: u32, mut free_fn: impl FnMut(u32)) -> Result<(), Error> {
        if self.len() >= self.reclaim_threshold as usize {
            self.reclaim(self.reclaim_max, &mut free_fn);
        }
        if self.len() >= self.capacity() {
            self.reclaim(self.reclaim_max, &mut free_fn);
            if self.len() >= self.capacity() {
                warn!("[DQ] queue full ({} items), cannot defer {}", self.len(), item);
                return Err(Error::ReclamationUnavailable);
            }
        }
        let token = self.qsbr.start();
        self.queue
            .push((token, item))
            .map_err(|_| Error::ReclamationUnavailable)?;
        trace!("[DQ] deferred {} behind token {}", item, token);
        Ok(())
    }

    /// Frees up to `max` items whose grace period is over, oldest first.
    /// Returns `(freed, still_pending)`.
    pub fn reclaim(&mut self, max: u32, mut free_fn: impl FnMut(u32)) -> (u32, u32) {
        let mut freed = 0;
        while freed < max {
            let Some((token, item)) = self.head.take().or_else(|| self.queue.pop()) else {
                break;
            };
            if !self.qsbr.check(token) {
                self.head = Some((token, item));
                break;
            }
            free_fn(item);
            freed += 1;
        }
        if freed > 0 {
            debug!("[DQ] reclaimed {} items, {} pending", freed, self.len());
        }
        (freed, self.len() as u32)
    }

    /// Waits out one grace period, then frees everything queued.
    pub fn drain(&mut self, mut free_fn: impl FnMut(u32)) -> u32 {
        if self.is_empty() {
            return 0;
        }
        self.qsbr.synchronize();
        let mut freed = 0;
        while let Some((_, item)) = self.head.take().or_else(|| self.queue.pop()) {
            free_fn(item);
            freed += 1;
        }
        debug!("[DQ] drained {} items", freed);
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn check_passes_without_online_readers() {
        let q = Qsbr::new(4);
        let _r = q.register_reader().unwrap();
        let t = q.start();
        assert!(q.check(t));
        q.synchronize();
    }

    #[test]
    fn online_reader_holds_grace_period_until_quiescent() {
        let q = Qsbr::new(2);
        let r = q.register_reader().unwrap();
        r.online();
        let t = q.start();
        assert!(!q.check(t));
        r.quiescent();
        assert!(q.check(t));
        let t2 = q.start();
        assert!(!q.check(t2));
        r.offline();
        assert!(q.check(t2));
    }

    #[test]
    fn reader_slots_are_bounded_and_recycled() {
        let q = Qsbr::new(1);
        let r = q.register_reader().unwrap();
        assert_eq!(q.register_reader().err(), Some(Error::OutOfSpace));
        drop(r);
        assert!(q.register_reader().is_ok());
    }

    #[test]
    fn synchronize_waits_for_reader() {
        let q = Qsbr::new(2);
        let r = q.register_reader().unwrap();
        r.online();
        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let q = Arc::clone(&q);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                q.synchronize();
                done.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));
        r.quiescent();
        writer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn defer_queue_frees_in_order_after_grace_period() {
        let q = Qsbr::new(2);
        let r = q.register_reader().unwrap();
        r.online();
        let mut dq = DeferQueue::new(Arc::clone(&q), 4, 4, 0).unwrap();
        let mut freed = Vec::new();
        dq.enqueue(7, |g| freed.push(g)).unwrap();
        dq.enqueue(8, |g| freed.push(g)).unwrap();
        assert_eq!(dq.reclaim(16, |g| freed.push(g)), (0, 2));
        r.quiescent();
        assert_eq!(dq.reclaim(16, |g| freed.push(g)), (2, 0));
        assert_eq!(freed, vec![7, 8]);
    }

    #[test]
    fn full_defer_queue_rejects_when_nothing_is_safe() {
        let q = Qsbr::new(1);
        let r = q.register_reader().unwrap();
        r.online();
        let mut dq = DeferQueue::new(Arc::clone(&q), 2, 2, 1).unwrap();
        dq.enqueue(1, |_| {}).unwrap();
        dq.enqueue(2, |_| {}).unwrap();
        assert_eq!(dq.enqueue(3, |_| {}), Err(Error::ReclamationUnavailable));
        r.quiescent();
        let mut freed = Vec::new();
        dq.enqueue(3, |g| freed.push(g)).unwrap();
        assert_eq!(freed, vec![1]);
        assert_eq!(dq.len(), 2);
    }

    #[test]
    fn bad_defer_queue_parameters() {
        let q = Qsbr::new(1);
        assert!(DeferQueue::new(Arc::clone(&q), 0, 0, 0).is_err());
        assert!(DeferQueue::new(Arc::clone(&q), 4, 5, 0).is_err());
        assert_eq!(DeferQueue::new(q, 4, 0, 0).unwrap().reclaim_max(), DQ_RECLAIM_MAX);
    }
}

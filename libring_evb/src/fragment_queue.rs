//! Per-source fragment queues between the producers and the correlator.
//!
//! Producers call `queue` (never blocks); the correlator thread calls
//! `dequeue`, which suspends on a condition variable until work or EOF news
//! arrives and then drains everything queued in one atomic batch. FIFO
//! order within a source is preserved; ordering across sources is the
//! correlator's job, not this layer's.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use fxhash::{FxHashMap, FxHashSet};

use super::fragment::Fragment;

/// One atomic drain of the queues. `eof` lists sources that have signaled
/// end-of-stream since the previous dequeue.
#[derive(Debug, Default)]
pub struct Batch {
    pub fragments: Vec<Box<Fragment>>,
    pub eof: Vec<u32>,
}

#[derive(Default)]
struct QueueInner {
    queues: FxHashMap<u32, VecDeque<Box<Fragment>>>,
    registered: FxHashSet<u32>,
    ended: FxHashSet<u32>,
    eof_news: Vec<u32>,
    inflight: usize,
    queued: usize,
}

impl QueueInner {
    fn all_ended(&self) -> bool {
        !self.registered.is_empty() && self.ended.len() == self.registered.len()
    }
}

/// The shared input queue set. One logical FIFO per source id plus the
/// pipeline-wide inflight fragment count used for backpressure visibility.
#[derive(Default)]
pub struct FragmentQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl FragmentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a source before its first fragment. Queuing registers
    /// implicitly; explicit registration matters when the correlator must
    /// wait on a source that has not produced anything yet.
    pub fn register_source(&self, source_id: u32) {
        let mut inner = self.inner.lock().expect("fragment queue mutex poisoned");
        inner.registered.insert(source_id);
    }

    /// Append fragments to their sources' queues. Never blocks; bumps the
    /// inflight count by the number queued and wakes the consumer.
    pub fn queue(&self, fragments: Vec<Box<Fragment>>) {
        if fragments.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("fragment queue mutex poisoned");
        inner.inflight += fragments.len();
        inner.queued += fragments.len();
        for fragment in fragments {
            let source_id = fragment.header.source_id;
            inner.registered.insert(source_id);
            inner.queues.entry(source_id).or_default().push_back(fragment);
        }
        self.available.notify_all();
    }

    /// Signal that a source will produce no more fragments
    pub fn mark_eof(&self, source_id: u32) {
        let mut inner = self.inner.lock().expect("fragment queue mutex poisoned");
        inner.registered.insert(source_id);
        if inner.ended.insert(source_id) {
            inner.eof_news.push(source_id);
        }
        self.available.notify_all();
    }

    /// Signal EOF for every registered source (single-stream drivers call
    /// this when their input closes).
    pub fn finish(&self) {
        let mut inner = self.inner.lock().expect("fragment queue mutex poisoned");
        let pending: Vec<u32> = inner
            .registered
            .iter()
            .filter(|source_id| !inner.ended.contains(*source_id))
            .copied()
            .collect();
        for source_id in pending {
            inner.ended.insert(source_id);
            inner.eof_news.push(source_id);
        }
        self.available.notify_all();
    }

    /// Block until fragments or EOF notices are pending, then drain them
    /// atomically. Returns `None` once every source has ended and the
    /// queues are empty: the stream is over.
    ///
    /// The batch lists each source's fragments in FIFO order, sources in
    /// ascending id order.
    pub fn dequeue(&self) -> Option<Batch> {
        let mut inner = self.inner.lock().expect("fragment queue mutex poisoned");
        loop {
            if inner.queued > 0 || !inner.eof_news.is_empty() {
                let mut sources: Vec<u32> = inner
                    .queues
                    .iter()
                    .filter(|(_, q)| !q.is_empty())
                    .map(|(sid, _)| *sid)
                    .collect();
                sources.sort_unstable();
                let mut fragments = Vec::with_capacity(inner.queued);
                for source_id in sources {
                    if let Some(queue) = inner.queues.get_mut(&source_id) {
                        fragments.extend(queue.drain(..));
                    }
                }
                inner.queued = 0;
                let eof = std::mem::take(&mut inner.eof_news);
                return Some(Batch { fragments, eof });
            }
            if inner.all_ended() {
                return None;
            }
            inner = self
                .available
                .wait(inner)
                .expect("fragment queue mutex poisoned");
        }
    }

    /// Fragments queued or still being processed downstream. Producers can
    /// watch this as a backlog measure.
    pub fn inflight(&self) -> usize {
        self.inner
            .lock()
            .expect("fragment queue mutex poisoned")
            .inflight
    }

    /// Drop `count` from the inflight total; called by the output stage
    /// after a dispatched batch is freed.
    pub fn release(&self, count: usize) {
        let mut inner = self.inner.lock().expect("fragment queue mutex poisoned");
        inner.inflight = inner.inflight.saturating_sub(count);
    }
}

//! The output stage: a dedicated thread that hands correlated event batches
//! to registered observers, then returns the batch's fragments to the pool.
//!
//! Decoupling delivery from correlation keeps a slow sink (disk, network)
//! from stalling the merge directly; backlog shows up in the queue's
//! inflight count instead, which this stage decrements as batches retire.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use super::constants::PHYSICS_EVENT;
use super::correlator::BuiltEvent;
use super::error::OutputError;
use super::fragment_queue::FragmentQueue;
use super::pool::FragmentPool;

/// A sink for correlated event batches. Observers run on the output thread,
/// in registration order; an error from any observer stops the stage.
pub trait Observer: Send {
    fn on_batch(&mut self, batch: &[BuiltEvent]) -> std::io::Result<()>;
}

/// Ticket returned by `add_observer`, needed to remove it again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverHandle(usize);

#[derive(Default)]
struct ObserverList {
    entries: Vec<(usize, Box<dyn Observer>)>,
    next_id: usize,
}

/// Totals reported when the output thread retires
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputStats {
    pub batches: u64,
    pub events: u64,
    pub fragments: u64,
    pub bytes: u64,
}

/// Owns the output thread and the observer registry.
///
/// The thread runs until every sender for its channel is gone; dropping the
/// stage's own sender in `finish` is the shutdown sentinel.
pub struct OutputStage {
    observers: Arc<Mutex<ObserverList>>,
    sender: Option<mpsc::Sender<Vec<BuiltEvent>>>,
    worker: Option<JoinHandle<Result<OutputStats, OutputError>>>,
}

impl OutputStage {
    pub fn start(pool: Arc<FragmentPool>, queue: Arc<FragmentQueue>) -> Self {
        let observers: Arc<Mutex<ObserverList>> = Arc::default();
        let (sender, receiver) = mpsc::channel::<Vec<BuiltEvent>>();
        let thread_observers = observers.clone();
        let worker = std::thread::spawn(move || -> Result<OutputStats, OutputError> {
            let mut stats = OutputStats::default();
            for batch in receiver {
                {
                    let mut list = thread_observers
                        .lock()
                        .expect("observer list mutex poisoned");
                    for (_, observer) in list.entries.iter_mut() {
                        observer.on_batch(&batch)?;
                    }
                }
                let mut freed = 0;
                stats.batches += 1;
                for event in batch {
                    stats.events += 1;
                    stats.bytes += event.item.size() as u64;
                    let (_, chain) = event.into_parts();
                    for fragment in chain.into_fragments() {
                        freed += 1;
                        pool.free(fragment);
                    }
                }
                stats.fragments += freed as u64;
                queue.release(freed);
            }
            Ok(stats)
        });
        Self {
            observers,
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Register an observer; it sees every batch dispatched from now on
    pub fn add_observer(&self, observer: Box<dyn Observer>) -> ObserverHandle {
        let mut list = self.observers.lock().expect("observer list mutex poisoned");
        let id = list.next_id;
        list.next_id += 1;
        list.entries.push((id, observer));
        ObserverHandle(id)
    }

    /// Remove a previously registered observer. Removing a handle that is
    /// not registered is a caller bug and reported as such.
    pub fn remove_observer(&self, handle: ObserverHandle) -> Result<(), OutputError> {
        let mut list = self.observers.lock().expect("observer list mutex poisoned");
        match list.entries.iter().position(|(id, _)| *id == handle.0) {
            Some(index) => {
                list.entries.remove(index);
                Ok(())
            }
            None => Err(OutputError::UnknownObserver(handle.0)),
        }
    }

    /// A sender feeding the output thread
    pub fn sender(&self) -> mpsc::Sender<Vec<BuiltEvent>> {
        self.sender
            .as_ref()
            .expect("output stage already finished")
            .clone()
    }

    /// Drop the shutdown sentinel and wait for the thread to drain and exit
    pub fn finish(mut self) -> Result<OutputStats, OutputError> {
        self.sender = None;
        match self.worker.take() {
            Some(worker) => worker.join().map_err(|_| OutputError::ThreadPanicked)?,
            None => Ok(OutputStats::default()),
        }
    }
}

/// Writes every correlated ring item to a byte sink; the CLI points this at
/// stdout.
pub struct RingWriterObserver<W: Write + Send> {
    sink: W,
}

impl<W: Write + Send> RingWriterObserver<W> {
    pub fn new(sink: W) -> Self {
        Self { sink }
    }
}

impl<W: Write + Send> Observer for RingWriterObserver<W> {
    fn on_batch(&mut self, batch: &[BuiltEvent]) -> std::io::Result<()> {
        for event in batch {
            event.item.write_to(&mut self.sink)?;
        }
        self.sink.flush()
    }
}

/// Counts built physics events; the counter handle can be read from any
/// thread while the pipeline runs.
#[derive(Default)]
pub struct EventCountObserver {
    count: Arc<AtomicU64>,
}

impl EventCountObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> Arc<AtomicU64> {
        self.count.clone()
    }
}

impl Observer for EventCountObserver {
    fn on_batch(&mut self, batch: &[BuiltEvent]) -> std::io::Result<()> {
        let physics = batch
            .iter()
            .filter(|event| event.item.item_type == PHYSICS_EVENT)
            .count() as u64;
        self.count.fetch_add(physics, Ordering::Relaxed);
        Ok(())
    }
}

//! Assembles the whole event-building pipeline: fragment input, per-source
//! queues, the correlator thread, and the output/observer thread.

use std::io::Read;
use std::sync::Arc;
use std::thread::JoinHandle;

use super::constants::*;
use super::correlator::{Correlator, CorrelatorParams};
use super::error::{FragmentError, PipelineError};
use super::fragment::{Fragment, FragmentHeader};
use super::fragment_queue::FragmentQueue;
use super::output::{Observer, ObserverHandle, OutputStage, OutputStats};
use super::pool::FragmentPool;
use super::ring_item::read_fully;

/// Fragments queued per `queue()` call when feeding from a stream
const FEED_BATCH: usize = 64;

/// Reads fragment header + body pairs off a byte stream, allocating each
/// body from the pool. End of stream at a pair boundary is a clean finish;
/// end of stream inside a fragment is a format error.
pub struct FragmentReader<R: Read> {
    source: R,
    pool: Arc<FragmentPool>,
}

impl<R: Read> FragmentReader<R> {
    pub fn new(source: R, pool: Arc<FragmentPool>) -> Self {
        Self { source, pool }
    }

    pub fn next_fragment(&mut self) -> Result<Option<Box<Fragment>>, FragmentError> {
        let mut head = [0u8; FRAGMENT_HEADER_SIZE];
        let got = read_fully(&mut self.source, &mut head)?;
        if got == 0 {
            return Ok(None);
        }
        if got < head.len() {
            return Err(FragmentError::TruncatedHeader {
                read: got,
                expected: head.len(),
            });
        }
        let header = FragmentHeader::decode(&head)?;
        if (header.size as usize) < MIN_RING_ITEM_SIZE {
            return Err(FragmentError::BadFragmentSize(header.size));
        }
        if (header.size as usize) > MAX_RING_ITEM_SIZE {
            return Err(FragmentError::RingError(
                super::error::RingItemError::Oversize(header.size),
            ));
        }
        let mut fragment = self.pool.allocate(header)?;
        let body = fragment.body_mut();
        let got = read_fully(&mut self.source, body)?;
        if got < body.len() {
            return Err(FragmentError::TruncatedBody(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("fragment body ended after {got} of {} bytes", body.len()),
            )));
        }
        Ok(Some(fragment))
    }
}

/// Counts from one feed pass
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedStats {
    pub fragments: u64,
    pub bytes: u64,
}

/// Final pipeline accounting, logged and returned by `finish`
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineStats {
    pub built_items: u64,
    pub output: OutputStats,
}

/// A running event-building pipeline.
///
/// `start` spawns the correlator and output threads; producers feed the
/// queue (directly or through `feed_fragments`); `finish` signals EOF,
/// joins both threads and reports totals.
pub struct Pipeline {
    pool: Arc<FragmentPool>,
    queue: Arc<FragmentQueue>,
    output: OutputStage,
    correlator_worker: JoinHandle<Result<u64, PipelineError>>,
}

impl Pipeline {
    pub fn start(params: CorrelatorParams, expected_sources: &[u32]) -> Self {
        let pool = Arc::new(FragmentPool::new());
        let queue = Arc::new(FragmentQueue::new());
        let output = OutputStage::start(pool.clone(), queue.clone());

        for source_id in expected_sources {
            queue.register_source(*source_id);
        }
        let announced = expected_sources.to_vec();
        let worker_queue = queue.clone();
        let sender = output.sender();
        let correlator_worker = std::thread::spawn(move || -> Result<u64, PipelineError> {
            let mut correlator = Correlator::new(params);
            for source_id in announced {
                correlator.announce_source(source_id);
            }
            sender
                .send(vec![correlator.prelude()])
                .map_err(|_| PipelineError::OutputClosed)?;
            let mut built: u64 = 1; // the format prelude

            while let Some(batch) = worker_queue.dequeue() {
                let events = correlator.ingest(batch)?;
                if !events.is_empty() {
                    built += events.len() as u64;
                    sender
                        .send(events)
                        .map_err(|_| PipelineError::OutputClosed)?;
                }
            }
            let events = correlator.drain()?;
            if !events.is_empty() {
                built += events.len() as u64;
                sender
                    .send(events)
                    .map_err(|_| PipelineError::OutputClosed)?;
            }
            Ok(built)
        });

        Self {
            pool,
            queue,
            output,
            correlator_worker,
        }
    }

    pub fn pool(&self) -> Arc<FragmentPool> {
        self.pool.clone()
    }

    pub fn queue(&self) -> Arc<FragmentQueue> {
        self.queue.clone()
    }

    pub fn add_observer(&self, observer: Box<dyn Observer>) -> ObserverHandle {
        self.output.add_observer(observer)
    }

    pub fn remove_observer(&self, handle: ObserverHandle) -> Result<(), PipelineError> {
        Ok(self.output.remove_observer(handle)?)
    }

    /// Drive a whole tagged-fragment stream into the queue on the calling
    /// thread. The stream's sources are marked EOF by `finish`, not here,
    /// so several streams can be fed before finishing.
    pub fn feed_fragments<R: Read>(&self, source: R) -> Result<FeedStats, PipelineError> {
        let mut reader = FragmentReader::new(source, self.pool.clone());
        let mut stats = FeedStats::default();
        let mut pending: Vec<Box<Fragment>> = Vec::with_capacity(FEED_BATCH);
        while let Some(fragment) = reader.next_fragment()? {
            stats.fragments += 1;
            stats.bytes += FRAGMENT_HEADER_SIZE as u64 + fragment.header.size as u64;
            pending.push(fragment);
            if pending.len() >= FEED_BATCH {
                self.queue.queue(std::mem::take(&mut pending));
            }
        }
        self.queue.queue(pending);
        Ok(stats)
    }

    /// Signal EOF everywhere, join the correlator and output threads, and
    /// report what moved through.
    pub fn finish(self) -> Result<PipelineStats, PipelineError> {
        self.queue.finish();
        let built = self
            .correlator_worker
            .join()
            .map_err(|_| PipelineError::WorkerPanicked("correlator"))??;
        let output = self.output.finish()?;
        spdlog::info!(
            "Event building complete: {} items built, {} fragments retired, {} written",
            built,
            output.fragments,
            human_bytes::human_bytes(output.bytes as f64)
        );
        Ok(PipelineStats {
            built_items: built,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::BuiltEvent;
    use crate::ring_item::{BodyHeader, RingItem, RingType, StateChangeItem, TimestampPolicy};
    use crate::tagger::write_fragment;
    use std::sync::Mutex;

    /// Stashes every dispatched item so the test can inspect the stream
    struct CollectObserver {
        items: Arc<Mutex<Vec<RingItem>>>,
    }

    impl Observer for CollectObserver {
        fn on_batch(&mut self, batch: &[BuiltEvent]) -> std::io::Result<()> {
            let mut items = self.items.lock().expect("test items");
            items.extend(batch.iter().map(|event| event.item.clone()));
            Ok(())
        }
    }

    fn fragment_bytes(item: &RingItem, ts: u64, sid: u32, barrier: u32) -> Vec<u8> {
        let bytes = item.encode();
        let header = FragmentHeader::new(ts, sid, bytes.len() as u32, barrier);
        let mut out = Vec::new();
        write_fragment(&mut out, &header, &bytes).unwrap();
        out
    }

    fn physics_fragment(ts: u64, sid: u32) -> Vec<u8> {
        let item = RingItem::with_body_header(
            RingType::Physics,
            BodyHeader::new(ts, sid, 0),
            vec![0xF0; 8],
        );
        fragment_bytes(&item, ts, sid, 0)
    }

    #[test]
    fn test_fragment_reader_round_trip() {
        let pool = Arc::new(FragmentPool::new());
        let mut stream = physics_fragment(42, 3);
        stream.extend_from_slice(&physics_fragment(43, 3));
        let mut reader = FragmentReader::new(std::io::Cursor::new(stream), pool);
        let first = reader.next_fragment().unwrap().unwrap();
        assert_eq!(first.header.timestamp, 42);
        assert_eq!(
            first.ring_item().unwrap().body_header.unwrap().timestamp,
            42
        );
        assert_eq!(reader.next_fragment().unwrap().unwrap().header.timestamp, 43);
        assert!(reader.next_fragment().unwrap().is_none());
    }

    #[test]
    fn test_fragment_reader_truncated_body() {
        let pool = Arc::new(FragmentPool::new());
        let stream = physics_fragment(42, 3);
        let cut = stream.len() - 4;
        let mut reader = FragmentReader::new(std::io::Cursor::new(stream[..cut].to_vec()), pool);
        assert!(matches!(
            reader.next_fragment(),
            Err(FragmentError::TruncatedBody(_))
        ));
    }

    #[test]
    fn test_fragment_reader_truncated_header() {
        let pool = Arc::new(FragmentPool::new());
        let stream = physics_fragment(42, 3);
        let mut reader = FragmentReader::new(std::io::Cursor::new(stream[..7].to_vec()), pool);
        assert!(matches!(
            reader.next_fragment(),
            Err(FragmentError::TruncatedHeader { read: 7, .. })
        ));
    }

    #[test]
    fn test_end_to_end_build() {
        let begin = |sid: u32| {
            let item = StateChangeItem::new(RingType::BeginRun, 7, 0, 0, "pipeline test")
                .unwrap()
                .to_ring_item(Some(BodyHeader::new(10, sid, 5)));
            fragment_bytes(&item, 10, sid, 5)
        };
        let mut stream = Vec::new();
        stream.extend_from_slice(&begin(1));
        stream.extend_from_slice(&begin(2));
        stream.extend_from_slice(&physics_fragment(100, 1));
        stream.extend_from_slice(&physics_fragment(140, 2));
        stream.extend_from_slice(&physics_fragment(400, 1));
        stream.extend_from_slice(&physics_fragment(400, 2));

        let pipeline = Pipeline::start(
            CorrelatorParams {
                coincidence_window: 100,
                timestamp_policy: TimestampPolicy::Earliest,
            },
            &[1, 2],
        );
        let items = Arc::new(Mutex::new(Vec::new()));
        pipeline.add_observer(Box::new(CollectObserver {
            items: items.clone(),
        }));
        let fed = pipeline.feed_fragments(std::io::Cursor::new(stream)).unwrap();
        assert_eq!(fed.fragments, 6);
        let stats = pipeline.finish().unwrap();

        let items = items.lock().unwrap();
        // format prelude, two begins, two built events
        assert_eq!(items.len(), 5);
        assert_eq!(items[0].ring_type(), RingType::RingFormat);
        assert_eq!(items[1].ring_type(), RingType::BeginRun);
        assert_eq!(items[1].body_header.unwrap().barrier, 5);
        assert_eq!(items[2].ring_type(), RingType::BeginRun);
        assert_eq!(items[2].body_header.unwrap().barrier, 0);
        assert_eq!(items[3].ring_type(), RingType::Physics);
        assert_eq!(items[3].body_header.unwrap().timestamp, 100);
        assert_eq!(items[4].body_header.unwrap().timestamp, 400);
        assert_eq!(stats.built_items, 5);

        // Everything dispatched was retired
        assert_eq!(stats.output.fragments, 6);
    }
}

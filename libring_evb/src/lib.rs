//! # ring_evb
//!
//! ring_evb is an event-builder fragment pipeline for ring-item DAQ
//! streams, written in Rust. It accepts timestamped data fragments from
//! multiple independent digitizer sources and emits time-ordered built
//! events, correlating fragments whose timestamps fall within a
//! configurable coincidence window and honoring barrier (run state
//! transition) synchronization across sources.
//!
//! ## Pipeline
//!
//! Data moves through five stages:
//!
//! 1. **Ring item codec** ([`ring_item`]): parses and serializes the framed
//!    binary records used throughout the DAQ stream — an 8-byte header, an
//!    optional 20-byte body header (timestamp, source id, barrier), and a
//!    typed payload. The wire format is a fixed contract with deployed
//!    systems and is byte-exact across versions.
//! 2. **Fragment tagger** ([`tagger`]): reads an untagged ring item stream
//!    in blocks (reassembling items split across block boundaries) and
//!    prepends a fragment header to each item, deriving the timestamp,
//!    source id and barrier type from the item's body header or from the
//!    configured defaults.
//! 3. **Input queueing** ([`fragment_queue`]): per-source FIFO queues
//!    between producers and the correlator, with a pipeline-wide inflight
//!    count for backlog visibility.
//! 4. **Correlator** ([`correlator`]): the heart of the pipeline. Merges
//!    the per-source streams oldest-first, groups coincident physics
//!    fragments into built events, and serializes barrier fragments
//!    through the merge so run transitions act downstream exactly once.
//! 5. **Output stage** ([`output`]): a dedicated thread delivering built
//!    event batches to registered observers (writers, counters), then
//!    returning fragment storage to the pool.
//!
//! Fragment storage comes from a [`pool::FragmentPool`]: freed fragments
//! park on per-size-class free lists and are handed back out instead of
//! hitting the allocator for every event.
//!
//! ## Usage
//!
//! The `ring_evb_cli` crate wraps the library in a command line tool with
//! `tag` (ring items in, fragments out) and `build` (fragments in, built
//! ring items out) subcommands; see its README for operator documentation.
//! Library users assemble a [`pipeline::Pipeline`] directly:
//!
//! ```no_run
//! use libring_evb::correlator::CorrelatorParams;
//! use libring_evb::output::RingWriterObserver;
//! use libring_evb::pipeline::Pipeline;
//!
//! let pipeline = Pipeline::start(CorrelatorParams::default(), &[1, 2]);
//! pipeline.add_observer(Box::new(RingWriterObserver::new(std::io::stdout())));
//! pipeline
//!     .feed_fragments(std::io::stdin())
//!     .expect("feeding failed");
//! pipeline.finish().expect("pipeline failed");
//! ```
//!
//! ## Configuration
//!
//! The YAML configuration understood by [`config::Config`]:
//!
//! ```yml
//! coincidence_window: 100
//! timestamp_policy: earliest
//! default_source_id: 0
//! reset_timestamp_on_begin: true
//! block_size: 8192
//! expected_sources: []
//! ```
//!
//! `coincidence_window` is in timestamp ticks. `timestamp_policy` selects
//! how a built event is stamped from its fragments (`earliest`, `latest`,
//! or `average`). `expected_sources` pre-registers source ids so the
//! correlator waits for sources that start up slowly instead of running
//! ahead of them.
//!
//! ## Ordering guarantees
//!
//! Output is globally non-decreasing in timestamp across all sources, with
//! one deliberate exception: barrier fragments are emitted the moment they
//! reach the head of the merge, each as its own item, and only the
//! fragment that opens (or closes) a barrier nest keeps its barrier value
//! in the output body header. Within one source, arrival order is
//! preserved. Exact timestamp ties drain in ascending source id order.
//!
//! A source whose stream stalls stalls the merge — the correlator cannot
//! skip a silent source without risking an ordering violation. Producer
//! health is the operator's responsibility; the pipeline's job is to never
//! emit out of order.
pub mod config;
pub mod constants;
pub mod correlator;
pub mod error;
pub mod fragment;
pub mod fragment_queue;
pub mod output;
pub mod pipeline;
pub mod pool;
pub mod ring_item;
pub mod tagger;

//! The correlator: merges per-source fragment streams into one
//! timestamp-ordered output and groups coincident physics fragments into
//! built events.
//!
//! The merge is a k-way oldest-first selection over the head of each
//! source's ready queue, so it can only advance while every live source has
//! a fragment queued (an empty, unfinished source could still produce the
//! next-oldest fragment). A source that stalls therefore stalls the merge;
//! that is the pipeline's backpressure, not a fault to work around here.
//!
//! Windowing is fixed: a chain opens at some fragment's timestamp and
//! admits physics fragments while `ts <= open + dt`. Barrier fragments are
//! the hard exception, emitted alone and never grouped; see `BuiltEvent`
//! for the nesting indicator rule.

use std::collections::{BTreeMap, VecDeque};

use fxhash::FxHashSet;

use super::error::CorrelatorError;
use super::fragment::{Fragment, FragmentChain};
use super::fragment_queue::Batch;
use super::ring_item::{BodyHeader, RingFormatItem, RingItem, RingType, TimestampPolicy};

/// Correlation settings, straight off the command line or config file
#[derive(Debug, Clone, Copy)]
pub struct CorrelatorParams {
    /// Coincidence window in timestamp ticks (the `--dt` option)
    pub coincidence_window: u64,
    /// How a built event is stamped from its constituents
    pub timestamp_policy: TimestampPolicy,
}

impl Default for CorrelatorParams {
    fn default() -> Self {
        Self {
            coincidence_window: 0,
            timestamp_policy: TimestampPolicy::Earliest,
        }
    }
}

/// One correlated output: a finished ring item plus the fragments it was
/// built from, which the output stage frees after observers run.
#[derive(Debug)]
pub struct BuiltEvent {
    pub item: RingItem,
    chain: FragmentChain,
}

impl BuiltEvent {
    fn new(item: RingItem, chain: FragmentChain) -> Self {
        Self { item, chain }
    }

    pub fn fragment_count(&self) -> usize {
        self.chain.len()
    }

    pub fn into_parts(self) -> (RingItem, FragmentChain) {
        (self.item, self.chain)
    }
}

pub struct Correlator {
    params: CorrelatorParams,
    ready: BTreeMap<u32, VecDeque<Box<Fragment>>>,
    ended: FxHashSet<u32>,
    chain: FragmentChain,
    open_timestamp: Option<u64>,
    barrier_depth: u32,
}

impl Correlator {
    pub fn new(params: CorrelatorParams) -> Self {
        Self {
            params,
            ready: BTreeMap::new(),
            ended: FxHashSet::default(),
            chain: FragmentChain::new(),
            open_timestamp: None,
            barrier_depth: 0,
        }
    }

    /// The item every correlated stream starts with: the data format version
    pub fn prelude(&self) -> BuiltEvent {
        BuiltEvent::new(RingFormatItem::current().to_ring_item(), FragmentChain::new())
    }

    /// Declare a source before any of its fragments arrive, so the merge
    /// waits for it rather than running ahead.
    pub fn announce_source(&mut self, source_id: u32) {
        self.ready.entry(source_id).or_default();
    }

    /// Feed one dequeued batch and emit whatever becomes safely mergeable.
    pub fn ingest(&mut self, batch: Batch) -> Result<Vec<BuiltEvent>, CorrelatorError> {
        for source_id in batch.eof {
            self.ended.insert(source_id);
            self.ready.entry(source_id).or_default();
        }
        for fragment in batch.fragments {
            self.ready
                .entry(fragment.header.source_id)
                .or_default()
                .push_back(fragment);
        }
        let mut out = Vec::new();
        self.merge(false, &mut out)?;
        Ok(out)
    }

    /// End of all input: emit everything still queued, in timestamp order,
    /// and close the open window.
    pub fn drain(&mut self) -> Result<Vec<BuiltEvent>, CorrelatorError> {
        let mut out = Vec::new();
        self.merge(true, &mut out)?;
        self.flush_chain(&mut out);
        Ok(out)
    }

    fn merge(&mut self, draining: bool, out: &mut Vec<BuiltEvent>) -> Result<(), CorrelatorError> {
        loop {
            // Sources that have ended and emptied no longer gate the merge
            let ended = &self.ended;
            self.ready
                .retain(|source_id, queue| !(queue.is_empty() && ended.contains(source_id)));
            if self.ready.is_empty() {
                return Ok(());
            }
            if !draining && self.ready.values().any(|queue| queue.is_empty()) {
                // An unfinished source has nothing queued; emitting now
                // could put its next fragment out of order
                return Ok(());
            }
            // Oldest head wins; BTreeMap iteration makes the tie-break
            // ascending source id
            let mut best: Option<(u32, u64)> = None;
            for (source_id, queue) in &self.ready {
                if let Some(fragment) = queue.front() {
                    let ts = fragment.header.timestamp;
                    if best.map_or(true, |(_, best_ts)| ts < best_ts) {
                        best = Some((*source_id, ts));
                    }
                }
            }
            let Some((source_id, _)) = best else {
                return Ok(());
            };
            if let Some(queue) = self.ready.get_mut(&source_id) {
                if let Some(fragment) = queue.pop_front() {
                    self.accept(fragment, out)?;
                }
            }
        }
    }

    fn accept(
        &mut self,
        fragment: Box<Fragment>,
        out: &mut Vec<BuiltEvent>,
    ) -> Result<(), CorrelatorError> {
        if fragment.is_barrier() {
            self.flush_chain(out);
            return self.emit_barrier(fragment, out);
        }
        let ring_type = fragment.ring_type()?;
        if ring_type == RingType::Physics {
            let ts = fragment.header.timestamp;
            match self.open_timestamp {
                Some(open) if ts <= open.saturating_add(self.params.coincidence_window) => {
                    self.chain.push(fragment);
                }
                Some(_) => {
                    self.flush_chain(out);
                    self.open_timestamp = Some(ts);
                    self.chain.push(fragment);
                }
                None => {
                    self.open_timestamp = Some(ts);
                    self.chain.push(fragment);
                }
            }
            Ok(())
        } else {
            // Scalers, text, counts and the like are not built; they punch
            // through between events unchanged
            if let RingType::Unknown(code) = ring_type {
                spdlog::warn!("Passing through unrecognized ring type: {}", code);
            }
            self.flush_chain(out);
            let item = fragment.ring_item()?;
            let mut chain = FragmentChain::new();
            chain.push(fragment);
            out.push(BuiltEvent::new(item, chain));
            Ok(())
        }
    }

    /// Emit a barrier fragment as its own event.
    ///
    /// Only the fragment that opens a barrier nest (first BEGIN/RESUME) or
    /// closes it (last END/PAUSE) keeps its barrier value in the output
    /// body header; the duplicates from the other sources go out with
    /// barrier 0 so downstream consumers act on the transition exactly
    /// once.
    fn emit_barrier(
        &mut self,
        fragment: Box<Fragment>,
        out: &mut Vec<BuiltEvent>,
    ) -> Result<(), CorrelatorError> {
        let ring_type = fragment.ring_type()?;
        let indicator = match ring_type {
            RingType::BeginRun | RingType::ResumeRun => {
                let first = self.barrier_depth == 0;
                self.barrier_depth += 1;
                first
            }
            RingType::EndRun | RingType::PauseRun => {
                self.barrier_depth = self.barrier_depth.saturating_sub(1);
                self.barrier_depth == 0
            }
            // Barrier types outside the run state machine pass through
            // with their indicator intact
            _ => true,
        };
        let barrier_value = if indicator { fragment.header.barrier } else { 0 };

        let mut item = fragment.ring_item()?;
        let body_header = item.body_header.get_or_insert(BodyHeader::new(
            fragment.header.timestamp,
            fragment.header.source_id,
            0,
        ));
        body_header.barrier = barrier_value;

        let mut chain = FragmentChain::new();
        chain.push(fragment);
        out.push(BuiltEvent::new(item, chain));
        Ok(())
    }

    fn flush_chain(&mut self, out: &mut Vec<BuiltEvent>) {
        if self.chain.is_empty() {
            return;
        }
        let chain = std::mem::take(&mut self.chain);
        let item = chain.to_built_item(self.params.timestamp_policy);
        out.push(BuiltEvent::new(item, chain));
        self.open_timestamp = None;
    }
}

use std::path::PathBuf;
use thiserror::Error;

use super::constants::*;

#[derive(Debug, Error)]
pub enum RingItemError {
    #[error("Ring item size field {0} is smaller than the minimum item size {min}", min=MIN_RING_ITEM_SIZE)]
    BadSize(u32),
    #[error("Ring item size field {0} exceeds the sanity limit {max}", max=MAX_RING_ITEM_SIZE)]
    Oversize(u32),
    #[error("Ring item declares {declared} bytes but only {available} are available")]
    Truncated { declared: usize, available: usize },
    #[error("Invalid body header size word {0}; expected {marker} or at least {size}", marker=NO_BODY_HEADER_MARKER, size=BODY_HEADER_SIZE)]
    BadBodyHeaderSize(u32),
    #[error("Ring item type {0} is not the type expected by this conversion")]
    WrongType(u32),
    #[error("Ring item payload ended before the typed body was complete")]
    ShortBody,
    #[error("State change title is {0} bytes; the maximum is {max}", max=TITLE_MAX_SIZE)]
    TitleTooLong(usize),
    #[error("Ring item text body is not valid UTF-8: {0}")]
    BadText(#[from] std::string::FromUtf8Error),
    #[error("Unknown timestamp policy code {0}")]
    BadTimestampPolicy(u16),
    #[error("Ring item codec failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Fragment pool could not allocate backing storage: {0}")]
    AllocationFailed(#[from] std::collections::TryReserveError),
}

#[derive(Debug, Error)]
pub enum TaggerError {
    #[error("Tagger failed to parse a ring item: {0}")]
    RingError(#[from] RingItemError),
    #[error("A PHYSICS_EVENT item arrived without a body header; physics data must carry provenance")]
    PhysicsWithoutBodyHeader,
    #[error("Tagger block size {0} is smaller than a ring item header ({min} bytes)", min=RING_HEADER_SIZE)]
    BlockTooSmall(usize),
    #[error("Input stream ended in the middle of a ring item ({remaining} unconsumed bytes)")]
    PartialItem { remaining: usize },
    #[error("Tagger failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("Input stream ended in the middle of a fragment header ({read} of {expected} bytes)")]
    TruncatedHeader { read: usize, expected: usize },
    #[error("Input stream ended in the middle of a fragment body: {0}")]
    TruncatedBody(#[source] std::io::Error),
    #[error("Fragment header declares {0} payload bytes, smaller than the minimum ring item size {min}", min=MIN_RING_ITEM_SIZE)]
    BadFragmentSize(u32),
    #[error("Fragment body failed to parse as a ring item: {0}")]
    RingError(#[from] RingItemError),
    #[error("Fragment read failed due to pool error: {0}")]
    PoolError(#[from] PoolError),
    #[error("Fragment read failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("Correlator failed to re-parse a queued fragment: {0}")]
    RingError(#[from] RingItemError),
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("No observer is registered under handle {0}")]
    UnknownObserver(usize),
    #[error("An observer failed with IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Output thread panicked")]
    ThreadPanicked,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline failed due to ring item error: {0}")]
    RingError(#[from] RingItemError),
    #[error("Pipeline failed due to tagger error: {0}")]
    TaggerError(#[from] TaggerError),
    #[error("Pipeline failed due to fragment error: {0}")]
    FragmentError(#[from] FragmentError),
    #[error("Pipeline failed due to pool error: {0}")]
    PoolError(#[from] PoolError),
    #[error("Pipeline failed due to correlator error: {0}")]
    CorrelatorError(#[from] CorrelatorError),
    #[error("Pipeline failed due to output error: {0}")]
    OutputError(#[from] OutputError),
    #[error("Pipeline failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Correlator output channel closed before the event stream was finished")]
    OutputClosed,
    #[error("Pipeline worker thread {0} panicked")]
    WorkerPanicked(&'static str),
    #[error("Pipeline failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
}

//! Wire-format constants shared by the codec, tagger, and correlator.

/// Size in bytes of a ring item header (size + type words)
pub const RING_HEADER_SIZE: usize = 8;
/// Size in bytes of a full body header (size, timestamp, source id, barrier)
pub const BODY_HEADER_SIZE: usize = 20;
/// Value of the body-header-size word when no body header is present.
/// The marker is a lone u32 whose value is its own size.
pub const NO_BODY_HEADER_MARKER: u32 = 4;
/// Smallest legal ring item: header plus the no-body-header marker
pub const MIN_RING_ITEM_SIZE: usize = RING_HEADER_SIZE + NO_BODY_HEADER_MARKER as usize;
/// Sanity bound on a single item (64 MiB). A size field beyond this is a
/// corrupt stream, not a real record.
pub const MAX_RING_ITEM_SIZE: usize = 1 << 26;
/// Size in bytes of a fragment header (timestamp, source id, size, barrier)
pub const FRAGMENT_HEADER_SIZE: usize = 20;

/// Timestamp value meaning "no hardware timestamp available". The tagger
/// substitutes the last known timestamp when it sees this. 0 is an ordinary
/// timestamp (it is what the ordering epoch restarts to at begin-run).
pub const NULL_TIMESTAMP: u64 = u64::MAX;

// Ring item type codes. These are fixed by deployed data and must not change.
pub const BEGIN_RUN: u32 = 1;
pub const END_RUN: u32 = 2;
pub const PAUSE_RUN: u32 = 3;
pub const RESUME_RUN: u32 = 4;
pub const PACKET_TYPES: u32 = 10;
pub const MONITORED_VARIABLES: u32 = 11;
pub const RING_FORMAT: u32 = 12;
pub const PERIODIC_SCALERS: u32 = 20;
pub const PHYSICS_EVENT: u32 = 30;
pub const PHYSICS_EVENT_COUNT: u32 = 31;
pub const EVB_FRAGMENT: u32 = 40;
pub const EVB_UNKNOWN_PAYLOAD: u32 = 41;
pub const EVB_GLOM_INFO: u32 = 42;

/// Data format version advertised by the RING_FORMAT item the correlator
/// emits at the head of its output stream
pub const FORMAT_MAJOR: u16 = 12;
pub const FORMAT_MINOR: u16 = 0;

/// Maximum length of a state change title, not counting the padding nul
pub const TITLE_MAX_SIZE: usize = 80;

/// Default read block size for the tagger's item reader
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

//! The ring item codec.
//!
//! Ring items are the framed binary records used throughout the DAQ stream:
//! an 8-byte header (self-inclusive size, type code), then either a 4-byte
//! "no body header" marker or a 20-byte body header (timestamp, source id,
//! barrier), then the typed payload. The size field is authoritative for
//! stepping through a byte stream, so the offset math here must agree
//! between the encoder and the decoder.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use super::constants::*;
use super::error::RingItemError;

/// The known ring item kinds. Unknown codes are carried through rather than
/// rejected; the correlator treats them as opaque passthrough data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingType {
    BeginRun,
    EndRun,
    PauseRun,
    ResumeRun,
    PacketTypes,
    MonitoredVariables,
    RingFormat,
    Scalers,
    Physics,
    PhysicsEventCount,
    EvbFragment,
    EvbUnknownPayload,
    EvbGlomInfo,
    Unknown(u32),
}

impl From<u32> for RingType {
    fn from(code: u32) -> Self {
        match code {
            BEGIN_RUN => Self::BeginRun,
            END_RUN => Self::EndRun,
            PAUSE_RUN => Self::PauseRun,
            RESUME_RUN => Self::ResumeRun,
            PACKET_TYPES => Self::PacketTypes,
            MONITORED_VARIABLES => Self::MonitoredVariables,
            RING_FORMAT => Self::RingFormat,
            PERIODIC_SCALERS => Self::Scalers,
            PHYSICS_EVENT => Self::Physics,
            PHYSICS_EVENT_COUNT => Self::PhysicsEventCount,
            EVB_FRAGMENT => Self::EvbFragment,
            EVB_UNKNOWN_PAYLOAD => Self::EvbUnknownPayload,
            EVB_GLOM_INFO => Self::EvbGlomInfo,
            _ => Self::Unknown(code),
        }
    }
}

impl RingType {
    pub fn code(self) -> u32 {
        match self {
            Self::BeginRun => BEGIN_RUN,
            Self::EndRun => END_RUN,
            Self::PauseRun => PAUSE_RUN,
            Self::ResumeRun => RESUME_RUN,
            Self::PacketTypes => PACKET_TYPES,
            Self::MonitoredVariables => MONITORED_VARIABLES,
            Self::RingFormat => RING_FORMAT,
            Self::Scalers => PERIODIC_SCALERS,
            Self::Physics => PHYSICS_EVENT,
            Self::PhysicsEventCount => PHYSICS_EVENT_COUNT,
            Self::EvbFragment => EVB_FRAGMENT,
            Self::EvbUnknownPayload => EVB_UNKNOWN_PAYLOAD,
            Self::EvbGlomInfo => EVB_GLOM_INFO,
            Self::Unknown(code) => code,
        }
    }

    pub fn is_state_change(self) -> bool {
        matches!(
            self,
            Self::BeginRun | Self::EndRun | Self::PauseRun | Self::ResumeRun
        )
    }
}

/// The optional body header carried between the ring header and the payload.
///
/// The on-wire form leads with its own size word (20, or more when an
/// extension is present); extensions are skipped on decode and never
/// produced on encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BodyHeader {
    pub timestamp: u64,
    pub source_id: u32,
    pub barrier: u32,
}

impl BodyHeader {
    pub fn new(timestamp: u64, source_id: u32, barrier: u32) -> Self {
        Self {
            timestamp,
            source_id,
            barrier,
        }
    }
}

/// How the correlator stamps a built event from its constituents. The codes
/// are the ones the EVB_GLOM_INFO record advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampPolicy {
    #[default]
    Earliest,
    Latest,
    Average,
}

impl TimestampPolicy {
    pub fn code(self) -> u16 {
        match self {
            Self::Earliest => 0,
            Self::Latest => 1,
            Self::Average => 2,
        }
    }
}

impl TryFrom<u16> for TimestampPolicy {
    type Error = RingItemError;
    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Earliest),
            1 => Ok(Self::Latest),
            2 => Ok(Self::Average),
            _ => Err(RingItemError::BadTimestampPolicy(code)),
        }
    }
}

/// One decoded ring item. The payload is the bytes following the body
/// header (or marker); framing and offsets are recomputed on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingItem {
    pub item_type: u32,
    pub body_header: Option<BodyHeader>,
    pub payload: Vec<u8>,
}

/// Read exactly `buf.len()` bytes unless EOF intervenes, retrying short and
/// interrupted reads. Returns the number of bytes actually read.
pub(crate) fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Offset of the payload within a raw item, given the body-header-size word.
/// This is the single place the encoder and decoder agree on.
fn body_offset(discriminator: u32) -> Result<usize, RingItemError> {
    if discriminator == NO_BODY_HEADER_MARKER || discriminator >= BODY_HEADER_SIZE as u32 {
        Ok(RING_HEADER_SIZE + discriminator as usize)
    } else {
        Err(RingItemError::BadBodyHeaderSize(discriminator))
    }
}

impl RingItem {
    /// Make an item with no body header
    pub fn new(ring_type: RingType, payload: Vec<u8>) -> Self {
        Self {
            item_type: ring_type.code(),
            body_header: None,
            payload,
        }
    }

    /// Make an item carrying a body header
    pub fn with_body_header(ring_type: RingType, body_header: BodyHeader, payload: Vec<u8>) -> Self {
        Self {
            item_type: ring_type.code(),
            body_header: Some(body_header),
            payload,
        }
    }

    pub fn ring_type(&self) -> RingType {
        RingType::from(self.item_type)
    }

    /// Total encoded size, including the size field itself
    pub fn size(&self) -> u32 {
        let body_words = match self.body_header {
            Some(_) => BODY_HEADER_SIZE,
            None => NO_BODY_HEADER_MARKER as usize,
        };
        (RING_HEADER_SIZE + body_words + self.payload.len()) as u32
    }

    /// Parse one item from a buffer. The declared size must fit within the
    /// buffer; trailing bytes beyond it are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, RingItemError> {
        if bytes.len() < MIN_RING_ITEM_SIZE {
            return Err(RingItemError::Truncated {
                declared: MIN_RING_ITEM_SIZE,
                available: bytes.len(),
            });
        }
        let mut cursor = Cursor::new(bytes);
        let size = cursor.read_u32::<LittleEndian>()?;
        if (size as usize) < MIN_RING_ITEM_SIZE {
            return Err(RingItemError::BadSize(size));
        }
        if (size as usize) > MAX_RING_ITEM_SIZE {
            return Err(RingItemError::Oversize(size));
        }
        if size as usize > bytes.len() {
            return Err(RingItemError::Truncated {
                declared: size as usize,
                available: bytes.len(),
            });
        }
        let item_type = cursor.read_u32::<LittleEndian>()?;
        let discriminator = cursor.read_u32::<LittleEndian>()?;
        let payload_start = body_offset(discriminator)?;
        if payload_start > size as usize {
            return Err(RingItemError::BadBodyHeaderSize(discriminator));
        }
        let body_header = if discriminator == NO_BODY_HEADER_MARKER {
            None
        } else {
            Some(BodyHeader {
                timestamp: cursor.read_u64::<LittleEndian>()?,
                source_id: cursor.read_u32::<LittleEndian>()?,
                barrier: cursor.read_u32::<LittleEndian>()?,
            })
        };
        Ok(Self {
            item_type,
            body_header,
            payload: bytes[payload_start..size as usize].to_vec(),
        })
    }

    /// Serialize to the exact wire form. The emitted size field always
    /// reflects the byte count produced.
    pub fn encode(&self) -> Vec<u8> {
        let size = self.size();
        let mut buf = Vec::with_capacity(size as usize);
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend_from_slice(&self.item_type.to_le_bytes());
        match &self.body_header {
            None => buf.extend_from_slice(&NO_BODY_HEADER_MARKER.to_le_bytes()),
            Some(bh) => {
                buf.extend_from_slice(&(BODY_HEADER_SIZE as u32).to_le_bytes());
                buf.extend_from_slice(&bh.timestamp.to_le_bytes());
                buf.extend_from_slice(&bh.source_id.to_le_bytes());
                buf.extend_from_slice(&bh.barrier.to_le_bytes());
            }
        }
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.encode())
    }

    /// Read one framed item from a byte stream.
    ///
    /// Returns `Ok(None)` on a clean end-of-stream at an item boundary; EOF
    /// inside an item is a format error.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>, RingItemError> {
        let mut head = [0u8; RING_HEADER_SIZE];
        let got = read_fully(reader, &mut head)?;
        if got == 0 {
            return Ok(None);
        }
        if got < head.len() {
            return Err(RingItemError::Truncated {
                declared: head.len(),
                available: got,
            });
        }
        let size = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
        if (size as usize) < MIN_RING_ITEM_SIZE {
            return Err(RingItemError::BadSize(size));
        }
        if (size as usize) > MAX_RING_ITEM_SIZE {
            return Err(RingItemError::Oversize(size));
        }
        let mut raw = vec![0u8; size as usize];
        raw[..head.len()].copy_from_slice(&head);
        let got = read_fully(reader, &mut raw[head.len()..])?;
        if got < size as usize - head.len() {
            return Err(RingItemError::Truncated {
                declared: size as usize,
                available: head.len() + got,
            });
        }
        Self::decode(&raw).map(Some)
    }

    /// Item type of a raw, undecoded item
    pub fn peek_type(bytes: &[u8]) -> Result<u32, RingItemError> {
        if bytes.len() < RING_HEADER_SIZE {
            return Err(RingItemError::Truncated {
                declared: RING_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        Ok(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]))
    }

    /// Body header of a raw, undecoded item, without copying its payload
    pub fn peek_body_header(bytes: &[u8]) -> Result<Option<BodyHeader>, RingItemError> {
        if bytes.len() < MIN_RING_ITEM_SIZE {
            return Err(RingItemError::Truncated {
                declared: MIN_RING_ITEM_SIZE,
                available: bytes.len(),
            });
        }
        let discriminator = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let payload_start = body_offset(discriminator)?;
        if payload_start > bytes.len() {
            return Err(RingItemError::BadBodyHeaderSize(discriminator));
        }
        if discriminator == NO_BODY_HEADER_MARKER {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&bytes[12..]);
        Ok(Some(BodyHeader {
            timestamp: cursor.read_u64::<LittleEndian>()?,
            source_id: cursor.read_u32::<LittleEndian>()?,
            barrier: cursor.read_u32::<LittleEndian>()?,
        }))
    }
}

/// BEGIN_RUN/END_RUN/PAUSE_RUN/RESUME_RUN payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChangeItem {
    pub transition: RingType,
    pub run_number: u32,
    pub time_offset: u32,
    pub wall_clock: u32,
    pub offset_divisor: u32,
    pub title: String,
}

impl StateChangeItem {
    pub fn new(
        transition: RingType,
        run_number: u32,
        time_offset: u32,
        wall_clock: u32,
        title: &str,
    ) -> Result<Self, RingItemError> {
        if !transition.is_state_change() {
            return Err(RingItemError::WrongType(transition.code()));
        }
        if title.len() > TITLE_MAX_SIZE {
            return Err(RingItemError::TitleTooLong(title.len()));
        }
        Ok(Self {
            transition,
            run_number,
            time_offset,
            wall_clock,
            offset_divisor: 1,
            title: title.to_string(),
        })
    }

    pub fn to_ring_item(&self, body_header: Option<BodyHeader>) -> RingItem {
        let mut payload = Vec::with_capacity(16 + TITLE_MAX_SIZE + 1);
        payload.extend_from_slice(&self.run_number.to_le_bytes());
        payload.extend_from_slice(&self.time_offset.to_le_bytes());
        payload.extend_from_slice(&self.wall_clock.to_le_bytes());
        payload.extend_from_slice(&self.offset_divisor.to_le_bytes());
        let mut title = [0u8; TITLE_MAX_SIZE + 1];
        title[..self.title.len()].copy_from_slice(self.title.as_bytes());
        payload.extend_from_slice(&title);
        RingItem {
            item_type: self.transition.code(),
            body_header,
            payload,
        }
    }
}

impl TryFrom<&RingItem> for StateChangeItem {
    type Error = RingItemError;
    fn try_from(item: &RingItem) -> Result<Self, Self::Error> {
        let transition = item.ring_type();
        if !transition.is_state_change() {
            return Err(RingItemError::WrongType(item.item_type));
        }
        if item.payload.len() < 16 + TITLE_MAX_SIZE + 1 {
            return Err(RingItemError::ShortBody);
        }
        let mut cursor = Cursor::new(item.payload.as_slice());
        let run_number = cursor.read_u32::<LittleEndian>()?;
        let time_offset = cursor.read_u32::<LittleEndian>()?;
        let wall_clock = cursor.read_u32::<LittleEndian>()?;
        let offset_divisor = cursor.read_u32::<LittleEndian>()?;
        let title_bytes = &item.payload[16..16 + TITLE_MAX_SIZE + 1];
        let title_len = title_bytes.iter().position(|b| *b == 0).unwrap_or(title_bytes.len());
        let title = String::from_utf8(title_bytes[..title_len].to_vec())?;
        Ok(Self {
            transition,
            run_number,
            time_offset,
            wall_clock,
            offset_divisor,
            title,
        })
    }
}

/// PERIODIC_SCALERS payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalersItem {
    pub interval_start_offset: u32,
    pub interval_end_offset: u32,
    pub wall_clock: u32,
    pub interval_divisor: u32,
    pub is_incremental: bool,
    pub scalers: Vec<u32>,
}

impl ScalersItem {
    pub fn new(
        interval_start_offset: u32,
        interval_end_offset: u32,
        wall_clock: u32,
        is_incremental: bool,
        scalers: Vec<u32>,
    ) -> Self {
        Self {
            interval_start_offset,
            interval_end_offset,
            wall_clock,
            interval_divisor: 1,
            is_incremental,
            scalers,
        }
    }

    pub fn to_ring_item(&self, body_header: Option<BodyHeader>) -> RingItem {
        let mut payload = Vec::with_capacity(24 + self.scalers.len() * 4);
        payload.extend_from_slice(&self.interval_start_offset.to_le_bytes());
        payload.extend_from_slice(&self.interval_end_offset.to_le_bytes());
        payload.extend_from_slice(&self.wall_clock.to_le_bytes());
        payload.extend_from_slice(&self.interval_divisor.to_le_bytes());
        payload.extend_from_slice(&(self.scalers.len() as u32).to_le_bytes());
        payload.extend_from_slice(&(self.is_incremental as u32).to_le_bytes());
        for scaler in &self.scalers {
            payload.extend_from_slice(&scaler.to_le_bytes());
        }
        RingItem {
            item_type: PERIODIC_SCALERS,
            body_header,
            payload,
        }
    }
}

impl TryFrom<&RingItem> for ScalersItem {
    type Error = RingItemError;
    fn try_from(item: &RingItem) -> Result<Self, Self::Error> {
        if item.item_type != PERIODIC_SCALERS {
            return Err(RingItemError::WrongType(item.item_type));
        }
        if item.payload.len() < 24 {
            return Err(RingItemError::ShortBody);
        }
        let mut cursor = Cursor::new(item.payload.as_slice());
        let interval_start_offset = cursor.read_u32::<LittleEndian>()?;
        let interval_end_offset = cursor.read_u32::<LittleEndian>()?;
        let wall_clock = cursor.read_u32::<LittleEndian>()?;
        let interval_divisor = cursor.read_u32::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()? as usize;
        let is_incremental = cursor.read_u32::<LittleEndian>()? != 0;
        if item.payload.len() < 24 + count * 4 {
            return Err(RingItemError::ShortBody);
        }
        let mut scalers = Vec::with_capacity(count);
        for _ in 0..count {
            scalers.push(cursor.read_u32::<LittleEndian>()?);
        }
        Ok(Self {
            interval_start_offset,
            interval_end_offset,
            wall_clock,
            interval_divisor,
            is_incremental,
            scalers,
        })
    }
}

/// PHYSICS_EVENT_COUNT payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicsEventCountItem {
    pub time_offset: u32,
    pub offset_divisor: u32,
    pub wall_clock: u32,
    pub event_count: u64,
}

impl PhysicsEventCountItem {
    pub fn new(time_offset: u32, wall_clock: u32, event_count: u64) -> Self {
        Self {
            time_offset,
            offset_divisor: 1,
            wall_clock,
            event_count,
        }
    }

    pub fn to_ring_item(&self, body_header: Option<BodyHeader>) -> RingItem {
        let mut payload = Vec::with_capacity(20);
        payload.extend_from_slice(&self.time_offset.to_le_bytes());
        payload.extend_from_slice(&self.offset_divisor.to_le_bytes());
        payload.extend_from_slice(&self.wall_clock.to_le_bytes());
        payload.extend_from_slice(&self.event_count.to_le_bytes());
        RingItem {
            item_type: PHYSICS_EVENT_COUNT,
            body_header,
            payload,
        }
    }
}

impl TryFrom<&RingItem> for PhysicsEventCountItem {
    type Error = RingItemError;
    fn try_from(item: &RingItem) -> Result<Self, Self::Error> {
        if item.item_type != PHYSICS_EVENT_COUNT {
            return Err(RingItemError::WrongType(item.item_type));
        }
        if item.payload.len() < 20 {
            return Err(RingItemError::ShortBody);
        }
        let mut cursor = Cursor::new(item.payload.as_slice());
        Ok(Self {
            time_offset: cursor.read_u32::<LittleEndian>()?,
            offset_divisor: cursor.read_u32::<LittleEndian>()?,
            wall_clock: cursor.read_u32::<LittleEndian>()?,
            event_count: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

/// PACKET_TYPES/MONITORED_VARIABLES payload: a list of nul-terminated strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextItem {
    pub kind: RingType,
    pub time_offset: u32,
    pub wall_clock: u32,
    pub offset_divisor: u32,
    pub strings: Vec<String>,
}

impl TextItem {
    pub fn new(
        kind: RingType,
        time_offset: u32,
        wall_clock: u32,
        strings: Vec<String>,
    ) -> Result<Self, RingItemError> {
        if !matches!(kind, RingType::PacketTypes | RingType::MonitoredVariables) {
            return Err(RingItemError::WrongType(kind.code()));
        }
        Ok(Self {
            kind,
            time_offset,
            wall_clock,
            offset_divisor: 1,
            strings,
        })
    }

    pub fn to_ring_item(&self, body_header: Option<BodyHeader>) -> RingItem {
        let text_bytes: usize = self.strings.iter().map(|s| s.len() + 1).sum();
        let mut payload = Vec::with_capacity(16 + text_bytes);
        payload.extend_from_slice(&self.time_offset.to_le_bytes());
        payload.extend_from_slice(&self.wall_clock.to_le_bytes());
        payload.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
        payload.extend_from_slice(&self.offset_divisor.to_le_bytes());
        for string in &self.strings {
            payload.extend_from_slice(string.as_bytes());
            payload.push(0);
        }
        RingItem {
            item_type: self.kind.code(),
            body_header,
            payload,
        }
    }
}

impl TryFrom<&RingItem> for TextItem {
    type Error = RingItemError;
    fn try_from(item: &RingItem) -> Result<Self, Self::Error> {
        let kind = item.ring_type();
        if !matches!(kind, RingType::PacketTypes | RingType::MonitoredVariables) {
            return Err(RingItemError::WrongType(item.item_type));
        }
        if item.payload.len() < 16 {
            return Err(RingItemError::ShortBody);
        }
        let mut cursor = Cursor::new(item.payload.as_slice());
        let time_offset = cursor.read_u32::<LittleEndian>()?;
        let wall_clock = cursor.read_u32::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()? as usize;
        let offset_divisor = cursor.read_u32::<LittleEndian>()?;
        let mut strings = Vec::with_capacity(count);
        let mut rest = &item.payload[16..];
        for _ in 0..count {
            let end = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or(RingItemError::ShortBody)?;
            strings.push(String::from_utf8(rest[..end].to_vec())?);
            rest = &rest[end + 1..];
        }
        Ok(Self {
            kind,
            time_offset,
            wall_clock,
            offset_divisor,
            strings,
        })
    }
}

/// RING_FORMAT payload: the data format version of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFormatItem {
    pub major: u16,
    pub minor: u16,
}

impl RingFormatItem {
    pub fn current() -> Self {
        Self {
            major: FORMAT_MAJOR,
            minor: FORMAT_MINOR,
        }
    }

    pub fn to_ring_item(&self) -> RingItem {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&self.major.to_le_bytes());
        payload.extend_from_slice(&self.minor.to_le_bytes());
        RingItem {
            item_type: RING_FORMAT,
            body_header: None,
            payload,
        }
    }
}

impl TryFrom<&RingItem> for RingFormatItem {
    type Error = RingItemError;
    fn try_from(item: &RingItem) -> Result<Self, Self::Error> {
        if item.item_type != RING_FORMAT {
            return Err(RingItemError::WrongType(item.item_type));
        }
        if item.payload.len() < 4 {
            return Err(RingItemError::ShortBody);
        }
        let mut cursor = Cursor::new(item.payload.as_slice());
        Ok(Self {
            major: cursor.read_u16::<LittleEndian>()?,
            minor: cursor.read_u16::<LittleEndian>()?,
        })
    }
}

/// EVB_GLOM_INFO payload: the correlation parameters in effect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlomParametersItem {
    pub coincidence_ticks: u64,
    pub is_building: bool,
    pub timestamp_policy: TimestampPolicy,
}

impl GlomParametersItem {
    pub fn new(coincidence_ticks: u64, is_building: bool, timestamp_policy: TimestampPolicy) -> Self {
        Self {
            coincidence_ticks,
            is_building,
            timestamp_policy,
        }
    }

    pub fn to_ring_item(&self) -> RingItem {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&self.coincidence_ticks.to_le_bytes());
        payload.extend_from_slice(&(self.is_building as u16).to_le_bytes());
        payload.extend_from_slice(&self.timestamp_policy.code().to_le_bytes());
        RingItem {
            item_type: EVB_GLOM_INFO,
            body_header: None,
            payload,
        }
    }
}

impl TryFrom<&RingItem> for GlomParametersItem {
    type Error = RingItemError;
    fn try_from(item: &RingItem) -> Result<Self, Self::Error> {
        if item.item_type != EVB_GLOM_INFO {
            return Err(RingItemError::WrongType(item.item_type));
        }
        if item.payload.len() < 12 {
            return Err(RingItemError::ShortBody);
        }
        let mut cursor = Cursor::new(item.payload.as_slice());
        Ok(Self {
            coincidence_ticks: cursor.read_u64::<LittleEndian>()?,
            is_building: cursor.read_u16::<LittleEndian>()? != 0,
            timestamp_policy: TimestampPolicy::try_from(cursor.read_u16::<LittleEndian>()?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_no_body_header() {
        let item = RingItem::new(RingType::Physics, vec![1, 2, 3, 4, 5]);
        let bytes = item.encode();
        assert_eq!(bytes.len() as u32, item.size());
        let decoded = RingItem::decode(&bytes).unwrap();
        assert_eq!(decoded, item);
        assert_eq!(RingItem::peek_body_header(&bytes).unwrap(), None);
    }

    #[test]
    fn test_round_trip_with_body_header() {
        let bh = BodyHeader::new(0x1122334455667788, 7, 2);
        let item = RingItem::with_body_header(RingType::Physics, bh, vec![9; 13]);
        let bytes = item.encode();
        let decoded = RingItem::decode(&bytes).unwrap();
        assert_eq!(decoded, item);
        assert_eq!(RingItem::peek_body_header(&bytes).unwrap(), Some(bh));
        assert_eq!(RingItem::peek_type(&bytes).unwrap(), PHYSICS_EVENT);
    }

    #[test]
    fn test_body_header_extension_skipped() {
        // A 28-byte body header: 8 extension bytes between header and payload
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&44u32.to_le_bytes());
        bytes.extend_from_slice(&PHYSICS_EVENT.to_le_bytes());
        bytes.extend_from_slice(&28u32.to_le_bytes());
        bytes.extend_from_slice(&42u64.to_le_bytes());
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&[0xEE; 8]); // extension
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let decoded = RingItem::decode(&bytes).unwrap();
        assert_eq!(decoded.body_header.unwrap().timestamp, 42);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_decode_rejects_bad_sizes() {
        let item = RingItem::new(RingType::Scalers, vec![0; 16]);
        let mut bytes = item.encode();
        // Size smaller than the minimum item
        bytes[0..4].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            RingItem::decode(&bytes),
            Err(RingItemError::BadSize(4))
        ));
        // Size past the end of the buffer
        let past_end = bytes.len() as u32 + 1;
        bytes[0..4].copy_from_slice(&past_end.to_le_bytes());
        assert!(matches!(
            RingItem::decode(&bytes),
            Err(RingItemError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_bad_discriminator() {
        let item = RingItem::new(RingType::Physics, vec![0; 8]);
        let mut bytes = item.encode();
        bytes[8..12].copy_from_slice(&12u32.to_le_bytes());
        assert!(matches!(
            RingItem::decode(&bytes),
            Err(RingItemError::BadBodyHeaderSize(12))
        ));
    }

    #[test]
    fn test_read_from_stream() {
        let a = RingItem::new(RingType::Scalers, vec![1; 24]);
        let b = RingItem::with_body_header(
            RingType::Physics,
            BodyHeader::new(10, 1, 0),
            vec![2; 6],
        );
        let mut stream = a.encode();
        stream.extend_from_slice(&b.encode());
        let mut cursor = Cursor::new(stream);
        assert_eq!(RingItem::read_from(&mut cursor).unwrap().unwrap(), a);
        assert_eq!(RingItem::read_from(&mut cursor).unwrap().unwrap(), b);
        assert!(RingItem::read_from(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_read_from_eof_mid_item() {
        let item = RingItem::new(RingType::Physics, vec![3; 32]);
        let bytes = item.encode();
        let mut cursor = Cursor::new(&bytes[..bytes.len() - 5]);
        assert!(matches!(
            RingItem::read_from(&mut cursor),
            Err(RingItemError::Truncated { .. })
        ));
    }

    #[test]
    fn test_state_change_round_trip() {
        let begin =
            StateChangeItem::new(RingType::BeginRun, 310, 0, 1_722_000_000, "test run").unwrap();
        let item = begin.to_ring_item(Some(BodyHeader::new(0, 2, 1)));
        let back = StateChangeItem::try_from(&item).unwrap();
        assert_eq!(back, begin);
        let reencoded = RingItem::decode(&item.encode()).unwrap();
        assert_eq!(reencoded, item);
    }

    #[test]
    fn test_state_change_rejects_long_title() {
        let title = "x".repeat(TITLE_MAX_SIZE + 1);
        assert!(matches!(
            StateChangeItem::new(RingType::BeginRun, 1, 0, 0, &title),
            Err(RingItemError::TitleTooLong(_))
        ));
    }

    #[test]
    fn test_state_change_rejects_wrong_type() {
        assert!(matches!(
            StateChangeItem::new(RingType::Physics, 1, 0, 0, "nope"),
            Err(RingItemError::WrongType(PHYSICS_EVENT))
        ));
        let item = RingItem::new(RingType::Physics, vec![0; 100]);
        assert!(StateChangeItem::try_from(&item).is_err());
    }

    #[test]
    fn test_scalers_round_trip() {
        let scalers = ScalersItem::new(0, 2, 1_722_000_002, true, vec![10, 20, 30, 40]);
        let item = scalers.to_ring_item(None);
        let back = ScalersItem::try_from(&item).unwrap();
        assert_eq!(back, scalers);
        assert_eq!(RingItem::decode(&item.encode()).unwrap(), item);
    }

    #[test]
    fn test_event_count_round_trip() {
        let count = PhysicsEventCountItem::new(120, 1_722_000_120, 8_675_309);
        let item = count.to_ring_item(Some(BodyHeader::new(999, 4, 0)));
        assert_eq!(PhysicsEventCountItem::try_from(&item).unwrap(), count);
        assert_eq!(RingItem::decode(&item.encode()).unwrap(), item);
    }

    #[test]
    fn test_text_round_trip() {
        let text = TextItem::new(
            RingType::MonitoredVariables,
            5,
            1_722_000_005,
            vec!["hv.anode=1200".to_string(), "gas.flow=42".to_string()],
        )
        .unwrap();
        let item = text.to_ring_item(None);
        assert_eq!(TextItem::try_from(&item).unwrap(), text);
        assert_eq!(RingItem::decode(&item.encode()).unwrap(), item);
    }

    #[test]
    fn test_format_round_trip() {
        let format = RingFormatItem::current();
        let item = format.to_ring_item();
        assert_eq!(RingFormatItem::try_from(&item).unwrap(), format);
        assert_eq!(RingItem::decode(&item.encode()).unwrap(), item);
    }

    #[test]
    fn test_glom_parameters_round_trip() {
        let params = GlomParametersItem::new(100, true, TimestampPolicy::Average);
        let item = params.to_ring_item();
        assert_eq!(GlomParametersItem::try_from(&item).unwrap(), params);
        assert_eq!(RingItem::decode(&item.encode()).unwrap(), item);
    }
}

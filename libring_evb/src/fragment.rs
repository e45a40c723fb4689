//! Fragments: one ring item plus the out-of-band routing metadata that
//! crosses the tagger/queue boundary ahead of it.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use super::constants::*;
use super::error::{FragmentError, RingItemError};
use super::ring_item::{BodyHeader, RingItem, RingType, TimestampPolicy};

/// The 20-byte little-endian header prepended to every fragment on the wire:
/// timestamp, source id, payload size, barrier type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentHeader {
    pub timestamp: u64,
    pub source_id: u32,
    pub size: u32,
    pub barrier: u32,
}

impl FragmentHeader {
    pub fn new(timestamp: u64, source_id: u32, size: u32, barrier: u32) -> Self {
        Self {
            timestamp,
            source_id,
            size,
            barrier,
        }
    }

    pub fn encode(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let mut buf = [0u8; FRAGMENT_HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..12].copy_from_slice(&self.source_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf[16..20].copy_from_slice(&self.barrier.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return Err(FragmentError::TruncatedHeader {
                read: bytes.len(),
                expected: FRAGMENT_HEADER_SIZE,
            });
        }
        let mut cursor = Cursor::new(bytes);
        Ok(Self {
            timestamp: cursor.read_u64::<LittleEndian>()?,
            source_id: cursor.read_u32::<LittleEndian>()?,
            size: cursor.read_u32::<LittleEndian>()?,
            barrier: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

/// A fragment: header plus the complete bytes of the ring item it wraps.
///
/// Fragments are allocated from a `FragmentPool` and must be handed back to
/// it when the pipeline is done with them; the body buffer's capacity is the
/// pool's size class and may exceed `header.size`, so the header is the
/// logical length.
#[derive(Debug)]
pub struct Fragment {
    pub header: FragmentHeader,
    pub(crate) body: Vec<u8>,
}

impl Fragment {
    /// The wrapped ring item bytes
    pub fn body(&self) -> &[u8] {
        &self.body[..self.header.size as usize]
    }

    pub(crate) fn body_mut(&mut self) -> &mut [u8] {
        let size = self.header.size as usize;
        &mut self.body[..size]
    }

    pub fn is_barrier(&self) -> bool {
        self.header.barrier != 0
    }

    /// Ring type of the wrapped item
    pub fn ring_type(&self) -> Result<RingType, RingItemError> {
        Ok(RingType::from(RingItem::peek_type(self.body())?))
    }

    /// Fully decode the wrapped ring item
    pub fn ring_item(&self) -> Result<RingItem, RingItemError> {
        RingItem::decode(self.body())
    }
}

/// The fragments making up one built event, in correlation order. Replaces
/// the usual hand-rolled intrusive list with owned storage; the output stage
/// releases every fragment back to the pool after observers run.
#[derive(Debug, Default)]
pub struct FragmentChain {
    fragments: Vec<Box<Fragment>>,
}

impl FragmentChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: Box<Fragment>) {
        self.fragments.push(fragment);
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn first(&self) -> Option<&Fragment> {
        self.fragments.first().map(|f| f.as_ref())
    }

    pub fn last(&self) -> Option<&Fragment> {
        self.fragments.last().map(|f| f.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments.iter().map(|f| f.as_ref())
    }

    pub fn into_fragments(self) -> Vec<Box<Fragment>> {
        self.fragments
    }

    /// Total payload bytes across the chain, fragment headers excluded
    pub fn payload_bytes(&self) -> usize {
        self.fragments.iter().map(|f| f.header.size as usize).sum()
    }

    /// Timestamp of a built event under the given stamping policy.
    /// Fragments arrive in non-decreasing timestamp order, so earliest is
    /// the first and latest is the last.
    pub fn stamp(&self, policy: TimestampPolicy) -> u64 {
        use TimestampPolicy::*;
        match policy {
            Earliest => self.first().map_or(0, |f| f.header.timestamp),
            Latest => self.last().map_or(0, |f| f.header.timestamp),
            Average => {
                if self.fragments.is_empty() {
                    0
                } else {
                    let sum: u128 = self
                        .fragments
                        .iter()
                        .map(|f| f.header.timestamp as u128)
                        .sum();
                    (sum / self.fragments.len() as u128) as u64
                }
            }
        }
    }

    /// Body-header source id for the built event: the opening fragment's
    pub fn source_id(&self) -> u32 {
        self.first().map_or(0, |f| f.header.source_id)
    }

    /// Glue the chain into one built PHYSICS_EVENT ring item. The payload is
    /// the concatenation of fragment header + ring item bytes per fragment.
    pub fn to_built_item(&self, policy: TimestampPolicy) -> RingItem {
        let total: usize = self
            .fragments
            .iter()
            .map(|f| FRAGMENT_HEADER_SIZE + f.header.size as usize)
            .sum();
        let mut payload = Vec::with_capacity(total);
        for fragment in self.iter() {
            payload.extend_from_slice(&fragment.header.encode());
            payload.extend_from_slice(fragment.body());
        }
        RingItem::with_body_header(
            RingType::Physics,
            BodyHeader::new(self.stamp(policy), self.source_id(), 0),
            payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FragmentPool;
    use crate::ring_item::TimestampPolicy;

    fn make_fragment(pool: &FragmentPool, timestamp: u64, source_id: u32) -> Box<Fragment> {
        let item = RingItem::with_body_header(
            RingType::Physics,
            BodyHeader::new(timestamp, source_id, 0),
            vec![0xAB; 4],
        );
        let bytes = item.encode();
        let header = FragmentHeader::new(timestamp, source_id, bytes.len() as u32, 0);
        let mut fragment = pool.allocate(header).unwrap();
        fragment.body_mut().copy_from_slice(&bytes);
        fragment
    }

    #[test]
    fn test_header_round_trip() {
        let header = FragmentHeader::new(0xDEADBEEF01234567, 12, 48, 2);
        let bytes = header.encode();
        assert_eq!(FragmentHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_decode_short_buffer() {
        let header = FragmentHeader::new(1, 2, 3, 4);
        let bytes = header.encode();
        assert!(matches!(
            FragmentHeader::decode(&bytes[..10]),
            Err(FragmentError::TruncatedHeader { read: 10, .. })
        ));
    }

    #[test]
    fn test_chain_stamping_policies() {
        let pool = FragmentPool::new();
        let mut chain = FragmentChain::new();
        for ts in [100u64, 110, 150] {
            chain.push(make_fragment(&pool, ts, 3));
        }
        assert_eq!(chain.stamp(TimestampPolicy::Earliest), 100);
        assert_eq!(chain.stamp(TimestampPolicy::Latest), 150);
        assert_eq!(chain.stamp(TimestampPolicy::Average), 120);
        assert_eq!(chain.source_id(), 3);
    }

    #[test]
    fn test_built_item_layout() {
        let pool = FragmentPool::new();
        let mut chain = FragmentChain::new();
        chain.push(make_fragment(&pool, 500, 1));
        chain.push(make_fragment(&pool, 510, 2));
        let built = chain.to_built_item(TimestampPolicy::Earliest);
        assert_eq!(built.ring_type(), RingType::Physics);
        let bh = built.body_header.unwrap();
        assert_eq!(bh.timestamp, 500);
        assert_eq!(bh.source_id, 1);
        assert_eq!(bh.barrier, 0);

        // The payload must re-parse as fragment header + item pairs
        let first_header = FragmentHeader::decode(&built.payload[..FRAGMENT_HEADER_SIZE]).unwrap();
        assert_eq!(first_header.timestamp, 500);
        let first_item_bytes =
            &built.payload[FRAGMENT_HEADER_SIZE..FRAGMENT_HEADER_SIZE + first_header.size as usize];
        let first_item = RingItem::decode(first_item_bytes).unwrap();
        assert_eq!(first_item.body_header.unwrap().timestamp, 500);
    }
}

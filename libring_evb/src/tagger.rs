//! The fragment tagger: turns an untagged ring item stream into a stream of
//! fragment header + item pairs.
//!
//! The tagger is the provenance stage of the pipeline. Items that carry a
//! body header are tagged from it; items that do not get the configured
//! default source id and inherit the last known timestamp. A body header
//! whose timestamp is the null sentinel also inherits the last known
//! timestamp (hardware without a timestamp channel takes its temporal
//! position from the prior item; this is policy, not an error).

use std::io::{IoSlice, Read, Write};

use super::constants::*;
use super::error::TaggerError;
use super::fragment::FragmentHeader;
use super::ring_item::RingItem;

/// Reads whole ring items out of a byte stream in fixed-size blocks.
///
/// A block boundary can split an item; the partial tail is kept and the
/// next read continues filling it. Interrupted and short reads are retried
/// internally. End of stream inside an item is a format error.
pub struct ItemReader<R: Read> {
    source: R,
    buffer: Vec<u8>,
    consumed: usize,
    block_size: usize,
    eof: bool,
}

impl<R: Read> ItemReader<R> {
    pub fn new(source: R, block_size: usize) -> Result<Self, TaggerError> {
        if block_size < RING_HEADER_SIZE {
            return Err(TaggerError::BlockTooSmall(block_size));
        }
        Ok(Self {
            source,
            buffer: Vec::with_capacity(block_size),
            consumed: 0,
            block_size,
            eof: false,
        })
    }

    fn buffered(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Pull one more block from the source, first compacting away consumed
    /// bytes so the partial item (if any) sits at the front.
    fn fill(&mut self) -> Result<(), TaggerError> {
        if self.consumed > 0 {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
        let old_len = self.buffer.len();
        self.buffer.resize(old_len + self.block_size, 0);
        let got = super::ring_item::read_fully(&mut self.source, &mut self.buffer[old_len..])?;
        self.buffer.truncate(old_len + got);
        if got == 0 {
            self.eof = true;
        }
        Ok(())
    }

    /// The next complete ring item's raw bytes, or None at a clean end of
    /// stream.
    pub fn next_item(&mut self) -> Result<Option<Vec<u8>>, TaggerError> {
        loop {
            if self.buffered() >= RING_HEADER_SIZE {
                let at = self.consumed;
                let size = u32::from_le_bytes([
                    self.buffer[at],
                    self.buffer[at + 1],
                    self.buffer[at + 2],
                    self.buffer[at + 3],
                ]);
                if (size as usize) < MIN_RING_ITEM_SIZE {
                    return Err(super::error::RingItemError::BadSize(size).into());
                }
                if (size as usize) > MAX_RING_ITEM_SIZE {
                    return Err(super::error::RingItemError::Oversize(size).into());
                }
                if self.buffered() >= size as usize {
                    let item = self.buffer[at..at + size as usize].to_vec();
                    self.consumed += size as usize;
                    return Ok(Some(item));
                }
            }
            if self.eof {
                return if self.buffered() == 0 {
                    Ok(None)
                } else {
                    Err(TaggerError::PartialItem {
                        remaining: self.buffered(),
                    })
                };
            }
            self.fill()?;
        }
    }
}

/// Running totals for one tagging pass
#[derive(Debug, Clone, Copy, Default)]
pub struct TagStats {
    pub items: u64,
    pub bytes: u64,
}

/// Derives a fragment header for each ring item and forwards both.
pub struct FragmentTagger<R: Read> {
    reader: ItemReader<R>,
    default_source_id: u32,
    reset_on_begin: bool,
    last_timestamp: u64,
}

impl<R: Read> FragmentTagger<R> {
    pub fn new(
        source: R,
        block_size: usize,
        default_source_id: u32,
        reset_on_begin: bool,
    ) -> Result<Self, TaggerError> {
        Ok(Self {
            reader: ItemReader::new(source, block_size)?,
            default_source_id,
            reset_on_begin,
            last_timestamp: 0,
        })
    }

    /// Tag the next item. Returns the derived header and the item's raw
    /// bytes, untouched.
    pub fn next_fragment(&mut self) -> Result<Option<(FragmentHeader, Vec<u8>)>, TaggerError> {
        let bytes = match self.reader.next_item()? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let item_type = RingItem::peek_type(&bytes)?;
        let header = match RingItem::peek_body_header(&bytes)? {
            Some(body_header) => {
                let timestamp = if body_header.timestamp == NULL_TIMESTAMP {
                    self.last_timestamp
                } else {
                    self.last_timestamp = body_header.timestamp;
                    body_header.timestamp
                };
                FragmentHeader::new(
                    timestamp,
                    body_header.source_id,
                    bytes.len() as u32,
                    body_header.barrier,
                )
            }
            None => {
                // Physics data without provenance cannot be correlated
                if item_type == PHYSICS_EVENT {
                    return Err(TaggerError::PhysicsWithoutBodyHeader);
                }
                FragmentHeader::new(
                    self.last_timestamp,
                    self.default_source_id,
                    bytes.len() as u32,
                    0,
                )
            }
        };
        if self.reset_on_begin && item_type == BEGIN_RUN {
            // New run, new ordering epoch
            self.last_timestamp = 0;
        }
        Ok(Some((header, bytes)))
    }

    /// Tag the whole stream, writing each header + payload pair to `sink`.
    pub fn tag_stream<W: Write>(&mut self, sink: &mut W) -> Result<TagStats, TaggerError> {
        let mut stats = TagStats::default();
        while let Some((header, bytes)) = self.next_fragment()? {
            write_fragment(sink, &header, &bytes)?;
            stats.items += 1;
            stats.bytes += FRAGMENT_HEADER_SIZE as u64 + bytes.len() as u64;
        }
        sink.flush()?;
        Ok(stats)
    }
}

/// Scatter-write one fragment: the synthesized header and the original item
/// bytes go out as a two-element iovec, looping over short writes. The
/// payload is never copied into a combined buffer.
pub fn write_fragment<W: Write>(
    sink: &mut W,
    header: &FragmentHeader,
    payload: &[u8],
) -> std::io::Result<()> {
    let head = header.encode();
    let total = head.len() + payload.len();
    let mut written = 0;
    while written < total {
        let slices = if written < head.len() {
            [IoSlice::new(&head[written..]), IoSlice::new(payload)]
        } else {
            [IoSlice::new(&payload[written - head.len()..]), IoSlice::new(&[])]
        };
        match sink.write_vectored(&slices) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole fragment",
                ))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_item::{BodyHeader, RingType, ScalersItem, StateChangeItem};
    use std::io::Cursor;

    /// Reader that doles out at most `chunk` bytes per read call, to force
    /// carry-over across block boundaries.
    struct Dribble {
        data: Vec<u8>,
        at: usize,
        chunk: usize,
    }

    impl Read for Dribble {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.at);
            buf[..n].copy_from_slice(&self.data[self.at..self.at + n]);
            self.at += n;
            Ok(n)
        }
    }

    fn physics_item(timestamp: u64, source_id: u32) -> RingItem {
        RingItem::with_body_header(
            RingType::Physics,
            BodyHeader::new(timestamp, source_id, 0),
            vec![0x5A; 10],
        )
    }

    #[test]
    fn test_item_reader_carry_over() {
        let a = physics_item(1, 0).encode();
        let b = physics_item(2, 0).encode();
        let mut data = a.clone();
        data.extend_from_slice(&b);
        // Chunk size that splits both items mid-record
        let mut reader = ItemReader::new(
            Dribble {
                data,
                at: 0,
                chunk: 13,
            },
            16,
        )
        .unwrap();
        assert_eq!(reader.next_item().unwrap().unwrap(), a);
        assert_eq!(reader.next_item().unwrap().unwrap(), b);
        assert!(reader.next_item().unwrap().is_none());
    }

    #[test]
    fn test_item_reader_eof_mid_item() {
        let bytes = physics_item(1, 0).encode();
        let reader = Cursor::new(bytes[..bytes.len() - 3].to_vec());
        let mut reader = ItemReader::new(reader, 64).unwrap();
        assert!(matches!(
            reader.next_item(),
            Err(TaggerError::PartialItem { .. })
        ));
    }

    #[test]
    fn test_item_reader_rejects_tiny_block() {
        assert!(matches!(
            ItemReader::new(Cursor::new(Vec::new()), 4),
            Err(TaggerError::BlockTooSmall(4))
        ));
    }

    #[test]
    fn test_tagging_from_body_header() {
        let stream = physics_item(77, 3).encode();
        let mut tagger = FragmentTagger::new(Cursor::new(stream), 64, 9, false).unwrap();
        let (header, bytes) = tagger.next_fragment().unwrap().unwrap();
        assert_eq!(header.timestamp, 77);
        assert_eq!(header.source_id, 3);
        assert_eq!(header.size as usize, bytes.len());
        assert_eq!(header.barrier, 0);
    }

    #[test]
    fn test_null_timestamp_inherits_previous() {
        let mut stream = physics_item(500, 3).encode();
        stream.extend_from_slice(
            &RingItem::with_body_header(
                RingType::Physics,
                BodyHeader::new(NULL_TIMESTAMP, 3, 0),
                vec![1],
            )
            .encode(),
        );
        let mut tagger = FragmentTagger::new(Cursor::new(stream), 64, 9, false).unwrap();
        assert_eq!(tagger.next_fragment().unwrap().unwrap().0.timestamp, 500);
        assert_eq!(tagger.next_fragment().unwrap().unwrap().0.timestamp, 500);
    }

    #[test]
    fn test_untagged_item_uses_defaults() {
        let mut stream = physics_item(123, 3).encode();
        let scalers = ScalersItem::new(0, 2, 0, true, vec![1, 2, 3]).to_ring_item(None);
        stream.extend_from_slice(&scalers.encode());
        let mut tagger = FragmentTagger::new(Cursor::new(stream), 64, 9, false).unwrap();
        tagger.next_fragment().unwrap();
        let (header, _) = tagger.next_fragment().unwrap().unwrap();
        assert_eq!(header.source_id, 9);
        assert_eq!(header.timestamp, 123);
    }

    #[test]
    fn test_physics_without_body_header_is_fatal() {
        let stream = RingItem::new(RingType::Physics, vec![1, 2, 3]).encode();
        let mut tagger = FragmentTagger::new(Cursor::new(stream), 64, 9, false).unwrap();
        assert!(matches!(
            tagger.next_fragment(),
            Err(TaggerError::PhysicsWithoutBodyHeader)
        ));
    }

    #[test]
    fn test_begin_run_resets_epoch() {
        let mut stream = physics_item(900, 3).encode();
        let begin = StateChangeItem::new(RingType::BeginRun, 42, 0, 0, "reset")
            .unwrap()
            .to_ring_item(Some(BodyHeader::new(901, 3, 1)));
        stream.extend_from_slice(&begin.encode());
        let untagged = ScalersItem::new(0, 2, 0, true, vec![7]).to_ring_item(None);
        stream.extend_from_slice(&untagged.encode());

        let mut tagger = FragmentTagger::new(Cursor::new(stream), 64, 9, true).unwrap();
        tagger.next_fragment().unwrap();
        let (begin_header, _) = tagger.next_fragment().unwrap().unwrap();
        // The begin item itself is stamped from its own body header
        assert_eq!(begin_header.timestamp, 901);
        assert_eq!(begin_header.barrier, 1);
        // but the epoch restarts afterwards
        let (after, _) = tagger.next_fragment().unwrap().unwrap();
        assert_eq!(after.timestamp, 0);
    }

    #[test]
    fn test_tag_stream_output_parses_back() {
        let mut stream = physics_item(5, 2).encode();
        stream.extend_from_slice(&physics_item(6, 2).encode());
        let mut tagger = FragmentTagger::new(Cursor::new(stream), 32, 0, false).unwrap();
        let mut out = Vec::new();
        let stats = tagger.tag_stream(&mut out).unwrap();
        assert_eq!(stats.items, 2);
        assert_eq!(stats.bytes as usize, out.len());

        let header = FragmentHeader::decode(&out[..FRAGMENT_HEADER_SIZE]).unwrap();
        assert_eq!(header.timestamp, 5);
        let item = RingItem::decode(
            &out[FRAGMENT_HEADER_SIZE..FRAGMENT_HEADER_SIZE + header.size as usize],
        )
        .unwrap();
        assert_eq!(item.body_header.unwrap().timestamp, 5);
    }
}

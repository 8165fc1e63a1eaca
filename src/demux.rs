//! Record demultiplexing: raw data-block bytes to per-channel samples.
//!
//! A data group's byte stream interleaves fixed-length records from one or
//! more channel groups, each record prefixed by a record ID when the group
//! declares one. The [`Demultiplexer`] consumes the stream chunk by chunk in
//! whatever sizes the data blocks happen to come in; records and even record
//! IDs may straddle chunk boundaries, so partial bytes are carried between
//! [`Demultiplexer::feed`] calls. Decoded values are raw; conversions apply
//! lazily at read time.

use byteorder::{ByteOrder, LE};
use log::warn;

use crate::{extract::Extractor, sequence::SequenceWriter, MdfError, MdfResult};

/// One channel's slice of a record.
pub struct GroupChannel {
    pub extractor: Extractor,
    pub writer: SequenceWriter,
    /// (byte index within the record, bit mask); a set bit means the sample
    /// is invalid and stored as NaN.
    pub invalidation: Option<(usize, u8)>,
}

impl GroupChannel {
    pub fn new(extractor: Extractor, writer: SequenceWriter) -> Self {
        Self {
            extractor,
            writer,
            invalidation: None,
        }
    }

    pub fn with_invalidation(mut self, byte: usize, mask: u8) -> Self {
        self.invalidation = Some((byte, mask));
        self
    }
}

/// All channels sharing one record ID and record layout.
pub struct RecordGroup {
    pub record_id: u64,
    /// Body bytes following the record ID, invalidation bytes included.
    pub record_len: usize,
    /// Row count the file declares; decoding short-circuits once reached.
    pub declared_rows: Option<u64>,
    rows_seen: u64,
    channels: Vec<GroupChannel>,
}

impl RecordGroup {
    /// Fails with [`MdfError::BadRowWidth`] when any channel's field extends
    /// past the declared record length.
    pub fn new(
        record_id: u64,
        record_len: usize,
        declared_rows: Option<u64>,
        channels: Vec<GroupChannel>,
    ) -> MdfResult<Self> {
        for ch in &channels {
            let end = ch
                .extractor
                .end()
                .max(ch.invalidation.map_or(0, |(byte, _)| byte + 1));
            if end > record_len {
                return Err(MdfError::BadRowWidth {
                    got: record_len,
                    expected: end,
                });
            }
        }
        if record_len == 0 {
            return Err(MdfError::BadRowWidth {
                got: 0,
                expected: 1,
            });
        }
        Ok(Self {
            record_id,
            record_len,
            declared_rows,
            rows_seen: 0,
            channels,
        })
    }

    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    fn complete(&self) -> bool {
        self.declared_rows.is_some_and(|n| self.rows_seen >= n)
    }

    fn decode(&mut self, body: &[u8]) {
        if self.complete() {
            // Past the declared count; consume without decoding.
            return;
        }
        self.rows_seen += 1;
        for ch in &mut self.channels {
            let invalid = ch
                .invalidation
                .is_some_and(|(byte, mask)| body.get(byte).is_some_and(|b| b & mask != 0));
            let value = if invalid {
                f64::NAN
            } else {
                ch.extractor.extract(body)
            };
            ch.writer.push(value);
        }
    }
}

/// The record layout of one data group's stream.
pub struct RecordSchema {
    /// Bytes of record-ID prefix: 0, 1, 2, 4 or 8.
    pub record_id_size: usize,
    pub groups: Vec<RecordGroup>,
}

impl RecordSchema {
    pub fn new(record_id_size: usize, groups: Vec<RecordGroup>) -> MdfResult<Self> {
        if !matches!(record_id_size, 0 | 1 | 2 | 4 | 8) {
            return Err(MdfError::BadRowWidth {
                got: record_id_size,
                expected: 8,
            });
        }
        if record_id_size == 0 && groups.len() > 1 {
            // Multiple groups are indistinguishable without an ID prefix.
            return Err(MdfError::UnknownRecordId(0));
        }
        Ok(Self {
            record_id_size,
            groups,
        })
    }

    /// A single unprefixed group, the common case for sorted files.
    pub fn single(group: RecordGroup) -> Self {
        Self {
            record_id_size: 0,
            groups: vec![group],
        }
    }

    fn group_index(&self, id: u64) -> Option<usize> {
        self.groups.iter().position(|g| g.record_id == id)
    }
}

/// Streaming record splitter over one data group.
pub struct Demultiplexer {
    schema: RecordSchema,
    /// Partial record-ID bytes carried across a chunk boundary.
    id_carry: Vec<u8>,
    /// Partial record body carried across a chunk boundary.
    body_carry: Vec<u8>,
    /// Group the carried body belongs to.
    current: Option<usize>,
}

impl Demultiplexer {
    pub fn new(schema: RecordSchema) -> Self {
        Self {
            schema,
            id_carry: Vec::new(),
            body_carry: Vec::new(),
            current: None,
        }
    }

    /// Consume one chunk of the record stream. Chunk boundaries are
    /// arbitrary; state carries over to the next call.
    pub fn feed(&mut self, mut chunk: &[u8]) -> MdfResult<()> {
        while !chunk.is_empty() {
            // A partial body always finishes before the next ID starts.
            if let Some(g) = self.current {
                let group = &mut self.schema.groups[g];
                let need = group.record_len - self.body_carry.len();
                let take = need.min(chunk.len());
                self.body_carry.extend_from_slice(&chunk[..take]);
                chunk = &chunk[take..];
                if take == need {
                    let body = std::mem::take(&mut self.body_carry);
                    group.decode(&body);
                    self.current = None;
                }
                continue;
            }

            if self.schema.record_id_size == 0 {
                if self.schema.groups.is_empty() {
                    // A data link with bytes but no channel groups to own them.
                    return Err(MdfError::UnknownRecordId(0));
                }
                self.current = Some(0);
                continue;
            }

            let need = self.schema.record_id_size - self.id_carry.len();
            let take = need.min(chunk.len());
            self.id_carry.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];
            if take == need {
                let id = read_record_id(&self.id_carry);
                self.id_carry.clear();
                let g = self
                    .schema
                    .group_index(id)
                    .ok_or(MdfError::UnknownRecordId(id))?;
                self.current = Some(g);
            }
        }
        Ok(())
    }

    /// True once every group has decoded its declared row count. The caller
    /// may stop feeding early; remaining stream bytes hold nothing new.
    pub fn complete(&self) -> bool {
        !self.schema.groups.is_empty()
            && self.schema.groups.iter().all(RecordGroup::complete)
    }

    /// Finish the stream. Leftover carried bytes mean the data region was
    /// truncated mid-record, which unfinalized files legitimately do.
    pub fn finish(mut self) -> RecordSchema {
        if !self.id_carry.is_empty() || !self.body_carry.is_empty() {
            warn!(
                "data stream ended mid-record ({} id + {} body bytes dropped)",
                self.id_carry.len(),
                self.body_carry.len()
            );
        }
        self.id_carry.clear();
        self.body_carry.clear();
        self.schema
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }
}

fn read_record_id(bytes: &[u8]) -> u64 {
    match bytes.len() {
        1 => bytes[0] as u64,
        2 => LE::read_u16(bytes) as u64,
        4 => LE::read_u32(bytes) as u64,
        8 => LE::read_u64(bytes),
        // Schema construction already restricted the size.
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{blocks::DataType, sequence::SampleSequence};

    fn u8_channel(at: u32) -> (GroupChannel, crate::sequence::SequenceReader) {
        let seq = SampleSequence::new();
        let reader = seq.reader();
        let ch = GroupChannel::new(
            Extractor::build(DataType::UnsignedIntegerLe, at, 0, 8).unwrap(),
            seq.writer(),
        );
        (ch, reader)
    }

    #[test]
    fn single_group_without_record_ids() {
        let (ch, reader) = u8_channel(1);
        let schema = RecordSchema::single(RecordGroup::new(0, 2, None, vec![ch]).unwrap());
        let mut demux = Demultiplexer::new(schema);
        demux.feed(&[0xff, 1, 0xff, 2, 0xff, 3]).unwrap();
        assert_eq!(reader.values(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn two_groups_split_by_record_id() {
        let (a, ra) = u8_channel(0);
        let (b, rb) = u8_channel(0);
        let schema = RecordSchema::new(
            1,
            vec![
                RecordGroup::new(1, 1, None, vec![a]).unwrap(),
                RecordGroup::new(2, 1, None, vec![b]).unwrap(),
            ],
        )
        .unwrap();
        let mut demux = Demultiplexer::new(schema);
        demux.feed(&[1, 10, 2, 20, 1, 11, 2, 21]).unwrap();
        assert_eq!(ra.values(), vec![10.0, 11.0]);
        assert_eq!(rb.values(), vec![20.0, 21.0]);
    }

    #[test]
    fn carry_across_every_chunk_boundary() {
        // 2-byte IDs and 3-byte bodies so both can straddle a boundary.
        let stream: Vec<u8> = (0..200u8)
            .flat_map(|i| vec![7, 0, i, i.wrapping_add(1), i.wrapping_add(2)])
            .collect();
        for chunk_size in 1..=9 {
            let (ch, reader) = u8_channel(0);
            let schema = RecordSchema::new(
                2,
                vec![RecordGroup::new(7, 3, None, vec![ch]).unwrap()],
            )
            .unwrap();
            let mut demux = Demultiplexer::new(schema);
            for chunk in stream.chunks(chunk_size) {
                demux.feed(chunk).unwrap();
            }
            assert_eq!(
                reader.values(),
                (0..200).map(|i| i as f64).collect::<Vec<_>>(),
                "chunk size {chunk_size}"
            );
        }
    }

    #[test]
    fn unknown_record_id_is_an_error() {
        let (ch, _reader) = u8_channel(0);
        let schema =
            RecordSchema::new(1, vec![RecordGroup::new(1, 1, None, vec![ch]).unwrap()]).unwrap();
        let mut demux = Demultiplexer::new(schema);
        assert!(matches!(
            demux.feed(&[9, 0]),
            Err(MdfError::UnknownRecordId(9))
        ));
    }

    #[test]
    fn declared_row_count_short_circuits() {
        let (ch, reader) = u8_channel(0);
        let schema = RecordSchema::single(RecordGroup::new(0, 1, Some(2), vec![ch]).unwrap());
        let mut demux = Demultiplexer::new(schema);
        demux.feed(&[1, 2, 3, 4, 5]).unwrap();
        assert!(demux.complete());
        assert_eq!(reader.values(), vec![1.0, 2.0]);
        assert_eq!(demux.finish().groups[0].rows_seen(), 2);
    }

    #[test]
    fn invalidation_bit_yields_nan() {
        let seq = SampleSequence::new();
        let reader = seq.reader();
        let ch = GroupChannel::new(
            Extractor::build(DataType::UnsignedIntegerLe, 0, 0, 8).unwrap(),
            seq.writer(),
        )
        .with_invalidation(1, 0x01);
        let schema = RecordSchema::single(RecordGroup::new(0, 2, None, vec![ch]).unwrap());
        let mut demux = Demultiplexer::new(schema);
        demux.feed(&[5, 0x00, 6, 0x01, 7, 0x00]).unwrap();
        let values = reader.values();
        assert_eq!(values[0], 5.0);
        assert!(values[1].is_nan());
        assert_eq!(values[2], 7.0);
    }

    #[test]
    fn field_past_record_end_is_rejected() {
        let (ch, _reader) = u8_channel(4);
        assert!(matches!(
            RecordGroup::new(0, 2, None, vec![ch]),
            Err(MdfError::BadRowWidth {
                got: 2,
                expected: 5
            })
        ));
    }

    #[test]
    fn truncated_stream_keeps_complete_records() {
        let (ch, reader) = u8_channel(0);
        let schema = RecordSchema::single(RecordGroup::new(0, 4, None, vec![ch]).unwrap());
        let mut demux = Demultiplexer::new(schema);
        // Six bytes of 4-byte records: one whole record, two bytes dropped.
        demux.feed(&[1, 0, 0, 0, 2, 0]).unwrap();
        demux.finish();
        assert_eq!(reader.values(), vec![1.0]);
    }

    #[test]
    fn bytes_without_any_group_are_an_error() {
        let schema = RecordSchema::new(0, vec![]).unwrap();
        let mut demux = Demultiplexer::new(schema);
        assert!(matches!(
            demux.feed(&[1, 2, 3]),
            Err(MdfError::UnknownRecordId(0))
        ));
    }
}

//! MDF v3 structural blocks.
//!
//! v3 predates the self-describing v4 envelope: headers are a 2-byte tag and
//! a u16 size, links are u32 fields mixed into the payload, and multi-byte
//! numbers follow the byte-order flag of the identification block. Payloads
//! are therefore decoded with a runtime [`Endian`] instead of the fixed
//! little-endian of [`super::v4`].

use std::io::{Cursor, Read, Seek};
use std::marker::PhantomData;

use binrw::{BinRead, BinReaderExt, Endian};
use log::warn;

use super::{trim_nul, MAX_CHAIN};
use crate::{
    io::{BlockReader, RawBlockV3},
    MdfError, MdfResult,
};

pub const TAG_HEADER: [u8; 2] = *b"HD";
pub const TAG_DATA_GROUP: [u8; 2] = *b"DG";
pub const TAG_CHANNEL_GROUP: [u8; 2] = *b"CG";
pub const TAG_CHANNEL: [u8; 2] = *b"CN";
pub const TAG_CONVERSION: [u8; 2] = *b"CC";
pub const TAG_TEXT: [u8; 2] = *b"TX";

/// A v3 block reachable through a "next" chain.
pub trait ChainBlockV3: Sized {
    const TAG: [u8; 2];

    fn from_raw(raw: &RawBlockV3, endian: Endian) -> MdfResult<Self>;

    fn next_link(&self) -> u64;
}

/// v3 counterpart of [`super::ChainIter`], with the same cycle guard.
pub struct ChainIterV3<'a, R, T> {
    reader: &'a mut BlockReader<R>,
    endian: Endian,
    start: u64,
    next: u64,
    seen: usize,
    _marker: PhantomData<T>,
}

impl<'a, R: Read + Seek, T: ChainBlockV3> ChainIterV3<'a, R, T> {
    pub fn new(reader: &'a mut BlockReader<R>, start: u64, endian: Endian) -> Self {
        Self {
            reader,
            endian,
            start,
            next: start,
            seen: 0,
            _marker: PhantomData,
        }
    }
}

impl<R: Read + Seek, T: ChainBlockV3> Iterator for ChainIterV3<'_, R, T> {
    type Item = MdfResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == 0 {
            return None;
        }
        if self.seen >= MAX_CHAIN {
            self.next = 0;
            return Some(Err(MdfError::ChainTooLong {
                start: self.start,
                limit: MAX_CHAIN,
            }));
        }
        self.seen += 1;

        let raw = match self.reader.read_block_v3(self.next, T::TAG, None) {
            Ok(Some(raw)) => raw,
            // next was non-zero, so a null resolution can't happen; keep the
            // arm anyway so a reader change can't panic us.
            Ok(None) => return None,
            Err(e) => {
                self.next = 0;
                return Some(Err(e));
            }
        };
        match T::from_raw(&raw, self.endian) {
            Ok(block) => {
                self.next = block.next_link();
                Some(Ok(block))
            }
            Err(e) => {
                self.next = 0;
                Some(Err(e))
            }
        }
    }
}

#[derive(Debug, Clone, BinRead)]
struct HeaderFieldsV3 {
    dg_first: u32,
    comment: u32,
    program: u32,
    dg_count: u16,
}

/// The `HD` block at offset 64.
#[derive(Debug, Clone)]
pub struct HeaderBlockV3 {
    pub first_data_group: u64,
    pub comment_link: u64,
    pub program_link: u64,
    pub data_group_count: u16,
}

impl HeaderBlockV3 {
    pub fn from_raw(raw: &RawBlockV3, endian: Endian) -> MdfResult<Self> {
        let f: HeaderFieldsV3 = Cursor::new(&raw.data).read_type(endian)?;
        Ok(Self {
            first_data_group: f.dg_first as u64,
            comment_link: f.comment as u64,
            program_link: f.program as u64,
            data_group_count: f.dg_count,
        })
    }
}

#[derive(Debug, Clone, BinRead)]
struct DataGroupFieldsV3 {
    next: u32,
    cg_first: u32,
    trigger: u32,
    data: u32,
    cg_count: u16,
    record_id_type: u16,
}

/// `DG`: one record stream. `record_id_type` 0 means no ID prefix, 1 a
/// leading ID byte, 2 a leading and a trailing ID byte.
#[derive(Debug, Clone)]
pub struct DataGroupBlockV3 {
    pub next: u64,
    pub first_channel_group: u64,
    pub data: u64,
    pub record_id_type: u16,
}

impl ChainBlockV3 for DataGroupBlockV3 {
    const TAG: [u8; 2] = TAG_DATA_GROUP;

    fn from_raw(raw: &RawBlockV3, endian: Endian) -> MdfResult<Self> {
        let f: DataGroupFieldsV3 = Cursor::new(&raw.data).read_type(endian)?;
        let _ = f.trigger;
        let _ = f.cg_count;
        Ok(Self {
            next: f.next as u64,
            first_channel_group: f.cg_first as u64,
            data: f.data as u64,
            record_id_type: f.record_id_type,
        })
    }

    fn next_link(&self) -> u64 {
        self.next
    }
}

#[derive(Debug, Clone, BinRead)]
struct ChannelGroupFieldsV3 {
    next: u32,
    cn_first: u32,
    comment: u32,
    record_id: u16,
    channel_count: u16,
    record_size: u16,
    record_count: u32,
}

/// `CG`: channels sharing one record layout.
#[derive(Debug, Clone)]
pub struct ChannelGroupBlockV3 {
    pub next: u64,
    pub first_channel: u64,
    pub comment_link: u64,
    pub record_id: u16,
    pub record_size: u16,
    pub record_count: u32,
}

impl ChainBlockV3 for ChannelGroupBlockV3 {
    const TAG: [u8; 2] = TAG_CHANNEL_GROUP;

    fn from_raw(raw: &RawBlockV3, endian: Endian) -> MdfResult<Self> {
        let f: ChannelGroupFieldsV3 = Cursor::new(&raw.data).read_type(endian)?;
        let _ = f.channel_count;
        Ok(Self {
            next: f.next as u64,
            first_channel: f.cn_first as u64,
            comment_link: f.comment as u64,
            record_id: f.record_id,
            record_size: f.record_size,
            record_count: f.record_count,
        })
    }

    fn next_link(&self) -> u64 {
        self.next
    }
}

#[derive(Debug, Clone, BinRead)]
struct ChannelFieldsV3 {
    next: u32,
    conversion: u32,
    source_ext: u32,
    dependency: u32,
    comment: u32,
    channel_type: u16,
    name: [u8; 32],
    description: [u8; 128],
    bit_start: u16,
    bit_count: u16,
    data_type: u16,
    bounded: u16,
    min_raw: f64,
    max_raw: f64,
    sample_rate: f64,
}

/// `CN`: one named signal. Later v3 revisions append a long-name link and an
/// extra byte offset for channels past the 8 KiB record mark; both are read
/// when the block is long enough.
#[derive(Debug, Clone)]
pub struct ChannelBlockV3 {
    pub next: u64,
    pub conversion: u64,
    pub name: String,
    pub description: String,
    pub channel_type: u16,
    /// Position of the first bit within the record, trailing record-ID and
    /// `extra_byte_offset` folded in.
    pub start_bit: u32,
    pub bit_count: u16,
    pub data_type: u16,
}

impl ChainBlockV3 for ChannelBlockV3 {
    const TAG: [u8; 2] = TAG_CHANNEL;

    fn from_raw(raw: &RawBlockV3, endian: Endian) -> MdfResult<Self> {
        let mut cursor = Cursor::new(&raw.data);
        let f: ChannelFieldsV3 = cursor.read_type(endian)?;
        let _ = (f.source_ext, f.dependency, f.comment);
        let _ = (f.bounded, f.min_raw, f.max_raw, f.sample_rate);

        // Layout past the 214 fixed payload bytes: long-name TX link,
        // display-name TX link, then the u16 additional byte offset.
        let fixed = 214usize;
        let mut extra_byte_offset = 0u16;
        if raw.data.len() >= fixed + 10 {
            let mut tail = Cursor::new(&raw.data[fixed + 8..]);
            extra_byte_offset = tail.read_type(endian)?;
        }

        Ok(Self {
            next: f.next as u64,
            conversion: f.conversion as u64,
            name: trim_nul(&f.name),
            description: trim_nul(&f.description),
            channel_type: f.channel_type,
            start_bit: f.bit_start as u32 + extra_byte_offset as u32 * 8,
            bit_count: f.bit_count,
            data_type: f.data_type,
        })
    }

    fn next_link(&self) -> u64 {
        self.next
    }
}

/// The subset of v3 conversion rules this crate evaluates, with parameters
/// already split out. Types without a v4 counterpart (polynomial,
/// exponential, logarithmic, date, time) decode as `Unsupported`.
#[derive(Debug, Clone)]
pub enum ConversionV3 {
    Identity,
    Linear { intercept: f64, slope: f64 },
    TableInterp(Vec<(f64, f64)>),
    TableNearest(Vec<(f64, f64)>),
    Rational([f64; 6]),
    Formula(String),
    /// Inline (value, label) pairs.
    TextTable(Vec<(f64, String)>),
    /// (lower, upper, TX link) triples; the first entry is the default and
    /// its bounds are ignored. Links are resolved by the caller.
    TextRangeTable(Vec<(f64, f64, u64)>),
    Unsupported(u16),
}

/// `CC` block: unit string plus one of the [`ConversionV3`] rules.
#[derive(Debug, Clone)]
pub struct ConversionBlockV3 {
    pub unit: String,
    pub conversion: ConversionV3,
}

const CC_FIXED_V3: usize = 2 + 8 + 8 + 20 + 2 + 2;

impl ConversionBlockV3 {
    pub fn from_raw(raw: &RawBlockV3, endian: Endian) -> MdfResult<Self> {
        #[derive(BinRead)]
        struct Fixed {
            bounded: u16,
            min: f64,
            max: f64,
            unit: [u8; 20],
            conversion_type: u16,
            table_size: u16,
        }

        let mut cursor = Cursor::new(&raw.data);
        let f: Fixed = cursor.read_type(endian)?;
        let _ = (f.bounded, f.min, f.max);
        let params = raw.data.get(CC_FIXED_V3..).unwrap_or(&[]);
        let n = f.table_size as usize;

        let read_f64 = |at: usize| -> MdfResult<f64> {
            let mut c = Cursor::new(params.get(at..).unwrap_or(&[]));
            Ok(c.read_type::<f64>(endian)?)
        };
        let read_pairs = |count: usize| -> MdfResult<Vec<(f64, f64)>> {
            (0..count)
                .map(|i| Ok((read_f64(i * 16)?, read_f64(i * 16 + 8)?)))
                .collect()
        };

        let conversion = match f.conversion_type {
            0 => ConversionV3::Linear {
                intercept: read_f64(0)?,
                slope: read_f64(8)?,
            },
            1 => ConversionV3::TableInterp(read_pairs(n)?),
            2 => ConversionV3::TableNearest(read_pairs(n)?),
            9 => {
                let mut coeffs = [0.0; 6];
                for (i, c) in coeffs.iter_mut().enumerate() {
                    *c = read_f64(i * 8)?;
                }
                ConversionV3::Rational(coeffs)
            }
            10 => ConversionV3::Formula(trim_nul(params)),
            11 => {
                let mut entries = Vec::with_capacity(n);
                for i in 0..n {
                    let at = i * 40;
                    let value = read_f64(at)?;
                    let text = trim_nul(params.get(at + 8..at + 40).unwrap_or(&[]));
                    entries.push((value, text));
                }
                ConversionV3::TextTable(entries)
            }
            12 => {
                let mut entries = Vec::with_capacity(n);
                for i in 0..n {
                    let at = i * 20;
                    let lower = read_f64(at)?;
                    let upper = read_f64(at + 8)?;
                    let mut c = Cursor::new(params.get(at + 16..).unwrap_or(&[]));
                    let link: u32 = c.read_type(endian)?;
                    entries.push((lower, upper, link as u64));
                }
                ConversionV3::TextRangeTable(entries)
            }
            65535 => ConversionV3::Identity,
            other => {
                warn!("v3 conversion type {other} is not supported; values degrade to 0");
                ConversionV3::Unsupported(other)
            }
        };

        Ok(Self {
            unit: trim_nul(&f.unit),
            conversion,
        })
    }
}

/// Resolve a v3 `TX` link into its NUL-terminated contents.
pub fn read_text_v3<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    link: u64,
) -> MdfResult<Option<String>> {
    match reader.read_block_v3(link, TAG_TEXT, None)? {
        Some(raw) => Ok(Some(trim_nul(&raw.data))),
        None => Ok(None),
    }
}

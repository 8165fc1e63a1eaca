//! Per-channel bit-field extraction from raw records.
//!
//! A channel describes its storage as (byte offset, bit offset, bit count,
//! data type). [`Extractor::build`] resolves that description once into a
//! variant that does the minimum work per sample: byte-aligned power-of-two
//! widths decode with a single fixed-width read, everything else goes
//! through a shift-and-mask fold over the spanned bytes. All outputs widen
//! to `f64`; values above 2^53 lose precision there, which callers accept.

use byteorder::{ByteOrder, BE, LE};
use log::warn;

use crate::{blocks::DataType, MdfError, MdfResult};

/// A compiled field decoder. Built once per channel, applied per record.
#[derive(Debug, Clone, PartialEq)]
pub enum Extractor {
    U8(usize),
    U16Le(usize),
    U16Be(usize),
    U32Le(usize),
    U32Be(usize),
    U64Le(usize),
    U64Be(usize),
    I8(usize),
    I16Le(usize),
    I16Be(usize),
    I32Le(usize),
    I32Be(usize),
    I64Le(usize),
    I64Be(usize),
    F32Le(usize),
    F32Be(usize),
    F64Le(usize),
    F64Be(usize),
    /// Arbitrary bit field. `span` bytes starting at `at` are folded into a
    /// u64, shifted down by `bit_offset` and masked to `bits`.
    Packed {
        at: usize,
        span: usize,
        bit_offset: u32,
        bits: u32,
        signed: bool,
        big_endian: bool,
    },
    /// Data types this crate cannot decode numerically read as 0.
    Zero,
}

impl Extractor {
    /// Compile a channel's field description.
    ///
    /// Floats must be byte-aligned and 32 or 64 bits wide; anything else is
    /// [`MdfError::UnsupportedFieldLayout`]. Integers accept any offset and
    /// any width up to 64 bits. Non-numeric data types (strings, byte
    /// arrays, unknown codes) compile to a constant-zero decoder so the rest
    /// of the group still reads.
    pub fn build(
        data_type: DataType,
        byte_offset: u32,
        bit_offset: u8,
        bit_count: u32,
    ) -> MdfResult<Extractor> {
        // Fold whole bytes of bit offset into the byte offset up front.
        let at = byte_offset as usize + (bit_offset / 8) as usize;
        let off = (bit_offset % 8) as u32;
        let bits = bit_count;

        let (signed, big_endian) = match data_type {
            DataType::UnsignedIntegerLe => (false, false),
            DataType::UnsignedIntegerBe => (false, true),
            DataType::SignedIntegerLe => (true, false),
            DataType::SignedIntegerBe => (true, true),
            DataType::FloatLe | DataType::FloatBe => {
                let be = data_type == DataType::FloatBe;
                return match (off, bits) {
                    (0, 32) => Ok(if be {
                        Extractor::F32Be(at)
                    } else {
                        Extractor::F32Le(at)
                    }),
                    (0, 64) => Ok(if be {
                        Extractor::F64Be(at)
                    } else {
                        Extractor::F64Le(at)
                    }),
                    _ => Err(MdfError::UnsupportedFieldLayout {
                        bit_offset: off as u8,
                        bit_count: bits,
                    }),
                };
            }
            other => {
                warn!("data type {other:?} has no numeric decoding; values read as 0");
                return Ok(Extractor::Zero);
            }
        };

        if bits == 0 || bits + off > 64 {
            return Err(MdfError::UnsupportedFieldLayout {
                bit_offset: off as u8,
                bit_count: bits,
            });
        }

        if off == 0 {
            let aligned = match (bits, signed, big_endian) {
                (8, false, _) => Some(Extractor::U8(at)),
                (8, true, _) => Some(Extractor::I8(at)),
                (16, false, false) => Some(Extractor::U16Le(at)),
                (16, false, true) => Some(Extractor::U16Be(at)),
                (16, true, false) => Some(Extractor::I16Le(at)),
                (16, true, true) => Some(Extractor::I16Be(at)),
                (32, false, false) => Some(Extractor::U32Le(at)),
                (32, false, true) => Some(Extractor::U32Be(at)),
                (32, true, false) => Some(Extractor::I32Le(at)),
                (32, true, true) => Some(Extractor::I32Be(at)),
                (64, false, false) => Some(Extractor::U64Le(at)),
                (64, false, true) => Some(Extractor::U64Be(at)),
                (64, true, false) => Some(Extractor::I64Le(at)),
                (64, true, true) => Some(Extractor::I64Be(at)),
                _ => None,
            };
            if let Some(e) = aligned {
                return Ok(e);
            }
        }

        Ok(Extractor::Packed {
            at,
            span: ((bits + off) as usize).div_ceil(8),
            bit_offset: off,
            bits,
            signed,
            big_endian,
        })
    }

    /// First byte past the field; the demultiplexer validates this against
    /// the group's record length.
    pub fn end(&self) -> usize {
        match *self {
            Extractor::U8(at) | Extractor::I8(at) => at + 1,
            Extractor::U16Le(at)
            | Extractor::U16Be(at)
            | Extractor::I16Le(at)
            | Extractor::I16Be(at) => at + 2,
            Extractor::U32Le(at)
            | Extractor::U32Be(at)
            | Extractor::I32Le(at)
            | Extractor::I32Be(at)
            | Extractor::F32Le(at)
            | Extractor::F32Be(at) => at + 4,
            Extractor::U64Le(at)
            | Extractor::U64Be(at)
            | Extractor::I64Le(at)
            | Extractor::I64Be(at)
            | Extractor::F64Le(at)
            | Extractor::F64Be(at) => at + 8,
            Extractor::Packed { at, span, .. } => at + span,
            Extractor::Zero => 0,
        }
    }

    /// Decode one record. A record too short for the field reads as 0; the
    /// demultiplexer rejects wrong-width rows before they get here, so this
    /// only triggers on truncated trailing data.
    pub fn extract(&self, record: &[u8]) -> f64 {
        match *self {
            Extractor::Zero => 0.0,
            Extractor::Packed {
                at,
                span,
                bit_offset,
                bits,
                signed,
                big_endian,
            } => {
                let Some(bytes) = record.get(at..at + span) else {
                    return 0.0;
                };
                extract_packed(bytes, bit_offset, bits, signed, big_endian)
            }
            ref aligned => {
                let end = aligned.end();
                if record.len() < end {
                    return 0.0;
                }
                let b = &record[end - aligned_width(aligned)..end];
                match *aligned {
                    Extractor::U8(_) => b[0] as f64,
                    Extractor::I8(_) => b[0] as i8 as f64,
                    Extractor::U16Le(_) => LE::read_u16(b) as f64,
                    Extractor::U16Be(_) => BE::read_u16(b) as f64,
                    Extractor::I16Le(_) => LE::read_i16(b) as f64,
                    Extractor::I16Be(_) => BE::read_i16(b) as f64,
                    Extractor::U32Le(_) => LE::read_u32(b) as f64,
                    Extractor::U32Be(_) => BE::read_u32(b) as f64,
                    Extractor::I32Le(_) => LE::read_i32(b) as f64,
                    Extractor::I32Be(_) => BE::read_i32(b) as f64,
                    Extractor::U64Le(_) => LE::read_u64(b) as f64,
                    Extractor::U64Be(_) => BE::read_u64(b) as f64,
                    Extractor::I64Le(_) => LE::read_i64(b) as f64,
                    Extractor::I64Be(_) => BE::read_i64(b) as f64,
                    Extractor::F32Le(_) => LE::read_f32(b) as f64,
                    Extractor::F32Be(_) => BE::read_f32(b) as f64,
                    Extractor::F64Le(_) => LE::read_f64(b),
                    Extractor::F64Be(_) => BE::read_f64(b),
                    Extractor::Packed { .. } | Extractor::Zero => unreachable!(),
                }
            }
        }
    }
}

fn aligned_width(e: &Extractor) -> usize {
    match e {
        Extractor::U8(_) | Extractor::I8(_) => 1,
        Extractor::U16Le(_) | Extractor::U16Be(_) | Extractor::I16Le(_) | Extractor::I16Be(_) => 2,
        Extractor::U32Le(_)
        | Extractor::U32Be(_)
        | Extractor::I32Le(_)
        | Extractor::I32Be(_)
        | Extractor::F32Le(_)
        | Extractor::F32Be(_) => 4,
        _ => 8,
    }
}

fn extract_packed(bytes: &[u8], bit_offset: u32, bits: u32, signed: bool, big_endian: bool) -> f64 {
    // Fold the spanned bytes into a u64, least-significant byte first.
    let mut folded = 0u64;
    if big_endian {
        for &b in bytes {
            folded = folded << 8 | b as u64;
        }
    } else {
        for (i, &b) in bytes.iter().enumerate() {
            folded |= (b as u64) << (8 * i);
        }
    }
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let value = (folded >> bit_offset) & mask;
    if signed && bits < 64 && value >> (bits - 1) & 1 == 1 {
        // Two's-complement sign extension.
        (value | !mask) as i64 as f64
    } else if signed {
        value as i64 as f64
    } else {
        value as f64
    }
}

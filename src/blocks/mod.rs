//! Typed structural blocks of the MDF block graph.
//!
//! See <https://www.asam.net/standards/detail/mdf/> for the underlying
//! specification. v3 and v4 have distinct but parallel schemas; the enums in
//! this module are the version-erased vocabulary both share.

use std::fmt;
use std::io::{Read, Seek};
use std::marker::PhantomData;

use crate::{
    io::{BlockReader, RawBlock},
    MdfError, MdfResult,
};

pub mod v3;
pub mod v4;

/// Upper bound on any "next" chain walk. A legitimate file never comes close;
/// a cyclic chain in a corrupt file hits it and fails instead of spinning.
pub const MAX_CHAIN: usize = 1 << 20;

/// A 4-byte v4 block type tag, e.g. `##CN`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockTag(pub [u8; 4]);

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockTag({})", self)
    }
}

/// v4 block type tags.
pub mod tag {
    use super::BlockTag;

    pub const HEADER: BlockTag = BlockTag(*b"##HD");
    pub const DATA_GROUP: BlockTag = BlockTag(*b"##DG");
    pub const CHANNEL_GROUP: BlockTag = BlockTag(*b"##CG");
    pub const CHANNEL: BlockTag = BlockTag(*b"##CN");
    pub const CONVERSION: BlockTag = BlockTag(*b"##CC");
    pub const TEXT: BlockTag = BlockTag(*b"##TX");
    pub const METADATA: BlockTag = BlockTag(*b"##MD");
    pub const DATA_LIST: BlockTag = BlockTag(*b"##DL");
    pub const DATA_TABLE: BlockTag = BlockTag(*b"##DT");
    pub const HEADER_LIST: BlockTag = BlockTag(*b"##HL");
}

/// Channel value storage type, shared by both file versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    UnsignedIntegerLe,
    UnsignedIntegerBe,
    SignedIntegerLe,
    SignedIntegerBe,
    FloatLe,
    FloatBe,
    StringLatin1,
    StringUtf8,
    StringUtf16Le,
    StringUtf16Be,
    ByteArray,
    MimeSample,
    MimeStream,
    CanOpenDate,
    CanOpenTime,
    ComplexLe,
    ComplexBe,
    Unknown(u8),
}

impl DataType {
    /// Decode the v4 `cn_data_type` field.
    pub fn from_v4(value: u8) -> Self {
        match value {
            0 => DataType::UnsignedIntegerLe,
            1 => DataType::UnsignedIntegerBe,
            2 => DataType::SignedIntegerLe,
            3 => DataType::SignedIntegerBe,
            4 => DataType::FloatLe,
            5 => DataType::FloatBe,
            6 => DataType::StringLatin1,
            7 => DataType::StringUtf8,
            8 => DataType::StringUtf16Le,
            9 => DataType::StringUtf16Be,
            10 => DataType::ByteArray,
            11 => DataType::MimeSample,
            12 => DataType::MimeStream,
            13 => DataType::CanOpenDate,
            14 => DataType::CanOpenTime,
            15 => DataType::ComplexLe,
            16 => DataType::ComplexBe,
            other => DataType::Unknown(other),
        }
    }

    pub fn to_v4(self) -> u8 {
        match self {
            DataType::UnsignedIntegerLe => 0,
            DataType::UnsignedIntegerBe => 1,
            DataType::SignedIntegerLe => 2,
            DataType::SignedIntegerBe => 3,
            DataType::FloatLe => 4,
            DataType::FloatBe => 5,
            DataType::StringLatin1 => 6,
            DataType::StringUtf8 => 7,
            DataType::StringUtf16Le => 8,
            DataType::StringUtf16Be => 9,
            DataType::ByteArray => 10,
            DataType::MimeSample => 11,
            DataType::MimeStream => 12,
            DataType::CanOpenDate => 13,
            DataType::CanOpenTime => 14,
            DataType::ComplexLe => 15,
            DataType::ComplexBe => 16,
            DataType::Unknown(v) => v,
        }
    }

    /// Decode the v3 `data_type` field. v3 codes 0-3 use the file's default
    /// byte order; 9-12 force big-endian and 13-16 force little-endian.
    pub fn from_v3(value: u16, file_big_endian: bool) -> Self {
        match (value, file_big_endian) {
            (0, false) => DataType::UnsignedIntegerLe,
            (0, true) => DataType::UnsignedIntegerBe,
            (1, false) => DataType::SignedIntegerLe,
            (1, true) => DataType::SignedIntegerBe,
            (2 | 3, false) => DataType::FloatLe,
            (2 | 3, true) => DataType::FloatBe,
            (7, _) => DataType::StringLatin1,
            (8, _) => DataType::ByteArray,
            (9, _) => DataType::UnsignedIntegerBe,
            (10, _) => DataType::SignedIntegerBe,
            (11 | 12, _) => DataType::FloatBe,
            (13, _) => DataType::UnsignedIntegerLe,
            (14, _) => DataType::SignedIntegerLe,
            (15 | 16, _) => DataType::FloatLe,
            (other, _) => DataType::Unknown(other as u8),
        }
    }
}

/// Role of a channel within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Ordinary fixed-length data channel.
    Data,
    /// Variable-length signal data; the record stores an offset.
    VariableLength,
    /// The group's independent variable, typically time.
    Master,
    VirtualMaster,
    Sync,
    MaxLength,
    VirtualData,
    Unknown(u8),
}

impl ChannelType {
    pub fn from_v4(value: u8) -> Self {
        match value {
            0 => ChannelType::Data,
            1 => ChannelType::VariableLength,
            2 => ChannelType::Master,
            3 => ChannelType::VirtualMaster,
            4 => ChannelType::Sync,
            5 => ChannelType::MaxLength,
            6 => ChannelType::VirtualData,
            other => ChannelType::Unknown(other),
        }
    }

    pub fn to_v4(self) -> u8 {
        match self {
            ChannelType::Data => 0,
            ChannelType::VariableLength => 1,
            ChannelType::Master => 2,
            ChannelType::VirtualMaster => 3,
            ChannelType::Sync => 4,
            ChannelType::MaxLength => 5,
            ChannelType::VirtualData => 6,
            ChannelType::Unknown(v) => v,
        }
    }

    /// v3 only distinguishes data (0) from time (1).
    pub fn from_v3(value: u16) -> Self {
        match value {
            0 => ChannelType::Data,
            1 => ChannelType::Master,
            other => ChannelType::Unknown(other as u8),
        }
    }

    pub fn is_master(self) -> bool {
        matches!(self, ChannelType::Master | ChannelType::VirtualMaster)
    }
}

/// A v4 block that participates in a singly-linked sibling chain.
pub trait ChainBlock: Sized {
    const TAG: BlockTag;

    fn from_raw(raw: &RawBlock) -> MdfResult<Self>;

    /// Link to the next sibling, 0 at the end of the chain.
    fn next_link(&self) -> u64;
}

/// Lazy traversal of a "next"-linked block chain.
///
/// The cursor is stateless with respect to the reader: dropping the iterator
/// and constructing a new one from the same start link restarts the walk.
/// Chains longer than [`MAX_CHAIN`] fail with [`MdfError::ChainTooLong`].
pub struct ChainIter<'a, R, T> {
    reader: &'a mut BlockReader<R>,
    start: u64,
    next: u64,
    seen: usize,
    _marker: PhantomData<T>,
}

impl<'a, R: Read + Seek, T: ChainBlock> ChainIter<'a, R, T> {
    pub fn new(reader: &'a mut BlockReader<R>, start: u64) -> Self {
        Self {
            reader,
            start,
            next: start,
            seen: 0,
            _marker: PhantomData,
        }
    }
}

impl<R: Read + Seek, T: ChainBlock> Iterator for ChainIter<'_, R, T> {
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

        let raw = match self.reader.read_block(self.next, T::TAG) {
            Ok(Some(raw)) => raw,
            // next was non-zero, so a null resolution can't happen; keep the
            // arm anyway so a reader change can't panic us.
            Ok(None) => return None,
            Err(e) => {
                self.next = 0;
                return Some(Err(e));
            }
        };
        match T::from_raw(&raw) {
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

/// Trim the NUL padding MDF uses to terminate embedded strings.
pub(crate) fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v3_data_types_honor_default_byte_order() {
        assert_eq!(DataType::from_v3(0, false), DataType::UnsignedIntegerLe);
        assert_eq!(DataType::from_v3(0, true), DataType::UnsignedIntegerBe);
        assert_eq!(DataType::from_v3(3, true), DataType::FloatBe);
        assert_eq!(DataType::from_v3(13, true), DataType::UnsignedIntegerLe);
    }

    #[test]
    fn master_detection() {
        assert!(ChannelType::Master.is_master());
        assert!(ChannelType::VirtualMaster.is_master());
        assert!(!ChannelType::Data.is_master());
        assert!(!ChannelType::Unknown(9).is_master());
    }

    #[test]
    fn trim_nul_stops_at_first_terminator() {
        assert_eq!(trim_nul(b"temp\0\0garbage"), "temp");
        assert_eq!(trim_nul(b"no-terminator"), "no-terminator");
    }
}

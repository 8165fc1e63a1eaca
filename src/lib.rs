//! Read and write MDF (ASAM Measurement Data Format) files.
//!
//! Supports reading MDF v3 (versions 300-399) and v4 (versions 400-499)
//! measurement files and writing v4 files.
//!
//! An MDF file is a graph of linked blocks: a header block points at a chain
//! of data groups, each data group at a chain of channel groups, each channel
//! group at a chain of channels. The sample data itself is a stream of
//! fixed-size records, interleaved across channel groups and tagged with a
//! small record ID. Reading a signal means walking the block graph, building
//! a bit-level extractor and a value conversion for its channel, then
//! demultiplexing the record stream into per-channel sequences.
//!
//! For one-shot access, see [`read::MdfFile`]. For incremental decoding off
//! the caller's thread, see [`session::Session`]. For producing files, see
//! [`write::FileWriter`].

pub mod blocks;
pub mod conversion;
pub mod demux;
pub mod extract;
pub mod formula;
pub mod io;
pub mod read;
pub mod sequence;
pub mod session;
pub mod write;

use thiserror::Error;

/// Magic bytes opening the 64-byte identification header of a finalized file.
pub const MAGIC: &[u8; 8] = b"MDF     ";

/// Magic left behind by loggers that crashed before finalizing the file.
/// Such files are readable, but totals declared in the header may be wrong.
pub const UNFINALIZED_MAGIC: &[u8; 8] = b"UnFinMF ";

/// Absolute offset of the root header block; the identification header
/// occupies the 64 bytes before it.
pub const HEADER_OFFSET: u64 = 64;

#[derive(Debug, Error)]
pub enum MdfError {
    #[error("MDF magic bytes not found")]
    BadMagic,

    #[error("unsupported MDF version {0}")]
    UnsupportedVersion(u16),

    #[error("expected a {expected} block at offset {offset}, found {found}")]
    BadBlockTag {
        expected: String,
        found: String,
        offset: u64,
    },

    #[error("block at offset {offset} declares impossible length {length}")]
    BadBlockLength { offset: u64, length: u64 },

    #[error("block chain starting at offset {start} exceeds {limit} links, assuming a cycle")]
    ChainTooLong { start: u64, limit: usize },

    #[error("float channel declares bit offset {bit_offset}, width {bit_count}")]
    UnsupportedFieldLayout { bit_offset: u8, bit_count: u32 },

    #[error("record ID {0} matches no channel group")]
    UnknownRecordId(u64),

    #[error("channel group with record ID {0} has no master channel")]
    NoMasterChannel(u64),

    #[error("conversion cannot be evaluated: {0}")]
    UnsupportedConversion(String),

    #[error("formula error: {0}")]
    BadFormula(String),

    #[error("no signal with ID {0}")]
    UnknownSignal(u32),

    #[error("sample row has {got} values, channel group declares {expected}")]
    BadRowWidth { got: usize, expected: usize },

    #[error(transparent)]
    Parse(#[from] binrw::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type MdfResult<T> = Result<T, MdfError>;

/// What this crate registers with a host application's file-type table.
#[derive(Debug, Clone, Copy)]
pub struct FileTypeInfo {
    pub description: &'static str,
    pub extensions: &'static [&'static str],
    /// MIME type and the extension files of that type should be saved with.
    pub mime_types: &'static [(&'static str, &'static str)],
}

/// Registration entry for `.mf4`/`.mdf` measurement files.
pub const FILE_TYPE: FileTypeInfo = FileTypeInfo {
    description: "ASAM MDF measurement",
    extensions: &["mf4", "mdf"],
    mime_types: &[("application/x-mdf", "mf4")],
};

pub use conversion::{Converted, ConversionSpec, Converter};
pub use demux::{Demultiplexer, RecordSchema};
pub use extract::Extractor;
pub use read::{MdfFile, SignalInfo};
pub use sequence::{SampleSequence, SequenceReader, SequenceWriter};
pub use session::{Request, Response, Session};
pub use write::FileWriter;

//! Buffered block-level I/O over an MDF file.
//!
//! MDF files are routinely multiple GB, so nothing here slurps the whole
//! file: every access is a range read keyed by absolute offset, served
//! through a [`BufReader`]. The only structure this layer understands is the
//! block envelope - a type tag, a declared length, and (for v4) a link
//! array. Typed decoding lives in [`crate::blocks`].

use std::io::{prelude::*, BufReader, SeekFrom};

use byteorder::{ByteOrder, LE};
use log::warn;

use crate::{
    blocks::{BlockTag, MAX_CHAIN},
    MdfError, MdfResult, MAGIC, UNFINALIZED_MAGIC,
};

/// The 64-byte identification header at the start of every MDF file.
#[derive(Debug, Clone)]
pub struct IdHeader {
    /// Program identifier of the writing tool, NUL-trimmed.
    pub program: String,
    /// Version number, e.g. 330 or 410.
    pub version: u16,
    /// v3 only; v4 files are little-endian by definition.
    pub big_endian: bool,
    /// True when the file carries the crash-recovery magic.
    pub unfinalized: bool,
}

impl IdHeader {
    pub fn is_v4(&self) -> bool {
        self.version >= 400
    }
}

/// A v4 block envelope: tag, raw link array, and payload.
///
/// This is the only shape the raw reader understands; every typed block is
/// decoded from one of these by [`crate::blocks::v4`].
#[derive(Debug, Clone)]
pub struct RawBlock {
    /// Absolute file offset this block was read from.
    pub offset: u64,
    pub tag: BlockTag,
    /// Outgoing links in declaration order; 0 means "absent".
    pub links: Vec<u64>,
    /// Everything after the header and link array.
    pub data: Vec<u8>,
}

impl RawBlock {
    /// Link at position `i`, or 0 if the block declares fewer links.
    /// Older writers legitimately emit short link arrays.
    pub fn link(&self, i: usize) -> u64 {
        self.links.get(i).copied().unwrap_or(0)
    }
}

/// Envelope metadata without the payload, for blocks whose payload is
/// streamed rather than decoded (DT sample tables, mostly).
#[derive(Debug, Clone)]
pub struct RawBlockPrefix {
    pub offset: u64,
    pub tag: BlockTag,
    pub links: Vec<u64>,
    /// Absolute offset of the first payload byte.
    pub payload_offset: u64,
    pub payload_len: u64,
}

/// A v3 block: 2-byte tag, u16 declared size, then fields (links included -
/// v3 links are plain u32 fields inside the payload, not a separate array).
#[derive(Debug, Clone)]
pub struct RawBlockV3 {
    pub offset: u64,
    pub tag: [u8; 2],
    pub data: Vec<u8>,
}

const V4_HEADER_LEN: u64 = 24;
const V3_HEADER_LEN: u64 = 4;

/// Metadata blocks are small and sample data streams in bounded chunks; a
/// single read past this means a corrupt length field, not a real block.
const MAX_READ: usize = 64 * 1024 * 1024;

pub struct BlockReader<R> {
    inner: BufReader<R>,
    /// Position the underlying stream is known to be at, to skip no-op seeks.
    pos: u64,
}

impl<R: Read + Seek> BlockReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            pos: u64::MAX,
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> MdfResult<()> {
        if self.pos != offset {
            self.inner.seek(SeekFrom::Start(offset))?;
        }
        self.inner.read_exact(buf)?;
        self.pos = offset + buf.len() as u64;
        Ok(())
    }

    /// Raw byte range at an absolute offset. Used by the data streamer.
    pub fn read_range(&mut self, offset: u64, len: usize) -> MdfResult<Vec<u8>> {
        if len > MAX_READ {
            return Err(MdfError::BadBlockLength {
                offset,
                length: len as u64,
            });
        }
        let mut buf = vec![0; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Parse the 64-byte identification header and validate magic + version.
    pub fn read_id_header(&mut self) -> MdfResult<IdHeader> {
        let mut buf = [0u8; 64];
        self.read_at(0, &mut buf)?;

        let unfinalized = match &buf[0..8] {
            m if m == MAGIC => false,
            m if m == UNFINALIZED_MAGIC => true,
            _ => return Err(MdfError::BadMagic),
        };
        if unfinalized {
            warn!("file is unfinalized; declared record counts may be wrong");
        }

        let version = LE::read_u16(&buf[28..30]);
        if !(300..=499).contains(&version) {
            return Err(MdfError::UnsupportedVersion(version));
        }

        let program = String::from_utf8_lossy(&buf[16..24])
            .trim_end_matches(['\0', ' '])
            .to_string();
        // The byte-order flag is only meaningful for v3; v4 reserves it.
        let big_endian = version < 400 && LE::read_u16(&buf[24..26]) != 0;

        Ok(IdHeader {
            program,
            version,
            big_endian,
            unfinalized,
        })
    }

    fn read_v4_header(&mut self, offset: u64) -> MdfResult<(BlockTag, u64, u64)> {
        let mut head = [0u8; 24];
        self.read_at(offset, &mut head)?;
        let tag = BlockTag([head[0], head[1], head[2], head[3]]);
        let length = LE::read_u64(&head[8..16]);
        let link_count = LE::read_u64(&head[16..24]);
        if length < V4_HEADER_LEN + 8 * link_count {
            return Err(MdfError::BadBlockLength { offset, length });
        }
        Ok((tag, length, link_count))
    }

    fn read_links(&mut self, offset: u64, link_count: u64) -> MdfResult<Vec<u64>> {
        // A link count beyond the chain guard means a corrupt header; don't
        // let it size an allocation.
        if link_count > MAX_CHAIN as u64 {
            return Err(MdfError::BadBlockLength {
                offset,
                length: link_count,
            });
        }
        let raw = self.read_range(offset + V4_HEADER_LEN, link_count as usize * 8)?;
        Ok(raw.chunks_exact(8).map(LE::read_u64).collect())
    }

    /// Resolve a v4 link into a whole block, validating its type tag.
    ///
    /// A zero link is "absent" and yields `Ok(None)`; callers must check.
    pub fn read_block(&mut self, link: u64, expected: BlockTag) -> MdfResult<Option<RawBlock>> {
        if link == 0 {
            return Ok(None);
        }
        let (tag, length, link_count) = self.read_v4_header(link)?;
        if tag != expected {
            return Err(MdfError::BadBlockTag {
                expected: expected.to_string(),
                found: tag.to_string(),
                offset: link,
            });
        }
        let links = self.read_links(link, link_count)?;
        let payload_len = length - V4_HEADER_LEN - 8 * link_count;
        let data = self.read_range(link + V4_HEADER_LEN + 8 * link_count, payload_len as usize)?;
        Ok(Some(RawBlock {
            offset: link,
            tag,
            links,
            data,
        }))
    }

    /// Like [`Self::read_block`], but leaves the payload on disk. The tag is
    /// returned rather than validated because data links may resolve to any
    /// of several block kinds (DT, DL, HL).
    pub fn read_block_prefix(&mut self, link: u64) -> MdfResult<Option<RawBlockPrefix>> {
        if link == 0 {
            return Ok(None);
        }
        let (tag, length, link_count) = self.read_v4_header(link)?;
        let links = self.read_links(link, link_count)?;
        let payload_offset = link + V4_HEADER_LEN + 8 * link_count;
        Ok(Some(RawBlockPrefix {
            offset: link,
            tag,
            links,
            payload_offset,
            payload_len: length - V4_HEADER_LEN - 8 * link_count,
        }))
    }

    /// Resolve a v3 link. v3 headers are a 2-byte tag plus a u16 size; a few
    /// block types declare an unreliable size, for which the caller supplies
    /// `fallback_len` (total block length including the 4-byte header).
    pub fn read_block_v3(
        &mut self,
        link: u64,
        expected: [u8; 2],
        fallback_len: Option<usize>,
    ) -> MdfResult<Option<RawBlockV3>> {
        if link == 0 {
            return Ok(None);
        }
        let mut head = [0u8; 4];
        self.read_at(link, &mut head)?;
        let tag = [head[0], head[1]];
        if tag != expected {
            return Err(MdfError::BadBlockTag {
                expected: String::from_utf8_lossy(&expected).into_owned(),
                found: String::from_utf8_lossy(&tag).into_owned(),
                offset: link,
            });
        }
        // The size field is always little-endian, even in big-endian files.
        let declared = LE::read_u16(&head[2..4]) as usize;
        let total = match declared {
            0 => fallback_len.ok_or(MdfError::BadBlockLength {
                offset: link,
                length: 0,
            })?,
            n => n,
        };
        if total < V3_HEADER_LEN as usize {
            return Err(MdfError::BadBlockLength {
                offset: link,
                length: total as u64,
            });
        }
        let data = self.read_range(link + V3_HEADER_LEN, total - V3_HEADER_LEN as usize)?;
        Ok(Some(RawBlockV3 {
            offset: link,
            tag,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn id_header(magic: &[u8; 8], version: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        buf[0..8].copy_from_slice(magic);
        LE::write_u16(&mut buf[28..30], version);
        buf
    }

    #[test]
    fn rejects_bad_magic() {
        let mut r = BlockReader::new(Cursor::new(id_header(b"NotAnMDF", 410)));
        assert!(matches!(r.read_id_header(), Err(MdfError::BadMagic)));
    }

    #[test]
    fn rejects_out_of_range_version() {
        let mut r = BlockReader::new(Cursor::new(id_header(MAGIC, 500)));
        assert!(matches!(
            r.read_id_header(),
            Err(MdfError::UnsupportedVersion(500))
        ));
    }

    #[test]
    fn accepts_unfinalized_magic() {
        let mut r = BlockReader::new(Cursor::new(id_header(UNFINALIZED_MAGIC, 400)));
        let id = r.read_id_header().unwrap();
        assert!(id.unfinalized);
        assert!(id.is_v4());
    }

    #[test]
    fn null_link_reads_as_none() {
        let mut r = BlockReader::new(Cursor::new(vec![0u8; 64]));
        assert!(r.read_block(0, BlockTag(*b"##TX")).unwrap().is_none());
    }

    #[test]
    fn tag_mismatch_is_an_error() {
        let mut file = vec![0u8; 64];
        file.extend_from_slice(b"##DG");
        file.extend_from_slice(&[0; 4]);
        file.extend_from_slice(&24u64.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        let mut r = BlockReader::new(Cursor::new(file));
        assert!(matches!(
            r.read_block(64, BlockTag(*b"##TX")),
            Err(MdfError::BadBlockTag { .. })
        ));
    }

    #[test]
    fn absurd_block_lengths_do_not_allocate() {
        // A ##TX header claiming a near-u64::MAX length must fail on the
        // length check, not by sizing a buffer from the corrupt field.
        let mut file = vec![0u8; 64];
        file.extend_from_slice(b"##TX");
        file.extend_from_slice(&[0; 4]);
        file.extend_from_slice(&(u64::MAX - 7).to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        let mut r = BlockReader::new(Cursor::new(file));
        assert!(matches!(
            r.read_block(64, BlockTag(*b"##TX")),
            Err(MdfError::BadBlockLength { .. })
        ));
    }

    #[test]
    fn reads_links_and_payload() {
        let mut file = vec![0u8; 64];
        file.extend_from_slice(b"##CN");
        file.extend_from_slice(&[0; 4]);
        file.extend_from_slice(&(24u64 + 16 + 4).to_le_bytes());
        file.extend_from_slice(&2u64.to_le_bytes());
        file.extend_from_slice(&123u64.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());
        file.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let mut r = BlockReader::new(Cursor::new(file));
        let b = r.read_block(64, BlockTag(*b"##CN")).unwrap().unwrap();
        assert_eq!(b.links, vec![123, 0]);
        assert_eq!(b.link(5), 0);
        assert_eq!(b.data, [0xde, 0xad, 0xbe, 0xef]);
    }
}

//! MDF v4 structural blocks.
//!
//! Each block is a plain struct of scalar fields plus the outgoing links it
//! picked out of the raw link array. Payloads are fixed-layout and
//! little-endian throughout, so they are described once as `binrw` structs
//! and decoded from the [`RawBlock`] payload; the same structs serialize the
//! write path (see [`crate::write`]).

use std::io::{Cursor, Read, Seek};

use binrw::{BinRead, BinReaderExt, BinWrite};
use log::debug;

use super::{tag, trim_nul, BlockTag, ChainBlock, ChannelType, DataType};
use crate::{
    io::{BlockReader, RawBlock},
    MdfResult,
};

#[derive(Debug, Clone, Default, BinRead, BinWrite)]
#[brw(little)]
pub struct HeaderPayload {
    pub start_time_ns: u64,
    pub tz_offset_min: i16,
    pub dst_offset_min: i16,
    pub time_flags: u8,
    pub time_class: u8,
    pub flags: u8,
    pub reserved: u8,
    pub start_angle_rad: f64,
    pub start_distance_m: f64,
}

/// The root `##HD` block at offset 64.
#[derive(Debug, Clone)]
pub struct HeaderBlock {
    pub first_data_group: u64,
    pub first_file_history: u64,
    pub comment_link: u64,
    pub payload: HeaderPayload,
}

impl HeaderBlock {
    pub fn from_raw(raw: &RawBlock) -> MdfResult<Self> {
        Ok(Self {
            first_data_group: raw.link(0),
            first_file_history: raw.link(1),
            comment_link: raw.link(5),
            payload: Cursor::new(&raw.data).read_le()?,
        })
    }
}

#[derive(Debug, Clone, Default, BinRead, BinWrite)]
#[brw(little)]
pub struct DataGroupPayload {
    pub record_id_size: u8,
    pub reserved: [u8; 7],
}

/// `##DG`: one record stream plus the channel groups multiplexed into it.
#[derive(Debug, Clone)]
pub struct DataGroupBlock {
    pub next: u64,
    pub first_channel_group: u64,
    pub data: u64,
    pub comment_link: u64,
    /// Bytes of record-ID prefix on every record: 0, 1, 2, 4 or 8.
    pub record_id_size: u8,
}

impl ChainBlock for DataGroupBlock {
    const TAG: BlockTag = tag::DATA_GROUP;

    fn from_raw(raw: &RawBlock) -> MdfResult<Self> {
        let payload: DataGroupPayload = Cursor::new(&raw.data).read_le()?;
        Ok(Self {
            next: raw.link(0),
            first_channel_group: raw.link(1),
            data: raw.link(2),
            comment_link: raw.link(3),
            record_id_size: payload.record_id_size,
        })
    }

    fn next_link(&self) -> u64 {
        self.next
    }
}

#[derive(Debug, Clone, Default, BinRead, BinWrite)]
#[brw(little)]
pub struct ChannelGroupPayload {
    pub record_id: u64,
    pub cycle_count: u64,
    pub flags: u16,
    pub path_separator: u16,
    pub reserved: u32,
    pub data_bytes: u32,
    pub inval_bytes: u32,
}

/// `##CG`: the set of channels sharing one record layout and record ID.
#[derive(Debug, Clone)]
pub struct ChannelGroupBlock {
    pub next: u64,
    pub first_channel: u64,
    pub acq_name_link: u64,
    pub comment_link: u64,
    pub record_id: u64,
    /// Rows this group declares; may undercount in unfinalized files.
    pub cycle_count: u64,
    pub flags: u16,
    pub data_bytes: u32,
    pub inval_bytes: u32,
}

impl ChannelGroupBlock {
    /// Full per-record byte length, invalidation bytes included, record-ID
    /// prefix excluded.
    pub fn record_len(&self) -> usize {
        self.data_bytes as usize + self.inval_bytes as usize
    }
}

impl ChainBlock for ChannelGroupBlock {
    const TAG: BlockTag = tag::CHANNEL_GROUP;

    fn from_raw(raw: &RawBlock) -> MdfResult<Self> {
        let payload: ChannelGroupPayload = Cursor::new(&raw.data).read_le()?;
        Ok(Self {
            next: raw.link(0),
            first_channel: raw.link(1),
            acq_name_link: raw.link(2),
            comment_link: raw.link(5),
            record_id: payload.record_id,
            cycle_count: payload.cycle_count,
            flags: payload.flags,
            data_bytes: payload.data_bytes,
            inval_bytes: payload.inval_bytes,
        })
    }

    fn next_link(&self) -> u64 {
        self.next
    }
}

#[derive(Debug, Clone, Default, BinRead, BinWrite)]
#[brw(little)]
pub struct ChannelPayload {
    pub channel_type: u8,
    pub sync_type: u8,
    pub data_type: u8,
    pub bit_offset: u8,
    pub byte_offset: u32,
    pub bit_count: u32,
    pub flags: u32,
    pub inval_bit_pos: u32,
    pub precision: u8,
    pub reserved: u8,
    pub attachment_count: u16,
    pub val_range_min: f64,
    pub val_range_max: f64,
    pub limit_min: f64,
    pub limit_max: f64,
    pub limit_ext_min: f64,
    pub limit_ext_max: f64,
}

/// `##CN`: one named signal and its bit-level position within the record.
#[derive(Debug, Clone)]
pub struct ChannelBlock {
    pub next: u64,
    pub composition: u64,
    pub name_link: u64,
    pub conversion: u64,
    pub data: u64,
    pub unit_link: u64,
    pub comment_link: u64,
    pub channel_type: ChannelType,
    pub data_type: DataType,
    pub bit_offset: u8,
    pub byte_offset: u32,
    pub bit_count: u32,
    pub flags: u32,
    pub inval_bit_pos: u32,
}

impl ChainBlock for ChannelBlock {
    const TAG: BlockTag = tag::CHANNEL;

    fn from_raw(raw: &RawBlock) -> MdfResult<Self> {
        let payload: ChannelPayload = Cursor::new(&raw.data).read_le()?;
        Ok(Self {
            next: raw.link(0),
            composition: raw.link(1),
            name_link: raw.link(2),
            conversion: raw.link(4),
            data: raw.link(5),
            unit_link: raw.link(6),
            comment_link: raw.link(7),
            channel_type: ChannelType::from_v4(payload.channel_type),
            data_type: DataType::from_v4(payload.data_type),
            bit_offset: payload.bit_offset,
            byte_offset: payload.byte_offset,
            bit_count: payload.bit_count,
            flags: payload.flags,
            inval_bit_pos: payload.inval_bit_pos,
        })
    }

    fn next_link(&self) -> u64 {
        self.next
    }
}

#[derive(Debug, Clone, Default, BinRead, BinWrite)]
#[brw(little)]
pub struct ConversionFixedPayload {
    pub cc_type: u8,
    pub precision: u8,
    pub flags: u16,
    pub ref_count: u16,
    pub val_count: u16,
    pub phy_min: f64,
    pub phy_max: f64,
}

/// `##CC`: raw-to-physical conversion rule. The meaning of `vals` and `refs`
/// depends on `cc_type`; see [`crate::conversion`] for the pairing rules.
#[derive(Debug, Clone)]
pub struct ConversionBlock {
    pub name_link: u64,
    pub unit_link: u64,
    pub comment_link: u64,
    pub inverse: u64,
    /// Links to nested `##CC` or `##TX` blocks, kind-dependent.
    pub refs: Vec<u64>,
    pub cc_type: u8,
    pub flags: u16,
    pub vals: Vec<f64>,
}

impl ConversionBlock {
    pub fn from_raw(raw: &RawBlock) -> MdfResult<Self> {
        let mut cursor = Cursor::new(&raw.data);
        let fixed: ConversionFixedPayload = cursor.read_le()?;
        let mut vals = Vec::with_capacity(fixed.val_count as usize);
        for _ in 0..fixed.val_count {
            vals.push(f64::read_le(&mut cursor)?);
        }
        let refs = (0..fixed.ref_count as usize)
            .map(|i| raw.link(4 + i))
            .collect();
        Ok(Self {
            name_link: raw.link(0),
            unit_link: raw.link(1),
            comment_link: raw.link(2),
            inverse: raw.link(3),
            refs,
            cc_type: fixed.cc_type,
            flags: fixed.flags,
            vals,
        })
    }
}

/// `##DL`: chain node fanning out to several data blocks.
#[derive(Debug, Clone)]
pub struct DataListBlock {
    pub next: u64,
    pub data_links: Vec<u64>,
    pub flags: u8,
}

impl DataListBlock {
    pub fn from_raw(raw: &RawBlock) -> MdfResult<Self> {
        let mut cursor = Cursor::new(&raw.data);
        let flags = u8::read_le(&mut cursor)?;
        <[u8; 3]>::read_le(&mut cursor)?;
        let count = u32::read_le(&mut cursor)?;
        let data_links = (0..count as usize).map(|i| raw.link(1 + i)).collect();
        Ok(Self {
            next: raw.link(0),
            data_links,
            flags,
        })
    }
}

impl ChainBlock for DataListBlock {
    const TAG: BlockTag = tag::DATA_LIST;

    fn from_raw(raw: &RawBlock) -> MdfResult<Self> {
        DataListBlock::from_raw(raw)
    }

    fn next_link(&self) -> u64 {
        self.next
    }
}

/// Resolve a link to a `##TX` or `##MD` block into its string contents.
/// Metadata blocks hold XML; callers that want a plain name get the whole
/// document and may extract from it. Returns `None` for a null link or an
/// unexpected block kind.
pub fn read_text<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    link: u64,
) -> MdfResult<Option<String>> {
    let Some(prefix) = reader.read_block_prefix(link)? else {
        return Ok(None);
    };
    match prefix.tag {
        tag::TEXT | tag::METADATA => {
            let data = reader.read_range(prefix.payload_offset, prefix.payload_len as usize)?;
            Ok(Some(trim_nul(&data)))
        }
        other => {
            debug!("expected text at offset {link}, found {other}; skipping");
            Ok(None)
        }
    }
}

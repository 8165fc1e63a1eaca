//! Writing MDF v4 files.
//!
//! The writer builds the whole block graph in memory as reference-counted
//! nodes, then emits it in two passes: a layout pass walks the node list and
//! assigns each block an 8-byte-aligned file offset keyed by node identity,
//! and an emit pass serializes every block with its links resolved through
//! that table. Sharing a node (the same unit text on fifty channels, say)
//! therefore costs one block on disk, and link values are correct no matter
//! where the layout pass placed anything.
//!
//! Sample data is split into `##DT` blocks of at most 64 KiB, chained behind
//! a `##DL` when one block is not enough. Records are fixed-layout: every
//! channel is stored as a little-endian f64, raw (unconverted) values.

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use binrw::BinWrite;
use byteorder::{WriteBytesExt, LE};
use log::debug;

use crate::{
    blocks::{tag, BlockTag},
    blocks::v4::{
        ChannelGroupPayload, ChannelPayload, ConversionFixedPayload, DataGroupPayload,
        HeaderPayload,
    },
    conversion::{CcRef, ConversionSpec},
    MdfError, MdfResult, HEADER_OFFSET, MAGIC,
};

/// Largest `##DT` block emitted, envelope included.
const MAX_DT_BLOCK: usize = 64 * 1024;
const ENVELOPE_LEN: usize = 24;

const BYTES_PER_VALUE: usize = 8;

/// Definition of one channel in a group being written.
#[derive(Debug, Clone)]
pub struct ChannelDef {
    pub name: String,
    pub unit: String,
    pub description: String,
    pub is_master: bool,
    /// Raw-to-physical conversion recorded for readers; samples themselves
    /// are written raw.
    pub conversion: Option<ConversionSpec>,
}

impl ChannelDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: String::new(),
            description: String::new(),
            is_master: false,
            conversion: None,
        }
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn master(mut self) -> Self {
        self.is_master = true;
        self
    }

    pub fn conversion(mut self, spec: ConversionSpec) -> Self {
        self.conversion = Some(spec);
        self
    }
}

struct GroupData {
    channels: Vec<ChannelDef>,
    rows: u64,
    /// Flattened little-endian f64 record bytes.
    data: Vec<u8>,
}

impl GroupData {
    fn record_len(&self) -> usize {
        self.channels.len() * BYTES_PER_VALUE
    }
}

/// Streaming-free v4 file writer: define groups, append rows, finish.
pub struct FileWriter<W> {
    writer: W,
    program: String,
    start_time_ns: u64,
    groups: Vec<GroupData>,
}

impl<W: Write> FileWriter<W> {
    pub fn new(writer: W) -> Self {
        let start_time_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            writer,
            program: "mdfio".into(),
            start_time_ns,
            groups: Vec::new(),
        }
    }

    /// Program identifier stamped into the identification header; at most 8
    /// bytes survive.
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn start_time_ns(mut self, ns: u64) -> Self {
        self.start_time_ns = ns;
        self
    }

    /// Add a channel group; returns its handle for [`Self::append_row`].
    pub fn add_group(&mut self, channels: Vec<ChannelDef>) -> usize {
        self.groups.push(GroupData {
            channels,
            rows: 0,
            data: Vec::new(),
        });
        self.groups.len() - 1
    }

    /// Append one record: one value per channel, in definition order.
    pub fn append_row(&mut self, group: usize, values: &[f64]) -> MdfResult<()> {
        let g = self
            .groups
            .get_mut(group)
            .ok_or(MdfError::UnknownSignal(group as u32))?;
        if values.len() != g.channels.len() {
            return Err(MdfError::BadRowWidth {
                got: values.len(),
                expected: g.channels.len(),
            });
        }
        g.data.reserve(values.len() * BYTES_PER_VALUE);
        for v in values {
            g.data.extend_from_slice(&v.to_le_bytes());
        }
        g.rows += 1;
        Ok(())
    }

    /// Serialize everything and return the underlying writer.
    pub fn finish(mut self) -> MdfResult<W> {
        let mut graph = Graph::default();

        // Data groups chain through their `next` link, so build back to front.
        let mut first_dg = None;
        for group in self.groups.iter().rev() {
            let cg = graph.channel_group(group)?;
            let data = graph.data_blocks(group);
            let mut payload = Vec::new();
            DataGroupPayload::default().write(&mut Cursor::new(&mut payload))?;
            first_dg = Some(graph.push(
                tag::DATA_GROUP,
                vec![first_dg, Some(cg), data, None],
                payload,
            ));
        }

        let mut payload = Vec::new();
        HeaderPayload {
            start_time_ns: self.start_time_ns,
            ..Default::default()
        }
        .write(&mut Cursor::new(&mut payload))?;
        let hd = graph.push(
            tag::HEADER,
            vec![first_dg, None, None, None, None, None],
            payload,
        );

        // Emission order: HD first (it must land at offset 64), then
        // everything else in creation order.
        let mut order = vec![hd];
        order.extend(
            graph
                .blocks
                .iter()
                .filter(|b| b.tag != tag::HEADER)
                .cloned(),
        );

        // Layout pass: assign aligned offsets by node identity.
        let mut offsets: HashMap<*const BlockNode, u64> = HashMap::new();
        let mut at = HEADER_OFFSET;
        for block in &order {
            offsets.insert(Arc::as_ptr(block), at);
            at = (at + block.len() + 7) & !7;
        }
        debug!("writing {} blocks, {} bytes", order.len(), at);

        // Emit pass.
        self.write_id_header()?;
        let mut written = HEADER_OFFSET;
        for block in &order {
            block.emit(&mut self.writer, &offsets)?;
            written += block.len();
            let aligned = (written + 7) & !7;
            for _ in written..aligned {
                self.writer.write_u8(0)?;
            }
            written = aligned;
        }
        self.writer.flush()?;
        Ok(self.writer)
    }

    fn write_id_header(&mut self) -> MdfResult<()> {
        let mut buf = [0u8; 64];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..16].copy_from_slice(b"4.10    ");
        let prog = self.program.as_bytes();
        let n = prog.len().min(8);
        buf[16..16 + n].copy_from_slice(&prog[..n]);
        buf[28..30].copy_from_slice(&410u16.to_le_bytes());
        self.writer.write_all(&buf)?;
        Ok(())
    }
}

/// One block of the in-memory graph. Links point at other nodes; their file
/// offsets exist only in the layout table.
struct BlockNode {
    tag: BlockTag,
    links: Vec<Option<Arc<BlockNode>>>,
    payload: Vec<u8>,
}

impl BlockNode {
    fn len(&self) -> u64 {
        (ENVELOPE_LEN + self.links.len() * 8 + self.payload.len()) as u64
    }

    fn emit<W: Write>(
        &self,
        w: &mut W,
        offsets: &HashMap<*const BlockNode, u64>,
    ) -> MdfResult<()> {
        w.write_all(&self.tag.0)?;
        w.write_u32::<LE>(0)?;
        w.write_u64::<LE>(self.len())?;
        w.write_u64::<LE>(self.links.len() as u64)?;
        for link in &self.links {
            let target = link
                .as_ref()
                .and_then(|n| offsets.get(&Arc::as_ptr(n)).copied())
                .unwrap_or(0);
            w.write_u64::<LE>(target)?;
        }
        w.write_all(&self.payload)?;
        Ok(())
    }
}

#[derive(Default)]
struct Graph {
    blocks: Vec<Arc<BlockNode>>,
    /// Text blocks deduplicated by content.
    texts: HashMap<String, Arc<BlockNode>>,
}

impl Graph {
    fn push(
        &mut self,
        tag: BlockTag,
        links: Vec<Option<Arc<BlockNode>>>,
        payload: Vec<u8>,
    ) -> Arc<BlockNode> {
        let node = Arc::new(BlockNode {
            tag,
            links,
            payload,
        });
        self.blocks.push(Arc::clone(&node));
        node
    }

    /// A `##TX` node for `text`, shared across all users of the same string.
    fn text(&mut self, text: &str) -> Option<Arc<BlockNode>> {
        if text.is_empty() {
            return None;
        }
        if let Some(node) = self.texts.get(text) {
            return Some(Arc::clone(node));
        }
        let mut payload = text.as_bytes().to_vec();
        payload.push(0);
        let node = self.push(tag::TEXT, Vec::new(), payload);
        self.texts.insert(text.to_string(), Arc::clone(&node));
        Some(node)
    }

    fn conversion(&mut self, spec: &ConversionSpec) -> MdfResult<Arc<BlockNode>> {
        let layout = spec.to_layout()?;
        let mut links = vec![None, None, None, None];
        for r in &layout.refs {
            links.push(match r {
                CcRef::None => None,
                CcRef::Text(text) => self.text(text),
                CcRef::Nested(nested) => Some(self.conversion(nested)?),
            });
        }
        let mut payload = Vec::new();
        ConversionFixedPayload {
            cc_type: layout.cc_type,
            ref_count: (links.len() - 4) as u16,
            val_count: layout.vals.len() as u16,
            ..Default::default()
        }
        .write(&mut Cursor::new(&mut payload))?;
        for v in &layout.vals {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        Ok(self.push(tag::CONVERSION, links, payload))
    }

    fn channel_group(&mut self, group: &GroupData) -> MdfResult<Arc<BlockNode>> {
        // Channels chain through `next`, so build back to front.
        let mut first_cn = None;
        for (i, ch) in group.channels.iter().enumerate().rev() {
            let name = self.text(&ch.name);
            let unit = self.text(&ch.unit);
            let comment = self.text(&ch.description);
            let conversion = match &ch.conversion {
                Some(spec) => Some(self.conversion(spec)?),
                None => None,
            };
            let mut payload = Vec::new();
            ChannelPayload {
                channel_type: if ch.is_master { 2 } else { 0 },
                sync_type: if ch.is_master { 1 } else { 0 },
                data_type: 4, // f64, little-endian
                byte_offset: (i * BYTES_PER_VALUE) as u32,
                bit_count: 64,
                ..Default::default()
            }
            .write(&mut Cursor::new(&mut payload))?;
            first_cn = Some(self.push(
                tag::CHANNEL,
                vec![first_cn, None, name, None, conversion, None, unit, comment],
                payload,
            ));
        }

        let mut payload = Vec::new();
        ChannelGroupPayload {
            cycle_count: group.rows,
            data_bytes: group.record_len() as u32,
            ..Default::default()
        }
        .write(&mut Cursor::new(&mut payload))?;
        Ok(self.push(
            tag::CHANNEL_GROUP,
            vec![None, first_cn, None, None, None, None],
            payload,
        ))
    }

    /// The data side of one group: a single `##DT`, or a `##DL` fanning out
    /// to several when the records exceed one block.
    fn data_blocks(&mut self, group: &GroupData) -> Option<Arc<BlockNode>> {
        if group.data.is_empty() {
            return None;
        }
        let record_len = group.record_len();
        let rows_per_block = ((MAX_DT_BLOCK - ENVELOPE_LEN) / record_len).max(1);
        let bytes_per_block = rows_per_block * record_len;

        let tables: Vec<Arc<BlockNode>> = group
            .data
            .chunks(bytes_per_block)
            .map(|chunk| self.push(tag::DATA_TABLE, Vec::new(), chunk.to_vec()))
            .collect();
        if tables.len() == 1 {
            return Some(Arc::clone(&tables[0]));
        }

        let mut payload = Vec::new();
        payload.push(0u8); // flags: explicit offsets
        payload.extend_from_slice(&[0u8; 3]);
        payload.extend_from_slice(&(tables.len() as u32).to_le_bytes());
        let mut offset = 0u64;
        for table in &tables {
            payload.extend_from_slice(&offset.to_le_bytes());
            offset += table.payload.len() as u64;
        }
        let mut links: Vec<Option<Arc<BlockNode>>> = vec![None];
        links.extend(tables.into_iter().map(Some));
        Some(self.push(tag::DATA_LIST, links, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::MdfFile;
    use std::io::Cursor;

    fn two_channel_writer() -> (FileWriter<Cursor<Vec<u8>>>, usize) {
        let mut w = FileWriter::new(Cursor::new(Vec::new())).start_time_ns(42);
        let g = w.add_group(vec![
            ChannelDef::new("time").unit("s").master(),
            ChannelDef::new("temp").unit("degC").conversion(ConversionSpec::Linear {
                slope: 0.5,
                intercept: -40.0,
            }),
        ]);
        (w, g)
    }

    #[test]
    fn wrong_row_arity_is_rejected() {
        let (mut w, g) = two_channel_writer();
        assert!(matches!(
            w.append_row(g, &[1.0]),
            Err(MdfError::BadRowWidth {
                got: 1,
                expected: 2
            })
        ));
    }

    #[test]
    fn round_trip_small_file() {
        let (mut w, g) = two_channel_writer();
        for i in 0..10 {
            w.append_row(g, &[i as f64 * 0.1, 100.0 + i as f64]).unwrap();
        }
        let bytes = w.finish().unwrap().into_inner();

        let mut file = MdfFile::open(Cursor::new(bytes)).unwrap();
        assert_eq!(file.version(), 410);
        assert_eq!(file.start_time_ns(), Some(42));
        let signals = file.signals().to_vec();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].name, "time");
        assert!(signals[0].is_master);
        assert_eq!(signals[1].unit, "degC");

        let decoded = file.decode_stream(0, |_, _| {}).unwrap();
        let temp = decoded.channel(1).unwrap();
        assert_eq!(temp.samples.len(), 10);
        assert_eq!(temp.samples.value_at(3), Some(103.0));
        // Conversion survives the round trip and applies on read.
        assert_eq!(temp.converter.convert_numeric(100.0), 10.0);
        let master = decoded.master_of(1).unwrap();
        assert_eq!(master.samples.value_at(4), Some(0.4));
    }

    #[test]
    fn large_groups_split_into_chained_data_tables() {
        let (mut w, g) = two_channel_writer();
        // 16 bytes per record; well past one 64 KiB table.
        for i in 0..70_000 {
            w.append_row(g, &[i as f64, -(i as f64)]).unwrap();
        }
        let bytes = w.finish().unwrap().into_inner();

        // Walk the envelopes: several DT blocks, each within the cap,
        // chained behind a DL.
        let (mut data_tables, mut data_lists) = (0, 0);
        let mut at = 64usize;
        while at < bytes.len() {
            let tag = &bytes[at..at + 4];
            let len =
                u64::from_le_bytes(bytes[at + 8..at + 16].try_into().unwrap()) as usize;
            if tag == b"##DT" {
                data_tables += 1;
                assert!(len <= MAX_DT_BLOCK, "DT block of {len} bytes at {at}");
            } else if tag == b"##DL" {
                data_lists += 1;
            }
            at = (at + len + 7) & !7;
        }
        assert!(data_tables >= 2, "expected chunked data, got {data_tables} DT");
        assert_eq!(data_lists, 1);

        let mut file = MdfFile::open(Cursor::new(bytes)).unwrap();
        let decoded = file.decode_stream(0, |_, _| {}).unwrap();
        let ch = decoded.channel(1).unwrap();
        assert_eq!(ch.samples.len(), 70_000);
        assert_eq!(ch.samples.value_at(69_999), Some(-69_999.0));
    }

    #[test]
    fn shared_unit_text_is_written_once() {
        let mut w = FileWriter::new(Cursor::new(Vec::new()));
        let g = w.add_group(vec![
            ChannelDef::new("a").unit("V").master(),
            ChannelDef::new("b").unit("V"),
        ]);
        w.append_row(g, &[1.0, 2.0]).unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let needle: &[u8] = b"##TX";
        let tx_blocks = bytes.windows(4).filter(|win| *win == needle).count();
        // "a", "b", and one shared "V".
        assert_eq!(tx_blocks, 3);

        let mut file = MdfFile::open(Cursor::new(bytes)).unwrap();
        assert_eq!(file.signals()[0].unit, "V");
        assert_eq!(file.signals()[1].unit, "V");
        let decoded = file.decode_stream(0, |_, _| {}).unwrap();
        assert_eq!(decoded.channel(0).unwrap().samples.values(), vec![1.0]);
    }

    #[test]
    fn groups_without_a_master_channel_are_rejected() {
        let mut w = FileWriter::new(Cursor::new(Vec::new()));
        let g = w.add_group(vec![ChannelDef::new("a"), ChannelDef::new("b")]);
        w.append_row(g, &[1.0, 2.0]).unwrap();
        let bytes = w.finish().unwrap().into_inner();

        // The catalog still lists the channels, but decoding the group
        // fails up front.
        let mut file = MdfFile::open(Cursor::new(bytes)).unwrap();
        assert_eq!(file.signals().len(), 2);
        assert!(matches!(
            file.decode_stream(0, |_, _| {}),
            Err(MdfError::NoMasterChannel(0))
        ));
    }

    #[test]
    fn value_to_text_conversion_round_trips() {
        let mut w = FileWriter::new(Cursor::new(Vec::new()));
        let spec = ConversionSpec::ValueToText {
            keys: vec![0.0, 1.0],
            targets: vec![
                crate::conversion::TextOrScale::Text("off".into()),
                crate::conversion::TextOrScale::Text("on".into()),
            ],
            default: crate::conversion::TextOrScale::Text("unknown".into()),
        };
        let g = w.add_group(vec![
            ChannelDef::new("time").master(),
            ChannelDef::new("state").conversion(spec),
        ]);
        w.append_row(g, &[0.0, 1.0]).unwrap();
        let bytes = w.finish().unwrap().into_inner();

        let mut file = MdfFile::open(Cursor::new(bytes)).unwrap();
        let decoded = file.decode_stream(0, |_, _| {}).unwrap();
        let state = decoded.channel(1).unwrap();
        assert_eq!(
            state.converter.convert(1.0),
            crate::conversion::Converted::Text("on".into())
        );
        assert_eq!(
            state.converter.convert(7.0),
            crate::conversion::Converted::Text("unknown".into())
        );
    }
}

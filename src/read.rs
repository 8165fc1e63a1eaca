//! High-level file reading: metadata scan and record-stream decoding.
//!
//! [`MdfFile::open`] walks the block graph once and builds a flat signal
//! catalog plus, per data group, everything needed to decode its record
//! stream later. Sample data is not touched at open time; it is multiple GB
//! in real files and most consumers only ever decode a few groups.
//! [`MdfFile::decode_stream`] then streams one data group's bytes through a
//! [`Demultiplexer`] in bounded chunks, reporting progress as it goes.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Seek};
use std::sync::Arc;

use binrw::Endian;
use log::{debug, warn};

use crate::{
    blocks::{
        tag,
        v3::{
            self, ChainIterV3, ChannelBlockV3, ChannelGroupBlockV3, ConversionBlockV3,
            DataGroupBlockV3, HeaderBlockV3,
        },
        v4::{
            read_text, ChannelBlock, ChannelGroupBlock, ConversionBlock, DataGroupBlock,
            DataListBlock, HeaderBlock,
        },
        ChainIter, ChannelType, DataType,
    },
    conversion::{self, ConversionSpec, Converter},
    demux::{Demultiplexer, GroupChannel, RecordGroup, RecordSchema},
    extract::Extractor,
    io::{BlockReader, IdHeader},
    sequence::{SampleSequence, SequenceReader},
    MdfError, MdfResult, HEADER_OFFSET,
};

/// Read granularity for record streams.
const STREAM_CHUNK: usize = 64 * 1024;

/// v4 `cn_flags` bit marking the invalidation bit as meaningful.
const CN_FLAG_INVAL_VALID: u32 = 0x02;

/// Catalog entry for one channel.
#[derive(Debug, Clone)]
pub struct SignalInfo {
    /// Stable handle, dense from 0 in file order.
    pub id: u32,
    pub name: String,
    pub unit: String,
    pub description: String,
    /// Index of the data group whose record stream holds this signal.
    pub stream: usize,
    pub is_master: bool,
}

/// Everything needed to decode one channel, resolved at scan time.
#[derive(Clone)]
struct ChannelDesc {
    signal: u32,
    /// `None` for virtual channels, whose value is the record index.
    extractor: Option<Extractor>,
    conversion: ConversionSpec,
    invalidation: Option<(usize, u8)>,
}

#[derive(Clone)]
struct GroupDesc {
    record_id: u64,
    record_len: usize,
    declared_rows: Option<u64>,
    master: Option<u32>,
    channels: Vec<ChannelDesc>,
}

#[derive(Clone)]
struct StreamDesc {
    data_link: u64,
    record_id_size: usize,
    /// v3 data regions are raw record bytes with no block envelope.
    v3_data: bool,
    /// Total stream bytes for v3, derived from declared record counts.
    v3_bytes: u64,
    groups: Vec<GroupDesc>,
}

/// One decoded channel: its raw samples and the conversion to apply on read.
#[derive(Debug, Clone)]
pub struct DecodedChannel {
    pub samples: SequenceReader,
    pub converter: Arc<Converter>,
    /// Signal ID of the group's master channel, if the group has one.
    pub master_id: Option<u32>,
    group_record_id: u64,
}

/// Result of decoding one data group's record stream.
#[derive(Debug)]
pub struct DecodedStream {
    channels: HashMap<u32, DecodedChannel>,
}

impl DecodedStream {
    pub fn channel(&self, signal: u32) -> MdfResult<&DecodedChannel> {
        self.channels
            .get(&signal)
            .ok_or(MdfError::UnknownSignal(signal))
    }

    /// The master (time) channel paired with `signal`.
    pub fn master_of(&self, signal: u32) -> MdfResult<&DecodedChannel> {
        let ch = self.channel(signal)?;
        let master = ch
            .master_id
            .ok_or(MdfError::NoMasterChannel(ch.group_record_id))?;
        self.channel(master)
    }
}

/// An opened MDF file: identification header, signal catalog, and the stream
/// descriptions needed to decode sample data on demand.
pub struct MdfFile<R> {
    reader: BlockReader<R>,
    id: IdHeader,
    start_time_ns: Option<u64>,
    signals: Vec<SignalInfo>,
    streams: Vec<StreamDesc>,
}

impl<R: Read + Seek> MdfFile<R> {
    /// Open a file and scan its metadata. No sample data is read.
    pub fn open(inner: R) -> MdfResult<Self> {
        let mut reader = BlockReader::new(inner);
        let id = reader.read_id_header()?;
        let mut file = Self {
            reader,
            id,
            start_time_ns: None,
            signals: Vec::new(),
            streams: Vec::new(),
        };
        if file.id.is_v4() {
            file.scan_v4()?;
        } else {
            file.scan_v3()?;
        }
        debug!(
            "scanned {} signals in {} data groups (version {})",
            file.signals.len(),
            file.streams.len(),
            file.id.version
        );
        Ok(file)
    }

    pub fn version(&self) -> u16 {
        self.id.version
    }

    pub fn program(&self) -> &str {
        &self.id.program
    }

    pub fn is_unfinalized(&self) -> bool {
        self.id.unfinalized
    }

    /// Recording start in nanoseconds since the Unix epoch, when the file
    /// declares it (v4 only).
    pub fn start_time_ns(&self) -> Option<u64> {
        self.start_time_ns
    }

    pub fn signals(&self) -> &[SignalInfo] {
        &self.signals
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn scan_v4(&mut self) -> MdfResult<()> {
        let Some(raw) = self.reader.read_block(HEADER_OFFSET, tag::HEADER)? else {
            return Err(MdfError::BadMagic);
        };
        let hd = HeaderBlock::from_raw(&raw)?;
        self.start_time_ns = Some(hd.payload.start_time_ns);

        let dgs: Vec<DataGroupBlock> =
            ChainIter::new(&mut self.reader, hd.first_data_group).collect::<MdfResult<_>>()?;
        for dg in dgs {
            let stream = self.streams.len();
            let cgs: Vec<ChannelGroupBlock> =
                ChainIter::new(&mut self.reader, dg.first_channel_group)
                    .collect::<MdfResult<_>>()?;
            let mut groups = Vec::with_capacity(cgs.len());
            for cg in cgs {
                groups.push(self.scan_v4_group(&cg, stream)?);
            }
            self.streams.push(StreamDesc {
                data_link: dg.data,
                record_id_size: dg.record_id_size as usize,
                v3_data: false,
                v3_bytes: 0,
                groups,
            });
        }
        Ok(())
    }

    fn scan_v4_group(&mut self, cg: &ChannelGroupBlock, stream: usize) -> MdfResult<GroupDesc> {
        let cns: Vec<ChannelBlock> =
            ChainIter::new(&mut self.reader, cg.first_channel).collect::<MdfResult<_>>()?;
        let mut channels = Vec::with_capacity(cns.len());
        let mut master = None;
        for cn in cns {
            let name = read_text(&mut self.reader, cn.name_link)?.unwrap_or_default();
            let mut unit = read_text(&mut self.reader, cn.unit_link)?.unwrap_or_default();
            let description = read_text(&mut self.reader, cn.comment_link)?.unwrap_or_default();

            let conversion = match self.reader.read_block(cn.conversion, tag::CONVERSION)? {
                Some(raw) => {
                    let cc = ConversionBlock::from_raw(&raw)?;
                    if unit.is_empty() {
                        unit = read_text(&mut self.reader, cc.unit_link)?.unwrap_or_default();
                    }
                    conversion::spec_from_v4(&mut self.reader, &cc)?
                }
                None => ConversionSpec::Identity,
            };

            let is_virtual = matches!(
                cn.channel_type,
                ChannelType::VirtualMaster | ChannelType::VirtualData
            );
            let extractor = if is_virtual {
                None
            } else {
                match Extractor::build(cn.data_type, cn.byte_offset, cn.bit_offset, cn.bit_count) {
                    Ok(e) => Some(e),
                    Err(e) => {
                        warn!("channel {name:?} has an undecodable layout ({e}); skipping");
                        continue;
                    }
                }
            };
            let invalidation = (cn.flags & CN_FLAG_INVAL_VALID != 0).then(|| {
                (
                    cg.data_bytes as usize + (cn.inval_bit_pos / 8) as usize,
                    1u8 << (cn.inval_bit_pos % 8),
                )
            });

            let id = self.signals.len() as u32;
            let is_master = cn.channel_type.is_master();
            if is_master && master.is_none() {
                master = Some(id);
            }
            self.signals.push(SignalInfo {
                id,
                name,
                unit,
                description,
                stream,
                is_master,
            });
            channels.push(ChannelDesc {
                signal: id,
                extractor,
                conversion,
                invalidation,
            });
        }
        Ok(GroupDesc {
            record_id: cg.record_id,
            record_len: cg.record_len(),
            declared_rows: (!self.id.unfinalized).then_some(cg.cycle_count),
            master,
            channels,
        })
    }

    fn scan_v3(&mut self) -> MdfResult<()> {
        let endian = if self.id.big_endian {
            Endian::Big
        } else {
            Endian::Little
        };
        let Some(raw) = self
            .reader
            .read_block_v3(HEADER_OFFSET, v3::TAG_HEADER, None)?
        else {
            return Err(MdfError::BadMagic);
        };
        let hd = HeaderBlockV3::from_raw(&raw, endian)?;

        let dgs: Vec<DataGroupBlockV3> =
            ChainIterV3::new(&mut self.reader, hd.first_data_group, endian)
                .collect::<MdfResult<_>>()?;
        for dg in dgs {
            let stream = self.streams.len();
            let id_size = usize::from(dg.record_id_type != 0);
            // Type 2 repeats the ID after the record; fold the trailing byte
            // into the body so the demultiplexer consumes it.
            let trailing = usize::from(dg.record_id_type == 2);

            let cgs: Vec<ChannelGroupBlockV3> =
                ChainIterV3::new(&mut self.reader, dg.first_channel_group, endian)
                    .collect::<MdfResult<_>>()?;
            let mut groups = Vec::with_capacity(cgs.len());
            let mut v3_bytes = 0u64;
            for cg in cgs {
                let group = self.scan_v3_group(&cg, stream, trailing, endian)?;
                v3_bytes += (id_size + group.record_len) as u64 * cg.record_count as u64;
                groups.push(group);
            }
            self.streams.push(StreamDesc {
                data_link: dg.data,
                record_id_size: id_size,
                v3_data: true,
                v3_bytes,
                groups,
            });
        }
        Ok(())
    }

    fn scan_v3_group(
        &mut self,
        cg: &ChannelGroupBlockV3,
        stream: usize,
        trailing: usize,
        endian: Endian,
    ) -> MdfResult<GroupDesc> {
        let cns: Vec<ChannelBlockV3> =
            ChainIterV3::new(&mut self.reader, cg.first_channel, endian)
                .collect::<MdfResult<_>>()?;
        let mut channels = Vec::with_capacity(cns.len());
        let mut master = None;
        for cn in cns {
            let (unit, conversion) = match self
                .reader
                .read_block_v3(cn.conversion, v3::TAG_CONVERSION, None)?
            {
                Some(raw) => {
                    let cc = ConversionBlockV3::from_raw(&raw, endian)?;
                    (
                        cc.unit,
                        conversion::spec_from_v3(&mut self.reader, &cc.conversion)?,
                    )
                }
                None => (String::new(), ConversionSpec::Identity),
            };

            let data_type = DataType::from_v3(cn.data_type, self.id.big_endian);
            let byte_offset = cn.start_bit / 8;
            let bit_offset = (cn.start_bit % 8) as u8;
            let extractor =
                match Extractor::build(data_type, byte_offset, bit_offset, cn.bit_count as u32) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(
                            "channel {:?} has an undecodable layout ({e}); skipping",
                            cn.name
                        );
                        continue;
                    }
                };

            let id = self.signals.len() as u32;
            let is_master = ChannelType::from_v3(cn.channel_type).is_master();
            if is_master && master.is_none() {
                master = Some(id);
            }
            self.signals.push(SignalInfo {
                id,
                name: cn.name,
                unit,
                description: cn.description,
                stream,
                is_master,
            });
            channels.push(ChannelDesc {
                signal: id,
                extractor: Some(extractor),
                conversion,
                invalidation: None,
            });
        }
        Ok(GroupDesc {
            record_id: cg.record_id as u64,
            record_len: cg.record_size as usize + trailing,
            declared_rows: (!self.id.unfinalized).then_some(cg.record_count as u64),
            master,
            channels,
        })
    }

    /// Decode one data group's record stream into per-channel sequences.
    ///
    /// `progress` is called with (bytes decoded, total bytes) after every
    /// chunk. Decoding stops early once every group in the stream has
    /// reached its declared row count. A group with channels but no master
    /// fails with [`MdfError::NoMasterChannel`] before any bytes stream.
    pub fn decode_stream(
        &mut self,
        stream: usize,
        progress: impl FnMut(u64, u64),
    ) -> MdfResult<DecodedStream> {
        self.decode_stream_live(stream, |_| {}, progress)
    }

    /// Like [`Self::decode_stream`], but hands the per-channel readers to
    /// `on_start` before any record bytes stream. The readers observe the
    /// same storage the decoder appends to, so a caller holding them sees
    /// samples appear incrementally; they stay valid across buffer growth.
    pub fn decode_stream_live(
        &mut self,
        stream: usize,
        on_start: impl FnOnce(&DecodedStream),
        mut progress: impl FnMut(u64, u64),
    ) -> MdfResult<DecodedStream> {
        let desc = self
            .streams
            .get(stream)
            .cloned()
            .ok_or(MdfError::UnknownSignal(stream as u32))?;

        let mut channels = HashMap::new();
        // (group index, writer) for virtual row-index channels.
        let mut virtuals = Vec::new();
        let mut rec_groups = Vec::with_capacity(desc.groups.len());
        for (gi, g) in desc.groups.iter().enumerate() {
            if g.master.is_none() && !g.channels.is_empty() {
                return Err(MdfError::NoMasterChannel(g.record_id));
            }
            let mut group_channels = Vec::with_capacity(g.channels.len());
            for ch in &g.channels {
                let seq = match g.declared_rows {
                    Some(rows) if rows > 0 => SampleSequence::with_capacity(rows as usize),
                    _ => SampleSequence::new(),
                };
                channels.insert(
                    ch.signal,
                    DecodedChannel {
                        samples: seq.reader(),
                        converter: Arc::new(ch.conversion.compile()?),
                        master_id: g.master,
                        group_record_id: g.record_id,
                    },
                );
                match &ch.extractor {
                    Some(extractor) => {
                        let mut gc = GroupChannel::new(extractor.clone(), seq.writer());
                        if let Some((byte, mask)) = ch.invalidation {
                            gc = gc.with_invalidation(byte, mask);
                        }
                        group_channels.push(gc);
                    }
                    None => virtuals.push((gi, seq.writer())),
                }
            }
            rec_groups.push(RecordGroup::new(
                g.record_id,
                g.record_len,
                g.declared_rows,
                group_channels,
            )?);
        }
        let schema = RecordSchema::new(desc.record_id_size, rec_groups)?;
        let mut demux = Demultiplexer::new(schema);

        let decoded = DecodedStream { channels };
        on_start(&decoded);

        let chunks = if desc.v3_data {
            vec![(desc.data_link, desc.v3_bytes)]
        } else {
            self.data_chunks(desc.data_link)?
        };
        let total: u64 = chunks.iter().map(|&(_, len)| len).sum();
        let mut done = 0u64;
        'stream: for (offset, len) in chunks {
            let mut pos = 0u64;
            while pos < len {
                let take = STREAM_CHUNK.min((len - pos) as usize);
                let buf = match self.reader.read_range(offset + pos, take) {
                    Ok(buf) => buf,
                    // v3 record counts can overstate what's on disk.
                    Err(MdfError::Io(e))
                        if e.kind() == ErrorKind::UnexpectedEof && desc.v3_data =>
                    {
                        warn!("data region ends before the declared record count");
                        break 'stream;
                    }
                    Err(e) => return Err(e),
                };
                demux.feed(&buf)?;
                pos += take as u64;
                done += take as u64;
                progress(done, total);
                if demux.complete() {
                    break 'stream;
                }
            }
        }
        let schema = demux.finish();

        for (gi, mut writer) in virtuals {
            for i in 0..schema.groups[gi].rows_seen() {
                writer.push(i as f64);
            }
        }
        Ok(decoded)
    }

    /// Enumerate the (offset, length) payload ranges of a v4 data link,
    /// resolving `##DL` chains and `##HL` wrappers down to `##DT` blocks.
    /// Compressed (`##DZ`) payloads surface as [`MdfError::BadBlockTag`].
    fn data_chunks(&mut self, link: u64) -> MdfResult<Vec<(u64, u64)>> {
        let mut out = Vec::new();
        let Some(prefix) = self.reader.read_block_prefix(link)? else {
            return Ok(out);
        };
        let list_start = match prefix.tag {
            tag::DATA_TABLE => {
                out.push((prefix.payload_offset, prefix.payload_len));
                return Ok(out);
            }
            tag::DATA_LIST => link,
            // HL wraps the DL chain with flags this crate doesn't act on.
            tag::HEADER_LIST => prefix.links.first().copied().unwrap_or(0),
            other => {
                return Err(MdfError::BadBlockTag {
                    expected: "##DT, ##DL or ##HL".into(),
                    found: other.to_string(),
                    offset: link,
                })
            }
        };

        let lists: Vec<DataListBlock> =
            ChainIter::new(&mut self.reader, list_start).collect::<MdfResult<_>>()?;
        for list in lists {
            for data_link in list.data_links {
                let Some(dt) = self.reader.read_block_prefix(data_link)? else {
                    continue;
                };
                if dt.tag != tag::DATA_TABLE {
                    return Err(MdfError::BadBlockTag {
                        expected: tag::DATA_TABLE.to_string(),
                        found: dt.tag.to_string(),
                        offset: data_link,
                    });
                }
                out.push((dt.payload_offset, dt.payload_len));
            }
        }
        Ok(out)
    }
}

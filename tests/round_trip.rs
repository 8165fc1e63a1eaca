use std::io::Cursor;

use anyhow::Result;
use mdfio::{
    conversion::TextOrScale,
    read::MdfFile,
    write::{ChannelDef, FileWriter},
    ConversionSpec, Converted,
};

fn write_two_groups() -> Result<Vec<u8>> {
    let mut writer = FileWriter::new(Cursor::new(Vec::new()))
        .program("rt-test")
        .start_time_ns(1_700_000_000_000_000_000);

    let engine = writer.add_group(vec![
        ChannelDef::new("time").unit("s").master(),
        ChannelDef::new("rpm").unit("1/min"),
        ChannelDef::new("coolant").unit("degC").conversion(ConversionSpec::Linear {
            slope: 0.1,
            intercept: -40.0,
        }),
    ]);
    let gear = writer.add_group(vec![
        ChannelDef::new("time").unit("s").master(),
        ChannelDef::new("gear").conversion(ConversionSpec::ValueToText {
            keys: vec![0.0, 1.0, 2.0],
            targets: vec![
                TextOrScale::Text("N".into()),
                TextOrScale::Text("1".into()),
                TextOrScale::Text("2".into()),
            ],
            default: TextOrScale::Text("?".into()),
        }),
    ]);

    for i in 0..1000 {
        writer.append_row(engine, &[i as f64 * 0.01, 800.0 + i as f64, 650.0 + i as f64])?;
    }
    for i in 0..50 {
        writer.append_row(gear, &[i as f64 * 0.2, (i % 3) as f64])?;
    }
    Ok(writer.finish()?.into_inner())
}

#[test]
fn catalog_survives_the_round_trip() -> Result<()> {
    let file = MdfFile::open(Cursor::new(write_two_groups()?))?;
    assert_eq!(file.version(), 410);
    assert_eq!(file.program(), "rt-test");
    assert_eq!(file.start_time_ns(), Some(1_700_000_000_000_000_000));
    assert!(!file.is_unfinalized());

    let signals = file.signals();
    assert_eq!(signals.len(), 5);
    assert_eq!(signals[1].name, "rpm");
    assert_eq!(signals[1].unit, "1/min");
    assert_eq!(signals[2].unit, "degC");
    assert_eq!(signals[3].stream, 1);
    assert!(signals[3].is_master);
    Ok(())
}

#[test]
fn samples_and_conversions_survive_the_round_trip() -> Result<()> {
    let mut file = MdfFile::open(Cursor::new(write_two_groups()?))?;

    let engine = file.decode_stream(0, |_, _| {})?;
    let rpm = engine.channel(1)?;
    assert_eq!(rpm.samples.len(), 1000);
    assert_eq!(rpm.samples.value_at(999), Some(1799.0));
    let coolant = engine.channel(2)?;
    // Raw on disk; the converter applies at read time.
    assert_eq!(coolant.samples.value_at(0), Some(650.0));
    assert_eq!(coolant.converter.convert_numeric(650.0), 25.0);
    let time = engine.master_of(1)?;
    assert_eq!(time.samples.value_at(100), Some(100.0 * 0.01));

    let gears = file.decode_stream(1, |_, _| {})?;
    let gear = gears.channel(4)?;
    assert_eq!(gear.samples.len(), 50);
    assert_eq!(gear.converter.convert(2.0), Converted::Text("2".into()));
    assert_eq!(gear.converter.convert(9.0), Converted::Text("?".into()));
    Ok(())
}

#[test]
fn progress_is_monotonic_and_finishes_at_total() -> Result<()> {
    let mut file = MdfFile::open(Cursor::new(write_two_groups()?))?;
    let mut calls = Vec::new();
    file.decode_stream(0, |done, total| calls.push((done, total)))?;
    assert!(!calls.is_empty());
    for pair in calls.windows(2) {
        assert!(pair[0].0 <= pair[1].0);
        assert_eq!(pair[0].1, pair[1].1);
    }
    let &(done, total) = calls.last().unwrap();
    assert_eq!(done, total);
    // 3 channels * 8 bytes * 1000 rows.
    assert_eq!(total, 24_000);
    Ok(())
}

#[test]
fn every_block_lands_on_an_eight_byte_boundary() -> Result<()> {
    let bytes = write_two_groups()?;
    let known: [&[u8; 4]; 8] = [
        b"##HD", b"##DG", b"##CG", b"##CN", b"##CC", b"##TX", b"##DT", b"##DL",
    ];
    // Walk the file block by block; every envelope must start 8-aligned and
    // carry a known tag, and the blocks must tile the file exactly.
    let mut at = 64usize;
    let mut blocks = 0;
    while at < bytes.len() {
        assert_eq!(at % 8, 0, "block at unaligned offset {at}");
        let tag = &bytes[at..at + 4];
        assert!(
            known.iter().any(|k| &k[..] == tag),
            "unknown tag {:?} at offset {at}",
            String::from_utf8_lossy(tag)
        );
        let len = u64::from_le_bytes(bytes[at + 8..at + 16].try_into()?) as usize;
        assert!(len >= 24, "impossible block length {len} at offset {at}");
        blocks += 1;
        at = (at + len + 7) & !7;
    }
    assert_eq!(at, bytes.len());
    assert!(blocks > 10);
    Ok(())
}

#[test]
fn unfinalized_files_decode_everything_on_disk() -> Result<()> {
    let mut bytes = write_two_groups()?;
    bytes[0..8].copy_from_slice(b"UnFinMF ");

    let mut file = MdfFile::open(Cursor::new(bytes))?;
    assert!(file.is_unfinalized());
    // Declared cycle counts are ignored; the stream still decodes fully.
    let decoded = file.decode_stream(0, |_, _| {})?;
    assert_eq!(decoded.channel(1)?.samples.len(), 1000);
    Ok(())
}

#[test]
fn round_trips_through_a_real_file() -> Result<()> {
    let bytes = write_two_groups()?;
    let mut tmp = tempfile::tempfile()?;
    std::io::Write::write_all(&mut tmp, &bytes)?;

    let mut file = MdfFile::open(tmp)?;
    assert_eq!(file.signals().len(), 5);
    let decoded = file.decode_stream(1, |_, _| {})?;
    assert_eq!(decoded.channel(3)?.samples.len(), 50);
    Ok(())
}

#[test]
fn garbage_input_is_rejected() {
    assert!(MdfFile::open(Cursor::new(vec![0u8; 128])).is_err());
    assert!(MdfFile::open(Cursor::new(b"MDF".to_vec())).is_err());
}

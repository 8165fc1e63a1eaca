use anyhow::Result;
use mdfio::{
    conversion::TextOrScale,
    ConversionSpec, Converted,
};

fn compile(spec: ConversionSpec) -> Result<mdfio::Converter> {
    Ok(spec.compile()?)
}

#[test]
fn interpolation_table_end_to_end() -> Result<()> {
    let c = compile(ConversionSpec::TableInterp {
        keys: vec![0.0, 10.0],
        values: vec![10.0, 20.0],
    })?;
    assert_eq!(c.convert_numeric(5.0), 15.0);
    assert_eq!(c.convert_numeric(-5.0), 10.0);
    assert_eq!(c.convert_numeric(15.0), 20.0);
    assert_eq!(c.convert_numeric(0.0), 10.0);
    Ok(())
}

#[test]
fn unsorted_tables_are_sorted_at_compile_time() -> Result<()> {
    let c = compile(ConversionSpec::TableInterp {
        keys: vec![10.0, 0.0, 5.0],
        values: vec![100.0, 0.0, 50.0],
    })?;
    assert_eq!(c.convert_numeric(2.5), 25.0);
    assert_eq!(c.convert_numeric(7.5), 75.0);
    Ok(())
}

#[test]
fn range_table_with_binary_search_and_default() -> Result<()> {
    let entries: Vec<(f64, f64, f64)> = (0..20)
        .map(|i| (i as f64 * 100.0, i as f64 * 100.0 + 50.0, i as f64))
        .collect();
    let c = compile(ConversionSpec::RangeTable {
        entries,
        default: -1.0,
    })?;
    assert_eq!(c.convert_numeric(0.0), 0.0);
    assert_eq!(c.convert_numeric(1_025.0), 10.0);
    assert_eq!(c.convert_numeric(1_075.0), -1.0); // gap between ranges
    assert_eq!(c.convert_numeric(5_000.0), -1.0); // past the last range
    Ok(())
}

#[test]
fn nested_scale_inside_a_text_table() -> Result<()> {
    let c = compile(ConversionSpec::ValueToText {
        keys: vec![0.0, 1.0],
        targets: vec![
            TextOrScale::Text("idle".into()),
            TextOrScale::Scale(Box::new(ConversionSpec::Algebraic("x * 100 + 7".into()))),
        ],
        default: TextOrScale::None,
    })?;
    assert_eq!(c.convert(0.0), Converted::Text("idle".into()));
    assert_eq!(c.convert(1.0), Converted::Number(107.0));
    // No default target: the raw value passes through.
    assert_eq!(c.convert(5.0), Converted::Number(5.0));
    Ok(())
}

#[test]
fn algebraic_formula_errors_surface_at_compile_time() {
    let bad = ConversionSpec::Algebraic("2 +* x".into());
    assert!(bad.compile().is_err());
    let good = ConversionSpec::Algebraic("-(x - 273.15)".into());
    assert!(good.compile().is_ok());
}

#[test]
fn conversion_output_is_deterministic() -> Result<()> {
    let c = compile(ConversionSpec::Rational {
        numer: [1.0, -2.0, 1.0],
        denom: [0.0, 0.0, 3.0],
    })?;
    let inputs = [0.0, 1.5, -7.25, 1e9, f64::MIN_POSITIVE];
    for x in inputs {
        assert_eq!(c.convert_numeric(x), c.convert_numeric(x));
    }
    Ok(())
}

#[test]
fn text_label_side_list_feeds_the_writer() {
    let spec = ConversionSpec::RangeToText {
        ranges: vec![(0.0, 9.0), (10.0, 19.0)],
        targets: vec![
            TextOrScale::Text("low".into()),
            TextOrScale::Text("high".into()),
        ],
        default: TextOrScale::Text("out".into()),
    };
    let labels = spec.text_labels();
    assert_eq!(labels.len(), 2);
    assert_eq!((&*labels[0].0, labels[0].1), ("low", 0.0));
    assert_eq!((&*labels[1].0, labels[1].1), ("high", 10.0));
}

//! Conversion engine: raw channel values to physical values.
//!
//! A channel's `##CC` block selects one of about ten conversion rules, from
//! plain linear scaling to nested text/scale tables. [`ConversionSpec`] is
//! the semantic model shared by the read and write paths; [`Converter`] is
//! its compiled form, built once per channel and evaluated per sample by
//! plain `match` dispatch over precomputed constants. No per-sample parsing
//! happens anywhere here.

use std::io::{Read, Seek};
use std::sync::Arc;

use log::warn;

use crate::{
    blocks::{tag, v3::ConversionV3, v4::ConversionBlock},
    formula::{self, Expr},
    io::BlockReader,
    MdfError, MdfResult,
};

/// Nested conversion graphs deeper than this are treated as corrupt.
const MAX_NESTING: usize = 32;

/// Output of a conversion: physical number or display text.
#[derive(Debug, Clone, PartialEq)]
pub enum Converted {
    Number(f64),
    Text(Arc<str>),
}

impl Converted {
    /// Numeric view; text labels have no numeric value and read as NaN.
    pub fn as_f64(&self) -> f64 {
        match self {
            Converted::Number(n) => *n,
            Converted::Text(_) => f64::NAN,
        }
    }
}

/// Target of a text-table entry: a literal label or a nested conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum TextOrScale {
    /// Missing ref link; evaluates like an absent default.
    None,
    Text(Arc<str>),
    Scale(Box<ConversionSpec>),
}

/// Semantic description of one conversion rule.
///
/// `TextToValue`/`TextToText` are modeled but not evaluable: they compile to
/// a constant-zero converter so a file using them still loads. That matches
/// the historical behavior downstream consumers rely on; promoting it to an
/// error would be a compatibility break.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionSpec {
    Identity,
    Linear {
        slope: f64,
        intercept: f64,
    },
    /// Ratio of two quadratics, coefficients in descending-power order.
    Rational {
        numer: [f64; 3],
        denom: [f64; 3],
    },
    Algebraic(String),
    /// Sorted (key, value) pairs, interpolated between neighbors.
    TableInterp {
        keys: Vec<f64>,
        values: Vec<f64>,
    },
    /// Sorted (key, value) pairs, snapped to the nearer neighbor.
    TableNearest {
        keys: Vec<f64>,
        values: Vec<f64>,
    },
    /// (min, max, value) triples with a trailing default.
    RangeTable {
        entries: Vec<(f64, f64, f64)>,
        default: f64,
    },
    ValueToText {
        keys: Vec<f64>,
        targets: Vec<TextOrScale>,
        default: TextOrScale,
    },
    RangeToText {
        ranges: Vec<(f64, f64)>,
        targets: Vec<TextOrScale>,
        default: TextOrScale,
    },
    TextToValue,
    TextToText,
}

#[derive(Debug)]
enum CompiledTarget {
    None,
    Text(Arc<str>),
    Scale(Box<Converter>),
}

impl CompiledTarget {
    fn apply(&self, x: f64) -> Converted {
        match self {
            CompiledTarget::None => Converted::Number(x),
            CompiledTarget::Text(t) => Converted::Text(Arc::clone(t)),
            CompiledTarget::Scale(c) => c.convert(x),
        }
    }
}

/// A compiled conversion. Evaluating the same input twice always yields the
/// same output; all constants are precomputed at build time.
#[derive(Debug)]
pub enum Converter {
    Identity,
    Linear {
        slope: f64,
        intercept: f64,
    },
    Rational {
        numer: [f64; 3],
        denom: [f64; 3],
    },
    Algebraic(Expr),
    TableInterp {
        keys: Vec<f64>,
        values: Vec<f64>,
    },
    TableNearest {
        keys: Vec<f64>,
        values: Vec<f64>,
    },
    RangeTable {
        entries: Vec<(f64, f64, f64)>,
        default: f64,
    },
    ValueToText {
        keys: Vec<f64>,
        targets: Vec<CompiledTarget>,
        default: CompiledTarget,
    },
    RangeToText {
        ranges: Vec<(f64, f64)>,
        targets: Vec<CompiledTarget>,
        default: CompiledTarget,
    },
    /// Fallback for kinds this crate cannot evaluate.
    Zero,
}

/// Number of range-table entries below which a linear scan beats the binary
/// search setup cost.
const RANGE_SCAN_MAX: usize = 8;

impl Converter {
    pub fn convert(&self, x: f64) -> Converted {
        match self {
            Converter::Identity => Converted::Number(x),
            Converter::Linear { slope, intercept } => Converted::Number(slope * x + intercept),
            Converter::Rational { numer, denom } => {
                let n = numer[0] * x * x + numer[1] * x + numer[2];
                let d = denom[0] * x * x + denom[1] * x + denom[2];
                Converted::Number(n / d)
            }
            Converter::Algebraic(expr) => Converted::Number(expr.eval(x)),
            Converter::TableInterp { keys, values } => {
                Converted::Number(lookup_interp(keys, values, x))
            }
            Converter::TableNearest { keys, values } => {
                Converted::Number(lookup_nearest(keys, values, x))
            }
            Converter::RangeTable { entries, default } => {
                Converted::Number(lookup_range(entries, *default, x))
            }
            Converter::ValueToText {
                keys,
                targets,
                default,
            } => match keys.binary_search_by(|k| k.total_cmp(&x)) {
                Ok(i) => targets[i].apply(x),
                Err(_) => default.apply(x),
            },
            Converter::RangeToText {
                ranges,
                targets,
                default,
            } => {
                // Sorted by lower bound at build time; first match wins.
                for (i, (lo, hi)) in ranges.iter().enumerate() {
                    if *lo <= x && x <= *hi {
                        return targets[i].apply(x);
                    }
                }
                default.apply(x)
            }
            Converter::Zero => Converted::Number(0.0),
        }
    }

    /// Numeric-only view of [`Self::convert`].
    pub fn convert_numeric(&self, x: f64) -> f64 {
        self.convert(x).as_f64()
    }
}

fn lookup_interp(keys: &[f64], values: &[f64], x: f64) -> f64 {
    if keys.is_empty() {
        return x;
    }
    // Number of keys <= x.
    let i = keys.partition_point(|k| *k <= x);
    if i == 0 {
        return values[0];
    }
    if keys[i - 1] == x || i == keys.len() {
        // Exact hit returns the stored value; beyond the last key clamps.
        return values[i - 1];
    }
    let (k0, k1) = (keys[i - 1], keys[i]);
    let (v0, v1) = (values[i - 1], values[i]);
    v0 + (v1 - v0) * (x - k0) / (k1 - k0)
}

fn lookup_nearest(keys: &[f64], values: &[f64], x: f64) -> f64 {
    if keys.is_empty() {
        return x;
    }
    let i = keys.partition_point(|k| *k <= x);
    if i == 0 {
        return values[0];
    }
    if i == keys.len() {
        return values[i - 1];
    }
    // Ties break toward the lower key.
    if x - keys[i - 1] <= keys[i] - x {
        values[i - 1]
    } else {
        values[i]
    }
}

fn lookup_range(entries: &[(f64, f64, f64)], default: f64, x: f64) -> f64 {
    if entries.len() <= RANGE_SCAN_MAX {
        for (lo, hi, v) in entries {
            if *lo <= x && x <= *hi {
                return *v;
            }
        }
        return default;
    }
    // Entries are sorted by lower bound; the only candidate is the last
    // entry whose lower bound does not exceed x.
    let i = entries.partition_point(|(lo, _, _)| *lo <= x);
    if i > 0 {
        let (lo, hi, v) = entries[i - 1];
        if lo <= x && x <= hi {
            return v;
        }
    }
    default
}

impl ConversionSpec {
    /// Compile into an evaluation-ready [`Converter`].
    ///
    /// Table variants are sorted here so lookups can binary-search;
    /// algebraic text is parsed here, once.
    pub fn compile(&self) -> MdfResult<Converter> {
        Ok(match self {
            ConversionSpec::Identity => Converter::Identity,
            ConversionSpec::Linear { slope, intercept } => Converter::Linear {
                slope: *slope,
                intercept: *intercept,
            },
            ConversionSpec::Rational { numer, denom } => Converter::Rational {
                numer: *numer,
                denom: *denom,
            },
            ConversionSpec::Algebraic(src) => Converter::Algebraic(formula::compile(src)?),
            ConversionSpec::TableInterp { keys, values } => {
                let (keys, values) = sort_table(keys, values);
                Converter::TableInterp { keys, values }
            }
            ConversionSpec::TableNearest { keys, values } => {
                let (keys, values) = sort_table(keys, values);
                Converter::TableNearest { keys, values }
            }
            ConversionSpec::RangeTable { entries, default } => {
                let mut entries = entries.clone();
                entries.sort_by(|a, b| a.0.total_cmp(&b.0));
                Converter::RangeTable {
                    entries,
                    default: *default,
                }
            }
            ConversionSpec::ValueToText {
                keys,
                targets,
                default,
            } => {
                let mut order: Vec<usize> = (0..keys.len()).collect();
                order.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
                Converter::ValueToText {
                    keys: order.iter().map(|&i| keys[i]).collect(),
                    targets: order
                        .iter()
                        .map(|&i| compile_target(&targets[i]))
                        .collect::<MdfResult<_>>()?,
                    default: compile_target(default)?,
                }
            }
            ConversionSpec::RangeToText {
                ranges,
                targets,
                default,
            } => {
                let mut order: Vec<usize> = (0..ranges.len()).collect();
                order.sort_by(|&a, &b| ranges[a].0.total_cmp(&ranges[b].0));
                Converter::RangeToText {
                    ranges: order.iter().map(|&i| ranges[i]).collect(),
                    targets: order
                        .iter()
                        .map(|&i| compile_target(&targets[i]))
                        .collect::<MdfResult<_>>()?,
                    default: compile_target(default)?,
                }
            }
            ConversionSpec::TextToValue => {
                warn!("text-to-value conversion is not supported; values degrade to 0");
                Converter::Zero
            }
            ConversionSpec::TextToText => {
                warn!("text-to-text conversion is not supported; values degrade to 0");
                Converter::Zero
            }
        })
    }

    /// All text literals this conversion can emit, paired with the raw value
    /// that selects each one (the lower bound, for range entries). The
    /// writer uses this to reconstruct enumerations.
    pub fn text_labels(&self) -> Vec<(Arc<str>, f64)> {
        let mut out = Vec::new();
        match self {
            ConversionSpec::ValueToText { keys, targets, .. } => {
                for (k, t) in keys.iter().zip(targets) {
                    if let TextOrScale::Text(text) = t {
                        out.push((Arc::clone(text), *k));
                    }
                }
            }
            ConversionSpec::RangeToText {
                ranges, targets, ..
            } => {
                for ((lo, _), t) in ranges.iter().zip(targets) {
                    if let TextOrScale::Text(text) = t {
                        out.push((Arc::clone(text), *lo));
                    }
                }
            }
            _ => {}
        }
        out
    }
}

fn sort_table(keys: &[f64], values: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let n = keys.len().min(values.len());
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));
    (
        order.iter().map(|&i| keys[i]).collect(),
        order.iter().map(|&i| values[i]).collect(),
    )
}

fn compile_target(target: &TextOrScale) -> MdfResult<CompiledTarget> {
    Ok(match target {
        TextOrScale::None => CompiledTarget::None,
        TextOrScale::Text(t) => CompiledTarget::Text(Arc::clone(t)),
        TextOrScale::Scale(spec) => CompiledTarget::Scale(Box::new(spec.compile()?)),
    })
}

// ---------------------------------------------------------------------------
// Reading specs out of block graphs
// ---------------------------------------------------------------------------

/// v4 `cc_type` values.
mod cc_type {
    pub const IDENTITY: u8 = 0;
    pub const LINEAR: u8 = 1;
    pub const RATIONAL: u8 = 2;
    pub const ALGEBRAIC: u8 = 3;
    pub const TABLE_INTERP: u8 = 4;
    pub const TABLE_NEAREST: u8 = 5;
    pub const RANGE_TABLE: u8 = 6;
    pub const VALUE_TO_TEXT: u8 = 7;
    pub const RANGE_TO_TEXT: u8 = 8;
    pub const TEXT_TO_VALUE: u8 = 9;
    pub const TEXT_TO_TEXT: u8 = 10;
}

/// Build a [`ConversionSpec`] from a v4 `##CC` block, resolving nested
/// text/scale references. Re-reading a shared reference re-parses it; the
/// graphs are shallow and legitimately shared nodes are rare.
pub fn spec_from_v4<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    block: &ConversionBlock,
) -> MdfResult<ConversionSpec> {
    spec_from_v4_inner(reader, block, 0)
}

fn spec_from_v4_inner<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    block: &ConversionBlock,
    depth: usize,
) -> MdfResult<ConversionSpec> {
    if depth > MAX_NESTING {
        return Err(MdfError::UnsupportedConversion(
            "nested conversions exceed depth limit".into(),
        ));
    }
    let vals = &block.vals;
    let val = |i: usize| vals.get(i).copied().unwrap_or(0.0);

    Ok(match block.cc_type {
        cc_type::IDENTITY => ConversionSpec::Identity,
        cc_type::LINEAR => ConversionSpec::Linear {
            intercept: val(0),
            slope: val(1),
        },
        cc_type::RATIONAL => ConversionSpec::Rational {
            numer: [val(0), val(1), val(2)],
            denom: [val(3), val(4), val(5)],
        },
        cc_type::ALGEBRAIC => {
            let text = match block.refs.first() {
                Some(&link) => crate::blocks::v4::read_text(reader, link)?.unwrap_or_default(),
                None => String::new(),
            };
            ConversionSpec::Algebraic(text)
        }
        cc_type::TABLE_INTERP | cc_type::TABLE_NEAREST => {
            let pairs = vals.len() / 2;
            let keys = (0..pairs).map(|i| val(2 * i)).collect();
            let values = (0..pairs).map(|i| val(2 * i + 1)).collect();
            if block.cc_type == cc_type::TABLE_INTERP {
                ConversionSpec::TableInterp { keys, values }
            } else {
                ConversionSpec::TableNearest { keys, values }
            }
        }
        cc_type::RANGE_TABLE => {
            // 3n triples plus one trailing default.
            let triples = vals.len().saturating_sub(1) / 3;
            let entries = (0..triples)
                .map(|i| (val(3 * i), val(3 * i + 1), val(3 * i + 2)))
                .collect();
            ConversionSpec::RangeTable {
                entries,
                default: val(3 * triples),
            }
        }
        cc_type::VALUE_TO_TEXT => {
            let n = vals.len().min(block.refs.len().saturating_sub(1));
            let keys = vals[..n].to_vec();
            let targets = block.refs[..n]
                .iter()
                .map(|&link| resolve_target(reader, link, depth))
                .collect::<MdfResult<_>>()?;
            let default = resolve_target(reader, block.refs.get(n).copied().unwrap_or(0), depth)?;
            ConversionSpec::ValueToText {
                keys,
                targets,
                default,
            }
        }
        cc_type::RANGE_TO_TEXT => {
            let n = (vals.len() / 2).min(block.refs.len().saturating_sub(1));
            let ranges = (0..n).map(|i| (val(2 * i), val(2 * i + 1))).collect();
            let targets = block.refs[..n]
                .iter()
                .map(|&link| resolve_target(reader, link, depth))
                .collect::<MdfResult<_>>()?;
            let default = resolve_target(reader, block.refs.get(n).copied().unwrap_or(0), depth)?;
            ConversionSpec::RangeToText {
                ranges,
                targets,
                default,
            }
        }
        cc_type::TEXT_TO_VALUE => ConversionSpec::TextToValue,
        cc_type::TEXT_TO_TEXT => ConversionSpec::TextToText,
        other => {
            warn!("unknown conversion type {other}; values degrade to 0");
            ConversionSpec::TextToValue
        }
    })
}

/// A text/scale ref link resolves to a `##TX` label, a nested `##CC`, or
/// nothing at all.
fn resolve_target<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    link: u64,
    depth: usize,
) -> MdfResult<TextOrScale> {
    let Some(prefix) = reader.read_block_prefix(link)? else {
        return Ok(TextOrScale::None);
    };
    match prefix.tag {
        tag::TEXT | tag::METADATA => {
            let text = crate::blocks::v4::read_text(reader, link)?.unwrap_or_default();
            Ok(TextOrScale::Text(text.into()))
        }
        tag::CONVERSION => match reader.read_block(link, tag::CONVERSION)? {
            Some(raw) => {
                let nested = ConversionBlock::from_raw(&raw)?;
                let spec = spec_from_v4_inner(reader, &nested, depth + 1)?;
                Ok(TextOrScale::Scale(Box::new(spec)))
            }
            None => Ok(TextOrScale::None),
        },
        other => Err(MdfError::BadBlockTag {
            expected: "##TX or ##CC".into(),
            found: other.to_string(),
            offset: link,
        }),
    }
}

/// Map a v3 conversion rule onto the shared spec, resolving any text-range
/// TX links through the reader.
pub fn spec_from_v3<R: Read + Seek>(
    reader: &mut BlockReader<R>,
    conversion: &ConversionV3,
) -> MdfResult<ConversionSpec> {
    Ok(match conversion {
        ConversionV3::Identity => ConversionSpec::Identity,
        ConversionV3::Linear { intercept, slope } => ConversionSpec::Linear {
            slope: *slope,
            intercept: *intercept,
        },
        ConversionV3::TableInterp(pairs) => ConversionSpec::TableInterp {
            keys: pairs.iter().map(|p| p.0).collect(),
            values: pairs.iter().map(|p| p.1).collect(),
        },
        ConversionV3::TableNearest(pairs) => ConversionSpec::TableNearest {
            keys: pairs.iter().map(|p| p.0).collect(),
            values: pairs.iter().map(|p| p.1).collect(),
        },
        ConversionV3::Rational(c) => ConversionSpec::Rational {
            numer: [c[0], c[1], c[2]],
            denom: [c[3], c[4], c[5]],
        },
        ConversionV3::Formula(text) => ConversionSpec::Algebraic(text.clone()),
        ConversionV3::TextTable(entries) => ConversionSpec::ValueToText {
            keys: entries.iter().map(|e| e.0).collect(),
            targets: entries
                .iter()
                .map(|e| TextOrScale::Text(e.1.as_str().into()))
                .collect(),
            default: TextOrScale::None,
        },
        ConversionV3::TextRangeTable(entries) => {
            // First triple is the default; its bounds are ignored.
            let mut default = TextOrScale::None;
            let mut ranges = Vec::new();
            let mut targets = Vec::new();
            for (i, (lo, hi, link)) in entries.iter().enumerate() {
                let text = crate::blocks::v3::read_text_v3(reader, *link)?
                    .unwrap_or_default()
                    .into();
                if i == 0 {
                    default = TextOrScale::Text(text);
                } else {
                    ranges.push((*lo, *hi));
                    targets.push(TextOrScale::Text(text));
                }
            }
            ConversionSpec::RangeToText {
                ranges,
                targets,
                default,
            }
        }
        ConversionV3::Unsupported(_) => ConversionSpec::TextToValue,
    })
}

// ---------------------------------------------------------------------------
// Writing specs back out
// ---------------------------------------------------------------------------

/// One ref slot of a serialized `##CC` block.
#[derive(Debug, Clone, PartialEq)]
pub enum CcRef {
    None,
    Text(String),
    Nested(ConversionSpec),
}

/// Flat description of a `##CC` block for the writer: values array, refs
/// array, and the type tag that explains how they pair up.
#[derive(Debug, Clone, PartialEq)]
pub struct CcLayout {
    pub cc_type: u8,
    pub vals: Vec<f64>,
    pub refs: Vec<CcRef>,
}

impl ConversionSpec {
    /// Serialize into the flat v4 layout. Inverse of [`spec_from_v4`].
    pub fn to_layout(&self) -> MdfResult<CcLayout> {
        Ok(match self {
            ConversionSpec::Identity => CcLayout {
                cc_type: cc_type::IDENTITY,
                vals: vec![],
                refs: vec![],
            },
            ConversionSpec::Linear { slope, intercept } => CcLayout {
                cc_type: cc_type::LINEAR,
                vals: vec![*intercept, *slope],
                refs: vec![],
            },
            ConversionSpec::Rational { numer, denom } => CcLayout {
                cc_type: cc_type::RATIONAL,
                vals: vec![numer[0], numer[1], numer[2], denom[0], denom[1], denom[2]],
                refs: vec![],
            },
            ConversionSpec::Algebraic(text) => CcLayout {
                cc_type: cc_type::ALGEBRAIC,
                vals: vec![],
                refs: vec![CcRef::Text(text.clone())],
            },
            ConversionSpec::TableInterp { keys, values }
            | ConversionSpec::TableNearest { keys, values } => {
                let mut vals = Vec::with_capacity(keys.len() * 2);
                for (k, v) in keys.iter().zip(values) {
                    vals.push(*k);
                    vals.push(*v);
                }
                CcLayout {
                    cc_type: if matches!(self, ConversionSpec::TableInterp { .. }) {
                        cc_type::TABLE_INTERP
                    } else {
                        cc_type::TABLE_NEAREST
                    },
                    vals,
                    refs: vec![],
                }
            }
            ConversionSpec::RangeTable { entries, default } => {
                let mut vals = Vec::with_capacity(entries.len() * 3 + 1);
                for (lo, hi, v) in entries {
                    vals.extend_from_slice(&[*lo, *hi, *v]);
                }
                vals.push(*default);
                CcLayout {
                    cc_type: cc_type::RANGE_TABLE,
                    vals,
                    refs: vec![],
                }
            }
            ConversionSpec::ValueToText {
                keys,
                targets,
                default,
            } => CcLayout {
                cc_type: cc_type::VALUE_TO_TEXT,
                vals: keys.clone(),
                refs: targets
                    .iter()
                    .chain(std::iter::once(default))
                    .map(to_ref)
                    .collect(),
            },
            ConversionSpec::RangeToText {
                ranges,
                targets,
                default,
            } => {
                let mut vals = Vec::with_capacity(ranges.len() * 2);
                for (lo, hi) in ranges {
                    vals.push(*lo);
                    vals.push(*hi);
                }
                CcLayout {
                    cc_type: cc_type::RANGE_TO_TEXT,
                    vals,
                    refs: targets
                        .iter()
                        .chain(std::iter::once(default))
                        .map(to_ref)
                        .collect(),
                }
            }
            ConversionSpec::TextToValue | ConversionSpec::TextToText => {
                return Err(MdfError::UnsupportedConversion(
                    "text-keyed conversions cannot be serialized".into(),
                ))
            }
        })
    }
}

fn to_ref(target: &TextOrScale) -> CcRef {
    match target {
        TextOrScale::None => CcRef::None,
        TextOrScale::Text(t) => CcRef::Text(t.to_string()),
        TextOrScale::Scale(spec) => CcRef::Nested((**spec).clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interp(keys: &[f64], values: &[f64]) -> Converter {
        ConversionSpec::TableInterp {
            keys: keys.to_vec(),
            values: values.to_vec(),
        }
        .compile()
        .unwrap()
    }

    #[test]
    fn linear() {
        let c = ConversionSpec::Linear {
            slope: 2.0,
            intercept: 1.0,
        }
        .compile()
        .unwrap();
        assert_eq!(c.convert_numeric(3.0), 7.0);
    }

    #[test]
    fn rational_quadratic_ratio() {
        // (x^2 + 0x + 0) / (0x^2 + 0x + 2) = x^2 / 2
        let c = ConversionSpec::Rational {
            numer: [1.0, 0.0, 0.0],
            denom: [0.0, 0.0, 2.0],
        }
        .compile()
        .unwrap();
        assert_eq!(c.convert_numeric(4.0), 8.0);
    }

    #[test]
    fn algebraic_compiles_once_and_evaluates() {
        let c = ConversionSpec::Algebraic("(x - 40) / 2".into())
            .compile()
            .unwrap();
        assert_eq!(c.convert_numeric(50.0), 5.0);
    }

    #[test]
    fn interp_table_clamps_and_interpolates() {
        let c = interp(&[0.0, 10.0], &[10.0, 20.0]);
        assert_eq!(c.convert_numeric(5.0), 15.0);
        assert_eq!(c.convert_numeric(-5.0), 10.0);
        assert_eq!(c.convert_numeric(15.0), 20.0);
        // Exact key hit returns the stored value, not an interpolation.
        assert_eq!(c.convert_numeric(0.0), 10.0);
        assert_eq!(c.convert_numeric(10.0), 20.0);
    }

    #[test]
    fn interp_table_is_deterministic() {
        let c = interp(&[0.0, 1.0, 4.0], &[0.0, 100.0, 400.0]);
        let a = c.convert_numeric(2.5);
        let b = c.convert_numeric(2.5);
        assert_eq!(a, b);
        assert_eq!(a, 250.0);
    }

    #[test]
    fn nearest_table_ties_break_low() {
        let c = ConversionSpec::TableNearest {
            keys: vec![0.0, 10.0],
            values: vec![1.0, 2.0],
        }
        .compile()
        .unwrap();
        assert_eq!(c.convert_numeric(4.9), 1.0);
        assert_eq!(c.convert_numeric(5.0), 1.0); // equidistant -> lower
        assert_eq!(c.convert_numeric(5.1), 2.0);
        assert_eq!(c.convert_numeric(-1.0), 1.0);
        assert_eq!(c.convert_numeric(11.0), 2.0);
    }

    #[test]
    fn range_table_scan_and_search_agree() {
        let entries: Vec<(f64, f64, f64)> =
            (0..12).map(|i| (i as f64 * 10.0, i as f64 * 10.0 + 5.0, i as f64)).collect();
        let small = Converter::RangeTable {
            entries: entries[..4].to_vec(),
            default: -1.0,
        };
        let big = Converter::RangeTable {
            entries: entries.clone(),
            default: -1.0,
        };
        for x in [0.0, 5.0, 7.5, 12.0, 35.0, 117.0] {
            if x <= 35.0 {
                assert_eq!(small.convert_numeric(x), big.convert_numeric(x), "x={x}");
            }
        }
        assert_eq!(big.convert_numeric(112.0), 11.0);
        assert_eq!(big.convert_numeric(117.0), -1.0);
    }

    #[test]
    fn value_to_text_exact_match_and_default() {
        let c = ConversionSpec::ValueToText {
            keys: vec![1.0, 2.0],
            targets: vec![
                TextOrScale::Text("on".into()),
                TextOrScale::Scale(Box::new(ConversionSpec::Linear {
                    slope: 10.0,
                    intercept: 0.0,
                })),
            ],
            default: TextOrScale::Text("unknown".into()),
        }
        .compile()
        .unwrap();
        assert_eq!(c.convert(1.0), Converted::Text("on".into()));
        assert_eq!(c.convert(2.0), Converted::Number(20.0));
        assert_eq!(c.convert(3.0), Converted::Text("unknown".into()));
    }

    #[test]
    fn range_to_text_first_match_wins() {
        let c = ConversionSpec::RangeToText {
            ranges: vec![(10.0, 20.0), (0.0, 15.0)],
            targets: vec![
                TextOrScale::Text("high".into()),
                TextOrScale::Text("low".into()),
            ],
            default: TextOrScale::Text("out".into()),
        }
        .compile()
        .unwrap();
        // After sorting by lower bound, [0,15] comes first.
        assert_eq!(c.convert(12.0), Converted::Text("low".into()));
        assert_eq!(c.convert(18.0), Converted::Text("high".into()));
        assert_eq!(c.convert(30.0), Converted::Text("out".into()));
    }

    #[test]
    fn unsupported_kinds_degrade_to_zero() {
        let c = ConversionSpec::TextToValue.compile().unwrap();
        assert_eq!(c.convert_numeric(123.0), 0.0);
        let c = ConversionSpec::TextToText.compile().unwrap();
        assert_eq!(c.convert_numeric(-7.0), 0.0);
    }

    #[test]
    fn text_labels_collects_literals_with_raw_values() {
        let spec = ConversionSpec::ValueToText {
            keys: vec![0.0, 1.0, 2.0],
            targets: vec![
                TextOrScale::Text("off".into()),
                TextOrScale::Text("on".into()),
                TextOrScale::Scale(Box::new(ConversionSpec::Identity)),
            ],
            default: TextOrScale::None,
        };
        let labels = spec.text_labels();
        assert_eq!(labels.len(), 2);
        assert_eq!(&*labels[0].0, "off");
        assert_eq!(labels[0].1, 0.0);
        assert_eq!(labels[1].1, 1.0);
    }

    #[test]
    fn layout_round_trip_for_tables() {
        let spec = ConversionSpec::TableInterp {
            keys: vec![0.0, 10.0],
            values: vec![10.0, 20.0],
        };
        let layout = spec.to_layout().unwrap();
        assert_eq!(layout.cc_type, 4);
        assert_eq!(layout.vals, vec![0.0, 10.0, 10.0, 20.0]);
    }
}

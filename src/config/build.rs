//! Materializes an [`AnalysisConfig`] into an [`A2`]
//!
//! Operators may be listed in any order. They are added as soon as every
//! name they reference exists, which also yields a valid construction order
//! for the rank computation in [`A2Builder`]. References that never resolve
//! are reported as unknown, including reference cycles.

use super::{AnalysisConfig, OperatorConfig, OperatorKindConfig, SourceConfig, SourceKindConfig};
use crate::a2::{A2, MAX_VME_EVENTS};
use crate::builder::A2Builder;
use crate::data_filter::{DataFilter, ListFilter, ListFilterFlags, MultiWordFilter};
use crate::error::{A2Error, Result, ResultExt};
use crate::id::{OperatorId, SourceId};
use crate::operators::{Binning, ExpressionInput, Operator};
use crate::param::{PipeVectors, Thresholds};
use crate::source::{DataSource, DataSourceOptions};
use crate::util::RateSampler;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

/// Parsed form of `name`, `name.N`, `name[i]` or `name.N[i]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PipeRef<'a> {
    name: &'a str,
    output: usize,
    element: Option<usize>,
}

fn bad_reference(s: &str) -> A2Error {
    A2Error::Config(format!("malformed reference '{}'", s))
}

fn parse_ref(s: &str) -> Result<PipeRef<'_>> {
    let s = s.trim();
    let (head, element) = match s.strip_suffix(']').and_then(|r| r.rsplit_once('[')) {
        Some((head, idx)) => {
            let idx = idx.trim().parse::<usize>().map_err(|_| bad_reference(s))?;
            (head, Some(idx))
        }
        None => (s, None),
    };

    let (name, output) = match head.rsplit_once('.') {
        Some((name, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => {
            (name, n.parse::<usize>().map_err(|_| bad_reference(s))?)
        }
        _ => (head, 0),
    };

    if name.is_empty() || name.contains(['[', ']']) {
        return Err(bad_reference(s));
    }
    Ok(PipeRef { name, output, element })
}

/// Every name an operator refers to, gate included.
fn references(op: &OperatorConfig) -> Vec<&str> {
    use OperatorKindConfig::*;

    let mut refs: Vec<&str> = match &op.kind {
        Calibration { input, .. }
        | KeepPrevious { input, .. }
        | Aggregate { input, .. }
        | RangeFilter { input, .. }
        | ScalerOverflow { input }
        | H1d { input, .. }
        | RateMonitor { input, .. }
        | IntervalCondition { input, .. } => vec![input.as_str()],
        Difference { a, b } | BinaryEquation { a, b, .. } => vec![a.as_str(), b.as_str()],
        RectFilter { x, y, .. }
        | H2d { x, y, .. }
        | RectangleCondition { x, y, .. }
        | PolygonCondition { x, y, .. } => vec![x.as_str(), y.as_str()],
        ConditionFilter { data, condition, .. } => vec![data.as_str(), condition.as_str()],
        ArrayMap { inputs, .. } => inputs.iter().map(String::as_str).collect(),
        Expression { inputs, .. } => inputs.iter().map(|i| i.input.as_str()).collect(),
        ExportSink { inputs, condition, .. } => inputs
            .iter()
            .map(String::as_str)
            .chain(condition.as_deref())
            .collect(),
    };
    refs.extend(op.gate.as_deref());
    refs
}

#[derive(Debug, Clone)]
struct Named {
    outputs: Vec<PipeVectors>,
    bits: Option<Range<usize>>,
}

/// A built analysis plus the handles of its named nodes.
#[derive(Debug)]
pub struct Analysis {
    pub a2: A2,
    sources: HashMap<(usize, String), SourceId>,
    operators: HashMap<(usize, String), OperatorId>,
}

impl Analysis {
    pub fn source_id(&self, event: usize, name: &str) -> Option<SourceId> {
        self.sources.get(&(event, name.to_string())).copied()
    }

    pub fn operator_id(&self, event: usize, name: &str) -> Option<OperatorId> {
        self.operators.get(&(event, name.to_string())).copied()
    }

    pub fn into_a2(self) -> A2 {
        self.a2
    }
}

struct ConfigBuilder {
    builder: A2Builder,
    names: Vec<HashMap<String, Named>>,
    base_seed: u64,
    seed_counter: u64,
    sources: HashMap<(usize, String), SourceId>,
    operators: HashMap<(usize, String), OperatorId>,
}

impl ConfigBuilder {
    fn new(config: &AnalysisConfig) -> Self {
        Self {
            builder: A2Builder::new(config.arena_capacity, config.fill_strategy),
            names: (0..MAX_VME_EVENTS).map(|_| HashMap::new()).collect(),
            base_seed: config.rng_seed.unwrap_or_else(rand::random),
            seed_counter: 0,
            sources: HashMap::new(),
            operators: HashMap::new(),
        }
    }

    fn is_known(&self, event: usize, reference: &str) -> bool {
        parse_ref(reference).is_ok_and(|r| self.names[event].contains_key(r.name))
    }

    fn claim_name(&self, event: usize, name: &str) -> Result<()> {
        let plain = matches!(parse_ref(name), Ok(r) if r.name == name && r.element.is_none());
        if !plain {
            return Err(A2Error::Config(format!("invalid node name '{}'", name)));
        }
        if self.names[event].contains_key(name) {
            return Err(A2Error::Config(format!("duplicate name '{}'", name)));
        }
        Ok(())
    }

    fn resolve(&self, event: usize, reference: &str) -> Result<PipeVectors> {
        let r = parse_ref(reference)?;
        let named = self.names[event]
            .get(r.name)
            .ok_or_else(|| A2Error::Config(format!("unknown reference '{}'", r.name)))?;
        let pipe = named.outputs.get(r.output).ok_or_else(|| {
            A2Error::Config(format!(
                "'{}' has no output {} ({} outputs)",
                r.name,
                r.output,
                named.outputs.len()
            ))
        })?;

        match r.element {
            Some(i) => pipe.element(i).ok_or_else(|| {
                A2Error::Config(format!(
                    "index {} out of range in '{}' (size {})",
                    i,
                    reference,
                    pipe.len()
                ))
            }),
            None => Ok(*pipe),
        }
    }

    fn resolve_gate(&self, event: usize, reference: &str) -> Result<usize> {
        let r = parse_ref(reference)?;
        let bits = self.names[event]
            .get(r.name)
            .ok_or_else(|| A2Error::Config(format!("unknown condition '{}'", r.name)))?
            .bits
            .clone()
            .ok_or_else(|| A2Error::Config(format!("'{}' is not a condition", r.name)))?;

        let bit = bits.start + r.element.unwrap_or(0);
        if r.output != 0 || bit >= bits.end {
            return Err(A2Error::Config(format!(
                "condition bit '{}' out of range ({} bits)",
                reference,
                bits.len()
            )));
        }
        Ok(bit)
    }

    fn add_source(&mut self, event: usize, cfg: &SourceConfig) -> Result<()> {
        self.claim_name(event, &cfg.name)?;

        let mut options = DataSourceOptions::empty();
        options.set(DataSourceOptions::NO_ADDED_RANDOM, cfg.no_added_random);
        options.set(
            DataSourceOptions::REPETITION_CONTRIBUTES_LOW_ADDRESS_BITS,
            cfg.repetition_low_address_bits,
        );

        let seed = cfg.seed.unwrap_or_else(|| {
            self.seed_counter += 1;
            self.base_seed.wrapping_add(self.seed_counter)
        });
        let filter_err = |e: A2Error| A2Error::Config(e.to_string());
        let arena = self.builder.arena_mut();

        let source = match &cfg.kind {
            SourceKindConfig::Extractor {
                filters,
                required_completions,
            } => {
                let filter = MultiWordFilter::parse(&filters[..]).map_err(filter_err)?;
                DataSource::extractor(arena, filter, *required_completions, seed, cfg.module, options)?
            }
            SourceKindConfig::ListFilter {
                filters,
                word_count,
                word_size_32,
                reverse_combine,
                repetitions,
            } => {
                let mut flags = ListFilterFlags::empty();
                flags.set(ListFilterFlags::WORD_SIZE_32, *word_size_32);
                flags.set(ListFilterFlags::REVERSE_COMBINE, *reverse_combine);
                let lf = ListFilter::new(flags, *word_count, &filters[..]).map_err(filter_err)?;
                DataSource::listfilter_extractor(arena, lf, *repetitions, seed, cfg.module, options)
                    .map_err(|e| match e {
                        A2Error::ListFilter(_) => filter_err(e),
                        other => other,
                    })?
            }
            SourceKindConfig::MultiHit {
                filter,
                shape,
                max_hits,
            } => {
                let f = DataFilter::parse(filter).map_err(filter_err)?;
                DataSource::multihit_extractor(arena, f, *shape, *max_hits, seed, cfg.module, options)?
            }
        };

        let outputs = source.outputs.clone();
        let id = self.builder.add_source(event, source)?;
        self.names[event].insert(
            cfg.name.clone(),
            Named {
                outputs,
                bits: None,
            },
        );
        self.sources.insert((event, cfg.name.clone()), id);
        Ok(())
    }

    fn make_operator(&mut self, event: usize, cfg: &OperatorConfig) -> Result<Operator> {
        use OperatorKindConfig as K;

        let op = match &cfg.kind {
            K::Calibration {
                input,
                unit_min,
                unit_max,
                per_element,
            } => {
                let input = self.resolve(event, input)?;
                let arena = self.builder.arena_mut();
                if per_element.is_empty() {
                    Operator::calibration(arena, input, *unit_min, *unit_max)?
                } else {
                    Operator::calibration_per_element(arena, input, per_element)?
                }
            }
            K::KeepPrevious { input, keep_valid } => {
                let input = self.resolve(event, input)?;
                Operator::keep_previous(self.builder.arena_mut(), input, *keep_valid)?
            }
            K::Difference { a, b } => {
                let (a, b) = (self.resolve(event, a)?, self.resolve(event, b)?);
                Operator::difference(self.builder.arena_mut(), a, b)?
            }
            K::ArrayMap { inputs, mappings } => {
                let inputs = inputs
                    .iter()
                    .map(|i| self.resolve(event, i))
                    .collect::<Result<Vec<_>>>()?;
                Operator::array_map(self.builder.arena_mut(), inputs, mappings.clone())?
            }
            K::BinaryEquation {
                a,
                b,
                equation,
                output_min,
                output_max,
            } => {
                let (a, b) = (self.resolve(event, a)?, self.resolve(event, b)?);
                Operator::binary_equation(
                    self.builder.arena_mut(),
                    a,
                    b,
                    *equation,
                    *output_min,
                    *output_max,
                )?
            }
            K::Aggregate { input, op, min, max } => {
                let input = self.resolve(event, input)?;
                let t = Thresholds::new(min.unwrap_or(f64::NAN), max.unwrap_or(f64::NAN));
                Operator::aggregate(self.builder.arena_mut(), input, *op, t)?
            }
            K::RangeFilter {
                input,
                min,
                max,
                invert,
            } => {
                let input = self.resolve(event, input)?;
                Operator::range_filter(
                    self.builder.arena_mut(),
                    input,
                    Thresholds::new(*min, *max),
                    *invert,
                )?
            }
            K::RectFilter {
                x,
                y,
                x_range,
                y_range,
                op,
            } => {
                let (x, y) = (self.resolve(event, x)?, self.resolve(event, y)?);
                Operator::rect_filter(
                    self.builder.arena_mut(),
                    x,
                    y,
                    Thresholds::new(x_range.0, x_range.1),
                    Thresholds::new(y_range.0, y_range.1),
                    *op,
                )?
            }
            K::ConditionFilter {
                data,
                condition,
                inverted,
            } => {
                let data = self.resolve(event, data)?;
                let condition = self.resolve(event, condition)?;
                Operator::condition_filter(self.builder.arena_mut(), data, condition, *inverted)?
            }
            K::ScalerOverflow { input } => {
                let input = self.resolve(event, input)?;
                Operator::scaler_overflow(self.builder.arena_mut(), input)?
            }
            K::Expression {
                inputs,
                begin,
                step,
            } => {
                let mut resolved = Vec::with_capacity(inputs.len());
                for i in inputs {
                    let name = match &i.name {
                        Some(n) => n.clone(),
                        None => parse_ref(&i.input)?.name.to_string(),
                    };
                    resolved.push(ExpressionInput {
                        pipe: self.resolve(event, &i.input)?,
                        name,
                        unit: i.unit.clone(),
                    });
                }
                Operator::expression(self.builder.arena_mut(), resolved, begin, step)?
            }
            K::H1d { input, bins, range } => {
                let input = self.resolve(event, input)?;
                let binning = range.map(|(min, max)| Binning::new(min, max));
                Operator::h1d_sink(self.builder.arena_mut(), input, *bins, binning)?
            }
            K::H2d {
                x,
                y,
                x_bins,
                y_bins,
                x_range,
                y_range,
            } => {
                let (x, y) = (self.resolve(event, x)?, self.resolve(event, y)?);
                Operator::h2d_sink(
                    self.builder.arena_mut(),
                    x,
                    y,
                    (*x_bins, *y_bins),
                    x_range.map(|(min, max)| Binning::new(min, max)),
                    y_range.map(|(min, max)| Binning::new(min, max)),
                )?
            }
            K::RateMonitor {
                input,
                mode,
                scale,
                offset,
                history,
            } => {
                let input = self.resolve(event, input)?;
                let samplers = (0..input.len())
                    .map(|_| Arc::new(RateSampler::new(*scale, *offset, *history)))
                    .collect();
                Operator::rate_monitor(self.builder.arena_mut(), input, samplers, *mode)?
            }
            K::ExportSink {
                inputs,
                condition,
                path,
                format,
                compression_level,
            } => {
                let inputs = inputs
                    .iter()
                    .map(|i| self.resolve(event, i))
                    .collect::<Result<Vec<_>>>()?;
                let condition = condition
                    .as_deref()
                    .map(|c| self.resolve(event, c))
                    .transpose()?;
                Operator::export_sink(
                    self.builder.arena_mut(),
                    inputs,
                    condition,
                    path.clone(),
                    *format,
                    *compression_level,
                )?
            }
            K::IntervalCondition { input, intervals } => {
                let input = self.resolve(event, input)?;
                let mut t: Vec<Thresholds> = intervals
                    .iter()
                    .map(|&(min, max)| Thresholds::new(min, max))
                    .collect();
                if t.len() == 1 && input.len() > 1 {
                    t = vec![t[0]; input.len()];
                }
                Operator::interval_condition(self.builder.arena_mut(), input, t)?
            }
            K::RectangleCondition {
                x,
                y,
                x_range,
                y_range,
            } => {
                let (x, y) = (self.resolve(event, x)?, self.resolve(event, y)?);
                Operator::rectangle_condition(
                    self.builder.arena_mut(),
                    x,
                    y,
                    Thresholds::new(x_range.0, x_range.1),
                    Thresholds::new(y_range.0, y_range.1),
                )?
            }
            K::PolygonCondition { x, y, polygon } => {
                let (x, y) = (self.resolve(event, x)?, self.resolve(event, y)?);
                Operator::polygon_condition(self.builder.arena_mut(), x, y, polygon.clone())?
            }
        };

        match &cfg.gate {
            Some(gate) => Ok(op.with_condition(self.resolve_gate(event, gate)?)),
            None => Ok(op),
        }
    }

    fn add_operator(&mut self, event: usize, cfg: &OperatorConfig) -> Result<()> {
        self.claim_name(event, &cfg.name)?;
        let op = self.make_operator(event, cfg)?;
        let id = self.builder.add_operator(event, op)?;

        let named = Named {
            outputs: self
                .builder
                .operator(id)
                .map(|op| op.outputs.clone())
                .unwrap_or_default(),
            bits: self.builder.condition_bits(id),
        };
        self.names[event].insert(cfg.name.clone(), named);
        self.operators.insert((event, cfg.name.clone()), id);
        Ok(())
    }

    /// Add operators in dependency order.
    fn add_operators(&mut self, event: usize, ops: &[OperatorConfig]) -> Result<()> {
        let mut pending: Vec<&OperatorConfig> = ops.iter().collect();

        while !pending.is_empty() {
            let before = pending.len();
            let mut i = 0;
            while i < pending.len() {
                let op = pending[i];
                if references(op).iter().all(|r| self.is_known(event, r)) {
                    self.add_operator(event, op)
                        .with_context(|| format!("event {} operator '{}'", event, op.name))?;
                    pending.remove(i);
                } else {
                    i += 1;
                }
            }

            if pending.len() == before {
                let op = pending[0];
                let missing = references(op)
                    .into_iter()
                    .find(|r| !self.is_known(event, r))
                    .unwrap_or_default();
                return Err(A2Error::Config(format!(
                    "unknown or cyclic reference '{}'",
                    missing
                ))
                .with_context(format!("event {} operator '{}'", event, op.name)));
            }
        }
        Ok(())
    }
}

/// Build the analysis, keeping name to handle mappings.
pub fn build_analysis(config: &AnalysisConfig) -> Result<Analysis> {
    let mut b = ConfigBuilder::new(config);

    for ev in &config.events {
        if ev.index >= MAX_VME_EVENTS {
            return Err(A2Error::Config(format!(
                "event index {} out of range (max {})",
                ev.index, MAX_VME_EVENTS
            )));
        }
        for src in &ev.sources {
            b.add_source(ev.index, src)
                .with_context(|| format!("event {} source '{}'", ev.index, src.name))?;
        }
    }

    for ev in &config.events {
        b.add_operators(ev.index, &ev.operators)?;
    }

    Ok(Analysis {
        a2: b.builder.build(),
        sources: b.sources,
        operators: b.operators,
    })
}

/// Build a runnable [`A2`] from a configuration.
pub fn build_a2(config: &AnalysisConfig) -> Result<A2> {
    build_analysis(config).map(Analysis::into_a2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::HistoFillStrategy;

    const CONFIG: &str = r#"
rng_seed = 1

[[events]]
index = 0

[[events.sources]]
name = "adc"
module = 0
no_added_random = true
type = "extractor"
filters = ["0000 XXXX AAAA XXXX DDDD DDDD DDDD DDDD"]

# listed before its inputs on purpose
[[events.operators]]
name = "h"
type = "h1d"
input = "adc_cal[3]"
bins = 10
range = [0.0, 1000.0]
gate = "in_window[3]"

[[events.operators]]
name = "adc_cal"
type = "calibration"
input = "adc"
unit_min = 0.0
unit_max = 65536.0

[[events.operators]]
name = "adc_sum"
type = "aggregate"
input = "adc_cal"
op = "sum"

[[events.operators]]
name = "in_window"
type = "interval_condition"
input = "adc_cal"
intervals = [[50.0, 200.0]]
"#;

    fn analysis(src: &str) -> Result<Analysis> {
        build_analysis(&AnalysisConfig::from_toml_str(src)?)
    }

    #[test]
    fn test_parse_ref() {
        let r = parse_ref("adc").unwrap();
        assert_eq!((r.name, r.output, r.element), ("adc", 0, None));
        let r = parse_ref("tdc.2[5]").unwrap();
        assert_eq!((r.name, r.output, r.element), ("tdc", 2, Some(5)));
        let r = parse_ref("a.b").unwrap();
        assert_eq!((r.name, r.output), ("a.b", 0));
        assert!(parse_ref("adc[x]").is_err());
        assert!(parse_ref("[1]").is_err());
    }

    #[test]
    fn test_build_and_run() {
        let mut an = analysis(CONFIG).unwrap();
        let cal = an.operator_id(0, "adc_cal").unwrap();
        let sum = an.operator_id(0, "adc_sum").unwrap();
        let h = an.operator_id(0, "h").unwrap();
        assert_eq!(an.a2.operator_rank(cal), Some(1));
        assert_eq!(an.a2.operator_rank(sum), Some(2));
        assert_eq!(an.a2.operator_rank(h), Some(3));
        assert_eq!(an.a2.fill_strategy(), HistoFillStrategy::Direct);

        let a2 = &mut an.a2;
        a2.begin_run();
        a2.begin_event(0);
        a2.process_module_data(0, 0, &[0x0030_0064, 0x0010_000A]);
        a2.end_event(0);

        let out = a2.operator(sum).unwrap().outputs[0];
        assert_eq!(a2.arena().value(out.data, 0), 110.0);
        let histo = a2.h1d_histos().next().unwrap();
        assert_eq!(histo.entry_count, 1.0);
        assert_eq!(a2.arena().value(histo.data, 1), 1.0);
        a2.end_run();
    }

    #[test]
    fn test_duplicate_name() {
        let src = r#"
[[events]]
index = 0
[[events.sources]]
name = "a"
module = 0
type = "multi_hit"
filter = "AAAA DDDD"
shape = "array_per_address"
max_hits = 2
[[events.operators]]
name = "a"
type = "scaler_overflow"
input = "a"
"#;
        let err = analysis(src).unwrap_err();
        assert!(matches!(err.root(), A2Error::Config(m) if m.contains("duplicate")));
    }

    #[test]
    fn test_bad_filter_string() {
        let src = r#"
[[events]]
index = 0
[[events.sources]]
name = "a"
module = 0
type = "extractor"
filters = ["0000 QQQQ"]
"#;
        let err = analysis(src).unwrap_err();
        assert!(matches!(err.root(), A2Error::Config(_)));
        assert!(err.to_string().contains("source 'a'"));
    }

    #[test]
    fn test_unknown_and_cyclic_references() {
        let src = r#"
[[events]]
index = 0
[[events.operators]]
name = "x"
type = "calibration"
input = "y"
unit_min = 0.0
unit_max = 1.0
[[events.operators]]
name = "y"
type = "calibration"
input = "x"
unit_min = 0.0
unit_max = 1.0
"#;
        let err = analysis(src).unwrap_err();
        assert!(matches!(err.root(), A2Error::Config(m) if m.contains("cyclic")));
    }

    #[test]
    fn test_element_out_of_range() {
        let bad = CONFIG.replace("adc_cal[3]", "adc_cal[16]");
        let err = analysis(&bad).unwrap_err();
        assert!(matches!(err.root(), A2Error::Config(m) if m.contains("out of range")));
    }

    #[test]
    fn test_gate_must_be_condition() {
        let bad = CONFIG.replace("in_window[3]", "adc_sum");
        let err = analysis(&bad).unwrap_err();
        assert!(matches!(err.root(), A2Error::Config(m) if m.contains("not a condition")));
    }

    #[test]
    fn test_event_index_out_of_range() {
        let err = analysis("[[events]]\nindex = 12\n").unwrap_err();
        assert!(matches!(err.root(), A2Error::Config(_)));
    }
}

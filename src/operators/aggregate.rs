//! Aggregate operations reducing an array to a single value
//!
//! Only elements that are valid and inside the half-open threshold window
//! contribute. An unset (NaN) threshold bound falls back to the element's
//! declared limit. When nothing contributes the result is invalid, except for
//! [`AggregateOp::Multiplicity`] which yields 0.

use super::{Operator, OperatorKind};
use crate::error::Result;
use crate::memory::Arena;
use crate::param::{invalid_param, is_param_valid, PipeVectors, Thresholds};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Sum,
    Multiplicity,
    Min,
    Max,
    Mean,
    Sigma,
    MinX,
    MaxX,
    MeanX,
    SigmaX,
}

impl AggregateOp {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "aggregate_sum",
            AggregateOp::Multiplicity => "aggregate_multiplicity",
            AggregateOp::Min => "aggregate_min",
            AggregateOp::Max => "aggregate_max",
            AggregateOp::Mean => "aggregate_mean",
            AggregateOp::Sigma => "aggregate_sigma",
            AggregateOp::MinX => "aggregate_minx",
            AggregateOp::MaxX => "aggregate_maxx",
            AggregateOp::MeanX => "aggregate_meanx",
            AggregateOp::SigmaX => "aggregate_sigmax",
        }
    }

    /// Output limits for an input of `size` elements.
    fn output_limits(&self, size: usize, min_lower: f64, max_upper: f64) -> (f64, f64) {
        let size = size as f64;
        match self {
            AggregateOp::Sum => (min_lower, size * max_upper),
            AggregateOp::Multiplicity => (0.0, size),
            AggregateOp::Min | AggregateOp::Max | AggregateOp::Mean => (min_lower, max_upper),
            AggregateOp::Sigma => (0.0, max_upper.sqrt()),
            AggregateOp::MinX | AggregateOp::MaxX | AggregateOp::MeanX => (0.0, size),
            AggregateOp::SigmaX => (0.0, size.sqrt()),
        }
    }
}

#[derive(Debug)]
pub struct Aggregate {
    pub op: AggregateOp,
    pub thresholds: Thresholds,
}

impl Aggregate {
    pub(crate) fn step(&mut self, arena: &Arena, input: &PipeVectors, output: &PipeVectors) {
        let data = arena.get(input.data);
        let lower = arena.get(input.lower_limits);
        let upper = arena.get(input.upper_limits);

        let selected = data.iter().enumerate().filter_map(|(i, c)| {
            let v = c.get();
            let t = self.thresholds.or_limits(lower[i].get(), upper[i].get());
            (is_param_valid(v) && t.contains(v)).then_some((i, v))
        });

        let result = aggregate(self.op, selected);
        arena.get(output.data)[0].set(result);
    }
}

fn aggregate(op: AggregateOp, selected: impl Iterator<Item = (usize, f64)> + Clone) -> f64 {
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut weighted_x = 0.0;
    let mut min: Option<(usize, f64)> = None;
    let mut max: Option<(usize, f64)> = None;

    for (i, v) in selected.clone() {
        count += 1;
        sum += v;
        weighted_x += i as f64 * v;
        if min.map_or(true, |(_, m)| v < m) {
            min = Some((i, v));
        }
        if max.map_or(true, |(_, m)| v > m) {
            max = Some((i, v));
        }
    }

    if op == AggregateOp::Multiplicity {
        return count as f64;
    }
    if count == 0 {
        return invalid_param();
    }

    let n = count as f64;
    match op {
        AggregateOp::Sum => sum,
        AggregateOp::Mean => sum / n,
        AggregateOp::Sigma => {
            let mean = sum / n;
            let var = selected.map(|(_, v)| (v - mean) * (v - mean)).sum::<f64>() / n;
            var.sqrt()
        }
        AggregateOp::Min => min.map_or_else(invalid_param, |(_, v)| v),
        AggregateOp::Max => max.map_or_else(invalid_param, |(_, v)| v),
        AggregateOp::MinX => min.map_or_else(invalid_param, |(i, _)| i as f64),
        AggregateOp::MaxX => max.map_or_else(invalid_param, |(i, _)| i as f64),
        AggregateOp::MeanX | AggregateOp::SigmaX if sum == 0.0 => invalid_param(),
        AggregateOp::MeanX => weighted_x / sum,
        AggregateOp::SigmaX => {
            let mean_x = weighted_x / sum;
            let var = selected
                .map(|(i, v)| v * (i as f64 - mean_x) * (i as f64 - mean_x))
                .sum::<f64>()
                / sum;
            var.sqrt()
        }
        AggregateOp::Multiplicity => count as f64,
    }
}

impl Operator {
    pub fn aggregate(
        arena: &mut Arena,
        input: PipeVectors,
        op: AggregateOp,
        thresholds: Thresholds,
    ) -> Result<Operator> {
        let lowers = arena.values(input.lower_limits);
        let uppers = arena.values(input.upper_limits);
        let min_lower = lowers.iter().copied().fold(f64::INFINITY, f64::min);
        let max_upper = uppers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let (lower, upper) = op.output_limits(input.len(), min_lower, max_upper);

        let output = PipeVectors::push(arena, 1, lower, upper)?;

        Ok(Operator::new(
            OperatorKind::Aggregate(Aggregate { op, thresholds }),
            vec![input],
            vec![output],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{pipe, step};
    use super::*;

    const ONE_TO_TEN: [f64; 10] = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];

    fn run(values: &[f64], op: AggregateOp, thresholds: Thresholds) -> (f64, f64, f64) {
        let mut arena = Arena::new(64 * 1024);
        let input = pipe(&mut arena, values, 0.0, 16.0);
        let mut o = Operator::aggregate(&mut arena, input, op, thresholds).unwrap();
        step(&mut o, &arena);
        (
            arena.value(o.outputs[0].data, 0),
            arena.value(o.outputs[0].lower_limits, 0),
            arena.value(o.outputs[0].upper_limits, 0),
        )
    }

    #[test]
    fn test_sum() {
        let inv = invalid_param();
        let (v, lo, hi) = run(&[1.0, 2.0, inv, 4.0], AggregateOp::Sum, Thresholds::unbounded());
        assert_eq!(v, 7.0);
        assert_eq!(lo, 0.0);
        assert_eq!(hi, 64.0);

        let (v, _, _) = run(&[inv, inv], AggregateOp::Sum, Thresholds::unbounded());
        assert!(!is_param_valid(v));
    }

    #[test]
    fn test_multiplicity() {
        let inv = invalid_param();
        let (v, lo, hi) = run(&[1.0, inv, 3.0], AggregateOp::Multiplicity, Thresholds::unbounded());
        assert_eq!((v, lo, hi), (2.0, 0.0, 3.0));

        let (v, _, _) = run(&[inv, inv], AggregateOp::Multiplicity, Thresholds::unbounded());
        assert_eq!(v, 0.0);
    }

    #[test]
    fn test_mean_and_sigma() {
        let (mean, _, _) = run(&ONE_TO_TEN, AggregateOp::Mean, Thresholds::unbounded());
        assert_eq!(mean, 5.5);

        let (sigma, lo, hi) = run(&ONE_TO_TEN, AggregateOp::Sigma, Thresholds::unbounded());
        assert!((sigma - 2.872281323269).abs() < 1e-9);
        assert_eq!(lo, 0.0);
        assert_eq!(hi, 4.0);
    }

    #[test]
    fn test_min_max() {
        let values = [4.0, 1.0, 9.0, 1.0, 9.0];
        assert_eq!(run(&values, AggregateOp::Min, Thresholds::unbounded()).0, 1.0);
        assert_eq!(run(&values, AggregateOp::Max, Thresholds::unbounded()).0, 9.0);
        // ties keep the first index
        assert_eq!(run(&values, AggregateOp::MinX, Thresholds::unbounded()).0, 1.0);
        assert_eq!(run(&values, AggregateOp::MaxX, Thresholds::unbounded()).0, 2.0);
    }

    #[test]
    fn test_thresholds_are_half_open() {
        let t = Thresholds::new(2.0, 4.0);
        assert_eq!(run(&[1.0, 2.0, 3.0, 4.0], AggregateOp::Sum, t).0, 5.0);
        assert_eq!(run(&[1.0, 2.0, 3.0, 4.0], AggregateOp::Multiplicity, t).0, 2.0);
        assert!(!is_param_valid(run(&[1.0, 4.0], AggregateOp::Max, t).0));
    }

    #[test]
    fn test_unbounded_thresholds_use_limits() {
        // 16.0 is the declared upper limit and therefore excluded
        let (v, _, _) = run(&[1.0, 16.0, 2.0], AggregateOp::Sum, Thresholds::unbounded());
        assert_eq!(v, 3.0);
    }

    #[test]
    fn test_mean_x_and_sigma_x() {
        let values = [0.0, 1.0, 0.0, 1.0];
        let (mean_x, lo, hi) = run(&values, AggregateOp::MeanX, Thresholds::unbounded());
        assert_eq!((mean_x, lo, hi), (2.0, 0.0, 4.0));

        let (sigma_x, _, hi) = run(&values, AggregateOp::SigmaX, Thresholds::unbounded());
        assert_eq!(sigma_x, 1.0);
        assert_eq!(hi, 2.0);

        let (v, _, _) = run(&[0.0, 0.0], AggregateOp::MeanX, Thresholds::unbounded());
        assert!(!is_param_valid(v));
    }
}

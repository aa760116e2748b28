//! Element-wise arithmetic operators
//!
//! Calibration, KeepPrevious, Difference, ArrayMap, BinaryEquation and
//! ScalerOverflow. All of them map invalid inputs to invalid outputs.

use super::{Operator, OperatorKind};
use crate::error::{A2Error, Result};
use crate::memory::Arena;
use crate::param::{fill, invalid_param, invalidate_all, is_param_valid, ParamVec, PipeVectors};
use serde::{Deserialize, Serialize};

fn check_same_size(a: &PipeVectors, b: &PipeVectors, what: &str) -> Result<()> {
    if a.len() != b.len() {
        return Err(A2Error::Build(format!(
            "{}: input sizes differ ({} vs {})",
            what,
            a.len(),
            b.len()
        )));
    }
    Ok(())
}

// Calibration

/// Linear rescale of each element from its input limits to `[unit_min, unit_max)`.
#[derive(Debug)]
pub struct Calibration {
    factors: ParamVec,
}

#[inline]
fn calibrate(param: f64, param_min: f64, calib_min: f64, calib_factor: f64) -> f64 {
    if is_param_valid(param) {
        (param - param_min) * calib_factor + calib_min
    } else {
        param
    }
}

impl Calibration {
    pub fn factors(&self) -> ParamVec {
        self.factors
    }

    pub(crate) fn step(&mut self, arena: &Arena, input: &PipeVectors, output: &PipeVectors) {
        let inp = arena.get(input.data);
        let in_lower = arena.get(input.lower_limits);
        let out = arena.get(output.data);
        let out_lower = arena.get(output.lower_limits);
        let factors = arena.get(self.factors);

        for i in 0..inp.len() {
            out[i].set(calibrate(
                inp[i].get(),
                in_lower[i].get(),
                out_lower[i].get(),
                factors[i].get(),
            ));
        }
    }
}

impl Operator {
    /// Calibrate every element of `input` to the same unit range.
    pub fn calibration(
        arena: &mut Arena,
        input: PipeVectors,
        unit_min: f64,
        unit_max: f64,
    ) -> Result<Operator> {
        let limits = vec![(unit_min, unit_max); input.len()];
        Self::calibration_per_element(arena, input, &limits)
    }

    /// Calibrate each element to its own `(unit_min, unit_max)` range.
    pub fn calibration_per_element(
        arena: &mut Arena,
        input: PipeVectors,
        unit_limits: &[(f64, f64)],
    ) -> Result<Operator> {
        if unit_limits.len() != input.len() {
            return Err(A2Error::Build(format!(
                "calibration: {} unit ranges for {} elements",
                unit_limits.len(),
                input.len()
            )));
        }

        let output = PipeVectors::push(arena, input.len(), 0.0, 0.0)?;
        let factors = arena.push_param_vector(input.len())?;

        let in_lower = arena.values(input.lower_limits);
        let in_upper = arena.values(input.upper_limits);
        let out_lower = arena.get(output.lower_limits);
        let out_upper = arena.get(output.upper_limits);
        let f = arena.get(factors);

        for (i, &(unit_min, unit_max)) in unit_limits.iter().enumerate() {
            out_lower[i].set(unit_min);
            out_upper[i].set(unit_max);
            f[i].set((unit_max - unit_min) / (in_upper[i] - in_lower[i]));
        }

        Ok(Operator::new(
            OperatorKind::Calibration(Calibration { factors }),
            vec![input],
            vec![output],
        ))
    }
}

// KeepPrevious

/// Outputs the input of the previous event.
#[derive(Debug)]
pub struct KeepPrevious {
    previous: ParamVec,
    keep_valid: bool,
}

impl KeepPrevious {
    pub fn keep_valid(&self) -> bool {
        self.keep_valid
    }

    pub(crate) fn begin_run(&mut self, arena: &Arena) {
        invalidate_all(arena.get(self.previous));
    }

    pub(crate) fn step(&mut self, arena: &Arena, input: &PipeVectors, output: &PipeVectors) {
        let inp = arena.get(input.data);
        let out = arena.get(output.data);
        let prev = arena.get(self.previous);

        for i in 0..inp.len() {
            out[i].set(prev[i].get());
        }

        for i in 0..inp.len() {
            let v = inp[i].get();
            if !self.keep_valid || is_param_valid(v) {
                prev[i].set(v);
            }
        }
    }
}

impl Operator {
    pub fn keep_previous(arena: &mut Arena, input: PipeVectors, keep_valid: bool) -> Result<Operator> {
        let previous = arena.push_param_vector_filled(input.len(), invalid_param())?;
        let output = PipeVectors::push(arena, input.len(), 0.0, 0.0)?;
        copy_limits(arena, &input, &output);

        Ok(Operator::new(
            OperatorKind::KeepPrevious(KeepPrevious {
                previous,
                keep_valid,
            }),
            vec![input],
            vec![output],
        ))
    }
}

fn copy_limits(arena: &Arena, from: &PipeVectors, to: &PipeVectors) {
    arena.copy_from(to.lower_limits, &arena.values(from.lower_limits));
    arena.copy_from(to.upper_limits, &arena.values(from.upper_limits));
}

// Difference

pub(crate) fn difference_step(arena: &Arena, inputs: &[PipeVectors], output: &PipeVectors) {
    let a = arena.get(inputs[0].data);
    let b = arena.get(inputs[1].data);
    let out = arena.get(output.data);

    for i in 0..out.len() {
        let (va, vb) = (a[i].get(), b[i].get());
        if is_param_valid(va) && is_param_valid(vb) {
            out[i].set(va - vb);
        } else {
            out[i].set(invalid_param());
        }
    }
}

impl Operator {
    /// Element-wise `a - b`.
    pub fn difference(arena: &mut Arena, a: PipeVectors, b: PipeVectors) -> Result<Operator> {
        check_same_size(&a, &b, "difference")?;

        let output = PipeVectors::push(arena, a.len(), 0.0, 0.0)?;
        for i in 0..a.len() {
            let lower = arena.value(a.lower_limits, i) - arena.value(b.upper_limits, i);
            let upper = arena.value(a.upper_limits, i) - arena.value(b.lower_limits, i);
            arena.get(output.lower_limits)[i].set(lower);
            arena.get(output.upper_limits)[i].set(upper);
        }

        Ok(Operator::new(OperatorKind::Difference, vec![a, b], vec![output]))
    }
}

// ArrayMap

/// Source element of one output element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMapping {
    pub input_index: usize,
    pub param_index: usize,
}

/// Re-index and concatenate elements of several inputs into one output.
#[derive(Debug)]
pub struct ArrayMap {
    mappings: Vec<ArrayMapping>,
}

impl ArrayMap {
    pub fn mappings(&self) -> &[ArrayMapping] {
        &self.mappings
    }

    pub(crate) fn step(&mut self, arena: &Arena, inputs: &[PipeVectors], output: &PipeVectors) {
        let out = arena.get(output.data);

        for (cell, m) in out.iter().zip(&self.mappings) {
            let v = inputs
                .get(m.input_index)
                .and_then(|pipe| arena.get(pipe.data).get(m.param_index))
                .map_or_else(invalid_param, |c| c.get());
            cell.set(v);
        }
    }
}

impl Operator {
    pub fn array_map(
        arena: &mut Arena,
        inputs: Vec<PipeVectors>,
        mappings: Vec<ArrayMapping>,
    ) -> Result<Operator> {
        let output = PipeVectors::push(arena, mappings.len(), 0.0, 0.0)?;

        for (i, m) in mappings.iter().enumerate() {
            let limits = inputs.get(m.input_index).and_then(|pipe| {
                (m.param_index < pipe.len()).then(|| {
                    (
                        arena.value(pipe.lower_limits, m.param_index),
                        arena.value(pipe.upper_limits, m.param_index),
                    )
                })
            });
            if let Some((lower, upper)) = limits {
                arena.get(output.lower_limits)[i].set(lower);
                arena.get(output.upper_limits)[i].set(upper);
            }
        }

        Ok(Operator::new(
            OperatorKind::ArrayMap(ArrayMap { mappings }),
            inputs,
            vec![output],
        ))
    }
}

// BinaryEquation

/// The fixed table of two-operand equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryEquationKind {
    Sum,
    Difference,
    SumOverDifference,
    DifferenceOverSum,
    AOverDifference,
    DifferenceOverA,
    Product,
    Quotient,
}

/// Equation table in index order.
pub const BINARY_EQUATIONS: [BinaryEquationKind; 8] = [
    BinaryEquationKind::Sum,
    BinaryEquationKind::Difference,
    BinaryEquationKind::SumOverDifference,
    BinaryEquationKind::DifferenceOverSum,
    BinaryEquationKind::AOverDifference,
    BinaryEquationKind::DifferenceOverA,
    BinaryEquationKind::Product,
    BinaryEquationKind::Quotient,
];

impl BinaryEquationKind {
    pub fn from_index(index: usize) -> Option<Self> {
        BINARY_EQUATIONS.get(index).copied()
    }

    pub fn expression(&self) -> &'static str {
        match self {
            BinaryEquationKind::Sum => "a + b",
            BinaryEquationKind::Difference => "a - b",
            BinaryEquationKind::SumOverDifference => "(a + b) / (a - b)",
            BinaryEquationKind::DifferenceOverSum => "(a - b) / (a + b)",
            BinaryEquationKind::AOverDifference => "a / (a - b)",
            BinaryEquationKind::DifferenceOverA => "(a - b) / a",
            BinaryEquationKind::Product => "a * b",
            BinaryEquationKind::Quotient => "a / b",
        }
    }

    /// Evaluate for two valid operands. `None` when the divisor is zero.
    #[inline]
    pub fn apply(&self, a: f64, b: f64) -> Option<f64> {
        let div = |n: f64, d: f64| (d != 0.0).then(|| n / d);
        match self {
            BinaryEquationKind::Sum => Some(a + b),
            BinaryEquationKind::Difference => Some(a - b),
            BinaryEquationKind::SumOverDifference => div(a + b, a - b),
            BinaryEquationKind::DifferenceOverSum => div(a - b, a + b),
            BinaryEquationKind::AOverDifference => div(a, a - b),
            BinaryEquationKind::DifferenceOverA => div(a - b, a),
            BinaryEquationKind::Product => Some(a * b),
            BinaryEquationKind::Quotient => div(a, b),
        }
    }
}

#[derive(Debug)]
pub struct BinaryEquation {
    pub kind: BinaryEquationKind,
}

impl BinaryEquation {
    pub(crate) fn step(&mut self, arena: &Arena, inputs: &[PipeVectors], output: &PipeVectors) {
        let a = arena.get(inputs[0].data);
        let b = arena.get(inputs[1].data);
        let out = arena.get(output.data);

        for i in 0..out.len() {
            let (va, vb) = (a[i].get(), b[i].get());
            let result = if is_param_valid(va) && is_param_valid(vb) {
                self.kind.apply(va, vb)
            } else {
                None
            };
            out[i].set(result.unwrap_or_else(invalid_param));
        }
    }
}

impl Operator {
    pub fn binary_equation(
        arena: &mut Arena,
        a: PipeVectors,
        b: PipeVectors,
        kind: BinaryEquationKind,
        output_lower: f64,
        output_upper: f64,
    ) -> Result<Operator> {
        check_same_size(&a, &b, "binary equation")?;
        let output = PipeVectors::push(arena, a.len(), output_lower, output_upper)?;

        Ok(Operator::new(
            OperatorKind::BinaryEquation(BinaryEquation { kind }),
            vec![a, b],
            vec![output],
        ))
    }
}

// ScalerOverflow

/// Unwraps hardware counters that wrap around at their upper limit.
#[derive(Debug)]
pub struct ScalerOverflow {
    last_value: ParamVec,
    overflow_count: ParamVec,
}

impl ScalerOverflow {
    pub fn overflow_count(&self, arena: &Arena, index: usize) -> f64 {
        arena.value(self.overflow_count, index)
    }

    pub(crate) fn begin_run(&mut self, arena: &Arena) {
        invalidate_all(arena.get(self.last_value));
        fill(arena.get(self.overflow_count), 0.0);
    }

    pub(crate) fn step(&mut self, arena: &Arena, input: &PipeVectors, output: &PipeVectors) {
        let inp = arena.get(input.data);
        let upper = arena.get(input.upper_limits);
        let out = arena.get(output.data);
        let last = arena.get(self.last_value);
        let overflows = arena.get(self.overflow_count);

        for i in 0..inp.len() {
            let value = inp[i].get();
            if !is_param_valid(value) {
                out[i].set(invalid_param());
                continue;
            }

            let prev = last[i].get();
            if is_param_valid(prev) && value < prev {
                overflows[i].set(overflows[i].get() + 1.0);
            }
            last[i].set(value);
            out[i].set(value + overflows[i].get() * upper[i].get());
        }
    }
}

impl Operator {
    pub fn scaler_overflow(arena: &mut Arena, input: PipeVectors) -> Result<Operator> {
        let last_value = arena.push_param_vector_filled(input.len(), invalid_param())?;
        let overflow_count = arena.push_param_vector(input.len())?;
        let output = PipeVectors::push(arena, input.len(), 0.0, f64::MAX)?;
        arena.copy_from(output.lower_limits, &arena.values(input.lower_limits));

        Ok(Operator::new(
            OperatorKind::ScalerOverflow(ScalerOverflow {
                last_value,
                overflow_count,
            }),
            vec![input],
            vec![output],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{pipe, step};
    use super::*;

    #[test]
    fn test_calibration_maps_to_unit_range() {
        let mut arena = Arena::new(64 * 1024);
        let input = pipe(&mut arena, &[10.0, 0.0, invalid_param()], 0.0, 20.0);
        let mut op = Operator::calibration(&mut arena, input, 0.0, 100.0).unwrap();
        step(&mut op, &arena);

        let out = arena.values(op.outputs[0].data);
        assert_eq!(out[0], 50.0);
        assert_eq!(out[1], 0.0);
        assert!(!is_param_valid(out[2]));
        assert_eq!(arena.value(op.outputs[0].lower_limits, 0), 0.0);
        assert_eq!(arena.value(op.outputs[0].upper_limits, 0), 100.0);
    }

    #[test]
    fn test_calibration_per_element() {
        let mut arena = Arena::new(64 * 1024);
        let input = pipe(&mut arena, &[5.0, 5.0], 0.0, 10.0);
        let mut op =
            Operator::calibration_per_element(&mut arena, input, &[(0.0, 1.0), (10.0, 30.0)])
                .unwrap();
        step(&mut op, &arena);
        assert_eq!(arena.values(op.outputs[0].data), vec![0.5, 20.0]);

        assert!(Operator::calibration_per_element(&mut arena, input, &[(0.0, 1.0)]).is_err());
    }

    #[test]
    fn test_keep_previous() {
        let mut arena = Arena::new(64 * 1024);
        let input = pipe(&mut arena, &[1.0, 2.0], 0.0, 10.0);
        let mut op = Operator::keep_previous(&mut arena, input, true).unwrap();

        step(&mut op, &arena);
        assert!(arena.values(op.outputs[0].data).iter().all(|v| !is_param_valid(*v)));

        arena.copy_from(input.data, &[3.0, invalid_param()]);
        step(&mut op, &arena);
        assert_eq!(arena.values(op.outputs[0].data), vec![1.0, 2.0]);

        arena.copy_from(input.data, &[4.0, 5.0]);
        step(&mut op, &arena);
        // invalid input was not remembered
        assert_eq!(arena.values(op.outputs[0].data), vec![3.0, 2.0]);
    }

    #[test]
    fn test_keep_previous_remembers_invalid() {
        let mut arena = Arena::new(64 * 1024);
        let input = pipe(&mut arena, &[invalid_param()], 0.0, 10.0);
        let mut op = Operator::keep_previous(&mut arena, input, false).unwrap();
        arena.copy_from(input.data, &[1.0]);
        step(&mut op, &arena);
        arena.copy_from(input.data, &[invalid_param()]);
        step(&mut op, &arena);
        arena.copy_from(input.data, &[2.0]);
        step(&mut op, &arena);
        assert!(!is_param_valid(arena.value(op.outputs[0].data, 0)));
    }

    #[test]
    fn test_difference() {
        let mut arena = Arena::new(64 * 1024);
        let a = pipe(&mut arena, &[10.0, 4.0, invalid_param()], 0.0, 20.0);
        let b = pipe(&mut arena, &[3.0, invalid_param(), 1.0], 5.0, 8.0);
        let mut op = Operator::difference(&mut arena, a, b).unwrap();
        step(&mut op, &arena);

        let out = arena.values(op.outputs[0].data);
        assert_eq!(out[0], 7.0);
        assert!(!is_param_valid(out[1]));
        assert!(!is_param_valid(out[2]));
        assert_eq!(arena.value(op.outputs[0].lower_limits, 0), -8.0);
        assert_eq!(arena.value(op.outputs[0].upper_limits, 0), 15.0);
    }

    #[test]
    fn test_difference_size_mismatch() {
        let mut arena = Arena::new(64 * 1024);
        let a = pipe(&mut arena, &[1.0, 2.0], 0.0, 20.0);
        let b = pipe(&mut arena, &[1.0], 0.0, 20.0);
        assert!(matches!(
            Operator::difference(&mut arena, a, b),
            Err(A2Error::Build(_))
        ));
    }

    #[test]
    fn test_difference_of_element_views() {
        let mut arena = Arena::new(64 * 1024);
        let a = pipe(&mut arena, &[10.0, 20.0], 0.0, 32.0);
        let b = pipe(&mut arena, &[1.0, 2.0, 3.0], 0.0, 32.0);
        let mut op =
            Operator::difference(&mut arena, a.element(1).unwrap(), b.element(2).unwrap()).unwrap();
        step(&mut op, &arena);
        assert_eq!(arena.values(op.outputs[0].data), vec![17.0]);
    }

    #[test]
    fn test_array_map() {
        let mut arena = Arena::new(64 * 1024);
        let a = pipe(&mut arena, &[1.0, 2.0], 0.0, 10.0);
        let b = pipe(&mut arena, &[3.0, 4.0], 0.0, 50.0);
        let mappings = vec![
            ArrayMapping { input_index: 1, param_index: 1 },
            ArrayMapping { input_index: 0, param_index: 0 },
            ArrayMapping { input_index: 0, param_index: 7 },
            ArrayMapping { input_index: 5, param_index: 0 },
        ];
        let mut op = Operator::array_map(&mut arena, vec![a, b], mappings).unwrap();
        step(&mut op, &arena);

        let out = arena.values(op.outputs[0].data);
        assert_eq!(out[..2], [4.0, 1.0]);
        assert!(!is_param_valid(out[2]));
        assert!(!is_param_valid(out[3]));
        assert_eq!(arena.value(op.outputs[0].upper_limits, 0), 50.0);
        assert_eq!(arena.value(op.outputs[0].upper_limits, 1), 10.0);
    }

    #[test]
    fn test_binary_equation_table() {
        use BinaryEquationKind::*;
        assert_eq!(Sum.apply(3.0, 1.0), Some(4.0));
        assert_eq!(Difference.apply(3.0, 1.0), Some(2.0));
        assert_eq!(SumOverDifference.apply(3.0, 1.0), Some(2.0));
        assert_eq!(DifferenceOverSum.apply(3.0, 1.0), Some(0.5));
        assert_eq!(AOverDifference.apply(3.0, 1.0), Some(1.5));
        assert_eq!(DifferenceOverA.apply(4.0, 1.0), Some(0.75));
        assert_eq!(Product.apply(3.0, 2.0), Some(6.0));
        assert_eq!(Quotient.apply(3.0, 2.0), Some(1.5));

        assert_eq!(SumOverDifference.apply(2.0, 2.0), None);
        assert_eq!(DifferenceOverSum.apply(2.0, -2.0), None);
        assert_eq!(DifferenceOverA.apply(0.0, 1.0), None);
        assert_eq!(Quotient.apply(1.0, 0.0), None);

        assert_eq!(BinaryEquationKind::from_index(6), Some(Product));
        assert_eq!(BinaryEquationKind::from_index(8), None);
    }

    #[test]
    fn test_binary_equation_step() {
        let mut arena = Arena::new(64 * 1024);
        let a = pipe(&mut arena, &[6.0, 1.0, invalid_param()], 0.0, 10.0);
        let b = pipe(&mut arena, &[2.0, 0.0, 1.0], 0.0, 10.0);
        let mut op =
            Operator::binary_equation(&mut arena, a, b, BinaryEquationKind::Quotient, 0.0, 10.0)
                .unwrap();
        step(&mut op, &arena);

        let out = arena.values(op.outputs[0].data);
        assert_eq!(out[0], 3.0);
        assert!(!is_param_valid(out[1]));
        assert!(!is_param_valid(out[2]));
    }

    #[test]
    fn test_scaler_overflow() {
        let mut arena = Arena::new(64 * 1024);
        let input = pipe(&mut arena, &[100.0], 0.0, 1000.0);
        let mut op = Operator::scaler_overflow(&mut arena, input).unwrap();

        let mut outputs = Vec::new();
        for v in [100.0, 900.0, 50.0, invalid_param(), 30.0, 700.0] {
            arena.copy_from(input.data, &[v]);
            step(&mut op, &arena);
            outputs.push(arena.value(op.outputs[0].data, 0));
        }

        assert_eq!(outputs[..3], [100.0, 900.0, 1050.0]);
        assert!(!is_param_valid(outputs[3]));
        assert_eq!(outputs[4..], [2030.0, 2700.0]);
        assert_eq!(arena.value(op.outputs[0].upper_limits, 0), f64::MAX);

        op.begin_run(&arena);
        if let OperatorKind::ScalerOverflow(s) = &op.kind {
            assert_eq!(s.overflow_count(&arena, 0), 0.0);
        }
    }
}

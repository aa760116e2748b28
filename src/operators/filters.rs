//! Pass-through filters: RangeFilter, RectFilter and ConditionFilter

use super::{Operator, OperatorKind};
use crate::error::{A2Error, Result};
use crate::memory::Arena;
use crate::param::{invalid_param, is_param_valid, PipeVectors, Thresholds};
use serde::{Deserialize, Serialize};

fn copy_limits(arena: &Arena, from: &PipeVectors, to: &PipeVectors) {
    arena.copy_from(to.lower_limits, &arena.values(from.lower_limits));
    arena.copy_from(to.upper_limits, &arena.values(from.upper_limits));
}

/// Keeps values inside `[min, max)`, or outside of it when inverted.
#[derive(Debug)]
pub struct RangeFilter {
    pub thresholds: Thresholds,
    pub invert: bool,
}

impl RangeFilter {
    pub(crate) fn step(&mut self, arena: &Arena, input: &PipeVectors, output: &PipeVectors) {
        let inp = arena.get(input.data);
        let out = arena.get(output.data);

        for (o, i) in out.iter().zip(inp) {
            let v = i.get();
            let keep = is_param_valid(v) && (self.thresholds.contains(v) != self.invert);
            o.set(if keep { v } else { invalid_param() });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RectFilterOp {
    And,
    Or,
}

/// Two interval tests on a pair of scalars, combined with AND or OR.
/// Outputs `1.0` when the combined test passes, invalid otherwise.
#[derive(Debug)]
pub struct RectFilter {
    pub x: Thresholds,
    pub y: Thresholds,
    pub op: RectFilterOp,
}

impl RectFilter {
    pub(crate) fn step(&mut self, arena: &Arena, inputs: &[PipeVectors], output: &PipeVectors) {
        let x = arena.value(inputs[0].data, 0);
        let y = arena.value(inputs[1].data, 0);

        let x_in = is_param_valid(x) && self.x.contains(x);
        let y_in = is_param_valid(y) && self.y.contains(y);

        let pass = match self.op {
            RectFilterOp::And => x_in && y_in,
            RectFilterOp::Or => x_in || y_in,
        };

        arena.get(output.data)[0].set(if pass { 1.0 } else { invalid_param() });
    }
}

/// Passes data through while the paired condition value is valid.
///
/// A one-element condition gates the whole array, a condition of the same
/// size as the data gates element by element.
#[derive(Debug)]
pub struct ConditionFilter {
    pub inverted: bool,
}

impl ConditionFilter {
    pub(crate) fn step(&mut self, arena: &Arena, inputs: &[PipeVectors], output: &PipeVectors) {
        let data = arena.get(inputs[0].data);
        let cond = arena.get(inputs[1].data);
        let out = arena.get(output.data);

        let passes = |c: f64| is_param_valid(c) != self.inverted;

        if cond.len() == data.len() {
            for i in 0..data.len() {
                let v = if passes(cond[i].get()) {
                    data[i].get()
                } else {
                    invalid_param()
                };
                out[i].set(v);
            }
        } else if passes(cond[0].get()) {
            for (o, d) in out.iter().zip(data) {
                o.set(d.get());
            }
        } else {
            for o in out {
                o.set(invalid_param());
            }
        }
    }
}

impl Operator {
    pub fn range_filter(
        arena: &mut Arena,
        input: PipeVectors,
        thresholds: Thresholds,
        invert: bool,
    ) -> Result<Operator> {
        let output = PipeVectors::push(arena, input.len(), 0.0, 0.0)?;
        copy_limits(arena, &input, &output);

        Ok(Operator::new(
            OperatorKind::RangeFilter(RangeFilter { thresholds, invert }),
            vec![input],
            vec![output],
        ))
    }

    pub fn rect_filter(
        arena: &mut Arena,
        x_input: PipeVectors,
        y_input: PipeVectors,
        x: Thresholds,
        y: Thresholds,
        op: RectFilterOp,
    ) -> Result<Operator> {
        if x_input.len() != 1 || y_input.len() != 1 {
            return Err(A2Error::Build(
                "rect filter inputs must be single parameters".into(),
            ));
        }
        let output = PipeVectors::push(arena, 1, 0.0, 2.0)?;

        Ok(Operator::new(
            OperatorKind::RectFilter(RectFilter { x, y, op }),
            vec![x_input, y_input],
            vec![output],
        ))
    }

    pub fn condition_filter(
        arena: &mut Arena,
        data: PipeVectors,
        condition: PipeVectors,
        inverted: bool,
    ) -> Result<Operator> {
        if condition.len() != 1 && condition.len() != data.len() {
            return Err(A2Error::Build(format!(
                "condition filter: condition size {} does not match data size {}",
                condition.len(),
                data.len()
            )));
        }

        let output = PipeVectors::push(arena, data.len(), 0.0, 0.0)?;
        copy_limits(arena, &data, &output);

        Ok(Operator::new(
            OperatorKind::ConditionFilter(ConditionFilter { inverted }),
            vec![data, condition],
            vec![output],
        ))
    }
}

//! Operator graph nodes
//!
//! Operators read one or more input pipes (views into upstream arena
//! storage), and write their own output pipes, condition bits or sink
//! state. The catalog is closed: [`OperatorKind`] is a plain enum and
//! [`Operator::step`] dispatches with a single `match`, so the compiler can
//! inline each arm on the per-event hot path.
//!
//! ```text
//!   DataSource outputs ──► Calibration ──► Aggregate ──► H1DSink
//!                     ├──► IntervalCondition ─(bit)─┐
//!                     └──► Difference ───────────────┴─► ExportSink (gated)
//! ```
//!
//! Construction happens once per run through the `Operator::*` constructors
//! defined next to each kind. They allocate outputs and scratch vectors from
//! the run's arena. Stepping never allocates from the arena.

pub mod aggregate;
pub mod basic;
pub mod condition;
pub mod export;
pub mod expression;
pub mod filters;
pub mod histo;
pub mod rate;

pub use aggregate::{Aggregate, AggregateOp};
pub use basic::{
    ArrayMap, ArrayMapping, BinaryEquation, BinaryEquationKind, Calibration, KeepPrevious,
    ScalerOverflow,
};
pub use condition::{
    ConditionBits, IntervalCondition, PolygonCondition, RectangleCondition,
};
pub use export::{ExportFormat, ExportSink};
pub use expression::{ExpressionInput, ExpressionOperator, ExpressionOutput};
pub use filters::{ConditionFilter, RangeFilter, RectFilter, RectFilterOp};
pub use histo::{
    write_histo, write_histo_list, Binning, H1DSink, H2DSink, HistoFillStrategy, HistoFiller,
    H1D, H2D,
};
pub use rate::{RateMonitor, RateMonitorType};

use crate::memory::Arena;
use crate::param::{invalidate_all, PipeVectors};

/// Mutable state shared by all operators of an event while stepping.
pub struct StepContext<'a> {
    pub arena: &'a Arena,
    pub conditions: &'a mut ConditionBits,
    pub filler: &'a mut HistoFiller,
}

/// Per-kind operator state.
#[derive(Debug)]
pub enum OperatorKind {
    Calibration(Calibration),
    KeepPrevious(KeepPrevious),
    Difference,
    ArrayMap(ArrayMap),
    BinaryEquation(BinaryEquation),
    Aggregate(Aggregate),
    RangeFilter(RangeFilter),
    RectFilter(RectFilter),
    ConditionFilter(ConditionFilter),
    ScalerOverflow(ScalerOverflow),
    Expression(Box<ExpressionOperator>),
    H1DSink(H1DSink),
    H2DSink(H2DSink),
    RateMonitor(RateMonitor),
    ExportSink(Box<ExportSink>),
    IntervalCondition(IntervalCondition),
    RectangleCondition(RectangleCondition),
    PolygonCondition(PolygonCondition),
}

/// One node of the analysis graph.
#[derive(Debug)]
pub struct Operator {
    pub inputs: Vec<PipeVectors>,
    pub outputs: Vec<PipeVectors>,
    /// Bit in the event's condition bitset gating this operator.
    pub condition_index: Option<usize>,
    pub kind: OperatorKind,
}

impl Operator {
    pub(crate) fn new(kind: OperatorKind, inputs: Vec<PipeVectors>, outputs: Vec<PipeVectors>) -> Self {
        Self {
            inputs,
            outputs,
            condition_index: None,
            kind,
        }
    }

    /// Gate this operator on a condition bit.
    pub fn with_condition(mut self, bit: usize) -> Self {
        self.condition_index = Some(bit);
        self
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            OperatorKind::Calibration(_) => "calibration",
            OperatorKind::KeepPrevious(_) => "keep_previous",
            OperatorKind::Difference => "difference",
            OperatorKind::ArrayMap(_) => "array_map",
            OperatorKind::BinaryEquation(_) => "binary_equation",
            OperatorKind::Aggregate(a) => a.op.name(),
            OperatorKind::RangeFilter(_) => "range_filter",
            OperatorKind::RectFilter(_) => "rect_filter",
            OperatorKind::ConditionFilter(_) => "condition_filter",
            OperatorKind::ScalerOverflow(_) => "scaler_overflow",
            OperatorKind::Expression(_) => "expression",
            OperatorKind::H1DSink(_) => "h1d_sink",
            OperatorKind::H2DSink(_) => "h2d_sink",
            OperatorKind::RateMonitor(_) => "rate_monitor",
            OperatorKind::ExportSink(_) => "export_sink",
            OperatorKind::IntervalCondition(_) => "interval_condition",
            OperatorKind::RectangleCondition(_) => "rectangle_condition",
            OperatorKind::PolygonCondition(_) => "polygon_condition",
        }
    }

    /// Number of condition bits written by this operator. Zero for
    /// everything except condition operators.
    pub fn condition_bit_count(&self) -> usize {
        match &self.kind {
            OperatorKind::IntervalCondition(c) => c.bit_count(),
            OperatorKind::RectangleCondition(_) | OperatorKind::PolygonCondition(_) => 1,
            _ => 0,
        }
    }

    pub fn is_condition(&self) -> bool {
        self.condition_bit_count() > 0
    }

    pub(crate) fn set_condition_bit_offset(&mut self, offset: usize) {
        match &mut self.kind {
            OperatorKind::IntervalCondition(c) => c.bit_offset = offset,
            OperatorKind::RectangleCondition(c) => c.bit_offset = offset,
            OperatorKind::PolygonCondition(c) => c.bit_offset = offset,
            _ => {}
        }
    }

    /// Set every output element to the invalid sentinel.
    pub fn invalidate_outputs(&self, arena: &Arena) {
        for out in &self.outputs {
            invalidate_all(arena.get(out.data));
        }
    }

    pub fn begin_run(&mut self, arena: &Arena) {
        match &mut self.kind {
            OperatorKind::KeepPrevious(k) => k.begin_run(arena),
            OperatorKind::ScalerOverflow(s) => s.begin_run(arena),
            OperatorKind::H1DSink(s) => s.begin_run(arena),
            OperatorKind::H2DSink(s) => s.begin_run(arena),
            OperatorKind::RateMonitor(r) => r.begin_run(arena),
            OperatorKind::ExportSink(e) => e.begin_run(),
            _ => {}
        }
    }

    pub fn end_run(&mut self) {
        if let OperatorKind::ExportSink(e) = &mut self.kind {
            e.end_run();
        }
    }

    /// Periodic tick, only meaningful for sampling operators.
    pub fn timetick(&mut self, arena: &Arena) {
        match &mut self.kind {
            OperatorKind::RateMonitor(r) => r.timetick(arena),
            OperatorKind::ExportSink(e) => e.timetick(),
            _ => {}
        }
    }

    /// Run this operator for the current event.
    ///
    /// A gated operator whose condition bit is false invalidates its outputs
    /// instead of computing them.
    pub fn step(&mut self, ctx: &mut StepContext<'_>) {
        if let Some(bit) = self.condition_index {
            if !ctx.conditions.test(bit) {
                self.invalidate_outputs(ctx.arena);
                return;
            }
        }

        let arena = ctx.arena;
        let inputs = &self.inputs[..];
        let outputs = &self.outputs[..];

        match &mut self.kind {
            OperatorKind::Calibration(k) => k.step(arena, &inputs[0], &outputs[0]),
            OperatorKind::KeepPrevious(k) => k.step(arena, &inputs[0], &outputs[0]),
            OperatorKind::Difference => basic::difference_step(arena, inputs, &outputs[0]),
            OperatorKind::ArrayMap(k) => k.step(arena, inputs, &outputs[0]),
            OperatorKind::BinaryEquation(k) => k.step(arena, inputs, &outputs[0]),
            OperatorKind::Aggregate(k) => k.step(arena, &inputs[0], &outputs[0]),
            OperatorKind::RangeFilter(k) => k.step(arena, &inputs[0], &outputs[0]),
            OperatorKind::RectFilter(k) => k.step(arena, inputs, &outputs[0]),
            OperatorKind::ConditionFilter(k) => k.step(arena, inputs, &outputs[0]),
            OperatorKind::ScalerOverflow(k) => k.step(arena, &inputs[0], &outputs[0]),
            OperatorKind::Expression(k) => k.step(arena, inputs, outputs),
            OperatorKind::H1DSink(k) => k.step(arena, &inputs[0], ctx.filler),
            OperatorKind::H2DSink(k) => k.step(arena, inputs, ctx.filler),
            OperatorKind::RateMonitor(k) => k.step(arena, &inputs[0]),
            OperatorKind::ExportSink(k) => k.step(arena, inputs),
            OperatorKind::IntervalCondition(k) => k.step(arena, &inputs[0], ctx.conditions),
            OperatorKind::RectangleCondition(k) => k.step(arena, inputs, ctx.conditions),
            OperatorKind::PolygonCondition(k) => k.step(arena, inputs, ctx.conditions),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Allocate a pipe and fill its data.
    pub fn pipe(arena: &mut Arena, values: &[f64], lower: f64, upper: f64) -> PipeVectors {
        let p = PipeVectors::push(arena, values.len(), lower, upper).unwrap();
        arena.copy_from(p.data, values);
        p
    }

    pub fn step(op: &mut Operator, arena: &Arena) {
        let mut bits = ConditionBits::new(64);
        let mut filler = HistoFiller::new(HistoFillStrategy::Direct, 0);
        step_with(op, arena, &mut bits, &mut filler);
    }

    pub fn step_with(
        op: &mut Operator,
        arena: &Arena,
        bits: &mut ConditionBits,
        filler: &mut HistoFiller,
    ) {
        let mut ctx = StepContext {
            arena,
            conditions: bits,
            filler,
        };
        op.step(&mut ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use crate::param::{invalid_param, is_param_valid};

    #[test]
    fn test_gated_operator_invalidates_outputs() {
        let mut arena = Arena::new(64 * 1024);
        let input = pipe(&mut arena, &[5.0, 10.0], 0.0, 20.0);
        let mut op = Operator::calibration(&mut arena, input, 0.0, 100.0)
            .unwrap()
            .with_condition(3);

        let mut bits = ConditionBits::new(8);
        let mut filler = HistoFiller::new(HistoFillStrategy::Direct, 0);

        bits.set(3, true);
        step_with(&mut op, &arena, &mut bits, &mut filler);
        assert_eq!(arena.values(op.outputs[0].data), vec![25.0, 50.0]);

        bits.set(3, false);
        step_with(&mut op, &arena, &mut bits, &mut filler);
        assert!(arena
            .values(op.outputs[0].data)
            .iter()
            .all(|v| !is_param_valid(*v)));
    }

    #[test]
    fn test_condition_bit_offsets() {
        let mut arena = Arena::new(64 * 1024);
        let input = pipe(&mut arena, &[1.0, invalid_param(), 3.0], 0.0, 10.0);
        let mut op = Operator::interval_condition(
            &mut arena,
            input,
            vec![crate::param::Thresholds::new(0.0, 5.0); 3],
        )
        .unwrap();
        assert!(op.is_condition());
        assert_eq!(op.condition_bit_count(), 3);
        op.set_condition_bit_offset(4);

        let mut bits = ConditionBits::new(8);
        let mut filler = HistoFiller::new(HistoFillStrategy::Direct, 0);
        step_with(&mut op, &arena, &mut bits, &mut filler);
        assert!(bits.test(4));
        assert!(!bits.test(5));
        assert!(bits.test(6));
        assert_eq!(op.type_name(), "interval_condition");
    }
}

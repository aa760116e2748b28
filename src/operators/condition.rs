//! Condition operators and the shared condition bitset
//!
//! Condition operators have no output pipes. Each one owns a contiguous range
//! of bits in its event's [`ConditionBits`], assigned when the graph is
//! built, and rewrites all of them every event. Gated operators read a single
//! bit through [`super::Operator::condition_index`].

use super::{Operator, OperatorKind};
use crate::error::{A2Error, Result};
use crate::memory::Arena;
use crate::param::{is_param_valid, PipeVectors, Thresholds};

/// Fixed-size bitset, sized once per run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionBits {
    words: Vec<u64>,
    len: usize,
}

impl ConditionBits {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set(&mut self, bit: usize, value: bool) {
        debug_assert!(bit < self.len);
        if let Some(word) = self.words.get_mut(bit / 64) {
            let mask = 1u64 << (bit % 64);
            if value {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        }
    }

    /// Out of range bits read as false.
    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        bit < self.len
            && self
                .words
                .get(bit / 64)
                .is_some_and(|w| w & (1u64 << (bit % 64)) != 0)
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// One bit per input element: valid and inside its interval.
#[derive(Debug)]
pub struct IntervalCondition {
    pub intervals: Vec<Thresholds>,
    pub(crate) bit_offset: usize,
}

impl IntervalCondition {
    pub fn bit_count(&self) -> usize {
        self.intervals.len()
    }

    pub fn bit_offset(&self) -> usize {
        self.bit_offset
    }

    pub(crate) fn step(&mut self, arena: &Arena, input: &PipeVectors, bits: &mut ConditionBits) {
        for (i, (cell, interval)) in arena.get(input.data).iter().zip(&self.intervals).enumerate() {
            let v = cell.get();
            bits.set(self.bit_offset + i, is_param_valid(v) && interval.contains(v));
        }
    }
}

/// A single bit: both coordinates valid and inside their intervals.
#[derive(Debug)]
pub struct RectangleCondition {
    pub x: Thresholds,
    pub y: Thresholds,
    pub(crate) bit_offset: usize,
}

impl RectangleCondition {
    pub fn bit_offset(&self) -> usize {
        self.bit_offset
    }

    pub(crate) fn step(&mut self, arena: &Arena, inputs: &[PipeVectors], bits: &mut ConditionBits) {
        let x = arena.value(inputs[0].data, 0);
        let y = arena.value(inputs[1].data, 0);
        let inside = is_param_valid(x)
            && is_param_valid(y)
            && self.x.contains(x)
            && self.y.contains(y);
        bits.set(self.bit_offset, inside);
    }
}

/// A single bit: the point `(x, y)` lies inside a closed polygon.
#[derive(Debug)]
pub struct PolygonCondition {
    pub polygon: Vec<(f64, f64)>,
    pub(crate) bit_offset: usize,
}

/// Even-odd ray casting point-in-polygon test.
pub fn point_in_polygon(x: f64, y: f64, polygon: &[(f64, f64)]) -> bool {
    let mut inside = false;
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = polygon[i];
        let (xj, yj) = polygon[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

impl PolygonCondition {
    pub fn bit_offset(&self) -> usize {
        self.bit_offset
    }

    pub(crate) fn step(&mut self, arena: &Arena, inputs: &[PipeVectors], bits: &mut ConditionBits) {
        let x = arena.value(inputs[0].data, 0);
        let y = arena.value(inputs[1].data, 0);
        let inside = is_param_valid(x) && is_param_valid(y) && point_in_polygon(x, y, &self.polygon);
        bits.set(self.bit_offset, inside);
    }
}

fn check_scalar_inputs(x: &PipeVectors, y: &PipeVectors, what: &str) -> Result<()> {
    if x.len() != 1 || y.len() != 1 {
        return Err(A2Error::Build(format!(
            "{} inputs must be single parameters",
            what
        )));
    }
    Ok(())
}

// Conditions write only to the condition bitset and allocate nothing; the
// arena parameter keeps the constructor signature shared by all operators.
impl Operator {
    pub fn interval_condition(
        _arena: &mut Arena,
        input: PipeVectors,
        intervals: Vec<Thresholds>,
    ) -> Result<Operator> {
        if intervals.len() != input.len() {
            return Err(A2Error::Build(format!(
                "interval condition: {} intervals for {} elements",
                intervals.len(),
                input.len()
            )));
        }

        Ok(Operator::new(
            OperatorKind::IntervalCondition(IntervalCondition {
                intervals,
                bit_offset: 0,
            }),
            vec![input],
            Vec::new(),
        ))
    }

    pub fn rectangle_condition(
        _arena: &mut Arena,
        x_input: PipeVectors,
        y_input: PipeVectors,
        x: Thresholds,
        y: Thresholds,
    ) -> Result<Operator> {
        check_scalar_inputs(&x_input, &y_input, "rectangle condition")?;

        Ok(Operator::new(
            OperatorKind::RectangleCondition(RectangleCondition { x, y, bit_offset: 0 }),
            vec![x_input, y_input],
            Vec::new(),
        ))
    }

    pub fn polygon_condition(
        _arena: &mut Arena,
        x_input: PipeVectors,
        y_input: PipeVectors,
        polygon: Vec<(f64, f64)>,
    ) -> Result<Operator> {
        check_scalar_inputs(&x_input, &y_input, "polygon condition")?;
        if polygon.len() < 3 {
            return Err(A2Error::Build(
                "polygon condition needs at least 3 points".into(),
            ));
        }

        Ok(Operator::new(
            OperatorKind::PolygonCondition(PolygonCondition {
                polygon,
                bit_offset: 0,
            }),
            vec![x_input, y_input],
            Vec::new(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{pipe, step_with};
    use super::super::{HistoFillStrategy, HistoFiller};
    use super::*;
    use crate::param::invalid_param;

    #[test]
    fn test_condition_bits() {
        let mut bits = ConditionBits::new(130);
        assert_eq!(bits.len(), 130);
        bits.set(0, true);
        bits.set(64, true);
        bits.set(129, true);
        assert!(bits.test(0) && bits.test(64) && bits.test(129));
        assert!(!bits.test(1));
        assert!(!bits.test(500));
        assert_eq!(bits.count_ones(), 3);

        bits.set(64, false);
        assert!(!bits.test(64));
        bits.clear_all();
        assert_eq!(bits.count_ones(), 0);
    }

    #[test]
    fn test_point_in_polygon() {
        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!(point_in_polygon(5.0, 5.0, &square));
        assert!(!point_in_polygon(15.0, 5.0, &square));
        assert!(!point_in_polygon(-1.0, 5.0, &square));

        // concave "L" shape
        let l = [(0.0, 0.0), (10.0, 0.0), (10.0, 2.0), (2.0, 2.0), (2.0, 10.0), (0.0, 10.0)];
        assert!(point_in_polygon(1.0, 8.0, &l));
        assert!(point_in_polygon(8.0, 1.0, &l));
        assert!(!point_in_polygon(8.0, 8.0, &l));
    }

    fn run(op: &mut Operator, arena: &Arena, bits: &mut ConditionBits) {
        let mut filler = HistoFiller::new(HistoFillStrategy::Direct, 0);
        step_with(op, arena, bits, &mut filler);
    }

    #[test]
    fn test_rectangle_condition() {
        let mut arena = Arena::new(64 * 1024);
        let x = pipe(&mut arena, &[1.0], 0.0, 16.0);
        let y = pipe(&mut arena, &[3.0], 0.0, 16.0);
        let mut op = Operator::rectangle_condition(
            &mut arena,
            x,
            y,
            Thresholds::new(0.0, 2.0),
            Thresholds::new(2.0, 4.0),
        )
        .unwrap();
        op.set_condition_bit_offset(2);

        let mut bits = ConditionBits::new(4);
        run(&mut op, &arena, &mut bits);
        assert!(bits.test(2));

        arena.copy_from(y.data, &[4.0]);
        run(&mut op, &arena, &mut bits);
        assert!(!bits.test(2));

        arena.copy_from(y.data, &[invalid_param()]);
        run(&mut op, &arena, &mut bits);
        assert!(!bits.test(2));
    }

    #[test]
    fn test_polygon_condition() {
        let mut arena = Arena::new(64 * 1024);
        let x = pipe(&mut arena, &[5.0], 0.0, 16.0);
        let y = pipe(&mut arena, &[1.0], 0.0, 16.0);
        let triangle = vec![(0.0, 0.0), (10.0, 0.0), (5.0, 10.0)];
        let mut op = Operator::polygon_condition(&mut arena, x, y, triangle).unwrap();

        let mut bits = ConditionBits::new(1);
        run(&mut op, &arena, &mut bits);
        assert!(bits.test(0));

        arena.copy_from(x.data, &[0.5]);
        arena.copy_from(y.data, &[9.0]);
        run(&mut op, &arena, &mut bits);
        assert!(!bits.test(0));

        assert!(Operator::polygon_condition(&mut arena, x, y, vec![(0.0, 0.0)]).is_err());
    }

    #[test]
    fn test_interval_condition_size_mismatch() {
        let mut arena = Arena::new(64 * 1024);
        let input = pipe(&mut arena, &[1.0, 2.0], 0.0, 16.0);
        assert!(
            Operator::interval_condition(&mut arena, input, vec![Thresholds::new(0.0, 1.0)])
                .is_err()
        );
    }
}

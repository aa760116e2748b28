//! Incremental construction of an [`A2`]
//!
//! Sources and operators are added per event slot. Each operator gets a rank
//! when it is added: one more than the highest rank among the nodes
//! producing its inputs, where sources are rank 0. A gated operator also
//! depends on the condition operator owning its bit. [`A2Builder::build`]
//! then stable-sorts every event's operators by rank, so operators of equal
//! rank keep their insertion order.

use crate::a2::{EventSlot, A2, MAX_VME_EVENTS, MAX_VME_MODULES};
use crate::error::{A2Error, Result};
use crate::id::{OperatorId, SourceId, MAX_HANDLE_INDEX};
use crate::memory::Arena;
use crate::operators::{ConditionBits, HistoFillStrategy, HistoFiller, Operator};
use crate::param::PipeVectors;
use crate::source::DataSource;
use std::collections::BTreeMap;
use std::ops::Range;

#[derive(Debug, Default)]
struct EventBuilder {
    sources: Vec<DataSource>,
    operators: Vec<Operator>,
    ranks: Vec<u32>,
    /// Output data start offset -> (end offset, producer rank).
    producers: BTreeMap<usize, (usize, u32)>,
    /// Rank of the condition operator owning each allocated bit.
    bit_ranks: Vec<u32>,
    /// Bit range per operator, empty for non-conditions.
    bit_ranges: Vec<Range<usize>>,
}

impl EventBuilder {
    fn register_outputs(&mut self, outputs: &[PipeVectors], rank: u32) {
        for out in outputs.iter().filter(|p| !p.is_empty()) {
            let start = out.data.offset();
            self.producers.insert(start, (start + out.len(), rank));
        }
    }

    fn producer_rank(&self, input: &PipeVectors) -> u32 {
        let offset = input.data.offset();
        match self.producers.range(..=offset).next_back() {
            Some((_, &(end, rank))) if offset < end => rank,
            _ => 0,
        }
    }

    fn rank_for(&self, op: &Operator) -> Result<u32> {
        let mut upstream = op
            .inputs
            .iter()
            .map(|i| self.producer_rank(i))
            .max()
            .unwrap_or(0);

        if let Some(bit) = op.condition_index {
            let cond_rank = self.bit_ranks.get(bit).copied().ok_or_else(|| {
                A2Error::Build(format!(
                    "condition bit {} not allocated ({} bits in event)",
                    bit,
                    self.bit_ranks.len()
                ))
            })?;
            upstream = upstream.max(cond_rank);
        }

        Ok(upstream + 1)
    }
}

/// Collects sources and operators, then freezes them into an [`A2`].
pub struct A2Builder {
    arena: Arena,
    fill_strategy: HistoFillStrategy,
    events: Vec<EventBuilder>,
}

impl A2Builder {
    pub fn new(arena_capacity: usize, fill_strategy: HistoFillStrategy) -> Self {
        Self::with_arena(Arena::new(arena_capacity), fill_strategy)
    }

    pub fn with_arena(arena: Arena, fill_strategy: HistoFillStrategy) -> Self {
        Self {
            arena,
            fill_strategy,
            events: (0..MAX_VME_EVENTS).map(|_| EventBuilder::default()).collect(),
        }
    }

    /// Arena used by the `DataSource::*` and `Operator::*` constructors.
    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    fn event_mut(&mut self, event_index: usize) -> Result<&mut EventBuilder> {
        self.events.get_mut(event_index).ok_or_else(|| {
            A2Error::Build(format!(
                "event index {} out of range (max {})",
                event_index, MAX_VME_EVENTS
            ))
        })
    }

    pub fn add_source(&mut self, event_index: usize, source: DataSource) -> Result<SourceId> {
        if source.module_index as usize >= MAX_VME_MODULES {
            return Err(A2Error::Build(format!(
                "module index {} out of range (max {})",
                source.module_index, MAX_VME_MODULES
            )));
        }
        let ev = self.event_mut(event_index)?;
        let index = ev.sources.len();
        if index > MAX_HANDLE_INDEX {
            return Err(A2Error::Build("too many sources".into()));
        }

        ev.register_outputs(&source.outputs, 0);
        ev.sources.push(source);
        Ok(SourceId::new(event_index, index))
    }

    /// Add an operator, computing its rank. Condition operators are assigned
    /// the next free bits of the event.
    pub fn add_operator(&mut self, event_index: usize, mut op: Operator) -> Result<OperatorId> {
        let ev = self.event_mut(event_index)?;
        let index = ev.operators.len();
        if index > MAX_HANDLE_INDEX {
            return Err(A2Error::Build("too many operators".into()));
        }

        let rank = ev
            .rank_for(&op)
            .map_err(|e| e.with_context(format!("operator '{}'", op.type_name())))?;

        let bit_count = op.condition_bit_count();
        let first_bit = ev.bit_ranks.len();
        if bit_count > 0 {
            op.set_condition_bit_offset(first_bit);
            ev.bit_ranks.extend(std::iter::repeat(rank).take(bit_count));
        }

        ev.register_outputs(&op.outputs, rank);
        ev.bit_ranges.push(first_bit..first_bit + bit_count);
        ev.ranks.push(rank);
        ev.operators.push(op);

        Ok(OperatorId::new(event_index, index))
    }

    pub fn source(&self, id: SourceId) -> Option<&DataSource> {
        self.events.get(id.event())?.sources.get(id.index())
    }

    pub fn operator(&self, id: OperatorId) -> Option<&Operator> {
        self.events.get(id.event())?.operators.get(id.index())
    }

    pub fn rank(&self, id: OperatorId) -> Option<u32> {
        self.events.get(id.event())?.ranks.get(id.index()).copied()
    }

    /// Bits owned by a condition operator, `None` for anything else.
    pub fn condition_bits(&self, id: OperatorId) -> Option<Range<usize>> {
        let range = self.events.get(id.event())?.bit_ranges.get(id.index())?;
        (!range.is_empty()).then(|| range.clone())
    }

    pub fn build(self) -> A2 {
        let mut filler = HistoFiller::new(self.fill_strategy, 0);
        let mut events = Vec::with_capacity(self.events.len());

        for (event_index, ev) in self.events.into_iter().enumerate() {
            filler.reserve(ev.operators.iter().map(Operator::max_fills_per_event).sum());

            let mut source_order: Vec<usize> = (0..ev.sources.len()).collect();
            source_order.sort_by_key(|&i| ev.sources[i].module_index);
            let mut op_order: Vec<usize> = (0..ev.operators.len()).collect();
            op_order.sort_by_key(|&i| ev.ranks[i]);

            let source_slots = inverse(&source_order);
            let operator_slots = inverse(&op_order);
            let ranks: Vec<u32> = op_order.iter().map(|&i| ev.ranks[i]).collect();
            let sources = permute(ev.sources, &source_slots);
            let operators = permute(ev.operators, &operator_slots);

            if !operators.is_empty() || !sources.is_empty() {
                tracing::debug!(
                    "event {}: {} sources, {} operators, max rank {}, {} condition bits",
                    event_index,
                    sources.len(),
                    operators.len(),
                    ranks.last().copied().unwrap_or(0),
                    ev.bit_ranks.len()
                );
            }

            events.push(EventSlot {
                sources,
                operators,
                ranks,
                conditions: ConditionBits::new(ev.bit_ranks.len()),
                source_slots,
                operator_slots,
            });
        }

        tracing::debug!(
            "a2 built: arena {}/{} bytes, fill strategy {:?}",
            self.arena.used(),
            self.arena.capacity(),
            self.fill_strategy
        );

        A2::from_parts(self.arena, events, filler)
    }
}

/// `order[pos] = old` to `slots[old] = pos`.
fn inverse(order: &[usize]) -> Vec<usize> {
    let mut slots = vec![0; order.len()];
    for (pos, &old) in order.iter().enumerate() {
        slots[old] = pos;
    }
    slots
}

/// Move each item to the position given by `slots`.
fn permute<T>(items: Vec<T>, slots: &[usize]) -> Vec<T> {
    let mut placed: Vec<Option<T>> = (0..items.len()).map(|_| None).collect();
    for (item, &pos) in items.into_iter().zip(slots) {
        placed[pos] = Some(item);
    }
    placed.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_filter::MultiWordFilter;
    use crate::operators::AggregateOp;
    use crate::param::Thresholds;
    use crate::source::DataSourceOptions;

    fn extractor(b: &mut A2Builder, module: u8) -> DataSource {
        let filter = MultiWordFilter::parse(&["0000 aaaa dddd dddd"]).unwrap();
        DataSource::extractor(
            b.arena_mut(),
            filter,
            1,
            1234,
            module,
            DataSourceOptions::NO_ADDED_RANDOM,
        )
        .unwrap()
    }

    #[test]
    fn test_ranks_follow_dependencies() {
        let mut b = A2Builder::new(1 << 20, HistoFillStrategy::Direct);
        let src = extractor(&mut b, 0);
        let raw = src.outputs[0];
        b.add_source(0, src).unwrap();

        let cal = Operator::calibration(b.arena_mut(), raw, 0.0, 1000.0).unwrap();
        let cal_out = cal.outputs[0];
        let cal_id = b.add_operator(0, cal).unwrap();

        let sum = Operator::aggregate(b.arena_mut(), cal_out, AggregateOp::Sum, Thresholds::unbounded())
            .unwrap();
        let sum_id = b.add_operator(0, sum).unwrap();

        let elem = Operator::calibration(b.arena_mut(), cal_out.element(3).unwrap(), 0.0, 1.0).unwrap();
        let elem_id = b.add_operator(0, elem).unwrap();

        assert_eq!(b.rank(cal_id), Some(1));
        assert_eq!(b.rank(sum_id), Some(2));
        assert_eq!(b.rank(elem_id), Some(2));
    }

    #[test]
    fn test_build_sorts_by_rank() {
        let mut b = A2Builder::new(1 << 20, HistoFillStrategy::Direct);
        let src = extractor(&mut b, 0);
        let raw = src.outputs[0];
        b.add_source(0, src).unwrap();

        let cal = Operator::calibration(b.arena_mut(), raw, 0.0, 1000.0).unwrap();
        let cal_out = cal.outputs[0];
        let cal2 = Operator::calibration(b.arena_mut(), cal_out, 0.0, 10.0).unwrap();
        let cal_id = b.add_operator(0, cal).unwrap();
        let cal2_id = b.add_operator(0, cal2).unwrap();
        let low = Operator::calibration(b.arena_mut(), raw, 0.0, 1.0).unwrap();
        let low_id = b.add_operator(0, low).unwrap();

        let a2 = b.build();
        assert_eq!(a2.event(0).unwrap().ranks(), &[1, 1, 2]);
        assert_eq!(a2.operator_rank(cal2_id), Some(2));
        assert_eq!(a2.operator_rank(cal_id), Some(1));
        assert_eq!(a2.operator_rank(low_id), Some(1));
        // Equal ranks keep insertion order.
        let ops = a2.event(0).unwrap().operators();
        assert!(std::ptr::eq(&ops[0], a2.operator(cal_id).unwrap()));
        assert!(std::ptr::eq(&ops[1], a2.operator(low_id).unwrap()));
    }

    #[test]
    fn test_condition_bits_allocated_in_order() {
        let mut b = A2Builder::new(1 << 20, HistoFillStrategy::Direct);
        let src = extractor(&mut b, 0);
        let raw = src.outputs[0];
        b.add_source(0, src).unwrap();

        let c1 = Operator::interval_condition(
            b.arena_mut(),
            raw,
            vec![Thresholds::new(0.0, 100.0); raw.len()],
        )
        .unwrap();
        let c1_id = b.add_operator(0, c1).unwrap();
        let c2 = Operator::rectangle_condition(
            b.arena_mut(),
            raw.element(0).unwrap(),
            raw.element(1).unwrap(),
            Thresholds::new(0.0, 10.0),
            Thresholds::new(0.0, 10.0),
        )
        .unwrap();
        let c2_id = b.add_operator(0, c2).unwrap();

        assert_eq!(b.condition_bits(c1_id), Some(0..16));
        assert_eq!(b.condition_bits(c2_id), Some(16..17));

        let gated = Operator::calibration(b.arena_mut(), raw, 0.0, 1.0)
            .unwrap()
            .with_condition(16);
        let gated_id = b.add_operator(0, gated).unwrap();
        assert_eq!(b.rank(gated_id), Some(2));
        assert_eq!(b.condition_bits(gated_id), None);

        let a2 = b.build();
        assert_eq!(a2.event(0).unwrap().conditions().len(), 17);
    }

    #[test]
    fn test_unallocated_condition_bit_rejected() {
        let mut b = A2Builder::new(1 << 20, HistoFillStrategy::Direct);
        let src = extractor(&mut b, 0);
        let raw = src.outputs[0];
        b.add_source(0, src).unwrap();
        let gated = Operator::calibration(b.arena_mut(), raw, 0.0, 1.0)
            .unwrap()
            .with_condition(0);
        let err = b.add_operator(0, gated).unwrap_err();
        assert!(matches!(err.root(), A2Error::Build(_)));
    }

    #[test]
    fn test_index_limits() {
        let mut b = A2Builder::new(1 << 20, HistoFillStrategy::Direct);
        let src = extractor(&mut b, MAX_VME_MODULES as u8);
        assert!(b.add_source(0, src).is_err());
        let src = extractor(&mut b, 0);
        assert!(b.add_source(MAX_VME_EVENTS, src).is_err());
    }

    #[test]
    fn test_sources_sorted_by_module() {
        let mut b = A2Builder::new(1 << 20, HistoFillStrategy::Direct);
        let s3 = extractor(&mut b, 3);
        let s1 = extractor(&mut b, 1);
        let id3 = b.add_source(2, s3).unwrap();
        let id1 = b.add_source(2, s1).unwrap();
        let a2 = b.build();

        let modules: Vec<u8> = a2.event(2).unwrap().sources().iter().map(|s| s.module_index).collect();
        assert_eq!(modules, vec![1, 3]);
        assert_eq!(a2.source(id3).unwrap().module_index, 3);
        assert_eq!(a2.source(id1).unwrap().module_index, 1);
    }

    #[test]
    fn test_permute_inverse() {
        let order = vec![2, 0, 1];
        let slots = inverse(&order);
        assert_eq!(slots, vec![1, 2, 0]);
        assert_eq!(permute(vec!['a', 'b', 'c'], &slots), vec!['c', 'a', 'b']);
    }
}

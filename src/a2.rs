//! The top-level analysis aggregate and its run/event state machine
//!
//! ```text
//!   Idle ──begin_run──► Running ──end_run──► Idle
//!                        │   ▲
//!                        ▼   │
//!            begin_event ─► process_module_data × N ─► end_event
//! ```
//!
//! `timetick` may be called at any time while running and only affects
//! sampling operators. Everything here is driven by a single thread.

use crate::id::{OperatorId, SourceId};
use crate::memory::Arena;
use crate::operators::{
    ConditionBits, HistoFillStrategy, HistoFiller, Operator, OperatorKind, StepContext, H1D,
};
use crate::source::DataSource;

/// Number of event slots.
pub const MAX_VME_EVENTS: usize = 12;
/// Modules per event.
pub const MAX_VME_MODULES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

/// Sources, rank-ordered operators and condition bits of one event.
#[derive(Debug, Default)]
pub struct EventSlot {
    /// Sorted by module index.
    pub(crate) sources: Vec<DataSource>,
    /// Sorted by ascending rank.
    pub(crate) operators: Vec<Operator>,
    pub(crate) ranks: Vec<u32>,
    pub(crate) conditions: ConditionBits,
    /// Insertion index to position in `sources`.
    pub(crate) source_slots: Vec<usize>,
    /// Insertion index to position in `operators`.
    pub(crate) operator_slots: Vec<usize>,
}

impl EventSlot {
    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    pub fn operators(&self) -> &[Operator] {
        &self.operators
    }

    pub fn ranks(&self) -> &[u32] {
        &self.ranks
    }

    pub fn conditions(&self) -> &ConditionBits {
        &self.conditions
    }
}

/// Analysis graph for all event slots plus the arena backing it.
pub struct A2 {
    // Declared before `arena` so operator state drops first.
    events: Vec<EventSlot>,
    filler: HistoFiller,
    state: RunState,
    events_processed: u64,
    timeticks: u64,
    arena: Arena,
}

impl std::fmt::Debug for A2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("A2")
            .field("state", &self.state)
            .field("events_processed", &self.events_processed)
            .field("arena", &self.arena)
            .finish_non_exhaustive()
    }
}

impl A2 {
    pub(crate) fn from_parts(arena: Arena, events: Vec<EventSlot>, filler: HistoFiller) -> Self {
        Self {
            events,
            filler,
            state: RunState::Idle,
            events_processed: 0,
            timeticks: 0,
            arena,
        }
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn run_state(&self) -> RunState {
        self.state
    }

    pub fn fill_strategy(&self) -> HistoFillStrategy {
        self.filler.strategy()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    pub fn timeticks(&self) -> u64 {
        self.timeticks
    }

    pub fn event(&self, event_index: usize) -> Option<&EventSlot> {
        self.events.get(event_index)
    }

    pub fn source(&self, id: SourceId) -> Option<&DataSource> {
        let slot = self.events.get(id.event())?;
        slot.sources.get(*slot.source_slots.get(id.index())?)
    }

    pub fn operator(&self, id: OperatorId) -> Option<&Operator> {
        let slot = self.events.get(id.event())?;
        slot.operators.get(*slot.operator_slots.get(id.index())?)
    }

    pub fn operator_rank(&self, id: OperatorId) -> Option<u32> {
        let slot = self.events.get(id.event())?;
        slot.ranks.get(*slot.operator_slots.get(id.index())?).copied()
    }

    pub fn source_count(&self) -> usize {
        self.events.iter().map(|e| e.sources.len()).sum()
    }

    pub fn operator_count(&self) -> usize {
        self.events.iter().map(|e| e.operators.len()).sum()
    }

    /// All 1D histograms of all H1D sinks, in event and rank order.
    pub fn h1d_histos(&self) -> impl Iterator<Item = &H1D> + '_ {
        self.events
            .iter()
            .flat_map(|e| e.operators.iter())
            .filter_map(|op| match &op.kind {
                OperatorKind::H1DSink(s) => Some(s.histos()),
                _ => None,
            })
            .flatten()
    }

    pub fn begin_run(&mut self) {
        for slot in &mut self.events {
            for src in &mut slot.sources {
                src.begin_run(&self.arena);
            }
            for op in &mut slot.operators {
                op.begin_run(&self.arena);
            }
            slot.conditions.clear_all();
        }

        self.state = RunState::Running;
        self.events_processed = 0;
        self.timeticks = 0;

        tracing::info!(
            "a2 run started: {} sources, {} operators, arena {}/{} bytes",
            self.source_count(),
            self.operator_count(),
            self.arena.used(),
            self.arena.capacity()
        );
    }

    /// Reset per-event source state and invalidate source outputs.
    pub fn begin_event(&mut self, event_index: usize) {
        debug_assert_eq!(self.state, RunState::Running);
        let Some(slot) = self.events.get_mut(event_index) else {
            return;
        };

        for src in &mut slot.sources {
            src.begin_event(&self.arena);
        }
        slot.conditions.clear_all();
    }

    /// Hand one module's words to the sources attached to it.
    pub fn process_module_data(&mut self, event_index: usize, module_index: usize, data: &[u32]) {
        debug_assert!(module_index < MAX_VME_MODULES);
        let Some(slot) = self.events.get_mut(event_index) else {
            return;
        };

        for src in &mut slot.sources {
            let m = src.module_index as usize;
            if m == module_index {
                src.process_module_data(&self.arena, data);
            } else if m > module_index {
                break;
            }
        }
    }

    /// Step all operators of the event in rank order.
    pub fn end_event(&mut self, event_index: usize) {
        let Some(slot) = self.events.get_mut(event_index) else {
            return;
        };
        debug_assert!(slot.ranks.windows(2).all(|w| w[0] <= w[1]));

        let mut ctx = StepContext {
            arena: &self.arena,
            conditions: &mut slot.conditions,
            filler: &mut self.filler,
        };

        for op in &mut slot.operators {
            op.step(&mut ctx);
        }

        self.filler.flush(&self.arena);
        self.events_processed += 1;
    }

    pub fn timetick(&mut self) {
        for slot in &mut self.events {
            for op in &mut slot.operators {
                op.timetick(&self.arena);
            }
        }
        self.timeticks += 1;
    }

    pub fn end_run(&mut self) {
        for slot in &mut self.events {
            for op in &mut slot.operators {
                op.end_run();
            }
        }
        self.state = RunState::Idle;

        tracing::info!(
            "a2 run stopped after {} events, {} timeticks",
            self.events_processed,
            self.timeticks
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::A2Builder;
    use crate::data_filter::MultiWordFilter;
    use crate::operators::AggregateOp;
    use crate::param::{is_param_valid, Thresholds};
    use crate::source::DataSourceOptions;

    fn source(b: &mut A2Builder, module: u8) -> DataSource {
        let filter = MultiWordFilter::parse(&["AAAA DDDD DDDD DDDD"]).unwrap();
        DataSource::extractor(b.arena_mut(), filter, 1, 99, module, DataSourceOptions::NO_ADDED_RANDOM)
            .unwrap()
    }

    /// Two sources on modules 0 and 1 of event 0, each summed.
    fn two_module_a2(strategy: HistoFillStrategy) -> (A2, OperatorId, OperatorId) {
        let mut b = A2Builder::new(1 << 20, strategy);
        let s0 = source(&mut b, 0);
        let s1 = source(&mut b, 1);
        let (p0, p1) = (s0.outputs[0], s1.outputs[0]);
        b.add_source(0, s1).unwrap();
        b.add_source(0, s0).unwrap();

        let sum0 = Operator::aggregate(b.arena_mut(), p0, AggregateOp::Sum, Thresholds::unbounded()).unwrap();
        let sum1 = Operator::aggregate(b.arena_mut(), p1, AggregateOp::Sum, Thresholds::unbounded()).unwrap();
        let id0 = b.add_operator(0, sum0).unwrap();
        let id1 = b.add_operator(0, sum1).unwrap();
        (b.build(), id0, id1)
    }

    #[test]
    fn test_run_state_transitions() {
        let (mut a2, _, _) = two_module_a2(HistoFillStrategy::Direct);
        assert_eq!(a2.run_state(), RunState::Idle);
        a2.begin_run();
        assert_eq!(a2.run_state(), RunState::Running);
        a2.timetick();
        a2.timetick();
        assert_eq!(a2.timeticks(), 2);
        a2.end_run();
        assert_eq!(a2.run_state(), RunState::Idle);
    }

    #[test]
    fn test_module_data_reaches_matching_sources() {
        let (mut a2, id0, id1) = two_module_a2(HistoFillStrategy::Direct);
        a2.begin_run();
        a2.begin_event(0);
        a2.process_module_data(0, 1, &[0x1005, 0x2007]);
        a2.end_event(0);

        let out0 = a2.operator(id0).unwrap().outputs[0].data;
        let out1 = a2.operator(id1).unwrap().outputs[0].data;
        assert!(!is_param_valid(a2.arena().value(out0, 0)));
        assert_eq!(a2.arena().value(out1, 0), 12.0);
        assert_eq!(a2.events_processed(), 1);

        // begin_event invalidates last event's source outputs
        a2.begin_event(0);
        a2.process_module_data(0, 0, &[0x3001]);
        a2.end_event(0);
        assert_eq!(a2.arena().value(out0, 0), 1.0);
        assert!(!is_param_valid(a2.arena().value(out1, 0)));
    }

    #[test]
    fn test_out_of_range_event_is_ignored() {
        let (mut a2, _, _) = two_module_a2(HistoFillStrategy::Direct);
        a2.begin_run();
        a2.begin_event(MAX_VME_EVENTS);
        a2.process_module_data(MAX_VME_EVENTS, 0, &[0x1001]);
        a2.end_event(MAX_VME_EVENTS);
        assert_eq!(a2.events_processed(), 0);
    }

    #[test]
    fn test_hit_counts_cleared_on_begin_run() {
        let (mut a2, _, _) = two_module_a2(HistoFillStrategy::Batched);
        a2.begin_run();
        for _ in 0..3 {
            a2.begin_event(0);
            a2.process_module_data(0, 0, &[0x2001]);
            a2.end_event(0);
        }
        let src = &a2.event(0).unwrap().sources()[0];
        assert_eq!(a2.arena().value(src.hit_counts, 2), 3.0);

        a2.end_run();
        a2.begin_run();
        let src = &a2.event(0).unwrap().sources()[0];
        assert_eq!(a2.arena().value(src.hit_counts, 2), 0.0);
    }

    #[test]
    fn test_introspection() {
        let (a2, id0, _) = two_module_a2(HistoFillStrategy::Direct);
        assert_eq!(a2.source_count(), 2);
        assert_eq!(a2.operator_count(), 2);
        assert_eq!(a2.operator_rank(id0), Some(1));
        assert!(a2.operator(OperatorId::new(0, 7)).is_none());
        assert!(a2.event(MAX_VME_EVENTS).is_none());
        assert!(a2.arena().used() > 0);
        assert_eq!(a2.h1d_histos().count(), 0);
    }
}

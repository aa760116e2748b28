//! Rate monitor sink feeding shared [`RateSampler`]s, one per input element.

use super::{Operator, OperatorKind};
use crate::error::{A2Error, Result};
use crate::memory::Arena;
use crate::param::{fill, is_param_valid, ParamVec, PipeVectors};
use crate::util::RateSampler;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateMonitorType {
    /// Inputs already are rates and are recorded as they are.
    PrecalculatedRate,
    /// Inputs are counter values; the rate is the non-negative difference to
    /// the previous value.
    CounterDifference,
    /// Rate of valid values flowing through the input, counted per event and
    /// sampled on each timetick.
    FlowRate,
}

#[derive(Debug)]
pub struct RateMonitor {
    samplers: Vec<Arc<RateSampler>>,
    mode: RateMonitorType,
    hit_counts: ParamVec,
}

impl RateMonitor {
    pub fn samplers(&self) -> &[Arc<RateSampler>] {
        &self.samplers
    }

    pub fn mode(&self) -> RateMonitorType {
        self.mode
    }

    pub fn hit_counts(&self) -> ParamVec {
        self.hit_counts
    }

    pub(crate) fn begin_run(&mut self, arena: &Arena) {
        fill(arena.get(self.hit_counts), 0.0);
        for s in &self.samplers {
            s.reset();
        }
    }

    pub(crate) fn step(&mut self, arena: &Arena, input: &PipeVectors) {
        let values = arena.get(input.data);

        match self.mode {
            RateMonitorType::PrecalculatedRate => {
                for (s, c) in self.samplers.iter().zip(values) {
                    if is_param_valid(c.get()) {
                        s.record_rate(c.get());
                    }
                }
            }
            RateMonitorType::CounterDifference => {
                for (s, c) in self.samplers.iter().zip(values) {
                    if is_param_valid(c.get()) {
                        s.sample(c.get());
                    }
                }
            }
            RateMonitorType::FlowRate => {
                for (count, c) in arena.get(self.hit_counts).iter().zip(values) {
                    if is_param_valid(c.get()) {
                        count.set(count.get() + 1.0);
                    }
                }
            }
        }
    }

    pub(crate) fn timetick(&mut self, arena: &Arena) {
        if self.mode == RateMonitorType::FlowRate {
            for (s, count) in self.samplers.iter().zip(arena.get(self.hit_counts)) {
                s.sample(count.get());
            }
        }
    }
}

impl Operator {
    pub fn rate_monitor(
        arena: &mut Arena,
        input: PipeVectors,
        samplers: Vec<Arc<RateSampler>>,
        mode: RateMonitorType,
    ) -> Result<Operator> {
        if samplers.len() != input.len() {
            return Err(A2Error::Build(format!(
                "rate monitor: {} samplers for {} elements",
                samplers.len(),
                input.len()
            )));
        }
        let hit_counts = arena.push_param_vector(input.len())?;

        Ok(Operator::new(
            OperatorKind::RateMonitor(RateMonitor {
                samplers,
                mode,
                hit_counts,
            }),
            vec![input],
            Vec::new(),
        ))
    }
}

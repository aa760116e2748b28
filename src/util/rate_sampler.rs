//! Rate sampling with a bounded history
//!
//! A [`RateSampler`] is shared between the analysis thread (event-driven
//! sampling) and whoever drives timeticks, so its mutable state sits behind a
//! [`TicketMutex`].

use super::ticket_mutex::TicketMutex;
use std::collections::VecDeque;

/// Default number of rates kept in the history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 3600;

#[derive(Debug, Clone, Default)]
pub struct RateSamplerState {
    pub last_value: Option<f64>,
    pub last_rate: f64,
    pub last_delta: f64,
    pub total_samples: u64,
    history: VecDeque<f64>,
}

#[derive(Debug)]
pub struct RateSampler {
    /// Factor applied to each delta.
    pub scale: f64,
    /// Added to each scaled delta.
    pub offset: f64,
    capacity: usize,
    state: TicketMutex<RateSamplerState>,
}

impl Default for RateSampler {
    fn default() -> Self {
        Self::new(1.0, 0.0, DEFAULT_HISTORY_CAPACITY)
    }
}

impl RateSampler {
    pub fn new(scale: f64, offset: f64, capacity: usize) -> Self {
        let state = RateSamplerState {
            history: VecDeque::with_capacity(capacity),
            ..Default::default()
        };
        Self {
            scale,
            offset,
            capacity,
            state: TicketMutex::new(state),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sample a counter value. The scaled difference to the previous value is
    /// recorded as a rate unless it is negative. Returns the recorded rate.
    pub fn sample(&self, value: f64) -> Option<f64> {
        let mut state = self.state.lock();
        let prev = state.last_value.replace(value)?;

        let delta = value - prev;
        state.last_delta = delta;
        if delta < 0.0 {
            return None;
        }

        let rate = delta * self.scale + self.offset;
        Self::push_rate(&mut state, self.capacity, rate);
        Some(rate)
    }

    /// Record an already calculated rate.
    pub fn record_rate(&self, rate: f64) {
        let mut state = self.state.lock();
        Self::push_rate(&mut state, self.capacity, rate);
    }

    fn push_rate(state: &mut RateSamplerState, capacity: usize, rate: f64) {
        if capacity > 0 {
            if state.history.len() >= capacity {
                state.history.pop_front();
            }
            state.history.push_back(rate);
        }
        state.last_rate = rate;
        state.total_samples += 1;
    }

    pub fn last_rate(&self) -> f64 {
        self.state.lock().last_rate
    }

    pub fn total_samples(&self) -> u64 {
        self.state.lock().total_samples
    }

    /// Copy of the current state, history included.
    pub fn snapshot(&self) -> RateSamplerState {
        self.state.lock().clone()
    }

    pub fn history(&self) -> Vec<f64> {
        self.state.lock().history.iter().copied().collect()
    }

    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }

    /// Forget everything, including the last sampled value.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.last_value = None;
        state.last_rate = 0.0;
        state.last_delta = 0.0;
        state.total_samples = 0;
    }
}

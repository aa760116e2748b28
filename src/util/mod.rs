//! Small concurrency helpers shared across the engine.

pub mod rate_sampler;
pub mod ticket_mutex;

pub use rate_sampler::{RateSampler, RateSamplerState, DEFAULT_HISTORY_CAPACITY};
pub use ticket_mutex::{TicketMutex, TicketMutexGuard};

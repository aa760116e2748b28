//! # a2-engine: real-time analysis of detector readout data
//!
//! Turns raw per-module readout words into calibrated parameters, derived
//! quantities and histograms, once per readout event.
//!
//! ## Architecture
//!
//! - **Data filters**: bit pattern matching and address/value extraction
//!   from raw 32-bit words ([`data_filter`])
//! - **Data sources**: per-module extraction into sparse parameter vectors
//!   ([`source`])
//! - **Operators**: the dataflow graph, stepped in rank order once per event
//!   ([`operators`])
//! - **Memory**: one bump arena per run holding every parameter vector
//!   ([`memory`], [`param`])
//! - **A2**: per event slot sources, operators and condition bits plus the
//!   run lifecycle ([`A2`], [`A2Builder`])
//!
//! ## Example
//!
//! ```ignore
//! use a2_engine::config::{build_a2, AnalysisConfig};
//!
//! let config = AnalysisConfig::load("analysis.toml")?;
//! let mut a2 = build_a2(&config)?;
//!
//! a2.begin_run();
//! for event in readout {
//!     a2.begin_event(event.index);
//!     for module in &event.modules {
//!         a2.process_module_data(event.index, module.index, &module.words);
//!     }
//!     a2.end_event(event.index);
//! }
//! a2.end_run();
//! ```

pub mod a2;
pub mod builder;
pub mod config;
pub mod data_filter;
pub mod error;
pub mod id;
pub mod memory;
pub mod operators;
pub mod param;
pub mod replay;
pub mod source;
pub mod util;

// Re-export commonly used types
pub use a2::{RunState, A2, MAX_VME_EVENTS, MAX_VME_MODULES};
pub use builder::A2Builder;
pub use config::{build_a2, AnalysisConfig};
pub use data_filter::{DataFilter, ListFilter, MultiWordFilter};
pub use error::{A2Error, Result};
pub use id::{OperatorId, SourceId};
pub use memory::Arena;
pub use operators::{HistoFillStrategy, Operator};
pub use param::{invalid_param, is_param_valid, ParamVec, PipeVectors, Thresholds};
pub use source::{DataSource, DataSourceOptions};

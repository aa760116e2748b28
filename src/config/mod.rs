//! Declarative analysis configuration
//!
//! An [`AnalysisConfig`] describes the sources and operators of every event
//! slot. It is loaded from TOML or JSON, chosen by file extension, and turned
//! into a runnable [`crate::A2`] by [`build_a2`].
//!
//! Operators refer to upstream pipes by name:
//!
//! - `name` the first output pipe of `name`
//! - `name.N` output pipe `N`
//! - `name[i]` element `i` of the first output pipe
//! - `name.N[i]` element `i` of output pipe `N`
//!
//! Gating (`gate = "cond"` or `gate = "cond[i]"`) refers to the bits of a
//! condition operator in the same event.
//!
//! # Example
//!
//! ```toml
//! fill_strategy = "batched"
//!
//! [[events]]
//! index = 0
//!
//! [[events.sources]]
//! name = "adc"
//! module = 0
//! type = "extractor"
//! filters = ["0000 XXXX AAAA XXXX DDDD DDDD DDDD DDDD"]
//!
//! [[events.operators]]
//! name = "adc_cal"
//! type = "calibration"
//! input = "adc"
//! unit_min = 0.0
//! unit_max = 100.0
//! ```

mod build;

pub use build::{build_a2, build_analysis, Analysis};

use crate::error::{A2Error, Result};
use crate::memory::DEFAULT_ARENA_CAPACITY;
use crate::operators::{
    AggregateOp, ArrayMapping, BinaryEquationKind, ExportFormat, HistoFillStrategy,
    RateMonitorType, RectFilterOp,
};
use crate::source::MultiHitShape;
use crate::util::DEFAULT_HISTORY_CAPACITY;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of bins of histogram sinks.
pub const DEFAULT_HISTO_BINS: usize = 1024;

fn default_arena_capacity() -> usize {
    DEFAULT_ARENA_CAPACITY
}

fn default_one_u32() -> u32 {
    1
}

fn default_one_u8() -> u8 {
    1
}

fn default_scale() -> f64 {
    1.0
}

fn default_history() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_bins() -> usize {
    DEFAULT_HISTO_BINS
}

/// Top-level analysis description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Arena size in bytes
    #[serde(default = "default_arena_capacity")]
    pub arena_capacity: usize,

    #[serde(default)]
    pub fill_strategy: HistoFillStrategy,

    /// Base seed for source dithering. Random when unset.
    #[serde(default)]
    pub rng_seed: Option<u64>,

    #[serde(default)]
    pub events: Vec<EventConfig>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            arena_capacity: DEFAULT_ARENA_CAPACITY,
            fill_strategy: HistoFillStrategy::default(),
            rng_seed: None,
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub index: usize,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub module: u8,
    /// Overrides the seed derived from [`AnalysisConfig::rng_seed`].
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub no_added_random: bool,
    #[serde(default)]
    pub repetition_low_address_bits: bool,
    #[serde(flatten)]
    pub kind: SourceKindConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKindConfig {
    Extractor {
        filters: Vec<String>,
        #[serde(default = "default_one_u32")]
        required_completions: u32,
    },
    ListFilter {
        /// At most two patterns; the last covers the low 32 bits.
        filters: Vec<String>,
        word_count: u8,
        #[serde(default)]
        word_size_32: bool,
        #[serde(default)]
        reverse_combine: bool,
        #[serde(default = "default_one_u8")]
        repetitions: u8,
    },
    MultiHit {
        filter: String,
        shape: MultiHitShape,
        max_hits: u16,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    pub name: String,
    /// Condition bit gating this operator.
    #[serde(default)]
    pub gate: Option<String>,
    #[serde(flatten)]
    pub kind: OperatorKindConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionInputConfig {
    pub input: String,
    /// Variable name inside the scripts. Defaults to the input reference.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorKindConfig {
    Calibration {
        input: String,
        unit_min: f64,
        unit_max: f64,
        /// Per-element `(min, max)`, overriding `unit_min`/`unit_max`.
        #[serde(default)]
        per_element: Vec<(f64, f64)>,
    },
    KeepPrevious {
        input: String,
        #[serde(default)]
        keep_valid: bool,
    },
    Difference {
        a: String,
        b: String,
    },
    ArrayMap {
        inputs: Vec<String>,
        mappings: Vec<ArrayMapping>,
    },
    BinaryEquation {
        a: String,
        b: String,
        equation: BinaryEquationKind,
        output_min: f64,
        output_max: f64,
    },
    Aggregate {
        input: String,
        op: AggregateOp,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    RangeFilter {
        input: String,
        min: f64,
        max: f64,
        #[serde(default)]
        invert: bool,
    },
    RectFilter {
        x: String,
        y: String,
        x_range: (f64, f64),
        y_range: (f64, f64),
        op: RectFilterOp,
    },
    ConditionFilter {
        data: String,
        condition: String,
        #[serde(default)]
        inverted: bool,
    },
    ScalerOverflow {
        input: String,
    },
    Expression {
        inputs: Vec<ExpressionInputConfig>,
        begin: String,
        step: String,
    },
    H1d {
        input: String,
        #[serde(default = "default_bins")]
        bins: usize,
        #[serde(default)]
        range: Option<(f64, f64)>,
    },
    H2d {
        x: String,
        y: String,
        #[serde(default = "default_bins")]
        x_bins: usize,
        #[serde(default = "default_bins")]
        y_bins: usize,
        #[serde(default)]
        x_range: Option<(f64, f64)>,
        #[serde(default)]
        y_range: Option<(f64, f64)>,
    },
    RateMonitor {
        input: String,
        mode: RateMonitorType,
        #[serde(default = "default_scale")]
        scale: f64,
        #[serde(default)]
        offset: f64,
        #[serde(default = "default_history")]
        history: usize,
    },
    ExportSink {
        inputs: Vec<String>,
        #[serde(default)]
        condition: Option<String>,
        path: PathBuf,
        format: ExportFormat,
        /// `0` writes plain output, `-1` or `1..=9` a zlib stream.
        #[serde(default)]
        compression_level: i32,
    },
    IntervalCondition {
        input: String,
        /// One interval per element, or a single one used for all.
        intervals: Vec<(f64, f64)>,
    },
    RectangleCondition {
        x: String,
        y: String,
        x_range: (f64, f64),
        y_range: (f64, f64),
    },
    PolygonCondition {
        x: String,
        y: String,
        polygon: Vec<(f64, f64)>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Json,
}

fn format_for(path: &Path) -> Result<ConfigFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Ok(ConfigFormat::Toml),
        Some("json") => Ok(ConfigFormat::Json),
        _ => Err(A2Error::Config(format!(
            "unsupported config file extension: {:?}",
            path
        ))),
    }
}

impl AnalysisConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| A2Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| A2Error::Config(format!("Failed to parse JSON: {}", e)))
    }

    /// Load from a `.toml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = format_for(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            A2Error::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let parsed = match format {
            ConfigFormat::Toml => Self::from_toml_str(&content),
            ConfigFormat::Json => Self::from_json_str(&content),
        };
        parsed.map_err(|e| e.with_context(format!("{:?}", path)))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = match format_for(path)? {
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| A2Error::Config(format!("Failed to serialize config: {}", e)))?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)
                .map_err(|e| A2Error::Config(format!("Failed to serialize config: {}", e)))?,
        };

        std::fs::write(path, content).map_err(|e| {
            A2Error::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Number of sources and operators over all events.
    pub fn node_count(&self) -> usize {
        self.events
            .iter()
            .map(|e| e.sources.len() + e.operators.len())
            .sum()
    }
}

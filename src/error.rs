//! Error handling for the a2 analysis engine
//!
//! This module defines the error type and Result alias used throughout the
//! crate. Errors only ever occur while a run's graph is being constructed or
//! while files are opened and closed at run boundaries. Per-event numeric
//! problems (NaN inputs, singular divisors, empty selections) are not errors;
//! they propagate as the invalid parameter sentinel.

use thiserror::Error;

/// Main error type for a2 operations
#[derive(Error, Debug)]
pub enum A2Error {
    /// The arena ran out of space while building a run's graph
    #[error("Out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory { requested: usize, available: usize },

    /// A data filter pattern could not be parsed
    #[error("Filter error: {0}")]
    Filter(String),

    /// A list filter has an invalid word count or too many filters
    #[error("List filter error: {0}")]
    ListFilter(String),

    /// Errors raised while wiring sources and operators together
    #[error("Build error: {0}")]
    Build(String),

    /// Semantic errors from the expression operator's begin/step scripts
    #[error("Expression error: {0}")]
    Expression(String),

    /// Errors related to configuration loading
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<A2Error>,
    },
}

impl A2Error {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        A2Error::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create an expression error from a Rhai error
    pub fn from_rhai_error(err: Box<rhai::EvalAltResult>) -> Self {
        A2Error::Expression(err.to_string())
    }

    /// Returns the innermost error, skipping any context wrappers
    pub fn root(&self) -> &A2Error {
        match self {
            A2Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result type alias for a2 operations
pub type Result<T> = std::result::Result<T, A2Error>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, Box<rhai::EvalAltResult>> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| A2Error::from_rhai_error(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| A2Error::from_rhai_error(e).with_context(f()))
    }
}

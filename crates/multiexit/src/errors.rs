//! Error types emitted while building or running a multi-exit encoder.

use thiserror::Error;

/// Failures raised by the multi-exit engine.
///
/// Early termination is never reported through this type; it travels as a
/// [`StageStep::Exit`](crate::controller::StageStep::Exit) value instead.
#[derive(Debug, Error)]
pub enum ExitError {
    /// A structural setting is unusable (zero stages, zero classes, ...).
    #[error("invalid multi-exit configuration: {0}")]
    InvalidConfig(String),
    /// A per-stage threshold list does not cover every stage.
    #[error("expected {expected} exit thresholds, got {actual}")]
    ThresholdMismatch { expected: usize, actual: usize },
    /// A parameter required for initialization was not supplied.
    #[error("missing parameter `{0}`")]
    MissingParameter(String),
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {0}")]
    Shape(String),
    /// A backend failure propagated from candle.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl ExitError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ExitError>;

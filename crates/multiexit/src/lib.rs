//! Multi-exit staged encoder.
//!
//! A backbone of `N` sequential stages is interleaved with one exit head per
//! stage. At inference time the running ensemble of head scores is scored by
//! predictive entropy after every stage, and the pass ends as soon as it falls
//! below that stage's threshold.

pub mod checks;
pub mod confidence;
pub mod config;
pub mod controller;
pub mod encoder;
pub mod errors;
pub mod head;
pub mod stats;

pub use confidence::{entropy, entropy_values};
pub use config::{ExitPolicy, ExitThresholds, MultiExitConfig, ThresholdSpec, DISABLED_THRESHOLD};
pub use controller::{ExitPackage, ExitRecord, StageStep, StagedExitController};
pub use encoder::{EncoderOutput, InferenceReport, MultiExitEncoder, Stage};
pub use errors::{ExitError, Result};
pub use head::{init_exit_poolers, ExitHead, FinalHead, HeadOutput, Pooler};
pub use stats::ExitStatistics;

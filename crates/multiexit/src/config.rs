use serde::Deserialize;

use crate::errors::{ExitError, Result};

/// Threshold sentinel no entropy can fall below, which disables early exit.
pub const DISABLED_THRESHOLD: f32 = -1.0;

/// Structural configuration of the multi-exit encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiExitConfig {
    /// Number of backbone stages, and therefore of exit heads.
    pub num_stages: usize,
    /// Width of the representation handed between stages.
    pub hidden_dim: usize,
    /// Number of classes; `1` selects regression semantics.
    pub num_classes: usize,
    /// Dropout applied to the classifier input of every head during training.
    pub hidden_dropout: f32,
    /// How the exit decision is applied across a batch.
    pub policy: ExitPolicy,
}

impl MultiExitConfig {
    pub fn new(num_stages: usize, hidden_dim: usize, num_classes: usize) -> Self {
        Self {
            num_stages,
            hidden_dim,
            num_classes,
            hidden_dropout: 0.1,
            policy: ExitPolicy::default(),
        }
    }

    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.num_stages == 0 {
            return Err(ExitError::invalid_config(
                "num_stages must be greater than zero",
            ));
        }
        if self.hidden_dim == 0 {
            return Err(ExitError::invalid_config(
                "hidden_dim must be greater than zero",
            ));
        }
        if self.num_classes == 0 {
            return Err(ExitError::invalid_config(
                "num_classes must be greater than zero",
            ));
        }
        if !(0.0..1.0).contains(&self.hidden_dropout) {
            return Err(ExitError::invalid_config(format!(
                "hidden_dropout must be in [0, 1) (got {})",
                self.hidden_dropout
            )));
        }
        Ok(())
    }

    /// Regression heads emit a single score and never exit on entropy.
    pub fn is_regression(&self) -> bool {
        self.num_classes == 1
    }
}

/// Scope of the early-exit decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPolicy {
    /// The whole batch leaves the stage loop once every row is confident.
    #[default]
    Batch,
    /// Confident rows leave individually; remaining rows keep running.
    PerExample,
}

/// Threshold settings as written in configuration files: one value for all
/// stages or an explicit per-stage list.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ThresholdSpec {
    Broadcast(f32),
    PerStage(Vec<f32>),
}

impl Default for ThresholdSpec {
    fn default() -> Self {
        Self::Broadcast(DISABLED_THRESHOLD)
    }
}

impl ThresholdSpec {
    pub fn resolve(&self, num_stages: usize) -> Result<ExitThresholds> {
        match self {
            ThresholdSpec::Broadcast(value) => ExitThresholds::broadcast(*value, num_stages),
            ThresholdSpec::PerStage(values) => {
                ExitThresholds::per_stage(values.clone(), num_stages)
            }
        }
    }
}

/// Entropy thresholds, one per stage.
///
/// A stage exits when the running-ensemble entropy is strictly below its
/// threshold. The list length is fixed to the stage count at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitThresholds {
    values: Vec<f32>,
}

impl ExitThresholds {
    pub fn broadcast(value: f32, num_stages: usize) -> Result<Self> {
        if num_stages == 0 {
            return Err(ExitError::invalid_config(
                "thresholds require at least one stage",
            ));
        }
        check_finite(&[value])?;
        Ok(Self {
            values: vec![value; num_stages],
        })
    }

    pub fn per_stage(values: Vec<f32>, num_stages: usize) -> Result<Self> {
        if num_stages == 0 {
            return Err(ExitError::invalid_config(
                "thresholds require at least one stage",
            ));
        }
        if values.len() != num_stages {
            return Err(ExitError::ThresholdMismatch {
                expected: num_stages,
                actual: values.len(),
            });
        }
        check_finite(&values)?;
        Ok(Self { values })
    }

    /// Thresholds that no computed entropy can satisfy.
    pub fn disabled(num_stages: usize) -> Result<Self> {
        Self::broadcast(DISABLED_THRESHOLD, num_stages)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, stage: usize) -> Option<f32> {
        self.values.get(stage).copied()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

/// Rejects NaN and infinite thresholds.
fn check_finite(values: &[f32]) -> Result<()> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(stage) => Err(ExitError::invalid_config(format!(
            "threshold for stage {} must be finite (got {})",
            stage, values[stage]
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_fills_every_stage() -> anyhow::Result<()> {
        let thresholds = ExitThresholds::broadcast(0.3, 4)?;
        assert_eq!(thresholds.as_slice(), &[0.3, 0.3, 0.3, 0.3]);
        assert_eq!(thresholds.get(3), Some(0.3));
        assert_eq!(thresholds.get(4), None);
        Ok(())
    }

    #[test]
    fn per_stage_length_must_match() {
        let err = ExitThresholds::per_stage(vec![0.1, 0.2], 3).unwrap_err();
        assert!(matches!(
            err,
            ExitError::ThresholdMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn non_finite_thresholds_rejected() {
        assert!(ExitThresholds::broadcast(f32::NAN, 3).is_err());
        assert!(ExitThresholds::broadcast(f32::INFINITY, 2).is_err());
        assert!(matches!(
            ExitThresholds::per_stage(vec![0.1, f32::NAN, 0.3], 3),
            Err(ExitError::InvalidConfig(_))
        ));
        assert!(ThresholdSpec::PerStage(vec![f32::NEG_INFINITY]).resolve(1).is_err());
        assert!(ExitThresholds::disabled(3).is_ok());
    }

    #[test]
    fn zero_stages_rejected() {
        assert!(ExitThresholds::broadcast(0.1, 0).is_err());
        assert!(MultiExitConfig::new(0, 8, 2).validate().is_err());
    }

    #[test]
    fn config_rejects_bad_dropout() {
        let mut config = MultiExitConfig::new(2, 8, 2);
        assert!(config.validate().is_ok());
        config.hidden_dropout = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn spec_resolves_both_forms() -> anyhow::Result<()> {
        let broadcast = ThresholdSpec::Broadcast(0.5).resolve(2)?;
        assert_eq!(broadcast.as_slice(), &[0.5, 0.5]);
        let explicit = ThresholdSpec::PerStage(vec![0.1, 0.2]).resolve(2)?;
        assert_eq!(explicit.as_slice(), &[0.1, 0.2]);
        assert!(ThresholdSpec::PerStage(vec![0.1]).resolve(2).is_err());
        let disabled = ThresholdSpec::default().resolve(3)?;
        assert!(disabled.as_slice().iter().all(|t| *t < 0.0));
        Ok(())
    }
}

//! Stage-by-stage exit state machine.
//!
//! [`StagedExitController`] consumes one exit head's scores per stage, keeps
//! the running ensemble (mean of every score vector seen so far) and decides
//! whether the pass continues. Leaving the stage loop is a value, not an
//! error: [`StageStep::Exit`] carries the [`ExitPackage`] the caller returns.

use candle_core::{DType, Tensor};

use crate::checks;
use crate::confidence;
use crate::config::ExitThresholds;
use crate::errors::{ExitError, Result};

/// Per-stage observation accumulated during a pass.
#[derive(Debug, Clone)]
pub struct ExitRecord {
    /// Running-ensemble scores after this stage, `(batch, num_classes)`.
    pub scores: Tensor,
    /// Pooled feature produced by this stage's head, `(batch, hidden)`.
    pub feature: Tensor,
    /// Entropy of `scores`, `(batch,)`; absent in training mode and for
    /// regression heads.
    pub confidence: Option<Tensor>,
}

/// Bundle emitted when a pass terminates before the last stage's classifier.
#[derive(Debug, Clone)]
pub struct ExitPackage {
    pub scores: Tensor,
    pub feature: Tensor,
    pub records: Vec<ExitRecord>,
    /// 1-based index of the terminating stage.
    pub exit_stage: usize,
}

/// Outcome of feeding one stage into the controller.
#[derive(Debug)]
pub enum StageStep {
    Continue,
    Exit(ExitPackage),
}

/// Tracks the running ensemble and applies per-stage entropy thresholds.
#[derive(Debug)]
pub struct StagedExitController<'a> {
    thresholds: &'a ExitThresholds,
    train: bool,
    score_sum: Option<Tensor>,
    observed: usize,
    records: Vec<ExitRecord>,
}

impl<'a> StagedExitController<'a> {
    pub fn new(thresholds: &'a ExitThresholds, train: bool) -> Self {
        Self {
            thresholds,
            train,
            score_sum: None,
            observed: 0,
            records: Vec::with_capacity(thresholds.len()),
        }
    }

    pub fn num_stages(&self) -> usize {
        self.thresholds.len()
    }

    /// Number of stages observed so far.
    pub fn observed(&self) -> usize {
        self.observed
    }

    pub fn records(&self) -> &[ExitRecord] {
        &self.records
    }

    /// Mean of every score vector observed so far.
    pub fn running_scores(&self) -> Result<Option<Tensor>> {
        match &self.score_sum {
            Some(sum) => Ok(Some(sum.affine(1.0 / self.observed as f64, 0.0)?)),
            None => Ok(None),
        }
    }

    /// Feeds stage `stage`'s head output and decides whether to leave the loop.
    ///
    /// Stages must arrive in order. In training mode the controller never
    /// exits. Regression scores (one column) are never scored for confidence.
    pub fn observe(&mut self, stage: usize, scores: &Tensor, feature: Tensor) -> Result<StageStep> {
        if stage != self.observed {
            return Err(ExitError::invalid_config(format!(
                "stage {stage} observed out of order (expected {})",
                self.observed
            )));
        }
        let threshold = self.thresholds.get(stage).ok_or_else(|| {
            ExitError::invalid_config(format!(
                "stage {stage} exceeds the {} configured stages",
                self.thresholds.len()
            ))
        })?;
        checks::expect_same_batch("controller.feature", scores, &feature)?;

        let score_sum = match self.score_sum.take() {
            None => scores.clone(),
            Some(sum) => {
                checks::expect_batch_width("controller.scores", scores, sum.dim(1)?)?;
                (sum + scores)?
            }
        };
        self.observed += 1;
        let running = score_sum.affine(1.0 / self.observed as f64, 0.0)?;
        self.score_sum = Some(score_sum);

        let regression = running.dim(1)? == 1;
        if self.train || regression {
            self.records.push(ExitRecord {
                scores: running,
                feature,
                confidence: None,
            });
            return Ok(StageStep::Continue);
        }

        let confidence = confidence::entropy(&running)?;
        let values = confidence.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let confident = !values.is_empty()
            && values
                .iter()
                .all(|value| value.is_finite() && *value < threshold);
        log::debug!(
            "stage {}/{} entropy={:?} threshold={} exit={}",
            stage + 1,
            self.num_stages(),
            values,
            threshold,
            confident
        );

        self.records.push(ExitRecord {
            scores: running.clone(),
            feature: feature.clone(),
            confidence: Some(confidence),
        });

        if confident {
            Ok(StageStep::Exit(ExitPackage {
                scores: running,
                feature,
                records: std::mem::take(&mut self.records),
                exit_stage: stage + 1,
            }))
        } else {
            Ok(StageStep::Continue)
        }
    }

    /// Hands back everything accumulated when the pass runs to completion.
    pub fn into_records(self) -> Vec<ExitRecord> {
        self.records
    }
}

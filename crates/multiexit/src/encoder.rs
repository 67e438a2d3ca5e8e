use std::collections::HashMap;

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::checks;
use crate::confidence;
use crate::config::{ExitPolicy, ExitThresholds, MultiExitConfig};
use crate::controller::{ExitPackage, ExitRecord, StageStep, StagedExitController};
use crate::errors::{ExitError, Result};
use crate::head::{self, ExitHead, FinalHead};

/// One unit of the backbone: maps a `(batch, seq, hidden)` representation to
/// an updated representation of the same layout.
pub trait Stage: Send + Sync {
    fn forward(&self, hidden: &Tensor, attention_mask: Option<&Tensor>)
        -> candle_core::Result<Tensor>;
}

impl<F> Stage for F
where
    F: Fn(&Tensor, Option<&Tensor>) -> candle_core::Result<Tensor> + Send + Sync,
{
    fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        self(hidden, attention_mask)
    }
}

/// Result of one pass through the encoder.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Scores finally used: the running ensemble on early exit, the final
    /// classifier otherwise.
    pub logits: Tensor,
    /// Pooled feature accompanying `logits`.
    pub feature: Tensor,
    /// Every stage observed before termination, in order.
    pub records: Vec<ExitRecord>,
    /// 1-based stage index at which the pass terminated.
    pub exit_stage: usize,
    pub early_exit: bool,
}

impl From<ExitPackage> for EncoderOutput {
    fn from(package: ExitPackage) -> Self {
        Self {
            logits: package.scores,
            feature: package.feature,
            records: package.records,
            exit_stage: package.exit_stage,
            early_exit: true,
        }
    }
}

impl EncoderOutput {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.logits.dim(0)?)
    }

    /// Running-ensemble scores recorded at `stage` (0-based), if it ran.
    pub fn stage_logits(&self, stage: usize) -> Option<&Tensor> {
        self.records.get(stage).map(|record| &record.scores)
    }

    /// Running-ensemble scores of every executed stage.
    pub fn stage_scores(&self) -> Vec<Tensor> {
        self.records
            .iter()
            .map(|record| record.scores.clone())
            .collect()
    }

    /// Entropy and per-stage confidences for cost/accuracy accounting.
    pub fn report(&self) -> Result<InferenceReport> {
        let entropy = confidence::entropy_values(&self.logits)?;
        let mut stage_confidences = Vec::with_capacity(self.records.len());
        for record in &self.records {
            if let Some(confidence) = &record.confidence {
                stage_confidences.push(
                    confidence
                        .to_dtype(candle_core::DType::F32)?
                        .to_vec1::<f32>()?,
                );
            }
        }
        Ok(InferenceReport {
            entropy,
            stage_confidences,
            exit_stage: self.exit_stage,
        })
    }
}

/// Inference metadata returned alongside the scores.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceReport {
    /// Predictive entropy of the scores finally used, per example.
    pub entropy: Vec<f32>,
    /// Confidence values observed at each executed stage.
    pub stage_confidences: Vec<Vec<f32>>,
    pub exit_stage: usize,
}

/// Backbone stages interleaved with exit heads and an entropy controller.
pub struct MultiExitEncoder {
    config: MultiExitConfig,
    stages: Vec<Box<dyn Stage>>,
    heads: Vec<ExitHead>,
    final_head: FinalHead,
    thresholds: ExitThresholds,
}

impl std::fmt::Debug for MultiExitEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiExitEncoder")
            .field("config", &self.config)
            .field("thresholds", &self.thresholds)
            .finish()
    }
}

impl MultiExitEncoder {
    /// Builds one exit head per stage plus the final classifier.
    ///
    /// Parameters live under `exits.{i}` and `final` inside `vb`.
    pub fn new(
        config: MultiExitConfig,
        stages: Vec<Box<dyn Stage>>,
        thresholds: ExitThresholds,
        vb: VarBuilder,
    ) -> Result<Self> {
        config.validate()?;
        if stages.len() != config.num_stages {
            return Err(ExitError::invalid_config(format!(
                "expected {} backbone stages, got {}",
                config.num_stages,
                stages.len()
            )));
        }
        if thresholds.len() != config.num_stages {
            return Err(ExitError::ThresholdMismatch {
                expected: config.num_stages,
                actual: thresholds.len(),
            });
        }

        let heads = (0..config.num_stages)
            .map(|idx| ExitHead::new(idx, &config, vb.pp(format!("exits.{idx}"))))
            .collect::<Result<Vec<_>>>()?;
        let final_head = FinalHead::new(&config, vb.pp("final"))?;

        log::info!(
            "multi-exit encoder stages={} hidden={} classes={} policy={:?} thresholds={:?}",
            config.num_stages,
            config.hidden_dim,
            config.num_classes,
            config.policy,
            thresholds.as_slice()
        );

        Ok(Self {
            config,
            stages,
            heads,
            final_head,
            thresholds,
        })
    }

    pub fn config(&self) -> &MultiExitConfig {
        &self.config
    }

    pub fn num_stages(&self) -> usize {
        self.config.num_stages
    }

    pub fn thresholds(&self) -> &ExitThresholds {
        &self.thresholds
    }

    pub fn heads(&self) -> &[ExitHead] {
        &self.heads
    }

    /// Replaces the exit thresholds between runs.
    pub fn set_thresholds(&mut self, thresholds: ExitThresholds) -> Result<()> {
        if thresholds.len() != self.config.num_stages {
            return Err(ExitError::ThresholdMismatch {
                expected: self.config.num_stages,
                actual: thresholds.len(),
            });
        }
        log::info!("exit thresholds set to {:?}", thresholds.as_slice());
        self.thresholds = thresholds;
        Ok(())
    }

    /// Copies an external pooling module into every exit head's pooler.
    pub fn init_exit_poolers(&mut self, source: &HashMap<String, Tensor>) -> Result<()> {
        head::init_exit_poolers(source, &mut self.heads)
    }

    /// Seeds every exit head's pooler from the final classifier's pooler.
    pub fn init_exit_poolers_from_final(&mut self) -> Result<()> {
        let mut source = HashMap::new();
        for (name, tensor) in self.final_head.pooler().parameters()? {
            source.insert(name, tensor.copy()?);
        }
        head::init_exit_poolers(&source, &mut self.heads)
    }

    /// Runs the configured exit policy in inference mode, one output per
    /// batch under [`ExitPolicy::Batch`] or per example otherwise.
    pub fn infer(&self, hidden: &Tensor, attention_mask: Option<&Tensor>) -> Result<Vec<EncoderOutput>> {
        match self.config.policy {
            ExitPolicy::Batch => Ok(vec![self.forward(hidden, attention_mask, false)?]),
            ExitPolicy::PerExample => self.forward_per_example(hidden, attention_mask),
        }
    }

    /// Runs the stage loop with a batch-wide exit decision.
    ///
    /// With `train` set every stage executes and no confidence is computed.
    pub fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<EncoderOutput> {
        self.check_input(hidden, attention_mask)?;
        let mut controller = StagedExitController::new(&self.thresholds, train);
        let mut hidden = hidden.clone();
        let mut previous: Option<Tensor> = None;

        for (idx, (stage, head)) in self.stages.iter().zip(self.heads.iter()).enumerate() {
            hidden = stage.forward(&hidden, attention_mask)?;
            let out = head.forward(&hidden, previous.as_ref(), train)?;
            if let StageStep::Exit(package) = controller.observe(idx, &out.scores, out.feature)? {
                return Ok(package.into());
            }
            previous = Some(out.scores);
        }

        let out = self.final_head.forward(&hidden, train)?;
        Ok(EncoderOutput {
            logits: out.scores,
            feature: out.feature,
            records: controller.into_records(),
            exit_stage: self.config.num_stages,
            early_exit: false,
        })
    }

    /// Inference where each example leaves the loop on its own confidence.
    ///
    /// Exited rows are dropped from the representation, mask and previous
    /// scores so later stages only run on still-active rows. Outputs are
    /// returned in example order, each with a batch dimension of one.
    pub fn forward_per_example(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Vec<EncoderOutput>> {
        self.check_input(hidden, attention_mask)?;
        let batch = hidden.dim(0)?;
        let mut controllers: Vec<StagedExitController> = (0..batch)
            .map(|_| StagedExitController::new(&self.thresholds, false))
            .collect();
        let mut finished: Vec<Option<EncoderOutput>> = (0..batch).map(|_| None).collect();
        let mut active: Vec<usize> = (0..batch).collect();
        let mut hidden = hidden.clone();
        let mut mask = attention_mask.cloned();
        let mut previous: Option<Tensor> = None;

        for (idx, (stage, head)) in self.stages.iter().zip(self.heads.iter()).enumerate() {
            hidden = stage.forward(&hidden, mask.as_ref())?;
            let out = head.forward(&hidden, previous.as_ref(), false)?;

            let mut keep = Vec::with_capacity(active.len());
            for (pos, &row) in active.iter().enumerate() {
                let scores = out.scores.narrow(0, pos, 1)?;
                let feature = out.feature.narrow(0, pos, 1)?;
                match controllers[row].observe(idx, &scores, feature)? {
                    StageStep::Exit(package) => finished[row] = Some(package.into()),
                    StageStep::Continue => keep.push(pos),
                }
            }

            if keep.is_empty() {
                active.clear();
                break;
            }
            if keep.len() == active.len() {
                previous = Some(out.scores);
            } else {
                let ids: Vec<u32> = keep.iter().map(|pos| *pos as u32).collect();
                let ids = Tensor::from_vec(ids, keep.len(), hidden.device())?;
                hidden = hidden.index_select(&ids, 0)?;
                mask = mask.map(|m| m.index_select(&ids, 0)).transpose()?;
                previous = Some(out.scores.index_select(&ids, 0)?);
                active = keep.iter().map(|pos| active[*pos]).collect();
                log::debug!(
                    "stage {}: {} of {} examples still active",
                    idx + 1,
                    active.len(),
                    batch
                );
            }
        }

        if !active.is_empty() {
            let out = self.final_head.forward(&hidden, false)?;
            for (row, controller) in controllers.into_iter().enumerate() {
                let Some(pos) = active.iter().position(|r| *r == row) else {
                    continue;
                };
                finished[row] = Some(EncoderOutput {
                    logits: out.scores.narrow(0, pos, 1)?,
                    feature: out.feature.narrow(0, pos, 1)?,
                    records: controller.into_records(),
                    exit_stage: self.config.num_stages,
                    early_exit: false,
                });
            }
        }

        finished
            .into_iter()
            .enumerate()
            .map(|(row, output)| {
                output.ok_or_else(|| ExitError::shape(format!("example {row} produced no output")))
            })
            .collect()
    }

    fn check_input(&self, hidden: &Tensor, attention_mask: Option<&Tensor>) -> Result<()> {
        checks::expect_batch_seq_hidden("encoder.input", hidden, self.config.hidden_dim)?;
        if hidden.dim(0)? == 0 {
            return Err(ExitError::shape("encoder.input batch must be non-empty"));
        }
        if let Some(mask) = attention_mask {
            checks::expect_same_batch("encoder.attention_mask", hidden, mask)?;
        }
        Ok(())
    }
}

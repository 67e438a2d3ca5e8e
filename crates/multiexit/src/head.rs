//! Exit heads attached after every backbone stage.
//!
//! Each head pools the stage output at its first sequence position through a
//! tanh-activated dense layer. Stage 0 classifies the pooled vector alone;
//! later stages append the previous stage's raw scores before classifying,
//! which chains the heads into a cascade.

use std::collections::HashMap;

use candle_core::{Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

use crate::checks;
use crate::config::MultiExitConfig;
use crate::errors::{ExitError, Result};

/// Parameter names expected in a pooling source mapping.
pub const POOLER_WEIGHT: &str = "dense.weight";
pub const POOLER_BIAS: &str = "dense.bias";

/// First-position dense + tanh pooling.
#[derive(Debug, Clone)]
pub struct Pooler {
    dense: Linear,
    hidden_dim: usize,
}

impl Pooler {
    pub fn new(hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let dense = candle_nn::linear(hidden_dim, hidden_dim, vb.pp("dense"))?;
        Ok(Self { dense, hidden_dim })
    }

    /// Reduces `(batch, seq, hidden)` to `(batch, hidden)`.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("pooler.input", hidden, self.hidden_dim)?;
        let first = hidden.narrow(1, 0, 1)?.squeeze(1)?;
        Ok(self.dense.forward(&first)?.tanh()?)
    }

    /// Named view of the pooling parameters, usable as an initialization source.
    pub fn parameters(&self) -> Result<HashMap<String, Tensor>> {
        let mut params = HashMap::new();
        params.insert(POOLER_WEIGHT.to_string(), self.dense.weight().clone());
        let bias = self
            .dense
            .bias()
            .ok_or_else(|| ExitError::MissingParameter(POOLER_BIAS.to_string()))?;
        params.insert(POOLER_BIAS.to_string(), bias.clone());
        Ok(params)
    }

    /// Overwrites the pooling parameters in place with copies from `source`.
    ///
    /// Writing into the existing storage keeps any `VarMap` that owns these
    /// tensors pointing at the new values.
    fn load(&mut self, source: &HashMap<String, Tensor>) -> Result<()> {
        let weight = source
            .get(POOLER_WEIGHT)
            .ok_or_else(|| ExitError::MissingParameter(POOLER_WEIGHT.to_string()))?;
        let bias = source
            .get(POOLER_BIAS)
            .ok_or_else(|| ExitError::MissingParameter(POOLER_BIAS.to_string()))?;

        let target_weight = self.dense.weight();
        if weight.dims() != target_weight.dims() {
            return Err(ExitError::shape(format!(
                "pooler weight expected {:?}, got {:?}",
                target_weight.dims(),
                weight.dims()
            )));
        }
        let target_bias = self
            .dense
            .bias()
            .ok_or_else(|| ExitError::MissingParameter(POOLER_BIAS.to_string()))?;
        if bias.dims() != target_bias.dims() {
            return Err(ExitError::shape(format!(
                "pooler bias expected {:?}, got {:?}",
                target_bias.dims(),
                bias.dims()
            )));
        }

        let weight = weight
            .to_device(target_weight.device())?
            .to_dtype(target_weight.dtype())?
            .contiguous()?;
        let bias = bias
            .to_device(target_bias.device())?
            .to_dtype(target_bias.dtype())?
            .contiguous()?;
        target_weight.slice_set(&weight, 0, 0)?;
        target_bias.slice_set(&bias, 0, 0)?;
        Ok(())
    }
}

/// Output of one exit head.
#[derive(Debug, Clone)]
pub struct HeadOutput {
    /// Raw class scores `(batch, num_classes)`.
    pub scores: Tensor,
    /// Pooled representation `(batch, hidden)`.
    pub feature: Tensor,
}

/// Classifier attached after a single backbone stage.
#[derive(Debug, Clone)]
pub struct ExitHead {
    stage: usize,
    num_classes: usize,
    pooler: Pooler,
    dropout: Dropout,
    classifier: Linear,
}

impl ExitHead {
    pub fn new(stage: usize, config: &MultiExitConfig, vb: VarBuilder) -> Result<Self> {
        let pooler = Pooler::new(config.hidden_dim, vb.pp("pooler"))?;
        let in_dim = if stage == 0 {
            config.hidden_dim
        } else {
            config.hidden_dim + config.num_classes
        };
        let classifier = candle_nn::linear(in_dim, config.num_classes, vb.pp("classifier"))?;
        Ok(Self {
            stage,
            num_classes: config.num_classes,
            pooler,
            dropout: Dropout::new(config.hidden_dropout),
            classifier,
        })
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn pooler(&self) -> &Pooler {
        &self.pooler
    }

    /// Scores the stage output, conditioning on `previous` for stages past 0.
    pub fn forward(
        &self,
        hidden: &Tensor,
        previous: Option<&Tensor>,
        train: bool,
    ) -> Result<HeadOutput> {
        let feature = self.pooler.forward(hidden)?;
        let classifier_input = match (self.stage, previous) {
            (0, _) => feature.clone(),
            (_, Some(previous)) => {
                checks::expect_batch_width("exit_head.previous", previous, self.num_classes)?;
                checks::expect_same_batch("exit_head.previous", &feature, previous)?;
                Tensor::cat(&[&feature, previous], D::Minus1)?
            }
            (stage, None) => {
                return Err(ExitError::shape(format!(
                    "exit head {stage} requires the previous stage's scores"
                )))
            }
        };
        let dropped = self.dropout.forward(&classifier_input, train)?;
        let scores = self.classifier.forward(&dropped)?;
        Ok(HeadOutput { scores, feature })
    }
}

/// Classifier applied after the last stage when no early exit happens.
#[derive(Debug, Clone)]
pub struct FinalHead {
    pooler: Pooler,
    dropout: Dropout,
    classifier: Linear,
}

impl FinalHead {
    pub fn new(config: &MultiExitConfig, vb: VarBuilder) -> Result<Self> {
        let pooler = Pooler::new(config.hidden_dim, vb.pp("pooler"))?;
        let classifier =
            candle_nn::linear(config.hidden_dim, config.num_classes, vb.pp("classifier"))?;
        Ok(Self {
            pooler,
            dropout: Dropout::new(config.hidden_dropout),
            classifier,
        })
    }

    pub fn pooler(&self) -> &Pooler {
        &self.pooler
    }

    pub fn forward(&self, hidden: &Tensor, train: bool) -> Result<HeadOutput> {
        let feature = self.pooler.forward(hidden)?;
        let dropped = self.dropout.forward(&feature, train)?;
        let scores = self.classifier.forward(&dropped)?;
        Ok(HeadOutput { scores, feature })
    }
}

/// Copies one pooling module's parameters into the pooler of every head.
///
/// This is a one-time setup step; it never runs on the forward path.
pub fn init_exit_poolers(
    source: &HashMap<String, Tensor>,
    heads: &mut [ExitHead],
) -> Result<()> {
    for head in heads.iter_mut() {
        head.pooler.load(source)?;
    }
    log::info!("initialized {} exit poolers from shared source", heads.len());
    Ok(())
}

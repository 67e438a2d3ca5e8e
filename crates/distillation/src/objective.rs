use candle_core::Tensor;
use candle_nn::VarBuilder;
use multiexit::EncoderOutput;

use crate::loss::{
    scalar, CascadedDistillationLoss, DistillationLossOutput, LossStrategy, LossSummary, TaskLoss,
};
use crate::DistillationError;

/// Training objective resolved from a [`LossStrategy`].
#[derive(Debug)]
pub enum Objective {
    Distillation(CascadedDistillationLoss),
    PlainTask(TaskLoss),
}

#[derive(Debug, Clone)]
pub struct ObjectiveOutput {
    pub loss: Tensor,
    /// Present for the distillation objective only.
    pub breakdown: Option<DistillationLossOutput>,
}

impl ObjectiveOutput {
    pub fn summary(&self) -> Result<LossSummary, DistillationError> {
        match &self.breakdown {
            Some(breakdown) => breakdown.summary(),
            None => Ok(LossSummary {
                loss: scalar(&self.loss)?,
                ..LossSummary::default()
            }),
        }
    }
}

impl Objective {
    /// Distillation parameters are created under `vb.pp("peer_attention")`.
    pub fn new(
        strategy: &LossStrategy,
        num_classes: usize,
        vb: VarBuilder,
    ) -> Result<Self, DistillationError> {
        let objective = match strategy {
            LossStrategy::Distillation(params) => Objective::Distillation(
                CascadedDistillationLoss::new(*params, num_classes, vb.pp("peer_attention"))?,
            ),
            LossStrategy::PlainTask => Objective::PlainTask(TaskLoss::new(num_classes)),
        };
        log::info!("training objective: {:?}", strategy);
        Ok(objective)
    }

    /// Scores an encoder pass against `labels`.
    ///
    /// The final logits double as detached soft targets for regression.
    pub fn compute(
        &self,
        output: &EncoderOutput,
        labels: &Tensor,
        train: bool,
    ) -> Result<ObjectiveOutput, DistillationError> {
        match self {
            Objective::Distillation(loss) => {
                let stage_scores = output.stage_scores();
                let soft_targets = output.logits.detach();
                let breakdown =
                    loss.compute(&output.logits, &stage_scores, labels, &soft_targets, train)?;
                Ok(ObjectiveOutput {
                    loss: breakdown.loss.clone(),
                    breakdown: Some(breakdown),
                })
            }
            Objective::PlainTask(loss) => Ok(ObjectiveOutput {
                loss: loss.compute(&output.logits, labels)?,
                breakdown: None,
            }),
        }
    }
}

//! Training side of the multi-exit encoder: cascaded peer-ensemble
//! distillation, the plain task objective, run configuration and metric
//! logging.

pub mod config;
pub mod logging;
pub mod loss;
pub mod objective;
pub mod peer;

pub use config::{DistillationError, ExitConfig, LoggingConfig, ModelConfig, RunConfig};
pub use logging::{Logger, LoggingSettings};
pub use loss::{
    stage_loss_weight, total_stage_weight, CascadedDistillationLoss, DistillationLossOutput,
    DistillationParams, LossStrategy, LossSummary, TaskLoss,
};
pub use objective::{Objective, ObjectiveOutput};
pub use peer::PeerEnsembleAttention;

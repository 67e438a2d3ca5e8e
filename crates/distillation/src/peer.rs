use candle_core::{Error, Result as CandleResult, Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder};

/// Single-head self-attention across exit stages.
///
/// Every stage's score vector attends to the score vectors of all stages,
/// producing a per-stage peer consensus that serves as a soft target.
#[derive(Debug)]
pub struct PeerEnsembleAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    dropout: Dropout,
    num_classes: usize,
    scale: f64,
}

impl PeerEnsembleAttention {
    pub fn new(num_classes: usize, dropout: f32, vb: VarBuilder) -> CandleResult<Self> {
        if num_classes == 0 {
            return Err(Error::Msg(
                "peer attention requires at least one class".into(),
            ));
        }
        let query = candle_nn::linear(num_classes, num_classes, vb.pp("query"))?;
        let key = candle_nn::linear(num_classes, num_classes, vb.pp("key"))?;
        let value = candle_nn::linear(num_classes, num_classes, vb.pp("value"))?;
        Ok(Self {
            query,
            key,
            value,
            dropout: Dropout::new(dropout),
            num_classes,
            scale: 1.0 / (num_classes as f64).sqrt(),
        })
    }

    /// Attends over `(batch, stages, classes)` and returns the same layout.
    pub fn forward(&self, stage_scores: &Tensor, train: bool) -> CandleResult<Tensor> {
        let (_batch, _stages, classes) = stage_scores.dims3()?;
        if classes != self.num_classes {
            return Err(Error::Msg(format!(
                "peer attention expected {} classes, got {}",
                self.num_classes, classes
            )));
        }

        let queries = self.query.forward(stage_scores)?;
        let keys = self.key.forward(stage_scores)?;
        let values = self.value.forward(stage_scores)?;

        let scores = queries
            .matmul(&keys.transpose(1, 2)?.contiguous()?)?
            .affine(self.scale, 0.0)?;
        // softmax_last_dim has no backward pass; query and key must train
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let weights = self.dropout.forward(&weights, train)?;
        weights.matmul(&values)
    }

    /// Peer targets for a list of `(batch, classes)` stage scores.
    ///
    /// Inputs are detached so the targets never push gradients back into the
    /// exit heads; the attention projections themselves stay trainable.
    pub fn peer_targets(&self, stage_scores: &[Tensor], train: bool) -> CandleResult<Vec<Tensor>> {
        if stage_scores.is_empty() {
            return Err(Error::Msg("peer attention requires at least one stage".into()));
        }
        let detached: Vec<Tensor> = stage_scores.iter().map(|s| s.detach()).collect();
        let stacked = Tensor::stack(&detached, 1)?;
        let attended = self.forward(&stacked, train)?;
        (0..stage_scores.len())
            .map(|idx| attended.narrow(1, idx, 1)?.squeeze(1))
            .collect()
    }
}

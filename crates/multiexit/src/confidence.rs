//! Predictive-entropy confidence for raw class scores.

use candle_core::{Tensor, D};

use crate::checks;
use crate::errors::{ExitError, Result};

/// Shannon entropy of `softmax(scores)` per row, shaped `(batch,)`.
///
/// Uses `log(Σe^x) - Σ(x·e^x)/Σe^x` on max-shifted scores, so no normalized
/// probability is ever materialised and `exp` cannot overflow for finite
/// input. Non-finite scores yield non-finite entropies.
pub fn entropy(scores: &Tensor) -> Result<Tensor> {
    let dims = scores.dims();
    let classes = match dims {
        [_, classes] if *classes > 0 => *classes,
        _ => {
            return Err(ExitError::shape(format!(
                "entropy expects (batch, classes>0) scores, got {dims:?}"
            )))
        }
    };
    checks::expect_batch_width("entropy.scores", scores, classes)?;

    let shifted = scores.broadcast_sub(&scores.max_keepdim(D::Minus1)?)?;
    let exp = shifted.exp()?;
    let normalizer = exp.sum(D::Minus1)?;
    let weighted = (&shifted * &exp)?.sum(D::Minus1)?;
    let entropy = (normalizer.log()? - (weighted / normalizer)?)?;
    Ok(entropy)
}

/// Host-side copy of [`entropy`] for exit decisions and reporting.
pub fn entropy_values(scores: &Tensor) -> Result<Vec<f32>> {
    let values = entropy(scores)?.to_dtype(candle_core::DType::F32)?;
    Ok(values.to_vec1::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn scores(rows: &[&[f32]]) -> anyhow::Result<Tensor> {
        let width = rows[0].len();
        let flat: Vec<f32> = rows.iter().flat_map(|row| row.iter().copied()).collect();
        Ok(Tensor::from_vec(flat, (rows.len(), width), &Device::Cpu)?)
    }

    #[test]
    fn uniform_scores_give_log_classes() -> anyhow::Result<()> {
        for classes in [2usize, 3, 5] {
            let row = vec![0.7f32; classes];
            let values = entropy_values(&scores(&[&row])?)?;
            assert!((values[0] - (classes as f32).ln()).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn invariant_under_constant_shift() -> anyhow::Result<()> {
        let base = entropy_values(&scores(&[&[2.0, -1.0, 0.5], &[0.1, 0.2, 0.3]])?)?;
        let shifted = entropy_values(&scores(&[&[102.0, 99.0, 100.5], &[-9.9, -9.8, -9.7]])?)?;
        for (a, b) in base.iter().zip(shifted.iter()) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
        Ok(())
    }

    #[test]
    fn matches_hand_computed_two_class_entropy() -> anyhow::Result<()> {
        let values = entropy_values(&scores(&[&[2.0, 0.0], &[1.5, 0.5]])?)?;
        let p = 1.0f32 / (1.0 + (-2.0f32).exp());
        let expected = -(p * p.ln() + (1.0 - p) * (1.0 - p).ln());
        assert!((values[0] - expected).abs() < 1e-5);
        assert!((values[0] - 0.3653).abs() < 1e-3);
        assert!((values[1] - 0.5822).abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn large_scores_stay_finite() -> anyhow::Result<()> {
        let values = entropy_values(&scores(&[&[500.0, -500.0]])?)?;
        assert!(values[0].is_finite());
        assert!(values[0] < 1e-6);
        Ok(())
    }

    #[test]
    fn non_finite_scores_propagate() -> anyhow::Result<()> {
        let values = entropy_values(&scores(&[&[f32::NAN, 0.0]])?)?;
        assert!(!values[0].is_finite());
        Ok(())
    }

    #[test]
    fn rejects_wrong_rank() -> anyhow::Result<()> {
        let flat = Tensor::zeros(4, candle_core::DType::F32, &Device::Cpu)?;
        assert!(entropy(&flat).is_err());
        Ok(())
    }
}

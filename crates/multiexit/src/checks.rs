//! Shape assertions shared by the exit heads and the stage driver.
//!
//! Each helper returns [`crate::Result`] so call sites can propagate a
//! descriptive [`ExitError::Shape`] instead of panicking deep inside candle.

use candle_core::Tensor;

use crate::errors::{ExitError, Result};

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, seq, actual] if *actual == hidden && *seq > 0 => Ok(()),
        dims => Err(ExitError::shape(format!(
            "{context} expected (batch, seq>0, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Validates a `(batch, width)` score or feature matrix.
pub fn expect_batch_width(context: &str, tensor: &Tensor, width: usize) -> Result<()> {
    match tensor.dims() {
        [_, actual] if *actual == width => Ok(()),
        dims => Err(ExitError::shape(format!(
            "{context} expected (batch, {width}) layout, got {dims:?}"
        ))),
    }
}

/// Ensures two tensors agree on their leading (batch) dimension.
pub fn expect_same_batch(context: &str, lhs: &Tensor, rhs: &Tensor) -> Result<()> {
    let left = lhs.dims().first().copied();
    let right = rhs.dims().first().copied();
    if left.is_some() && left == right {
        Ok(())
    } else {
        Err(ExitError::shape(format!(
            "{context} batch mismatch: {:?} vs {:?}",
            lhs.dims(),
            rhs.dims()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn batch_seq_hidden_rejects_wrong_width() -> anyhow::Result<()> {
        let tensor = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu)?;
        assert!(expect_batch_seq_hidden("probe", &tensor, 4).is_ok());
        let err = expect_batch_seq_hidden("probe", &tensor, 5).unwrap_err();
        assert!(err.to_string().contains("probe"));
        Ok(())
    }

    #[test]
    fn batch_seq_hidden_rejects_empty_sequence() -> anyhow::Result<()> {
        let tensor = Tensor::zeros((2, 0, 4), DType::F32, &Device::Cpu)?;
        assert!(expect_batch_seq_hidden("probe", &tensor, 4).is_err());
        Ok(())
    }

    #[test]
    fn same_batch_compares_leading_dim() -> anyhow::Result<()> {
        let a = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        let b = Tensor::zeros((2, 7), DType::F32, &Device::Cpu)?;
        let c = Tensor::zeros((3, 3), DType::F32, &Device::Cpu)?;
        assert!(expect_same_batch("pair", &a, &b).is_ok());
        assert!(expect_same_batch("pair", &a, &c).is_err());
        assert!(expect_batch_width("scores", &a, 3).is_ok());
        assert!(expect_batch_width("scores", &b, 3).is_err());
        Ok(())
    }
}

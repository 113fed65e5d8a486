//! Task kind: selects the loss criterion and the accuracy metric.

use candle_core::{D, DType, Tensor};
use serde::{Deserialize, Serialize};

/// What the targets of a batch mean.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Integer class labels, shape `[batch]`; model outputs logits `[batch, classes]`.
    #[default]
    Classification,
    /// Real-valued targets with the same shape as the model output.
    Regression,
}

impl TaskKind {
    /// Cross-entropy over logits for classification, mean squared error for regression.
    pub fn loss(&self, output: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Classification => candle_nn::loss::cross_entropy(output, targets),
            Self::Regression => candle_nn::loss::mse(output, targets),
        }
    }

    /// Fraction of rows whose arg-max matches the label.
    ///
    /// Regression has no accuracy; it reports `0.0` so every record carries the
    /// same metric names. Do not read anything into that value.
    pub fn accuracy(&self, output: &Tensor, targets: &Tensor) -> candle_core::Result<f64> {
        match self {
            Self::Classification => {
                let predicted = output.argmax(D::Minus1)?;
                let hits = predicted
                    .eq(&targets.to_dtype(DType::U32)?)?
                    .to_dtype(DType::F32)?
                    .mean_all()?
                    .to_scalar::<f32>()?;
                Ok(f64::from(hits))
            }
            Self::Regression => Ok(0.0),
        }
    }

    /// Dtype the targets must have for [`TaskKind::loss`].
    pub fn target_dtype(&self) -> DType {
        match self {
            Self::Classification => DType::U32,
            Self::Regression => DType::F32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_classification_accuracy() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[2.0f32, 0.1], [0.2, 1.0], [3.0, -1.0], [0.0, 0.5]], &dev).unwrap();
        let labels = Tensor::new(&[0u32, 1, 1, 1], &dev).unwrap();
        let acc = TaskKind::Classification.accuracy(&logits, &labels).unwrap();
        assert!((acc - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_classification_loss_is_positive() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0]], &dev).unwrap();
        let labels = Tensor::new(&[0u32, 1], &dev).unwrap();
        let loss = TaskKind::Classification
            .loss(&logits, &labels)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss > 0.0 && loss < 1.0);
    }

    #[test]
    fn test_regression_reports_zero_accuracy() {
        let dev = Device::Cpu;
        let out = Tensor::new(&[[1.0f32], [2.0]], &dev).unwrap();
        let target = Tensor::new(&[[1.0f32], [4.0]], &dev).unwrap();
        assert_eq!(TaskKind::Regression.accuracy(&out, &target).unwrap(), 0.0);
        let loss = TaskKind::Regression
            .loss(&out, &target)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 2.0).abs() < 1e-6);
    }
}

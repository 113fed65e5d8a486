//! Mini-batches and in-memory datasets.

use crate::error::FitError;
use candle_core::{DType, Tensor};
use rand::Rng;
use rand::seq::SliceRandom;

/// Inputs and targets sharing a leading sample dimension.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

impl Batch {
    pub fn new(inputs: Tensor, targets: Tensor) -> Self {
        Self { inputs, targets }
    }

    /// Number of samples, taken from the leading dimension of the inputs.
    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check the batch is non-empty, dims agree and targets have `target_dtype`.
    pub fn validate(&self, target_dtype: DType) -> Result<(), FitError> {
        let inputs = self.inputs.dims();
        let targets = self.targets.dims();
        if inputs.is_empty() || targets.is_empty() {
            return Err(FitError::data(format!(
                "batch tensors need a sample dimension, got inputs {inputs:?} targets {targets:?}"
            )));
        }
        if inputs[0] == 0 {
            return Err(FitError::data("empty batch"));
        }
        if inputs[0] != targets[0] {
            return Err(FitError::data(format!(
                "inputs have {} samples but targets have {}",
                inputs[0], targets[0]
            )));
        }
        if self.targets.dtype() != target_dtype {
            return Err(FitError::data(format!(
                "targets have dtype {:?}, expected {:?}",
                self.targets.dtype(),
                target_dtype
            )));
        }
        Ok(())
    }
}

/// A full set of samples held in two tensors.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub inputs: Tensor,
    pub targets: Tensor,
}

impl Dataset {
    pub fn new(inputs: Tensor, targets: Tensor) -> Result<Self, FitError> {
        let n_inputs = inputs.dim(0)?;
        let n_targets = targets.dim(0)?;
        if n_inputs != n_targets {
            return Err(FitError::data(format!(
                "dataset has {n_inputs} inputs but {n_targets} targets"
            )));
        }
        Ok(Self { inputs, targets })
    }

    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over consecutive batches of `batch_size` samples; the last one may be short.
    pub fn batches(&self, batch_size: usize) -> Result<Batches<'_>, FitError> {
        if batch_size == 0 {
            return Err(FitError::config("batch_size must be at least 1"));
        }
        Ok(Batches {
            dataset: self,
            order: None,
            batch_size,
            cursor: 0,
        })
    }

    /// Like [`batches`](Self::batches), visiting samples in a fresh random order.
    pub fn shuffled_batches<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<Batches<'_>, FitError> {
        let mut batches = self.batches(batch_size)?;
        let total = u32::try_from(self.len())
            .map_err(|_| FitError::data(format!("{} samples exceed the index range", self.len())))?;
        let mut order: Vec<u32> = (0..total).collect();
        order.shuffle(rng);
        batches.order = Some(order);
        Ok(batches)
    }
}

/// Single-pass batch iterator over a [`Dataset`].
pub struct Batches<'a> {
    dataset: &'a Dataset,
    order: Option<Vec<u32>>,
    batch_size: usize,
    cursor: usize,
}

impl Batches<'_> {
    fn slice_at(&self, start: usize, len: usize) -> Result<Batch, FitError> {
        let ds = self.dataset;
        match &self.order {
            None => Ok(Batch::new(
                ds.inputs.narrow(0, start, len)?,
                ds.targets.narrow(0, start, len)?,
            )),
            Some(order) => {
                let idx = Tensor::from_slice(
                    &order[start..start + len],
                    len,
                    ds.inputs.device(),
                )?;
                Ok(Batch::new(
                    ds.inputs.index_select(&idx, 0)?,
                    ds.targets.index_select(&idx, 0)?,
                ))
            }
        }
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch, FitError>;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.dataset.len();
        if self.cursor >= total {
            return None;
        }
        let len = self.batch_size.min(total - self.cursor);
        let start = self.cursor;
        self.cursor += len;
        Some(self.slice_at(start, len))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.dataset.len().saturating_sub(self.cursor);
        let n = remaining.div_ceil(self.batch_size);
        (n, Some(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn dataset(n: usize) -> Dataset {
        let dev = Device::Cpu;
        let inputs = Tensor::arange(0f32, (n * 2) as f32, &dev)
            .unwrap()
            .reshape((n, 2))
            .unwrap();
        let targets = Tensor::arange(0u32, n as u32, &dev).unwrap();
        Dataset::new(inputs, targets).unwrap()
    }

    #[test]
    fn test_batches_cover_dataset_in_order() {
        let ds = dataset(10);
        let sizes: Vec<usize> = ds
            .batches(4)
            .unwrap()
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);

        let labels: Vec<u32> = ds
            .batches(4)
            .unwrap()
            .flat_map(|b| b.unwrap().targets.to_vec1::<u32>().unwrap())
            .collect();
        assert_eq!(labels, (0..10).collect::<Vec<u32>>());
    }

    #[test]
    fn test_shuffled_batches_are_a_permutation() {
        let ds = dataset(17);
        let mut rng = StdRng::seed_from_u64(3);
        let mut labels: Vec<u32> = ds
            .shuffled_batches(5, &mut rng)
            .unwrap()
            .flat_map(|b| {
                let b = b.unwrap();
                // Rows stay aligned with their labels.
                let first = b.inputs.get(0).unwrap().to_vec1::<f32>().unwrap()[0];
                assert_eq!(first as u32, b.targets.to_vec1::<u32>().unwrap()[0] * 2);
                b.targets.to_vec1::<u32>().unwrap()
            })
            .collect();
        labels.sort_unstable();
        assert_eq!(labels, (0..17).collect::<Vec<u32>>());
    }

    #[test]
    fn test_iterator_adapters_compose() {
        let ds = dataset(9);
        let batches = ds.batches(4).unwrap();
        assert_eq!(batches.size_hint(), (3, Some(3)));
        let firsts: Vec<u32> = batches
            .take(2)
            .map(|b| b.unwrap().targets.to_vec1::<u32>().unwrap()[0])
            .collect();
        assert_eq!(firsts, vec![0, 4]);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(matches!(dataset(3).batches(0), Err(FitError::Config(_))));
    }

    #[test]
    fn test_batch_validation() {
        let dev = Device::Cpu;
        let inputs = Tensor::zeros((3, 2), DType::F32, &dev).unwrap();
        let ok = Batch::new(inputs.clone(), Tensor::zeros(3, DType::U32, &dev).unwrap());
        assert!(ok.validate(DType::U32).is_ok());
        assert!(matches!(ok.validate(DType::F32), Err(FitError::Data(_))));

        let mismatched = Batch::new(inputs, Tensor::zeros(2, DType::U32, &dev).unwrap());
        assert!(matches!(mismatched.validate(DType::U32), Err(FitError::Data(_))));

        let empty = Batch::new(
            Tensor::zeros((0, 2), DType::F32, &dev).unwrap(),
            Tensor::zeros(0, DType::U32, &dev).unwrap(),
        );
        assert!(empty.is_empty());
        assert!(matches!(empty.validate(DType::U32), Err(FitError::Data(_))));
    }
}

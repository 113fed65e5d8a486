//! Train/validation split.
//!
//! Sample indices are shuffled once with a uniform permutation; the first
//! `floor(N * ratio)` shuffled samples become the training split and the rest
//! the validation split, both keeping the shuffled order.

use crate::data::batch::Dataset;
use crate::error::FitError;
use candle_core::Tensor;
use rand::Rng;
use rand::seq::SliceRandom;

/// Sizes of the two splits for `total` samples.
pub fn split_counts(total: usize, train_ratio: f64) -> Result<(usize, usize), FitError> {
    if !(train_ratio > 0.0 && train_ratio < 1.0) {
        return Err(FitError::config(format!(
            "train_ratio must be in (0, 1), got {train_ratio}"
        )));
    }
    let train = ((total as f64) * train_ratio).floor() as usize;
    let train = train.min(total);
    Ok((train, total - train))
}

/// Shuffle `0..total` and cut it into (train, validation) index lists.
pub fn split_indices<R: Rng + ?Sized>(
    total: usize,
    train_ratio: f64,
    rng: &mut R,
) -> Result<(Vec<u32>, Vec<u32>), FitError> {
    let (train_count, _) = split_counts(total, train_ratio)?;
    let total = u32::try_from(total)
        .map_err(|_| FitError::data(format!("{total} samples exceed the index range")))?;
    let mut indices: Vec<u32> = (0..total).collect();
    indices.shuffle(rng);
    let valid = indices.split_off(train_count);
    Ok((indices, valid))
}

/// Split `dataset` into training and validation datasets.
pub fn split_data<R: Rng + ?Sized>(
    dataset: &Dataset,
    train_ratio: f64,
    rng: &mut R,
) -> Result<(Dataset, Dataset), FitError> {
    let (train_idx, valid_idx) = split_indices(dataset.len(), train_ratio, rng)?;
    tracing::debug!(
        train = train_idx.len(),
        valid = valid_idx.len(),
        "dataset split"
    );
    Ok((select(dataset, &train_idx)?, select(dataset, &valid_idx)?))
}

fn select(dataset: &Dataset, indices: &[u32]) -> Result<Dataset, FitError> {
    let idx = Tensor::from_slice(indices, indices.len(), dataset.inputs.device())?;
    Dataset::new(
        dataset.inputs.index_select(&idx, 0)?,
        dataset.targets.index_select(&idx, 0)?,
    )
}

//! Epoch observers: one-way notifications at batch and epoch boundaries.

use crate::training::engine::Mode;
use crate::training::metrics::{ACCURACY, GRAD_NORM, LOSS, Metrics, PARAM_NORM};
use serde::{Deserialize, Serialize};

/// Receives progress notifications from the epoch driver.
///
/// Observers only see metrics. They cannot stop an epoch or touch the model.
pub trait EpochObserver {
    /// Called after every batch with the epoch's running averages so far.
    fn on_batch_completed(&mut self, _mode: Mode, _batch: usize, _running: &Metrics) {}

    /// Called once per completed epoch with the aggregated metrics.
    fn on_epoch_completed(&mut self, mode: Mode, epoch: usize, metrics: &Metrics);
}

/// How much the log observer reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Silent = 0,
    EpochWise = 1,
    #[default]
    BatchWise = 2,
}

impl From<u8> for Verbosity {
    fn from(level: u8) -> Self {
        match level {
            0 => Self::Silent,
            1 => Self::EpochWise,
            _ => Self::BatchWise,
        }
    }
}

/// Reports progress through `tracing`.
#[derive(Debug, Clone)]
pub struct LogObserver {
    verbosity: Verbosity,
}

impl LogObserver {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }
}

impl EpochObserver for LogObserver {
    fn on_batch_completed(&mut self, mode: Mode, batch: usize, running: &Metrics) {
        if self.verbosity >= Verbosity::BatchWise {
            tracing::debug!(
                %mode,
                batch,
                loss = running.value(LOSS),
                accuracy = running.value(ACCURACY),
                "batch completed"
            );
        }
    }

    fn on_epoch_completed(&mut self, mode: Mode, epoch: usize, metrics: &Metrics) {
        if self.verbosity < Verbosity::EpochWise {
            return;
        }
        match mode {
            Mode::Training => tracing::info!(
                "EPOCH {} - |param|={:.2e} |g_param|={:.2e} loss={:.4e} accuracy={:.4}",
                epoch,
                metrics.value(PARAM_NORM),
                metrics.value(GRAD_NORM),
                metrics.value(LOSS),
                metrics.value(ACCURACY),
            ),
            // The trainer reports validation together with the best loss.
            Mode::Validation => tracing::debug!(
                epoch,
                loss = metrics.value(LOSS),
                accuracy = metrics.value(ACCURACY),
                "validation epoch completed"
            ),
        }
    }
}

//! Per-batch metric records, epoch running averages and run history.

use crate::error::FitError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const LOSS: &str = "loss";
pub const ACCURACY: &str = "accuracy";
pub const PARAM_NORM: &str = "|param|";
pub const GRAD_NORM: &str = "|g_param|";

/// Metric names produced by a training step, in display order.
pub const TRAINING_METRICS: [&str; 4] = [LOSS, ACCURACY, PARAM_NORM, GRAD_NORM];

/// Metric names produced by a validation step.
pub const VALIDATION_METRICS: [&str; 2] = [LOSS, ACCURACY];

/// Scalar metrics keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(BTreeMap<String, f64>);

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Value of `name`, or NaN when the metric was never recorded.
    pub fn value(&self, name: &str) -> f64 {
        self.get(name).unwrap_or(f64::NAN)
    }

    pub fn loss(&self) -> f64 {
        self.value(LOSS)
    }

    pub fn accuracy(&self) -> f64 {
        self.value(ACCURACY)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// How per-batch values are folded into an epoch average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Averaging {
    /// `avg = alpha * avg + (1 - alpha) * value`, seeded with the first value.
    Exponential { alpha: f64 },
    /// Plain arithmetic mean over the epoch.
    Cumulative,
}

impl Default for Averaging {
    fn default() -> Self {
        Self::Exponential { alpha: 0.98 }
    }
}

impl Averaging {
    pub fn validate(&self) -> Result<(), FitError> {
        match *self {
            Self::Exponential { alpha } if !(alpha > 0.0 && alpha <= 1.0) => Err(
                FitError::config(format!("averaging alpha must be in (0, 1], got {alpha}")),
            ),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    value: f64,
    count: usize,
}

/// Running average of every metric seen during one epoch.
#[derive(Debug, Clone)]
pub struct RunningAverage {
    averaging: Averaging,
    values: BTreeMap<String, Accumulator>,
}

impl RunningAverage {
    pub fn new(averaging: Averaging) -> Self {
        Self {
            averaging,
            values: BTreeMap::new(),
        }
    }

    /// Forget everything; called at the start of each epoch.
    pub fn reset(&mut self) {
        self.values.clear();
    }

    /// Fold one batch record into the averages.
    pub fn update(&mut self, metrics: &Metrics) {
        for (name, value) in metrics.iter() {
            match self.values.get_mut(name) {
                None => {
                    self.values
                        .insert(name.to_string(), Accumulator { value, count: 1 });
                }
                Some(acc) => {
                    acc.count += 1;
                    acc.value = match self.averaging {
                        Averaging::Exponential { alpha } => {
                            alpha * acc.value + (1.0 - alpha) * value
                        }
                        Averaging::Cumulative => acc.value + (value - acc.value) / acc.count as f64,
                    };
                }
            }
        }
    }

    /// Number of batches folded in for `name`.
    pub fn count(&self, name: &str) -> usize {
        self.values.get(name).map_or(0, |acc| acc.count)
    }

    pub fn compute(&self) -> Metrics {
        let mut out = Metrics::new();
        for (name, acc) in &self.values {
            out.insert(name, acc.value);
        }
        out
    }
}

/// Epoch-level history of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs_completed: usize,
    pub loss_history: Vec<f64>,
    pub val_loss_history: Vec<f64>,
    pub accuracy_history: Vec<f64>,
    pub val_accuracy_history: Vec<f64>,
    /// 1-based epoch whose snapshot the selector holds.
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    pub total_training_time_secs: f64,
}

impl TrainingHistory {
    pub fn record_epoch(&mut self, train: &Metrics, valid: &Metrics, improved: bool) {
        self.loss_history.push(train.loss());
        self.accuracy_history.push(train.accuracy());
        self.val_loss_history.push(valid.loss());
        self.val_accuracy_history.push(valid.accuracy());
        self.epochs_completed += 1;

        if improved {
            self.best_loss = Some(valid.loss());
            self.best_epoch = Some(self.epochs_completed);
        }
    }
}

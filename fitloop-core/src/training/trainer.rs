//! Run orchestration: alternate training and validation epochs, select the
//! best snapshot and save it according to the schedule.

use crate::data::Dataset;
use crate::error::FitError;
use crate::training::callbacks::Verbosity;
use crate::training::checkpoint::{CheckpointSelector, ModelState};
use crate::training::engine::{EpochDriver, Mode};
use crate::training::metrics::{Metrics, TrainingHistory};
use candle_nn::{ModuleT, Optimizer};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// When the best checkpoint is written to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveSchedule {
    /// Once, after the last epoch.
    #[default]
    OnCompletion,
    /// Every time the validation loss improves.
    EveryImprovement,
    /// Never; the caller saves through [`Trainer::selector`].
    Never,
}

/// Batch size and shuffling used by [`Trainer::fit`].
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    pub n_epochs: usize,
    pub batch_size: usize,
    /// Reshuffle the training split at every epoch.
    pub shuffle: bool,
}

pub struct Trainer<M, O> {
    driver: EpochDriver<M, O>,
    selector: CheckpointSelector,
    history: TrainingHistory,
    destination: PathBuf,
    save_schedule: SaveSchedule,
    verbosity: Verbosity,
}

impl<M, O> Trainer<M, O>
where
    M: ModuleT,
    O: Optimizer,
{
    pub fn new(
        driver: EpochDriver<M, O>,
        selector: CheckpointSelector,
        destination: impl Into<PathBuf>,
        save_schedule: SaveSchedule,
        verbosity: Verbosity,
    ) -> Self {
        Self {
            driver,
            selector,
            history: TrainingHistory::default(),
            destination: destination.into(),
            save_schedule,
            verbosity,
        }
    }

    pub fn driver(&self) -> &EpochDriver<M, O> {
        &self.driver
    }

    pub fn selector(&self) -> &CheckpointSelector {
        &self.selector
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Train for `options.n_epochs`, validating after each epoch.
    ///
    /// `metadata` is stored next to the snapshot whenever a checkpoint is written.
    pub fn fit<R, S>(
        &mut self,
        train: &Dataset,
        valid: &Dataset,
        options: FitOptions,
        rng: &mut R,
        metadata: &S,
    ) -> Result<&TrainingHistory, FitError>
    where
        R: Rng + ?Sized,
        S: Serialize,
    {
        let started = Instant::now();
        tracing::info!(
            train = train.len(),
            valid = valid.len(),
            epochs = options.n_epochs,
            batch_size = options.batch_size,
            "Training started"
        );

        for _ in 0..options.n_epochs {
            let train_metrics = if options.shuffle {
                self.driver.run_epoch(
                    train.shuffled_batches(options.batch_size, rng)?,
                    Mode::Training,
                )?
            } else {
                self.driver
                    .run_epoch(train.batches(options.batch_size)?, Mode::Training)?
            };
            let valid_metrics = self
                .driver
                .run_epoch(valid.batches(options.batch_size)?, Mode::Validation)?;

            self.end_of_epoch(&train_metrics, &valid_metrics, metadata)?;
        }

        self.history.total_training_time_secs += started.elapsed().as_secs_f64();

        if self.save_schedule == SaveSchedule::OnCompletion {
            self.selector.save(&self.destination, metadata)?;
        }
        tracing::info!(
            best_loss = self.selector.best_loss(),
            best_epoch = ?self.selector.best_epoch(),
            secs = self.history.total_training_time_secs,
            "Training complete"
        );
        Ok(&self.history)
    }

    fn end_of_epoch<S: Serialize>(
        &mut self,
        train_metrics: &Metrics,
        valid_metrics: &Metrics,
        metadata: &S,
    ) -> Result<(), FitError> {
        let varmap = self.driver.varmap();
        let improved = self
            .selector
            .observe_with(valid_metrics.loss(), || ModelState::capture(varmap))?;
        self.history
            .record_epoch(train_metrics, valid_metrics, improved);

        if self.verbosity >= Verbosity::EpochWise {
            tracing::info!(
                "Validate - loss={:.4e} accuracy={:.4} best_loss={:.4e}",
                valid_metrics.loss(),
                valid_metrics.accuracy(),
                self.selector.best_loss(),
            );
        }

        if improved && self.save_schedule == SaveSchedule::EveryImprovement {
            self.selector.save(&self.destination, metadata)?;
        }
        Ok(())
    }

    /// Load the best snapshot back into the model.
    pub fn restore_best(&self) -> Result<(), FitError> {
        let state = self.selector.best_state().ok_or(FitError::NoSnapshot)?;
        state.apply_to(self.driver.varmap())
    }
}

//! Training infrastructure: epoch driver, metrics, observers, checkpoint selection.

pub mod callbacks;
pub mod checkpoint;
pub mod engine;
pub mod metrics;
pub mod task;
pub mod trainer;

pub use callbacks::{EpochObserver, LogObserver, Verbosity};
pub use checkpoint::{CheckpointRecord, CheckpointSelector, ModelState, TiePolicy, load_checkpoint};
pub use engine::{DriverState, EpochDriver, Mode};
pub use metrics::{Averaging, Metrics, RunningAverage, TrainingHistory};
pub use task::TaskKind;
pub use trainer::{FitOptions, SaveSchedule, Trainer};

//! # fitloop-core
//!
//! A small training harness for classifiers built on `candle`:
//!
//! - [`training::EpochDriver`] runs training and validation epochs and keeps
//!   running averages of loss, accuracy and parameter/gradient norms.
//! - [`training::CheckpointSelector`] keeps a deep copy of the parameters with
//!   the lowest validation loss and writes it to disk on request.
//! - [`data`] loads MNIST IDX files, splits them and cuts them into batches.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod persistence;
pub mod training;

pub use config::{FitloopConfig, load_config};
pub use error::FitError;
pub use model::{Mlp, encoder_hidden_sizes};
pub use training::{CheckpointSelector, EpochDriver, Trainer};

//! Error types for the fitloop-core crate.

use thiserror::Error;

/// Top-level error type for training operations.
#[derive(Debug, Error)]
pub enum FitError {
    /// Malformed or mismatched batch, unreadable dataset file.
    #[error("Data error: {0}")]
    Data(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No snapshot: no validation epoch has completed yet")]
    NoSnapshot,

    #[error("Checkpoint integrity check failed: expected {expected}, found {found}")]
    Integrity { expected: String, found: String },

    #[error("Unsupported checkpoint format version {0}")]
    FormatVersion(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl FitError {
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error belongs to the storage class (save/load of checkpoints).
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::NoSnapshot
                | Self::Io(_)
                | Self::Serde(_)
                | Self::Integrity { .. }
                | Self::FormatVersion(_)
        )
    }
}

pub type Result<T, E = FitError> = std::result::Result<T, E>;

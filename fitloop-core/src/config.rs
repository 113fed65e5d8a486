//! Configuration system for fitloop.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/fitloop/config.toml` and/or `.fitloop/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::FitError;
use crate::training::callbacks::Verbosity;
use crate::training::checkpoint::TiePolicy;
use crate::training::metrics::Averaging;
use crate::training::task::TaskKind;
use crate::training::trainer::SaveSchedule;

/// Top-level configuration for a training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitloopConfig {
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

/// Optimizer used for the update step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    #[default]
    AdamW,
}

/// Training loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Where the best checkpoint is written.
    #[serde(default = "default_model_fn")]
    pub model_fn: PathBuf,
    #[serde(default = "default_n_epochs")]
    pub n_epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub verbose: Verbosity,
    #[serde(default)]
    pub task: TaskKind,
    #[serde(default)]
    pub optimizer: OptimizerKind,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// How per-batch metrics are folded into the epoch average.
    #[serde(default)]
    pub averaging: Averaging,
    #[serde(default)]
    pub tie_policy: TiePolicy,
    #[serde(default)]
    pub save_schedule: SaveSchedule,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_fn: default_model_fn(),
            n_epochs: default_n_epochs(),
            batch_size: default_batch_size(),
            verbose: Verbosity::default(),
            task: TaskKind::default(),
            optimizer: OptimizerKind::default(),
            learning_rate: default_learning_rate(),
            averaging: Averaging::default(),
            tie_policy: TiePolicy::default(),
            save_schedule: SaveSchedule::default(),
        }
    }
}

fn default_model_fn() -> PathBuf {
    PathBuf::from("model.json")
}

fn default_n_epochs() -> usize {
    20
}

fn default_batch_size() -> usize {
    256
}

fn default_learning_rate() -> f64 {
    1e-3
}

/// Dataset location and splitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Directory holding the IDX files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Fraction of samples used for training; the rest is validation.
    #[serde(default = "default_train_ratio")]
    pub train_ratio: f64,
    #[serde(default = "default_true")]
    pub flatten: bool,
    /// Reshuffle the training split at every epoch.
    #[serde(default = "default_true")]
    pub shuffle: bool,
    /// Fixed seed for the split permutation and batch shuffling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            train_ratio: default_train_ratio(),
            flatten: true,
            shuffle: true,
            seed: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_train_ratio() -> f64 {
    0.8
}

fn default_true() -> bool {
    true
}

/// Classifier shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_input_size")]
    pub input_size: usize,
    #[serde(default = "default_output_size")]
    pub output_size: usize,
    /// Number of linear layers; hidden sizes follow `encoder_hidden_sizes`.
    #[serde(default = "default_n_layers")]
    pub n_layers: usize,
    #[serde(default)]
    pub use_dropout: bool,
    #[serde(default = "default_dropout_p")]
    pub dropout_p: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_size: default_input_size(),
            output_size: default_output_size(),
            n_layers: default_n_layers(),
            use_dropout: false,
            dropout_p: default_dropout_p(),
        }
    }
}

fn default_input_size() -> usize {
    28 * 28
}

fn default_output_size() -> usize {
    10
}

fn default_n_layers() -> usize {
    5
}

fn default_dropout_p() -> f32 {
    0.3
}

impl FitloopConfig {
    /// Reject settings that would fail later in the run.
    pub fn validate(&self) -> Result<(), FitError> {
        let ratio = self.data.train_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            return Err(FitError::config(format!(
                "train_ratio must be in (0, 1), got {ratio}"
            )));
        }
        if self.training.batch_size == 0 {
            return Err(FitError::config("batch_size must be at least 1"));
        }
        if self.training.n_epochs == 0 {
            return Err(FitError::config("n_epochs must be at least 1"));
        }
        let lr = self.training.learning_rate;
        if !(lr.is_finite() && lr > 0.0) {
            return Err(FitError::config(format!(
                "learning_rate must be a positive number, got {lr}"
            )));
        }
        self.training.averaging.validate()?;
        if self.model.n_layers == 0 {
            return Err(FitError::config("n_layers must be at least 1"));
        }
        if self.model.input_size == 0 || self.model.output_size == 0 {
            return Err(FitError::config("input_size and output_size must be non-zero"));
        }
        let p = self.model.dropout_p;
        if self.model.use_dropout && !(0.0..1.0).contains(&p) {
            return Err(FitError::config(format!(
                "dropout_p must be in [0, 1), got {p}"
            )));
        }
        Ok(())
    }
}

/// Values passed on the command line. Unset fields leave lower layers untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    pub training: TrainingOverrides,
    pub data: DataOverrides,
    pub model: ModelOverrides,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainingOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_fn: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_epochs: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<Verbosity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimizer: Option<OptimizerKind>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DataOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_layers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_dropout: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropout_p: Option<f32>,
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".fitloop").join("config.toml")
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "fitloop", "fitloop")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `FITLOOP_`)
/// 3. Workspace-local config (`.fitloop/config.toml`)
/// 4. User config (`~/.config/fitloop/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&ConfigOverrides>,
) -> Result<FitloopConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(FitloopConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // FITLOOP_TRAINING__BATCH_SIZE, FITLOOP_DATA__TRAIN_RATIO, ...
    figment = figment.merge(Env::prefixed("FITLOOP_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FitloopConfig::default();
        assert_eq!(config.training.n_epochs, 20);
        assert_eq!(config.training.batch_size, 256);
        assert_eq!(config.training.verbose, Verbosity::BatchWise);
        assert_eq!(config.training.task, TaskKind::Classification);
        assert_eq!(config.data.train_ratio, 0.8);
        assert_eq!(config.model.input_size, 784);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = FitloopConfig::default();
        config.data.seed = Some(7);
        config.training.tie_policy = TiePolicy::KeepEarliest;
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: FitloopConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        for ratio in [0.0, 1.0, -0.5, 1.5, f64::NAN] {
            let mut config = FitloopConfig::default();
            config.data.train_ratio = ratio;
            let err = config.validate().unwrap_err();
            assert!(matches!(err, FitError::Config(_)), "ratio {ratio}");
        }
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = FitloopConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = FitloopConfig::default();
        config.model.n_layers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = ConfigOverrides::default();
        overrides.training.batch_size = Some(64);
        overrides.data.train_ratio = Some(0.9);

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.data.train_ratio, 0.9);
        // Untouched fields keep their defaults.
        assert_eq!(config.training.n_epochs, 20);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let path = workspace_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"
[training]
n_epochs = 3
tie_policy = "keep_earliest"

[model]
n_layers = 2
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.training.n_epochs, 3);
        assert_eq!(config.training.tie_policy, TiePolicy::KeepEarliest);
        assert_eq!(config.model.n_layers, 2);
        assert_eq!(config.training.batch_size, 256);
    }
}

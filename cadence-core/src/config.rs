//! Configuration system for cadence.
//!
//! Uses `figment` for layered configuration: defaults -> user config ->
//! workspace config -> explicit file -> environment -> CLI overrides.
//! Configuration is loaded from `~/.config/cadence/config.toml` and/or
//! `.cadence/config.toml` in the workspace directory.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};
use crate::optim::MAIN_KEY;

/// Top-level configuration for a cadence run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub run: RunConfig,
    pub checkpoint: CheckpointConfig,
    pub one_cycle: OneCycleConfig,
    pub range_finder: RangeFinderConfig,
    pub optimizer_step: OptimizerStepConfig,
    pub logger: LoggerConfig,
}

/// Which reference optimizer the demo run builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Sgd,
    Adam,
}

/// Loop-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Base learning rate handed to the optimizer before any schedule runs.
    pub lr: f64,
    pub weight_decay: f64,
    pub momentum: f64,
    pub optimizer: OptimizerKind,
    /// Run directory for checkpoints and scalar logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logdir: Option<PathBuf>,
    pub seed: u64,
    /// Size of the synthetic demo dataset.
    pub samples: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            lr: 0.05,
            weight_decay: 0.0,
            momentum: 0.9,
            optimizer: OptimizerKind::Sgd,
            logdir: None,
            seed: 42,
            samples: 1024,
        }
    }
}

/// Best-N checkpoint retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Number of checkpoints kept on disk.
    pub save_n_best: usize,
    /// Checkpoint file to restore at mode start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<PathBuf>,
    /// Validation metric compared between epochs.
    pub main_metric: String,
    pub minimize: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_n_best: 5,
            resume: None,
            main_metric: "loss".to_string(),
            minimize: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OneCycleConfig {
    pub init_lr: f64,
    /// Epochs per cycle.
    pub cycle_len: usize,
    /// Ratio between peak and floor learning rate.
    pub div: usize,
    /// The first `1 / cut_div` of the cycle ascends.
    pub cut_div: usize,
    /// `(max, min)` momentum.
    pub momentum_range: (f64, f64),
    pub optimizer_key: String,
}

impl Default for OneCycleConfig {
    fn default() -> Self {
        Self {
            init_lr: 0.1,
            cycle_len: 1,
            div: 10,
            cut_div: 4,
            momentum_range: (0.95, 0.85),
            optimizer_key: MAIN_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeFinderConfig {
    pub init_lr: f64,
    pub final_lr: f64,
    /// Batches to sweep over; the loader length when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_steps: Option<usize>,
    pub optimizer_key: String,
}

impl Default for RangeFinderConfig {
    fn default() -> Self {
        Self {
            init_lr: 1e-6,
            final_lr: 1.0,
            n_steps: None,
            optimizer_key: MAIN_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerStepConfig {
    /// Max global gradient norm; no clipping when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_clip: Option<f64>,
    /// Loss multiplier applied before a reduced-precision backward pass.
    pub fp16_grad_scale: f32,
}

impl Default for OptimizerStepConfig {
    fn default() -> Self {
        Self {
            grad_clip: None,
            fp16_grad_scale: 128.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Batch size assumed when seeding the step cursor.
    pub default_batch_size: usize,
    /// Zero the step cursor after every loader.
    pub reset_step: bool,
    /// Write `scalars.jsonl` files under the run directory.
    pub write_scalars: bool,
    /// `k` values reported by the precision observer.
    pub precision_topk: Vec<usize>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 32,
            reset_step: false,
            write_scalars: true,
            precision_topk: vec![1, 3, 5],
        }
    }
}

impl CadenceConfig {
    /// Reject values no observer can run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| -> Result<()> {
            Err(ConfigError::Invalid {
                message: message.to_string(),
            }
            .into())
        };
        if self.run.batch_size == 0 {
            return invalid("run.batch_size must be positive");
        }
        if self.checkpoint.save_n_best == 0 {
            return invalid("checkpoint.save_n_best must be positive");
        }
        if self.one_cycle.div == 0 || self.one_cycle.cut_div == 0 {
            return invalid("one_cycle.div and one_cycle.cut_div must be positive");
        }
        if self.one_cycle.init_lr <= 0.0 {
            return invalid("one_cycle.init_lr must be positive");
        }
        if self.range_finder.init_lr <= 0.0 || self.range_finder.final_lr <= 0.0 {
            return invalid("range_finder learning rates must be positive");
        }
        let scale = self.optimizer_step.fp16_grad_scale;
        if scale == 0.0 || !scale.is_finite() {
            return invalid("optimizer_step.fp16_grad_scale must be non-zero and finite");
        }
        if matches!(self.optimizer_step.grad_clip, Some(c) if c <= 0.0) {
            return invalid("optimizer_step.grad_clip must be positive when set");
        }
        Ok(())
    }
}

/// Load configuration by merging layers (later layers override earlier):
///
/// 1. Built-in defaults
/// 2. User config (`~/.config/cadence/config.toml`)
/// 3. Workspace-local config (`.cadence/config.toml`)
/// 4. Explicit config file (`--config`)
/// 5. Environment variables (prefixed with `CADENCE_`, nested with `__`)
/// 6. Dotted-key overrides such as `("run.epochs", 3)`
pub fn load_config(
    workspace: Option<&Path>,
    explicit: Option<&Path>,
    overrides: &[(String, toml::Value)],
) -> Result<CadenceConfig> {
    let mut figment = Figment::from(Serialized::defaults(CadenceConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".cadence").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::ParseError {
                message: format!("config file {} does not exist", path.display()),
            }
            .into());
        }
        figment = figment.merge(Toml::file(path));
    }

    // CADENCE_RUN__EPOCHS, CADENCE_CHECKPOINT__SAVE_N_BEST, ...
    figment = figment.merge(Env::prefixed("CADENCE_").split("__"));

    for (key, value) in overrides {
        figment = figment.merge(Serialized::default(key, value));
    }

    let config: CadenceConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

/// `config.toml` in the per-user configuration directory.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "cadence", "cadence")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Per-user data directory (rolling log files live under it).
pub fn data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "cadence", "cadence")
        .map(|dirs| dirs.data_dir().to_path_buf())
}

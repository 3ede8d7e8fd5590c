//! Checkpoint records, their on-disk form, and the best-N checkpoint manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::callback::{Callback, CallbackAction, Collaborators};
use crate::config::CheckpointConfig;
use crate::error::{CheckpointError, Result};
use crate::model::{ModelState, Precision};
use crate::persistence::{atomic_write, atomic_write_json, file_digest, load_json};
use crate::scheduler::Scheduler;
use crate::step::sync_master_params;
use crate::state::{MetricMap, RunState, ScalarMap};

/// File listing the retained checkpoints of a run directory.
pub const MANIFEST_FILE: &str = "checkpoints.json";

/// Name of the copy written for the best checkpoint so far.
pub const BEST_FILE: &str = "checkpoint.best.json";

const OPTIMIZER_PREFIX: &str = "optimizer_";
const OPTIMIZER_SUFFIX: &str = "_state_dict";
const SCHEDULER_PREFIX: &str = "scheduler_";

/// Everything needed to continue a run from the end of an epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub epoch: usize,
    pub best_metrics: Option<ScalarMap>,
    pub model_state_dict: ModelState,
    /// Optimizer key → optimizer state.
    pub optimizers: BTreeMap<String, Value>,
    /// Scheduler key → scheduler snapshot.
    pub schedulers: BTreeMap<String, Scheduler>,
    /// The validation metrics that triggered the save.
    pub valid_metrics: ScalarMap,
    pub epoch_metrics: BTreeMap<String, MetricMap>,
}

fn malformed(path: &Path, key: &str, err: impl std::fmt::Display) -> CheckpointError {
    CheckpointError::Malformed {
        path: path.to_path_buf(),
        message: format!("key '{key}': {err}"),
    }
}

impl Checkpoint {
    /// Flatten into the blob layout: fixed keys plus one
    /// `optimizer_<key>_state_dict` and one `scheduler_<key>` per entry.
    pub fn to_blob(&self) -> Result<Value> {
        let mut blob = Map::new();
        blob.insert("epoch".into(), Value::from(self.epoch));
        blob.insert("best_metrics".into(), serde_json::to_value(&self.best_metrics)?);
        blob.insert(
            "model_state_dict".into(),
            serde_json::to_value(&self.model_state_dict)?,
        );
        for (key, state) in &self.optimizers {
            blob.insert(
                format!("{OPTIMIZER_PREFIX}{key}{OPTIMIZER_SUFFIX}"),
                state.clone(),
            );
        }
        for (key, scheduler) in &self.schedulers {
            blob.insert(
                format!("{SCHEDULER_PREFIX}{key}"),
                serde_json::to_value(scheduler)?,
            );
        }
        blob.insert("valid_metrics".into(), serde_json::to_value(&self.valid_metrics)?);
        blob.insert("epoch_metrics".into(), serde_json::to_value(&self.epoch_metrics)?);
        Ok(Value::Object(blob))
    }

    /// Rebuild from a blob read from `path`; `path` only labels errors.
    pub fn from_blob(path: &Path, blob: &Value) -> Result<Self> {
        let object = blob
            .as_object()
            .ok_or_else(|| malformed(path, "<root>", "expected a JSON object"))?;

        fn field<T: serde::de::DeserializeOwned>(
            path: &Path,
            object: &Map<String, Value>,
            key: &str,
        ) -> Result<T> {
            let value = object.get(key).ok_or_else(|| CheckpointError::MissingKey {
                path: path.to_path_buf(),
                key: key.to_string(),
            })?;
            Ok(serde_json::from_value(value.clone()).map_err(|e| malformed(path, key, e))?)
        }

        let mut optimizers = BTreeMap::new();
        let mut schedulers = BTreeMap::new();
        for (name, value) in object {
            if let Some(key) = name
                .strip_prefix(OPTIMIZER_PREFIX)
                .and_then(|rest| rest.strip_suffix(OPTIMIZER_SUFFIX))
            {
                optimizers.insert(key.to_string(), value.clone());
            } else if let Some(key) = name.strip_prefix(SCHEDULER_PREFIX) {
                let scheduler: Scheduler =
                    serde_json::from_value(value.clone()).map_err(|e| malformed(path, name, e))?;
                schedulers.insert(key.to_string(), scheduler);
            }
        }

        Ok(Self {
            epoch: field(path, object, "epoch")?,
            best_metrics: field(path, object, "best_metrics")?,
            model_state_dict: field(path, object, "model_state_dict")?,
            optimizers,
            schedulers,
            valid_metrics: field(path, object, "valid_metrics")?,
            epoch_metrics: field(path, object, "epoch_metrics")?,
        })
    }
}

/// Write `checkpoint.<epoch>.json` under `logdir` and, when `is_best`, the
/// same content to `checkpoint.best.json`. Returns the epoch file's path.
pub fn save_checkpoint(logdir: &Path, checkpoint: &Checkpoint, is_best: bool) -> Result<PathBuf> {
    let path = logdir.join(format!("checkpoint.{}.json", checkpoint.epoch));
    let bytes = serde_json::to_vec_pretty(&checkpoint.to_blob()?)?;
    atomic_write(&path, &bytes)?;
    if is_best {
        atomic_write(&logdir.join(BEST_FILE), &bytes)?;
    }
    Ok(path)
}

/// Read a checkpoint file. A missing file is [`CheckpointError::NotFound`].
pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let blob: Value = match load_json(path) {
        Ok(Some(blob)) => blob,
        Ok(None) => {
            return Err(CheckpointError::NotFound {
                path: path.to_path_buf(),
            }
            .into());
        }
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            return Err(malformed(path, "<root>", e).into());
        }
        Err(e) => return Err(e.into()),
    };
    Checkpoint::from_blob(path, &blob)
}

/// A checkpoint file kept on disk, with the metric it was ranked by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedCheckpoint {
    pub path: PathBuf,
    /// JSON has no NaN; a diverged metric is written as `null`.
    #[serde(deserialize_with = "nan_from_null")]
    pub metric: f64,
    pub epoch: usize,
    pub sha256: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

fn nan_from_null<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Read the retained-checkpoint manifest of a run directory, dropping
/// entries whose file no longer exists. Empty when there is no manifest.
pub fn load_manifest(logdir: &Path) -> Result<Vec<RetainedCheckpoint>> {
    let manifest_path = logdir.join(MANIFEST_FILE);
    let entries: Vec<RetainedCheckpoint> = match load_json(&manifest_path) {
        Ok(entries) => entries.unwrap_or_default(),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            return Err(malformed(&manifest_path, "<root>", e).into());
        }
        Err(e) => return Err(e.into()),
    };
    Ok(entries
        .into_iter()
        .filter(|entry| {
            let exists = entry.path.exists();
            if !exists {
                debug!(path = %entry.path.display(), "Dropping vanished checkpoint from manifest");
            }
            exists
        })
        .collect())
}

/// Whether `new` beats (or ties) `best` in the given direction. No best yet
/// always counts as an improvement, and so does any comparison against a
/// NaN, so a diverged epoch never pins the best snapshot.
#[allow(clippy::neg_cmp_op_on_partial_ord)]
pub fn is_improvement(new: f64, best: Option<f64>, minimize: bool) -> bool {
    match best {
        None => true,
        Some(best) if minimize => !(new > best),
        Some(best) => !(new < best),
    }
}

fn float_metrics(metrics: &MetricMap) -> ScalarMap {
    metrics
        .iter()
        .filter_map(|(k, v)| v.as_float().map(|f| (k.clone(), f)))
        .collect()
}

/// Observer that resumes a run and keeps the best N checkpoints on disk.
#[derive(Debug)]
pub struct CheckpointCallback {
    logdir: Option<PathBuf>,
    save_n_best: usize,
    resume: Option<PathBuf>,
    main_metric: String,
    minimize: bool,
    /// Best first.
    retained: Vec<RetainedCheckpoint>,
}

impl CheckpointCallback {
    pub fn new(logdir: Option<PathBuf>, config: &CheckpointConfig) -> Self {
        Self {
            logdir,
            save_n_best: config.save_n_best.max(1),
            resume: config.resume.clone(),
            main_metric: config.main_metric.clone(),
            minimize: config.minimize,
            retained: Vec::new(),
        }
    }

    /// Retained checkpoints, best first.
    pub fn retained(&self) -> &[RetainedCheckpoint] {
        &self.retained
    }

    fn on_mode_start(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        if let Some(logdir) = &self.logdir {
            self.retained = load_manifest(logdir)?;
            self.sort_retained();
            if !self.retained.is_empty() {
                debug!(count = self.retained.len(), "Reloaded checkpoint manifest");
            }
        }
        if let Some(path) = self.resume.clone() {
            self.restore(&path, state, ctx)?;
        }
        Ok(CallbackAction::Continue)
    }

    fn restore(
        &self,
        path: &Path,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<()> {
        info!(path = %path.display(), "Loading checkpoint");
        let checkpoint = load_checkpoint(path)?;

        state.epoch = checkpoint.epoch;
        state.best_metrics = checkpoint.best_metrics.clone();

        ctx.model
            .network_mut()
            .load_state_dict(&checkpoint.model_state_dict)?;

        for (key, optimizer) in ctx.optimizers.iter_mut() {
            let stored = checkpoint
                .optimizers
                .get(key)
                .ok_or_else(|| CheckpointError::MissingKey {
                    path: path.to_path_buf(),
                    key: format!("{OPTIMIZER_PREFIX}{key}{OPTIMIZER_SUFFIX}"),
                })?;
            optimizer.load_state_dict(stored)?;
        }
        if ctx.model.precision() == Precision::Half {
            sync_master_params(ctx.model, ctx.optimizers)?;
        }

        for (key, scheduler) in ctx.schedulers.iter_mut() {
            let stored = checkpoint
                .schedulers
                .get(key)
                .ok_or_else(|| CheckpointError::MissingKey {
                    path: path.to_path_buf(),
                    key: format!("{SCHEDULER_PREFIX}{key}"),
                })?;
            *scheduler = stored.clone();
        }

        info!(path = %path.display(), epoch = checkpoint.epoch, "Loaded checkpoint");
        Ok(())
    }

    fn sort_retained(&mut self) {
        let minimize = self.minimize;
        // NaN metrics rank worst in either direction.
        self.retained.sort_by(|a, b| {
            a.metric.is_nan().cmp(&b.metric.is_nan()).then_with(|| {
                let order = a.metric.total_cmp(&b.metric);
                if minimize { order } else { order.reverse() }
            })
        });
    }

    /// Record a freshly written file, re-rank and evict past the bound.
    fn retain(&mut self, path: PathBuf, metric: f64, epoch: usize) -> Result<()> {
        let (sha256, size_bytes) = file_digest(&path)?;
        // A re-run epoch overwrites its file; keep one entry per path.
        self.retained.retain(|entry| entry.path != path);
        self.retained.push(RetainedCheckpoint {
            path,
            metric,
            epoch,
            sha256,
            size_bytes,
            created_at: Utc::now(),
        });
        self.sort_retained();

        while self.retained.len() > self.save_n_best {
            let Some(worst) = self.retained.pop() else { break };
            match fs::remove_file(&worst.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %worst.path.display(), "Evicted checkpoint was already gone");
                }
                Err(e) => return Err(e.into()),
            }
            debug!(
                path = %worst.path.display(),
                metric = worst.metric,
                "Evicted checkpoint"
            );
        }
        Ok(())
    }

    fn write_manifest(&self, logdir: &Path) -> Result<()> {
        atomic_write_json(&logdir.join(MANIFEST_FILE), &self.retained)?;
        Ok(())
    }

    fn report(&self) {
        info!(count = self.retained.len(), "Top best checkpoints");
        for entry in &self.retained {
            info!(
                path = %entry.path.display(),
                metric = format!("{:.4}", entry.metric),
                epoch = entry.epoch,
                "Retained checkpoint"
            );
        }
    }
}

impl Callback for CheckpointCallback {
    fn name(&self) -> &str {
        "checkpoint"
    }

    fn on_train_start(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        self.on_mode_start(state, ctx)
    }

    fn on_infer_start(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        self.on_mode_start(state, ctx)
    }

    fn on_epoch_end(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        if !state.loader_mode.starts_with("valid") {
            return Ok(CallbackAction::Continue);
        }

        let valid = state
            .epoch_metrics
            .get(&state.loader_mode)
            .or_else(|| {
                state
                    .epoch_metrics
                    .iter()
                    .rev()
                    .find(|(name, _)| name.starts_with("valid"))
                    .map(|(_, metrics)| metrics)
            })
            .ok_or(CheckpointError::NoValidationMetrics { epoch: state.epoch })?;
        let valid_metrics = float_metrics(valid);
        let metric = *valid_metrics
            .get(&self.main_metric)
            .ok_or_else(|| CheckpointError::MissingMetric {
                metric: self.main_metric.clone(),
            })?;

        let best = state
            .best_metrics
            .as_ref()
            .and_then(|b| b.get(&self.main_metric).copied());
        let is_best = is_improvement(metric, best, self.minimize);
        if is_best {
            state.best_metrics = Some(valid_metrics.clone());
        }

        let logdir = self.logdir.clone().ok_or(CheckpointError::NoLogDirectory)?;

        let mut optimizers = BTreeMap::new();
        for (key, optimizer) in ctx.optimizers.iter() {
            optimizers.insert(key.clone(), optimizer.state_dict()?);
        }
        let checkpoint = Checkpoint {
            epoch: state.epoch,
            best_metrics: state.best_metrics.clone(),
            model_state_dict: ctx.model.network_mut().state_dict(),
            optimizers,
            schedulers: ctx.schedulers.clone(),
            valid_metrics,
            epoch_metrics: state.epoch_metrics.clone(),
        };

        let path = save_checkpoint(&logdir, &checkpoint, is_best)?;
        info!(
            path = %path.display(),
            epoch = state.epoch,
            metric,
            is_best,
            "Saved checkpoint"
        );
        self.retain(path, metric, state.epoch)?;
        self.write_manifest(&logdir)?;
        Ok(CallbackAction::Continue)
    }

    fn on_train_end(
        &mut self,
        _state: &mut RunState,
        _ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        self.report();
        Ok(CallbackAction::Continue)
    }

    fn on_infer_end(
        &mut self,
        _state: &mut RunState,
        _ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        self.report();
        Ok(CallbackAction::Continue)
    }
}

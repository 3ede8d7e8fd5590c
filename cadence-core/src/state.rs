//! Shared run state handed to every observer hook.
//!
//! Write ownership by phase:
//! - the runner sets `mode`, `loader_mode`, `loader_len`, `is_train` and
//!   advances `epoch`;
//! - the batch processor fills `input`, `output`, `loss`, `batch_size`;
//! - only learning-rate schedules write `lr` and `momentum`;
//! - the logger owns `step` and finalizes `epoch_metrics`;
//! - the checkpoint manager owns `best_metrics`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::model::Loss;
use crate::tensor::Tensor;

/// What the run is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Train,
    Infer,
    Debug,
}

impl Mode {
    /// Train and debug runs update weights; inference never does.
    pub fn updates_weights(self) -> bool {
        matches!(self, Mode::Train | Mode::Debug)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => write!(f, "train"),
            Mode::Infer => write!(f, "infer"),
            Mode::Debug => write!(f, "debug"),
        }
    }
}

/// A recorded metric. Only `Float` values are carried into checkpoints and
/// into the best-metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    // Integer first: untagged decoding would otherwise read `3` as `3.0`.
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_float(&self) -> Option<f64> {
        match self {
            MetricValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

/// Metric name → value for one loader.
pub type MetricMap = BTreeMap<String, MetricValue>;

/// Metric name → float value.
pub type ScalarMap = BTreeMap<String, f64>;

/// Why a run ended before its configured length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    /// The learning-rate range finder walked past its last step.
    RangeExhausted { optimizer_key: String, steps: usize },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::RangeExhausted {
                optimizer_key,
                steps,
            } => write!(
                f,
                "learning-rate range exhausted after {steps} steps (optimizer '{optimizer_key}')"
            ),
        }
    }
}

/// The single mutable context of a run.
#[derive(Default)]
pub struct RunState {
    pub mode: Mode,
    pub loader_mode: String,
    /// Number of batches in the active loader.
    pub loader_len: usize,
    pub epoch: usize,
    /// Configured number of epochs for this run.
    pub epochs: usize,
    /// Logging x-axis, advanced by the batch size.
    pub step: usize,
    pub is_train: bool,
    pub batch_size: Option<usize>,
    pub loss: Option<Box<dyn Loss>>,
    pub input: BTreeMap<String, Tensor>,
    pub output: BTreeMap<String, Tensor>,
    pub lr: ScalarMap,
    pub momentum: ScalarMap,
    /// loader_mode → metric name → value, reset at epoch start.
    pub epoch_metrics: BTreeMap<String, MetricMap>,
    pub best_metrics: Option<ScalarMap>,
    pub stop: Option<StopReason>,
}

impl RunState {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Enter a loader: set its label and length and derive `is_train`.
    pub fn enter_loader(&mut self, name: &str, len: usize) {
        self.loader_mode = name.to_string();
        self.loader_len = len;
        self.is_train = self.mode.updates_weights() && name.starts_with("train");
    }

    /// Forget the previous batch's tensors and loss.
    pub fn clear_batch(&mut self) {
        self.loss = None;
        self.input.clear();
        self.output.clear();
    }

    /// Scalar value of the current batch loss, if any.
    pub fn loss_value(&self) -> Option<f64> {
        self.loss.as_ref().map(|l| l.value())
    }

    /// Metrics of the current loader, created empty on first use.
    pub fn loader_metrics(&mut self) -> &mut MetricMap {
        self.epoch_metrics
            .entry(self.loader_mode.clone())
            .or_default()
    }
}

impl fmt::Debug for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunState")
            .field("mode", &self.mode)
            .field("loader_mode", &self.loader_mode)
            .field("epoch", &self.epoch)
            .field("step", &self.step)
            .field("is_train", &self.is_train)
            .field("loss", &self.loss_value())
            .field("lr", &self.lr)
            .field("momentum", &self.momentum)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_train_derivation() {
        let mut state = RunState::new(Mode::Train);
        state.enter_loader("train", 10);
        assert!(state.is_train);
        assert_eq!(state.loader_len, 10);
        state.enter_loader("valid", 4);
        assert!(!state.is_train);

        let mut infer = RunState::new(Mode::Infer);
        infer.enter_loader("train", 10);
        assert!(!infer.is_train);

        let mut debug = RunState::new(Mode::Debug);
        debug.enter_loader("train_small", 2);
        assert!(debug.is_train);
    }

    #[test]
    fn test_metric_value_float_filter() {
        assert_eq!(MetricValue::Float(0.5).as_float(), Some(0.5));
        assert_eq!(MetricValue::Integer(3).as_float(), None);
        assert_eq!(MetricValue::Text("x".into()).as_float(), None);
    }

    #[test]
    fn test_metric_value_untagged_serde() {
        let map: MetricMap =
            serde_json::from_str(r#"{"loss": 0.25, "n": 3, "tag": "a"}"#).unwrap();
        assert_eq!(map["loss"], MetricValue::Float(0.25));
        assert_eq!(map["n"], MetricValue::Integer(3));
        assert_eq!(map["tag"], MetricValue::Text("a".into()));
    }

    #[test]
    fn test_loader_metrics_entry() {
        let mut state = RunState::new(Mode::Train);
        state.enter_loader("valid", 1);
        state
            .loader_metrics()
            .insert("loss".into(), MetricValue::Float(1.0));
        assert!(state.epoch_metrics["valid"].contains_key("loss"));
    }

    #[test]
    fn test_stop_reason_display() {
        let reason = StopReason::RangeExhausted {
            optimizer_key: "main".into(),
            steps: 10,
        };
        assert_eq!(
            reason.to_string(),
            "learning-rate range exhausted after 10 steps (optimizer 'main')"
        );
    }
}

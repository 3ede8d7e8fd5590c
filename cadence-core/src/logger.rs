//! Scalar aggregation and sinks, and the observer that feeds them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;
use tracing::info;

use crate::callback::{Callback, CallbackAction, Collaborators};
use crate::config::LoggerConfig;
use crate::error::Result;
use crate::persistence::append_jsonl;
use crate::state::{MetricValue, RunState};

/// Running mean and sample standard deviation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    n: usize,
    sum: f64,
    sum_sq: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: f64) {
        self.n += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn count(&self) -> usize {
        self.n
    }

    pub fn mean(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }

    /// Sample standard deviation; needs two values.
    pub fn std(&self) -> Option<f64> {
        if self.n < 2 {
            return None;
        }
        let n = self.n as f64;
        let var = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
        Some(var.max(0.0).sqrt())
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub loader_mode: String,
    pub name: String,
    pub value: f64,
    pub step: usize,
    pub wall_time: DateTime<Utc>,
}

/// Destination for `(name, value, step)` triples, grouped by loader.
pub trait ScalarSink {
    fn add_scalar(&mut self, loader_mode: &str, name: &str, value: f64, step: usize) -> Result<()>;
}

/// Appends one JSON line per scalar to `<logdir>/<loader_mode>/scalars.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    logdir: PathBuf,
}

impl JsonlSink {
    pub fn new(logdir: impl Into<PathBuf>) -> Self {
        Self {
            logdir: logdir.into(),
        }
    }

    pub fn path_for(&self, loader_mode: &str) -> PathBuf {
        self.logdir.join(loader_mode).join("scalars.jsonl")
    }

    pub fn logdir(&self) -> &Path {
        &self.logdir
    }
}

impl ScalarSink for JsonlSink {
    fn add_scalar(&mut self, loader_mode: &str, name: &str, value: f64, step: usize) -> Result<()> {
        let record = ScalarRecord {
            loader_mode: loader_mode.to_string(),
            name: name.to_string(),
            value,
            step,
            wall_time: Utc::now(),
        };
        append_jsonl(&self.path_for(loader_mode), &record)?;
        Ok(())
    }
}

/// Keeps every scalar in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Rc<RefCell<Vec<ScalarRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ScalarRecord> {
        self.records.borrow().clone()
    }

    /// Values logged under `name` for `loader_mode`, in order.
    pub fn values(&self, loader_mode: &str, name: &str) -> Vec<(usize, f64)> {
        self.records
            .borrow()
            .iter()
            .filter(|r| r.loader_mode == loader_mode && r.name == name)
            .map(|r| (r.step, r.value))
            .collect()
    }
}

impl ScalarSink for MemorySink {
    fn add_scalar(&mut self, loader_mode: &str, name: &str, value: f64, step: usize) -> Result<()> {
        self.records.borrow_mut().push(ScalarRecord {
            loader_mode: loader_mode.to_string(),
            name: name.to_string(),
            value,
            step,
            wall_time: Utc::now(),
        });
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ScalarSink for NullSink {
    fn add_scalar(&mut self, _: &str, _: &str, _: f64, _: usize) -> Result<()> {
        Ok(())
    }
}

const BATCH_TIME: &str = "batch time";
const SAMPLES_PER_SECOND: &str = "sample per second";
const DATA_TIME: &str = "data time";
const LOSS: &str = "loss";

/// Tracks loss, timing, learning rate and momentum per loader, writes batch
/// scalars to a sink and folds loader means into `state.epoch_metrics`.
pub struct LoggerCallback {
    sink: Box<dyn ScalarSink>,
    default_batch_size: usize,
    reset_step: bool,
    meters: BTreeMap<String, BTreeMap<String, AverageMeter>>,
    timer: Instant,
}

impl LoggerCallback {
    pub fn new(sink: Box<dyn ScalarSink>, default_batch_size: usize) -> Self {
        Self {
            sink,
            default_batch_size: default_batch_size.max(1),
            reset_step: false,
            meters: BTreeMap::new(),
            timer: Instant::now(),
        }
    }

    pub fn from_config(sink: Box<dyn ScalarSink>, config: &LoggerConfig) -> Self {
        Self::new(sink, config.default_batch_size).with_reset_step(config.reset_step)
    }

    /// Zero the step cursor after every loader so loaders log on separate axes.
    pub fn with_reset_step(mut self, reset_step: bool) -> Self {
        self.reset_step = reset_step;
        self
    }

    fn record(&mut self, loader_mode: &str, name: &str, value: f64, step: usize) -> Result<()> {
        self.meters
            .entry(loader_mode.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default()
            .add(value);
        self.sink.add_scalar(loader_mode, name, value, step)
    }
}

impl Callback for LoggerCallback {
    fn name(&self) -> &str {
        "logger"
    }

    fn on_epoch_start(
        &mut self,
        state: &mut RunState,
        _ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        state.epoch_metrics.clear();
        self.meters.clear();
        Ok(CallbackAction::Continue)
    }

    fn on_loader_start(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        self.timer = Instant::now();
        if state.step == 0 {
            state.step = state.epoch * state.loader_len * self.default_batch_size;
        }
        let lm = state.loader_mode.clone();
        state.epoch_metrics.insert(lm.clone(), Default::default());

        let meters = self.meters.entry(lm).or_default();
        meters.clear();
        for name in [BATCH_TIME, SAMPLES_PER_SECOND, LOSS] {
            meters.insert(name.to_string(), AverageMeter::new());
        }
        for key in ctx.optimizers.keys() {
            meters.insert(format!("lr_{key}"), AverageMeter::new());
            meters.insert(format!("momentum_{key}"), AverageMeter::new());
        }
        Ok(CallbackAction::Continue)
    }

    fn on_batch_start(
        &mut self,
        state: &mut RunState,
        _ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        let elapsed = self.timer.elapsed().as_secs_f64();
        self.sink
            .add_scalar(&state.loader_mode, DATA_TIME, elapsed, state.step)?;
        Ok(CallbackAction::Continue)
    }

    fn on_batch_end(
        &mut self,
        state: &mut RunState,
        _ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        let lm = state.loader_mode.clone();
        let step = state.step;
        let bs = state
            .batch_size
            .or_else(|| state.input.values().next().map(|t| t.rows()))
            .unwrap_or(self.default_batch_size);
        state.batch_size = Some(bs);

        let elapsed = self.timer.elapsed().as_secs_f64().max(f64::EPSILON);
        self.record(&lm, BATCH_TIME, elapsed, step)?;
        self.record(&lm, SAMPLES_PER_SECOND, bs as f64 / elapsed, step)?;
        for (key, value) in &state.lr {
            self.record(&lm, &format!("lr_{key}"), *value, step)?;
        }
        for (key, value) in &state.momentum {
            self.record(&lm, &format!("momentum_{key}"), *value, step)?;
        }
        if let Some(loss) = state.loss_value() {
            self.record(&lm, LOSS, loss, step)?;
        }

        self.timer = Instant::now();
        state.step += bs;
        Ok(CallbackAction::Continue)
    }

    fn on_loader_end(
        &mut self,
        state: &mut RunState,
        _ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        let lm = state.loader_mode.clone();
        let epoch = state.epoch;
        let means: Vec<(String, f64)> = self
            .meters
            .get(&lm)
            .map(|meters| {
                meters
                    .iter()
                    .filter_map(|(name, meter)| meter.mean().map(|m| (name.clone(), m)))
                    .collect()
            })
            .unwrap_or_default();

        let metrics = state.loader_metrics();
        for (name, mean) in means {
            metrics.insert(name, MetricValue::Float(mean));
        }
        let floats: Vec<(String, f64)> = metrics
            .iter()
            .filter_map(|(name, value)| value.as_float().map(|v| (name.clone(), v)))
            .collect();

        for (name, value) in &floats {
            self.sink
                .add_scalar(&lm, &format!("epoch {name}"), *value, epoch)?;
        }
        let summary = floats
            .iter()
            .map(|(name, value)| format!("{name} {value:.4}"))
            .collect::<Vec<_>>()
            .join("\t");
        info!("{epoch} * Epoch ({lm}): {summary}");

        if self.reset_step {
            state.step = 0;
        }
        Ok(CallbackAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::ToyModel;
    use crate::model::Loss;
    use crate::optim::{OptimizerMap, ParamGroup, Sgd};
    use crate::scheduler::SchedulerMap;
    use crate::state::Mode;
    use tempfile::TempDir;

    struct FixedLoss(f64);

    impl Loss for FixedLoss {
        fn value(&self) -> f64 {
            self.0
        }

        fn backward(&self, _scale: f32) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_average_meter() {
        let mut meter = AverageMeter::new();
        assert_eq!(meter.mean(), None);
        meter.add(1.0);
        assert_eq!(meter.std(), None);
        meter.add(3.0);
        assert_eq!(meter.mean(), Some(2.0));
        assert!((meter.std().unwrap() - 2f64.sqrt()).abs() < 1e-12);
        meter.reset();
        assert_eq!(meter.count(), 0);
    }

    #[test]
    fn test_jsonl_sink_writes_per_loader_files() {
        let dir = TempDir::new().unwrap();
        let mut sink = JsonlSink::new(dir.path());
        sink.add_scalar("train", "loss", 0.5, 0).unwrap();
        sink.add_scalar("train", "loss", 0.25, 32).unwrap();
        sink.add_scalar("valid", "loss", 0.4, 0).unwrap();

        let content = std::fs::read_to_string(sink.path_for("train")).unwrap();
        let records: Vec<ScalarRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].step, 32);
        assert!(sink.path_for("valid").exists());
    }

    #[test]
    fn test_logger_loader_cycle() {
        let sink = MemorySink::new();
        let mut logger = LoggerCallback::new(Box::new(sink.clone()), 4).with_reset_step(true);
        let mut model = ToyModel::new(vec![]);
        let mut optimizers = OptimizerMap::new();
        optimizers.insert(
            "main".into(),
            Box::new(Sgd::new(vec![ParamGroup::new(vec![], 0.1)])),
        );
        let mut schedulers = SchedulerMap::new();
        let mut ctx = Collaborators {
            model: &mut model,
            criterion: None,
            optimizers: &mut optimizers,
            schedulers: &mut schedulers,
        };

        let mut state = RunState::new(Mode::Train);
        state.epoch = 2;
        logger.on_epoch_start(&mut state, &mut ctx).unwrap();
        state.enter_loader("train", 3);
        logger.on_loader_start(&mut state, &mut ctx).unwrap();
        assert_eq!(state.step, 2 * 3 * 4);

        for loss in [1.0, 2.0, 3.0] {
            state.batch_size = Some(4);
            state.loss = Some(Box::new(FixedLoss(loss)));
            state.lr.insert("main".into(), 0.1);
            logger.on_batch_start(&mut state, &mut ctx).unwrap();
            logger.on_batch_end(&mut state, &mut ctx).unwrap();
        }
        assert_eq!(state.step, 24 + 12);
        assert_eq!(
            sink.values("train", "loss"),
            vec![(24, 1.0), (28, 2.0), (32, 3.0)]
        );

        logger.on_loader_end(&mut state, &mut ctx).unwrap();
        let metrics = &state.epoch_metrics["train"];
        assert_eq!(metrics["loss"], MetricValue::Float(2.0));
        assert_eq!(metrics["lr_main"], MetricValue::Float(0.1));
        // Never recorded, so never reported.
        assert!(!metrics.contains_key("momentum_main"));
        assert_eq!(sink.values("train", "epoch loss"), vec![(2, 2.0)]);
        assert_eq!(state.step, 0);
    }

    #[test]
    fn test_epoch_start_clears_metrics() {
        let mut logger = LoggerCallback::new(Box::new(NullSink), 1);
        let mut model = ToyModel::new(vec![]);
        let mut optimizers = OptimizerMap::new();
        let mut schedulers = SchedulerMap::new();
        let mut ctx = Collaborators {
            model: &mut model,
            criterion: None,
            optimizers: &mut optimizers,
            schedulers: &mut schedulers,
        };
        let mut state = RunState::new(Mode::Train);
        state.enter_loader("valid", 1);
        state
            .loader_metrics()
            .insert("loss".into(), MetricValue::Float(1.0));
        logger.on_epoch_start(&mut state, &mut ctx).unwrap();
        assert!(state.epoch_metrics.is_empty());
    }
}

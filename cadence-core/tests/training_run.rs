//! End-to-end runs of the full observer stack on a quadratic toy problem.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use cadence_core::checkpoint::{BEST_FILE, load_checkpoint, load_manifest};
use cadence_core::step::master_params;
use cadence_core::tensor::round_to_half;
use cadence_core::{
    Batch, BatchProcessor, Callback, CallbackAction, CheckpointCallback, CheckpointConfig, Collaborators, HalfPrecision,
    LoaderSet, LoggerCallback, Loss, LrUpdater, MemorySink, Model, OneCycle, Optimizer,
    OptimizerCallback, ParamGroup, Parameter, RangeFinder, Result, RunState, Runner, Sgd,
    StopReason, Tensor, VecLoader,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

struct Quadratic {
    params: Vec<Parameter>,
}

impl Model for Quadratic {
    fn parameters(&self) -> Vec<Parameter> {
        self.params.clone()
    }

    fn network_mut(&mut self) -> &mut dyn Model {
        self
    }
}

/// `0.5 * sum(p^2)`.
struct HalfSquare {
    params: Vec<Parameter>,
}

impl Loss for HalfSquare {
    fn value(&self) -> f64 {
        self.params
            .iter()
            .flat_map(|p| p.data())
            .map(|v| 0.5 * f64::from(v) * f64::from(v))
            .sum()
    }

    fn backward(&self, scale: f32) -> Result<()> {
        for p in &self.params {
            let grad: Vec<f32> = p.data().iter().map(|v| scale * v).collect();
            p.accumulate_grad(&grad);
        }
        Ok(())
    }
}

struct Processor;

impl BatchProcessor for Processor {
    fn process(
        &mut self,
        batch: Batch,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<()> {
        state.batch_size = batch.get("x").map(Tensor::rows);
        state.input = batch;
        state.loss = Some(Box::new(HalfSquare {
            params: ctx.model.parameters(),
        }));
        Ok(())
    }
}

fn weights() -> Vec<Parameter> {
    vec![Parameter::new("w", vec![1.0, -2.0, 0.5])]
}

fn loader(batches: usize) -> VecLoader {
    VecLoader::new(
        (0..batches)
            .map(|_| Batch::from([("x".to_string(), Tensor::vector(vec![0.0; 4]))]))
            .collect(),
    )
}

fn loaders() -> LoaderSet {
    LoaderSet::new().with("train", loader(4)).with("valid", loader(2))
}

fn checkpoint_config(resume: Option<&Path>) -> CheckpointConfig {
    CheckpointConfig {
        save_n_best: 2,
        resume: resume.map(Path::to_path_buf),
        ..CheckpointConfig::default()
    }
}

fn runner(logdir: &Path, resume: Option<&Path>) -> Runner {
    let params = weights();
    let optimizer = Sgd::new(vec![ParamGroup::new(params.clone(), 0.1)]);
    Runner::new(Box::new(Quadratic { params }), Box::new(Processor))
        .with_optimizer("main", Box::new(optimizer))
        .with_callback(OptimizerCallback::new(None, 128.0))
        .with_callback(LoggerCallback::new(Box::new(MemorySink::new()), 4))
        .with_callback(CheckpointCallback::new(
            Some(logdir.to_path_buf()),
            &checkpoint_config(resume),
        ))
}

fn norm(model: &dyn Model) -> f64 {
    model
        .parameters()
        .iter()
        .flat_map(|p| p.data())
        .map(|v| f64::from(v) * f64::from(v))
        .sum::<f64>()
        .sqrt()
}

#[test]
fn test_training_keeps_best_checkpoints() {
    let dir = TempDir::new().unwrap();
    let mut runner = runner(dir.path(), None);
    let before = norm(runner.model());

    let summary = runner.train(&loaders(), 4).unwrap();
    assert_eq!(summary.epochs_completed, 4);
    assert_eq!(summary.stopped, None);
    assert!(norm(runner.model()) < before);

    let manifest = load_manifest(dir.path()).unwrap();
    let epochs: Vec<usize> = manifest.iter().map(|c| c.epoch).collect();
    assert_eq!(epochs, vec![3, 2]);
    assert!(!dir.path().join("checkpoint.0.json").exists());
    assert!(!dir.path().join("checkpoint.1.json").exists());
    assert!(dir.path().join(BEST_FILE).exists());

    let best = load_checkpoint(&dir.path().join(BEST_FILE)).unwrap();
    assert_eq!(best.epoch, 3);
    assert!(best.valid_metrics.contains_key("loss"));
}

#[test]
fn test_resume_continues_from_checkpoint_epoch() {
    let dir = TempDir::new().unwrap();
    runner(dir.path(), None).train(&loaders(), 4).unwrap();
    let best_path = dir.path().join(BEST_FILE);
    let saved = load_checkpoint(&best_path).unwrap();

    let mut resumed = runner(dir.path(), Some(&best_path));
    let summary = resumed.train(&loaders(), 5).unwrap();

    // The checkpoint epoch is run again, then the remaining one.
    assert_eq!(summary.epochs_completed, 5 - saved.epoch);
    assert_eq!(summary.final_epoch, 5);

    let manifest = load_manifest(dir.path()).unwrap();
    let epochs: Vec<usize> = manifest.iter().map(|c| c.epoch).collect();
    assert_eq!(epochs, vec![4, 3]);
    assert!(!dir.path().join("checkpoint.2.json").exists());
}

#[test]
fn test_range_finder_stops_the_run() {
    let params = weights();
    let optimizer = Sgd::new(vec![ParamGroup::new(params.clone(), 0.1)]);
    let mut runner = Runner::new(Box::new(Quadratic { params }), Box::new(Processor))
        .with_optimizer("main", Box::new(optimizer))
        .with_callback(OptimizerCallback::new(None, 128.0))
        .with_callback(LrUpdater::new(RangeFinder::new(1e-4, 1.0, Some(3))));

    let summary = runner
        .train(&LoaderSet::new().with("train", loader(10)), 10)
        .unwrap();
    assert_eq!(
        summary.stopped,
        Some(StopReason::RangeExhausted {
            optimizer_key: "main".into(),
            steps: 3,
        })
    );
    assert_eq!(summary.epochs_completed, 0);
    assert_eq!(runner.state().stop, summary.stopped);
}

#[test]
fn test_one_cycle_drives_optimizer_lr() {
    let params = weights();
    let optimizer = Sgd::new(vec![ParamGroup::new(params.clone(), 0.1)]);
    let mut runner = Runner::new(Box::new(Quadratic { params }), Box::new(Processor))
        .with_optimizer("main", Box::new(optimizer))
        .with_callback(OptimizerCallback::new(None, 128.0))
        .with_callback(LrUpdater::new(OneCycle::new(0.1, 1, 10, 4, (0.95, 0.85))));

    runner.train(&loaders(), 1).unwrap();
    let lr = runner.optimizers()["main"].param_groups()[0].lr;
    assert!((0.01..=0.1).contains(&lr), "lr {lr} outside the cycle range");
    // The validation loader reports no rate.
    assert_eq!(runner.state().lr.get("main"), Some(&0.0));
}

/// Records the first weight after every training batch.
struct WeightTrace(Rc<RefCell<Vec<f32>>>);

impl Callback for WeightTrace {
    fn name(&self) -> &str {
        "weight_trace"
    }

    fn on_batch_end(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        if state.is_train {
            self.0.borrow_mut().push(ctx.model.parameters()[0].data()[0]);
        }
        Ok(CallbackAction::Continue)
    }
}

#[test]
fn test_first_batch_steps_with_the_starting_rate() {
    let params = weights();
    let optimizer = Sgd::new(vec![ParamGroup::new(params.clone(), 0.5)]);
    let trace = Rc::new(RefCell::new(Vec::new()));
    let mut runner = Runner::new(Box::new(Quadratic { params }), Box::new(Processor))
        .with_optimizer("main", Box::new(optimizer))
        .with_callback(OptimizerCallback::new(None, 128.0))
        .with_callback(LrUpdater::new(OneCycle::new(0.1, 1, 10, 4, (0.95, 0.85))))
        .with_callback(WeightTrace(Rc::clone(&trace)));

    runner
        .train(&LoaderSet::new().with("train", loader(4)), 1)
        .unwrap();
    let trace = trace.borrow();
    // lr(0) = 0.1 / 10 on w = 1.0, then the peak rate lr(1) = 0.1.
    assert!((trace[0] - 0.99).abs() < 1e-6, "first step used {}", 1.0 - trace[0]);
    assert!((trace[1] - 0.99 * 0.9).abs() < 1e-6);
}

#[test]
fn test_half_precision_training_keeps_model_in_half() {
    let network = Quadratic { params: weights() };
    let model = HalfPrecision::new(network);
    let master = master_params(&model);
    let optimizer = Sgd::new(vec![ParamGroup::new(master.clone(), 0.1)]);
    let mut runner = Runner::new(Box::new(model), Box::new(Processor))
        .with_optimizer("main", Box::new(optimizer))
        .with_callback(OptimizerCallback::new(None, 64.0));

    runner.train(&loaders(), 2).unwrap();

    let model_values: Vec<f32> = runner
        .model()
        .parameters()
        .iter()
        .flat_map(|p| p.data())
        .collect();
    let master_values: Vec<f32> = master.iter().flat_map(|p| p.data()).collect();
    for (m, full) in model_values.iter().zip(&master_values) {
        assert_eq!(*m, round_to_half(*m));
        assert_eq!(*m, round_to_half(*full));
    }
    assert!(master_values[0] < 1.0);
}

fn half_runner(logdir: &Path, resume: Option<&Path>) -> (Runner, Vec<Parameter>) {
    let model = HalfPrecision::new(Quadratic { params: weights() });
    let master = master_params(&model);
    let optimizer = Sgd::new(vec![ParamGroup::new(master.clone(), 0.1)]);
    let runner = Runner::new(Box::new(model), Box::new(Processor))
        .with_optimizer("main", Box::new(optimizer))
        .with_callback(OptimizerCallback::new(None, 128.0))
        .with_callback(LoggerCallback::new(Box::new(MemorySink::new()), 4))
        .with_callback(CheckpointCallback::new(
            Some(logdir.to_path_buf()),
            &checkpoint_config(resume),
        ));
    (runner, master)
}

#[test]
fn test_half_precision_resume_keeps_restored_weights() {
    let dir = TempDir::new().unwrap();
    half_runner(dir.path(), None).0.train(&loaders(), 3).unwrap();
    let path = dir.path().join("checkpoint.2.json");
    let saved = load_checkpoint(&path).unwrap().model_state_dict["w"].clone();
    assert!(saved[0] < 0.5, "training should have shrunk the weights: {saved:?}");

    let (mut resumed, master) = half_runner(dir.path(), Some(&path));
    resumed.train(&loaders(), 3).unwrap();

    let model_values: Vec<f32> = resumed
        .model()
        .parameters()
        .iter()
        .flat_map(|p| p.data())
        .collect();
    let master_values: Vec<f32> = master.iter().flat_map(|p| p.data()).collect();
    for ((m, full), s) in model_values.iter().zip(&master_values).zip(&saved) {
        // One more epoch of decay from the restored point, never from the
        // initial weights.
        assert!(m.abs() <= s.abs(), "model {m} grew past restored {s}");
        assert_eq!(*m, round_to_half(*full));
    }
}

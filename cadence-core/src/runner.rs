//! The phase-sequence driver.
//!
//! A [`Runner`] owns the model, its optimizers and schedulers, the observer
//! list and a [`BatchProcessor`]; `train`, `infer` and `debug` walk the
//! mode → epoch → loader → batch nesting and dispatch every boundary to the
//! observers in registration order.

use std::collections::BTreeMap;

use tracing::{debug, info, info_span};

use crate::callback::{Callback, CallbackAction, CallbackList, Collaborators, Hook};
use crate::error::{Result, RunError};
use crate::model::{Criterion, Model};
use crate::optim::{Optimizer, OptimizerMap};
use crate::scheduler::{Scheduler, SchedulerMap};
use crate::state::{Mode, RunState, StopReason};
use crate::tensor::Tensor;

/// One batch: named input tensors (features, targets, ...).
pub type Batch = BTreeMap<String, Tensor>;

/// A finite, restartable sequence of batches.
pub trait Loader {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a fresh pass over the batches.
    fn iter(&self) -> Box<dyn Iterator<Item = Batch> + '_>;
}

/// A loader over batches held in memory.
#[derive(Debug, Clone, Default)]
pub struct VecLoader {
    batches: Vec<Batch>,
}

impl VecLoader {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }
}

impl Loader for VecLoader {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn iter(&self) -> Box<dyn Iterator<Item = Batch> + '_> {
        Box::new(self.batches.iter().cloned())
    }
}

/// Loaders of a run, visited in insertion order every epoch.
#[derive(Default)]
pub struct LoaderSet {
    loaders: Vec<(String, Box<dyn Loader>)>,
}

impl LoaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a loader; names starting with "train" update weights, names
    /// starting with "valid" feed checkpoint decisions.
    pub fn with(mut self, name: &str, loader: impl Loader + 'static) -> Self {
        self.loaders.push((name.to_string(), Box::new(loader)));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.loaders.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Number of batches in the loader called `name`.
    pub fn len_of(&self, name: &str) -> Option<usize> {
        self.loaders
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, l)| l.len())
    }

    fn check_non_empty(&self) -> Result<()> {
        match self.loaders.iter().find(|(_, l)| l.is_empty()) {
            Some((name, _)) => Err(RunError::EmptyLoader { name: name.clone() }.into()),
            None => Ok(()),
        }
    }
}

/// The model-execution step: runs the forward pass for a batch and fills
/// `state.input`, `state.output`, `state.loss` and `state.batch_size`.
pub trait BatchProcessor {
    fn process(
        &mut self,
        batch: Batch,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<()>;
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub mode: Mode,
    /// Epochs that ran to completion in this call.
    pub epochs_completed: usize,
    /// Value of `state.epoch` when the run ended.
    pub final_epoch: usize,
    pub stopped: Option<StopReason>,
}

pub struct Runner {
    model: Box<dyn Model>,
    criterion: Option<Box<dyn Criterion>>,
    optimizers: OptimizerMap,
    schedulers: SchedulerMap,
    callbacks: CallbackList,
    processor: Box<dyn BatchProcessor>,
    state: RunState,
}

impl Runner {
    pub fn new(model: Box<dyn Model>, processor: Box<dyn BatchProcessor>) -> Self {
        Self {
            model,
            criterion: None,
            optimizers: OptimizerMap::new(),
            schedulers: SchedulerMap::new(),
            callbacks: CallbackList::new(),
            processor,
            state: RunState::default(),
        }
    }

    pub fn with_criterion(mut self, criterion: Box<dyn Criterion>) -> Self {
        self.criterion = Some(criterion);
        self
    }

    pub fn with_optimizer(mut self, key: &str, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizers.insert(key.to_string(), optimizer);
        self
    }

    pub fn with_scheduler(mut self, key: &str, scheduler: Scheduler) -> Self {
        self.schedulers.insert(key.to_string(), scheduler);
        self
    }

    /// Register an observer after the ones already registered.
    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.add(Box::new(callback));
        self
    }

    /// State of the last run.
    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn optimizers(&self) -> &OptimizerMap {
        &self.optimizers
    }

    pub fn schedulers(&self) -> &SchedulerMap {
        &self.schedulers
    }

    pub fn callback_names(&self) -> Vec<&str> {
        self.callbacks.names()
    }

    /// Train for `epochs` epochs, counted from `state.epoch` after the
    /// mode-start hooks (a resumed run continues from its checkpoint epoch).
    pub fn train(&mut self, loaders: &LoaderSet, epochs: usize) -> Result<RunSummary> {
        self.run(Mode::Train, loaders, Some(epochs))
    }

    /// One pass over every loader without weight updates.
    pub fn infer(&mut self, loaders: &LoaderSet) -> Result<RunSummary> {
        self.run(Mode::Infer, loaders, None)
    }

    /// A single training epoch dispatched through the train hooks.
    pub fn debug(&mut self, loaders: &LoaderSet) -> Result<RunSummary> {
        self.run(Mode::Debug, loaders, None)
    }

    fn run(
        &mut self,
        mode: Mode,
        loaders: &LoaderSet,
        epochs: Option<usize>,
    ) -> Result<RunSummary> {
        loaders.check_non_empty()?;
        let span = info_span!("run", %mode);
        let _guard = span.enter();

        self.state = RunState::new(mode);
        let (start, end) = match mode {
            Mode::Infer => (Hook::InferStart, Hook::InferEnd),
            Mode::Train | Mode::Debug => (Hook::TrainStart, Hook::TrainEnd),
        };
        info!(loaders = ?loaders.names(), epochs = ?epochs, "Run starting");

        self.dispatch(start)?;
        // Counted from the epoch restored by the mode-start hooks.
        let target = match (mode, epochs) {
            (Mode::Train, Some(epochs)) => epochs,
            _ => self.state.epoch + 1,
        };
        self.state.epochs = target;

        let mut completed = 0;
        while self.state.stop.is_none() && self.state.epoch < target {
            self.run_epoch(loaders)?;
            if self.state.stop.is_none() {
                completed += 1;
            }
            self.state.epoch += 1;
        }

        self.dispatch(end)?;
        let summary = RunSummary {
            mode,
            epochs_completed: completed,
            final_epoch: self.state.epoch,
            stopped: self.state.stop.clone(),
        };
        match &summary.stopped {
            Some(reason) => info!(%reason, epochs = completed, "Run stopped"),
            None => info!(epochs = completed, "Run finished"),
        }
        Ok(summary)
    }

    fn run_epoch(&mut self, loaders: &LoaderSet) -> Result<()> {
        debug!(epoch = self.state.epoch, "Epoch start");
        self.dispatch(Hook::EpochStart)?;

        for (name, loader) in &loaders.loaders {
            if self.state.stop.is_some() {
                break;
            }
            self.state.enter_loader(name, loader.len());
            self.dispatch(Hook::LoaderStart)?;

            if self.state.stop.is_none() {
                for batch in loader.iter() {
                    self.run_batch(batch)?;
                    if self.state.stop.is_some() {
                        break;
                    }
                }
            }

            self.dispatch(Hook::LoaderEnd)?;
        }

        self.dispatch(Hook::EpochEnd)?;
        debug!(epoch = self.state.epoch, "Epoch end");
        Ok(())
    }

    /// A started batch always runs to its end hook.
    fn run_batch(&mut self, batch: Batch) -> Result<()> {
        self.state.clear_batch();
        self.state.batch_size = None;
        self.dispatch(Hook::BatchStart)?;

        let Self {
            model,
            criterion,
            optimizers,
            schedulers,
            processor,
            state,
            ..
        } = self;
        let mut ctx = Collaborators {
            model: model.as_mut(),
            criterion: criterion.as_deref(),
            optimizers,
            schedulers,
        };
        processor.process(batch, state, &mut ctx)?;

        self.dispatch(Hook::BatchEnd)?;
        Ok(())
    }

    /// Dispatch one boundary; the first stop request of the run is kept in
    /// `state.stop`.
    fn dispatch(&mut self, hook: Hook) -> Result<()> {
        let Self {
            model,
            criterion,
            optimizers,
            schedulers,
            callbacks,
            state,
            ..
        } = self;
        let mut ctx = Collaborators {
            model: model.as_mut(),
            criterion: criterion.as_deref(),
            optimizers,
            schedulers,
        };
        if let CallbackAction::Stop(reason) = callbacks.dispatch(hook, state, &mut ctx)? {
            if state.stop.is_none() {
                debug!(hook = hook.event_name(), %reason, "Stop requested");
                state.stop = Some(reason);
            }
        }
        Ok(())
    }
}

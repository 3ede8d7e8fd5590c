//! Epoch-level learning-rate schedulers.
//!
//! A scheduler is a plain serializable value: checkpoints snapshot it and a
//! resume replaces it wholesale.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::callback::{Callback, CallbackAction, Collaborators};
use crate::error::Result;
use crate::optim::set_lr;
use crate::state::RunState;

/// Schedulers of a run, keyed like the optimizers they drive.
pub type SchedulerMap = BTreeMap<String, Scheduler>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scheduler {
    /// Multiply the rate by `gamma` every `step_size` epochs.
    StepLr {
        base_lr: f64,
        step_size: usize,
        gamma: f64,
        #[serde(default)]
        last_epoch: usize,
    },
    /// Multiply the rate by `gamma` every epoch.
    ExponentialLr {
        base_lr: f64,
        gamma: f64,
        #[serde(default)]
        last_epoch: usize,
    },
}

impl Scheduler {
    pub fn step_lr(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Scheduler::StepLr {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            last_epoch: 0,
        }
    }

    pub fn exponential(base_lr: f64, gamma: f64) -> Self {
        Scheduler::ExponentialLr {
            base_lr,
            gamma,
            last_epoch: 0,
        }
    }

    pub fn last_epoch(&self) -> usize {
        match self {
            Scheduler::StepLr { last_epoch, .. } | Scheduler::ExponentialLr { last_epoch, .. } => {
                *last_epoch
            }
        }
    }

    /// Rate multiplier relative to `base_lr` at the current position.
    pub fn factor(&self) -> f64 {
        match self {
            Scheduler::StepLr {
                step_size,
                gamma,
                last_epoch,
                ..
            } => gamma.powi((last_epoch / (*step_size).max(1)) as i32),
            Scheduler::ExponentialLr {
                gamma, last_epoch, ..
            } => gamma.powi(*last_epoch as i32),
        }
    }

    pub fn current_lr(&self) -> f64 {
        match self {
            Scheduler::StepLr { base_lr, .. } | Scheduler::ExponentialLr { base_lr, .. } => {
                base_lr * self.factor()
            }
        }
    }

    /// Advance one epoch and return the new rate multiplier.
    pub fn step(&mut self) -> f64 {
        match self {
            Scheduler::StepLr { last_epoch, .. } | Scheduler::ExponentialLr { last_epoch, .. } => {
                *last_epoch += 1;
            }
        }
        self.factor()
    }
}

/// Steps every scheduler at epoch end and pushes the new rate into the
/// optimizer registered under the same key.
#[derive(Debug, Default)]
pub struct SchedulerCallback;

impl SchedulerCallback {
    pub fn new() -> Self {
        Self
    }
}

impl Callback for SchedulerCallback {
    fn name(&self) -> &str {
        "scheduler"
    }

    fn on_epoch_end(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        if !state.mode.updates_weights() {
            return Ok(CallbackAction::Continue);
        }
        for (key, scheduler) in ctx.schedulers.iter_mut() {
            scheduler.step();
            let lr = scheduler.current_lr();
            if let Some(optimizer) = ctx.optimizers.get_mut(key) {
                set_lr(optimizer.as_mut(), lr);
            }
            debug!(key = %key, epoch = state.epoch, lr, "Scheduler stepped");
        }
        Ok(CallbackAction::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::ToyModel;
    use crate::optim::{OptimizerMap, ParamGroup, Sgd};
    use crate::state::Mode;

    #[test]
    fn test_step_lr_decays_every_step_size() {
        let mut s = Scheduler::step_lr(0.1, 2, 0.5);
        assert_eq!(s.step(), 1.0);
        assert_eq!(s.step(), 0.5);
        assert_eq!(s.step(), 0.5);
        assert_eq!(s.step(), 0.25);
        assert!((s.current_lr() - 0.025).abs() < 1e-12);
        assert_eq!(s.last_epoch(), 4);
    }

    #[test]
    fn test_exponential_decay() {
        let mut s = Scheduler::exponential(1.0, 0.9);
        s.step();
        s.step();
        assert!((s.current_lr() - 0.81).abs() < 1e-12);
    }

    #[test]
    fn test_serde_tagged_roundtrip() {
        let mut s = Scheduler::step_lr(0.1, 3, 0.1);
        s.step();
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["kind"], "step_lr");
        let back: Scheduler = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_callback_updates_matching_optimizer_in_train_only() {
        let mut model = ToyModel::new(vec![]);
        let mut optimizers = OptimizerMap::new();
        optimizers.insert(
            "main".into(),
            Box::new(Sgd::new(vec![ParamGroup::new(vec![], 1.0)])),
        );
        let mut schedulers = SchedulerMap::new();
        schedulers.insert("main".into(), Scheduler::exponential(1.0, 0.5));
        let mut cb = SchedulerCallback::new();

        let mut infer = RunState::new(Mode::Infer);
        {
            let mut ctx = Collaborators {
                model: &mut model,
                criterion: None,
                optimizers: &mut optimizers,
                schedulers: &mut schedulers,
            };
            cb.on_epoch_end(&mut infer, &mut ctx).unwrap();
        }
        assert_eq!(schedulers["main"].last_epoch(), 0);

        let mut train = RunState::new(Mode::Train);
        let mut ctx = Collaborators {
            model: &mut model,
            criterion: None,
            optimizers: &mut optimizers,
            schedulers: &mut schedulers,
        };
        cb.on_epoch_end(&mut train, &mut ctx).unwrap();
        assert_eq!(ctx.optimizers["main"].param_groups()[0].lr, 0.5);
    }
}

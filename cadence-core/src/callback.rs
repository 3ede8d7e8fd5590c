//! Observer protocol for the training loop.
//!
//! Phase nesting seen by observers:
//!
//! ```text
//! mode start (train / infer)
//!     epoch start
//!         loader start
//!             batch start
//!             (batch processor)
//!             batch end
//!         loader end
//!     epoch end
//! mode end
//! ```
//!
//! Every hook defaults to a no-op, so an observer implements only the hooks
//! it cares about.

use std::fmt;

use tracing::debug;

use crate::error::Result;
use crate::model::{Criterion, Model};
use crate::optim::OptimizerMap;
use crate::scheduler::SchedulerMap;
use crate::state::{RunState, StopReason};

/// What an observer asks of the loop after a hook.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackAction {
    Continue,
    /// Finish the run cleanly: remaining batches, loaders and epochs are
    /// skipped, open phases are still closed.
    Stop(StopReason),
}

/// Collaborators handed to every hook alongside the run state.
pub struct Collaborators<'a> {
    pub model: &'a mut dyn Model,
    pub criterion: Option<&'a dyn Criterion>,
    pub optimizers: &'a mut OptimizerMap,
    pub schedulers: &'a mut SchedulerMap,
}

/// A phase boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    TrainStart,
    TrainEnd,
    InferStart,
    InferEnd,
    EpochStart,
    EpochEnd,
    LoaderStart,
    LoaderEnd,
    BatchStart,
    BatchEnd,
}

impl Hook {
    pub fn event_name(&self) -> &'static str {
        match self {
            Hook::TrainStart => "train_start",
            Hook::TrainEnd => "train_end",
            Hook::InferStart => "infer_start",
            Hook::InferEnd => "infer_end",
            Hook::EpochStart => "epoch_start",
            Hook::EpochEnd => "epoch_end",
            Hook::LoaderStart => "loader_start",
            Hook::LoaderEnd => "loader_end",
            Hook::BatchStart => "batch_start",
            Hook::BatchEnd => "batch_end",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_name())
    }
}

/// A training-loop observer.
#[allow(unused_variables)]
pub trait Callback {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "callback"
    }

    fn on_train_start(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_train_end(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_infer_start(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_infer_end(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_epoch_start(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_epoch_end(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_loader_start(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_loader_end(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_batch_start(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }

    fn on_batch_end(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        Ok(CallbackAction::Continue)
    }
}

/// Observers in registration order.
#[derive(Default)]
pub struct CallbackList {
    callbacks: Vec<Box<dyn Callback>>,
}

impl CallbackList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer; it runs after every observer registered before it.
    pub fn add(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.callbacks.iter().map(|c| c.name()).collect()
    }

    /// Invoke `hook` on every observer in order.
    ///
    /// The first error aborts the dispatch; observers after it do not run.
    /// Every observer runs even after one asks to stop, and the first stop
    /// request is returned.
    pub fn dispatch(
        &mut self,
        hook: Hook,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        let mut outcome = CallbackAction::Continue;
        for callback in &mut self.callbacks {
            let action = match hook {
                Hook::TrainStart => callback.on_train_start(state, ctx),
                Hook::TrainEnd => callback.on_train_end(state, ctx),
                Hook::InferStart => callback.on_infer_start(state, ctx),
                Hook::InferEnd => callback.on_infer_end(state, ctx),
                Hook::EpochStart => callback.on_epoch_start(state, ctx),
                Hook::EpochEnd => callback.on_epoch_end(state, ctx),
                Hook::LoaderStart => callback.on_loader_start(state, ctx),
                Hook::LoaderEnd => callback.on_loader_end(state, ctx),
                Hook::BatchStart => callback.on_batch_start(state, ctx),
                Hook::BatchEnd => callback.on_batch_end(state, ctx),
            }?;
            if let CallbackAction::Stop(reason) = action {
                debug!(
                    hook = hook.event_name(),
                    callback = callback.name(),
                    reason = %reason,
                    "Observer requested stop"
                );
                if outcome == CallbackAction::Continue {
                    outcome = CallbackAction::Stop(reason);
                }
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Records `name:hook` for every hook it sees.
    pub struct Recorder {
        pub name: String,
        pub log: Rc<RefCell<Vec<String>>>,
    }

    impl Recorder {
        pub fn new(name: &str, log: &Rc<RefCell<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                log: Rc::clone(log),
            }
        }

        fn record(&self, hook: Hook, state: &RunState) -> Result<CallbackAction> {
            let entry = match hook {
                Hook::LoaderStart | Hook::LoaderEnd => {
                    format!("{}:{}:{}", self.name, hook, state.loader_mode)
                }
                _ => format!("{}:{}", self.name, hook),
            };
            self.log.borrow_mut().push(entry);
            Ok(CallbackAction::Continue)
        }
    }

    impl Callback for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_train_start(
            &mut self,
            state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            self.record(Hook::TrainStart, state)
        }

        fn on_train_end(
            &mut self,
            state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            self.record(Hook::TrainEnd, state)
        }

        fn on_infer_start(
            &mut self,
            state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            self.record(Hook::InferStart, state)
        }

        fn on_infer_end(
            &mut self,
            state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            self.record(Hook::InferEnd, state)
        }

        fn on_epoch_start(
            &mut self,
            state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            self.record(Hook::EpochStart, state)
        }

        fn on_epoch_end(
            &mut self,
            state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            self.record(Hook::EpochEnd, state)
        }

        fn on_loader_start(
            &mut self,
            state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            self.record(Hook::LoaderStart, state)
        }

        fn on_loader_end(
            &mut self,
            state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            self.record(Hook::LoaderEnd, state)
        }

        fn on_batch_start(
            &mut self,
            state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            self.record(Hook::BatchStart, state)
        }

        fn on_batch_end(
            &mut self,
            state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            self.record(Hook::BatchEnd, state)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::Recorder;
    use super::*;
    use crate::error::RunError;
    use crate::model::testing::ToyModel;
    use crate::state::Mode;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Failing;

    impl Callback for Failing {
        fn on_epoch_start(
            &mut self,
            _state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            Err(RunError::Batch {
                message: "boom".into(),
            }
            .into())
        }
    }

    struct Stopper(usize);

    impl Callback for Stopper {
        fn on_batch_end(
            &mut self,
            _state: &mut RunState,
            _ctx: &mut Collaborators<'_>,
        ) -> Result<CallbackAction> {
            Ok(CallbackAction::Stop(StopReason::RangeExhausted {
                optimizer_key: "main".into(),
                steps: self.0,
            }))
        }
    }

    fn with_ctx<T>(f: impl FnOnce(&mut Collaborators<'_>) -> T) -> T {
        let mut model = ToyModel::new(vec![]);
        let mut optimizers = OptimizerMap::new();
        let mut schedulers = SchedulerMap::new();
        let mut ctx = Collaborators {
            model: &mut model,
            criterion: None,
            optimizers: &mut optimizers,
            schedulers: &mut schedulers,
        };
        f(&mut ctx)
    }

    #[test]
    fn test_dispatch_runs_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut list = CallbackList::new();
        list.add(Box::new(Recorder::new("a", &log)));
        list.add(Box::new(Recorder::new("b", &log)));
        let mut state = RunState::new(Mode::Train);

        with_ctx(|ctx| list.dispatch(Hook::EpochStart, &mut state, ctx)).unwrap();
        assert_eq!(*log.borrow(), vec!["a:epoch_start", "b:epoch_start"]);
        assert_eq!(list.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_dispatch_error_aborts_remaining_observers() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut list = CallbackList::new();
        list.add(Box::new(Failing));
        list.add(Box::new(Recorder::new("after", &log)));
        let mut state = RunState::new(Mode::Train);

        let result = with_ctx(|ctx| list.dispatch(Hook::EpochStart, &mut state, ctx));
        assert!(result.is_err());
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_dispatch_stop_lets_later_observers_run() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut list = CallbackList::new();
        list.add(Box::new(Stopper(3)));
        list.add(Box::new(Stopper(7)));
        list.add(Box::new(Recorder::new("logger", &log)));
        let mut state = RunState::new(Mode::Train);

        let action = with_ctx(|ctx| list.dispatch(Hook::BatchEnd, &mut state, ctx)).unwrap();
        assert_eq!(
            action,
            CallbackAction::Stop(StopReason::RangeExhausted {
                optimizer_key: "main".into(),
                steps: 3,
            })
        );
        assert_eq!(*log.borrow(), vec!["logger:batch_end"]);
    }

    #[test]
    fn test_default_hooks_are_noops() {
        struct Silent;
        impl Callback for Silent {}
        let mut list = CallbackList::new();
        list.add(Box::new(Silent));
        let mut state = RunState::new(Mode::Infer);
        for hook in [Hook::InferStart, Hook::LoaderStart, Hook::BatchEnd, Hook::InferEnd] {
            let action = with_ctx(|ctx| list.dispatch(hook, &mut state, ctx)).unwrap();
            assert_eq!(action, CallbackAction::Continue);
        }
    }
}

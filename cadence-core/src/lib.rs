//! # Cadence Core
//!
//! A phase-driven training loop. The [`Runner`] walks
//! mode → epoch → loader → batch and hands every boundary to an ordered list
//! of observers; learning-rate schedules, the optimizer step, metric logging
//! and checkpoint retention are all observers.

pub mod callback;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod persistence;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod state;
pub mod step;
pub mod tensor;

// Re-export commonly used types at the crate root.
pub use callback::{Callback, CallbackAction, CallbackList, Collaborators, Hook};
pub use checkpoint::{Checkpoint, CheckpointCallback, RetainedCheckpoint};
pub use config::{CadenceConfig, CheckpointConfig, LoggerConfig, OneCycleConfig, RunConfig};
pub use error::{CadenceError, Result};
pub use logger::{AverageMeter, JsonlSink, LoggerCallback, MemorySink, NullSink, ScalarSink};
pub use metrics::{PrecisionCallback, precision_at_k};
pub use model::{Criterion, HalfPrecision, Loss, Model, Precision};
pub use optim::{Adam, MAIN_KEY, Momentum, Optimizer, OptimizerMap, ParamGroup, Sgd};
pub use runner::{Batch, BatchProcessor, Loader, LoaderSet, RunSummary, Runner, VecLoader};
pub use schedule::{LrSchedule, LrUpdate, LrUpdater, OneCycle, RangeFinder};
pub use scheduler::{Scheduler, SchedulerCallback, SchedulerMap};
pub use state::{MetricValue, Mode, RunState, StopReason};
pub use step::OptimizerCallback;
pub use tensor::{DType, Parameter, Tensor};

//! Batch-level learning-rate and momentum schedules.
//!
//! An [`LrSchedule`] only computes values; [`LrUpdater`] is the observer that
//! runs it at loader start and after every batch, writes the result into
//! `state.lr` / `state.momentum` and into the optimizer's parameter groups.

use tracing::{debug, info};

use crate::callback::{Callback, CallbackAction, Collaborators};
use crate::config::{OneCycleConfig, RangeFinderConfig};
use crate::error::{ConfigError, Result};
use crate::optim::{set_lr, set_momentum, MAIN_KEY};
use crate::state::{RunState, StopReason};

/// Outcome of a single schedule evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LrUpdate {
    /// Leave the current value alone.
    Unchanged,
    Set(f64),
    /// The schedule has nothing left to produce; the run should stop.
    Exhausted,
}

/// A learning-rate/momentum policy driven by an [`LrUpdater`].
pub trait LrSchedule {
    fn name(&self) -> &str;

    /// Key of the optimizer this schedule drives.
    fn optimizer_key(&self) -> &str;

    /// Called at the start of every training loader with its length.
    fn prepare(&mut self, _loader_len: usize) {}

    fn calc_lr(&mut self) -> LrUpdate {
        LrUpdate::Unchanged
    }

    fn calc_momentum(&mut self) -> LrUpdate {
        LrUpdate::Unchanged
    }

    /// Set once the schedule has run out; checked after every batch.
    fn stop_reason(&self) -> Option<StopReason> {
        None
    }
}

/// Observer applying an [`LrSchedule`] to the run.
#[derive(Debug)]
pub struct LrUpdater<S> {
    schedule: S,
}

impl<S: LrSchedule> LrUpdater<S> {
    pub fn new(schedule: S) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &S {
        &self.schedule
    }

    fn update_optimizer(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        let key = self.schedule.optimizer_key().to_string();
        if !state.is_train {
            // Zeroed for the logs only; the optimizer keeps its values.
            state.lr.insert(key.clone(), 0.0);
            state.momentum.insert(key, 0.0);
            return Ok(CallbackAction::Continue);
        }

        let optimizer = ctx
            .optimizers
            .get_mut(&key)
            .ok_or_else(|| ConfigError::UnknownOptimizer { key: key.clone() })?;

        match self.schedule.calc_lr() {
            LrUpdate::Set(lr) => {
                set_lr(optimizer.as_mut(), lr);
                state.lr.insert(key.clone(), lr);
            }
            LrUpdate::Unchanged => {}
            LrUpdate::Exhausted => return Ok(self.exhausted()),
        }
        match self.schedule.calc_momentum() {
            LrUpdate::Set(momentum) => {
                set_momentum(optimizer.as_mut(), momentum);
                state.momentum.insert(key, momentum);
            }
            LrUpdate::Unchanged => {}
            LrUpdate::Exhausted => return Ok(self.exhausted()),
        }
        Ok(CallbackAction::Continue)
    }

    fn exhausted(&self) -> CallbackAction {
        match self.schedule.stop_reason() {
            Some(reason) => CallbackAction::Stop(reason),
            None => CallbackAction::Stop(StopReason::RangeExhausted {
                optimizer_key: self.schedule.optimizer_key().to_string(),
                steps: 0,
            }),
        }
    }
}

impl<S: LrSchedule> Callback for LrUpdater<S> {
    fn name(&self) -> &str {
        self.schedule.name()
    }

    fn on_loader_start(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        if state.is_train {
            self.schedule.prepare(state.loader_len);
        }
        self.update_optimizer(state, ctx)
    }

    fn on_batch_end(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        let action = self.update_optimizer(state, ctx)?;
        if let CallbackAction::Stop(_) = action {
            return Ok(action);
        }
        match self.schedule.stop_reason() {
            Some(reason) => {
                info!(schedule = self.schedule.name(), %reason, "Schedule finished");
                Ok(CallbackAction::Stop(reason))
            }
            None => Ok(CallbackAction::Continue),
        }
    }
}

/// One-cycle policy: the rate climbs linearly from `init_lr / div` to
/// `init_lr` over the first `1 / cut_div` of the cycle, then falls back;
/// momentum moves the opposite way between the two ends of `momentum_range`.
///
/// The cycle wraps and repeats until the run stops.
#[derive(Debug, Clone)]
pub struct OneCycle {
    init_lr: f64,
    cycle_len: usize,
    div: usize,
    cut_div: usize,
    /// `(max, min)` momentum.
    momentum_range: (f64, f64),
    optimizer_key: String,
    total_iter: usize,
    cut_point: usize,
    cycle_iter: usize,
    cycle_count: usize,
    /// Percent of the most recent `calc_lr`, reused for momentum.
    last_percent: Option<f64>,
}

impl OneCycle {
    pub fn new(
        init_lr: f64,
        cycle_len: usize,
        div: usize,
        cut_div: usize,
        momentum_range: (f64, f64),
    ) -> Self {
        Self {
            init_lr,
            cycle_len,
            div: div.max(1),
            cut_div: cut_div.max(1),
            momentum_range,
            optimizer_key: MAIN_KEY.to_string(),
            total_iter: 0,
            cut_point: 0,
            cycle_iter: 0,
            cycle_count: 0,
            last_percent: None,
        }
    }

    pub fn from_config(config: &OneCycleConfig) -> Self {
        Self::new(
            config.init_lr,
            config.cycle_len,
            config.div,
            config.cut_div,
            config.momentum_range,
        )
        .with_optimizer_key(&config.optimizer_key)
    }

    pub fn with_optimizer_key(mut self, key: &str) -> Self {
        self.optimizer_key = key.to_string();
        self
    }

    pub fn total_iter(&self) -> usize {
        self.total_iter
    }

    pub fn cut_point(&self) -> usize {
        self.cut_point
    }

    pub fn cycle_iter(&self) -> usize {
        self.cycle_iter
    }

    pub fn cycle_count(&self) -> usize {
        self.cycle_count
    }

    /// Position within the cycle in `[0, 1]`: 0 at the floor, 1 at the peak.
    fn percent(&self, i: usize) -> f64 {
        let i = i as f64;
        let cut = self.cut_point as f64;
        let total = self.total_iter as f64;
        if i > cut {
            1.0 - (i - cut) / (total - cut)
        } else {
            i / cut
        }
    }
}

impl LrSchedule for OneCycle {
    fn name(&self) -> &str {
        "one_cycle"
    }

    fn optimizer_key(&self) -> &str {
        &self.optimizer_key
    }

    fn prepare(&mut self, loader_len: usize) {
        self.total_iter = loader_len * self.cycle_len;
        // A cycle shorter than `cut_div` would otherwise have no ascent.
        self.cut_point = (self.total_iter / self.cut_div).max(1);
        if self.cycle_iter >= self.total_iter {
            self.cycle_iter = 0;
        }
        debug!(
            total_iter = self.total_iter,
            cut_point = self.cut_point,
            cycle_iter = self.cycle_iter,
            "One-cycle prepared"
        );
    }

    fn calc_lr(&mut self) -> LrUpdate {
        if self.total_iter == 0 {
            return LrUpdate::Unchanged;
        }
        let percent = self.percent(self.cycle_iter);
        self.last_percent = Some(percent);
        let div = self.div as f64;
        let lr = self.init_lr * (1.0 + percent * (div - 1.0)) / div;

        self.cycle_iter += 1;
        if self.cycle_iter == self.total_iter {
            self.cycle_iter = 0;
            self.cycle_count += 1;
        }
        LrUpdate::Set(lr)
    }

    fn calc_momentum(&mut self) -> LrUpdate {
        if self.total_iter == 0 {
            return LrUpdate::Unchanged;
        }
        let percent = self
            .last_percent
            .unwrap_or_else(|| self.percent(self.cycle_iter));
        let (max, min) = self.momentum_range;
        LrUpdate::Set(max - percent * (max - min))
    }
}

/// Learning-rate range test: the rate grows geometrically from `init_lr` to
/// `final_lr` over `n_steps` batches, after which the run is stopped.
#[derive(Debug, Clone)]
pub struct RangeFinder {
    init_lr: f64,
    final_lr: f64,
    n_steps: Option<usize>,
    optimizer_key: String,
    multiplier: f64,
    find_iter: usize,
}

impl RangeFinder {
    pub fn new(init_lr: f64, final_lr: f64, n_steps: Option<usize>) -> Self {
        Self {
            init_lr,
            final_lr,
            n_steps,
            optimizer_key: MAIN_KEY.to_string(),
            multiplier: 0.0,
            find_iter: 0,
        }
    }

    pub fn from_config(config: &RangeFinderConfig) -> Self {
        Self::new(config.init_lr, config.final_lr, config.n_steps)
            .with_optimizer_key(&config.optimizer_key)
    }

    pub fn with_optimizer_key(mut self, key: &str) -> Self {
        self.optimizer_key = key.to_string();
        self
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn n_steps(&self) -> Option<usize> {
        self.n_steps
    }

    /// Number of rates produced so far.
    pub fn find_iter(&self) -> usize {
        self.find_iter
    }

    fn is_exhausted(&self) -> bool {
        matches!(self.n_steps, Some(n) if self.find_iter > n)
    }
}

impl LrSchedule for RangeFinder {
    fn name(&self) -> &str {
        "range_finder"
    }

    fn optimizer_key(&self) -> &str {
        &self.optimizer_key
    }

    fn prepare(&mut self, loader_len: usize) {
        // Zero steps means unset, like `None`.
        let n_steps = match self.n_steps {
            Some(n) if n > 0 => n,
            _ => loader_len,
        };
        self.n_steps = Some(n_steps);
        self.multiplier = if n_steps == 0 {
            1.0
        } else {
            (self.final_lr / self.init_lr).powf(1.0 / n_steps as f64)
        };
        debug!(n_steps, multiplier = self.multiplier, "Range finder prepared");
    }

    fn calc_lr(&mut self) -> LrUpdate {
        if self.is_exhausted() {
            return LrUpdate::Exhausted;
        }
        let lr = self.init_lr * self.multiplier.powi(self.find_iter as i32);
        self.find_iter += 1;
        LrUpdate::Set(lr)
    }

    fn stop_reason(&self) -> Option<StopReason> {
        self.is_exhausted().then(|| StopReason::RangeExhausted {
            optimizer_key: self.optimizer_key.clone(),
            steps: self.n_steps.unwrap_or(0),
        })
    }
}

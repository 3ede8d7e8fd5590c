//! Backward pass and parameter update, with decoupled weight decay and a
//! reduced-precision path driven through full-precision master weights.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::callback::{Callback, CallbackAction, Collaborators};
use crate::config::OptimizerStepConfig;
use crate::error::{ConfigError, OptimizerError, Result, RunError};
use crate::model::{Model, Precision};
use crate::optim::{clip_grad_norm, OptimizerMap, MAIN_KEY};
use crate::state::RunState;
use crate::tensor::{copy_grads, copy_params, Parameter};

/// Full-precision master copies of a model's trainable parameters, in the
/// order the reduced-precision step pairs them.
pub fn master_params(model: &dyn Model) -> Vec<Parameter> {
    trainable(model).iter().map(Parameter::master_copy).collect()
}

/// Overwrite the `main` optimizer's master copies with the model's current
/// values. Needed whenever the reduced-precision weights change outside the
/// optimizer step, e.g. after a checkpoint load.
pub fn sync_master_params(model: &dyn Model, optimizers: &OptimizerMap) -> Result<()> {
    let Some(optimizer) = optimizers.get(MAIN_KEY) else {
        return Ok(());
    };
    let master = optimizer
        .param_groups()
        .first()
        .map(|g| g.params.clone())
        .ok_or_else(|| OptimizerError::NoParamGroups {
            key: MAIN_KEY.to_string(),
        })?;
    copy_params(&trainable(model), &master)?;
    debug!(count = master.len(), "Synced master parameters from model");
    Ok(())
}

fn trainable(model: &dyn Model) -> Vec<Parameter> {
    model
        .parameters()
        .into_iter()
        .filter(Parameter::requires_grad)
        .collect()
}

/// Observer that owns the optimizer step for every training batch.
#[derive(Debug)]
pub struct OptimizerCallback {
    grad_clip: Option<f64>,
    fp16_grad_scale: f32,
    fp16: bool,
    /// Optimizer key → configured weight decay per parameter group, held
    /// for the current epoch while the optimizer's own decay is zeroed.
    decoupled: BTreeMap<String, Vec<f64>>,
}

impl OptimizerCallback {
    pub fn new(grad_clip: Option<f64>, fp16_grad_scale: f32) -> Self {
        Self {
            grad_clip,
            fp16_grad_scale,
            fp16: false,
            decoupled: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &OptimizerStepConfig) -> Self {
        Self::new(config.grad_clip, config.fp16_grad_scale)
    }

    /// Whether the reduced-precision path was selected at mode start.
    pub fn is_fp16(&self) -> bool {
        self.fp16
    }

    /// Weight decay currently applied by hand for `key`, per group.
    pub fn decoupled_weight_decay(&self, key: &str) -> Option<&[f64]> {
        self.decoupled.get(key).map(Vec::as_slice)
    }

    /// Decoupled decay, clipping and the optimizer's own step, per optimizer.
    fn grad_step(&self, optimizers: &mut OptimizerMap) -> Result<()> {
        for (key, optimizer) in optimizers.iter_mut() {
            if let Some(wds) = self.decoupled.get(key) {
                for (group, &wd) in optimizer.param_groups().iter().zip(wds) {
                    if wd <= 0.0 {
                        continue;
                    }
                    let shrink = (group.lr * wd) as f32;
                    for p in &group.params {
                        p.update_data(|values| {
                            for v in values.iter_mut() {
                                *v -= shrink * *v;
                            }
                        });
                    }
                }
            }
            if let Some(max_norm) = self.grad_clip {
                let norm = clip_grad_norm(&optimizer.parameters(), max_norm);
                trace!(key = %key, norm, max_norm, "Clipped gradients");
            }
            optimizer.step()?;
        }
        Ok(())
    }

    fn check_half_precision(&self, optimizers: &OptimizerMap) -> Result<()> {
        if optimizers.len() != 1 || !optimizers.contains_key(MAIN_KEY) {
            return Err(ConfigError::HalfPrecisionOptimizers {
                found: optimizers.len(),
                keys: optimizers.keys().cloned().collect::<Vec<_>>().join(", "),
            }
            .into());
        }
        let scale = self.fp16_grad_scale;
        if scale == 0.0 || !scale.is_finite() {
            return Err(OptimizerError::InvalidGradScale { scale }.into());
        }
        Ok(())
    }

    fn full_precision_step(
        &self,
        state: &RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<()> {
        for optimizer in ctx.optimizers.values_mut() {
            optimizer.zero_grad();
        }
        if ctx.optimizers.is_empty() {
            return Ok(());
        }
        let loss = state.loss.as_ref().ok_or(RunError::MissingLoss)?;
        loss.backward(1.0)?;
        self.grad_step(ctx.optimizers)
    }

    fn half_precision_step(
        &self,
        state: &RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<()> {
        ctx.model.zero_grad();
        if ctx.optimizers.is_empty() {
            return Ok(());
        }
        self.check_half_precision(ctx.optimizers)?;
        let loss = state.loss.as_ref().ok_or(RunError::MissingLoss)?;
        loss.backward(self.fp16_grad_scale)?;

        let master = match ctx.optimizers.get(MAIN_KEY) {
            Some(optimizer) => optimizer
                .param_groups()
                .first()
                .map(|g| g.params.clone())
                .ok_or_else(|| OptimizerError::NoParamGroups {
                    key: MAIN_KEY.to_string(),
                })?,
            None => Vec::new(),
        };
        let model_params = trainable(ctx.model);

        copy_grads(&model_params, &master)?;
        let unscale = 1.0 / self.fp16_grad_scale;
        for p in &master {
            p.scale_grad(unscale);
        }

        self.grad_step(ctx.optimizers)?;

        copy_params(&master, &model_params)?;
        ctx.model.synchronize();
        Ok(())
    }
}

impl Callback for OptimizerCallback {
    fn name(&self) -> &str {
        "optimizer"
    }

    fn on_train_start(
        &mut self,
        _state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        self.fp16 = ctx.model.precision() == Precision::Half;
        if self.fp16 && !ctx.optimizers.is_empty() {
            self.check_half_precision(ctx.optimizers)?;
        }
        debug!(fp16 = self.fp16, grad_clip = ?self.grad_clip, "Optimizer step configured");
        Ok(CallbackAction::Continue)
    }

    fn on_epoch_start(
        &mut self,
        _state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        self.decoupled.clear();
        for (key, optimizer) in ctx.optimizers.iter_mut() {
            let wds: Vec<f64> = optimizer
                .param_groups()
                .iter()
                .map(|g| g.weight_decay)
                .collect();
            if !wds.iter().any(|&wd| wd > 0.0) {
                continue;
            }
            for group in optimizer.param_groups_mut() {
                if group.weight_decay > 0.0 {
                    group.weight_decay = 0.0;
                }
            }
            debug!(key = %key, weight_decay = ?wds, "Decoupled weight decay");
            self.decoupled.insert(key.clone(), wds);
        }
        Ok(CallbackAction::Continue)
    }

    fn on_batch_end(
        &mut self,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        if !state.is_train {
            return Ok(CallbackAction::Continue);
        }
        if self.fp16 {
            self.half_precision_step(state, ctx)?;
        } else {
            self.full_precision_step(state, ctx)?;
        }
        Ok(CallbackAction::Continue)
    }

    fn on_epoch_end(
        &mut self,
        _state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        for (key, wds) in &self.decoupled {
            if let Some(optimizer) = ctx.optimizers.get_mut(key) {
                for (group, &wd) in optimizer.param_groups_mut().iter_mut().zip(wds) {
                    group.weight_decay = wd;
                }
            }
        }
        Ok(CallbackAction::Continue)
    }
}

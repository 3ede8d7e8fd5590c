//! Optimizer contract, parameter groups and reference optimizers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{OptimizerError, Result};
use crate::tensor::Parameter;

/// Key of the optimizer a single-optimizer run registers under.
pub const MAIN_KEY: &str = "main";

/// Optimizers of a run, keyed by a short stable name.
pub type OptimizerMap = BTreeMap<String, Box<dyn Optimizer>>;

/// Momentum hyperparameter of a parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Momentum {
    None,
    Scalar(f64),
    /// Adam-style `(beta1, beta2)`; momentum schedules drive `beta1`.
    Betas(f64, f64),
}

/// A set of parameters sharing hyperparameters.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub params: Vec<Parameter>,
    pub lr: f64,
    pub weight_decay: f64,
    pub momentum: Momentum,
}

impl ParamGroup {
    pub fn new(params: Vec<Parameter>, lr: f64) -> Self {
        Self {
            params,
            lr,
            weight_decay: 0.0,
            momentum: Momentum::None,
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_momentum(mut self, momentum: Momentum) -> Self {
        self.momentum = momentum;
        self
    }

    fn hyperparams(&self) -> GroupHyperparams {
        GroupHyperparams {
            lr: self.lr,
            weight_decay: self.weight_decay,
            momentum: self.momentum,
        }
    }

    fn apply(&mut self, hp: &GroupHyperparams) {
        self.lr = hp.lr;
        self.weight_decay = hp.weight_decay;
        self.momentum = hp.momentum;
    }
}

/// Serializable hyperparameters of one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupHyperparams {
    lr: f64,
    weight_decay: f64,
    momentum: Momentum,
}

/// A parameter-update rule.
pub trait Optimizer {
    fn name(&self) -> &str;

    fn param_groups(&self) -> &[ParamGroup];

    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Reset every accumulated gradient to zero.
    fn zero_grad(&mut self) {
        for group in self.param_groups() {
            for p in &group.params {
                p.zero_grad();
            }
        }
    }

    /// Apply one update from the accumulated gradients.
    fn step(&mut self) -> Result<()>;

    fn state_dict(&self) -> Result<serde_json::Value>;

    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()>;

    /// Every parameter across all groups.
    fn parameters(&self) -> Vec<Parameter> {
        self.param_groups()
            .iter()
            .flat_map(|g| g.params.iter().cloned())
            .collect()
    }
}

/// Clip the global L2 norm of the parameters' gradients to `max_norm`.
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(params: &[Parameter], max_norm: f64) -> f64 {
    let total_norm_sq: f64 = params
        .iter()
        .filter_map(|p| p.grad())
        .flatten()
        .map(|g| f64::from(g) * f64::from(g))
        .sum();
    let total_norm = total_norm_sq.sqrt();
    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for p in params {
            p.scale_grad(clip_coef as f32);
        }
    }
    total_norm
}

/// Set the learning rate of every parameter group.
pub fn set_lr(optimizer: &mut dyn Optimizer, lr: f64) {
    for group in optimizer.param_groups_mut() {
        group.lr = lr;
    }
}

/// Set momentum on every parameter group: `beta1` when the first group
/// carries betas, the scalar momentum otherwise.
pub fn set_momentum(optimizer: &mut dyn Optimizer, momentum: f64) {
    let uses_betas = matches!(
        optimizer.param_groups().first().map(|g| g.momentum),
        Some(Momentum::Betas(..))
    );
    for group in optimizer.param_groups_mut() {
        group.momentum = match (uses_betas, group.momentum) {
            (true, Momentum::Betas(_, beta2)) => Momentum::Betas(momentum, beta2),
            (true, _) => Momentum::Betas(momentum, 0.999),
            (false, _) => Momentum::Scalar(momentum),
        };
    }
}

fn load_groups(
    name: &str,
    groups: &mut [ParamGroup],
    stored: &[GroupHyperparams],
) -> Result<()> {
    if stored.len() != groups.len() {
        return Err(OptimizerError::StateLoad {
            key: name.to_string(),
            message: format!(
                "state has {} parameter groups, optimizer has {}",
                stored.len(),
                groups.len()
            ),
        }
        .into());
    }
    for (group, hp) in groups.iter_mut().zip(stored) {
        group.apply(hp);
    }
    Ok(())
}

fn state_load_error(name: &str, err: serde_json::Error) -> OptimizerError {
    OptimizerError::StateLoad {
        key: name.to_string(),
        message: err.to_string(),
    }
}

/// Stochastic gradient descent with heavy-ball momentum.
///
/// Weight decay is folded into the gradient (`g + wd * p`).
pub struct Sgd {
    groups: Vec<ParamGroup>,
    velocity: BTreeMap<String, Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct SgdState {
    groups: Vec<GroupHyperparams>,
    velocity: BTreeMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(groups: Vec<ParamGroup>) -> Self {
        let groups = groups
            .into_iter()
            .map(|g| match g.momentum {
                Momentum::None => g.with_momentum(Momentum::Scalar(0.0)),
                _ => g,
            })
            .collect();
        Self {
            groups,
            velocity: BTreeMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self) -> Result<()> {
        for group in &self.groups {
            let momentum = match group.momentum {
                Momentum::Scalar(m) => m as f32,
                Momentum::Betas(b1, _) => b1 as f32,
                Momentum::None => 0.0,
            };
            let lr = group.lr as f32;
            let wd = group.weight_decay as f32;
            for p in &group.params {
                let Some(grad) = p.grad() else { continue };
                let data = p.data();
                let mut d_p: Vec<f32> = grad.iter().zip(&data).map(|(g, w)| g + wd * w).collect();
                if momentum != 0.0 {
                    let name = p.name();
                    match self.velocity.get_mut(&name) {
                        Some(buf) if buf.len() == d_p.len() => {
                            for (b, d) in buf.iter_mut().zip(&d_p) {
                                *b = momentum * *b + d;
                            }
                            d_p.clone_from(buf);
                        }
                        _ => {
                            self.velocity.insert(name, d_p.clone());
                        }
                    }
                }
                p.update_data(|values| {
                    for (v, d) in values.iter_mut().zip(&d_p) {
                        *v -= lr * d;
                    }
                });
            }
        }
        Ok(())
    }

    fn state_dict(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(SgdState {
            groups: self.groups.iter().map(ParamGroup::hyperparams).collect(),
            velocity: self.velocity.clone(),
        })?)
    }

    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()> {
        let state: SgdState =
            serde_json::from_value(state.clone()).map_err(|e| state_load_error("sgd", e))?;
        load_groups("sgd", &mut self.groups, &state.groups)?;
        self.velocity = state.velocity;
        Ok(())
    }
}

/// Adam with bias correction; weight decay is folded into the gradient.
pub struct Adam {
    groups: Vec<ParamGroup>,
    eps: f64,
    steps: BTreeMap<String, u64>,
    exp_avg: BTreeMap<String, Vec<f32>>,
    exp_avg_sq: BTreeMap<String, Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct AdamState {
    groups: Vec<GroupHyperparams>,
    eps: f64,
    steps: BTreeMap<String, u64>,
    exp_avg: BTreeMap<String, Vec<f32>>,
    exp_avg_sq: BTreeMap<String, Vec<f32>>,
}

impl Adam {
    pub fn new(groups: Vec<ParamGroup>) -> Self {
        let groups = groups
            .into_iter()
            .map(|g| match g.momentum {
                Momentum::Betas(..) => g,
                _ => g.with_momentum(Momentum::Betas(0.9, 0.999)),
            })
            .collect();
        Self {
            groups,
            eps: 1e-8,
            steps: BTreeMap::new(),
            exp_avg: BTreeMap::new(),
            exp_avg_sq: BTreeMap::new(),
        }
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self) -> Result<()> {
        for group in &self.groups {
            let (beta1, beta2) = match group.momentum {
                Momentum::Betas(b1, b2) => (b1, b2),
                Momentum::Scalar(m) => (m, 0.999),
                Momentum::None => (0.9, 0.999),
            };
            for p in &group.params {
                let Some(grad) = p.grad() else { continue };
                let name = p.name();
                let data = p.data();
                let step = self.steps.entry(name.clone()).or_insert(0);
                *step += 1;
                let t = *step as i32;
                let m = self
                    .exp_avg
                    .entry(name.clone())
                    .or_insert_with(|| vec![0.0; data.len()]);
                let v = self
                    .exp_avg_sq
                    .entry(name)
                    .or_insert_with(|| vec![0.0; data.len()]);
                let bias1 = 1.0 - beta1.powi(t);
                let bias2 = 1.0 - beta2.powi(t);
                let mut update = vec![0.0f32; data.len()];
                for i in 0..data.len() {
                    let g = f64::from(grad[i]) + group.weight_decay * f64::from(data[i]);
                    let mi = beta1 * f64::from(m[i]) + (1.0 - beta1) * g;
                    let vi = beta2 * f64::from(v[i]) + (1.0 - beta2) * g * g;
                    m[i] = mi as f32;
                    v[i] = vi as f32;
                    let denom = (vi / bias2).sqrt() + self.eps;
                    update[i] = (group.lr * (mi / bias1) / denom) as f32;
                }
                p.update_data(|values| {
                    for (w, u) in values.iter_mut().zip(&update) {
                        *w -= u;
                    }
                });
            }
        }
        Ok(())
    }

    fn state_dict(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(AdamState {
            groups: self.groups.iter().map(ParamGroup::hyperparams).collect(),
            eps: self.eps,
            steps: self.steps.clone(),
            exp_avg: self.exp_avg.clone(),
            exp_avg_sq: self.exp_avg_sq.clone(),
        })?)
    }

    fn load_state_dict(&mut self, state: &serde_json::Value) -> Result<()> {
        let state: AdamState =
            serde_json::from_value(state.clone()).map_err(|e| state_load_error("adam", e))?;
        load_groups("adam", &mut self.groups, &state.groups)?;
        self.eps = state.eps;
        self.steps = state.steps;
        self.exp_avg = state.exp_avg;
        self.exp_avg_sq = state.exp_avg_sq;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_sgd_plain_step() {
        let p = Parameter::new("w", vec![1.0, -2.0]);
        let mut opt = Sgd::new(vec![ParamGroup::new(vec![p.clone()], 0.1)]);
        p.accumulate_grad(&[1.0, 1.0]);
        opt.step().unwrap();
        let data = p.data();
        assert!(approx(data[0], 0.9));
        assert!(approx(data[1], -2.1));
    }

    #[test]
    fn test_sgd_momentum_accumulates() {
        let p = Parameter::new("w", vec![0.0]);
        let group = ParamGroup::new(vec![p.clone()], 1.0).with_momentum(Momentum::Scalar(0.5));
        let mut opt = Sgd::new(vec![group]);
        p.accumulate_grad(&[1.0]);
        opt.step().unwrap(); // buf = 1
        opt.step().unwrap(); // buf = 0.5 * 1 + 1 = 1.5
        assert!(approx(p.data()[0], -2.5));
    }

    #[test]
    fn test_sgd_weight_decay_in_gradient() {
        let p = Parameter::new("w", vec![2.0]);
        let group = ParamGroup::new(vec![p.clone()], 0.1).with_weight_decay(0.5);
        let mut opt = Sgd::new(vec![group]);
        p.accumulate_grad(&[0.0]);
        opt.step().unwrap();
        assert!(approx(p.data()[0], 2.0 - 0.1 * 0.5 * 2.0));
    }

    #[test]
    fn test_sgd_skips_params_without_grad() {
        let p = Parameter::new("w", vec![3.0]);
        let mut opt = Sgd::new(vec![ParamGroup::new(vec![p.clone()], 0.1)]);
        opt.step().unwrap();
        assert_eq!(p.data(), vec![3.0]);
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() {
        let p = Parameter::new("w", vec![1.0]);
        let mut opt = Adam::new(vec![ParamGroup::new(vec![p.clone()], 0.01)]);
        p.accumulate_grad(&[0.3]);
        opt.step().unwrap();
        // With bias correction the first update is lr * sign(g).
        assert!((p.data()[0] - 0.99).abs() < 1e-5);
        assert!(matches!(opt.param_groups()[0].momentum, Momentum::Betas(..)));
    }

    #[test]
    fn test_state_dict_roundtrip_restores_hyperparams() {
        let p = Parameter::new("w", vec![1.0]);
        let mut opt = Adam::new(vec![ParamGroup::new(vec![p.clone()], 0.01)]);
        p.accumulate_grad(&[0.3]);
        opt.step().unwrap();
        let state = opt.state_dict().unwrap();

        let mut fresh = Adam::new(vec![ParamGroup::new(vec![p.clone()], 0.5)]);
        fresh.load_state_dict(&state).unwrap();
        assert_eq!(fresh.param_groups()[0].lr, 0.01);
        assert_eq!(fresh.steps.get("w"), Some(&1));
    }

    #[test]
    fn test_load_state_dict_group_mismatch() {
        let p = Parameter::new("w", vec![1.0]);
        let opt = Sgd::new(vec![ParamGroup::new(vec![p.clone()], 0.1)]);
        let state = opt.state_dict().unwrap();
        let mut two = Sgd::new(vec![
            ParamGroup::new(vec![p.clone()], 0.1),
            ParamGroup::new(vec![], 0.1),
        ]);
        let err = two.load_state_dict(&state).unwrap_err();
        assert!(err.to_string().contains("'sgd'"));
        assert!(two.load_state_dict(&serde_json::json!({"bogus": 1})).is_err());
    }

    #[test]
    fn test_clip_grad_norm_scales_down() {
        let a = Parameter::new("a", vec![0.0]);
        let b = Parameter::new("b", vec![0.0]);
        a.accumulate_grad(&[3.0]);
        b.accumulate_grad(&[4.0]);
        let norm = clip_grad_norm(&[a.clone(), b.clone()], 1.0);
        assert!((norm - 5.0).abs() < 1e-9);
        let clipped = (a.grad().unwrap()[0].powi(2) + b.grad().unwrap()[0].powi(2)).sqrt();
        assert!((clipped - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_clip_grad_norm_leaves_small_gradients() {
        let a = Parameter::new("a", vec![0.0]);
        a.accumulate_grad(&[0.5]);
        clip_grad_norm(&[a.clone()], 1.0);
        assert_eq!(a.grad(), Some(vec![0.5]));
    }

    #[test]
    fn test_zero_grad_via_trait() {
        let p = Parameter::new("w", vec![1.0]);
        let group = ParamGroup::new(vec![p.clone()], 0.1);
        let mut opt: Box<dyn Optimizer> = Box::new(Sgd::new(vec![group]));
        p.accumulate_grad(&[2.0]);
        opt.zero_grad();
        assert_eq!(p.grad(), Some(vec![0.0]));
        assert_eq!(opt.parameters().len(), 1);
    }

    #[test]
    fn test_set_lr_all_groups() {
        let mut opt = Sgd::new(vec![
            ParamGroup::new(vec![], 0.1),
            ParamGroup::new(vec![], 0.2),
        ]);
        set_lr(&mut opt, 0.05);
        assert!(opt.param_groups().iter().all(|g| g.lr == 0.05));
    }

    #[test]
    fn test_set_momentum_betas_keeps_beta2() {
        let group = ParamGroup::new(vec![], 0.1).with_momentum(Momentum::Betas(0.9, 0.99));
        let mut opt = Adam::new(vec![group]);
        set_momentum(&mut opt, 0.85);
        assert_eq!(opt.param_groups()[0].momentum, Momentum::Betas(0.85, 0.99));
    }

    #[test]
    fn test_set_momentum_scalar() {
        let mut opt = Sgd::new(vec![ParamGroup::new(vec![], 0.1)]);
        set_momentum(&mut opt, 0.95);
        assert_eq!(opt.param_groups()[0].momentum, Momentum::Scalar(0.95));
    }
}

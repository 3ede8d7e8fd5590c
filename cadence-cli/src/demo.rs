//! Synthetic multinomial logistic regression used by `cadence train` and
//! `cadence find-lr`.
//!
//! Labels come from a hidden linear scorer plus noise, so the problem is
//! learnable but not trivially separable.

use std::collections::BTreeMap;

use cadence_core::config::{OptimizerKind, RunConfig};
use cadence_core::error::RunError;
use cadence_core::optim::Momentum;
use cadence_core::{
    Adam, Batch, BatchProcessor, Collaborators, Criterion, LoaderSet, Loss, Model, Optimizer,
    ParamGroup, Parameter, Result, RunState, Sgd, Tensor, VecLoader,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const FEATURES: usize = 8;
pub const CLASSES: usize = 6;

pub const FEATURES_KEY: &str = "features";
pub const TARGETS_KEY: &str = "targets";
pub const LOGITS_KEY: &str = "logits";

/// Share of the samples held out for the `valid` loader.
const VALID_FRACTION: f64 = 0.2;

/// Build `train` and `valid` loaders of `samples` labelled points.
pub fn synthetic_loaders(samples: usize, batch_size: usize, seed: u64) -> LoaderSet {
    let mut rng = StdRng::seed_from_u64(seed);
    let hidden: Vec<f32> = (0..CLASSES * FEATURES)
        .map(|_| rng.gen_range(-1.0f32..1.0))
        .collect();

    let mut points = Vec::with_capacity(samples);
    for _ in 0..samples {
        let x: Vec<f32> = (0..FEATURES).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let label = (0..CLASSES)
            .map(|c| {
                let score: f32 = hidden[c * FEATURES..(c + 1) * FEATURES]
                    .iter()
                    .zip(&x)
                    .map(|(w, v)| w * v)
                    .sum();
                (c, score + rng.gen_range(-0.1f32..0.1))
            })
            .fold((0, f32::MIN), |best, (c, s)| if s > best.1 { (c, s) } else { best })
            .0;
        points.push((x, label));
    }

    let n_valid = ((samples as f64 * VALID_FRACTION) as usize).clamp(1, samples.max(1));
    let split = samples.saturating_sub(n_valid);
    LoaderSet::new()
        .with("train", VecLoader::new(batches(&points[..split], batch_size)))
        .with("valid", VecLoader::new(batches(&points[split..], batch_size)))
}

fn batches(points: &[(Vec<f32>, usize)], batch_size: usize) -> Vec<Batch> {
    points
        .chunks(batch_size.max(1))
        .map(|chunk| {
            let rows = chunk.len();
            let features = chunk.iter().flat_map(|(x, _)| x.iter().copied()).collect();
            let targets = chunk.iter().map(|(_, y)| *y as f32).collect();
            Batch::from([
                (FEATURES_KEY.to_string(), Tensor::new(vec![rows, FEATURES], features)),
                (TARGETS_KEY.to_string(), Tensor::vector(targets)),
            ])
        })
        .collect()
}

/// `logits = x W^T + b` with `W: [CLASSES, FEATURES]`.
pub struct SoftmaxRegression {
    weight: Parameter,
    bias: Parameter,
}

impl SoftmaxRegression {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));
        let weight = (0..CLASSES * FEATURES)
            .map(|_| rng.gen_range(-0.05f32..0.05))
            .collect();
        Self {
            weight: Parameter::new("linear.weight", weight),
            bias: Parameter::new("linear.bias", vec![0.0; CLASSES]),
        }
    }
}

impl Model for SoftmaxRegression {
    fn parameters(&self) -> Vec<Parameter> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn network_mut(&mut self) -> &mut dyn Model {
        self
    }
}

fn batch_error(message: impl Into<String>) -> cadence_core::CadenceError {
    RunError::Batch {
        message: message.into(),
    }
    .into()
}

fn tensor<'a>(map: &'a BTreeMap<String, Tensor>, key: &str) -> Result<&'a Tensor> {
    map.get(key)
        .ok_or_else(|| batch_error(format!("batch has no '{key}' tensor")))
}

/// Split `[weight, bias]` out of a model's parameter list.
fn linear_params(model: &dyn Model) -> Result<(Parameter, Parameter)> {
    match model.parameters().as_slice() {
        [weight, bias] => Ok((weight.clone(), bias.clone())),
        other => Err(batch_error(format!(
            "expected weight and bias parameters, found {}",
            other.len()
        ))),
    }
}

/// Forward pass: fills `output["logits"]`, `batch_size` and, when a
/// criterion is registered, the batch loss.
pub struct Forward;

impl BatchProcessor for Forward {
    fn process(
        &mut self,
        batch: Batch,
        state: &mut RunState,
        ctx: &mut Collaborators<'_>,
    ) -> Result<()> {
        let features = tensor(&batch, FEATURES_KEY)?;
        let rows = features.rows();
        let (weight, bias) = linear_params(&*ctx.model)?;
        let (w, b) = (weight.data(), bias.data());

        let mut logits = Vec::with_capacity(rows * CLASSES);
        for i in 0..rows {
            let x = features.row(i);
            for c in 0..CLASSES {
                let dot: f32 = w[c * FEATURES..(c + 1) * FEATURES]
                    .iter()
                    .zip(x)
                    .map(|(w, v)| w * v)
                    .sum();
                logits.push(dot + b[c]);
            }
        }

        state.batch_size = Some(rows);
        state.input = batch;
        state
            .output
            .insert(LOGITS_KEY.to_string(), Tensor::new(vec![rows, CLASSES], logits));
        if let Some(criterion) = ctx.criterion {
            state.loss = Some(criterion.compute(state, &*ctx.model)?);
        }
        Ok(())
    }
}

/// Mean softmax cross-entropy over the batch.
pub struct SoftmaxCrossEntropy;

impl Criterion for SoftmaxCrossEntropy {
    fn name(&self) -> &str {
        "softmax_cross_entropy"
    }

    fn compute(&self, state: &RunState, model: &dyn Model) -> Result<Box<dyn Loss>> {
        let logits = tensor(&state.output, LOGITS_KEY)?;
        let targets = tensor(&state.input, TARGETS_KEY)?;
        let features = tensor(&state.input, FEATURES_KEY)?;
        let rows = logits.rows();
        if targets.data.len() != rows {
            return Err(batch_error(format!(
                "{rows} logit rows but {} targets",
                targets.data.len()
            )));
        }
        let (weight, bias) = linear_params(model)?;

        let mut total = 0.0f64;
        let mut dlogits = Vec::with_capacity(rows * CLASSES);
        for i in 0..rows {
            let row = logits.row(i);
            let target = targets.data[i] as usize;
            let max = row.iter().copied().fold(f32::MIN, f32::max);
            let exps: Vec<f64> = row.iter().map(|&z| f64::from(z - max).exp()).collect();
            let sum: f64 = exps.iter().sum();
            for (c, e) in exps.iter().enumerate() {
                let p = e / sum;
                let onehot = if c == target { 1.0 } else { 0.0 };
                dlogits.push(((p - onehot) / rows as f64) as f32);
            }
            let p_target = exps.get(target).copied().unwrap_or(0.0) / sum;
            total -= p_target.max(f64::MIN_POSITIVE).ln();
        }

        Ok(Box::new(CrossEntropyLoss {
            value: total / rows.max(1) as f64,
            dlogits,
            features: features.clone(),
            weight,
            bias,
        }))
    }
}

struct CrossEntropyLoss {
    value: f64,
    /// `dLoss/dlogits`, row-major `[rows, CLASSES]`.
    dlogits: Vec<f32>,
    features: Tensor,
    weight: Parameter,
    bias: Parameter,
}

impl Loss for CrossEntropyLoss {
    fn value(&self) -> f64 {
        self.value
    }

    fn backward(&self, scale: f32) -> Result<()> {
        let rows = self.features.rows();
        let mut grad_w = vec![0.0f32; CLASSES * FEATURES];
        let mut grad_b = vec![0.0f32; CLASSES];
        for i in 0..rows {
            let x = self.features.row(i);
            for c in 0..CLASSES {
                let d = self.dlogits[i * CLASSES + c] * scale;
                grad_b[c] += d;
                for (g, v) in grad_w[c * FEATURES..(c + 1) * FEATURES].iter_mut().zip(x) {
                    *g += d * v;
                }
            }
        }
        self.weight.accumulate_grad(&grad_w);
        self.bias.accumulate_grad(&grad_b);
        Ok(())
    }
}

/// The configured reference optimizer over `params`.
pub fn build_optimizer(config: &RunConfig, params: Vec<Parameter>) -> Box<dyn Optimizer> {
    let group = ParamGroup::new(params, config.lr).with_weight_decay(config.weight_decay);
    match config.optimizer {
        OptimizerKind::Sgd => Box::new(Sgd::new(vec![
            group.with_momentum(Momentum::Scalar(config.momentum)),
        ])),
        OptimizerKind::Adam => Box::new(Adam::new(vec![
            group.with_momentum(Momentum::Betas(config.momentum, 0.999)),
        ])),
    }
}

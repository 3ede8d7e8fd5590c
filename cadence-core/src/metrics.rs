//! Top-k precision and the observer that reports it.

use std::collections::BTreeMap;

use crate::callback::{Callback, CallbackAction, Collaborators};
use crate::error::{Result, RunError};
use crate::logger::{AverageMeter, ScalarSink};
use crate::state::{MetricValue, RunState};
use crate::tensor::Tensor;

/// Fraction of rows whose target class is among the `k` highest scores,
/// one value per entry of `ks`.
///
/// `output` is `[batch, classes]`; `target` holds one class index per row.
pub fn precision_at_k(output: &Tensor, target: &Tensor, ks: &[usize]) -> Result<Vec<f64>> {
    let rows = output.rows();
    if target.data.len() != rows {
        return Err(RunError::Batch {
            message: format!(
                "precision needs one target per row: {} rows, {} targets",
                rows,
                target.data.len()
            ),
        }
        .into());
    }
    let width = output.shape.get(1).copied().unwrap_or(1);
    if output.data.len() < rows * width {
        return Err(RunError::Batch {
            message: format!(
                "precision output of shape {:?} holds only {} values",
                output.shape,
                output.data.len()
            ),
        }
        .into());
    }
    if rows == 0 {
        return Ok(vec![0.0; ks.len()]);
    }

    // Rank of the target score within its row: how many classes beat it.
    let ranks: Vec<usize> = (0..rows)
        .map(|i| {
            let scores = output.row(i);
            let class = target.data[i] as usize;
            let target_score = scores.get(class).copied().unwrap_or(f32::NEG_INFINITY);
            scores
                .iter()
                .enumerate()
                .filter(|&(j, &s)| s > target_score || (s == target_score && j < class))
                .count()
        })
        .collect();

    Ok(ks
        .iter()
        .map(|&k| ranks.iter().filter(|&&r| r < k).count() as f64 / rows as f64)
        .collect())
}

/// Metric key for precision at `k`: `precision01`, `precision03`, ...
pub fn precision_key(k: usize) -> String {
    format!("precision{k:02}")
}

/// Averages [`precision_at_k`] over each loader and merges the means into
/// `state.epoch_metrics` at loader end.
pub struct PrecisionCallback {
    input_key: String,
    output_key: String,
    ks: Vec<usize>,
    meters: BTreeMap<String, BTreeMap<String, AverageMeter>>,
    sink: Option<Box<dyn ScalarSink>>,
}

impl PrecisionCallback {
    /// `input_key` names the target tensor in `state.input`, `output_key`
    /// the scores in `state.output`. An empty `ks` means `[1, 3, 5]`.
    pub fn new(input_key: &str, output_key: &str, ks: &[usize]) -> Self {
        let ks = if ks.is_empty() { vec![1, 3, 5] } else { ks.to_vec() };
        Self {
            input_key: input_key.to_string(),
            output_key: output_key.to_string(),
            ks,
            meters: BTreeMap::new(),
            sink: None,
        }
    }

    /// Also write every batch value to `sink`.
    pub fn with_sink(mut self, sink: Box<dyn ScalarSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl Callback for PrecisionCallback {
    fn name(&self) -> &str {
        "precision"
    }

    fn on_epoch_start(
        &mut self,
        _state: &mut RunState,
        _ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        self.meters.clear();
        Ok(CallbackAction::Continue)
    }

    fn on_loader_start(
        &mut self,
        state: &mut RunState,
        _ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        let meters = self.meters.entry(state.loader_mode.clone()).or_default();
        meters.clear();
        for &k in &self.ks {
            meters.insert(precision_key(k), AverageMeter::new());
        }
        Ok(CallbackAction::Continue)
    }

    fn on_batch_end(
        &mut self,
        state: &mut RunState,
        _ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        let (Some(output), Some(target)) = (
            state.output.get(&self.output_key),
            state.input.get(&self.input_key),
        ) else {
            return Err(RunError::Batch {
                message: format!(
                    "precision needs output '{}' and input '{}'",
                    self.output_key, self.input_key
                ),
            }
            .into());
        };
        let values = precision_at_k(output, target, &self.ks)?;
        let meters = self.meters.entry(state.loader_mode.clone()).or_default();
        for (&k, value) in self.ks.iter().zip(values) {
            let key = precision_key(k);
            meters.entry(key.clone()).or_default().add(value);
            if let Some(sink) = self.sink.as_mut() {
                sink.add_scalar(&state.loader_mode, &key, value, state.step)?;
            }
        }
        Ok(CallbackAction::Continue)
    }

    fn on_loader_end(
        &mut self,
        state: &mut RunState,
        _ctx: &mut Collaborators<'_>,
    ) -> Result<CallbackAction> {
        let Some(meters) = self.meters.get(&state.loader_mode) else {
            return Ok(CallbackAction::Continue);
        };
        let means: Vec<(String, f64)> = meters
            .iter()
            .filter_map(|(key, meter)| meter.mean().map(|m| (key.clone(), m)))
            .collect();
        let metrics = state.loader_metrics();
        for (key, mean) in means {
            metrics.insert(key, MetricValue::Float(mean));
        }
        Ok(CallbackAction::Continue)
    }
}

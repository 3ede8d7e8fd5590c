//! Model, loss and criterion contracts.
//!
//! The concrete network and its autograd live outside this crate; the
//! training loop only relies on what is declared here.

use std::collections::BTreeMap;

use crate::error::{ConfigError, Result};
use crate::state::RunState;
use crate::tensor::{DType, Parameter};

/// Named parameter values, as stored in a checkpoint.
pub type ModelState = BTreeMap<String, Vec<f32>>;

/// Numeric precision the model runs its forward/backward pass in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Full,
    Half,
}

/// A trainable network.
pub trait Model {
    /// Every parameter, in a stable order.
    fn parameters(&self) -> Vec<Parameter>;

    fn precision(&self) -> Precision {
        Precision::Full
    }

    /// The innermost network, with precision/parallelism wrappers removed.
    fn network_mut(&mut self) -> &mut dyn Model;

    fn zero_grad(&mut self) {
        for p in self.parameters() {
            p.zero_grad();
        }
    }

    fn state_dict(&self) -> ModelState {
        self.parameters()
            .into_iter()
            .map(|p| (p.name(), p.data()))
            .collect()
    }

    /// Load values by parameter name. Every parameter must be present.
    fn load_state_dict(&mut self, state: &ModelState) -> Result<()> {
        for p in self.parameters() {
            let name = p.name();
            let values = state.get(&name).ok_or_else(|| ConfigError::ParameterMismatch {
                message: format!("state has no entry for parameter '{name}'"),
            })?;
            if values.len() != p.len() {
                return Err(ConfigError::ParameterMismatch {
                    message: format!(
                        "parameter '{name}' expects {} values, state has {}",
                        p.len(),
                        values.len()
                    ),
                }
                .into());
            }
            p.set_data(values);
        }
        Ok(())
    }

    /// Device barrier: returns once every pending parameter write is visible
    /// to the next forward pass. Host-memory models have nothing to wait for.
    fn synchronize(&self) {}
}

/// Reduced-precision wrapper: stores the network's parameters as binary16.
pub struct HalfPrecision<M> {
    network: M,
}

impl<M: Model> HalfPrecision<M> {
    pub fn new(network: M) -> Self {
        for p in network.parameters() {
            p.cast(DType::F16);
        }
        Self { network }
    }

    pub fn network(&self) -> &M {
        &self.network
    }

    pub fn into_inner(self) -> M {
        self.network
    }
}

impl<M: Model> Model for HalfPrecision<M> {
    fn parameters(&self) -> Vec<Parameter> {
        self.network.parameters()
    }

    fn precision(&self) -> Precision {
        Precision::Half
    }

    fn network_mut(&mut self) -> &mut dyn Model {
        self.network.network_mut()
    }

    fn synchronize(&self) {
        self.network.synchronize();
    }
}

/// The loss produced for one batch.
pub trait Loss {
    /// Scalar value of the loss.
    fn value(&self) -> f64;

    /// Accumulate `scale * dLoss/dp` into the gradient of every parameter the
    /// loss depends on, in that parameter's own dtype.
    fn backward(&self, scale: f32) -> Result<()>;
}

/// Turns a batch's outputs and targets into a [`Loss`].
pub trait Criterion {
    fn name(&self) -> &str;

    fn compute(&self, state: &RunState, model: &dyn Model) -> Result<Box<dyn Loss>>;
}


#[cfg(test)]
mod tests {
    use super::testing::ToyModel;
    use super::*;
    use crate::tensor::round_to_half;

    #[test]
    fn test_state_dict_roundtrip() {
        let mut model = ToyModel::new(vec![
            Parameter::new("w", vec![1.0, 2.0]),
            Parameter::new("b", vec![0.5]),
        ]);
        let state = model.state_dict();
        assert_eq!(state["w"], vec![1.0, 2.0]);

        model.params[0].set_data(&[0.0, 0.0]);
        model.load_state_dict(&state).unwrap();
        assert_eq!(model.params[0].data(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_load_state_dict_missing_entry() {
        let mut model = ToyModel::new(vec![Parameter::new("w", vec![1.0])]);
        let err = model.load_state_dict(&ModelState::new()).unwrap_err();
        assert!(err.to_string().contains("'w'"));
    }

    #[test]
    fn test_load_state_dict_wrong_length() {
        let mut model = ToyModel::new(vec![Parameter::new("w", vec![1.0])]);
        let state = ModelState::from([("w".to_string(), vec![1.0, 2.0])]);
        assert!(model.load_state_dict(&state).is_err());
    }

    #[test]
    fn test_half_precision_wrapper_casts_and_unwraps() {
        let inner = ToyModel::new(vec![Parameter::new("w", vec![0.1])]);
        let mut model = HalfPrecision::new(inner);
        assert_eq!(model.precision(), Precision::Half);
        assert_eq!(model.parameters()[0].dtype(), DType::F16);
        assert_eq!(model.parameters()[0].data(), vec![round_to_half(0.1)]);

        let network = model.network_mut();
        assert_eq!(network.precision(), Precision::Full);
        let state = ModelState::from([("w".to_string(), vec![0.3])]);
        network.load_state_dict(&state).unwrap();
        // Values loaded through the unwrapped network still land in binary16.
        assert_eq!(model.parameters()[0].data(), vec![round_to_half(0.3)]);
    }
}

//! Parameters, batch tensors and reduced-precision rounding.
//!
//! A [`Parameter`] is a shared handle: a model and the optimizers built over
//! it hold clones of the same handle, so an in-place update made through one
//! is visible through the other. Values stored in an [`DType::F16`] parameter
//! are always exactly representable in IEEE-754 binary16.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{ConfigError, Result};

/// Largest finite binary16 value.
pub const F16_MAX: f32 = 65504.0;

/// Smallest positive normal binary16 value (2^-14).
const F16_MIN_NORMAL: f32 = 1.0 / 16_384.0;

/// Spacing of binary16 subnormals (2^-24).
const F16_SUBNORMAL_STEP: f32 = 1.0 / 16_777_216.0;

/// Storage precision of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    F32,
    F16,
}

impl DType {
    /// Round a value to this storage precision.
    pub fn round(self, value: f32) -> f32 {
        match self {
            DType::F32 => value,
            DType::F16 => round_to_half(value),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
        }
    }
}

/// Round an `f32` to the nearest binary16 value, ties to even.
///
/// Magnitudes that round past [`F16_MAX`] become infinite; magnitudes below
/// the smallest normal land on the subnormal grid, and anything under half a
/// subnormal step flushes to a signed zero.
pub fn round_to_half(value: f32) -> f32 {
    if !value.is_finite() {
        return value;
    }
    let magnitude = value.abs();
    if magnitude >= 65520.0 {
        return f32::INFINITY.copysign(value);
    }
    if magnitude < F16_MIN_NORMAL {
        let steps = (value / F16_SUBNORMAL_STEP).round_ties_even();
        return (steps * F16_SUBNORMAL_STEP).copysign(value);
    }
    // Drop the 13 low mantissa bits binary16 does not have.
    let bits = value.to_bits();
    let lsb = (bits >> 13) & 1;
    let rounded = bits.wrapping_add(0x0FFF + lsb) & !0x1FFF;
    f32::from_bits(rounded)
}

/// Dense batch data (inputs, targets, outputs) in row-major order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }

    /// A one-dimensional tensor.
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Size of the leading dimension (the batch dimension).
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Borrow row `i` of a two-dimensional tensor.
    pub fn row(&self, i: usize) -> &[f32] {
        let width = self.shape.get(1).copied().unwrap_or(1);
        &self.data[i * width..(i + 1) * width]
    }
}

#[derive(Debug)]
struct ParamData {
    name: String,
    dtype: DType,
    data: Vec<f32>,
    grad: Option<Vec<f32>>,
    requires_grad: bool,
}

/// A trainable parameter shared between a model and its optimizers.
#[derive(Clone)]
pub struct Parameter(Rc<RefCell<ParamData>>);

impl Parameter {
    /// Create a full-precision parameter.
    pub fn new(name: impl Into<String>, data: Vec<f32>) -> Self {
        Self::with_dtype(name, data, DType::F32)
    }

    /// Create a parameter stored at `dtype`; values are rounded on entry.
    pub fn with_dtype(name: impl Into<String>, data: Vec<f32>, dtype: DType) -> Self {
        let data = data.into_iter().map(|v| dtype.round(v)).collect();
        Self(Rc::new(RefCell::new(ParamData {
            name: name.into(),
            dtype,
            data,
            grad: None,
            requires_grad: true,
        })))
    }

    /// Mark the parameter frozen (excluded from gradient flow).
    pub fn frozen(self) -> Self {
        self.0.borrow_mut().requires_grad = false;
        self
    }

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    pub fn dtype(&self) -> DType {
        self.0.borrow().dtype
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    pub fn len(&self) -> usize {
        self.0.borrow().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current values.
    pub fn data(&self) -> Vec<f32> {
        self.0.borrow().data.clone()
    }

    /// Snapshot of the accumulated gradient, if any.
    pub fn grad(&self) -> Option<Vec<f32>> {
        self.0.borrow().grad.clone()
    }

    /// Convert the stored values (and any gradient) to `dtype`.
    pub fn cast(&self, dtype: DType) {
        let mut inner = self.0.borrow_mut();
        inner.dtype = dtype;
        for v in inner.data.iter_mut() {
            *v = dtype.round(*v);
        }
        if let Some(grad) = inner.grad.as_mut() {
            for g in grad.iter_mut() {
                *g = dtype.round(*g);
            }
        }
    }

    /// Replace the values, rounding to the parameter's dtype.
    pub fn set_data(&self, values: &[f32]) {
        let mut inner = self.0.borrow_mut();
        let dtype = inner.dtype;
        inner.data = values.iter().map(|&v| dtype.round(v)).collect();
    }

    /// Apply `f` to the values in place, then re-round to the dtype.
    pub fn update_data(&self, f: impl FnOnce(&mut [f32])) {
        let mut inner = self.0.borrow_mut();
        let dtype = inner.dtype;
        f(&mut inner.data);
        if dtype != DType::F32 {
            for v in inner.data.iter_mut() {
                *v = dtype.round(*v);
            }
        }
    }

    /// Add `delta` into the gradient buffer, rounding to the dtype.
    pub fn accumulate_grad(&self, delta: &[f32]) {
        let mut inner = self.0.borrow_mut();
        let dtype = inner.dtype;
        let len = inner.data.len();
        let grad = inner.grad.get_or_insert_with(|| vec![0.0; len]);
        for (g, d) in grad.iter_mut().zip(delta) {
            *g = dtype.round(*g + d);
        }
    }

    /// Overwrite the gradient buffer.
    pub fn set_grad(&self, values: Option<Vec<f32>>) {
        self.0.borrow_mut().grad = values;
    }

    /// Multiply the gradient by `factor` in place.
    pub fn scale_grad(&self, factor: f32) {
        let mut inner = self.0.borrow_mut();
        let dtype = inner.dtype;
        if let Some(grad) = inner.grad.as_mut() {
            for g in grad.iter_mut() {
                *g = dtype.round(*g * factor);
            }
        }
    }

    /// Reset the gradient to zeros, keeping the buffer.
    pub fn zero_grad(&self) {
        if let Some(grad) = self.0.borrow_mut().grad.as_mut() {
            grad.fill(0.0);
        }
    }

    /// A detached full-precision copy used as an optimizer master weight.
    pub fn master_copy(&self) -> Self {
        let inner = self.0.borrow();
        Self(Rc::new(RefCell::new(ParamData {
            name: inner.name.clone(),
            dtype: DType::F32,
            data: inner.data.clone(),
            grad: None,
            requires_grad: true,
        })))
    }

    /// Whether two handles refer to the same storage.
    pub fn same_storage(&self, other: &Parameter) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Parameter")
            .field("name", &inner.name)
            .field("dtype", &inner.dtype)
            .field("len", &inner.data.len())
            .field("has_grad", &inner.grad.is_some())
            .finish()
    }
}

fn check_pairing(source: &[Parameter], target: &[Parameter]) -> Result<()> {
    if source.len() != target.len() {
        return Err(ConfigError::ParameterMismatch {
            message: format!(
                "{} source parameters vs {} target parameters",
                source.len(),
                target.len()
            ),
        }
        .into());
    }
    for (s, t) in source.iter().zip(target) {
        if s.len() != t.len() {
            return Err(ConfigError::ParameterMismatch {
                message: format!(
                    "'{}' has {} elements but '{}' has {}",
                    s.name(),
                    s.len(),
                    t.name(),
                    t.len()
                ),
            }
            .into());
        }
    }
    Ok(())
}

/// Copy gradients pairwise from `source` into `target`, widening to the
/// target's dtype. Parameters without a gradient leave the target's cleared.
pub fn copy_grads(source: &[Parameter], target: &[Parameter]) -> Result<()> {
    check_pairing(source, target)?;
    for (s, t) in source.iter().zip(target) {
        match s.grad() {
            Some(grad) => {
                let dtype = t.dtype();
                t.set_grad(Some(grad.iter().map(|&g| dtype.round(g)).collect()));
            }
            None => t.set_grad(None),
        }
    }
    Ok(())
}

/// Copy values pairwise from `source` into `target`, rounding to the
/// target's dtype.
pub fn copy_params(source: &[Parameter], target: &[Parameter]) -> Result<()> {
    check_pairing(source, target)?;
    for (s, t) in source.iter().zip(target) {
        t.set_data(&s.data());
    }
    Ok(())
}

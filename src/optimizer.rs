use crate::model::{Gradients, Parameters};
use crate::tensor::{Tensor, TensorError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Represents the persistent state of an optimizer across training steps.
///
/// Includes the current step count and any optimizer-specific tensors
/// (like momentum and variance for Adam).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OptimizerState {
    /// The number of optimization steps taken so far.
    pub step: usize,
    /// Optimizer-specific state tensors, keyed by a unique name derived from parameter names.
    pub state: HashMap<String, Tensor>,
}

/// Trait for optimization algorithms used to update model parameters.
///
/// Optimizers are stateless values; their per-parameter state is kept in an
/// [`OptimizerState`] owned by the caller so it can be checkpointed.
pub trait Optimizer: Clone + Serialize + serde::de::DeserializeOwned + Send + Sync + fmt::Debug {
    /// Performs a single optimization step.
    ///
    /// Only parameters with an entry in `grads` are updated; the caller leaves
    /// frozen parameters out.
    ///
    /// # Errors
    ///
    /// `TensorError::ShapeMismatch` if a gradient does not match its parameter.
    fn step(
        &self,
        params: &mut Parameters,
        grads: &Gradients,
        optimizer_state: &mut OptimizerState,
        learning_rate: f32,
    ) -> Result<(), TensorError>;
}

// Default epsilon value for numerical stability.
const DEFAULT_EPSILON: f32 = 1e-8;

/// AdamW Optimizer Implementation.
///
/// Implements the AdamW algorithm (Adam with decoupled weight decay).
/// Reference: "Decoupled Weight Decay Regularization" (https://arxiv.org/abs/1711.05101)
/// With `weight_decay = 0` this is plain Adam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamW {
    /// Decay rate of the first moment.
    pub beta1: f32,
    /// Decay rate of the second moment.
    pub beta2: f32,
    /// Decoupled weight decay coefficient.
    pub weight_decay: f32,
    /// Denominator stabilizer.
    pub epsilon: f32,
}

impl AdamW {
    /// Creates an optimizer with explicit hyperparameters.
    #[must_use]
    pub const fn new(beta1: f32, beta2: f32, weight_decay: f32, epsilon: f32) -> Self {
        Self { beta1, beta2, weight_decay, epsilon }
    }

    /// Plain Adam with the usual betas.
    #[must_use]
    pub const fn adam() -> Self {
        Self::new(0.9, 0.999, 0.0, DEFAULT_EPSILON)
    }
}

impl Default for AdamW {
    /// Default values: beta1 0.9, beta2 0.999, no weight decay, epsilon 1e-8.
    fn default() -> Self {
        Self::adam()
    }
}

impl Optimizer for AdamW {
    fn step(
        &self,
        params: &mut Parameters,
        grads: &Gradients,
        optimizer_state: &mut OptimizerState,
        learning_rate: f32,
    ) -> Result<(), TensorError> {
        let current_step = optimizer_state.step + 1; // Use 1-based step for bias correction

        // Bias correction factors
        let bias_correction1 = 1.0 - self.beta1.powi(current_step as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(current_step as i32);

        // Moments are taken out of the state map so each parameter can be
        // updated in parallel, then put back afterwards.
        let mut work = Vec::with_capacity(grads.len());
        for (name, param) in params.iter_mut() {
            let Some(grad) = grads.get(name) else { continue };
            if grad.shape() != param.shape() {
                return Err(TensorError::ShapeMismatch(
                    param.shape().to_vec(),
                    grad.shape().to_vec(),
                ));
            }
            let m = take_moment(optimizer_state, &format!("{name}_m"), param.shape());
            let v = take_moment(optimizer_state, &format!("{name}_v"), param.shape());
            work.push((name.clone(), param, grad, m, v));
        }

        work.par_iter_mut().for_each(|(_, param, grad, m, v)| {
            let moments = m.blob_mut().iter_mut().zip(v.blob_mut().iter_mut());
            for ((p, g), (m, v)) in param.blob_mut().iter_mut().zip(grad.blob()).zip(moments) {
                // Decoupled weight decay
                *p -= *p * learning_rate * self.weight_decay;

                *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;

                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;
                *p -= learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        });

        for (name, _, _, m, v) in work {
            optimizer_state.state.insert(format!("{name}_m"), m);
            optimizer_state.state.insert(format!("{name}_v"), v);
        }

        optimizer_state.step = current_step;
        Ok(())
    }
}

fn take_moment(optimizer_state: &mut OptimizerState, key: &str, shape: &[usize]) -> Tensor {
    match optimizer_state.state.remove(key) {
        Some(t) if t.shape() == shape => t,
        _ => Tensor::zeros(shape),
    }
}

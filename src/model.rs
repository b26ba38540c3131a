//! Capability traits the loops are written against, and the state they persist.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::corpus::Batch;
use crate::error::{MolgenError, Result};
use crate::optimizer::OptimizerState;
use crate::tensor::Tensor;

/// Named trainable tensors.
pub type Parameters = BTreeMap<String, Tensor>;

/// Gradients keyed by the name of the parameter they belong to.
pub type Gradients = BTreeMap<String, Tensor>;

/// Architecture-defining hyperparameters, stored next to every checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Width of the output projection; equals the vocabulary size.
    pub vocab_size: usize,
    /// Rows of the input embedding table. Equal to `vocab_size` unless the
    /// output projection was rebuilt for a smaller transfer vocabulary.
    pub input_vocab_size: usize,
    /// Token each embedding row stands for, in row order. Empty until a model
    /// binds it to a vocabulary.
    #[serde(default)]
    pub input_tokens: Vec<String>,
    /// Embedding dimension.
    pub embedding_size: usize,
    /// Recurrent state dimension.
    pub hidden_size: usize,
    /// Sampling length ceiling, in tokens, `EOS` included.
    pub max_length: usize,
}

impl ModelConfig {
    /// Default sizes for a vocabulary of `vocab_size` tokens.
    #[must_use]
    pub const fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            input_vocab_size: vocab_size,
            input_tokens: Vec::new(),
            embedding_size: 128,
            hidden_size: 256,
            max_length: 140,
        }
    }

    /// Rejects zero-sized dimensions and an embedding table too small for the output.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.embedding_size == 0 || self.hidden_size == 0 {
            return Err(MolgenError::Config(format!(
                "model dimensions must be non-zero: {self:?}"
            )));
        }
        if self.max_length == 0 {
            return Err(MolgenError::Config("max_length must be at least 1".into()));
        }
        if self.input_vocab_size < self.vocab_size {
            return Err(MolgenError::Config(format!(
                "embedding table has {} rows but the output projection emits {} tokens",
                self.input_vocab_size, self.vocab_size
            )));
        }
        if !self.input_tokens.is_empty() && self.input_tokens.len() != self.input_vocab_size {
            return Err(MolgenError::Config(format!(
                "{} embedding rows but {} row tokens",
                self.input_vocab_size,
                self.input_tokens.len()
            )));
        }
        Ok(())
    }
}

/// Everything written to a checkpoint blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    /// Model parameters.
    pub parameters: Parameters,
    /// Optimizer moments and step count.
    pub optimizer: OptimizerState,
}

/// Output of [`GenerativeModel::sample`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sampled {
    /// Generated index sequences, each ending in `EOS` unless truncated at the
    /// length ceiling.
    pub sequences: Vec<Vec<usize>>,
    /// Log-probability of each sequence under the model's own sampling distribution.
    pub log_probs: Vec<f32>,
}

/// The two operations the training and sampling loops need from a model.
pub trait GenerativeModel {
    /// Next-token log-probability of every row of `batch`, scored over
    /// each row's true length only.
    fn likelihood(&self, batch: &Batch) -> Result<Vec<f32>>;

    /// Generates `n` sequences autoregressively.
    fn sample<R: Rng>(&self, rng: &mut R, n: usize) -> Result<Sampled>;
}

/// A [`GenerativeModel`] whose parameters can be optimized.
pub trait Trainable: GenerativeModel {
    /// Row log-probabilities plus the gradient of their negative mean.
    fn likelihood_and_gradients(&self, batch: &Batch) -> Result<(Vec<f32>, Gradients)>;

    /// Current parameters.
    fn parameters(&self) -> &Parameters;

    /// Mutable parameters, for the optimizer.
    fn parameters_mut(&mut self) -> &mut Parameters;

    /// Hyperparameters recorded alongside checkpoints.
    fn config(&self) -> ModelConfig;

    /// Frozen parameters never receive optimizer updates.
    fn is_frozen(&self, _name: &str) -> bool {
        false
    }
}

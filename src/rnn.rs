use crate::checkpoint;
use crate::corpus::Batch;
use crate::error::{MolgenError, Result};
use crate::model::{GenerativeModel, Gradients, ModelConfig, Parameters, Sampled, Trainable};
use crate::optimizer::OptimizerState;
use crate::tensor::{softmax_in_place, Tensor};
use crate::vocabulary::Vocabulary;

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

// --- Parameter Names ---
/// Input embedding table, `[input_vocab_size, embedding_size]`.
pub const EMBEDDING: &str = "embedding";
/// Embedding-to-state weights, `[embedding_size, hidden_size]`.
pub const INPUT_WEIGHTS: &str = "recurrent_input_weights";
/// State-to-state weights, `[hidden_size, hidden_size]`.
pub const HIDDEN_WEIGHTS: &str = "recurrent_hidden_weights";
/// Recurrent bias, `[hidden_size]`.
pub const RECURRENT_BIAS: &str = "recurrent_bias";
/// Output projection weights, `[hidden_size, vocab_size]`.
pub const OUTPUT_WEIGHTS: &str = "output_projection_weights";
/// Output projection bias, `[vocab_size]`.
pub const OUTPUT_BIAS: &str = "output_projection_bias";

/// The parameters rebuilt and left trainable in freeze mode.
pub const OUTPUT_PROJECTION: [&str; 2] = [OUTPUT_WEIGHTS, OUTPUT_BIAS];

// --- Helper Functions ---

/// Expected shape of every named parameter for `config`.
fn parameter_shapes(config: &ModelConfig) -> [(&'static str, Vec<usize>); 6] {
    let (e, h) = (config.embedding_size, config.hidden_size);
    [
        (EMBEDDING, vec![config.input_vocab_size, e]),
        (INPUT_WEIGHTS, vec![e, h]),
        (HIDDEN_WEIGHTS, vec![h, h]),
        (RECURRENT_BIAS, vec![h]),
        (OUTPUT_WEIGHTS, vec![h, config.vocab_size]),
        (OUTPUT_BIAS, vec![config.vocab_size]),
    ]
}

fn is_bias(name: &str) -> bool {
    name == RECURRENT_BIAS || name == OUTPUT_BIAS
}

/// Selects the next token from a probability distribution.
/// Applies temperature scaling and returns the token with its log-probability
/// under the distribution actually sampled from.
fn select_next_token<R: Rng>(
    rng: &mut R,
    probabilities: &[f32],
    temperature: f32,
) -> Result<(usize, f32)> {
    let scaled: Vec<f32> = if (temperature - 1.0).abs() < f32::EPSILON {
        probabilities.to_vec()
    } else {
        let mut logits: Vec<f32> = probabilities
            .iter()
            .map(|p| p.max(f32::MIN_POSITIVE).ln() / temperature)
            .collect();
        softmax_in_place(&mut logits);
        logits
    };

    let dist = WeightedIndex::new(&scaled).map_err(|e| {
        MolgenError::Sampling(format!("Failed to create sampling distribution: {e}"))
    })?;
    let token = dist.sample(rng);
    Ok((token, scaled[token].ln()))
}

/// Embedding row for every vocabulary index, looked up by token name.
fn bind_input_rows(input_tokens: &[String], vocabulary: &Vocabulary) -> Result<Vec<usize>> {
    let rows: HashMap<&str, usize> = input_tokens
        .iter()
        .enumerate()
        .map(|(row, token)| (token.as_str(), row))
        .collect();
    vocabulary
        .tokens()
        .iter()
        .map(|token| {
            rows.get(token.as_str()).copied().ok_or_else(|| {
                MolgenError::Config(format!("no embedding row for token `{token}`"))
            })
        })
        .collect()
}

/// Cached activations of one row under next-token supervision, needed by backpropagation.
struct RowTrace {
    log_prob: f32,
    /// Embedding row read at each step.
    rows: Vec<usize>,
    /// `hidden[t]` is the state before step `t`; `hidden[0]` is all zeros.
    hidden: Vec<Vec<f32>>,
    probabilities: Vec<Vec<f32>>,
}

// --- Recurrent Model ---

/// Elman recurrent generator over vocabulary indices.
///
/// Each step embeds the previous token (`GO` at the first step), updates the
/// state with `tanh`, and projects it onto the vocabulary.
///
/// Embedding rows are named by [`ModelConfig::input_tokens`], so a table
/// inherited from a prior with another vocabulary is read by token rather than
/// by index.
#[derive(Debug, Clone)]
pub struct Rnn {
    config: ModelConfig,
    input_rows: Vec<usize>,
    go: usize,
    eos: usize,
    temperature: f32,
    parameters: Parameters,
    frozen: BTreeSet<String>,
}

impl Rnn {
    /// Creates a randomly initialized model for `vocabulary`.
    ///
    /// Empty `input_tokens` are bound to the vocabulary itself; otherwise every
    /// vocabulary token must name one of the embedding rows.
    pub fn new<R: Rng>(rng: &mut R, mut config: ModelConfig, vocabulary: &Vocabulary) -> Result<Self> {
        config.validate()?;
        if config.vocab_size != vocabulary.len() {
            return Err(MolgenError::Config(format!(
                "model emits {} tokens but the vocabulary has {}",
                config.vocab_size,
                vocabulary.len()
            )));
        }
        if config.input_tokens.is_empty() {
            if config.input_vocab_size != vocabulary.len() {
                return Err(MolgenError::Config(format!(
                    "{} embedding rows without row tokens for a vocabulary of {}",
                    config.input_vocab_size,
                    vocabulary.len()
                )));
            }
            config.input_tokens = vocabulary.tokens().to_vec();
        }
        let input_rows = bind_input_rows(&config.input_tokens, vocabulary)?;

        let parameters = parameter_shapes(&config)
            .into_iter()
            .map(|(name, shape)| {
                let tensor = if is_bias(name) {
                    Tensor::zeros(&shape)
                } else {
                    Tensor::rand(&mut *rng, &shape)
                };
                (name.to_string(), tensor)
            })
            .collect();

        Ok(Self {
            config,
            input_rows,
            go: vocabulary.go(),
            eos: vocabulary.eos(),
            temperature: 1.0,
            parameters,
            frozen: BTreeSet::new(),
        })
    }

    /// Restores a model for `vocabulary` from a checkpoint trained on the same
    /// vocabulary.
    ///
    /// The embedding table may hold other tokens too when the checkpoint came
    /// out of a frozen transfer. Returns the stored optimizer state along with
    /// the model.
    pub fn from_checkpoint(path: &Path, vocabulary: &Vocabulary) -> Result<(Self, OptimizerState)> {
        let (state, meta) = checkpoint::load(path)?;
        if meta.tokens != vocabulary.tokens() {
            return Err(MolgenError::mismatch(
                path,
                format!(
                    "trained with a vocabulary of {} tokens ({}), current vocabulary has {} ({})",
                    meta.tokens.len(),
                    meta.tokens.join(" "),
                    vocabulary.len(),
                    vocabulary.tokens().join(" ")
                ),
            ));
        }
        // Parameters are overwritten right away; the seed only fills placeholders.
        let mut model = Self::new(&mut StdRng::seed_from_u64(0), meta.model, vocabulary)
            .map_err(|e| MolgenError::mismatch(path, e.to_string()))?;
        model.restore_parameters(state.parameters, path, &[])?;
        Ok((model, state.optimizer))
    }

    /// Sets the sampling temperature; 1.0 samples the model's own distribution.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Hyperparameters of this model.
    #[must_use]
    pub const fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    /// Returns the total number of trainable parameters in the model.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.parameters
            .iter()
            .filter(|(name, _)| !self.frozen.contains(*name))
            .map(|(_, t)| t.size())
            .sum()
    }

    /// Loads `loaded` into the model, checking names and shapes strictly.
    ///
    /// Names in `keep_current` are taken from the model as it is and ignored in
    /// `loaded`. Any missing, extra or misshapen tensor is a
    /// [`MolgenError::CheckpointMismatch`].
    pub fn restore_parameters(
        &mut self,
        mut loaded: Parameters,
        source: &Path,
        keep_current: &[&str],
    ) -> Result<()> {
        for name in keep_current {
            loaded.remove(*name);
        }
        for (name, shape) in parameter_shapes(&self.config) {
            if keep_current.contains(&name) {
                continue;
            }
            let tensor = loaded
                .remove(name)
                .ok_or_else(|| MolgenError::mismatch(source, format!("missing tensor `{name}`")))?;
            if tensor.shape() != shape.as_slice() {
                return Err(MolgenError::mismatch(
                    source,
                    format!(
                        "tensor `{name}` has shape {:?}, model expects {shape:?}",
                        tensor.shape()
                    ),
                ));
            }
            self.parameters.insert(name.to_string(), tensor);
        }
        if let Some(extra) = loaded.keys().next() {
            return Err(MolgenError::mismatch(
                source,
                format!("unexpected tensor `{extra}`"),
            ));
        }
        Ok(())
    }

    /// Freezes every parameter except the output projection.
    pub fn freeze_all_but_output(&mut self) {
        self.frozen = self
            .parameters
            .keys()
            .filter(|name| !OUTPUT_PROJECTION.contains(&name.as_str()))
            .cloned()
            .collect();
    }

    /// Embedding vector read when vocabulary index `index` is the input.
    #[must_use]
    pub fn embedding_of(&self, index: usize) -> Option<&[f32]> {
        let row = *self.input_rows.get(index)?;
        Some(self.param(EMBEDDING).row(row))
    }

    fn param(&self, name: &str) -> &Tensor {
        &self.parameters[name]
    }

    fn embedding_row(&self, input: usize) -> Result<usize> {
        self.input_rows.get(input).copied().ok_or_else(|| {
            MolgenError::Config(format!(
                "token index {input} outside a vocabulary of {}",
                self.input_rows.len()
            ))
        })
    }

    /// One recurrent step from embedding row `row`: returns the new state and
    /// the output distribution.
    fn step(&self, row: usize, previous: &[f32]) -> Result<(Vec<f32>, Vec<f32>)> {
        let mut state = self.param(RECURRENT_BIAS).blob().to_vec();
        self.param(INPUT_WEIGHTS)
            .vec_mul_into(self.param(EMBEDDING).row(row), &mut state)?;
        self.param(HIDDEN_WEIGHTS).vec_mul_into(previous, &mut state)?;
        for v in &mut state {
            *v = v.tanh();
        }

        let mut probabilities = self.param(OUTPUT_BIAS).blob().to_vec();
        self.param(OUTPUT_WEIGHTS)
            .vec_mul_into(&state, &mut probabilities)?;
        softmax_in_place(&mut probabilities);
        Ok((state, probabilities))
    }

    /// Next-token pass over one unpadded row.
    fn forward_row(&self, row: &[usize]) -> Result<RowTrace> {
        let mut trace = RowTrace {
            log_prob: 0.0,
            rows: Vec::with_capacity(row.len()),
            hidden: Vec::with_capacity(row.len() + 1),
            probabilities: Vec::with_capacity(row.len()),
        };
        trace.hidden.push(vec![0.0; self.config.hidden_size]);

        let mut input = self.go;
        for &target in row {
            if target >= self.config.vocab_size {
                return Err(MolgenError::Config(format!(
                    "target index {target} outside an output projection of width {}",
                    self.config.vocab_size
                )));
            }
            let embedded = self.embedding_row(input)?;
            let (state, probabilities) =
                self.step(embedded, &trace.hidden[trace.hidden.len() - 1])?;
            trace.log_prob += probabilities[target].max(f32::MIN_POSITIVE).ln();
            trace.rows.push(embedded);
            trace.hidden.push(state);
            trace.probabilities.push(probabilities);
            input = target;
        }
        Ok(trace)
    }

    /// Backpropagation through time for one row, scaled by `scale`.
    fn backward_row(&self, row: &[usize], trace: &RowTrace, scale: f32) -> Result<Gradients> {
        let mut grads: Gradients = self
            .parameters
            .iter()
            .map(|(name, t)| (name.clone(), Tensor::zeros(t.shape())))
            .collect();
        let hidden = self.config.hidden_size;
        let mut carry = vec![0.0; hidden];

        for t in (0..row.len()).rev() {
            let state = &trace.hidden[t + 1];
            let previous = &trace.hidden[t];
            let input = trace.rows[t];

            // d(-log p[target]) / d logits = p - onehot(target)
            let mut d_logits = trace.probabilities[t].clone();
            d_logits[row[t]] -= 1.0;
            for v in &mut d_logits {
                *v *= scale;
            }
            grad_mut(&mut grads, OUTPUT_WEIGHTS).add_outer(state, &d_logits)?;
            add_into(grad_mut(&mut grads, OUTPUT_BIAS).blob_mut(), &d_logits);

            let mut d_state = carry;
            self.param(OUTPUT_WEIGHTS)
                .mul_vec_into(&d_logits, &mut d_state)?;
            let d_pre: Vec<f32> = d_state
                .iter()
                .zip(state)
                .map(|(d, h)| d * (1.0 - h * h))
                .collect();

            let embedded = self.param(EMBEDDING).row(input);
            grad_mut(&mut grads, INPUT_WEIGHTS).add_outer(embedded, &d_pre)?;
            grad_mut(&mut grads, HIDDEN_WEIGHTS).add_outer(previous, &d_pre)?;
            add_into(grad_mut(&mut grads, RECURRENT_BIAS).blob_mut(), &d_pre);

            let mut d_embedded = vec![0.0; self.config.embedding_size];
            self.param(INPUT_WEIGHTS)
                .mul_vec_into(&d_pre, &mut d_embedded)?;
            add_into(grad_mut(&mut grads, EMBEDDING).row_mut(input), &d_embedded);

            carry = vec![0.0; hidden];
            self.param(HIDDEN_WEIGHTS).mul_vec_into(&d_pre, &mut carry)?;
        }
        Ok(grads)
    }
}

fn grad_mut<'a>(grads: &'a mut Gradients, name: &str) -> &'a mut Tensor {
    grads
        .get_mut(name)
        .unwrap_or_else(|| unreachable!("gradient for every parameter is allocated"))
}

fn add_into(target: &mut [f32], values: &[f32]) {
    for (t, v) in target.iter_mut().zip(values) {
        *t += v;
    }
}

impl GenerativeModel for Rnn {
    fn likelihood(&self, batch: &Batch) -> Result<Vec<f32>> {
        (0..batch.rows())
            .into_par_iter()
            .map(|i| self.forward_row(batch.sequence(i)).map(|trace| trace.log_prob))
            .collect()
    }

    fn sample<R: Rng>(&self, rng: &mut R, n: usize) -> Result<Sampled> {
        let mut sampled = Sampled {
            sequences: Vec::with_capacity(n),
            log_probs: Vec::with_capacity(n),
        };
        for _ in 0..n {
            let mut state = vec![0.0; self.config.hidden_size];
            let mut input = self.go;
            let mut sequence = Vec::new();
            let mut log_prob = 0.0;

            // Stops at EOS or at the length ceiling, whichever comes first.
            while sequence.len() < self.config.max_length {
                let (next_state, probabilities) = self.step(self.embedding_row(input)?, &state)?;
                let (token, token_log_prob) =
                    select_next_token(rng, &probabilities, self.temperature)?;
                log_prob += token_log_prob;
                sequence.push(token);
                state = next_state;
                if token == self.eos {
                    break;
                }
                input = token;
            }
            sampled.sequences.push(sequence);
            sampled.log_probs.push(log_prob);
        }
        Ok(sampled)
    }
}

impl Trainable for Rnn {
    fn likelihood_and_gradients(&self, batch: &Batch) -> Result<(Vec<f32>, Gradients)> {
        let rows = batch.rows();
        if rows == 0 {
            return Ok((Vec::new(), Gradients::new()));
        }
        let scale = 1.0 / rows as f32;

        // Each row is processed independently; gradients are summed afterwards.
        let per_row: Vec<(f32, Gradients)> = (0..rows)
            .into_par_iter()
            .map(|i| {
                let row = batch.sequence(i);
                let trace = self.forward_row(row)?;
                let grads = self.backward_row(row, &trace, scale)?;
                Ok((trace.log_prob, grads))
            })
            .collect::<Result<_>>()?;

        let mut log_probs = Vec::with_capacity(rows);
        let mut total: Option<Gradients> = None;
        for (log_prob, grads) in per_row {
            log_probs.push(log_prob);
            match total.as_mut() {
                None => total = Some(grads),
                Some(acc) => {
                    for (name, grad) in grads {
                        if let Some(sum) = acc.get_mut(&name) {
                            sum.add_assign(&grad)?;
                        }
                    }
                }
            }
        }
        Ok((log_probs, total.unwrap_or_default()))
    }

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.parameters
    }

    fn config(&self) -> ModelConfig {
        self.config.clone()
    }

    fn is_frozen(&self, name: &str) -> bool {
        self.frozen.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{AdamW, Optimizer};

    fn tiny() -> (Vocabulary, Rnn) {
        let vocabulary = Vocabulary::from_tokens(["C", "N", "O"]);
        let config = ModelConfig {
            embedding_size: 4,
            hidden_size: 5,
            max_length: 12,
            ..ModelConfig::new(vocabulary.len())
        };
        let model = Rnn::new(&mut StdRng::seed_from_u64(11), config, &vocabulary).unwrap();
        (vocabulary, model)
    }

    fn encoded(vocabulary: &Vocabulary, entries: &[&str]) -> Batch {
        let sequences: Vec<_> = entries
            .iter()
            .map(|e| vocabulary.encode_structure(e).unwrap())
            .collect();
        Batch::from_sequences(&sequences)
    }

    #[test]
    fn test_likelihood_ignores_padding() {
        let (vocabulary, model) = tiny();
        let alone = model.likelihood(&encoded(&vocabulary, &["CN"])).unwrap();
        let padded = model
            .likelihood(&encoded(&vocabulary, &["CNOOC", "CN"]))
            .unwrap();
        assert!((alone[0] - padded[1]).abs() < 1e-5);
        assert!(padded.iter().all(|lp| *lp < 0.0));
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let (vocabulary, mut model) = tiny();
        let batch = encoded(&vocabulary, &["CNO", "OC"]);
        let (_, grads) = model.likelihood_and_gradients(&batch).unwrap();

        let loss = |m: &Rnn| {
            let lp = m.likelihood(&batch).unwrap();
            -lp.iter().sum::<f32>() / lp.len() as f32
        };
        let eps = 1e-2;
        for (name, index) in [(HIDDEN_WEIGHTS, 3), (EMBEDDING, 1), (OUTPUT_BIAS, 2), (INPUT_WEIGHTS, 6)] {
            let original = model.parameters[name].blob()[index];
            model.parameters.get_mut(name).unwrap().blob_mut()[index] = original + eps;
            let up = loss(&model);
            model.parameters.get_mut(name).unwrap().blob_mut()[index] = original - eps;
            let down = loss(&model);
            model.parameters.get_mut(name).unwrap().blob_mut()[index] = original;

            let numeric = (up - down) / (2.0 * eps);
            let analytic = grads[name].blob()[index];
            assert!(
                (numeric - analytic).abs() < 1e-2,
                "{name}[{index}]: numeric {numeric} vs analytic {analytic}"
            );
        }
    }

    #[test]
    fn test_training_raises_likelihood() {
        let (vocabulary, mut model) = tiny();
        let batch = encoded(&vocabulary, &["CCO", "CCN", "CCO"]);
        let before: f32 = model.likelihood(&batch).unwrap().iter().sum();

        let optimizer = AdamW::adam();
        let mut state = OptimizerState::default();
        for _ in 0..50 {
            let (_, grads) = model.likelihood_and_gradients(&batch).unwrap();
            optimizer
                .step(&mut model.parameters, &grads, &mut state, 0.05)
                .unwrap();
        }
        let after: f32 = model.likelihood(&batch).unwrap().iter().sum();
        assert!(after > before, "{after} <= {before}");
    }

    #[test]
    fn test_samples_stop_at_eos_or_ceiling() {
        let (vocabulary, model) = tiny();
        let sampled = model.sample(&mut StdRng::seed_from_u64(5), 40).unwrap();
        assert_eq!(sampled.sequences.len(), 40);
        assert_eq!(sampled.log_probs.len(), 40);
        for sequence in &sampled.sequences {
            assert!(!sequence.is_empty());
            assert!(sequence.len() <= 12);
            let eos_at = sequence.iter().position(|&t| t == vocabulary.eos());
            match eos_at {
                Some(p) => assert_eq!(p, sequence.len() - 1),
                None => assert_eq!(sequence.len(), 12),
            }
        }
        assert!(sampled.log_probs.iter().all(|lp| *lp <= 0.0));
    }

    #[test]
    fn test_restore_rejects_misshapen_tensor() {
        let (_, mut model) = tiny();
        let mut loaded = model.parameters.clone();
        loaded.insert(OUTPUT_BIAS.into(), Tensor::zeros(&[3]));
        let err = model
            .restore_parameters(loaded, Path::new("x.ckpt"), &[])
            .unwrap_err();
        assert!(matches!(err, MolgenError::CheckpointMismatch { .. }));
    }

    #[test]
    fn test_freeze_leaves_output_trainable() {
        let (_, mut model) = tiny();
        let all = model.num_params();
        model.freeze_all_but_output();
        assert!(model.is_frozen(EMBEDDING));
        assert!(model.is_frozen(HIDDEN_WEIGHTS));
        assert!(!model.is_frozen(OUTPUT_WEIGHTS));
        assert!(!model.is_frozen(OUTPUT_BIAS));
        assert_eq!(model.num_params(), 5 * 5 + 5);
        assert!(model.num_params() < all);
    }

    #[test]
    fn test_embedding_rows_are_bound_by_token() {
        let vocabulary = Vocabulary::from_tokens(["C", "O"]);
        let config = ModelConfig {
            embedding_size: 3,
            hidden_size: 4,
            input_vocab_size: 5,
            input_tokens: ["GO", "O", "N", "EOS", "C"].map(String::from).to_vec(),
            ..ModelConfig::new(vocabulary.len())
        };
        let model = Rnn::new(&mut StdRng::seed_from_u64(3), config, &vocabulary).unwrap();
        let table = &model.parameters()[EMBEDDING];

        let o = vocabulary.index_of("O").unwrap();
        let c = vocabulary.index_of("C").unwrap();
        assert_eq!(model.embedding_of(o), Some(table.row(1)));
        assert_eq!(model.embedding_of(c), Some(table.row(4)));
        assert_eq!(model.embedding_of(vocabulary.go()), Some(table.row(0)));
        assert_eq!(model.embedding_of(vocabulary.len()), None);
    }

    #[test]
    fn test_token_without_embedding_row_is_rejected() {
        let vocabulary = Vocabulary::from_tokens(["C", "S"]);
        let config = ModelConfig {
            embedding_size: 3,
            hidden_size: 4,
            input_tokens: ["C", "O", "EOS", "GO"].map(String::from).to_vec(),
            ..ModelConfig::new(vocabulary.len())
        };
        let err = Rnn::new(&mut StdRng::seed_from_u64(3), config, &vocabulary).unwrap_err();
        assert!(err.to_string().contains("`S`"), "{err}");
    }

    #[test]
    fn test_checkpoint_rejects_same_size_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prior.ckpt");
        let (vocabulary, model) = tiny();
        let state = crate::model::TrainingState {
            parameters: model.parameters.clone(),
            optimizer: OptimizerState::default(),
        };
        checkpoint::save(&path, &state, model.model_config(), &vocabulary).unwrap();

        assert!(Rnn::from_checkpoint(&path, &vocabulary).is_ok());
        let renamed = Vocabulary::from_tokens(["C", "N", "S"]);
        let err = Rnn::from_checkpoint(&path, &renamed).unwrap_err();
        assert!(matches!(err, MolgenError::CheckpointMismatch { .. }));
    }
}

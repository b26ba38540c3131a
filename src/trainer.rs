//! Maximum-likelihood training on next-token prediction.
//!
//! The loop walks a small state machine per run:
//! `Initializing -> EpochActive -> (Decaying -> Checkpointing -> EpochActive)* ->
//! Checkpointing -> ... -> Done`. The learning rate decays by a fixed fraction
//! on a step cadence, and the checkpoint is rewritten on that same cadence and
//! at the end of every epoch.

use std::path::{Path, PathBuf};
use std::time::Instant;

use rand::Rng;

use crate::checkpoint;
use crate::corpus::{epoch_plan, Corpus, Loader, UnknownTokenPolicy};
use crate::error::{MolgenError, Result};
use crate::model::{Trainable, TrainingState};
use crate::optimizer::{AdamW, Optimizer, OptimizerState};
use crate::oracle::ValidityOracle;
use crate::sampler::fraction_valid;
use crate::vocabulary::Vocabulary;

/// Fixed-fraction learning-rate decay on a step cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecaySchedule {
    /// Decay after every this many optimizer steps. Zero disables decay.
    pub every_steps: usize,
    /// Fraction removed from the rate at each decay: `lr *= 1 - decrease_by`.
    pub decrease_by: f32,
}

impl DecaySchedule {
    /// Creates a schedule.
    #[must_use]
    pub const fn new(every_steps: usize, decrease_by: f32) -> Self {
        Self { every_steps, decrease_by }
    }

    /// True when step `step` (1-based) closes a decay period.
    #[must_use]
    pub const fn is_due(&self, step: usize) -> bool {
        self.every_steps > 0 && step > 0 && step % self.every_steps == 0
    }
}

impl Default for DecaySchedule {
    fn default() -> Self {
        Self::new(10, 0.03)
    }
}

/// Current learning rate under a [`DecaySchedule`].
#[derive(Debug, Clone, PartialEq)]
pub struct LearningRate {
    initial: f32,
    current: f32,
    schedule: DecaySchedule,
    decays: usize,
}

impl LearningRate {
    /// Starts at `initial`.
    #[must_use]
    pub const fn new(initial: f32, schedule: DecaySchedule) -> Self {
        Self {
            initial,
            current: initial,
            schedule,
            decays: 0,
        }
    }

    /// Rate to use for the next step.
    #[must_use]
    pub const fn current(&self) -> f32 {
        self.current
    }

    /// Rate before any decay.
    #[must_use]
    pub const fn initial(&self) -> f32 {
        self.initial
    }

    /// Number of decays applied so far.
    #[must_use]
    pub const fn decays(&self) -> usize {
        self.decays
    }

    /// True when a decay is due after step `step`.
    #[must_use]
    pub const fn due(&self, step: usize) -> bool {
        self.schedule.is_due(step)
    }

    /// Applies one decay and returns the new rate.
    pub fn decay(&mut self) -> f32 {
        self.current *= 1.0 - self.schedule.decrease_by;
        self.decays += 1;
        self.current
    }
}

/// Parameters of one training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainConfig {
    /// Passes over the corpus.
    pub epochs: usize,
    /// Entries per batch.
    pub batch_size: usize,
    /// Rate before any decay.
    pub learning_rate: f32,
    /// Decay cadence and factor.
    pub decay: DecaySchedule,
    /// Draw a fresh permutation of the corpus every epoch.
    pub shuffle: bool,
    /// Discard the trailing partial batch of each epoch.
    pub drop_last: bool,
    /// Structures sampled at each decay to report the valid fraction. Zero disables it.
    pub progress_samples: usize,
    /// Handling of entries with tokens missing from the vocabulary.
    pub unknown_tokens: UnknownTokenPolicy,
    /// Checkpoint rewritten during and after training. `None` keeps the model in memory only.
    pub checkpoint: Option<PathBuf>,
}

impl TrainConfig {
    /// Defaults for training a prior on a large corpus.
    #[must_use]
    pub const fn prior() -> Self {
        Self {
            epochs: 5,
            batch_size: 128,
            learning_rate: 0.001,
            decay: DecaySchedule::new(10, 0.03),
            shuffle: true,
            drop_last: false,
            progress_samples: 128,
            unknown_tokens: UnknownTokenPolicy::Skip,
            checkpoint: None,
        }
    }

    /// Defaults for specializing a prior on a small corpus.
    #[must_use]
    pub const fn transfer() -> Self {
        Self {
            epochs: 10,
            batch_size: 10,
            learning_rate: 0.0005,
            decay: DecaySchedule::new(80, 0.03),
            shuffle: true,
            drop_last: false,
            progress_samples: 128,
            unknown_tokens: UnknownTokenPolicy::Skip,
            checkpoint: None,
        }
    }

    /// Sets the checkpoint path.
    #[must_use]
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    /// Rejects values the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MolgenError::Config("batch_size must be at least 1".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(MolgenError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.decay.decrease_by) {
            return Err(MolgenError::Config(format!(
                "decrease_by must be in [0, 1), got {}",
                self.decay.decrease_by
            )));
        }
        Ok(())
    }
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self::prior()
    }
}

/// Where the training state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Checking configuration and building the loader.
    Initializing,
    /// Stepping through the batches of an epoch.
    EpochActive,
    /// Applying a learning-rate decay and reporting progress.
    Decaying,
    /// Writing the checkpoint.
    Checkpointing,
    /// All epochs finished.
    Done,
}

/// Ephemeral state of one run, handed to the epoch callback and returned at the end.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    /// Current phase.
    pub phase: Phase,
    /// 1-based epoch, 0 before the first epoch starts.
    pub epoch: usize,
    /// Optimizer steps taken in this run.
    pub step: usize,
    /// Rate used for the next step.
    pub learning_rate: f32,
    /// Loss of the most recent step.
    pub last_loss: Option<f32>,
    /// Valid percentage from the most recent progress report.
    pub last_percent_valid: Option<f32>,
    /// Batches skipped because every entry in them was unencodable.
    pub empty_batches: usize,
    /// Entries skipped for unknown tokens.
    pub skipped_entries: usize,
}

impl RunState {
    fn new(learning_rate: f32) -> Self {
        Self {
            phase: Phase::Initializing,
            epoch: 0,
            step: 0,
            learning_rate,
            last_loss: None,
            last_percent_valid: None,
            empty_batches: 0,
            skipped_entries: 0,
        }
    }

    fn enter(&mut self, phase: Phase) {
        log::debug!("{:?} -> {:?} (epoch {}, step {})", self.phase, phase, self.epoch, self.step);
        self.phase = phase;
    }
}

/// Drives a [`Trainable`] model over a corpus.
#[derive(Debug, Clone)]
pub struct Trainer<'a, O: ?Sized, P = AdamW> {
    config: TrainConfig,
    vocabulary: &'a Vocabulary,
    oracle: &'a O,
    optimizer: P,
}

impl<'a, O: ValidityOracle + ?Sized> Trainer<'a, O> {
    /// Trainer using plain Adam.
    #[must_use]
    pub fn new(config: TrainConfig, vocabulary: &'a Vocabulary, oracle: &'a O) -> Self {
        Self::with_optimizer(config, vocabulary, oracle, AdamW::adam())
    }
}

impl<'a, O: ValidityOracle + ?Sized, P: Optimizer> Trainer<'a, O, P> {
    /// Trainer using `optimizer`.
    #[must_use]
    pub const fn with_optimizer(
        config: TrainConfig,
        vocabulary: &'a Vocabulary,
        oracle: &'a O,
        optimizer: P,
    ) -> Self {
        Self {
            config,
            vocabulary,
            oracle,
            optimizer,
        }
    }

    /// Configuration of this trainer.
    #[must_use]
    pub const fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Trains `model` on `corpus` for the configured number of epochs.
    ///
    /// `on_epoch_end` runs after each epoch's checkpoint is written; an error
    /// from it aborts the run.
    pub fn run<M, R, F>(
        &self,
        model: &mut M,
        corpus: &Corpus,
        optimizer_state: &mut OptimizerState,
        rng: &mut R,
        mut on_epoch_end: F,
    ) -> Result<RunState>
    where
        M: Trainable,
        R: Rng,
        F: FnMut(&M, &RunState, &mut R) -> Result<()>,
    {
        self.config.validate()?;
        if corpus.is_empty() {
            return Err(MolgenError::EmptyCorpus {
                path: corpus.path().map_or_else(PathBuf::new, Path::to_path_buf),
            });
        }

        let loader = Loader::new(corpus, self.vocabulary, self.config.unknown_tokens);
        let mut learning_rate = LearningRate::new(self.config.learning_rate, self.config.decay);
        let mut state = RunState::new(learning_rate.current());
        log::info!(
            "Training on {} entries: {} epochs, batch size {}, learning rate {}",
            corpus.len(),
            self.config.epochs,
            self.config.batch_size,
            self.config.learning_rate
        );

        for epoch in 1..=self.config.epochs {
            state.epoch = epoch;
            state.enter(Phase::EpochActive);
            let epoch_timer = Instant::now();
            let plan = epoch_plan(
                corpus.len(),
                self.config.batch_size,
                self.config.shuffle,
                self.config.drop_last,
                rng,
            );
            if plan.is_empty() {
                log::warn!(
                    "Epoch {epoch} has no batches: {} entries with batch size {} and drop_last",
                    corpus.len(),
                    self.config.batch_size
                );
            }

            for indices in plan {
                let batch = loader.batch(&indices)?;
                if batch.is_empty() {
                    log::warn!("Skipping empty batch in epoch {epoch}");
                    state.empty_batches += 1;
                    continue;
                }

                let (log_probs, mut grads) = model.likelihood_and_gradients(&batch)?;
                let loss = -log_probs.iter().sum::<f32>() / log_probs.len() as f32;
                grads.retain(|name, _| !model.is_frozen(name));
                self.optimizer.step(
                    model.parameters_mut(),
                    &grads,
                    optimizer_state,
                    learning_rate.current(),
                )?;
                state.step += 1;
                state.last_loss = Some(loss);

                if learning_rate.due(state.step) {
                    state.enter(Phase::Decaying);
                    state.learning_rate = learning_rate.decay();
                    if self.config.progress_samples > 0 {
                        let fraction = fraction_valid(
                            &*model,
                            self.vocabulary,
                            self.oracle,
                            self.config.progress_samples,
                            rng,
                        )?;
                        state.last_percent_valid = Some(100.0 * fraction);
                    }
                    log::info!(
                        "Epoch: {epoch} Step: {} Loss: {loss:.2} LR: {:.6} Valid: {}",
                        state.step,
                        state.learning_rate,
                        state
                            .last_percent_valid
                            .map_or_else(|| "-".to_string(), |p| format!("{p:.1}%"))
                    );
                    state.enter(Phase::Checkpointing);
                    self.save(&*model, optimizer_state)?;
                    state.enter(Phase::EpochActive);
                }
            }

            state.skipped_entries = loader.skipped();
            state.enter(Phase::Checkpointing);
            self.save(&*model, optimizer_state)?;
            log::info!(
                "Epoch {epoch} finished in {:.2}s ({} steps, {} entries skipped)",
                epoch_timer.elapsed().as_secs_f32(),
                state.step,
                state.skipped_entries
            );
            on_epoch_end(&*model, &state, rng)?;
        }

        state.enter(Phase::Done);
        Ok(state)
    }

    fn save<M: Trainable>(&self, model: &M, optimizer_state: &OptimizerState) -> Result<()> {
        let Some(path) = &self.config.checkpoint else {
            return Ok(());
        };
        let state = TrainingState {
            parameters: model.parameters().clone(),
            optimizer: optimizer_state.clone(),
        };
        checkpoint::save(path, &state, &model.config(), self.vocabulary)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::corpus::Batch;
    use crate::model::{GenerativeModel, Gradients, ModelConfig, Parameters, Sampled};
    use crate::oracle::SmilesSyntax;
    use crate::tensor::{softmax_in_place, Tensor};
    use rand::distributions::{Distribution, WeightedIndex};
    use rand::{rngs::StdRng, SeedableRng};

    /// Position-independent token model: one logit per vocabulary entry, plus
    /// an unused `offset` tensor that can be frozen.
    pub(crate) struct Unigram {
        pub(crate) parameters: Parameters,
        pub(crate) frozen_offset: bool,
        eos: usize,
    }

    impl Unigram {
        pub(crate) fn new(vocabulary: &Vocabulary) -> Self {
            let mut parameters = Parameters::new();
            parameters.insert("logits".into(), Tensor::zeros(&[vocabulary.len()]));
            parameters.insert("offset".into(), Tensor::zeros(&[1]));
            Self {
                parameters,
                frozen_offset: false,
                eos: vocabulary.eos(),
            }
        }

        fn probabilities(&self) -> Vec<f32> {
            let mut p = self.parameters["logits"].blob().to_vec();
            softmax_in_place(&mut p);
            p
        }
    }

    impl GenerativeModel for Unigram {
        fn likelihood(&self, batch: &Batch) -> Result<Vec<f32>> {
            let p = self.probabilities();
            Ok((0..batch.rows())
                .map(|i| batch.sequence(i).iter().map(|&t| p[t].ln()).sum())
                .collect())
        }

        fn sample<R: Rng>(&self, rng: &mut R, n: usize) -> Result<Sampled> {
            let dist = WeightedIndex::new(self.probabilities())
                .map_err(|e| MolgenError::Sampling(e.to_string()))?;
            let mut sampled = Sampled::default();
            for _ in 0..n {
                let mut sequence = Vec::new();
                while sequence.len() < 8 {
                    let token = dist.sample(rng);
                    sequence.push(token);
                    if token == self.eos {
                        break;
                    }
                }
                sampled.sequences.push(sequence);
                sampled.log_probs.push(0.0);
            }
            Ok(sampled)
        }
    }

    impl Trainable for Unigram {
        fn likelihood_and_gradients(&self, batch: &Batch) -> Result<(Vec<f32>, Gradients)> {
            let p = self.probabilities();
            let scale = 1.0 / batch.rows() as f32;
            let mut grad = vec![0.0; p.len()];
            for i in 0..batch.rows() {
                for &t in batch.sequence(i) {
                    for (g, q) in grad.iter_mut().zip(&p) {
                        *g += q * scale;
                    }
                    grad[t] -= scale;
                }
            }
            let mut grads = Gradients::new();
            grads.insert("logits".into(), Tensor::raw(&[p.len()], grad)?);
            grads.insert("offset".into(), Tensor::raw(&[1], vec![1.0])?);
            Ok((self.likelihood(batch)?, grads))
        }

        fn parameters(&self) -> &Parameters {
            &self.parameters
        }

        fn parameters_mut(&mut self) -> &mut Parameters {
            &mut self.parameters
        }

        fn config(&self) -> ModelConfig {
            ModelConfig::new(self.parameters["logits"].size())
        }

        fn is_frozen(&self, name: &str) -> bool {
            self.frozen_offset && name == "offset"
        }
    }

    fn corpus() -> (Vocabulary, Corpus) {
        let vocabulary = Vocabulary::from_tokens(["C", "N", "O"]);
        let corpus = Corpus::from_entries(["CC", "CCO", "CN", "CCC", "OCC"].repeat(4));
        (vocabulary, corpus)
    }

    fn quick_config() -> TrainConfig {
        TrainConfig {
            epochs: 2,
            batch_size: 4,
            learning_rate: 0.05,
            decay: DecaySchedule::new(2, 0.1),
            progress_samples: 8,
            ..TrainConfig::prior()
        }
    }

    #[test]
    fn test_decay_is_geometric() {
        let mut lr = LearningRate::new(0.01, DecaySchedule::new(10, 0.03));
        for _ in 0..7 {
            lr.decay();
        }
        let expected = 0.01 * 0.97_f32.powi(7);
        assert!((lr.current() - expected).abs() < 1e-9);
        assert_eq!(lr.decays(), 7);
        assert!((lr.initial() - 0.01).abs() < f32::EPSILON);
    }

    #[test]
    fn test_decay_cadence() {
        let schedule = DecaySchedule::new(10, 0.03);
        assert!(!schedule.is_due(0));
        assert!(!schedule.is_due(9));
        assert!(schedule.is_due(10));
        assert!(schedule.is_due(20));
        assert!(!DecaySchedule::new(0, 0.03).is_due(10));
    }

    #[test]
    fn test_run_steps_decays_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prior.ckpt");
        let (vocabulary, corpus) = corpus();
        let mut model = Unigram::new(&vocabulary);
        let trainer = Trainer::new(quick_config().with_checkpoint(&path), &vocabulary, &SmilesSyntax);

        let mut epochs_seen = Vec::new();
        let mut optimizer_state = OptimizerState::default();
        let state = trainer
            .run(
                &mut model,
                &corpus,
                &mut optimizer_state,
                &mut StdRng::seed_from_u64(1),
                |_, s, _| {
                    epochs_seen.push(s.epoch);
                    Ok(())
                },
            )
            .unwrap();

        // 20 entries in batches of 4, twice.
        assert_eq!(state.step, 10);
        assert_eq!(state.phase, Phase::Done);
        assert_eq!(epochs_seen, vec![1, 2]);
        let expected = 0.05 * 0.9_f32.powi(5);
        assert!((state.learning_rate - expected).abs() < 1e-7);
        assert!(state.last_percent_valid.is_some());
        assert_eq!(optimizer_state.step, 10);

        let (saved, meta) = checkpoint::load(&path).unwrap();
        assert_eq!(saved.parameters, model.parameters);
        assert_eq!(meta.model.vocab_size, vocabulary.len());
    }

    #[test]
    fn test_training_lowers_loss() {
        let (vocabulary, corpus) = corpus();
        let mut model = Unigram::new(&vocabulary);
        let config = TrainConfig {
            epochs: 6,
            ..quick_config()
        };
        let batch = Batch::from_sequences(&[vocabulary.encode_structure("CCC").unwrap()]);
        let before = model.likelihood(&batch).unwrap()[0];
        Trainer::new(config, &vocabulary, &SmilesSyntax)
            .run(
                &mut model,
                &corpus,
                &mut OptimizerState::default(),
                &mut StdRng::seed_from_u64(2),
                |_, _, _| Ok(()),
            )
            .unwrap();
        assert!(model.likelihood(&batch).unwrap()[0] > before);
    }

    #[test]
    fn test_frozen_parameters_stay_put() {
        let (vocabulary, corpus) = corpus();
        let mut model = Unigram::new(&vocabulary);
        model.frozen_offset = true;
        Trainer::new(quick_config(), &vocabulary, &SmilesSyntax)
            .run(
                &mut model,
                &corpus,
                &mut OptimizerState::default(),
                &mut StdRng::seed_from_u64(3),
                |_, _, _| Ok(()),
            )
            .unwrap();
        assert_eq!(model.parameters["offset"].blob(), &[0.0]);
        assert_ne!(model.parameters["logits"].blob(), &[0.0; 5]);
    }

    #[test]
    fn test_empty_batches_are_skipped() {
        let vocabulary = Vocabulary::from_tokens(["C"]);
        let corpus = Corpus::from_entries(["N", "O", "NO"]);
        let mut model = Unigram::new(&vocabulary);
        let config = TrainConfig {
            epochs: 1,
            batch_size: 2,
            drop_last: false,
            ..quick_config()
        };
        let state = Trainer::new(config, &vocabulary, &SmilesSyntax)
            .run(
                &mut model,
                &corpus,
                &mut OptimizerState::default(),
                &mut StdRng::seed_from_u64(4),
                |_, _, _| Ok(()),
            )
            .unwrap();
        assert_eq!(state.step, 0);
        assert_eq!(state.empty_batches, 2);
        assert_eq!(state.skipped_entries, 3);
        assert_eq!(state.last_loss, None);
    }

    #[test]
    fn test_skipped_entries_counted_once_across_epochs() {
        let vocabulary = Vocabulary::from_tokens(["C", "O"]);
        let corpus = Corpus::from_entries(["CO", "CN", "OC"]);
        let mut model = Unigram::new(&vocabulary);
        let config = TrainConfig {
            epochs: 5,
            batch_size: 3,
            drop_last: false,
            ..quick_config()
        };
        let state = Trainer::new(config, &vocabulary, &SmilesSyntax)
            .run(
                &mut model,
                &corpus,
                &mut OptimizerState::default(),
                &mut StdRng::seed_from_u64(6),
                |_, _, _| Ok(()),
            )
            .unwrap();
        assert_eq!(state.step, 5);
        assert_eq!(state.skipped_entries, 1);
    }

    #[test]
    fn test_prior_defaults_train_a_small_corpus() {
        let vocabulary = Vocabulary::from_tokens(["C", "O"]);
        let entries: Vec<String> = (1..=100).map(|n| "C".repeat(n % 7 + 1) + "O").collect();
        let corpus = Corpus::from_entries(entries);
        let mut model = Unigram::new(&vocabulary);
        let config = TrainConfig {
            epochs: 2,
            progress_samples: 0,
            ..TrainConfig::prior()
        };
        let state = Trainer::new(config, &vocabulary, &SmilesSyntax)
            .run(
                &mut model,
                &corpus,
                &mut OptimizerState::default(),
                &mut StdRng::seed_from_u64(7),
                |_, _, _| Ok(()),
            )
            .unwrap();
        assert_eq!(state.step, 2);
    }

    #[test]
    fn test_empty_corpus_is_fatal() {
        let vocabulary = Vocabulary::from_tokens(["C"]);
        let mut model = Unigram::new(&vocabulary);
        let err = Trainer::new(quick_config(), &vocabulary, &SmilesSyntax)
            .run(
                &mut model,
                &Corpus::default(),
                &mut OptimizerState::default(),
                &mut StdRng::seed_from_u64(5),
                |_, _, _| Ok(()),
            )
            .unwrap_err();
        assert!(matches!(err, MolgenError::EmptyCorpus { .. }));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let bad = TrainConfig {
            batch_size: 0,
            ..TrainConfig::prior()
        };
        assert!(bad.validate().is_err());
        let bad = TrainConfig {
            decay: DecaySchedule::new(10, 1.0),
            ..TrainConfig::transfer()
        };
        assert!(bad.validate().is_err());
        assert!(TrainConfig::transfer().validate().is_ok());
    }
}

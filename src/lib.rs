#![warn(missing_docs)] // Enforce documentation coverage at the warning level

//! # molgen
//!
//! `molgen` trains an autoregressive generator over molecular-structure
//! strings, specializes it on a small target corpus, and samples new valid
//! structures from it.
//!
//! The loops are written against two capability traits, so any model that can
//! score and sample sequences plugs in; a recurrent network is provided.
//!
//! ## Key Components:
//!
//! *   [`Vocabulary`]: token/index codec. Bracketed runs like `[NH]` are one
//!     token, every other character is its own token, and `EOS` ends each
//!     encoded sequence.
//! *   [`Corpus`] and [`Loader`]: newline-delimited corpora encoded on demand
//!     into right-padded [`Batch`]es.
//! *   [`GenerativeModel`] / [`Trainable`]: the model boundary. [`Rnn`] is the
//!     built-in implementation.
//! *   [`Trainer`]: training with step-cadence learning-rate
//!     decay and checkpointing.
//! *   [`transfer`]: restoring a prior, optionally freezing all but the output
//!     projection, and recording valid samples per epoch.
//! *   [`sampler`]: fixed-count and until-N-valid sampling through a
//!     [`ValidityOracle`].
//!
//! ## Example
//!
//! ```no_run
//! use molgen::{
//!     sample_valid, Corpus, ModelConfig, MolgenError, Rnn, SamplingMode, SmilesSyntax,
//!     TrainConfig, Trainer, OptimizerState, Vocabulary,
//! };
//! use rand::{rngs::StdRng, SeedableRng};
//!
//! # fn main() -> Result<(), MolgenError> {
//! let mut rng = StdRng::seed_from_u64(42);
//! let vocabulary = Vocabulary::from_file("data/Voc")?;
//! let corpus = Corpus::from_file("data/mols.smi")?;
//!
//! let mut model = Rnn::new(&mut rng, ModelConfig::new(vocabulary.len()), &vocabulary)?;
//! let config = TrainConfig::prior().with_checkpoint("data/Prior.ckpt");
//! Trainer::new(config, &vocabulary, &SmilesSyntax).run(
//!     &mut model,
//!     &corpus,
//!     &mut OptimizerState::default(),
//!     &mut rng,
//!     |_, state, _| {
//!         println!("epoch {} done, loss {:?}", state.epoch, state.last_loss);
//!         Ok(())
//!     },
//! )?;
//!
//! let outcome = sample_valid(
//!     &model,
//!     &vocabulary,
//!     &SmilesSyntax,
//!     SamplingMode::UntilValid { target: 100, max_draws: None },
//!     &mut rng,
//! )?;
//! println!("{} draws for {} valid structures", outcome.report.draws, outcome.report.valid);
//! # Ok(())
//! # }
//! ```

// --- Module Declarations ---

/// Checkpoint blobs and their JSON sidecars.
pub mod checkpoint;
/// Corpus reading, batching and padding.
pub mod corpus;
/// The crate error type.
pub mod error;
/// Model capability traits and persisted state.
pub mod model;
/// Parameter update rules (`AdamW`).
pub mod optimizer;
/// Validity predicates for decoded structures.
pub mod oracle;
/// Corpus and vocabulary preparation utilities.
pub mod prep;
/// Recurrent generator implementing the model traits.
pub mod rnn;
/// Sampling with validity filtering.
pub mod sampler;
/// Dense `f32` tensors for parameters and gradients.
pub mod tensor;
/// Training loop and learning-rate decay.
pub mod trainer;
/// Transfer learning from a prior checkpoint.
pub mod transfer;
/// Tokenizer and token/index codec.
pub mod vocabulary;

// --- Public API Re-exports ---

pub use corpus::{Batch, Corpus, Loader, UnknownTokenPolicy, PAD};
pub use error::{MolgenError, Result};
pub use model::{GenerativeModel, ModelConfig, Sampled, Trainable, TrainingState};
pub use optimizer::{AdamW, Optimizer, OptimizerState};
pub use oracle::{SmilesSyntax, ValidityOracle};
pub use rnn::Rnn;
pub use sampler::{sample_valid, SampleOutcome, SamplingMode, SamplingReport};
pub use tensor::{Tensor, TensorError};
pub use trainer::{DecaySchedule, Phase, RunState, TrainConfig, Trainer};
pub use transfer::{ProcessRecord, TransferConfig, TransferOutcome};
pub use vocabulary::{TokenIndex, Vocabulary, EOS, GO};

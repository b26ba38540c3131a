//! Specializing a trained prior on a small target corpus.

use std::fs;
use std::io::Write;
use std::path::Path;

use rand::Rng;

use crate::checkpoint;
use crate::corpus::Corpus;
use crate::error::{MolgenError, Result};
use crate::model::{ModelConfig, Trainable};
use crate::optimizer::OptimizerState;
use crate::oracle::ValidityOracle;
use crate::rnn::{Rnn, OUTPUT_PROJECTION};
use crate::trainer::{RunState, TrainConfig, Trainer};
use crate::vocabulary::Vocabulary;

/// Parameters of a transfer run.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// The underlying training run.
    pub train: TrainConfig,
    /// Train only the output projection.
    pub freeze: bool,
    /// Structures sampled after each epoch for the process table. Zero disables it.
    pub process_samples: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            train: TrainConfig::transfer(),
            freeze: false,
            process_samples: 1024,
        }
    }
}

/// A valid structure sampled during transfer, with the epoch after which it was drawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    /// Decoded structure.
    pub structure: String,
    /// 1-based epoch.
    pub epoch: usize,
}

/// Result of [`run_transfer`].
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    /// Final state of the training run.
    pub run: RunState,
    /// Valid structures sampled after each epoch.
    pub process: Vec<ProcessRecord>,
}

/// Builds the model to transfer from the prior checkpoint at `prior`.
///
/// Without `freeze` the prior must have been trained on `vocabulary`. With
/// `freeze` every tensor but the output projection is taken from the prior and
/// frozen. The embedding table is kept whole and read by token, so every token
/// of `vocabulary` must have been embedded by the prior. The projection is
/// re-initialized for `vocabulary` unless the prior was trained on the same
/// tokens, in which case the prior's projection is kept.
pub fn restore_prior<R: Rng>(
    prior: &Path,
    vocabulary: &Vocabulary,
    freeze: bool,
    rng: &mut R,
) -> Result<Rnn> {
    if !freeze {
        let (model, _) = Rnn::from_checkpoint(prior, vocabulary)?;
        return Ok(model);
    }

    let (state, meta) = checkpoint::load(prior)?;
    let embedded: Vec<&str> = if meta.model.input_tokens.is_empty() {
        meta.tokens.iter().map(String::as_str).collect()
    } else {
        meta.model.input_tokens.iter().map(String::as_str).collect()
    };
    let missing: Vec<&str> = vocabulary
        .tokens()
        .iter()
        .map(String::as_str)
        .filter(|token| !embedded.contains(token))
        .collect();
    if !missing.is_empty() {
        return Err(MolgenError::mismatch(
            prior,
            format!("prior never embedded token(s) {}", missing.join(" ")),
        ));
    }

    let config = ModelConfig {
        vocab_size: vocabulary.len(),
        input_tokens: embedded.iter().map(|t| (*t).to_string()).collect(),
        ..meta.model.clone()
    };
    let mut model = Rnn::new(rng, config, vocabulary)?;
    let rebuilt: &[&str] = if meta.tokens == vocabulary.tokens() {
        &[]
    } else {
        log::info!(
            "Rebuilding output projection: {} -> {} tokens",
            meta.model.vocab_size,
            vocabulary.len()
        );
        &OUTPUT_PROJECTION
    };
    model.restore_parameters(state.parameters, prior, rebuilt)?;
    model.freeze_all_but_output();
    log::info!("Frozen all but the output projection, {} trainable parameters", model.num_params());
    Ok(model)
}

/// Trains `model` on `corpus` with a fresh optimizer and samples after every
/// epoch, keeping the structures `oracle` accepts.
pub fn run_transfer<M, O, R>(
    model: &mut M,
    corpus: &Corpus,
    vocabulary: &Vocabulary,
    oracle: &O,
    config: &TransferConfig,
    rng: &mut R,
) -> Result<TransferOutcome>
where
    M: Trainable,
    O: ValidityOracle + ?Sized,
    R: Rng,
{
    let trainer = Trainer::new(config.train.clone(), vocabulary, oracle);
    let mut process = Vec::new();
    let mut optimizer_state = OptimizerState::default();

    let run = trainer.run(model, corpus, &mut optimizer_state, rng, |model, state, rng| {
        if config.process_samples == 0 {
            return Ok(());
        }
        let sampled = model.sample(rng, config.process_samples)?;
        let before = process.len();
        process.extend(
            sampled
                .sequences
                .iter()
                .map(|sequence| vocabulary.decode(sequence))
                .filter(|structure| oracle.is_valid(structure))
                .map(|structure| ProcessRecord {
                    structure,
                    epoch: state.epoch,
                }),
        );
        log::info!(
            "Epoch {}: {} of {} sampled structures valid",
            state.epoch,
            process.len() - before,
            config.process_samples
        );
        Ok(())
    })?;

    Ok(TransferOutcome { run, process })
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Writes the process table as CSV with a `structure,epoch` header.
pub fn write_process_csv(path: impl AsRef<Path>, records: &[ProcessRecord]) -> Result<()> {
    let path = path.as_ref();
    let mut file = fs::File::create(path).map_err(|e| MolgenError::io(path, e))?;
    writeln!(file, "structure,epoch").map_err(|e| MolgenError::io(path, e))?;
    for record in records {
        writeln!(file, "{},{}", csv_field(&record.structure), record.epoch)
            .map_err(|e| MolgenError::io(path, e))?;
    }
    Ok(())
}

use molgen::corpus::write_lines;
use molgen::prep;
use molgen::transfer::{self, write_process_csv};
use molgen::{
    sample_valid, Corpus, ModelConfig, MolgenError, OptimizerState, Rnn, RunState, SamplingMode,
    SmilesSyntax, TrainConfig, Trainer, TransferConfig, UnknownTokenPolicy, Vocabulary,
};

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

// --- Configuration Structs ---

#[derive(Parser, Debug, Clone)]
struct ModelArgs {
    #[clap(long, default_value = "128", help = "Dimension of token embeddings")]
    embedding_size: usize,
    #[clap(long, default_value = "256", help = "Dimension of the recurrent state")]
    hidden_size: usize,
    #[clap(long, default_value = "140", help = "Maximum sampled length in tokens, EOS included")]
    max_length: usize,
}

impl ModelArgs {
    const fn config(&self, vocab_size: usize) -> ModelConfig {
        ModelConfig {
            vocab_size,
            input_vocab_size: vocab_size,
            input_tokens: Vec::new(),
            embedding_size: self.embedding_size,
            hidden_size: self.hidden_size,
            max_length: self.max_length,
        }
    }
}

/// Overrides on top of the prior or transfer defaults.
#[derive(Parser, Debug, Clone)]
struct TrainArgs {
    #[clap(long, help = "Passes over the corpus (prior: 5, transfer: 10)")]
    epochs: Option<usize>,
    #[clap(long, help = "Entries per batch (prior: 128, transfer: 10)")]
    batch_size: Option<usize>,
    #[clap(long, help = "Initial learning rate (prior: 0.001, transfer: 0.0005)")]
    learning_rate: Option<f32>,
    #[clap(long, help = "Decay the learning rate every N steps (prior: 10, transfer: 80)")]
    decay_every: Option<usize>,
    #[clap(long, help = "Fraction removed from the learning rate at each decay (0.03)")]
    decrease_by: Option<f32>,
    #[clap(long, help = "Samples drawn at each decay to report the valid percentage (128)")]
    progress_samples: Option<usize>,
    #[clap(long, help = "Keep corpus order instead of shuffling every epoch")]
    no_shuffle: bool,
    #[clap(long, help = "Drop the trailing partial batch of each epoch (default: false)")]
    drop_last: Option<bool>,
    #[clap(long, help = "Seed for shuffling, initialization and sampling")]
    seed: Option<u64>,
    #[clap(long, help = "Abort on corpus entries with unknown tokens instead of skipping them")]
    strict_tokens: bool,
}

impl TrainArgs {
    fn apply(&self, mut config: TrainConfig) -> TrainConfig {
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = learning_rate;
        }
        if let Some(every) = self.decay_every {
            config.decay.every_steps = every;
        }
        if let Some(decrease_by) = self.decrease_by {
            config.decay.decrease_by = decrease_by;
        }
        if let Some(samples) = self.progress_samples {
            config.progress_samples = samples;
        }
        if let Some(drop_last) = self.drop_last {
            config.drop_last = drop_last;
        }
        config.shuffle = !self.no_shuffle;
        if self.strict_tokens {
            config.unknown_tokens = UnknownTokenPolicy::Fail;
        }
        config
    }
}

// --- CLI Commands ---

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
enum Cli {
    /// Train a prior on a large corpus
    Pretrain {
        #[clap(long, help = "Vocabulary file, one token per line")]
        vocab: PathBuf,
        #[clap(long, help = "Corpus file, one structure per line")]
        corpus: PathBuf,
        #[clap(long, help = "Checkpoint to write")]
        checkpoint: PathBuf,
        #[clap(long, help = "Continue from this checkpoint instead of a fresh model")]
        restore: Option<PathBuf>,
        #[clap(flatten)]
        model_args: ModelArgs,
        #[clap(flatten)]
        train_args: TrainArgs,
    },
    /// Specialize a prior on a small target corpus
    Transfer {
        #[clap(long, help = "Vocabulary file of the target corpus")]
        vocab: PathBuf,
        #[clap(long, help = "Target corpus")]
        corpus: PathBuf,
        #[clap(long, help = "Prior checkpoint")]
        prior: PathBuf,
        #[clap(long, help = "Checkpoint to write")]
        checkpoint: PathBuf,
        #[clap(long, help = "Train only the output projection, rebuilt for this vocabulary")]
        freeze: bool,
        #[clap(long, help = "Write valid structures sampled after each epoch to this CSV")]
        process_csv: Option<PathBuf>,
        #[clap(long, default_value = "1024", help = "Structures sampled after each epoch")]
        process_samples: usize,
        #[clap(flatten)]
        train_args: TrainArgs,
    },
    /// Sample valid structures from a checkpoint
    Sample {
        #[clap(long, help = "Vocabulary the checkpoint was trained with")]
        vocab: PathBuf,
        #[clap(long, help = "Checkpoint to sample from")]
        checkpoint: PathBuf,
        #[clap(long, help = "Sequences to draw, or valid structures wanted with --until-valid")]
        count: usize,
        #[clap(long, help = "Output file, one structure per line")]
        output: PathBuf,
        #[clap(long, help = "Keep drawing one sequence at a time until --count are valid")]
        until_valid: bool,
        #[clap(long, help = "Stop --until-valid after this many draws")]
        max_draws: Option<usize>,
        #[clap(long, default_value = "1.0", help = "Sampling temperature (> 0)")]
        temperature: f32,
        #[clap(long, help = "Seed for sampling")]
        seed: Option<u64>,
    },
    /// Write the vocabulary of a corpus
    BuildVocab {
        #[clap(long)]
        corpus: PathBuf,
        #[clap(long)]
        output: PathBuf,
    },
    /// Keep only corpus entries made of vocabulary tokens
    FilterCorpus {
        #[clap(long)]
        corpus: PathBuf,
        #[clap(long)]
        vocab: PathBuf,
        #[clap(long)]
        output: PathBuf,
    },
    /// Keep the first entries of a corpus
    LimitCorpus {
        #[clap(long)]
        corpus: PathBuf,
        #[clap(long, default_value = "5000")]
        count: usize,
        #[clap(long)]
        output: PathBuf,
    },
    /// Keep corpus entries that also occur in a reference corpus
    IntersectCorpus {
        #[clap(long)]
        corpus: PathBuf,
        #[clap(long)]
        reference: PathBuf,
        #[clap(long)]
        output: PathBuf,
    },
    /// Merge vocabulary files
    CombineVocab {
        #[clap(long = "input", required = true, help = "Vocabulary file; repeat for each input")]
        inputs: Vec<PathBuf>,
        #[clap(long)]
        output: PathBuf,
    },
}

// --- Helper Functions ---

fn rng_from(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}

fn report_epoch(state: &RunState) {
    println!(
        "Epoch {} finished: step {}, loss {}, learning rate {:.6}",
        state.epoch,
        state.step,
        state
            .last_loss
            .map_or_else(|| "-".to_string(), |l| format!("{l:.4}")),
        state.learning_rate
    );
}

// --- Main Logic ---

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let result = match Cli::parse() {
        Cli::Pretrain {
            vocab,
            corpus,
            checkpoint,
            restore,
            model_args,
            train_args,
        } => run_pretrain(vocab, corpus, checkpoint, restore, &model_args, &train_args),
        Cli::Transfer {
            vocab,
            corpus,
            prior,
            checkpoint,
            freeze,
            process_csv,
            process_samples,
            train_args,
        } => {
            let config = TransferConfig {
                train: train_args
                    .apply(TrainConfig::transfer())
                    .with_checkpoint(checkpoint),
                freeze,
                process_samples,
            };
            run_transfer(vocab, corpus, prior, process_csv, &config, train_args.seed)
        }
        Cli::Sample {
            vocab,
            checkpoint,
            count,
            output,
            until_valid,
            max_draws,
            temperature,
            seed,
        } => {
            let mode = if until_valid {
                SamplingMode::UntilValid {
                    target: count,
                    max_draws,
                }
            } else {
                SamplingMode::FixedCount(count)
            };
            run_sample(vocab, checkpoint, output, mode, temperature, seed)
        }
        Cli::BuildVocab { corpus, output } => Corpus::from_file(corpus).and_then(|corpus| {
            let vocabulary = prep::construct_vocabulary(&corpus);
            vocabulary.write(&output)?;
            println!("Wrote {} tokens to {}", vocabulary.len(), output.display());
            Ok(())
        }),
        Cli::FilterCorpus {
            corpus,
            vocab,
            output,
        } => Vocabulary::from_file(vocab).and_then(|vocabulary| {
            let kept = prep::filter_on_vocabulary(&Corpus::from_file(corpus)?, &vocabulary);
            kept.write(&output)?;
            println!("Wrote {} entries to {}", kept.len(), output.display());
            Ok(())
        }),
        Cli::LimitCorpus {
            corpus,
            count,
            output,
        } => Corpus::from_file(corpus).and_then(|corpus| {
            let kept = prep::limit(&corpus, count);
            kept.write(&output)?;
            println!("Wrote {} entries to {}", kept.len(), output.display());
            Ok(())
        }),
        Cli::IntersectCorpus {
            corpus,
            reference,
            output,
        } => Corpus::from_file(corpus).and_then(|corpus| {
            let kept = prep::intersect(&corpus, &Corpus::from_file(reference)?);
            kept.write(&output)?;
            println!("Wrote {} entries to {}", kept.len(), output.display());
            Ok(())
        }),
        Cli::CombineVocab { inputs, output } => {
            prep::combine_vocabularies(inputs.as_slice()).and_then(|vocabulary| {
                vocabulary.write(&output)?;
                println!("Wrote {} tokens to {}", vocabulary.len(), output.display());
                Ok(())
            })
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

// --- Training Logic ---

fn run_pretrain(
    vocab: PathBuf,
    corpus: PathBuf,
    checkpoint: PathBuf,
    restore: Option<PathBuf>,
    model_args: &ModelArgs,
    train_args: &TrainArgs,
) -> Result<(), MolgenError> {
    let mut rng = rng_from(train_args.seed);
    let vocabulary = Vocabulary::from_file(vocab)?;
    let corpus = Corpus::from_file(corpus)?;

    let (mut model, mut optimizer_state) = match restore {
        Some(path) => {
            println!("Restoring model and optimizer state from {}", path.display());
            Rnn::from_checkpoint(&path, &vocabulary)?
        }
        None => (
            Rnn::new(&mut rng, model_args.config(vocabulary.len()), &vocabulary)?,
            OptimizerState::default(),
        ),
    };
    println!("Model initialized with {} parameters.", model.num_params());

    let config = train_args
        .apply(TrainConfig::prior())
        .with_checkpoint(checkpoint);
    let start_time = Instant::now();
    let state = Trainer::new(config, &vocabulary, &SmilesSyntax).run(
        &mut model,
        &corpus,
        &mut optimizer_state,
        &mut rng,
        |_, state, _| {
            report_epoch(state);
            Ok(())
        },
    )?;

    println!(
        "Training finished in {:.1}s: {} steps, {} empty batches, {} entries skipped.",
        start_time.elapsed().as_secs_f32(),
        state.step,
        state.empty_batches,
        state.skipped_entries
    );
    Ok(())
}

fn run_transfer(
    vocab: PathBuf,
    corpus: PathBuf,
    prior: PathBuf,
    process_csv: Option<PathBuf>,
    config: &TransferConfig,
    seed: Option<u64>,
) -> Result<(), MolgenError> {
    let mut rng = rng_from(seed);
    let vocabulary = Vocabulary::from_file(vocab)?;
    let corpus = Corpus::from_file(corpus)?;

    let mut model = transfer::restore_prior(&prior, &vocabulary, config.freeze, &mut rng)?;
    println!(
        "Transferring from {} with {} trainable parameters.",
        prior.display(),
        model.num_params()
    );

    let outcome = transfer::run_transfer(
        &mut model,
        &corpus,
        &vocabulary,
        &SmilesSyntax,
        config,
        &mut rng,
    )?;
    report_epoch(&outcome.run);

    if let Some(path) = process_csv {
        write_process_csv(&path, &outcome.process)?;
        println!(
            "Wrote {} sampled structures to {}",
            outcome.process.len(),
            path.display()
        );
    }
    Ok(())
}

// --- Sampling Logic ---

fn run_sample(
    vocab: PathBuf,
    checkpoint: PathBuf,
    output: PathBuf,
    mode: SamplingMode,
    temperature: f32,
    seed: Option<u64>,
) -> Result<(), MolgenError> {
    if !(temperature.is_finite() && temperature > 0.0) {
        return Err(MolgenError::Config(format!(
            "temperature must be positive, got {temperature}"
        )));
    }
    let mut rng = rng_from(seed);
    let vocabulary = Vocabulary::from_file(vocab)?;
    let (model, _) = Rnn::from_checkpoint(&checkpoint, &vocabulary)?;
    let model = model.with_temperature(temperature);

    let outcome = sample_valid(&model, &vocabulary, &SmilesSyntax, mode, &mut rng)?;
    write_lines(&output, &outcome.accepted)?;

    let report = outcome.report;
    println!(
        "Requested {}, drew {}: {} valid, {} rejected, {} duplicates ({:.1}% yield).",
        report.requested,
        report.draws,
        report.valid,
        report.rejected,
        report.duplicates,
        100.0 * report.yield_rate()
    );
    println!("Wrote {} structures to {}", outcome.accepted.len(), output.display());
    Ok(())
}

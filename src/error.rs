use std::path::PathBuf;

use thiserror::Error;

use crate::tensor::TensorError;

/// Every fatal failure the crate can surface.
///
/// Expected outcomes that the loops absorb (an invalid sampled structure, a
/// corpus entry skipped for an unknown token) are not represented here; they
/// show up only in the counters of the relevant report.
#[derive(Debug, Error)]
pub enum MolgenError {
    /// Reading or writing a file failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File that could not be accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint blob could not be encoded or decoded.
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Checkpoint sidecar could not be encoded or decoded.
    #[error("checkpoint sidecar error: {0}")]
    Sidecar(#[from] serde_json::Error),

    /// A token produced by tokenization is absent from the vocabulary.
    #[error("unknown token `{token}` in corpus entry {entry}")]
    UnknownToken {
        /// The offending token.
        token: String,
        /// Position of the entry in the corpus.
        entry: usize,
    },

    /// Restoring parameters into a model of a different shape.
    #[error("checkpoint {} does not fit this model: {reason}", path.display())]
    CheckpointMismatch {
        /// Checkpoint being restored.
        path: PathBuf,
        /// What did not match.
        reason: String,
    },

    /// Training was asked to run on a corpus with no entries.
    #[error("corpus {} contains no entries", path.display())]
    EmptyCorpus {
        /// Corpus file.
        path: PathBuf,
    },

    /// A configuration field holds an unusable value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The model produced a distribution that cannot be sampled from.
    #[error("sampling failed: {0}")]
    Sampling(String),

    /// Tensor arithmetic failed.
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

impl MolgenError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn mismatch(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CheckpointMismatch {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MolgenError>;

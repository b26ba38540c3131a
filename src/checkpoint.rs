//! Checkpoint persistence.
//!
//! A checkpoint is a bincode blob of [`TrainingState`] plus a JSON sidecar at
//! `<checkpoint>.meta.json` recording the [`ModelConfig`] and the vocabulary
//! it was trained with.
//! Both files are written to a temporary path and renamed into place, so a
//! reader never observes a half-written file.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{MolgenError, Result};
use crate::model::{ModelConfig, TrainingState};
use crate::vocabulary::Vocabulary;

/// Sidecar record validated on every restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Hyperparameters of the model that produced the blob.
    pub model: ModelConfig,
    /// Output tokens in index order, reserved ones included.
    pub tokens: Vec<String>,
    /// Version of this crate that wrote the checkpoint.
    pub crate_version: String,
}

impl CheckpointMeta {
    /// Metadata for a checkpoint written by this build.
    #[must_use]
    pub fn new(model: ModelConfig, vocabulary: &Vocabulary) -> Self {
        Self {
            model,
            tokens: vocabulary.tokens().to_vec(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Path of the sidecar belonging to `checkpoint`.
#[must_use]
pub fn sidecar_path(checkpoint: &Path) -> PathBuf {
    with_suffix(checkpoint, ".meta.json")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map_or_else(OsString::new, OsString::from);
    name.push(suffix);
    path.with_file_name(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = with_suffix(path, ".tmp");
    fs::write(&temp_path, bytes).map_err(|e| MolgenError::io(&temp_path, e))?;
    fs::rename(&temp_path, path).map_err(|e| MolgenError::io(path, e))
}

/// Writes `state` to `path` and its sidecar, replacing any previous checkpoint.
pub fn save(
    path: &Path,
    state: &TrainingState,
    model: &ModelConfig,
    vocabulary: &Vocabulary,
) -> Result<()> {
    let start_time = Instant::now();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| MolgenError::io(parent, e))?;
    }
    let meta = serde_json::to_vec_pretty(&CheckpointMeta::new(model.clone(), vocabulary))?;
    write_atomic(&sidecar_path(path), &meta)?;
    write_atomic(path, &bincode::serialize(state)?)?;
    log::debug!(
        "Saved checkpoint {} in {:.2}s",
        path.display(),
        start_time.elapsed().as_secs_f32()
    );
    Ok(())
}

/// Reads a checkpoint and its sidecar.
pub fn load(path: &Path) -> Result<(TrainingState, CheckpointMeta)> {
    let meta_path = sidecar_path(path);
    let meta_bytes = fs::read(&meta_path).map_err(|e| MolgenError::io(&meta_path, e))?;
    let meta: CheckpointMeta = serde_json::from_slice(&meta_bytes)?;
    meta.model
        .validate()
        .map_err(|e| MolgenError::mismatch(path, e.to_string()))?;
    if meta.tokens.len() != meta.model.vocab_size {
        return Err(MolgenError::mismatch(
            path,
            format!(
                "sidecar lists {} tokens for an output width of {}",
                meta.tokens.len(),
                meta.model.vocab_size
            ),
        ));
    }

    let bytes = fs::read(path).map_err(|e| MolgenError::io(path, e))?;
    let state: TrainingState = bincode::deserialize(&bytes)?;
    log::info!(
        "Loaded checkpoint {} ({} tensors, vocabulary size {})",
        path.display(),
        state.parameters.len(),
        meta.model.vocab_size
    );
    Ok((state, meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prior.ckpt");

        let mut state = TrainingState::default();
        state
            .parameters
            .insert("w".into(), Tensor::raw(&[2], vec![1.5, -2.0]).unwrap());
        state.optimizer.step = 7;
        let vocabulary = Vocabulary::from_tokens(["C", "N", "O"]);
        let config = ModelConfig::new(vocabulary.len());

        save(&path, &state, &config, &vocabulary).unwrap();
        assert!(sidecar_path(&path).is_file());
        assert!(!with_suffix(&path, ".tmp").exists());

        let (loaded, meta) = load(&path).unwrap();
        assert_eq!(loaded.parameters, state.parameters);
        assert_eq!(loaded.optimizer.step, 7);
        assert_eq!(meta.model, config);
        assert_eq!(meta.tokens, vec!["C", "N", "O", "EOS", "GO"]);
    }

    #[test]
    fn test_missing_sidecar_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orphan.ckpt");
        fs::write(&path, bincode::serialize(&TrainingState::default()).unwrap()).unwrap();
        assert!(matches!(load(&path), Err(MolgenError::Io { .. })));
    }

    #[test]
    fn test_sidecar_token_count_must_match_width() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prior.ckpt");
        let vocabulary = Vocabulary::from_tokens(["C"]);
        save(&path, &TrainingState::default(), &ModelConfig::new(5), &vocabulary).unwrap();
        assert!(matches!(load(&path), Err(MolgenError::CheckpointMismatch { .. })));
    }

    #[test]
    fn test_sidecar_name() {
        assert_eq!(
            sidecar_path(Path::new("data/Prior.ckpt")),
            PathBuf::from("data/Prior.ckpt.meta.json")
        );
    }
}

//! Corpus and vocabulary preparation.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use rayon::prelude::*;

use crate::corpus::Corpus;
use crate::error::Result;
use crate::vocabulary::{tokenize, Vocabulary};

/// Vocabulary holding every token that occurs in `corpus`.
#[must_use]
pub fn construct_vocabulary(corpus: &Corpus) -> Vocabulary {
    let tokens = corpus
        .entries()
        .par_iter()
        .map(|entry| tokenize(entry).into_iter().collect::<BTreeSet<_>>())
        .reduce(BTreeSet::new, |mut acc, tokens| {
            acc.extend(tokens);
            acc
        });
    let vocabulary = Vocabulary::from_tokens(tokens);
    log::info!(
        "Constructed vocabulary of {} tokens from {} entries",
        vocabulary.len(),
        corpus.len()
    );
    vocabulary
}

/// Entries of `corpus` built only from tokens in `vocabulary`, in order.
#[must_use]
pub fn filter_on_vocabulary(corpus: &Corpus, vocabulary: &Vocabulary) -> Corpus {
    let kept: Vec<String> = corpus
        .entries()
        .par_iter()
        .filter(|entry| vocabulary.encode_structure(entry).is_ok())
        .cloned()
        .collect();
    log::info!("Kept {} of {} entries", kept.len(), corpus.len());
    Corpus::from_entries(kept)
}

/// The first `n` entries of `corpus`.
#[must_use]
pub fn limit(corpus: &Corpus, n: usize) -> Corpus {
    Corpus::from_entries(corpus.entries().iter().take(n).cloned())
}

/// Entries of `target` that also occur in `reference`, in `target` order.
#[must_use]
pub fn intersect(target: &Corpus, reference: &Corpus) -> Corpus {
    let known: HashSet<&str> = reference.entries().iter().map(String::as_str).collect();
    let kept: Vec<String> = target
        .entries()
        .iter()
        .filter(|entry| known.contains(entry.as_str()))
        .cloned()
        .collect();
    log::info!(
        "{} of {} entries also occur in the reference corpus",
        kept.len(),
        target.len()
    );
    Corpus::from_entries(kept)
}

/// Union of the vocabulary files at `paths`.
pub fn combine_vocabularies<P: AsRef<Path>>(paths: &[P]) -> Result<Vocabulary> {
    let mut combined = Vocabulary::new();
    for path in paths {
        let vocabulary = Vocabulary::from_file(path)?;
        combined.add_characters(vocabulary.tokens().iter().cloned());
    }
    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_construct_vocabulary() {
        let corpus = Corpus::from_entries(["C[NH]C", "CO", "c1ccccc1"]);
        let vocabulary = construct_vocabulary(&corpus);
        assert_eq!(
            vocabulary.tokens(),
            &["1", "C", "O", "[NH]", "c", "EOS", "GO"]
        );
        for entry in corpus.entries() {
            assert!(vocabulary.encode_structure(entry).is_ok());
        }
    }

    #[test]
    fn test_filter_on_vocabulary() {
        let vocabulary = Vocabulary::from_tokens(["C", "O"]);
        let corpus = Corpus::from_entries(["CO", "CN", "C[NH]", "OCC"]);
        assert_eq!(filter_on_vocabulary(&corpus, &vocabulary).entries(), &["CO", "OCC"]);
    }

    #[test]
    fn test_limit_and_intersect() {
        let corpus = Corpus::from_entries(["A", "B", "C", "D"]);
        assert_eq!(limit(&corpus, 2).entries(), &["A", "B"]);
        assert_eq!(limit(&corpus, 10).len(), 4);

        let reference = Corpus::from_entries(["D", "B", "X"]);
        assert_eq!(intersect(&corpus, &reference).entries(), &["B", "D"]);
    }

    #[test]
    fn test_combine_vocabularies() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.voc");
        let second = dir.path().join("b.voc");
        fs::write(&first, "C\nN\n").unwrap();
        fs::write(&second, "N\n[NH]\n").unwrap();

        let combined = combine_vocabularies(&[first, second]).unwrap();
        assert_eq!(combined.tokens(), &["C", "N", "[NH]", "EOS", "GO"]);
    }
}

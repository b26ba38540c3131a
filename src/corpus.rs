//! Corpus reading and batch construction.
//!
//! Entries are stored as raw strings and encoded on access, so a large corpus
//! never has to be held in encoded form.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{MolgenError, Result};
use crate::vocabulary::Vocabulary;

/// Value written into padding positions. It may collide with a real token
/// index, so row content is delimited by [`Batch::length`], never by value.
pub const PAD: usize = 0;

/// Right-padded rectangular batch of encoded sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    data: Vec<usize>,
    lengths: Vec<usize>,
    width: usize,
}

impl Batch {
    /// Pads `sequences` with [`PAD`] to the longest one, keeping their order.
    #[must_use]
    pub fn from_sequences(sequences: &[Vec<usize>]) -> Self {
        let width = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let mut data = Vec::with_capacity(width * sequences.len());
        for sequence in sequences {
            data.extend_from_slice(sequence);
            data.extend(std::iter::repeat(PAD).take(width - sequence.len()));
        }
        Self {
            data,
            lengths: sequences.iter().map(Vec::len).collect(),
            width,
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.lengths.len()
    }

    /// Length of the longest row.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// `(rows, width)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows(), self.width)
    }

    /// True when the batch has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// True length of row `i`.
    #[must_use]
    pub fn length(&self, i: usize) -> usize {
        self.lengths[i]
    }

    /// True lengths of every row.
    #[must_use]
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// The unpadded content of row `i`.
    #[must_use]
    pub fn sequence(&self, i: usize) -> &[usize] {
        &self.padded_row(i)[..self.lengths[i]]
    }

    /// Row `i` including its padding.
    #[must_use]
    pub fn padded_row(&self, i: usize) -> &[usize] {
        &self.data[i * self.width..(i + 1) * self.width]
    }

    /// Element at row `i`, column `j`.
    #[must_use]
    pub fn get(&self, i: usize, j: usize) -> usize {
        self.data[i * self.width + j]
    }
}

/// What the loader does with an entry containing a token missing from the vocabulary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownTokenPolicy {
    /// Drop the entry from its batch and count it.
    #[default]
    Skip,
    /// Abort with [`MolgenError::UnknownToken`].
    Fail,
}

/// Newline-delimited corpus of structure strings.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    path: Option<PathBuf>,
    entries: Vec<String>,
}

impl Corpus {
    /// Reads the first whitespace-delimited field of every non-blank line.
    ///
    /// A leading UTF-8 byte-order mark is ignored.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| MolgenError::io(path, e))?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
        let entries: Vec<String> = text
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(String::from)
            .collect();
        log::info!("Read {} entries from {}", entries.len(), path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries,
        })
    }

    /// Wraps in-memory entries.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: None,
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw entries in file order.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// File the corpus was read from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes every entry on its own line.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        write_lines(path, &self.entries)
    }
}

/// Writes `lines` to `path`, one per line.
pub fn write_lines<S: AsRef<str>>(path: impl AsRef<Path>, lines: &[S]) -> Result<()> {
    let path = path.as_ref();
    let mut file = fs::File::create(path).map_err(|e| MolgenError::io(path, e))?;
    for line in lines {
        writeln!(file, "{}", line.as_ref()).map_err(|e| MolgenError::io(path, e))?;
    }
    Ok(())
}

/// Splits `0..len` into batches of `batch_size` indices.
///
/// With `shuffle` the order is a fresh permutation drawn from `rng`. With
/// `drop_last` a trailing partial batch is discarded.
pub fn epoch_plan<R: Rng>(
    len: usize,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    rng: &mut R,
) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..len).collect();
    if shuffle {
        order.shuffle(rng);
    }
    order
        .chunks(batch_size.max(1))
        .filter(|chunk| !drop_last || chunk.len() == batch_size)
        .map(<[usize]>::to_vec)
        .collect()
}

/// Encodes corpus entries on demand against a shared vocabulary.
#[derive(Debug)]
pub struct Loader<'a> {
    corpus: &'a Corpus,
    vocabulary: &'a Vocabulary,
    policy: UnknownTokenPolicy,
    /// Entries found unencodable so far, each counted once.
    skipped: RefCell<BTreeSet<usize>>,
}

impl<'a> Loader<'a> {
    /// Creates a loader over `corpus`.
    #[must_use]
    pub const fn new(
        corpus: &'a Corpus,
        vocabulary: &'a Vocabulary,
        policy: UnknownTokenPolicy,
    ) -> Self {
        Self {
            corpus,
            vocabulary,
            policy,
            skipped: RefCell::new(BTreeSet::new()),
        }
    }

    /// The corpus being loaded.
    #[must_use]
    pub const fn corpus(&self) -> &'a Corpus {
        self.corpus
    }

    /// Number of distinct entries skipped for unknown tokens so far.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.borrow().len()
    }

    /// Tokenizes and encodes entry `i`.
    ///
    /// Returns `Ok(None)` when the entry holds an unknown token under
    /// [`UnknownTokenPolicy::Skip`].
    pub fn item(&self, i: usize) -> Result<Option<Vec<usize>>> {
        let entry = &self.corpus.entries[i];
        match self.vocabulary.encode_structure(entry) {
            Ok(encoded) => Ok(Some(encoded)),
            Err(token) => match self.policy {
                UnknownTokenPolicy::Fail => Err(MolgenError::UnknownToken { token, entry: i }),
                UnknownTokenPolicy::Skip => {
                    if self.skipped.borrow_mut().insert(i) {
                        log::warn!("Skipping entry {i} ({entry}): unknown token `{token}`");
                    }
                    Ok(None)
                }
            },
        }
    }

    /// Encodes `indices`, orders them longest first and pads them into a batch.
    ///
    /// Skipped entries are left out, so the batch may have fewer rows than
    /// `indices`, or none at all.
    pub fn batch(&self, indices: &[usize]) -> Result<Batch> {
        let mut sequences = Vec::with_capacity(indices.len());
        for &i in indices {
            if let Some(encoded) = self.item(i)? {
                sequences.push(encoded);
            }
        }
        sequences.sort_by_key(|s| std::cmp::Reverse(s.len()));
        Ok(Batch::from_sequences(&sequences))
    }
}

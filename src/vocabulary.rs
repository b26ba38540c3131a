//! Token vocabulary and the codec between structure strings and index sequences.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use fancy_regex::Regex;

use crate::error::{MolgenError, Result};

/// Sequence terminator. Every tokenized entry ends with it.
pub const EOS: &str = "EOS";
/// Sequence start. Fed as the first model input, never part of an encoded target.
pub const GO: &str = "GO";

/// Reserved tokens in the order they are appended after the sorted tokens.
const RESERVED: [&str; 2] = [EOS, GO];

/// A bracketed run of 1 to 6 non-bracket characters, e.g. `[NH]`, `[C@@H]`, `[O-]`.
const BRACKET_PATTERN: &str = r"\[[^\[\]]{1,6}\]";

fn bracket_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(BRACKET_PATTERN).expect("Invalid bracket pattern"))
}

/// Splits a structure string into tokens and appends [`EOS`].
///
/// Bracketed runs matching [`BRACKET_PATTERN`] stay whole; every other
/// character, including a stray `[` or `]`, becomes its own token.
///
/// ```
/// use molgen::vocabulary::tokenize;
///
/// assert_eq!(tokenize("C[NH]C"), vec!["C", "[NH]", "C", "EOS"]);
/// ```
pub fn tokenize(structure: &str) -> Vec<String> {
    let mut tokens = Vec::with_capacity(structure.len() + 1);
    let mut cursor = 0;
    for m in bracket_pattern().find_iter(structure).flatten() {
        tokens.extend(structure[cursor..m.start()].chars().map(String::from));
        tokens.push(m.as_str().to_string());
        cursor = m.end();
    }
    tokens.extend(structure[cursor..].chars().map(String::from));
    tokens.push(EOS.to_string());
    tokens
}

/// Result of looking a single token up in the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenIndex {
    /// The token has this index.
    Known(usize),
    /// The token is not part of the vocabulary.
    Unknown(String),
}

impl TokenIndex {
    /// The index, if the token was known.
    #[must_use]
    pub const fn known(&self) -> Option<usize> {
        match self {
            Self::Known(index) => Some(*index),
            Self::Unknown(_) => None,
        }
    }
}

/// Ordered token set with contiguous indices.
///
/// Non-reserved tokens are kept sorted, followed by [`EOS`] and [`GO`]. Built
/// once, then shared by reference with the corpus loader and the loops.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    additional: BTreeSet<String>,
    tokens: Vec<String>,
    index: HashMap<String, usize>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    /// A vocabulary holding only the reserved tokens.
    #[must_use]
    pub fn new() -> Self {
        let mut vocabulary = Self {
            additional: BTreeSet::new(),
            tokens: Vec::new(),
            index: HashMap::new(),
        };
        vocabulary.rebuild();
        vocabulary
    }

    /// Builds a vocabulary from an iterator of tokens.
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocabulary = Self::new();
        vocabulary.add_characters(tokens);
        vocabulary
    }

    /// Reads a vocabulary file: whitespace-separated tokens, usually one per line.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| MolgenError::io(path, e))?;
        let vocabulary = Self::from_tokens(text.split_whitespace());
        log::info!(
            "Loaded vocabulary from {}: {} tokens",
            path.display(),
            vocabulary.len()
        );
        Ok(vocabulary)
    }

    /// Adds tokens and rebuilds both maps.
    ///
    /// Reserved tokens in the input are ignored since they are always present.
    /// Adding a set that is already contained leaves every index unchanged.
    pub fn add_characters<I, S>(&mut self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for token in tokens {
            let token = token.into();
            if !RESERVED.contains(&token.as_str()) {
                self.additional.insert(token);
            }
        }
        self.rebuild();
    }

    fn rebuild(&mut self) {
        self.tokens = self
            .additional
            .iter()
            .cloned()
            .chain(RESERVED.iter().map(|t| (*t).to_string()))
            .collect();
        self.index = self
            .tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
    }

    /// Number of tokens, reserved ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Never true: the reserved tokens are always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// All tokens in index order.
    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Index of [`EOS`].
    #[must_use]
    pub fn eos(&self) -> usize {
        self.index[EOS]
    }

    /// Index of [`GO`].
    #[must_use]
    pub fn go(&self) -> usize {
        self.index[GO]
    }

    /// Index of `token`, if present.
    #[must_use]
    pub fn index_of(&self, token: &str) -> Option<usize> {
        self.index.get(token).copied()
    }

    /// Token at `index`, if in range.
    #[must_use]
    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }

    /// Maps each token to its index, reporting unknown tokens explicitly.
    pub fn encode<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<TokenIndex> {
        tokens
            .iter()
            .map(|t| {
                let t = t.as_ref();
                self.index_of(t)
                    .map_or_else(|| TokenIndex::Unknown(t.to_string()), TokenIndex::Known)
            })
            .collect()
    }

    /// Maps each token to its index, failing with the first unknown token.
    pub fn encode_strict<S: AsRef<str>>(&self, tokens: &[S]) -> std::result::Result<Vec<usize>, String> {
        tokens
            .iter()
            .map(|t| {
                let t = t.as_ref();
                self.index_of(t).ok_or_else(|| t.to_string())
            })
            .collect()
    }

    /// Tokenizes then strictly encodes a structure string.
    pub fn encode_structure(&self, structure: &str) -> std::result::Result<Vec<usize>, String> {
        self.encode_strict(&tokenize(structure))
    }

    /// Concatenates tokens up to, not including, the first [`EOS`].
    ///
    /// A slice without [`EOS`] is decoded to its end, which is how sequences
    /// truncated at the length ceiling are handled. Out-of-range indices are
    /// dropped.
    #[must_use]
    pub fn decode(&self, indices: &[usize]) -> String {
        let eos = self.eos();
        indices
            .iter()
            .take_while(|&&i| i != eos)
            .filter_map(|&i| self.token(i))
            .collect()
    }

    /// Writes the non-reserved tokens, one per line, in index order.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut file = fs::File::create(path).map_err(|e| MolgenError::io(path, e))?;
        for token in &self.additional {
            writeln!(file, "{token}").map_err(|e| MolgenError::io(path, e))?;
        }
        Ok(())
    }
}

//! Validity checks applied to decoded structures.

use std::collections::HashSet;

/// Decides whether a decoded string denotes a well-formed structure.
///
/// A `false` answer is an ordinary outcome: callers count and skip it.
pub trait ValidityOracle {
    /// True if `structure` is acceptable.
    fn is_valid(&self, structure: &str) -> bool;
}

impl<F: Fn(&str) -> bool> ValidityOracle for F {
    fn is_valid(&self, structure: &str) -> bool {
        self(structure)
    }
}

/// Syntactic SMILES check.
///
/// Accepts strings built from organic-subset atoms, bracket atoms, bonds,
/// branches, ring closures and `.` separators, where branches are balanced
/// and non-empty, ring closures are paired and no bond dangles. It does not
/// check valences or aromaticity, which need a chemistry toolkit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmilesSyntax;

const ORGANIC: &[char] = &['B', 'C', 'N', 'O', 'P', 'S', 'F', 'I', 'b', 'c', 'n', 'o', 'p', 's', '*'];
const BONDS: &[char] = &['-', '=', '#', '$', ':', '/', '\\'];

impl ValidityOracle for SmilesSyntax {
    fn is_valid(&self, structure: &str) -> bool {
        check_smiles(structure).is_some()
    }
}

#[derive(Default)]
struct Parser {
    atoms: usize,
    /// An atom is available to bond to.
    anchored: bool,
    pending_bond: bool,
    /// One entry per open branch: whether it has content yet.
    branches: Vec<bool>,
    open_rings: HashSet<u32>,
}

impl Parser {
    fn atom(&mut self) {
        self.atoms += 1;
        self.anchored = true;
        self.pending_bond = false;
        if let Some(top) = self.branches.last_mut() {
            *top = true;
        }
    }

    fn ring(&mut self, label: u32) -> Option<()> {
        if !self.anchored {
            return None;
        }
        if !self.open_rings.remove(&label) {
            self.open_rings.insert(label);
        }
        self.pending_bond = false;
        Some(())
    }
}

fn check_smiles(structure: &str) -> Option<()> {
    let mut parser = Parser::default();
    let mut chars = structure.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '[' => {
                let mut inner = String::new();
                loop {
                    match chars.next()? {
                        ']' => break,
                        '[' => return None,
                        other => inner.push(other),
                    }
                }
                if !inner.chars().any(char::is_alphabetic) && !inner.contains('*') {
                    return None;
                }
                parser.atom();
            }
            'C' if chars.peek() == Some(&'l') => {
                chars.next();
                parser.atom();
            }
            'B' if chars.peek() == Some(&'r') => {
                chars.next();
                parser.atom();
            }
            c if ORGANIC.contains(&c) => parser.atom(),
            c if BONDS.contains(&c) => {
                if !parser.anchored || parser.pending_bond {
                    return None;
                }
                parser.pending_bond = true;
                if let Some(top) = parser.branches.last_mut() {
                    *top = true;
                }
            }
            c if c.is_ascii_digit() => parser.ring(c.to_digit(10)?)?,
            '%' => {
                let tens = chars.next()?.to_digit(10)?;
                let ones = chars.next()?.to_digit(10)?;
                parser.ring(10 + tens * 10 + ones)?;
            }
            '(' => {
                if !parser.anchored || parser.pending_bond {
                    return None;
                }
                parser.branches.push(false);
            }
            ')' => {
                let had_content = parser.branches.pop()?;
                if !had_content || parser.pending_bond {
                    return None;
                }
            }
            '.' => {
                if !parser.anchored || parser.pending_bond || !parser.branches.is_empty() {
                    return None;
                }
                parser.anchored = false;
            }
            _ => return None,
        }
    }

    let complete = parser.atoms > 0
        && parser.anchored
        && !parser.pending_bond
        && parser.branches.is_empty()
        && parser.open_rings.is_empty();
    complete.then_some(())
}

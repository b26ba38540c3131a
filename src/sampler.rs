//! Sampling loop: draw, decode, validity-filter.

use std::collections::HashSet;

use rand::Rng;

use crate::error::{MolgenError, Result};
use crate::model::GenerativeModel;
use crate::oracle::ValidityOracle;
use crate::vocabulary::Vocabulary;

/// How many structures to draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Draw this many sequences in one call, drop exact duplicates, keep the valid ones.
    FixedCount(usize),
    /// Draw one sequence at a time until `target` valid structures are collected.
    /// Duplicates are kept.
    UntilValid {
        /// Number of valid structures wanted.
        target: usize,
        /// Give up after this many draws.
        max_draws: Option<usize>,
    },
}

impl SamplingMode {
    /// Number of structures asked for.
    #[must_use]
    pub const fn requested(&self) -> usize {
        match *self {
            Self::FixedCount(n) | Self::UntilValid { target: n, .. } => n,
        }
    }
}

/// Counters reported after a sampling run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplingReport {
    /// Sequences or valid structures asked for.
    pub requested: usize,
    /// Sequences drawn from the model.
    pub draws: usize,
    /// Exact duplicate sequences dropped before decoding.
    pub duplicates: usize,
    /// Structures accepted by the oracle.
    pub valid: usize,
    /// Structures rejected by the oracle.
    pub rejected: usize,
}

impl SamplingReport {
    /// Share of draws that produced an accepted structure.
    #[must_use]
    pub fn yield_rate(&self) -> f32 {
        if self.draws == 0 {
            0.0
        } else {
            self.valid as f32 / self.draws as f32
        }
    }
}

/// Accepted structures plus the counters of the run that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleOutcome {
    /// Decoded structures accepted by the oracle, in draw order.
    pub accepted: Vec<String>,
    /// Counters.
    pub report: SamplingReport,
}

/// Samples from `model` according to `mode` and keeps what `oracle` accepts.
pub fn sample_valid<M, O, R>(
    model: &M,
    vocabulary: &Vocabulary,
    oracle: &O,
    mode: SamplingMode,
    rng: &mut R,
) -> Result<SampleOutcome>
where
    M: GenerativeModel,
    O: ValidityOracle + ?Sized,
    R: Rng,
{
    let mut outcome = SampleOutcome {
        accepted: Vec::new(),
        report: SamplingReport {
            requested: mode.requested(),
            ..SamplingReport::default()
        },
    };

    match mode {
        SamplingMode::FixedCount(n) => {
            let sampled = model.sample(rng, n)?;
            outcome.report.draws = sampled.sequences.len();
            let mut seen = HashSet::with_capacity(sampled.sequences.len());
            for sequence in &sampled.sequences {
                if !seen.insert(sequence.as_slice()) {
                    outcome.report.duplicates += 1;
                    continue;
                }
                judge(vocabulary, oracle, sequence, &mut outcome);
            }
        }
        SamplingMode::UntilValid { target, max_draws } => {
            if target > 0 && max_draws == Some(0) {
                return Err(MolgenError::Config(
                    "max_draws must allow at least one draw".into(),
                ));
            }
            while outcome.report.valid < target {
                if max_draws.is_some_and(|limit| outcome.report.draws >= limit) {
                    log::warn!(
                        "Stopped after {} draws with {} of {target} valid structures",
                        outcome.report.draws,
                        outcome.report.valid
                    );
                    break;
                }
                let sampled = model.sample(rng, 1)?;
                outcome.report.draws += 1;
                if let Some(sequence) = sampled.sequences.first() {
                    judge(vocabulary, oracle, sequence, &mut outcome);
                }
            }
        }
    }

    log::info!(
        "Sampled {} sequences: {} valid, {} rejected, {} duplicates",
        outcome.report.draws,
        outcome.report.valid,
        outcome.report.rejected,
        outcome.report.duplicates
    );
    Ok(outcome)
}

fn judge<O: ValidityOracle + ?Sized>(
    vocabulary: &Vocabulary,
    oracle: &O,
    sequence: &[usize],
    outcome: &mut SampleOutcome,
) {
    let structure = vocabulary.decode(sequence);
    if oracle.is_valid(&structure) {
        outcome.report.valid += 1;
        outcome.accepted.push(structure);
    } else {
        outcome.report.rejected += 1;
    }
}

/// Fraction of `n` fresh samples the oracle accepts. Used for progress reports.
pub fn fraction_valid<M, O, R>(
    model: &M,
    vocabulary: &Vocabulary,
    oracle: &O,
    n: usize,
    rng: &mut R,
) -> Result<f32>
where
    M: GenerativeModel,
    O: ValidityOracle + ?Sized,
    R: Rng,
{
    if n == 0 {
        return Ok(0.0);
    }
    let sampled = model.sample(rng, n)?;
    let valid = sampled
        .sequences
        .iter()
        .filter(|s| oracle.is_valid(&vocabulary.decode(s)))
        .count();
    Ok(valid as f32 / sampled.sequences.len().max(1) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::Batch;
    use crate::model::Sampled;
    use rand::{rngs::StdRng, SeedableRng};
    use std::cell::Cell;

    /// Emits a fixed cycle of structures, one per call to `sample`.
    struct Scripted {
        sequences: Vec<Vec<usize>>,
        next: Cell<usize>,
    }

    impl Scripted {
        fn new(vocabulary: &Vocabulary, structures: &[&str]) -> Self {
            Self {
                sequences: structures
                    .iter()
                    .map(|s| vocabulary.encode_structure(s).unwrap())
                    .collect(),
                next: Cell::new(0),
            }
        }
    }

    impl GenerativeModel for Scripted {
        fn likelihood(&self, batch: &Batch) -> Result<Vec<f32>> {
            Ok(vec![0.0; batch.rows()])
        }

        fn sample<R: Rng>(&self, _rng: &mut R, n: usize) -> Result<Sampled> {
            let mut sampled = Sampled::default();
            for _ in 0..n {
                let i = self.next.get();
                self.next.set(i + 1);
                sampled
                    .sequences
                    .push(self.sequences[i % self.sequences.len()].clone());
                sampled.log_probs.push(-1.0);
            }
            Ok(sampled)
        }
    }

    #[test]
    fn test_until_valid_every_third() {
        let vocabulary = Vocabulary::from_tokens(["C", "N", "O"]);
        let model = Scripted::new(&vocabulary, &["C", "N", "O"]);
        let calls = Cell::new(0_usize);
        let every_third = |_: &str| {
            calls.set(calls.get() + 1);
            calls.get() % 3 == 0
        };

        let outcome = sample_valid(
            &model,
            &vocabulary,
            &every_third,
            SamplingMode::UntilValid { target: 5, max_draws: None },
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();

        assert_eq!(outcome.report.draws, 15);
        assert_eq!(outcome.report.valid, 5);
        assert_eq!(outcome.report.rejected, 10);
        assert_eq!(outcome.accepted, vec!["O"; 5]);
        assert!((outcome.report.yield_rate() - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_until_valid_respects_draw_limit() {
        let vocabulary = Vocabulary::from_tokens(["C"]);
        let model = Scripted::new(&vocabulary, &["C"]);
        let never = |_: &str| false;
        let outcome = sample_valid(
            &model,
            &vocabulary,
            &never,
            SamplingMode::UntilValid { target: 2, max_draws: Some(7) },
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        assert_eq!(outcome.report.draws, 7);
        assert!(outcome.accepted.is_empty());
    }

    #[test]
    fn test_fixed_count_drops_duplicates() {
        let vocabulary = Vocabulary::from_tokens(["C", "N", "(", ")"]);
        let model = Scripted::new(&vocabulary, &["CC", "CN", "CC", "C(", "CN"]);
        let outcome = sample_valid(
            &model,
            &vocabulary,
            &crate::oracle::SmilesSyntax,
            SamplingMode::FixedCount(5),
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        assert_eq!(
            outcome.report,
            SamplingReport {
                requested: 5,
                draws: 5,
                duplicates: 2,
                valid: 2,
                rejected: 1,
            }
        );
        assert_eq!(outcome.accepted, vec!["CC", "CN"]);
    }

    #[test]
    fn test_fraction_valid() {
        let vocabulary = Vocabulary::from_tokens(["C", "("]);
        let model = Scripted::new(&vocabulary, &["CC", "C("]);
        let fraction = fraction_valid(
            &model,
            &vocabulary,
            &crate::oracle::SmilesSyntax,
            4,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        assert!((fraction - 0.5).abs() < 1e-6);
    }
}

//! Consensus scoring over the revealed cards.
//!
//! Display-only: nothing in the protocol depends on these results.
//!
//! ```text
//! votes < 2                         → insufficient
//! all identical                     → perfect
//! ≥80% numeric, range == 0          → perfect
//!               range ≤ 2           → close
//!               range ≥ 10          → divergent
//! top card held by >60% of voters   → majority
//! otherwise                         → none
//! ```

use std::fmt;

use crate::types::VoteValue;

/// Share of votes that must be numeric before the spread is judged (4/5).
const NUMERIC_SHARE: (usize, usize) = (4, 5);

/// Share a single card needs to count as a majority (3/5, strictly exceeded).
const MAJORITY_SHARE: (usize, usize) = (3, 5);

const CLOSE_RANGE: f64 = 2.0;
const DIVERGENT_RANGE: f64 = 10.0;

/// Qualitative agreement of a set of votes.
#[derive(Debug, Clone, PartialEq)]
pub enum Consensus {
    /// Fewer than two votes.
    Insufficient,
    /// Everyone agrees.
    Perfect,
    /// Numeric votes within a small spread.
    Close { range: f64 },
    /// Numeric votes far apart.
    Divergent { range: f64 },
    /// One card held by most voters.
    Majority {
        value: VoteValue,
        count: usize,
        total: usize,
    },
    /// Discussion needed.
    None,
}

impl Consensus {
    /// Short machine name of the class.
    pub fn class(&self) -> &'static str {
        match self {
            Consensus::Insufficient => "insufficient",
            Consensus::Perfect => "perfect",
            Consensus::Close { .. } => "close",
            Consensus::Divergent { .. } => "divergent",
            Consensus::Majority { .. } => "majority",
            Consensus::None => "none",
        }
    }

    pub fn is_highlighted(&self) -> bool {
        matches!(self, Consensus::Perfect)
    }

    /// Human readable summary.
    pub fn message(&self) -> String {
        match self {
            Consensus::Insufficient => "Not enough votes".to_string(),
            Consensus::Perfect => "Perfect consensus!".to_string(),
            Consensus::Close { range } => format!("Close consensus (range {})", format_number(*range)),
            Consensus::Divergent { range } => format!("Wide spread (range {})", format_number(*range)),
            Consensus::Majority { value, count, total } => {
                format!("Majority: {} ({}/{})", value, count, total)
            }
            Consensus::None => "Discussion needed".to_string(),
        }
    }
}

impl fmt::Display for Consensus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Classify a set of votes.
pub fn analyze(votes: &[VoteValue]) -> Consensus {
    let total = votes.len();
    if total < 2 {
        return Consensus::Insufficient;
    }

    if votes.iter().all(|v| *v == votes[0]) {
        return Consensus::Perfect;
    }

    let numeric: Vec<f64> = votes.iter().filter_map(|v| v.as_f64()).collect();
    if numeric.len() * NUMERIC_SHARE.1 >= total * NUMERIC_SHARE.0 {
        let min = numeric.iter().copied().fold(f64::INFINITY, f64::min);
        let max = numeric.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        if range == 0.0 {
            return Consensus::Perfect;
        }
        if range <= CLOSE_RANGE {
            return Consensus::Close { range };
        }
        if range >= DIVERGENT_RANGE {
            return Consensus::Divergent { range };
        }
    }

    // Ties go to the card that comes first in the deck.
    let mut counts = [0usize; VoteValue::DECK.len()];
    for vote in votes {
        counts[deck_position(*vote)] += 1;
    }
    let (position, count) = counts
        .iter()
        .copied()
        .enumerate()
        .fold((0, 0), |best, (i, c)| if c > best.1 { (i, c) } else { best });

    if count * MAJORITY_SHARE.1 > total * MAJORITY_SHARE.0 {
        return Consensus::Majority {
            value: VoteValue::DECK[position],
            count,
            total,
        };
    }

    Consensus::None
}

/// Mean of the numeric votes rounded to one decimal, `None` when there are none.
pub fn average(votes: &[VoteValue]) -> Option<f64> {
    let numeric: Vec<f64> = votes.iter().filter_map(|v| v.as_f64()).collect();
    if numeric.is_empty() {
        return None;
    }
    let mean = numeric.iter().sum::<f64>() / numeric.len() as f64;
    Some((mean * 10.0).round() / 10.0)
}

/// [`average`] formatted with exactly one decimal.
pub fn format_average(votes: &[VoteValue]) -> Option<String> {
    average(votes).map(|avg| format!("{:.1}", avg))
}

fn deck_position(vote: VoteValue) -> usize {
    VoteValue::DECK
        .iter()
        .position(|v| *v == vote)
        .unwrap_or(VoteValue::DECK.len() - 1)
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

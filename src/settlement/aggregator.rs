//! Slip aggregation: folds per-match grades into a slip-level decision.
//!
//! Two wrong predictions anywhere on a slip lose it immediately. Otherwise
//! the slip is decided only once every counted match has a result.

use std::collections::BTreeMap;
use std::fmt;

use crate::types::{Choice, Slip, SlipStatus};

/// Number of incorrect predictions that loses a slip outright.
pub const MAX_INCORRECT: u32 = 2;

/// Counters over a slip's full choice map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlipTally {
    pub total_matches: u32,
    pub matches_with_results: u32,
    pub incorrect_predictions: u32,
}

impl fmt::Display for SlipTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} matches graded, {} incorrect",
            self.matches_with_results, self.total_matches, self.incorrect_predictions,
        )
    }
}

/// What should happen to a slip's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlipDecision {
    /// Not decided yet; no status mutation.
    Pending,
    /// The slip reaches a terminal status.
    Settled { status: SlipStatus, incorrect_predictions: u32 },
    /// The slip was already terminal and was not evaluated.
    AlreadyTerminal,
}

impl SlipTally {
    /// Count matches, graded matches and wrong predictions. A match counts
    /// as soon as it carries a bet type, even one whose value is malformed
    /// and will never be graded.
    pub fn from_choices(choices: &BTreeMap<String, Choice>) -> Self {
        let mut tally = SlipTally::default();

        for choice in choices.values().filter(|c| !c.selections.is_empty()) {
            tally.total_matches += 1;
            if choice.has_result() {
                tally.matches_with_results += 1;
                tally.incorrect_predictions += choice.incorrect_count();
            }
        }

        tally
    }

    pub fn decide(&self) -> SlipDecision {
        if self.incorrect_predictions >= MAX_INCORRECT {
            return SlipDecision::Settled {
                status: SlipStatus::Lost,
                incorrect_predictions: self.incorrect_predictions,
            };
        }

        if self.total_matches > 0 && self.matches_with_results == self.total_matches {
            let status = if self.incorrect_predictions == 0 {
                SlipStatus::Won
            } else {
                SlipStatus::Lost
            };
            return SlipDecision::Settled {
                status,
                incorrect_predictions: self.incorrect_predictions,
            };
        }

        SlipDecision::Pending
    }
}

/// Evaluate a slip. Terminal slips are never re-evaluated.
pub fn evaluate(slip: &Slip) -> (SlipTally, SlipDecision) {
    if slip.status.is_terminal() {
        return (SlipTally::default(), SlipDecision::AlreadyTerminal);
    }
    let tally = SlipTally::from_choices(&slip.choices);
    (tally, tally.decide())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

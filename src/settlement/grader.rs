//! Choice grading: one user choice against a match's outcome vector.
//!
//! Selections are stored as the raw strings the user submitted. They are
//! parsed into a typed [`Selection`] here; a value that does not parse is
//! reported back as malformed and left ungraded rather than failing the
//! whole slip.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::types::{BetType, Choice, Grade, Outcome, OutcomeVector, SettlementError};

const BTTS_YES: &str = "Wi";
const BTTS_NO: &str = "Non";

/// A parsed selection for one bet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Result(Outcome),
    DoubleChance(Outcome, Outcome),
    BothTeamsScore(bool),
    /// `over == false` means under.
    Total { over: bool, threshold: Decimal },
    HalfTime(Outcome),
    SecondHalf(Outcome),
}

impl Selection {
    /// Parse the raw value selected for `bet_type`.
    pub fn parse(bet_type: BetType, raw: &str) -> Result<Self, SettlementError> {
        let malformed = || SettlementError::MalformedChoice {
            bet_type,
            value: raw.to_string(),
        };
        let value = raw.trim();

        match bet_type {
            BetType::Resultat => single_symbol(value).map(Selection::Result).ok_or_else(malformed),
            BetType::Mt1 => single_symbol(value).map(Selection::HalfTime).ok_or_else(malformed),
            BetType::Mt2 => single_symbol(value).map(Selection::SecondHalf).ok_or_else(malformed),
            BetType::DoubleChance => {
                let symbols: Vec<Outcome> = value.chars().filter_map(Outcome::from_symbol).collect();
                if value.chars().count() != 2 || symbols.len() != 2 {
                    return Err(malformed());
                }
                Ok(Selection::DoubleChance(symbols[0], symbols[1]))
            }
            BetType::Btts => {
                match value {
                    BTTS_YES => Ok(Selection::BothTeamsScore(true)),
                    BTTS_NO => Ok(Selection::BothTeamsScore(false)),
                    _ => Err(malformed()),
                }
            }
            BetType::Total => {
                let over = match value.chars().next() {
                    Some('<') => false,
                    Some('>') => true,
                    _ => return Err(malformed()),
                };
                let threshold = Decimal::from_str(value[1..].trim()).map_err(|_| malformed())?;
                Ok(Selection::Total { over, threshold })
            }
        }
    }

    /// Grade this selection. `None` when the outcome needed is unknown
    /// (no usable half-time score).
    pub fn grade(&self, outcome: &OutcomeVector) -> Option<Grade> {
        let grade = match *self {
            Selection::Result(pick) => Grade {
                actual: outcome.final_result.symbol().to_string(),
                correct: pick == outcome.final_result,
            },
            Selection::DoubleChance(a, b) => Grade {
                actual: outcome.final_result.symbol().to_string(),
                correct: a == outcome.final_result || b == outcome.final_result,
            },
            Selection::BothTeamsScore(pick) => Grade {
                actual: if outcome.both_teams_scored { BTTS_YES } else { BTTS_NO }.to_string(),
                correct: pick == outcome.both_teams_scored,
            },
            Selection::Total { over, threshold } => {
                let goals = Decimal::from(outcome.total_goals);
                Grade {
                    actual: outcome.total_goals.to_string(),
                    correct: if over { goals > threshold } else { goals < threshold },
                }
            }
            Selection::HalfTime(pick) => {
                let actual = outcome.half_time_result?;
                Grade { actual: actual.symbol().to_string(), correct: pick == actual }
            }
            Selection::SecondHalf(pick) => {
                let actual = outcome.second_half_result?;
                Grade { actual: actual.symbol().to_string(), correct: pick == actual }
            }
        };
        Some(grade)
    }
}

fn single_symbol(value: &str) -> Option<Outcome> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Outcome::from_symbol(c),
        _ => None,
    }
}

/// Result of grading one choice.
#[derive(Debug, Default)]
pub struct ChoiceGrading {
    /// One entry per selected, well-formed, gradeable bet type.
    pub grades: BTreeMap<BetType, Grade>,
    /// Selections that could not be parsed. Never counted as incorrect.
    pub malformed: Vec<SettlementError>,
}

/// Grade every bet type the user selected on this choice. Bet types that
/// were not selected are never synthesised.
pub fn grade_choice(choice: &Choice, outcome: &OutcomeVector) -> ChoiceGrading {
    let mut grading = ChoiceGrading::default();

    for (&bet_type, raw) in &choice.selections {
        match Selection::parse(bet_type, raw) {
            Ok(selection) => {
                if let Some(grade) = selection.grade(outcome) {
                    grading.grades.insert(bet_type, grade);
                }
            }
            Err(e) => grading.malformed.push(e),
        }
    }

    grading
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

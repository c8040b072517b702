//! Shared types for the CHANPYON settlement engine.
//!
//! These types form the data model used across all modules: slips and
//! their per-match choices, match results and the outcome vector derived
//! from a scoreline. Settlement, storage and the HTTP boundary all depend
//! on them without depending on each other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A 1X2 result: home win, draw or away win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    #[serde(rename = "1")]
    Home,
    #[serde(rename = "X")]
    Draw,
    #[serde(rename = "2")]
    Away,
}

impl Outcome {
    /// Compare two goal counts.
    pub fn from_goals(home: u32, away: u32) -> Self {
        match home.cmp(&away) {
            std::cmp::Ordering::Greater => Outcome::Home,
            std::cmp::Ordering::Less => Outcome::Away,
            std::cmp::Ordering::Equal => Outcome::Draw,
        }
    }

    /// The betting symbol used on slips: `1`, `X` or `2`.
    pub fn symbol(&self) -> char {
        match self {
            Outcome::Home => '1',
            Outcome::Draw => 'X',
            Outcome::Away => '2',
        }
    }

    /// Parse a betting symbol. Matching is exact.
    pub fn from_symbol(c: char) -> Option<Self> {
        match c {
            '1' => Some(Outcome::Home),
            'X' => Some(Outcome::Draw),
            '2' => Some(Outcome::Away),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Everything that can be scored from a final (and optional half-time)
/// scoreline. Derived, never stored on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeVector {
    pub final_result: Outcome,
    pub total_goals: u32,
    pub both_teams_scored: bool,
    /// `None` when no usable half-time score was supplied.
    pub half_time_result: Option<Outcome>,
    /// Result of the goals scored after the break. `None` whenever
    /// `half_time_result` is `None` or the half-time score is inconsistent
    /// with the final score.
    pub second_half_result: Option<Outcome>,
}

impl fmt::Display for OutcomeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ht = self
            .half_time_result
            .map(|o| o.symbol().to_string())
            .unwrap_or_else(|| "?".to_string());
        write!(
            f,
            "result={} goals={} btts={} ht={}",
            self.final_result, self.total_goals, self.both_teams_scored, ht,
        )
    }
}

// ---------------------------------------------------------------------------
// Bet types
// ---------------------------------------------------------------------------

/// A wager category a user can select for one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BetType {
    /// Full-time 1X2.
    Resultat,
    /// Two of the three 1X2 symbols.
    DoubleChance,
    /// Both teams to score (`Wi` / `Non`).
    Btts,
    /// Total goals over/under a decimal threshold.
    Total,
    /// Half-time 1X2.
    Mt1,
    /// Second-half 1X2.
    Mt2,
}

impl BetType {
    pub const ALL: &'static [BetType] = &[
        BetType::Resultat,
        BetType::DoubleChance,
        BetType::Btts,
        BetType::Total,
        BetType::Mt1,
        BetType::Mt2,
    ];

    /// Key used for this bet type in slip documents and the database.
    pub fn key(&self) -> &'static str {
        match self {
            BetType::Resultat => "resultat",
            BetType::DoubleChance => "doublechance",
            BetType::Btts => "btts",
            BetType::Total => "total",
            BetType::Mt1 => "mt1",
            BetType::Mt2 => "mt2",
        }
    }
}

impl fmt::Display for BetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

impl std::str::FromStr for BetType {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BetType::ALL
            .iter()
            .copied()
            .find(|b| b.key() == s)
            .ok_or_else(|| SettlementError::InvalidInput(format!("Unknown bet type: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Slips
// ---------------------------------------------------------------------------

/// Lifecycle status of a slip. Anything but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlipStatus {
    Pending,
    Won,
    Lost,
}

impl SlipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlipStatus::Pending => "pending",
            SlipStatus::Won => "won",
            SlipStatus::Lost => "lost",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != SlipStatus::Pending
    }
}

impl fmt::Display for SlipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SlipStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SlipStatus::Pending),
            "won" => Ok(SlipStatus::Won),
            "lost" => Ok(SlipStatus::Lost),
            _ => Err(SettlementError::Storage(format!("Unknown slip status: {s}"))),
        }
    }
}

/// The graded value of one selected bet type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grade {
    /// What actually happened, in the same notation as the selection
    /// (`1`, `Wi`, `3`, ...).
    pub actual: String,
    pub correct: bool,
}

/// One match's predictions inside a slip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Choice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_name: Option<String>,
    /// Raw user selections, exactly as submitted.
    pub selections: BTreeMap<BetType, String>,
    /// Grades written by settlement. Only ever holds selected bet types.
    #[serde(default)]
    pub grades: BTreeMap<BetType, Grade>,
}

impl Choice {
    /// Whether at least one selected bet type has been graded.
    pub fn has_result(&self) -> bool {
        !self.grades.is_empty()
    }

    /// Number of graded bet types that were wrong.
    pub fn incorrect_count(&self) -> u32 {
        self.grades.values().filter(|g| !g.correct).count() as u32
    }
}

/// A user's prediction ticket ("fiche").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slip {
    pub id: String,
    pub owner: String,
    pub status: SlipStatus,
    pub incorrect_predictions: u32,
    /// Keyed by match id.
    pub choices: BTreeMap<String, Choice>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped by the store on every settlement write to this slip.
    #[serde(default)]
    pub version: u64,
}

impl fmt::Display for Slip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slip {} ({}) status={} matches={} incorrect={}",
            self.id,
            self.owner,
            self.status,
            self.choices.len(),
            self.incorrect_predictions,
        )
    }
}

/// A slip as submitted by a user, before it is stored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSlip {
    #[serde(default)]
    pub id: Option<String>,
    pub owner: String,
    pub choices: BTreeMap<String, NewChoice>,
}

/// A submitted choice: an optional match name plus bet-type keys mapped
/// to the selected values, e.g. `{"matchName": "...", "resultat": "1"}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChoice {
    #[serde(default)]
    pub match_name: Option<String>,
    #[serde(flatten)]
    pub selections: BTreeMap<String, String>,
}

impl NewSlip {
    /// Turn a submission into a fresh pending slip. A missing id gets a
    /// generated one.
    pub fn into_slip(self) -> Result<Slip, SettlementError> {
        let owner = self.owner.trim().to_string();
        if owner.is_empty() {
            return Err(SettlementError::InvalidInput("owner is required".into()));
        }
        if self.choices.is_empty() {
            return Err(SettlementError::InvalidInput("a slip needs at least one match".into()));
        }

        let id = self
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let mut choices = BTreeMap::new();
        for (match_id, new_choice) in self.choices {
            choices.insert(match_id, new_choice.into_choice()?);
        }

        Ok(Slip {
            id,
            owner,
            status: SlipStatus::Pending,
            incorrect_predictions: 0,
            choices,
            created_at: Utc::now(),
            completed_at: None,
            version: 0,
        })
    }
}

impl NewChoice {
    /// Resolve selection keys to bet types. Unknown keys are rejected.
    pub fn into_choice(self) -> Result<Choice, SettlementError> {
        let mut selections = BTreeMap::new();
        for (key, value) in self.selections {
            let bet_type: BetType = key.parse()?;
            selections.insert(bet_type, value);
        }
        Ok(Choice {
            match_name: self.match_name,
            selections,
            grades: BTreeMap::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Match results
// ---------------------------------------------------------------------------

/// The canonical result of one finished match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub match_id: String,
    pub score_home: u32,
    pub score_away: u32,
    pub ht_score_home: Option<u32>,
    pub ht_score_away: Option<u32>,
    pub outcome: OutcomeVector,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}-{}", self.match_id, self.score_home, self.score_away)?;
        if let (Some(h), Some(a)) = (self.ht_score_home, self.ht_score_away) {
            write!(f, " (HT {h}-{a})")?;
        }
        write!(f, " [{}]", self.outcome)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain errors surfaced by the settlement engine.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Atomic commit failed: {0}")]
    CommitFailed(String),

    #[error("Malformed {bet_type} selection: {value:?}")]
    MalformedChoice { bet_type: BetType, value: String },

    #[error("Storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_from_goals() {
        assert_eq!(Outcome::from_goals(2, 1), Outcome::Home);
        assert_eq!(Outcome::from_goals(0, 3), Outcome::Away);
        assert_eq!(Outcome::from_goals(1, 1), Outcome::Draw);
    }

    #[test]
    fn test_outcome_symbols() {
        for o in [Outcome::Home, Outcome::Draw, Outcome::Away] {
            assert_eq!(Outcome::from_symbol(o.symbol()), Some(o));
        }
        assert_eq!(Outcome::from_symbol('x'), None);
        assert_eq!(Outcome::from_symbol('3'), None);
    }

    #[test]
    fn test_outcome_vector_json_uses_symbols() {
        let v = OutcomeVector {
            final_result: Outcome::Draw,
            total_goals: 2,
            both_teams_scored: true,
            half_time_result: Some(Outcome::Home),
            second_half_result: None,
        };
        let json = serde_json::to_value(v).unwrap();
        assert_eq!(json["finalResult"], "X");
        assert_eq!(json["halfTimeResult"], "1");
        assert!(json["secondHalfResult"].is_null());
        assert_eq!(serde_json::from_value::<OutcomeVector>(json).unwrap(), v);
    }

    #[test]
    fn test_bet_type_from_str() {
        assert_eq!("doublechance".parse::<BetType>().unwrap(), BetType::DoubleChance);
        assert_eq!("mt1".parse::<BetType>().unwrap(), BetType::Mt1);
        assert!("corners".parse::<BetType>().is_err());
    }

    #[test]
    fn test_bet_type_serializes_as_key() {
        for b in BetType::ALL {
            let json = serde_json::to_string(b).unwrap();
            assert_eq!(json, format!("\"{}\"", b.key()));
        }
    }

    #[test]
    fn test_slip_status_terminal() {
        assert!(!SlipStatus::Pending.is_terminal());
        assert!(SlipStatus::Won.is_terminal());
        assert!(SlipStatus::Lost.is_terminal());
        assert_eq!("lost".parse::<SlipStatus>().unwrap(), SlipStatus::Lost);
    }

    #[test]
    fn test_choice_counts() {
        let mut choice = Choice::default();
        assert!(!choice.has_result());
        choice.grades.insert(BetType::Resultat, Grade { actual: "1".into(), correct: true });
        choice.grades.insert(BetType::Btts, Grade { actual: "Wi".into(), correct: false });
        assert!(choice.has_result());
        assert_eq!(choice.incorrect_count(), 1);
    }

    #[test]
    fn test_new_choice_parses_flattened_selections() {
        let json = r#"{"matchName": "Racing vs Violette", "resultat": "1", "btts": "Non"}"#;
        let new: NewChoice = serde_json::from_str(json).unwrap();
        let choice = new.into_choice().unwrap();
        assert_eq!(choice.match_name.as_deref(), Some("Racing vs Violette"));
        assert_eq!(choice.selections.get(&BetType::Resultat).map(String::as_str), Some("1"));
        assert_eq!(choice.selections.get(&BetType::Btts).map(String::as_str), Some("Non"));
        assert!(choice.grades.is_empty());
    }

    #[test]
    fn test_new_choice_rejects_unknown_key() {
        let json = r#"{"corners": ">9.5"}"#;
        let new: NewChoice = serde_json::from_str(json).unwrap();
        assert!(matches!(new.into_choice(), Err(SettlementError::InvalidInput(_))));
    }

    #[test]
    fn test_new_slip_into_slip() {
        let json = r#"{"owner": "user-9", "choices": {"m1": {"resultat": "2"}, "m2": {"total": ">1.5"}}}"#;
        let new: NewSlip = serde_json::from_str(json).unwrap();
        let slip = new.into_slip().unwrap();
        assert_eq!(slip.owner, "user-9");
        assert_eq!(slip.status, SlipStatus::Pending);
        assert_eq!(slip.choices.len(), 2);
        assert!(!slip.id.is_empty());
        assert!(slip.completed_at.is_none());
    }

    #[test]
    fn test_new_slip_requires_owner_and_choices() {
        let no_owner: NewSlip =
            serde_json::from_str(r#"{"owner": " ", "choices": {"m1": {"resultat": "1"}}}"#).unwrap();
        assert!(no_owner.into_slip().is_err());
        let no_choices: NewSlip = serde_json::from_str(r#"{"owner": "u", "choices": {}}"#).unwrap();
        assert!(no_choices.into_slip().is_err());
    }

    #[test]
    fn test_error_display() {
        let err = SettlementError::MalformedChoice {
            bet_type: BetType::Total,
            value: "over".into(),
        };
        assert_eq!(err.to_string(), "Malformed total selection: \"over\"");
    }
}

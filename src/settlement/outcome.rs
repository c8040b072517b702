//! Outcome derivation: raw scoreline in, outcome vector out.
//!
//! Scores arrive from the operator form either as JSON integers or as
//! digit strings. Both are accepted; anything else is rejected before
//! any read or write happens.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::types::{Outcome, OutcomeVector, SettlementError};

/// Raw result submission as received at the boundary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSubmission {
    #[serde(default)]
    pub match_id: Option<String>,
    #[serde(default)]
    pub score_home: Option<Value>,
    #[serde(default)]
    pub score_away: Option<Value>,
    #[serde(default)]
    pub ht_score_home: Option<Value>,
    #[serde(default)]
    pub ht_score_away: Option<Value>,
}

impl ResultSubmission {
    /// Convenience constructor for callers that already hold integers.
    pub fn new(match_id: &str, home: u32, away: u32, half_time: Option<(u32, u32)>) -> Self {
        Self {
            match_id: Some(match_id.to_string()),
            score_home: Some(Value::from(home)),
            score_away: Some(Value::from(away)),
            ht_score_home: half_time.map(|(h, _)| Value::from(h)),
            ht_score_away: half_time.map(|(_, a)| Value::from(a)),
        }
    }

    /// Check the submission and extract the match id and scoreline.
    pub fn validate(&self) -> Result<(String, ScoreLine), SettlementError> {
        let match_id = self
            .match_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SettlementError::InvalidInput("matchId is required".into()))?;

        let home = parse_score("scoreHome", self.score_home.as_ref())?
            .ok_or_else(|| SettlementError::InvalidInput("scoreHome is required".into()))?;
        let away = parse_score("scoreAway", self.score_away.as_ref())?
            .ok_or_else(|| SettlementError::InvalidInput("scoreAway is required".into()))?;
        if home.checked_add(away).is_none() {
            return Err(SettlementError::InvalidInput("Total goals out of range".into()));
        }

        let ht_home = parse_score("htScoreHome", self.ht_score_home.as_ref())?;
        let ht_away = parse_score("htScoreAway", self.ht_score_away.as_ref())?;
        let half_time = match (ht_home, ht_away) {
            (Some(h), Some(a)) => Some((h, a)),
            (None, None) => None,
            _ => {
                warn!(match_id, "Only one half-time score supplied, ignoring both");
                None
            }
        };

        Ok((match_id.to_string(), ScoreLine { home, away, half_time }))
    }
}

/// A validated scoreline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreLine {
    pub home: u32,
    pub away: u32,
    pub half_time: Option<(u32, u32)>,
}

impl ScoreLine {
    /// Derive every scoreable outcome from this scoreline.
    pub fn derive(&self) -> OutcomeVector {
        let half_time_result = self.half_time.map(|(h, a)| Outcome::from_goals(h, a));

        // Second half is only meaningful if neither side lost goals after the break.
        let second_half_result = match self.half_time {
            Some((h, a)) if h <= self.home && a <= self.away => {
                Some(Outcome::from_goals(self.home - h, self.away - a))
            }
            Some((h, a)) => {
                warn!(
                    ht_home = h,
                    ht_away = a,
                    home = self.home,
                    away = self.away,
                    "Half-time score exceeds final score, second half left ungraded"
                );
                None
            }
            None => None,
        };

        OutcomeVector {
            final_result: Outcome::from_goals(self.home, self.away),
            total_goals: self.home.saturating_add(self.away),
            both_teams_scored: self.home > 0 && self.away > 0,
            half_time_result,
            second_half_result,
        }
    }
}

/// Parse one score field. `None` and JSON `null` both mean absent.
fn parse_score(field: &str, value: Option<&Value>) -> Result<Option<u32>, SettlementError> {
    let invalid = || {
        SettlementError::InvalidInput(format!("{field} must be a non-negative integer"))
    };

    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let n = n.as_u64().ok_or_else(invalid)?;
            u32::try_from(n).map(Some).map_err(|_| invalid())
        }
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            s.parse::<u32>().map(Some).map_err(|_| invalid())
        }
        Some(_) => Err(invalid()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Static match catalogue.
//!
//! The list of matches offered on slips is a JSON file maintained by hand
//! (`matches.json`). It is read on every request so edits show up without
//! a restart.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default catalogue file path.
pub const DEFAULT_MATCHES_FILE: &str = "matches.json";

/// The catalogue document.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchList {
    #[serde(default)]
    pub matches: Vec<CatalogueMatch>,
}

/// One match as listed in the catalogue.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogueMatch {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub team1: String,
    pub team2: String,
    #[serde(default)]
    pub league: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    pub datetime: String,
    #[serde(default)]
    pub result: Option<Value>,
}

/// A kick-off in the past, as shown on the admin result form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedMatch {
    pub id: String,
    pub team1: String,
    pub team2: String,
    pub league: Option<String>,
    pub country: Option<String>,
    pub datetime: String,
    pub has_result: bool,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid match id: {other}"))),
    }
}

/// Parse a catalogue kick-off time. Values without an offset are taken as UTC.
pub fn parse_kickoff(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

impl MatchList {
    /// Matches that kicked off before `now`, most recent first. `settled`
    /// holds ids that already have a stored result.
    pub fn finished(&self, now: DateTime<Utc>, settled: &HashSet<String>) -> Vec<FinishedMatch> {
        let mut finished: Vec<(DateTime<Utc>, FinishedMatch)> = self
            .matches
            .iter()
            .filter_map(|m| {
                let Some(kickoff) = parse_kickoff(&m.datetime) else {
                    warn!(match_id = %m.id, datetime = %m.datetime, "Unparseable kick-off time");
                    return None;
                };
                (kickoff < now).then(|| {
                    let entry = FinishedMatch {
                        id: m.id.clone(),
                        team1: m.team1.clone(),
                        team2: m.team2.clone(),
                        league: m.league.clone(),
                        country: m.country.clone(),
                        datetime: m.datetime.clone(),
                        has_result: m.result.as_ref().is_some_and(|r| !r.is_null())
                            || settled.contains(&m.id),
                    };
                    (kickoff, entry)
                })
            })
            .collect();

        finished.sort_by(|a, b| b.0.cmp(&a.0));
        finished.into_iter().map(|(_, m)| m).collect()
    }
}

/// Reads the catalogue file.
#[derive(Debug, Clone)]
pub struct MatchCatalogue {
    path: PathBuf,
}

impl MatchCatalogue {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    /// The raw document, passed through untouched.
    pub async fn list_matches(&self) -> Result<Value> {
        let contents = self.read().await?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    /// The typed match list.
    pub async fn load(&self) -> Result<MatchList> {
        let contents = self.read().await?;
        let list: MatchList = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        debug!(path = %self.path.display(), count = list.matches.len(), "Catalogue loaded");
        Ok(list)
    }

    /// Matches that kicked off before `now`; see [`MatchList::finished`].
    pub async fn finished_matches(
        &self,
        now: DateTime<Utc>,
        settled: &HashSet<String>,
    ) -> Result<Vec<FinishedMatch>> {
        Ok(self.load().await?.finished(now, settled))
    }

    async fn read(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! SQLite-backed slip store.
//!
//! A slip document is spread over three tables: `slips` (status, counters
//! and a version bumped by every settlement write), `slip_choices` (one row per match on the slip) and
//! `slip_bets` (one row per selected bet type, with nullable grade
//! columns). Match results live in `match_results`, with the derived
//! outcome vector kept as JSON. Settlement batches are applied inside a
//! single SQL transaction.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{SettlementBatch, SlipField, SlipStore, StaleSnapshot};
use crate::types::{BetType, Grade, MatchResult, OutcomeVector, Slip, SlipStatus};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS slips (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        incorrect_predictions INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        completed_at TEXT,
        version INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS slip_choices (
        slip_id TEXT NOT NULL REFERENCES slips(id),
        match_id TEXT NOT NULL,
        match_name TEXT,
        PRIMARY KEY (slip_id, match_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS slip_bets (
        slip_id TEXT NOT NULL,
        match_id TEXT NOT NULL,
        bet_type TEXT NOT NULL,
        selected TEXT NOT NULL,
        actual TEXT,
        correct BOOLEAN,
        PRIMARY KEY (slip_id, match_id, bet_type),
        FOREIGN KEY (slip_id, match_id) REFERENCES slip_choices(slip_id, match_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_slip_choices_match ON slip_choices(match_id)",
    "CREATE INDEX IF NOT EXISTS idx_slips_status ON slips(status)",
    r#"
    CREATE TABLE IF NOT EXISTS match_results (
        match_id TEXT PRIMARY KEY,
        score_home INTEGER NOT NULL,
        score_away INTEGER NOT NULL,
        ht_score_home INTEGER,
        ht_score_away INTEGER,
        outcome TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

/// Row filter for pending slips holding a given match (`?1`).
const PENDING_FOR_MATCH: &str =
    "s.status = 'pending' AND s.id IN (SELECT slip_id FROM slip_choices WHERE match_id = ?1)";

/// Row filter for a single slip id (`?1`).
const BY_ID: &str = "s.id = ?1";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `database_url` and ensure the schema.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .with_context(|| format!("Failed to open database: {database_url}"))?;

        let store = Self { pool };
        store.init().await?;
        info!(database_url, "Slip store ready");
        Ok(store)
    }

    /// A private in-memory database. A single connection that never
    /// expires, since the data disappears with it.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to create schema")?;
        }
        Ok(())
    }

    /// Load whole slip documents matching `filter`, reading all three
    /// tables inside one transaction so the view is consistent.
    async fn fetch_slips(&self, filter: &str, param: &str) -> Result<Vec<Slip>> {
        let mut tx = self.pool.begin().await.context("Failed to begin read")?;
        let mut slips: BTreeMap<String, Slip> = BTreeMap::new();

        let sql = format!(
            "SELECT s.id, s.owner, s.status, s.incorrect_predictions, s.created_at, s.completed_at, s.version \
             FROM slips s WHERE {filter} ORDER BY s.created_at"
        );
        {
            let mut rows = sqlx::query(&sql).bind(param).fetch(&mut *tx);
            while let Some(row) = rows.try_next().await.context("Failed to read slips")? {
                let slip = slip_from_row(&row)?;
                slips.insert(slip.id.clone(), slip);
            }
        }

        if slips.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT c.slip_id, c.match_id, c.match_name \
             FROM slip_choices c JOIN slips s ON s.id = c.slip_id WHERE {filter}"
        );
        {
            let mut rows = sqlx::query(&sql).bind(param).fetch(&mut *tx);
            while let Some(row) = rows.try_next().await.context("Failed to read choices")? {
                let slip_id: String = row.try_get("slip_id")?;
                let match_id: String = row.try_get("match_id")?;
                let match_name: Option<String> = row.try_get("match_name")?;
                if let Some(slip) = slips.get_mut(&slip_id) {
                    slip.choices.entry(match_id).or_default().match_name = match_name;
                }
            }
        }

        let sql = format!(
            "SELECT b.slip_id, b.match_id, b.bet_type, b.selected, b.actual, b.correct \
             FROM slip_bets b JOIN slips s ON s.id = b.slip_id WHERE {filter}"
        );
        {
            let mut rows = sqlx::query(&sql).bind(param).fetch(&mut *tx);
            while let Some(row) = rows.try_next().await.context("Failed to read bets")? {
                let slip_id: String = row.try_get("slip_id")?;
                let match_id: String = row.try_get("match_id")?;
                let bet_type: BetType = row.try_get::<String, _>("bet_type")?.parse()?;
                let selected: String = row.try_get("selected")?;
                let actual: Option<String> = row.try_get("actual")?;
                let correct: Option<bool> = row.try_get("correct")?;

                if let Some(slip) = slips.get_mut(&slip_id) {
                    let choice = slip.choices.entry(match_id).or_default();
                    choice.selections.insert(bet_type, selected);
                    if let (Some(actual), Some(correct)) = (actual, correct) {
                        choice.grades.insert(bet_type, Grade { actual, correct });
                    }
                }
            }
        }

        tx.commit().await.context("Failed to finish read")?;

        let mut slips: Vec<Slip> = slips.into_values().collect();
        slips.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(slips)
    }
}

#[async_trait]
impl SlipStore for SqliteStore {
    async fn insert_slip(&self, slip: Slip) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin insert")?;

        sqlx::query(
            "INSERT INTO slips (id, owner, status, incorrect_predictions, created_at, completed_at, version) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&slip.id)
        .bind(&slip.owner)
        .bind(slip.status.as_str())
        .bind(i64::from(slip.incorrect_predictions))
        .bind(slip.created_at.to_rfc3339())
        .bind(slip.completed_at.map(|t| t.to_rfc3339()))
        .bind(to_i64(slip.version, "version")?)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to insert slip {}", slip.id))?;

        for (match_id, choice) in &slip.choices {
            sqlx::query("INSERT INTO slip_choices (slip_id, match_id, match_name) VALUES (?1, ?2, ?3)")
                .bind(&slip.id)
                .bind(match_id)
                .bind(choice.match_name.as_deref())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to insert choice {match_id} of slip {}", slip.id))?;

            for (bet_type, selected) in &choice.selections {
                let grade = choice.grades.get(bet_type);
                sqlx::query(
                    "INSERT INTO slip_bets (slip_id, match_id, bet_type, selected, actual, correct) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .bind(&slip.id)
                .bind(match_id)
                .bind(bet_type.key())
                .bind(selected)
                .bind(grade.map(|g| g.actual.as_str()))
                .bind(grade.map(|g| g.correct))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to insert {bet_type} bet of slip {}", slip.id))?;
            }
        }

        tx.commit().await.context("Failed to commit slip insert")?;
        debug!(slip_id = %slip.id, matches = slip.choices.len(), "Slip stored");
        Ok(())
    }

    async fn get_slip(&self, slip_id: &str) -> Result<Option<Slip>> {
        Ok(self.fetch_slips(BY_ID, slip_id).await?.into_iter().next())
    }

    async fn pending_slips_for_match(&self, match_id: &str) -> Result<Vec<Slip>> {
        let slips = self.fetch_slips(PENDING_FOR_MATCH, match_id).await?;
        debug!(match_id, count = slips.len(), "Loaded pending slips");
        Ok(slips)
    }

    async fn get_match_result(&self, match_id: &str) -> Result<Option<MatchResult>> {
        let row = sqlx::query(
            "SELECT match_id, score_home, score_away, ht_score_home, ht_score_away, outcome, updated_at \
             FROM match_results WHERE match_id = ?1",
        )
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to read result for match {match_id}"))?;

        row.map(|r| match_result_from_row(&r)).transpose()
    }

    async fn match_ids_with_results(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT match_id FROM match_results ORDER BY match_id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list match results")?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("match_id").map_err(Into::into))
            .collect()
    }

    async fn commit(&self, batch: SettlementBatch) -> Result<()> {
        let completed_at = Utc::now().to_rfc3339();
        let result = &batch.match_result;
        let outcome = serde_json::to_string(&result.outcome).context("Failed to encode outcome")?;

        // Dropping `tx` on any early return rolls everything back.
        let mut tx = self.pool.begin().await.context("Failed to begin settlement")?;

        sqlx::query(
            "INSERT INTO match_results \
             (match_id, score_home, score_away, ht_score_home, ht_score_away, outcome, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(match_id) DO UPDATE SET \
             score_home = excluded.score_home, score_away = excluded.score_away, \
             ht_score_home = excluded.ht_score_home, ht_score_away = excluded.ht_score_away, \
             outcome = excluded.outcome, updated_at = excluded.updated_at",
        )
        .bind(&result.match_id)
        .bind(i64::from(result.score_home))
        .bind(i64::from(result.score_away))
        .bind(result.ht_score_home.map(i64::from))
        .bind(result.ht_score_away.map(i64::from))
        .bind(outcome)
        .bind(result.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to write result for match {}", result.match_id))?;

        for (slip_id, version) in &batch.expected_versions {
            let affected = sqlx::query(
                "UPDATE slips SET version = version + 1 WHERE id = ?1 AND version = ?2",
            )
            .bind(slip_id)
            .bind(to_i64(*version, "version")?)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to check version of slip {slip_id}"))?
            .rows_affected();

            if affected != 1 {
                debug!(slip_id = %slip_id, expected = version, "Stale slip snapshot");
                return Err(StaleSnapshot { slip_id: slip_id.clone() }.into());
            }
        }

        for mutation in &batch.mutations {
            let affected = match &mutation.field {
                SlipField::Grade { match_id, bet_type, grade } => sqlx::query(
                    "UPDATE slip_bets SET actual = ?1, correct = ?2 \
                     WHERE slip_id = ?3 AND match_id = ?4 AND bet_type = ?5",
                )
                .bind(&grade.actual)
                .bind(grade.correct)
                .bind(&mutation.slip_id)
                .bind(match_id)
                .bind(bet_type.key())
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                SlipField::ClearGrade { match_id, bet_type } => sqlx::query(
                    "UPDATE slip_bets SET actual = NULL, correct = NULL \
                     WHERE slip_id = ?1 AND match_id = ?2 AND bet_type = ?3",
                )
                .bind(&mutation.slip_id)
                .bind(match_id)
                .bind(bet_type.key())
                .execute(&mut *tx)
                .await?
                .rows_affected(),
                SlipField::Status { status, incorrect_predictions } => sqlx::query(
                    "UPDATE slips SET status = ?1, incorrect_predictions = ?2, completed_at = ?3 \
                     WHERE id = ?4 AND status = 'pending'",
                )
                .bind(status.as_str())
                .bind(i64::from(*incorrect_predictions))
                .bind(&completed_at)
                .bind(&mutation.slip_id)
                .execute(&mut *tx)
                .await?
                .rows_affected(),
            };

            if affected != 1 {
                bail!(
                    "Mutation {:?} on slip {} matched {affected} rows",
                    mutation.field,
                    mutation.slip_id
                );
            }
        }

        tx.commit().await.context("Failed to commit settlement")?;
        debug!(
            match_id = %result.match_id,
            mutations = batch.mutations.len(),
            "Settlement batch committed"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Bad timestamp in database: {raw}"))?
        .with_timezone(&Utc))
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).with_context(|| format!("Column {column} out of range: {value}"))
}

fn to_i64(value: u64, column: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("Column {column} out of range: {value}"))
}

fn slip_from_row(row: &SqliteRow) -> Result<Slip> {
    let status: SlipStatus = row.try_get::<String, _>("status")?.parse()?;
    let completed_at: Option<String> = row.try_get("completed_at")?;

    Ok(Slip {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        status,
        incorrect_predictions: to_u32(row.try_get("incorrect_predictions")?, "incorrect_predictions")?,
        choices: BTreeMap::new(),
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
        version: u64::try_from(row.try_get::<i64, _>("version")?)
            .context("Column version out of range")?,
    })
}

fn match_result_from_row(row: &SqliteRow) -> Result<MatchResult> {
    let outcome: OutcomeVector = serde_json::from_str(&row.try_get::<String, _>("outcome")?)
        .context("Failed to decode stored outcome")?;
    let ht_home: Option<i64> = row.try_get("ht_score_home")?;
    let ht_away: Option<i64> = row.try_get("ht_score_away")?;

    Ok(MatchResult {
        match_id: row.try_get("match_id")?,
        score_home: to_u32(row.try_get("score_home")?, "score_home")?,
        score_away: to_u32(row.try_get("score_away")?, "score_away")?,
        ht_score_home: ht_home.map(|v| to_u32(v, "ht_score_home")).transpose()?,
        ht_score_away: ht_away.map(|v| to_u32(v, "ht_score_away")).transpose()?,
        outcome,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

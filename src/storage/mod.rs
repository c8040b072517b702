//! Persistence layer.
//!
//! Defines the `SlipStore` trait the settlement engine talks to, and the
//! typed mutation records it commits. The only implementation is the
//! SQLite store in [`sqlite`]; tests mock the trait for failure injection.

pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{BetType, Grade, MatchResult, Slip, SlipStatus};

/// A single field-level change to one slip.
#[derive(Debug, Clone, PartialEq)]
pub struct SlipMutation {
    pub slip_id: String,
    pub field: SlipField,
}

/// The fields settlement is allowed to write.
#[derive(Debug, Clone, PartialEq)]
pub enum SlipField {
    /// Grade of one bet type on one match of the slip.
    Grade {
        match_id: String,
        bet_type: BetType,
        grade: Grade,
    },
    /// Drop the grade of one bet type that can no longer be graded,
    /// e.g. `mt1` after a correction removed the half-time score.
    ClearGrade {
        match_id: String,
        bet_type: BetType,
    },
    /// Terminal status. The store stamps `completed_at` when applying it.
    Status {
        status: SlipStatus,
        incorrect_predictions: u32,
    },
}

/// Everything one settlement writes. Committed all-or-nothing.
#[derive(Debug, Clone)]
pub struct SettlementBatch {
    pub match_result: MatchResult,
    pub mutations: Vec<SlipMutation>,
    /// Slip id to the `version` the mutations were planned against. The
    /// commit fails with [`StaleSnapshot`] if any of them moved on.
    pub expected_versions: BTreeMap<String, u64>,
}

impl SettlementBatch {
    pub fn new(match_result: MatchResult) -> Self {
        Self {
            match_result,
            mutations: Vec::new(),
            expected_versions: BTreeMap::new(),
        }
    }

    /// Number of distinct slips touched by this batch.
    pub fn touched_slips(&self) -> usize {
        self.mutations
            .iter()
            .map(|m| m.slip_id.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// A slip was written by another settlement after it was read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Slip {slip_id} changed since it was read")]
pub struct StaleSnapshot {
    pub slip_id: String,
}

/// Document store used by the settlement engine.
///
/// Reads return whole slips with their full choice map. `commit` must be
/// atomic: either the match result and every mutation land, or nothing does.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SlipStore: Send + Sync {
    /// Persist a new slip.
    async fn insert_slip(&self, slip: Slip) -> Result<()>;

    /// Point lookup by slip id.
    async fn get_slip(&self, slip_id: &str) -> Result<Option<Slip>>;

    /// All pending slips that hold a choice for `match_id`.
    async fn pending_slips_for_match(&self, match_id: &str) -> Result<Vec<Slip>>;

    /// The stored result for a match, if any.
    async fn get_match_result(&self, match_id: &str) -> Result<Option<MatchResult>>;

    /// Ids of every match with a stored result.
    async fn match_ids_with_results(&self) -> Result<Vec<String>>;

    /// Apply a settlement batch atomically. Each slip in
    /// `expected_versions` must still be at that version, and has it
    /// bumped; otherwise nothing is written and the error is a
    /// [`StaleSnapshot`].
    async fn commit(&self, batch: SettlementBatch) -> Result<()>;
}

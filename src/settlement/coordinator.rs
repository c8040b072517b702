//! Settlement coordinator: grades every pending slip that references a
//! finished match and commits the result as one atomic batch.
//!
//! Per slip the work is a two-phase fold: grade the settled match's
//! choice into a working copy of the choice map, then aggregate once over
//! that merged view. Only fields whose value actually changes are staged,
//! so replaying a settlement is a no-op.
//!
//! Per-match locks do not stop two different matches from updating the
//! same slip at once. Every batch therefore carries the version of each
//! slip it changes. A batch planned from an outdated read is rejected by
//! the store, and the whole settlement is re-read and re-planned.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::settlement::aggregator::{evaluate, SlipDecision};
use crate::settlement::grader::grade_choice;
use crate::settlement::outcome::ResultSubmission;
use crate::storage::{SettlementBatch, SlipField, SlipMutation, SlipStore, StaleSnapshot};
use crate::types::{
    MatchResult, NewSlip, OutcomeVector, SettlementError, Slip, SlipStatus,
};

/// Attempts at committing one settlement before giving up on a slip that
/// keeps changing underneath it.
pub const MAX_COMMIT_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Per-match serialisation
// ---------------------------------------------------------------------------

/// One async mutex per match id. Settlements of the same match run one
/// at a time; different matches never contend.
#[derive(Default)]
pub struct MatchLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MatchLocks {
    fn lock_for(&self, match_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(match_id.to_string()).or_default().clone()
    }

    /// Drop locks nobody is holding or waiting on.
    fn prune(&self) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Outcome of one `settle_match` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReport {
    /// Slips that received at least one mutation.
    pub updated_slip_count: usize,
    pub slips_won: usize,
    pub slips_lost: usize,
    /// Selections skipped because their value could not be parsed.
    pub malformed_selections: usize,
    pub match_result: MatchResult,
}

/// Mutations planned for a single slip.
#[derive(Debug, Default)]
struct SlipPlan {
    mutations: Vec<SlipMutation>,
    settled: Option<SlipStatus>,
    malformed: usize,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    store: Arc<dyn SlipStore>,
    locks: MatchLocks,
}

impl Coordinator {
    pub fn new(store: Arc<dyn SlipStore>) -> Self {
        Self { store, locks: MatchLocks::default() }
    }

    pub fn store(&self) -> &Arc<dyn SlipStore> {
        &self.store
    }

    /// Record a match result and settle every pending slip that holds it.
    pub async fn settle_match(
        &self,
        submission: &ResultSubmission,
    ) -> Result<SettlementReport, SettlementError> {
        let (match_id, score) = submission.validate()?;

        let lock = self.locks.lock_for(&match_id);
        let report = {
            let _guard = lock.lock().await;

            let outcome = score.derive();
            let match_result = MatchResult {
                match_id: match_id.clone(),
                score_home: score.home,
                score_away: score.away,
                ht_score_home: score.half_time.map(|(h, _)| h),
                ht_score_away: score.half_time.map(|(_, a)| a),
                outcome,
                updated_at: Utc::now(),
            };
            info!(result = %match_result, "Settling match");

            self.settle_locked(&match_id, &outcome, match_result).await
        };
        drop(lock);
        self.locks.prune();

        report
    }

    async fn settle_locked(
        &self,
        match_id: &str,
        outcome: &OutcomeVector,
        match_result: MatchResult,
    ) -> Result<SettlementReport, SettlementError> {
        let mut attempt = 1;
        loop {
            let slips = self
                .store
                .pending_slips_for_match(match_id)
                .await
                .map_err(|e| SettlementError::Storage(format!("{e:#}")))?;

            let mut batch = SettlementBatch::new(match_result.clone());
            let (mut won, mut lost, mut malformed) = (0, 0, 0);

            for slip in &slips {
                let plan = plan_slip(match_id, outcome, slip);
                malformed += plan.malformed;
                match plan.settled {
                    Some(SlipStatus::Won) => won += 1,
                    Some(SlipStatus::Lost) => lost += 1,
                    _ => {}
                }
                if !plan.mutations.is_empty() {
                    batch.expected_versions.insert(slip.id.clone(), slip.version);
                }
                batch.mutations.extend(plan.mutations);
            }

            let updated_slip_count = batch.touched_slips();

            match self.store.commit(batch).await {
                Ok(()) => {
                    info!(
                        match_id,
                        pending = slips.len(),
                        updated = updated_slip_count,
                        won,
                        lost,
                        malformed,
                        attempt,
                        "Match settled"
                    );
                    return Ok(SettlementReport {
                        updated_slip_count,
                        slips_won: won,
                        slips_lost: lost,
                        malformed_selections: malformed,
                        match_result,
                    });
                }
                Err(e)
                    if e.downcast_ref::<StaleSnapshot>().is_some()
                        && attempt < MAX_COMMIT_ATTEMPTS =>
                {
                    warn!(match_id, attempt, error = %e, "Slip changed during settlement, re-reading");
                    attempt += 1;
                }
                Err(e) => return Err(SettlementError::CommitFailed(format!("{e:#}"))),
            }
        }
    }

    /// The stored result of a match.
    pub async fn match_result(&self, match_id: &str) -> Result<MatchResult, SettlementError> {
        self.store
            .get_match_result(match_id)
            .await
            .map_err(|e| SettlementError::Storage(format!("{e:#}")))?
            .ok_or_else(|| SettlementError::NotFound(format!("No result for match {match_id}")))
    }

    /// Validate and store a new slip.
    pub async fn submit_slip(&self, new_slip: NewSlip) -> Result<Slip, SettlementError> {
        let slip = new_slip.into_slip()?;
        self.store
            .insert_slip(slip.clone())
            .await
            .map_err(|e| SettlementError::Storage(format!("{e:#}")))?;
        info!(slip_id = %slip.id, owner = %slip.owner, matches = slip.choices.len(), "Slip submitted");
        Ok(slip)
    }

    /// Point lookup of a slip.
    pub async fn slip(&self, slip_id: &str) -> Result<Slip, SettlementError> {
        self.store
            .get_slip(slip_id)
            .await
            .map_err(|e| SettlementError::Storage(format!("{e:#}")))?
            .ok_or_else(|| SettlementError::NotFound(format!("No slip {slip_id}")))
    }
}

/// Grade `match_id` on one slip and decide its status.
fn plan_slip(match_id: &str, outcome: &OutcomeVector, slip: &Slip) -> SlipPlan {
    let mut plan = SlipPlan::default();
    if slip.status.is_terminal() {
        return plan;
    }
    let Some(choice) = slip.choices.get(match_id) else {
        return plan;
    };

    // Phase 1: grade the settled match.
    let grading = grade_choice(choice, outcome);
    for e in &grading.malformed {
        warn!(slip_id = %slip.id, match_id, error = %e, "Skipping malformed selection");
    }
    plan.malformed = grading.malformed.len();

    // A correction can take away what a grade was based on (the half-time
    // score), so grades with no current counterpart are dropped.
    for bet_type in choice.grades.keys() {
        if !grading.grades.contains_key(bet_type) {
            plan.mutations.push(SlipMutation {
                slip_id: slip.id.clone(),
                field: SlipField::ClearGrade {
                    match_id: match_id.to_string(),
                    bet_type: *bet_type,
                },
            });
        }
    }

    for (bet_type, grade) in &grading.grades {
        if choice.grades.get(bet_type) != Some(grade) {
            plan.mutations.push(SlipMutation {
                slip_id: slip.id.clone(),
                field: SlipField::Grade {
                    match_id: match_id.to_string(),
                    bet_type: *bet_type,
                    grade: grade.clone(),
                },
            });
        }
    }

    // Phase 2: aggregate over the merged choice map.
    let mut merged = slip.clone();
    if let Some(working) = merged.choices.get_mut(match_id) {
        working.grades = grading.grades;
    }
    let (tally, decision) = evaluate(&merged);

    if let SlipDecision::Settled { status, incorrect_predictions } = decision {
        info!(slip_id = %slip.id, %status, %tally, "Slip settled");
        plan.settled = Some(status);
        plan.mutations.push(SlipMutation {
            slip_id: slip.id.clone(),
            field: SlipField::Status { status, incorrect_predictions },
        });
    }

    plan
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::outcome::ScoreLine;
    use crate::storage::sqlite::SqliteStore;
    use crate::storage::MockSlipStore;
    use mockall::Sequence;
    use crate::types::{BetType, Choice, Grade};
    use std::collections::BTreeMap;

    fn choice(selections: &[(BetType, &str)]) -> Choice {
        Choice {
            match_name: None,
            selections: selections.iter().map(|(b, v)| (*b, v.to_string())).collect(),
            grades: BTreeMap::new(),
        }
    }

    fn slip(id: &str, choices: Vec<(&str, Choice)>) -> Slip {
        Slip {
            id: id.into(),
            owner: "user-1".into(),
            status: SlipStatus::Pending,
            incorrect_predictions: 0,
            choices: choices.into_iter().map(|(m, c)| (m.to_string(), c)).collect(),
            created_at: Utc::now(),
            completed_at: None,
            version: 0,
        }
    }

    async fn coordinator_with(slips: Vec<Slip>) -> Coordinator {
        let store = SqliteStore::in_memory().await.unwrap();
        for s in slips {
            store.insert_slip(s).await.unwrap();
        }
        Coordinator::new(Arc::new(store))
    }

    #[test]
    fn test_plan_stages_only_changed_grades() {
        let outcome = ScoreLine { home: 2, away: 1, half_time: None }.derive();
        let mut c = choice(&[(BetType::Resultat, "1"), (BetType::Btts, "Wi")]);
        c.grades.insert(BetType::Resultat, Grade { actual: "1".into(), correct: true });
        let s = slip("s1", vec![("m1", c), ("m2", choice(&[(BetType::Resultat, "X")]))]);

        let plan = plan_slip("m1", &outcome, &s);
        assert_eq!(plan.mutations.len(), 1);
        assert!(matches!(
            &plan.mutations[0].field,
            SlipField::Grade { bet_type: BetType::Btts, .. }
        ));
        assert!(plan.settled.is_none());
    }

    #[test]
    fn test_plan_ignores_terminal_slip() {
        let outcome = ScoreLine { home: 0, away: 0, half_time: None }.derive();
        let mut s = slip("s1", vec![("m1", choice(&[(BetType::Resultat, "1")]))]);
        s.status = SlipStatus::Lost;
        let plan = plan_slip("m1", &outcome, &s);
        assert!(plan.mutations.is_empty());
    }

    #[tokio::test]
    async fn test_settle_single_match_slip_wins() {
        let c = coordinator_with(vec![slip("s1", vec![("m1", choice(&[(BetType::Total, "<2.5")]))])]).await;

        let report = c.settle_match(&ResultSubmission::new("m1", 0, 0, None)).await.unwrap();
        assert_eq!(report.updated_slip_count, 1);
        assert_eq!(report.slips_won, 1);

        let s1 = c.slip("s1").await.unwrap();
        assert_eq!(s1.status, SlipStatus::Won);
        assert_eq!(s1.incorrect_predictions, 0);
        assert!(s1.completed_at.is_some());
        assert_eq!(s1.choices["m1"].grades[&BetType::Total], Grade { actual: "0".into(), correct: true });
    }

    #[tokio::test]
    async fn test_one_miss_keeps_multi_match_slip_pending() {
        let c = coordinator_with(vec![slip(
            "s1",
            vec![
                ("m1", choice(&[(BetType::Resultat, "1"), (BetType::Btts, "Non")])),
                ("m2", choice(&[(BetType::Resultat, "2")])),
            ],
        )])
        .await;

        let report = c.settle_match(&ResultSubmission::new("m1", 2, 1, Some((1, 0)))).await.unwrap();
        assert_eq!(report.updated_slip_count, 1);
        assert_eq!(report.slips_lost, 0);

        let s1 = c.slip("s1").await.unwrap();
        assert_eq!(s1.status, SlipStatus::Pending);
        assert!(s1.choices["m1"].grades[&BetType::Resultat].correct);
        assert!(!s1.choices["m1"].grades[&BetType::Btts].correct);

        // Second match also wrong: two strikes.
        let report = c.settle_match(&ResultSubmission::new("m2", 1, 1, None)).await.unwrap();
        assert_eq!(report.slips_lost, 1);
        let s1 = c.slip("s1").await.unwrap();
        assert_eq!(s1.status, SlipStatus::Lost);
        assert_eq!(s1.incorrect_predictions, 2);
    }

    #[tokio::test]
    async fn test_two_misses_on_one_match_lose_immediately() {
        let c = coordinator_with(vec![slip(
            "s1",
            vec![
                ("m1", choice(&[(BetType::Resultat, "2"), (BetType::Btts, "Wi")])),
                ("m2", choice(&[(BetType::Resultat, "1")])),
                ("m3", choice(&[(BetType::Resultat, "1")])),
            ],
        )])
        .await;

        c.settle_match(&ResultSubmission::new("m1", 1, 0, None)).await.unwrap();
        assert_eq!(c.slip("s1").await.unwrap().status, SlipStatus::Lost);

        // Terminal slips are no longer picked up.
        let report = c.settle_match(&ResultSubmission::new("m2", 1, 0, None)).await.unwrap();
        assert_eq!(report.updated_slip_count, 0);
        assert!(c.slip("s1").await.unwrap().choices["m2"].grades.is_empty());
    }

    #[tokio::test]
    async fn test_replay_is_noop() {
        let c = coordinator_with(vec![
            slip("s1", vec![("m1", choice(&[(BetType::Resultat, "1")])), ("m2", choice(&[(BetType::Btts, "Wi")]))]),
            slip("s2", vec![("m1", choice(&[(BetType::DoubleChance, "1X")]))]),
        ])
        .await;
        let submission = ResultSubmission::new("m1", 3, 0, None);

        let first = c.settle_match(&submission).await.unwrap();
        assert_eq!(first.updated_slip_count, 2);

        let second = c.settle_match(&submission).await.unwrap();
        assert_eq!(second.updated_slip_count, 0);
        assert_eq!(c.slip("s1").await.unwrap().status, SlipStatus::Pending);
        assert_eq!(c.slip("s2").await.unwrap().status, SlipStatus::Won);
    }

    #[tokio::test]
    async fn test_malformed_selection_not_counted_incorrect() {
        let c = coordinator_with(vec![slip(
            "s1",
            vec![("m1", choice(&[(BetType::Resultat, "1"), (BetType::Total, "over9000")]))],
        )])
        .await;

        let report = c.settle_match(&ResultSubmission::new("m1", 1, 0, None)).await.unwrap();
        assert_eq!(report.malformed_selections, 1);

        let s1 = c.slip("s1").await.unwrap();
        assert_eq!(s1.status, SlipStatus::Won);
        assert!(!s1.choices["m1"].grades.contains_key(&BetType::Total));
    }

    #[tokio::test]
    async fn test_half_time_bet_waits_for_half_time_score() {
        let c = coordinator_with(vec![slip("s1", vec![("m1", choice(&[(BetType::Mt1, "X")]))])]).await;

        let report = c.settle_match(&ResultSubmission::new("m1", 1, 1, None)).await.unwrap();
        assert_eq!(report.updated_slip_count, 0);
        assert_eq!(c.slip("s1").await.unwrap().status, SlipStatus::Pending);

        // Operator corrects the entry with a half-time score.
        c.settle_match(&ResultSubmission::new("m1", 1, 1, Some((0, 0)))).await.unwrap();
        assert_eq!(c.slip("s1").await.unwrap().status, SlipStatus::Won);
        let stored = c.match_result("m1").await.unwrap();
        assert_eq!(stored.ht_score_home, Some(0));
    }

    #[tokio::test]
    async fn test_match_result_not_found() {
        let c = coordinator_with(Vec::new()).await;
        assert!(matches!(c.match_result("nope").await, Err(SettlementError::NotFound(_))));
        assert!(matches!(c.slip("nope").await, Err(SettlementError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_input_touches_nothing() {
        // No expectations: any store call panics.
        let c = Coordinator::new(Arc::new(MockSlipStore::new()));
        let mut submission = ResultSubmission::new("m1", 1, 0, None);
        submission.score_away = None;

        let err = c.settle_match(&submission).await.unwrap_err();
        assert!(matches!(err, SettlementError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_commit_failure_surfaces() {
        let mut store = MockSlipStore::new();
        store
            .expect_pending_slips_for_match()
            .times(1)
            .returning(|_| Ok(vec![slip("s1", vec![("m1", choice(&[(BetType::Resultat, "1")]))])]));
        store
            .expect_commit()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("database is locked")));

        let c = Coordinator::new(Arc::new(store));
        let err = c.settle_match(&ResultSubmission::new("m1", 1, 0, None)).await.unwrap_err();
        assert!(matches!(err, SettlementError::CommitFailed(ref msg) if msg.contains("locked")));
    }

    #[tokio::test]
    async fn test_commit_batch_contents() {
        let mut store = MockSlipStore::new();
        store
            .expect_pending_slips_for_match()
            .returning(|_| Ok(vec![slip("s1", vec![("m1", choice(&[(BetType::Resultat, "1"), (BetType::Btts, "Wi")]))])]));
        store
            .expect_commit()
            .withf(|batch| {
                batch.match_result.match_id == "m1"
                    && batch.expected_versions.get("s1") == Some(&0)
                    && batch.mutations.len() == 3
                    && batch.mutations.iter().any(|m| {
                        m.field
                            == SlipField::Status { status: SlipStatus::Lost, incorrect_predictions: 2 }
                    })
            })
            .times(1)
            .returning(|_| Ok(()));

        let c = Coordinator::new(Arc::new(store));
        let report = c.settle_match(&ResultSubmission::new("m1", 0, 2, None)).await.unwrap();
        assert_eq!(report.updated_slip_count, 1);
        assert_eq!(report.slips_lost, 1);
    }

    #[tokio::test]
    async fn test_concurrent_same_match_settles_once() {
        let c = Arc::new(
            coordinator_with(vec![slip("s1", vec![("m1", choice(&[(BetType::Resultat, "1")]))])]).await,
        );
        let submission = ResultSubmission::new("m1", 1, 0, None);

        let (a, b) = tokio::join!(c.settle_match(&submission), c.settle_match(&submission));
        let total = a.unwrap().updated_slip_count + b.unwrap().updated_slip_count;
        assert_eq!(total, 1);
        assert!(c.locks.is_empty());
    }

    #[tokio::test]
    async fn test_stale_commit_is_replanned() {
        let mut store = MockSlipStore::new();
        let mut seq = Sequence::new();

        // First read predates another match's grades on the same slip.
        store
            .expect_pending_slips_for_match()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Ok(vec![slip(
                    "s1",
                    vec![
                        ("a", choice(&[(BetType::Resultat, "1")])),
                        ("b", choice(&[(BetType::Resultat, "1")])),
                    ],
                )])
            });
        store
            .expect_commit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(StaleSnapshot { slip_id: "s1".into() }.into()));
        store
            .expect_pending_slips_for_match()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                let mut a = choice(&[(BetType::Resultat, "1")]);
                a.grades.insert(BetType::Resultat, Grade { actual: "1".into(), correct: true });
                let mut fresh = slip("s1", vec![("a", a), ("b", choice(&[(BetType::Resultat, "1")]))]);
                fresh.version = 1;
                Ok(vec![fresh])
            });
        store
            .expect_commit()
            .withf(|batch| {
                batch.expected_versions.get("s1") == Some(&1)
                    && batch.mutations.iter().any(|m| {
                        m.field == SlipField::Status { status: SlipStatus::Won, incorrect_predictions: 0 }
                    })
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let c = Coordinator::new(Arc::new(store));
        let report = c.settle_match(&ResultSubmission::new("b", 2, 0, None)).await.unwrap();
        assert_eq!(report.slips_won, 1);
    }

    #[tokio::test]
    async fn test_persistently_stale_commit_gives_up() {
        let mut store = MockSlipStore::new();
        store
            .expect_pending_slips_for_match()
            .times(MAX_COMMIT_ATTEMPTS as usize)
            .returning(|_| Ok(vec![slip("s1", vec![("m1", choice(&[(BetType::Resultat, "1")]))])]));
        store
            .expect_commit()
            .times(MAX_COMMIT_ATTEMPTS as usize)
            .returning(|_| Err(StaleSnapshot { slip_id: "s1".into() }.into()));

        let c = Coordinator::new(Arc::new(store));
        let err = c.settle_match(&ResultSubmission::new("m1", 1, 0, None)).await.unwrap_err();
        assert!(matches!(err, SettlementError::CommitFailed(ref msg) if msg.contains("s1")));
    }

    #[tokio::test]
    async fn test_concurrent_matches_on_shared_slip() {
        let c = Arc::new(
            coordinator_with(vec![slip(
                "s1",
                vec![
                    ("a", choice(&[(BetType::Resultat, "1")])),
                    ("b", choice(&[(BetType::Resultat, "1")])),
                ],
            )])
            .await,
        );

        let sub_a = ResultSubmission::new("a", 1, 0, None);
        let sub_b = ResultSubmission::new("b", 3, 1, None);
        let (ra, rb) = tokio::join!(c.settle_match(&sub_a), c.settle_match(&sub_b));
        assert_eq!(ra.unwrap().slips_won + rb.unwrap().slips_won, 1);

        let s1 = c.slip("s1").await.unwrap();
        assert_eq!(s1.status, SlipStatus::Won);
        assert_eq!(s1.version, 2);
    }

    #[tokio::test]
    async fn test_half_time_removal_clears_half_time_grade() {
        let c = coordinator_with(vec![slip(
            "s1",
            vec![
                ("m1", choice(&[(BetType::Mt1, "X"), (BetType::Resultat, "X")])),
                ("m2", choice(&[(BetType::Resultat, "1")])),
            ],
        )])
        .await;

        c.settle_match(&ResultSubmission::new("m1", 1, 1, Some((0, 0)))).await.unwrap();
        assert!(c.slip("s1").await.unwrap().choices["m1"].grades.contains_key(&BetType::Mt1));

        // Correction without a half-time score.
        let report = c.settle_match(&ResultSubmission::new("m1", 1, 1, None)).await.unwrap();
        assert_eq!(report.updated_slip_count, 1);

        let s1 = c.slip("s1").await.unwrap();
        assert!(!s1.choices["m1"].grades.contains_key(&BetType::Mt1));
        assert!(s1.choices["m1"].grades[&BetType::Resultat].correct);
        assert_eq!(c.match_result("m1").await.unwrap().ht_score_home, None);
    }
}

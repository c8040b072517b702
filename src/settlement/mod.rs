//! Settlement engine: the outcome deriver, choice grader, slip
//! aggregator and the coordinator that ties them to the store.
//!
//! Control flow for one finished match:
//! coordinator → outcome (once) → for each pending slip: grader → aggregator
//! → staged mutations → single atomic commit.

pub mod outcome;
pub mod grader;
pub mod aggregator;
pub mod coordinator;

pub use coordinator::{Coordinator, SettlementReport};
pub use outcome::{ResultSubmission, ScoreLine};

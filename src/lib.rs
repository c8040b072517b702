//! CHANPYON: prediction slip settlement engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod settlement;
pub mod storage;
pub mod catalogue;
pub mod gateway;
pub mod api;

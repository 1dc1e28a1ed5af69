//! # meridian-test
//!
//! Integration tests for Meridian.
//!
//! This crate contains:
//! - Seeded random transaction plans and the model they are checked against
//! - Drivers that run a plan through one writer, or many writers with
//!   background workers and readers
//! - End-to-end tests under `tests/`

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Random transaction plans
pub mod fuzz;

/// Test utilities and helpers
pub mod utils;

pub use fuzz::{FuzzConfig, FuzzPlan, FuzzRow, FuzzTxn, Model};
pub use utils::{
    canonical, commit_order, open_engine, replay, run_concurrent, run_sequential, table_rows, ConcurrentOptions, Row,
};

//! ciledger-core: shared state behind a CI pipeline
//!
//! This crate provides the core functionality for `ciledger`: an append-only
//! activity ledger written concurrently by independently scheduled CI jobs,
//! and a usage budget enforcer that gates calls to paid services.
//!
//! # Architecture
//!
//! ```text
//!   CI job ──► LedgerStore ──► pipeline-log.json ──► RotationPolicy ──► archive/
//!                  │
//!             Lock Manager (status | budget-state)
//!                  │
//!   CI job ──► BudgetEnforcer ──► budget-state.json
//!                  ▲
//!            UsageAggregator ◄── usage/*.jsonl
//! ```
//!
//! # Modules
//!
//! - `lock`: Named cross-process advisory locks with backoff and timeout
//! - `persist`: Atomic JSON publication and tolerant loading
//! - `ledger`: Activity ledger with bounded retention and phase tracking
//! - `rotation`: Size- and age-triggered archival of the ledger
//! - `cleanup`: Retention-based deletion of CI artifacts
//! - `usage`: Windowed aggregation over usage-event streams
//! - `pricing`: Service limits and cost thresholds
//! - `budget`: Limit checks, cooldowns and budget-state persistence
//! - `alerts`: Spend threshold alerts with a violation trail
//! - `config`: Configuration and workspace layout
//! - `logging`: Tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod alerts;
pub mod budget;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod persist;
pub mod pricing;
pub mod rotation;
pub mod timestamp;
pub mod usage;

pub use error::{ConfigError, Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}

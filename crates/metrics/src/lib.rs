//! # Metrics
//!
//! What a check produces and what the agent publishes about it.
//!
//! A [`CheckResult`] accumulates graphite-style `metric value timestamp`
//! lines during one gather. The runner wraps it into a [`CheckReport`], the
//! JSON body written to the `results` exchange.

pub mod report;
pub mod result;

pub use report::{CheckReport, CheckStatus, CheckSummary};
pub use result::CheckResult;

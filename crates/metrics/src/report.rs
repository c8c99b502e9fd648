//! Published check report

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::result::CheckResult;

/// Nagios-style exit status carried in every report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum CheckStatus {
    Ok,
    Warning,
    Critical,
    Unknown,
}

impl CheckStatus {
    pub fn code(self) -> u8 {
        match self {
            CheckStatus::Ok => 0,
            CheckStatus::Warning => 1,
            CheckStatus::Critical => 2,
            CheckStatus::Unknown => 3,
        }
    }
}

impl From<CheckStatus> for u8 {
    fn from(status: CheckStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u8> for CheckStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(CheckStatus::Ok),
            1 => Ok(CheckStatus::Warning),
            2 => Ok(CheckStatus::Critical),
            3 => Ok(CheckStatus::Unknown),
            other => Err(format!("invalid check status {other}")),
        }
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "ok",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
            CheckStatus::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub id: Uuid,
    pub name: String,
    /// When the check was requested, unix seconds.
    pub issued: i64,
    /// When gather started, unix seconds.
    pub executed: i64,
    /// Gather wall time in seconds.
    pub duration: f64,
    pub output: String,
    pub status: CheckStatus,
}

/// Body published to the `results` exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub client: String,
    pub check: CheckSummary,
}

impl CheckReport {
    /// Report for a gather that returned normally.
    pub fn from_result(
        client: impl Into<String>,
        name: impl Into<String>,
        issued: DateTime<Utc>,
        result: &CheckResult,
        duration: Duration,
    ) -> Self {
        Self::build(
            client,
            name,
            issued,
            result.start_time(),
            duration,
            result.output(),
            CheckStatus::Ok,
        )
    }

    /// Report for a gather that failed or never finished.
    pub fn failed(
        client: impl Into<String>,
        name: impl Into<String>,
        issued: DateTime<Utc>,
        executed: DateTime<Utc>,
        duration: Duration,
        reason: impl Into<String>,
        status: CheckStatus,
    ) -> Self {
        Self::build(client, name, issued, executed, duration, reason.into(), status)
    }

    fn build(
        client: impl Into<String>,
        name: impl Into<String>,
        issued: DateTime<Utc>,
        executed: DateTime<Utc>,
        duration: Duration,
        output: String,
        status: CheckStatus,
    ) -> Self {
        Self {
            client: client.into(),
            check: CheckSummary {
                id: Uuid::new_v4(),
                name: name.into(),
                issued: issued.timestamp(),
                executed: executed.timestamp(),
                duration: (duration.as_secs_f64() * 1000.0).round() / 1000.0,
                output,
                status,
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

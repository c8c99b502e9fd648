//! Reboot counter persisted between gathers and across restarts
//!
//! Stored as `"<count>,<unix-seconds>"`, both unsigned. Reads never fail: a
//! missing file is a zero count stamped now, an unparseable count is zero, and
//! an unparseable, negative or absent timestamp is now.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::CheckError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebootState {
    pub count: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct RebootStateFile {
    path: PathBuf,
}

impl RebootStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> RebootState {
        self.read_at(Utc::now().timestamp())
    }

    pub fn read_at(&self, now: i64) -> RebootState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %err, "unreadable reboot state");
                }
                return RebootState {
                    count: 0,
                    timestamp: now,
                };
            }
        };

        let mut fields = raw.trim().splitn(2, ',');
        let count = fields
            .next()
            .and_then(|c| c.trim().parse().ok())
            .unwrap_or(0);
        let timestamp = fields
            .next()
            .and_then(|t| t.trim().parse::<u64>().ok())
            .and_then(|t| i64::try_from(t).ok())
            .unwrap_or(now);
        RebootState { count, timestamp }
    }

    pub fn record(&self, count: u32) -> Result<(), CheckError> {
        self.record_at(count, Utc::now().timestamp())
    }

    /// Replace the stored count. A failure recorded on top of a failure keeps
    /// the timestamp of the first one.
    pub fn record_at(&self, count: u32, now: i64) -> Result<(), CheckError> {
        let current = self.read_at(now);
        let timestamp = if current.count == 1 && count == 1 {
            current.timestamp
        } else {
            now
        };

        fs::write(&self.path, format!("{count},{timestamp}")).map_err(|err| {
            CheckError::Persistence {
                path: self.path.display().to_string(),
                reason: err.to_string(),
            }
        })?;
        debug!(path = %self.path.display(), count, timestamp, "reboot state recorded");
        Ok(())
    }
}

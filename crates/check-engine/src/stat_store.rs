//! Degraded-mode buffer for reports the broker would not take
//!
//! One JSON document per line, appended in publish order. Past its capacity
//! the oldest reports are dropped.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::CheckError;

/// Reports kept while the broker is unavailable.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct StatStore {
    path: PathBuf,
    capacity: usize,
}

impl StatStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(path, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, body: &[u8]) -> Result<(), CheckError> {
        let pending = self.pending()?;
        if pending.len() >= self.capacity {
            let dropped = pending.len() + 1 - self.capacity;
            warn!(path = %self.path.display(), dropped, "stat store full, dropping oldest reports");
            let mut kept = pending[dropped..].to_vec();
            kept.push(body.to_vec());
            return self.retain(&kept);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| self.persistence(err))?;
        file.write_all(body)
            .and_then(|()| file.write_all(b"\n"))
            .map_err(|err| self.persistence(err))
    }

    /// Buffered bodies, oldest first.
    pub fn pending(&self) -> Result<Vec<Vec<u8>>, CheckError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(raw
                .split(|b| *b == b'\n')
                .filter(|line| !line.is_empty())
                .map(<[u8]>::to_vec)
                .collect()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(self.persistence(err)),
        }
    }

    /// Rewrite the buffer with `remaining`, dropping the file when empty.
    pub fn retain(&self, remaining: &[Vec<u8>]) -> Result<(), CheckError> {
        if remaining.is_empty() {
            return match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(self.persistence(err)),
            };
        }
        let mut joined = Vec::new();
        for body in remaining {
            joined.extend_from_slice(body);
            joined.push(b'\n');
        }
        fs::write(&self.path, joined).map_err(|err| self.persistence(err))
    }

    fn persistence(&self, err: std::io::Error) -> CheckError {
        CheckError::Persistence {
            path: self.path.display().to_string(),
            reason: err.to_string(),
        }
    }
}

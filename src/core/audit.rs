//! Append-only JSONL journal of scope outcomes.
//!
//! One line per committed or rolled-back scope, so an operator can reconstruct
//! what a run touched without opening the database.

use crate::core::error::{RekeyError, Result};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuditEvent {
    pub ts: String,
    pub event_id: String,
    pub run_id: String,
    pub scope: String,
    pub status: String,
    pub rows: u64,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(
        &self,
        run_id: &str,
        scope: &str,
        status: &str,
        rows: u64,
        detail: Option<&str>,
    ) -> Result<()> {
        let ev = AuditEvent {
            ts: time::now_rfc3339(),
            event_id: time::new_event_id(),
            run_id: run_id.to_string(),
            scope: scope.to_string(),
            status: status.to_string(),
            rows,
            detail: detail.map(|s| s.to_string()),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(RekeyError::IoError)?;
            }
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(RekeyError::IoError)?;
        writeln!(f, "{}", serde_json::to_string(&ev)?).map_err(RekeyError::IoError)?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<AuditEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let mut events = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }
}

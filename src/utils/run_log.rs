//! Per-row run log.
//!
//! Every row gets exactly one entry with its terminal state. Entries go to
//! `tracing` and, when a path is configured, are appended to a JSON lines file.
//! One entry is one `write_all` followed by a flush, so lines never interleave.

use crate::domain::model::RowState;
use crate::utils::error::{EtlError, Result, RowError, RowStage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowLogEntry {
    pub timestamp: DateTime<Utc>,
    pub row: usize,
    pub state: RowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<RowStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LogLine<'a> {
    Row(&'a RowLogEntry),
    Fatal {
        timestamp: DateTime<Utc>,
        error: String,
    },
}

pub struct RunLog {
    sink: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    entries: Vec<RowLogEntry>,
}

impl RunLog {
    /// Log through `tracing` only.
    pub fn in_memory() -> Self {
        Self {
            sink: None,
            path: None,
            entries: Vec::new(),
        }
    }

    /// Append to a JSON lines file, created if missing.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        tracing::debug!(path = %path.display(), "run log opened");

        Ok(Self {
            sink: Some(BufWriter::new(file)),
            path: Some(path.to_path_buf()),
            entries: Vec::new(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn entries(&self) -> &[RowLogEntry] {
        &self.entries
    }

    pub fn failures(&self) -> impl Iterator<Item = &RowLogEntry> {
        self.entries.iter().filter(|e| e.state == RowState::Failed)
    }

    pub fn row_written(&mut self, row: usize) -> Result<()> {
        tracing::info!(row, state = "written", "✅ row written");
        self.push(RowLogEntry {
            timestamp: Utc::now(),
            row,
            state: RowState::Written,
            stage: None,
            code: None,
            reason: None,
        })
    }

    pub fn row_failed(&mut self, row: usize, err: &RowError) -> Result<()> {
        tracing::warn!(
            row,
            state = "failed",
            stage = ?err.stage(),
            code = err.reason_code(),
            "❌ row dropped: {}",
            err
        );
        self.push(RowLogEntry {
            timestamp: Utc::now(),
            row,
            state: RowState::Failed,
            stage: Some(err.stage()),
            code: Some(err.reason_code()),
            reason: Some(err.to_string()),
        })
    }

    /// Best effort: the run is already failing, so a write error here is only reported.
    pub fn fatal(&mut self, err: &EtlError) {
        tracing::error!(category = ?err.category(), "run aborted: {}", err);
        let line = LogLine::Fatal {
            timestamp: Utc::now(),
            error: err.to_string(),
        };
        if let Err(e) = self.write_line(&line) {
            tracing::warn!(error = %e, "could not append fatal error to run log");
        }
    }

    fn push(&mut self, entry: RowLogEntry) -> Result<()> {
        self.write_line(&LogLine::Row(&entry))?;
        self.entries.push(entry);
        Ok(())
    }

    fn write_line(&mut self, line: &LogLine<'_>) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let mut bytes = serde_json::to_vec(line)?;
        bytes.push(b'\n');
        sink.write_all(&bytes)?;
        sink.flush().map_err(EtlError::IoError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::{GenerationError, ParseError};
    use tempfile::TempDir;

    #[test]
    fn test_in_memory_log_keeps_entries() {
        let mut log = RunLog::in_memory();
        log.row_written(0).unwrap();
        log.row_failed(1, &RowError::from(ParseError::EmptyResponse))
            .unwrap();

        assert_eq!(log.entries().len(), 2);
        let failed: Vec<_> = log.failures().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].row, 1);
        assert_eq!(failed[0].stage, Some(RowStage::Parse));
        assert_eq!(failed[0].code, Some("parse_error"));
    }

    #[test]
    fn test_file_log_appends_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("run.jsonl");

        {
            let mut log = RunLog::open(&path).unwrap();
            log.row_written(0).unwrap();
            log.row_failed(1, &RowError::from(GenerationError::Timeout))
                .unwrap();
        }
        {
            let mut log = RunLog::open(&path).unwrap();
            log.fatal(&EtlError::format("in.csv", "duplicate column 'a'"));
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "row");
        assert_eq!(lines[0]["state"], "written");
        assert_eq!(lines[1]["row"], 1);
        assert_eq!(lines[1]["state"], "failed");
        assert_eq!(lines[1]["stage"], "generate");
        assert_eq!(lines[1]["code"], "timeout");
        assert_eq!(lines[2]["event"], "fatal");
        assert!(lines[2]["error"]
            .as_str()
            .unwrap()
            .contains("duplicate column"));
    }
}

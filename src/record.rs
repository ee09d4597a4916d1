//! Status record: an append-only, line-oriented event log written under the
//! scenario's log directory. It is the only input the `list`/`listFailed`
//! CLI subcommands read — the Coordinator itself never replays it.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::CoordinatorError;
use crate::model::Status;

/// One line of the status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub time_ms: i64,
    pub step: String,
    pub status: Status,
    pub command: Option<String>,
    /// How long the step ran, for a completion event dispatched from a
    /// tracked start time. `None` for start/skip events, which have no
    /// duration to report.
    pub duration_ms: Option<i64>,
}

impl StatusEvent {
    pub fn now(step: impl Into<String>, status: Status, command: Option<String>) -> Self {
        StatusEvent {
            time_ms: Utc::now().timestamp_millis(),
            step: step.into(),
            status,
            command,
            duration_ms: None,
        }
    }

    /// Attaches a completion duration, in whole milliseconds.
    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    fn to_line(&self) -> String {
        let command = self
            .command
            .as_deref()
            .unwrap_or("")
            .replace('\t', " ")
            .replace('\n', " ");
        let duration = self.duration_ms.map(|d| d.to_string()).unwrap_or_default();
        format!("{}\t{}\t{}\t{}\t{}", self.time_ms, self.step, self.status, command, duration)
    }

    fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(5, '\t');
        let time_ms: i64 = parts.next()?.parse().ok()?;
        let step = parts.next()?.to_string();
        let status: Status = parts.next()?.parse().ok()?;
        let command = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let duration_ms = parts.next().and_then(|s| s.parse().ok());
        Some(StatusEvent {
            time_ms,
            step,
            status,
            command,
            duration_ms,
        })
    }
}

/// Append-only writer over a single scenario's status-record file.
pub struct StatusRecord {
    path: PathBuf,
    file: File,
}

impl StatusRecord {
    pub fn open(path: &Path) -> Result<Self, CoordinatorError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(StatusRecord {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Truncates the record file, called by `Coordinator::reset`.
    pub fn truncate(&mut self) -> Result<(), CoordinatorError> {
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    pub fn append(&mut self, event: &StatusEvent) -> Result<(), CoordinatorError> {
        writeln!(self.file, "{}", event.to_line())?;
        self.file.flush()?;
        Ok(())
    }

    /// Replays every event in the record, in the order they were written.
    pub fn read_all(path: &Path) -> Result<Vec<StatusEvent>, CoordinatorError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Some(event) = StatusEvent::parse_line(&line) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Only the `Failed` events, for `listFailed`.
    pub fn read_failed(path: &Path) -> Result<Vec<StatusEvent>, CoordinatorError> {
        Ok(Self::read_all(path)?
            .into_iter()
            .filter(|e| e.status == Status::Failed)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.record");
        let mut record = StatusRecord::open(&path).unwrap();
        record
            .append(&StatusEvent::now("a", Status::Succeeded, Some("true".into())))
            .unwrap();
        record
            .append(&StatusEvent::now("b", Status::Failed, Some("false".into())))
            .unwrap();

        let events = StatusRecord::read_all(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].step, "a");
        assert_eq!(events[0].status, Status::Succeeded);
        assert_eq!(events[1].status, Status::Failed);
    }

    #[test]
    fn duration_round_trips_on_completion_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.record");
        let mut record = StatusRecord::open(&path).unwrap();
        record
            .append(&StatusEvent::now("a", Status::Succeeded, Some("true".into())).with_duration(42))
            .unwrap();
        record.append(&StatusEvent::now("b", Status::InProgress, None)).unwrap();

        let events = StatusRecord::read_all(&path).unwrap();
        assert_eq!(events[0].duration_ms, Some(42));
        assert_eq!(events[1].duration_ms, None);
    }

    #[test]
    fn list_failed_filters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.record");
        let mut record = StatusRecord::open(&path).unwrap();
        record.append(&StatusEvent::now("a", Status::Succeeded, None)).unwrap();
        record.append(&StatusEvent::now("b", Status::Failed, None)).unwrap();
        record.append(&StatusEvent::now("c", Status::Skipped, None)).unwrap();

        let failed = StatusRecord::read_failed(&path).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].step, "b");
    }

    #[test]
    fn truncate_clears_prior_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.record");
        let mut record = StatusRecord::open(&path).unwrap();
        record.append(&StatusEvent::now("a", Status::Succeeded, None)).unwrap();
        record.truncate().unwrap();
        record.append(&StatusEvent::now("b", Status::Succeeded, None)).unwrap();

        let events = StatusRecord::read_all(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].step, "b");
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does-not-exist.record");
        assert!(StatusRecord::read_all(&path).unwrap().is_empty());
    }
}

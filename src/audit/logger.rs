use super::{
    EVENTS_LOG_NAME, EventRecord, ITERATIONS_LOG_NAME, IterationRecord, IterationSummary,
    LOGS_DIR_NAME,
};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// JSONL append-only logger for one run directory.
#[derive(Debug, Clone)]
pub struct RunLogger {
    events_path: PathBuf,
    iterations_path: PathBuf,
}

impl RunLogger {
    /// Create a logger, making `<run>/logs` if needed.
    pub fn new(run_dir: &Path) -> Result<Self> {
        let logs_dir = run_dir.join(LOGS_DIR_NAME);
        fs::create_dir_all(&logs_dir)
            .with_context(|| format!("Failed to create logs directory {}", logs_dir.display()))?;
        Ok(Self {
            events_path: logs_dir.join(EVENTS_LOG_NAME),
            iterations_path: logs_dir.join(ITERATIONS_LOG_NAME),
        })
    }

    /// Append an event line.
    ///
    /// A payload that cannot be represented as JSON is recorded as its debug string
    /// rather than failing the caller.
    pub fn append_event<P>(&self, event_type: &str, iteration: Option<u64>, payload: P) -> Result<()>
    where
        P: Serialize + Debug,
    {
        let payload = serde_json::to_value(&payload)
            .unwrap_or_else(|_| Value::String(format!("{:?}", payload)));
        let record = EventRecord {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            iteration,
            payload,
        };
        append_jsonl(&self.events_path, &record)
    }

    /// Append one iteration summary line.
    pub fn append_iteration(&self, summary: &IterationSummary) -> Result<()> {
        let record = IterationRecord {
            timestamp: Utc::now(),
            summary: summary.clone(),
        };
        append_jsonl(&self.iterations_path, &record)
    }
}

fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut line = serde_json::to_string(record).context("Failed to serialize log record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("Failed to append to {}", path.display()))
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read log file {}", path.display()))?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Malformed record on line {} of {}", i + 1, path.display()))
        })
        .collect()
}

/// Read every event recorded for a run. Missing log means no events yet.
pub fn read_events(run_dir: &Path) -> Result<Vec<EventRecord>> {
    read_jsonl(&run_dir.join(LOGS_DIR_NAME).join(EVENTS_LOG_NAME))
}

/// Read every iteration summary recorded for a run.
pub fn read_iterations(run_dir: &Path) -> Result<Vec<IterationRecord>> {
    read_jsonl(&run_dir.join(LOGS_DIR_NAME).join(ITERATIONS_LOG_NAME))
}

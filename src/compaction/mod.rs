//! Pre-compaction checkpointing.
//!
//! The agent service compacts its context when a session grows too long, which
//! drops detail the agent had not yet written down. Two signals announce this:
//!
//! - a pre-compaction hook delivered by the conversation implementation
//! - an inline `system/compact_boundary` message in the stream
//!
//! Both arrive as a [`CompactionSignal`] at a single [`CheckpointTrigger`], which
//! snapshots the research memory files before consumption continues. Failures are
//! recorded as `hook.callback_error` events and never reach the outer loop.

mod checkpoint;

pub use checkpoint::{
    CheckpointSnapshot, LATEST_CHECKPOINT, checkpoints_dir, ensure_research_files, read_file_tail,
    write_precompact_checkpoint,
};

use crate::audit::RunLogger;
use anyhow::Result;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// Where a compaction signal came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionSource {
    Hook,
    CompactBoundary,
}

impl CompactionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionSource::Hook => "hook.pre_compact",
            CompactionSource::CompactBoundary => "system.compact_boundary",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionSignal {
    pub source: CompactionSource,
    /// Whatever the service attached, typically `{"trigger": "auto", ...}`.
    pub metadata: Value,
}

impl CompactionSignal {
    pub fn hook(metadata: Value) -> Self {
        Self {
            source: CompactionSource::Hook,
            metadata,
        }
    }

    pub fn compact_boundary(metadata: Value) -> Self {
        Self {
            source: CompactionSource::CompactBoundary,
            metadata,
        }
    }

    pub fn trigger(&self) -> String {
        match self.metadata.get("trigger") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => "unknown".to_string(),
            Some(other) => other.to_string(),
        }
    }
}

/// Receiver for compaction signals. Must not fail or block for long.
pub trait CheckpointTrigger: Send + Sync {
    fn on_compaction(&self, signal: CompactionSignal);
}

/// Writes a checkpoint per compaction signal and records it in the event log.
pub struct Checkpointer {
    run_dir: PathBuf,
    logger: RunLogger,
    snapshot: Mutex<CheckpointSnapshot>,
}

impl Checkpointer {
    pub fn new(run_dir: &Path, logger: RunLogger, snapshot: CheckpointSnapshot) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            logger,
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Record the session the stream is running under, so checkpoints written
    /// mid-iteration name it even when the iteration started without one.
    pub fn observe_session(&self, session_id: &str) {
        if session_id.is_empty() {
            return;
        }
        let mut guard = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        if guard.session_id.as_deref() != Some(session_id) {
            guard.session_id = Some(session_id.to_string());
        }
    }

    pub fn snapshot(&self) -> CheckpointSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn record(&self, signal: &CompactionSignal, snapshot: &CheckpointSnapshot) -> Result<PathBuf> {
        let iteration = Some(snapshot.iteration);
        if signal.source == CompactionSource::Hook {
            self.logger.append_event(
                "hook.precompact",
                iteration,
                json!({"hook_event_name": "PreCompact", "input": signal.metadata}),
            )?;
        }
        let path = write_precompact_checkpoint(&self.run_dir, snapshot, &signal.trigger())?;
        self.logger.append_event(
            "checkpoint.precompact",
            iteration,
            json!({"path": path.display().to_string(), "source": signal.source.as_str()}),
        )?;
        Ok(path)
    }
}

impl CheckpointTrigger for Checkpointer {
    fn on_compaction(&self, signal: CompactionSignal) {
        let snapshot = self.snapshot();
        match self.record(&signal, &snapshot) {
            Ok(path) => info!(
                iteration = snapshot.iteration,
                source = signal.source.as_str(),
                path = %path.display(),
                "Wrote pre-compaction checkpoint"
            ),
            Err(e) => {
                warn!(error = %e, source = signal.source.as_str(), "Checkpoint failed");
                let logged = self.logger.append_event(
                    "hook.callback_error",
                    Some(snapshot.iteration),
                    json!({
                        "hook_event_name": "PreCompact",
                        "source": signal.source.as_str(),
                        "error": format!("{:#}", e),
                    }),
                );
                if let Err(log_err) = logged {
                    warn!(error = %log_err, "Failed to record checkpoint error");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::read_events;
    use std::fs;
    use tempfile::tempdir;

    fn snapshot(iteration: u64) -> CheckpointSnapshot {
        CheckpointSnapshot {
            run_id: "001_x".to_string(),
            iteration,
            session_id: Some("s".to_string()),
            cumulative_cost_usd: 0.0,
            cumulative_tokens: 0,
        }
    }

    #[test]
    fn test_trigger_defaults_to_unknown() {
        assert_eq!(CompactionSignal::hook(json!({})).trigger(), "unknown");
        assert_eq!(CompactionSignal::hook(json!({"trigger": "auto"})).trigger(), "auto");
        assert_eq!(CompactionSignal::hook(Value::Null).trigger(), "unknown");
    }

    #[test]
    fn test_hook_signal_logs_hook_and_checkpoint() {
        let dir = tempdir().unwrap();
        let logger = RunLogger::new(dir.path()).unwrap();
        let checkpointer = Checkpointer::new(dir.path(), logger, snapshot(2));

        checkpointer.on_compaction(CompactionSignal::hook(json!({"trigger": "auto"})));

        let events = read_events(dir.path()).unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["hook.precompact", "checkpoint.precompact"]);
        assert_eq!(events[1].iteration, Some(2));
        assert_eq!(events[1].payload["source"], "hook.pre_compact");
        assert!(checkpoints_dir(dir.path()).join(LATEST_CHECKPOINT).exists());
    }

    #[test]
    fn test_inline_signal_logs_checkpoint_only() {
        let dir = tempdir().unwrap();
        let logger = RunLogger::new(dir.path()).unwrap();
        let checkpointer = Checkpointer::new(dir.path(), logger, snapshot(5));

        checkpointer.on_compaction(CompactionSignal::compact_boundary(json!({"trigger": "manual"})));

        let events = read_events(dir.path()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "checkpoint.precompact");
        assert_eq!(events[0].iteration, Some(5));
        assert_eq!(events[0].payload["source"], "system.compact_boundary");

        let latest = fs::read_to_string(checkpoints_dir(dir.path()).join(LATEST_CHECKPOINT)).unwrap();
        assert!(latest.contains("- Trigger: manual"));
        assert!(latest.contains("- Iteration: 5"));
    }

    #[test]
    fn test_observed_session_is_stamped_into_checkpoint() {
        let dir = tempdir().unwrap();
        let logger = RunLogger::new(dir.path()).unwrap();
        let checkpointer = Checkpointer::new(
            dir.path(),
            logger,
            CheckpointSnapshot {
                session_id: None,
                ..snapshot(1)
            },
        );

        checkpointer.observe_session("");
        assert_eq!(checkpointer.snapshot().session_id, None);
        checkpointer.observe_session("sess-new");
        assert_eq!(checkpointer.snapshot().session_id.as_deref(), Some("sess-new"));

        checkpointer.on_compaction(CompactionSignal::hook(json!({"trigger": "auto"})));
        let latest = fs::read_to_string(checkpoints_dir(dir.path()).join(LATEST_CHECKPOINT)).unwrap();
        assert!(latest.contains("sess-new"));
    }

    #[test]
    fn test_checkpoint_failure_is_logged_not_raised() {
        let dir = tempdir().unwrap();
        let logger = RunLogger::new(dir.path()).unwrap();
        // A regular file where the research directory should be makes the write fail.
        fs::write(dir.path().join("research"), "not a directory").unwrap();
        let checkpointer = Checkpointer::new(dir.path(), logger, snapshot(3));

        checkpointer.on_compaction(CompactionSignal::compact_boundary(json!({})));

        let events = read_events(dir.path()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "hook.callback_error");
        assert_eq!(events[0].payload["source"], "system.compact_boundary");
        assert!(events[0].payload["error"].is_string());
    }
}

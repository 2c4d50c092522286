//! Persistent run state for resumable outer-loop execution.
//!
//! `state.json` is the source of truth across process restarts and across the
//! host/container boundary. Older documents stay readable: every field that a
//! previous harness version might have omitted falls back to a sensible default.

use crate::errors::{LaunchError, StateError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_FILE_NAME: &str = "state.json";
pub const STATE_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_PROVIDER: &str = "claude";

/// Lifecycle of a run: `initialized → running → {stopped | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Initialized,
    Running,
    /// Terminal success: a budget ran out or the service reported a soft limit.
    Stopped,
    /// Terminal error.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Initialized => write!(f, "initialized"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Stopped => write!(f, "stopped"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How the outer loop was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// Fresh start on virgin state; overrides replace ceilings.
    Run,
    /// Continue an existing run; overrides extend ceilings.
    Resume,
}

impl LoopMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopMode::Run => "run",
            LoopMode::Resume => "resume",
        }
    }
}

impl std::fmt::Display for LoopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoopMode {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "run" => Ok(LoopMode::Run),
            "resume" => Ok(LoopMode::Resume),
            _ => Err(LaunchError::UnsupportedWorkerMode(s.to_string())),
        }
    }
}

/// Stop ceilings for the outer loop. `None` means no ceiling on that dimension.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLimits {
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    #[serde(default)]
    pub max_time_minutes: Option<u64>,
    #[serde(default)]
    pub max_tokens_total: Option<u64>,
    #[serde(default)]
    pub max_iterations: Option<u64>,
    /// Per-iteration turn cap handed to the agent service; never a stop reason itself.
    #[serde(default)]
    pub max_turns_per_iteration: Option<u32>,
}

/// One entry of the append-only resume history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeEvent {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_history_mode")]
    pub mode: LoopMode,
    #[serde(default)]
    pub details: Map<String, Value>,
}

fn default_history_mode() -> LoopMode {
    LoopMode::Resume
}

/// Who and what a run is; fixed at initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct RunIdentity {
    pub run_id: String,
    pub architecture_name: String,
    pub provider: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
}

/// Persistent record of one run.
///
/// `session_total_cost_usd` is whatever the agent service last reported for the
/// *current* session and is only used to compute deltas. The `cumulative_*`
/// fields span sessions, never decrease, and are what budgets are checked against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RunStateDocument")]
pub struct RunState {
    pub schema_version: u32,
    pub run_id: String,
    pub architecture_name: String,
    pub provider: String,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub iteration: u64,
    pub session_id: Option<String>,
    pub session_total_cost_usd: f64,
    pub cumulative_cost_usd: f64,
    pub cumulative_tokens: u64,
    pub cumulative_wall_time_seconds: f64,
    pub last_result_subtype: Option<String>,
    pub last_stop_reason: Option<String>,
    pub last_stop_detail: Option<String>,
    pub limits: RunLimits,
    pub resume_history: Vec<ResumeEvent>,
}

/// On-disk shape with every field a previous schema may have left out.
#[derive(Deserialize)]
struct RunStateDocument {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    run_id: String,
    architecture_name: String,
    #[serde(default = "default_provider")]
    provider: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    permission_mode: Option<String>,
    #[serde(default)]
    status: RunStatus,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    iteration: u64,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    session_total_cost_usd: f64,
    #[serde(default)]
    cumulative_cost_usd: f64,
    #[serde(default)]
    cumulative_tokens: u64,
    #[serde(default)]
    cumulative_wall_time_seconds: f64,
    #[serde(default)]
    last_result_subtype: Option<String>,
    #[serde(default)]
    last_stop_reason: Option<String>,
    #[serde(default)]
    last_stop_detail: Option<String>,
    #[serde(default)]
    limits: RunLimits,
    #[serde(default)]
    resume_history: Vec<ResumeEvent>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

impl From<RunStateDocument> for RunState {
    fn from(doc: RunStateDocument) -> Self {
        Self {
            schema_version: doc.schema_version,
            run_id: doc.run_id,
            architecture_name: doc.architecture_name,
            provider: doc.provider,
            model: doc.model,
            permission_mode: doc.permission_mode,
            status: doc.status,
            created_at: doc.created_at,
            updated_at: doc.updated_at.unwrap_or(doc.created_at),
            started_at: doc.started_at,
            stopped_at: doc.stopped_at,
            iteration: doc.iteration,
            session_id: doc.session_id,
            session_total_cost_usd: doc.session_total_cost_usd,
            cumulative_cost_usd: doc.cumulative_cost_usd,
            cumulative_tokens: doc.cumulative_tokens,
            cumulative_wall_time_seconds: doc.cumulative_wall_time_seconds,
            last_result_subtype: doc.last_result_subtype,
            last_stop_reason: doc.last_stop_reason,
            last_stop_detail: doc.last_stop_detail,
            limits: doc.limits,
            resume_history: doc.resume_history,
        }
    }
}

impl RunState {
    /// Construct a fresh run state with zeroed accumulators and no session.
    pub fn initialize(identity: RunIdentity, limits: RunLimits) -> Self {
        let now = Utc::now();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            run_id: identity.run_id,
            architecture_name: identity.architecture_name,
            provider: identity.provider,
            model: identity.model,
            permission_mode: identity.permission_mode,
            status: RunStatus::Initialized,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
            iteration: 0,
            session_id: None,
            session_total_cost_usd: 0.0,
            cumulative_cost_usd: 0.0,
            cumulative_tokens: 0,
            cumulative_wall_time_seconds: 0.0,
            last_result_subtype: None,
            last_stop_reason: None,
            last_stop_detail: None,
            limits,
            resume_history: Vec::new(),
        }
    }

    /// A run that has never completed an iteration nor held a session.
    pub fn is_virgin(&self) -> bool {
        self.iteration == 0 && self.session_id.is_none()
    }

    pub fn cumulative_wall_time_minutes(&self) -> f64 {
        self.cumulative_wall_time_seconds / 60.0
    }

    pub fn mark_updated(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Append a resume history entry. Never reorders or deduplicates.
    pub fn add_resume_event(&mut self, mode: LoopMode, details: Map<String, Value>) {
        self.resume_history.push(ResumeEvent {
            timestamp: Utc::now(),
            mode,
            details,
        });
        self.mark_updated();
    }

    /// Enter the `running` state; `started_at` is only set the first time.
    pub fn mark_running(&mut self) {
        self.status = RunStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_stopped(&mut self, reason: &str, detail: Option<String>) {
        self.finish(RunStatus::Stopped, reason, detail);
    }

    pub fn mark_failed(&mut self, reason: &str, detail: Option<String>) {
        self.finish(RunStatus::Failed, reason, detail);
    }

    fn finish(&mut self, status: RunStatus, reason: &str, detail: Option<String>) {
        self.status = status;
        self.stopped_at = Some(Utc::now());
        self.last_stop_reason = Some(reason.to_string());
        self.last_stop_detail = detail;
    }

    /// Serialize exactly as `save` would write it, without touching `updated_at`.
    pub fn to_json(&self) -> String {
        // RunState holds only strings, numbers and maps of JSON values.
        let mut out = serde_json::to_string_pretty(self).unwrap_or_default();
        out.push('\n');
        out
    }

    /// Load run state from JSON.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let content = fs::read_to_string(path).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }

    fn parse(path: &Path, content: &str) -> Result<Self, StateError> {
        let corrupt = |reason: String| StateError::CorruptState {
            path: path.to_path_buf(),
            reason,
        };
        let value: Value = serde_json::from_str(content).map_err(|e| corrupt(e.to_string()))?;
        if !value.is_object() {
            return Err(corrupt("expected a JSON object at the top level".to_string()));
        }
        serde_json::from_value(value).map_err(|e| corrupt(e.to_string()))
    }

    /// Persist run state, stamping `updated_at`.
    ///
    /// The document is written to a sibling temp file and renamed into place so a
    /// crash mid-write never leaves a truncated state file behind.
    pub fn save(&mut self, path: &Path) -> Result<(), StateError> {
        self.mark_updated();
        let io_err = |source| StateError::Io {
            path: path.to_path_buf(),
            source,
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, self.to_json()).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)
    }
}

/// Resolve the state file path for a run directory.
pub fn default_state_path(run_dir: &Path) -> PathBuf {
    run_dir.join(STATE_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample_state() -> RunState {
        RunState::initialize(
            RunIdentity {
                run_id: "001_test".to_string(),
                architecture_name: "ralph_loop".to_string(),
                provider: "claude".to_string(),
                model: Some("claude-sonnet".to_string()),
                permission_mode: Some("acceptEdits".to_string()),
            },
            RunLimits {
                max_cost_usd: Some(25.0),
                max_iterations: Some(10),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_initialize_is_virgin() {
        let state = sample_state();
        assert_eq!(state.status, RunStatus::Initialized);
        assert_eq!(state.iteration, 0);
        assert!(state.session_id.is_none());
        assert_eq!(state.cumulative_cost_usd, 0.0);
        assert_eq!(state.cumulative_tokens, 0);
        assert!(state.is_virgin());
        assert_eq!(state.created_at, state.updated_at);
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let mut state = sample_state();
        state.iteration = 3;
        state.session_id = Some("session-abc".to_string());
        state.cumulative_cost_usd = 1.25;
        state.cumulative_tokens = 999;
        let mut details = Map::new();
        details.insert("extend_cost_usd".to_string(), json!(5.0));
        state.add_resume_event(LoopMode::Resume, details);

        let path = dir.path().join(STATE_FILE_NAME);
        state.save(&path).unwrap();
        let loaded = RunState::load(&path).unwrap();

        assert_eq!(loaded, state);
        assert_eq!(loaded.run_id, "001_test");
        assert_eq!(loaded.iteration, 3);
        assert_eq!(loaded.session_id.as_deref(), Some("session-abc"));
        assert_eq!(loaded.limits.max_cost_usd, Some(25.0));
        assert_eq!(loaded.resume_history.len(), 1);
        assert_eq!(loaded.resume_history[0].details["extend_cost_usd"], json!(5.0));
    }

    #[test]
    fn test_serialization_is_stable_across_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        let mut state = sample_state();
        state.cumulative_wall_time_seconds = 12.345_678_9;
        state.session_total_cost_usd = 0.1 + 0.2;
        state.save(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();

        let reloaded = RunState::load(&path).unwrap();
        assert_eq!(reloaded.to_json(), written);
    }

    #[test]
    fn test_save_stamps_updated_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        let mut state = sample_state();
        let before = state.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        state.save(&path).unwrap();
        assert!(state.updated_at > before);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        fs::write(
            &path,
            r#"{
                "run_id": "007_old",
                "architecture_name": "ralph_loop",
                "created_at": "2026-02-12T00:00:00+00:00",
                "resume_history": [{"details": {"kind": "legacy"}}]
            }"#,
        )
        .unwrap();

        let state = RunState::load(&path).unwrap();
        assert_eq!(state.provider, "claude");
        assert_eq!(state.status, RunStatus::Initialized);
        assert_eq!(state.updated_at, state.created_at);
        assert_eq!(state.schema_version, STATE_SCHEMA_VERSION);
        assert_eq!(state.limits, RunLimits::default());
        assert_eq!(state.resume_history[0].mode, LoopMode::Resume);
    }

    #[test]
    fn test_non_mapping_document_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        fs::write(&path, "[1, 2, 3]").unwrap();
        let err = RunState::load(&path).unwrap_err();
        assert!(matches!(err, StateError::CorruptState { .. }));
    }

    #[test]
    fn test_malformed_document_is_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            RunState::load(&path).unwrap_err(),
            StateError::CorruptState { .. }
        ));

        fs::write(&path, r#"{"run_id": "x"}"#).unwrap();
        assert!(matches!(
            RunState::load(&path).unwrap_err(),
            StateError::CorruptState { .. }
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = RunState::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
    }

    #[test]
    fn test_add_resume_event_appends_in_order() {
        let mut state = sample_state();
        state.add_resume_event(LoopMode::Run, Map::new());
        state.add_resume_event(LoopMode::Resume, Map::new());
        state.add_resume_event(LoopMode::Resume, Map::new());
        let modes: Vec<_> = state.resume_history.iter().map(|e| e.mode).collect();
        assert_eq!(modes, vec![LoopMode::Run, LoopMode::Resume, LoopMode::Resume]);
    }

    #[test]
    fn test_mark_running_keeps_first_start() {
        let mut state = sample_state();
        state.mark_running();
        let first = state.started_at;
        state.mark_running();
        assert_eq!(state.started_at, first);
        assert_eq!(state.status, RunStatus::Running);
    }

    #[test]
    fn test_mark_failed_records_reason() {
        let mut state = sample_state();
        state.mark_failed("runtime_exception", Some("boom".to_string()));
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.last_stop_reason.as_deref(), Some("runtime_exception"));
        assert_eq!(state.last_stop_detail.as_deref(), Some("boom"));
        assert!(state.stopped_at.is_some());
    }

    #[test]
    fn test_loop_mode_parse() {
        assert_eq!("run".parse::<LoopMode>().unwrap(), LoopMode::Run);
        assert_eq!("RESUME".parse::<LoopMode>().unwrap(), LoopMode::Resume);
        assert!("restart".parse::<LoopMode>().is_err());
    }
}

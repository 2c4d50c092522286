//! Append-only structured run record.
//!
//! Two JSONL streams live under `<run>/logs/`:
//! - `events.jsonl`: one line per lifecycle, message, checkpoint, or launcher event
//! - `iterations.jsonl`: one flat metrics line per completed iteration
//!
//! These files are the machine-readable history of a run. Operator diagnostics go
//! through `tracing` instead.

pub mod logger;

pub use logger::{RunLogger, read_events, read_iterations};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LOGS_DIR_NAME: &str = "logs";
pub const EVENTS_LOG_NAME: &str = "events.jsonl";
pub const ITERATIONS_LOG_NAME: &str = "iterations.jsonl";

/// One line of `events.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub iteration: Option<u64>,
    pub payload: Value,
}

/// Metrics recorded for each completed iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u64,
    pub session_id: Option<String>,
    pub result_subtype: String,
    pub is_error: bool,
    pub num_turns: Option<u64>,
    pub messages_seen: u64,
    pub duration_ms: Option<u64>,
    pub duration_api_ms: Option<u64>,
    pub elapsed_seconds_wall: f64,
    pub cost_delta_usd: f64,
    pub cumulative_cost_usd: f64,
    pub token_delta: u64,
    pub cumulative_tokens: u64,
}

/// One line of `iterations.jsonl`: the summary flattened next to its timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub summary: IterationSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_record_is_flat() {
        let record = IterationRecord {
            timestamp: Utc::now(),
            summary: IterationSummary {
                iteration: 2,
                session_id: Some("s".to_string()),
                result_subtype: "success".to_string(),
                is_error: false,
                num_turns: Some(7),
                messages_seen: 40,
                duration_ms: Some(1200),
                duration_api_ms: None,
                elapsed_seconds_wall: 1.5,
                cost_delta_usd: 0.25,
                cumulative_cost_usd: 0.5,
                token_delta: 100,
                cumulative_tokens: 300,
            },
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["iteration"], 2);
        assert_eq!(value["cumulative_tokens"], 300);
        assert!(value.get("summary").is_none());
        assert!(value.get("timestamp").is_some());
    }
}

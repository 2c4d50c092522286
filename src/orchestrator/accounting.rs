//! Per-iteration accounting: cost deltas, token totals, and result classification.

use super::state::{RunState, RunStatus};
use serde_json::{Map, Value};

/// Spend attributable to the iteration that just finished.
///
/// The agent service reports a running total per session. When the result belongs
/// to the session already on record, only the growth since the last report counts;
/// a different or first session counts in full. Never negative.
pub fn compute_cost_delta(result_total: Option<f64>, state: &RunState, result_session: &str) -> f64 {
    let Some(total) = result_total else {
        return 0.0;
    };
    match state.session_id.as_deref() {
        Some(current) if !current.is_empty() && current == result_session => {
            (total - state.session_total_cost_usd).max(0.0)
        }
        _ => total.max(0.0),
    }
}

/// Best-effort token count from a usage payload.
///
/// A top-level `total_tokens` / `totalTokens` number wins. Otherwise every numeric
/// field whose key contains "token" (any case) is summed, searching nested objects
/// and arrays. Non-numeric values under token-ish keys are searched, not counted.
pub fn extract_token_total(usage: Option<&Value>) -> u64 {
    let Some(Value::Object(map)) = usage else {
        return 0;
    };
    if map.is_empty() {
        return 0;
    }

    for preferred in ["total_tokens", "totalTokens"] {
        if let Some(n) = map.get(preferred).and_then(as_count) {
            return n;
        }
    }

    sum_token_fields(map)
}

fn sum_token_fields(map: &Map<String, Value>) -> u64 {
    map.iter()
        .map(|(key, value)| match as_count(value) {
            Some(n) if key.to_lowercase().contains("token") => n,
            _ => walk(value),
        })
        .fold(0, u64::saturating_add)
}

fn walk(node: &Value) -> u64 {
    match node {
        Value::Object(map) => sum_token_fields(map),
        Value::Array(items) => items.iter().map(walk).fold(0, u64::saturating_add),
        _ => 0,
    }
}

/// Non-negative count from a JSON number. Negative values count as zero and
/// floats truncate, saturating at `u64::MAX`.
fn as_count(value: &Value) -> Option<u64> {
    let Value::Number(n) = value else {
        return None;
    };
    if let Some(u) = n.as_u64() {
        return Some(u);
    }
    if n.as_i64().is_some() {
        return Some(0);
    }
    n.as_f64()
        .map(|f| if f.is_finite() && f > 0.0 { f as u64 } else { 0 })
}

/// Terminal classification of a result message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultStop {
    pub reason: &'static str,
    pub status: RunStatus,
}

/// Map a result's subtype and error flag onto a loop stop, if any.
///
/// The service's own budget and turn ceilings are soft stops; any other error is a
/// failure. `None` means keep looping.
pub fn result_stop_reason(result_subtype: &str, is_error: bool) -> Option<ResultStop> {
    match result_subtype {
        "error_max_budget_usd" => Some(ResultStop {
            reason: "sdk_max_budget_reached",
            status: RunStatus::Stopped,
        }),
        "error_max_turns" => Some(ResultStop {
            reason: "sdk_max_turns_reached",
            status: RunStatus::Stopped,
        }),
        _ if is_error => Some(ResultStop {
            reason: "sdk_error",
            status: RunStatus::Failed,
        }),
        _ => None,
    }
}

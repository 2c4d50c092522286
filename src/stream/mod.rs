//! Typed messages from the agent service's stream-json output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Messages from Claude CLI's stream-json output format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentMessage {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        message: Value,
        #[serde(default)]
        session_id: Option<String>,
    },

    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(flatten)]
        data: Map<String, Value>,
    },

    #[serde(rename = "result")]
    Result(ResultMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },

    #[serde(other)]
    Other,
}

/// The terminal message of one conversation invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultMessage {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub session_id: String,
    /// Running total for the whole session, not just this invocation.
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub usage: Option<Value>,
    #[serde(default)]
    pub num_turns: Option<u64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub duration_api_ms: Option<u64>,
    #[serde(default)]
    pub result: Option<String>,
}

const KNOWN_TYPES: [&str; 4] = ["assistant", "user", "system", "result"];

impl AgentMessage {
    /// Parse one line of stream-json output.
    ///
    /// Blank lines and message types this harness does not model yield `Ok(None)`.
    pub fn parse_line(line: &str) -> serde_json::Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(line)?;
        let known = value
            .get("type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| KNOWN_TYPES.contains(&t));
        if !known {
            return Ok(None);
        }
        serde_json::from_value(value).map(Some)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AgentMessage::Assistant { .. } => "assistant",
            AgentMessage::User { .. } => "user",
            AgentMessage::System { .. } => "system",
            AgentMessage::Result(_) => "result",
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            AgentMessage::Assistant { session_id, .. } | AgentMessage::User { session_id, .. } => {
                session_id.as_deref()
            }
            AgentMessage::System { data, .. } => data.get("session_id").and_then(|v| v.as_str()),
            AgentMessage::Result(result) => Some(result.session_id.as_str()),
        }
    }

    /// Compaction metadata when this is an inline `system/compact_boundary` message.
    pub fn compact_metadata(&self) -> Option<Value> {
        match self {
            AgentMessage::System { subtype, data } if subtype == "compact_boundary" => {
                match data.get("compact_metadata") {
                    None | Some(Value::Null) => Some(json!({"trigger": "unknown"})),
                    Some(Value::Object(map)) => Some(Value::Object(map.clone())),
                    Some(other) => Some(json!({"raw": other.to_string()})),
                }
            }
            _ => None,
        }
    }

    /// True when the CLI announces that compaction is about to run.
    pub fn is_compacting_status(&self) -> bool {
        matches!(
            self,
            AgentMessage::System { subtype, data }
                if subtype == "status"
                    && data.get("status").and_then(|s| s.as_str()) == Some("compacting")
        )
    }
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let path = || {
        input
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", path()),
        "Write" => format!("Creating: {}", path()),
        "Edit" => format!("Editing: {}", path()),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        "Glob" | "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 30))
                .unwrap_or_else(|| "*".to_string());
            format!("{}: {}", name, pattern)
        }
        _ => name.to_string(),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate a string with ellipsis
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

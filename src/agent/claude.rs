use super::{Conversation, MessageStream, QueryOptions};
use crate::compaction::{CheckpointTrigger, CompactionSignal};
use crate::stream::{AgentMessage, ContentBlock, describe_tool_use};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_CLAUDE_CMD: &str = "claude";

/// Drives the `claude` CLI in print mode with stream-json output.
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    claude_cmd: String,
}

impl Default for ClaudeCli {
    fn default() -> Self {
        Self::new(DEFAULT_CLAUDE_CMD)
    }
}

impl ClaudeCli {
    pub fn new(claude_cmd: impl Into<String>) -> Self {
        Self {
            claude_cmd: claude_cmd.into(),
        }
    }

    /// CLI flags for one invocation. The prompt itself goes over stdin.
    pub fn build_args(options: &QueryOptions) -> Vec<String> {
        let mut args: Vec<String> = ["--print", "--output-format", "stream-json", "--verbose"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(ref session) = options.resume {
            args.push("--resume".into());
            args.push(session.clone());
        }
        if let Some(ref model) = options.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        if let Some(ref mode) = options.permission_mode {
            args.push("--permission-mode".into());
            args.push(mode.clone());
        }
        if let Some(turns) = options.max_turns {
            args.push("--max-turns".into());
            args.push(turns.to_string());
        }
        if let Some(budget) = options.max_budget_usd {
            args.push("--max-budget-usd".into());
            args.push(format!("{:.6}", budget));
        }
        if let Some(ref system_prompt) = options.system_prompt {
            args.push("--append-system-prompt".into());
            args.push(system_prompt.clone());
        }
        args
    }
}

struct CliStream {
    lines: Lines<BufReader<ChildStdout>>,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    hook: Option<Arc<dyn CheckpointTrigger>>,
    saw_result: bool,
    done: bool,
}

impl CliStream {
    async fn next_message(&mut self) -> Option<Result<AgentMessage>> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return self.finish().await,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e).context("Failed to read Claude output"));
                }
            };
            match AgentMessage::parse_line(&line) {
                Ok(Some(msg)) => {
                    self.observe(&msg);
                    return Some(Ok(msg));
                }
                Ok(None) => continue,
                Err(e) if is_result_line(&line) => {
                    return Some(Err(e).context("Failed to parse Claude result message"));
                }
                Err(_) => {
                    debug!(line = %line, "Ignoring non-JSON output from claude");
                    continue;
                }
            }
        }
    }

    fn observe(&mut self, msg: &AgentMessage) {
        match msg {
            AgentMessage::Result(_) => self.saw_result = true,
            AgentMessage::Assistant { message, .. } => {
                for block in &message.content {
                    if let ContentBlock::ToolUse { name, input, .. } = block {
                        debug!(tool = %name, "{}", describe_tool_use(name, input));
                    }
                }
            }
            AgentMessage::System { data, .. } if msg.is_compacting_status() => {
                if let Some(ref hook) = self.hook {
                    hook.on_compaction(CompactionSignal::hook(Value::Object(data.clone())));
                }
            }
            _ => {}
        }
    }

    async fn finish(&mut self) -> Option<Result<AgentMessage>> {
        self.done = true;
        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(e) => return Some(Err(e).context("Failed to wait for Claude process")),
        };
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        debug!(exit_code = ?status.code(), "Claude process exited");
        if status.success() || self.saw_result {
            return None;
        }
        Some(Err(anyhow::anyhow!(
            "Claude exited with code {}: {}",
            status.code().unwrap_or(-1),
            stderr.trim()
        )))
    }
}

/// A line that claims to be the terminal result, whether or not it deserializes.
fn is_result_line(line: &str) -> bool {
    serde_json::from_str::<Value>(line)
        .ok()
        .is_some_and(|v| v.get("type").and_then(|t| t.as_str()) == Some("result"))
}

#[async_trait]
impl Conversation for ClaudeCli {
    async fn query(&self, prompt: &str, options: QueryOptions) -> Result<MessageStream> {
        let args = Self::build_args(&options);
        debug!(cmd = %self.claude_cmd, args = ?args, cwd = %options.cwd.display(), "Spawning claude");

        let mut child = Command::new(&self.claude_cmd)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&options.cwd)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn Claude process `{}`", self.claude_cmd))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await.context("Failed to close stdin")?;
        }

        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });

        let state = CliStream {
            lines: BufReader::new(stdout).lines(),
            child,
            stderr,
            hook: options.pre_compact,
            saw_result: false,
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            state.next_message().await.map(|item| (item, state))
        });
        Ok(stream.boxed())
    }
}

//! The conversation seam between the outer loop and the agent service.
//!
//! The loop never talks to the service directly. It hands a prompt and
//! [`QueryOptions`] to a [`Conversation`] and consumes the resulting stream of
//! [`AgentMessage`]s, which must contain exactly one `result` message.
//! Real implementation: [`ClaudeCli`]. Test double: `testing::ScriptedConversation`.

mod claude;

pub use claude::ClaudeCli;

use crate::compaction::CheckpointTrigger;
use crate::stream::AgentMessage;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::PathBuf;
use std::sync::Arc;

pub type MessageStream = BoxStream<'static, Result<AgentMessage>>;

/// Per-invocation settings for one conversation turn of the outer loop.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub cwd: PathBuf,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    /// Session to continue; `None` starts a fresh session.
    pub resume: Option<String>,
    pub max_turns: Option<u32>,
    /// Spend cap for this invocation.
    pub max_budget_usd: Option<f64>,
    pub system_prompt: Option<String>,
    /// Invoked synchronously when the service is about to compact its context.
    pub pre_compact: Option<Arc<dyn CheckpointTrigger>>,
}

impl std::fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("cwd", &self.cwd)
            .field("model", &self.model)
            .field("permission_mode", &self.permission_mode)
            .field("resume", &self.resume)
            .field("max_turns", &self.max_turns)
            .field("max_budget_usd", &self.max_budget_usd)
            .field("has_pre_compact_hook", &self.pre_compact.is_some())
            .finish()
    }
}

#[async_trait]
pub trait Conversation: Send + Sync {
    async fn query(&self, prompt: &str, options: QueryOptions) -> Result<MessageStream>;
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_scripted_conversation_replays_in_order() {
        let convo = ScriptedConversation::new(vec![
            vec![assistant_text("hello"), result("s1", 0.5, 10)],
            vec![result("s1", 0.9, 10)],
        ]);

        let first: Vec<_> = convo
            .query("p1", QueryOptions::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].as_ref().unwrap().type_name(), "assistant");

        let second: Vec<_> = convo
            .query("p2", QueryOptions::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(second.len(), 1);

        assert!(convo.query("p3", QueryOptions::default()).await.is_err());
        let prompts: Vec<_> = convo.calls().into_iter().map(|c| c.prompt).collect();
        assert_eq!(prompts, vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_query_options_debug_hides_hook() {
        let options = QueryOptions {
            resume: Some("s".to_string()),
            ..Default::default()
        };
        let rendered = format!("{:?}", options);
        assert!(rendered.contains("has_pre_compact_hook: false"));
    }
}

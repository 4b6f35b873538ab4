//! 自动开场白：参考频道近期消息与知识库，让 LLM 写一句新话题

use std::sync::Arc;

use crate::core::SchedulingError;
use crate::knowledge::Retriever;
use crate::llm::{ChatMessage, LlmClient};
use crate::store::{ConversationStore, TurnRole};

const STARTER_SYSTEM_PROMPT: &str = "You open new conversations in a group chat. \
Write one short, friendly message that starts a fresh topic the group would enjoy. \
Do not repeat topics from the recent messages. Reply with the message only.";

pub struct ConversationStarter {
    llm: Arc<dyn LlmClient>,
    conversations: ConversationStore,
    retriever: Option<Arc<Retriever>>,
    history_limit: usize,
    retrieval_k: usize,
}

impl ConversationStarter {
    pub fn new(llm: Arc<dyn LlmClient>, conversations: ConversationStore, history_limit: usize) -> Self {
        Self {
            llm,
            conversations,
            retriever: None,
            history_limit,
            retrieval_k: 3,
        }
    }

    /// 合成时附带知识库检索结果
    pub fn with_knowledge(mut self, retriever: Arc<Retriever>, k: usize) -> Self {
        self.retriever = Some(retriever);
        self.retrieval_k = k;
        self
    }

    pub async fn compose(&self, channel_id: &str) -> Result<String, SchedulingError> {
        let recent = self
            .conversations
            .recent_channel_turns(channel_id, self.history_limit)
            .await?;
        let transcript = recent
            .iter()
            .map(|t| {
                let speaker = match (t.role, t.speaker_name.as_deref()) {
                    (_, Some(name)) => name,
                    (TurnRole::User, None) => "User",
                    (TurnRole::Agent, None) => "Agent",
                };
                format!("{}: {}", speaker, t.content)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut system = STARTER_SYSTEM_PROMPT.to_string();
        if let Some(retriever) = &self.retriever {
            let seed = if transcript.is_empty() { "interesting topics" } else { transcript.as_str() };
            let context = retriever.context_for(seed, self.retrieval_k).await;
            if !context.is_empty() {
                system.push_str("\n\nYou may draw on this knowledge:\n");
                system.push_str(&context);
            }
        }

        let prompt = if transcript.is_empty() {
            "Write a conversation starter.".to_string()
        } else {
            format!("Write a conversation starter.\n\nRecent messages:\n{}", transcript)
        };

        let text = self
            .llm
            .complete(&[ChatMessage::system(system), ChatMessage::user(prompt)])
            .await
            .map_err(SchedulingError::Starter)?;
        let text = text.trim().trim_matches('"').trim().to_string();
        if text.is_empty() {
            return Err(SchedulingError::Starter("LLM returned an empty starter".to_string()));
        }
        tracing::debug!(channel_id, history = recent.len(), "starter composed");
        Ok(text)
    }
}

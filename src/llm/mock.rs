//! Mock LLM 客户端（无 API Key 时的回退，也用于测试）
//!
//! 取最后一条 User 消息，回显为一句可读文本。

use async_trait::async_trait;

use crate::llm::{ChatMessage, ChatRole, LlmClient};

#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.trim())
            .unwrap_or("(no input)");
        let first_line = last_user.lines().next().unwrap_or_default();
        Ok(format!("Echo from Mock: {}", first_line))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

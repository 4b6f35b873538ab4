//! 外部协作方：文本生成与消息投递
//!
//! 编排器只依赖 `Generator` / `Deliverer` 两个 trait；超时由编排器统一包裹，
//! 这里的 HTTP 客户端另设请求超时作为兜底。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::agents::AgentDefinition;
use crate::llm::{ChatMessage, LlmClient};
use crate::store::{Turn, TurnRole};

/// 为某个角色生成下一条发言
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        agent: &AgentDefinition,
        history: &[Turn],
        context: &str,
    ) -> Result<String, String>;
}

/// 把已提交的发言投递到频道
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, agent: &AgentDefinition, text: &str, channel_id: &str) -> Result<(), String>;
}

#[derive(Debug, Serialize)]
struct HistoryEntry<'a> {
    role: TurnRole,
    speaker_name: Option<&'a str>,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    agent_name: &'a str,
    mention_handle: &'a str,
    history: Vec<HistoryEntry<'a>>,
    context: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    #[serde(alias = "response", alias = "content")]
    text: String,
}

fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// POST 到角色的 generation_endpoint；响应为 `{"text": ...}` 或纯文本
pub struct HttpGenerator {
    client: Client,
}

impl HttpGenerator {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(
        &self,
        agent: &AgentDefinition,
        history: &[Turn],
        context: &str,
    ) -> Result<String, String> {
        if agent.generation_endpoint.is_empty() {
            return Err(format!("agent '{}' has no generation endpoint", agent.name));
        }
        let body = GenerationRequest {
            agent_name: &agent.name,
            mention_handle: &agent.mention_handle,
            history: history
                .iter()
                .map(|t| HistoryEntry {
                    role: t.role,
                    speaker_name: t.speaker_name.as_deref(),
                    content: &t.content,
                })
                .collect(),
            context,
        };
        let resp = self
            .client
            .post(&agent.generation_endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        let status = resp.status();
        let raw = resp.text().await.map_err(|e| format!("read body: {}", e))?;
        if !status.is_success() {
            return Err(format!("HTTP {}: {}", status, raw.chars().take(200).collect::<String>()));
        }
        Ok(match serde_json::from_str::<GenerationResponse>(&raw) {
            Ok(parsed) => parsed.text,
            Err(_) => raw,
        })
    }
}

/// 直接调用 OpenAI 兼容模型扮演角色
pub struct LlmGenerator {
    llm: Arc<dyn LlmClient>,
    end_marker: String,
}

impl LlmGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, end_marker: impl Into<String>) -> Self {
        Self {
            llm,
            end_marker: end_marker.into(),
        }
    }

    fn build_messages(&self, agent: &AgentDefinition, history: &[Turn], context: &str) -> Vec<ChatMessage> {
        let mut system = format!(
            "You are {name} in a group chat with other participants. Reply as {name} only, \
             in one short message, without prefixing your name. \
             If the conversation has reached a natural end, append {marker}.",
            name = agent.name,
            marker = self.end_marker,
        );
        if !context.trim().is_empty() {
            system.push_str("\n\nRelevant knowledge:\n");
            system.push_str(context);
        }

        let mut messages = vec![ChatMessage::system(system)];
        for turn in history {
            let own = turn.role == TurnRole::Agent
                && turn
                    .speaker_name
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case(&agent.name));
            if own {
                messages.push(ChatMessage::assistant(turn.content.clone()));
            } else {
                let speaker = turn.speaker_name.as_deref().unwrap_or("User");
                messages.push(ChatMessage::user(format!("{}: {}", speaker, turn.content)));
            }
        }
        messages
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(
        &self,
        agent: &AgentDefinition,
        history: &[Turn],
        context: &str,
    ) -> Result<String, String> {
        let messages = self.build_messages(agent, history, context);
        self.llm.complete(&messages).await
    }
}

#[derive(Debug, Serialize)]
struct DeliveryRequest<'a> {
    channel_id: &'a str,
    agent_name: &'a str,
    content: &'a str,
}

/// POST 到角色的 delivery_endpoint，2xx 即视为已送达
pub struct HttpDeliverer {
    client: Client,
}

impl HttpDeliverer {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl Deliverer for HttpDeliverer {
    async fn deliver(&self, agent: &AgentDefinition, text: &str, channel_id: &str) -> Result<(), String> {
        if agent.delivery_endpoint.is_empty() {
            return Err(format!("agent '{}' has no delivery endpoint", agent.name));
        }
        let resp = self
            .client
            .post(&agent.delivery_endpoint)
            .json(&DeliveryRequest {
                channel_id,
                agent_name: &agent.name,
                content: text,
            })
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        Ok(())
    }
}

/// 只写日志，不外发
#[derive(Debug, Default)]
pub struct LogDeliverer;

#[async_trait]
impl Deliverer for LogDeliverer {
    async fn deliver(&self, agent: &AgentDefinition, text: &str, channel_id: &str) -> Result<(), String> {
        tracing::info!(agent = %agent.name, channel_id, chars = text.chars().count(), "delivered: {}", text);
        Ok(())
    }
}

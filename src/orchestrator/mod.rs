//! 对话编排器：轮转发言状态机
//!
//! 每次请求：解析会话 → 记录用户消息 → 循环（选择发言者 → 生成 → 清洗 → 持久化 → 投递），
//! 直到会话终止或本次请求的角色轮次用尽。
//!
//! - 先提交、后投递：投递失败不回滚已提交的轮次
//! - 生成超时 / 失败只中止当前轮次，不重试
//! - 同一会话的请求由 SessionLocks 串行化

pub mod locks;
pub mod sanitize;
pub mod speaker;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::agents::{AgentDefinition, AgentId, AgentRegistry, Deliverer, Generator};
use crate::config::OrchestratorSection;
use crate::core::OrchestrationError;
use crate::knowledge::Retriever;
use crate::store::{ConversationSession, ConversationStore, NewTurn, SessionId, Turn, TurnRole};

pub use locks::SessionLocks;
pub use sanitize::{sanitize, Sanitized};
pub use speaker::{select_speaker, SpeakerContext};

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_turns: usize,
    pub turns_per_request: usize,
    pub history_window: usize,
    pub generation_timeout: Duration,
    pub delivery_timeout: Duration,
    pub retrieval_k: usize,
    pub end_marker: String,
}

impl From<&OrchestratorSection> for OrchestratorSettings {
    fn from(cfg: &OrchestratorSection) -> Self {
        Self {
            max_turns: cfg.max_turns.max(1),
            turns_per_request: cfg.turns_per_request,
            history_window: cfg.history_window.max(1),
            generation_timeout: Duration::from_secs(cfg.generation_timeout_secs.max(1)),
            delivery_timeout: Duration::from_secs(cfg.delivery_timeout_secs.max(1)),
            retrieval_k: cfg.retrieval_k,
            end_marker: cfg.end_marker.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&OrchestratorSection::default())
    }
}

/// 一次编排请求（HTTP 与调度器共用）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrateRequest {
    pub user_query: String,
    pub channel_id: String,
    #[serde(default)]
    pub initiator_agent: Option<String>,
    #[serde(default)]
    pub initiator_mention: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub is_new_conversation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrateResponse {
    pub status: &'static str,
    pub session_id: SessionId,
    /// 本次请求提交的角色轮次
    pub turns: Vec<Turn>,
    pub terminated: bool,
}

pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    conversations: ConversationStore,
    retriever: Arc<Retriever>,
    generator: Arc<dyn Generator>,
    deliverer: Arc<dyn Deliverer>,
    settings: OrchestratorSettings,
    locks: SessionLocks,
    rng: Mutex<StdRng>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        conversations: ConversationStore,
        retriever: Arc<Retriever>,
        generator: Arc<dyn Generator>,
        deliverer: Arc<dyn Deliverer>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            conversations,
            retriever,
            generator,
            deliverer,
            settings,
            locks: SessionLocks::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// 固定随机种子（测试用）
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    /// 处理一次用户（或调度器）消息
    pub async fn orchestrate(&self, req: OrchestrateRequest) -> Result<OrchestrateResponse, OrchestrationError> {
        let query = req.user_query.trim();
        if query.is_empty() {
            return Err(OrchestrationError::InvalidRequest("user_query must not be empty".into()));
        }
        let channel_id = req.channel_id.trim();
        if channel_id.is_empty() {
            return Err(OrchestrationError::InvalidRequest("channel_id must not be empty".into()));
        }
        if self.registry.is_empty() {
            return Err(OrchestrationError::NoAgents);
        }
        let initiator = self.resolve_initiator(&req)?;

        let session = self.resolve_session(&req, channel_id).await?;
        let _guard = self.locks.acquire(&session.session_id).await;
        // 持锁后重新读取，排队期间会话可能已被终止
        let session = self
            .conversations
            .get_session(&session.session_id)
            .await?
            .ok_or_else(|| OrchestrationError::SessionNotFound(session.session_id.clone()))?;
        if session.terminated {
            return Err(OrchestrationError::SessionTerminated(session.session_id));
        }
        let session_id = session.session_id.clone();

        tracing::info!(
            session_id = %session_id,
            channel_id,
            turn_count = session.turn_count,
            "orchestrating"
        );

        let reached_limit = session.turn_count + 1 >= self.settings.max_turns;
        let user_turn = self
            .conversations
            .append_turn(&session_id, NewTurn::user(req.display_name.clone(), query), reached_limit)
            .await?
            .ok_or_else(|| OrchestrationError::SessionTerminated(session_id.clone()))?;

        let context = self
            .retriever
            .context_for(query, self.settings.retrieval_k)
            .await;

        let mut committed = Vec::new();
        let mut last = user_turn;
        let mut terminated = reached_limit;

        for _ in 0..self.settings.turns_per_request {
            if terminated {
                break;
            }
            let history = self
                .conversations
                .recent_turns(&session_id, self.settings.history_window)
                .await?;
            let agent = self.next_speaker(&session_id, &last, initiator).await?;

            match self
                .take_turn(&session_id, channel_id, agent, &history, &context)
                .await?
            {
                TurnOutcome::Committed { turn, ended } => {
                    terminated = ended;
                    last = turn.clone();
                    committed.push(turn);
                }
                TurnOutcome::EndedSilently => {
                    terminated = true;
                }
            }
        }

        if terminated {
            tracing::info!(session_id = %session_id, "session terminated");
        }
        Ok(OrchestrateResponse {
            status: "success",
            session_id,
            turns: committed,
            terminated,
        })
    }

    /// 会话的全部轮次
    pub async fn history(&self, session_id: &str) -> Result<Vec<Turn>, OrchestrationError> {
        if self.conversations.get_session(session_id).await?.is_none() {
            return Err(OrchestrationError::SessionNotFound(session_id.to_string()));
        }
        Ok(self.conversations.turns(session_id).await?)
    }

    fn resolve_initiator(&self, req: &OrchestrateRequest) -> Result<Option<AgentId>, OrchestrationError> {
        let by_name = req
            .initiator_agent
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let by_mention = req
            .initiator_mention
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        if let Some(name) = by_name {
            let agent = self
                .registry
                .find_by_name(name)
                .or_else(|| self.registry.find_by_mention(name))
                .ok_or_else(|| OrchestrationError::UnknownAgent(name.to_string()))?;
            return Ok(Some(agent.id));
        }
        if let Some(handle) = by_mention {
            let agent = self
                .registry
                .find_by_mention(handle)
                .ok_or_else(|| OrchestrationError::UnknownAgent(handle.to_string()))?;
            return Ok(Some(agent.id));
        }
        Ok(None)
    }

    async fn resolve_session(
        &self,
        req: &OrchestrateRequest,
        channel_id: &str,
    ) -> Result<ConversationSession, OrchestrationError> {
        if let Some(id) = req.session_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let session = self
                .conversations
                .get_session(id)
                .await?
                .ok_or_else(|| OrchestrationError::SessionNotFound(id.to_string()))?;
            if session.terminated {
                return Err(OrchestrationError::SessionTerminated(session.session_id));
            }
            return Ok(session);
        }

        // 频道级互斥，避免并发请求各自新建会话
        let _channel = self.locks.acquire(&format!("channel:{}", channel_id)).await;
        let active = self.conversations.active_session(channel_id).await?;
        match active {
            Some(session) if !req.is_new_conversation => Ok(session),
            Some(session) => {
                let _guard = self.locks.acquire(&session.session_id).await;
                self.conversations.terminate(&session.session_id).await?;
                tracing::info!(session_id = %session.session_id, "previous session closed for new conversation");
                Ok(self.conversations.create_session(channel_id).await?)
            }
            None => Ok(self.conversations.create_session(channel_id).await?),
        }
    }

    async fn next_speaker<'a>(
        &'a self,
        session_id: &str,
        last: &Turn,
        initiator: Option<AgentId>,
    ) -> Result<&'a AgentDefinition, OrchestrationError> {
        // 不依赖历史窗口：窗口再小也能排除上一位角色
        let previous_name = self.conversations.last_agent_speaker(session_id).await?;
        let first_agent_turn = previous_name.is_none();
        let previous_agent = previous_name
            .as_deref()
            .and_then(|name| self.registry.find_by_name(name))
            .map(|a| a.id);
        let last_speaker = match last.role {
            TurnRole::Agent => last
                .speaker_name
                .as_deref()
                .and_then(|name| self.registry.find_by_name(name))
                .map(|a| a.id),
            TurnRole::User => None,
        };

        let ctx = SpeakerContext {
            last_text: &last.content,
            last_speaker,
            previous_agent,
            initiator,
            first_agent_turn,
        };
        let id = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            select_speaker(&self.registry, &ctx, &mut *rng)
        };
        id.and_then(|id| self.registry.get(id))
            .ok_or(OrchestrationError::NoAgents)
    }

    async fn take_turn(
        &self,
        session_id: &str,
        channel_id: &str,
        agent: &AgentDefinition,
        history: &[Turn],
        context: &str,
    ) -> Result<TurnOutcome, OrchestrationError> {
        let timeout = self.settings.generation_timeout;
        let raw = match tokio::time::timeout(timeout, self.generator.generate(agent, history, context)).await {
            Err(_) => {
                tracing::warn!(session_id, agent = %agent.name, "generation timed out");
                return Err(OrchestrationError::GenerationTimeout {
                    agent: agent.name.clone(),
                    after: timeout,
                });
            }
            Ok(Err(reason)) => {
                tracing::warn!(session_id, agent = %agent.name, error = %reason, "generation failed");
                return Err(OrchestrationError::Generation {
                    agent: agent.name.clone(),
                    reason,
                });
            }
            Ok(Ok(raw)) => raw,
        };

        let Sanitized { text, ended } = sanitize(&raw, agent, &self.settings.end_marker);
        if text.is_empty() {
            if ended {
                self.conversations.terminate(session_id).await?;
                return Ok(TurnOutcome::EndedSilently);
            }
            return Err(OrchestrationError::EmptyGeneration(agent.name.clone()));
        }

        let turn_count = history.last().map_or(0, |t| t.order + 1);
        let terminate = ended || turn_count + 1 >= self.settings.max_turns;
        let turn = self
            .conversations
            .append_turn(session_id, NewTurn::agent(agent.name.clone(), text), terminate)
            .await?
            .ok_or_else(|| OrchestrationError::SessionTerminated(session_id.to_string()))?;
        tracing::info!(session_id, agent = %agent.name, order = turn.order, ended, "turn committed");

        let delivery = tokio::time::timeout(
            self.settings.delivery_timeout,
            self.deliverer.deliver(agent, &turn.content, channel_id),
        )
        .await;
        let failure = match delivery {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(_) => Some(format!("timed out after {:?}", self.settings.delivery_timeout)),
        };
        if let Some(reason) = failure {
            tracing::warn!(session_id, agent = %agent.name, order = turn.order, error = %reason, "delivery failed");
            return Err(OrchestrationError::Delivery {
                agent: agent.name.clone(),
                reason,
            });
        }

        Ok(TurnOutcome::Committed { turn, ended: terminate })
    }
}

enum TurnOutcome {
    Committed { turn: Turn, ended: bool },
    /// 仅有结束标记，会话终止但不提交空轮次
    EndedSilently,
}

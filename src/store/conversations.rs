//! 会话与轮次记录
//!
//! 轮次按 `(session_id, turn_order)` 存储；追加轮次与更新 `turn_count` 在同一事务中完成，
//! 保证 `turn_count` 始终等于已持久化轮次数，且 order 连续无空洞。

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use crate::core::StoreError;

/// 会话 ID
pub type SessionId = String;

/// 一次有界的多轮对话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: SessionId,
    pub channel_id: String,
    pub created_at: DateTime<Utc>,
    pub turn_count: usize,
    pub terminated: bool,
}

/// 发言者类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Agent,
}

impl TurnRole {
    fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Agent => "agent",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "user" => Ok(TurnRole::User),
            "agent" => Ok(TurnRole::Agent),
            other => Err(StoreError::Corrupt(format!("unknown turn role '{}'", other))),
        }
    }
}

/// 会话中的一条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub session_id: SessionId,
    pub order: usize,
    pub role: TurnRole,
    /// role = agent 时为角色名；role = user 时为用户显示名（可选）
    pub speaker_name: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// 待追加的轮次（order 由存储分配）
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub role: TurnRole,
    pub speaker_name: Option<String>,
    pub content: String,
}

impl NewTurn {
    pub fn user(display_name: Option<String>, content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            speaker_name: display_name,
            content: content.into(),
        }
    }

    pub fn agent(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Agent,
            speaker_name: Some(name.into()),
            content: content.into(),
        }
    }
}

/// 会话存储句柄（共享连接池，不负责连接生命周期）
#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

impl ConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 新建会话（0 轮）
    pub async fn create_session(&self, channel_id: &str) -> Result<ConversationSession, StoreError> {
        let session = ConversationSession {
            session_id: format!("session_{}", uuid::Uuid::new_v4()),
            channel_id: channel_id.to_string(),
            created_at: Utc::now(),
            turn_count: 0,
            terminated: false,
        };
        sqlx::query(
            "INSERT INTO sessions (session_id, channel_id, created_at, turn_count, terminated)
             VALUES (?, ?, ?, 0, 0)",
        )
        .bind(&session.session_id)
        .bind(&session.channel_id)
        .bind(format_time(&session.created_at))
        .execute(&self.pool)
        .await?;
        tracing::debug!(session_id = %session.session_id, channel_id, "session created");
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<ConversationSession>, StoreError> {
        let row = sqlx::query(
            "SELECT session_id, channel_id, created_at, turn_count, terminated
             FROM sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    /// 频道中最近创建且未终止的会话
    pub async fn active_session(&self, channel_id: &str) -> Result<Option<ConversationSession>, StoreError> {
        let row = sqlx::query(
            "SELECT session_id, channel_id, created_at, turn_count, terminated
             FROM sessions WHERE channel_id = ? AND terminated = 0
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    /// 追加一轮；`terminate` 为真时同时将会话标记为终止
    ///
    /// 会话已终止时返回 Ok(None)，不写入。
    pub async fn append_turn(
        &self,
        session_id: &str,
        turn: NewTurn,
        terminate: bool,
    ) -> Result<Option<Turn>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT turn_count, terminated FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(StoreError::Query(format!("session {} does not exist", session_id)));
        };
        let turn_count: i64 = row.try_get("turn_count")?;
        let terminated: bool = row.try_get("terminated")?;
        if terminated {
            return Ok(None);
        }

        let committed = Turn {
            session_id: session_id.to_string(),
            order: turn_count as usize,
            role: turn.role,
            speaker_name: turn.speaker_name,
            content: turn.content,
            timestamp: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO turns (session_id, turn_order, role, speaker_name, content, timestamp)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(turn_count)
        .bind(committed.role.as_str())
        .bind(&committed.speaker_name)
        .bind(&committed.content)
        .bind(format_time(&committed.timestamp))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE sessions SET turn_count = ?, terminated = ? WHERE session_id = ?")
            .bind(turn_count + 1)
            .bind(terminate)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(committed))
    }

    /// 不追加轮次，直接终止会话
    pub async fn terminate(&self, session_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET terminated = 1 WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// 会话的全部轮次（按 order 升序）
    pub async fn turns(&self, session_id: &str) -> Result<Vec<Turn>, StoreError> {
        let rows = sqlx::query(
            "SELECT session_id, turn_order, role, speaker_name, content, timestamp
             FROM turns WHERE session_id = ? ORDER BY turn_order ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(turn_from_row).collect()
    }

    /// 会话最近 `limit` 轮（按 order 升序返回）
    pub async fn recent_turns(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>, StoreError> {
        let rows = sqlx::query(
            "SELECT session_id, turn_order, role, speaker_name, content, timestamp
             FROM turns WHERE session_id = ? ORDER BY turn_order DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut turns = rows.iter().map(turn_from_row).collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    /// 会话中最近一个角色轮次的发言者；尚无角色发言时为 None
    pub async fn last_agent_speaker(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        let speaker: Option<Option<String>> = sqlx::query_scalar(
            "SELECT speaker_name FROM turns
             WHERE session_id = ? AND role = 'agent'
             ORDER BY turn_order DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(speaker.flatten())
    }

    /// 频道内跨会话的最近 `limit` 轮（按时间升序），供自动开场参考
    pub async fn recent_channel_turns(&self, channel_id: &str, limit: usize) -> Result<Vec<Turn>, StoreError> {
        let rows = sqlx::query(
            "SELECT t.session_id, t.turn_order, t.role, t.speaker_name, t.content, t.timestamp
             FROM turns t JOIN sessions s ON s.session_id = t.session_id
             WHERE s.channel_id = ?
             ORDER BY t.timestamp DESC, t.turn_order DESC LIMIT ?",
        )
        .bind(channel_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut turns = rows.iter().map(turn_from_row).collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }
}

/// 固定精度，保证字符串排序与时间排序一致
pub(crate) fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

fn session_from_row(row: &SqliteRow) -> Result<ConversationSession, StoreError> {
    let created_at: String = row.try_get("created_at")?;
    let turn_count: i64 = row.try_get("turn_count")?;
    Ok(ConversationSession {
        session_id: row.try_get("session_id")?,
        channel_id: row.try_get("channel_id")?,
        created_at: parse_time(&created_at)?,
        turn_count: turn_count as usize,
        terminated: row.try_get("terminated")?,
    })
}

fn turn_from_row(row: &SqliteRow) -> Result<Turn, StoreError> {
    let order: i64 = row.try_get("turn_order")?;
    let role: String = row.try_get("role")?;
    let timestamp: String = row.try_get("timestamp")?;
    Ok(Turn {
        session_id: row.try_get("session_id")?,
        order: order as usize,
        role: TurnRole::parse(&role)?,
        speaker_name: row.try_get("speaker_name")?,
        content: row.try_get("content")?,
        timestamp: parse_time(&timestamp)?,
    })
}

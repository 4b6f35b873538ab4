//! 错误分类
//!
//! - StoreError::Connectivity：存储不可达，启动时重试耗尽即致命
//! - OrchestrationError：只中止当前轮次，已提交的轮次不回滚
//! - CrawlError / IndexError：单页、单块错误在爬虫内部记录并跳过
//! - SchedulingError：记录后调度循环继续
//! - StartupError：装配阶段失败，进程退出

use std::time::Duration;

use thiserror::Error;

/// 持久化存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    /// 连接不可用（连接失败、池超时、探活失败），重试耗尽后不做进程内恢复
    #[error("Store unreachable after {attempts} attempt(s): {reason}")]
    Connectivity { attempts: u32, reason: String },

    #[error("Store query failed: {0}")]
    Query(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connectivity {
                attempts: 1,
                reason: e.to_string(),
            },
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// 语义索引写入 / 检索错误
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Index write failed: {0}")]
    Write(String),

    #[error("Index read failed: {0}")]
    Read(String),
}

/// 单轮编排错误：中止当前轮次并返回给调用方
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Generation for agent '{agent}' timed out after {after:?}")]
    GenerationTimeout { agent: String, after: Duration },

    #[error("Generation for agent '{agent}' failed: {reason}")]
    Generation { agent: String, reason: String },

    #[error("Agent '{0}' produced no visible text")]
    EmptyGeneration(String),

    #[error("Delivery for agent '{agent}' failed: {reason}")]
    Delivery { agent: String, reason: String },

    #[error("Session {0} is terminated")]
    SessionTerminated(String),

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("No agents registered")]
    NoAgents,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestrationError {
    /// 用于日志与 HTTP 响应体的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationError::GenerationTimeout { .. } => "generation_timeout",
            OrchestrationError::Generation { .. } => "generation_error",
            OrchestrationError::EmptyGeneration(_) => "empty_generation",
            OrchestrationError::Delivery { .. } => "delivery_error",
            OrchestrationError::SessionTerminated(_) => "session_terminated",
            OrchestrationError::SessionNotFound(_) => "session_not_found",
            OrchestrationError::UnknownAgent(_) => "unknown_agent",
            OrchestrationError::NoAgents => "no_agents",
            OrchestrationError::InvalidRequest(_) => "invalid_request",
            OrchestrationError::Store(e) if e.is_connectivity() => "connectivity_error",
            OrchestrationError::Store(_) => "store_error",
        }
    }
}

/// 爬取错误
#[derive(Error, Debug)]
pub enum CrawlError {
    /// 单页抓取 / 解析失败，记录后跳过
    #[error("Fetch {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Invalid start url '{0}'")]
    InvalidStartUrl(String),

    #[error("A crawl is already running")]
    AlreadyRunning,

    #[error("Crawl cancelled")]
    Cancelled,

    #[error("No page could be fetched")]
    NothingFetched,

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 调度动作失败：记录后继续下一个计划事件
#[derive(Error, Debug)]
pub enum SchedulingError {
    #[error("Conversation starter failed: {0}")]
    Starter(String),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Crawl(#[from] CrawlError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// 启动装配失败（进程退出）
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_connectivity() {
        let err: StoreError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_connectivity());

        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_connectivity());
    }

    #[test]
    fn test_orchestration_error_kind() {
        let err = OrchestrationError::GenerationTimeout {
            agent: "Ada".to_string(),
            after: Duration::from_secs(3),
        };
        assert_eq!(err.kind(), "generation_timeout");
        assert!(err.to_string().contains("Ada"));

        let err = OrchestrationError::from(StoreError::Connectivity {
            attempts: 3,
            reason: "refused".to_string(),
        });
        assert_eq!(err.kind(), "connectivity_error");
    }
}

//! 存储连接器：带指数退避的启动连接 + 探活
//!
//! 每次连接成功后执行 `SELECT 1` 探活，通过才算成功；重试耗尽返回 StoreError::Connectivity，
//! 由调用方（启动流程）决定终止进程。

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::core::StoreError;
use crate::store::{CheckpointStore, ConversationStore};

/// 连接参数
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub max_connections: u32,
    /// 最多尝试次数（至少 1 次）
    pub max_retries: u32,
    /// 首次重试前等待，之后每次翻倍
    pub initial_delay: Duration,
    pub acquire_timeout: Duration,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 5,
            max_retries: 5,
            initial_delay: Duration::from_millis(500),
            acquire_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, initial_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_delay = initial_delay;
        self
    }

    pub fn from_config(cfg: &crate::config::StoreSection) -> Self {
        Self {
            url: cfg.url.clone(),
            max_connections: cfg.max_connections.max(1),
            max_retries: cfg.max_retries,
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            acquire_timeout: Duration::from_secs(cfg.acquire_timeout_secs.max(1)),
        }
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// 连接成功后交给各组件的句柄；连接池的生命周期只归连接器所有
#[derive(Clone)]
pub struct StoreHandles {
    pool: SqlitePool,
    pub conversations: ConversationStore,
    pub checkpoints: CheckpointStore,
}

impl StoreHandles {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 关闭连接池（优雅关闭时调用）
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// 连接并探活，失败时指数退避重试
pub async fn connect(opts: &ConnectOptions) -> Result<StoreHandles, StoreError> {
    let attempts = opts.max_retries.max(1);
    let mut delay = opts.initial_delay;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match try_connect(opts).await {
            Ok(pool) => {
                tracing::info!(attempt, url = %opts.url, "store connected");
                init_schema(&pool).await?;
                return Ok(StoreHandles {
                    conversations: ConversationStore::new(pool.clone()),
                    checkpoints: CheckpointStore::new(pool.clone()),
                    pool,
                });
            }
            Err(e) => {
                tracing::warn!(attempt, max = attempts, error = %e, "store connect failed");
                last_error = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    Err(StoreError::Connectivity {
        attempts,
        reason: last_error,
    })
}

async fn try_connect(opts: &ConnectOptions) -> Result<SqlitePool, String> {
    let connect_options: SqliteConnectOptions = opts.url.parse().map_err(|e: sqlx::Error| e.to_string())?;

    // 内存库每个连接各自独立，只能保留唯一且常驻的连接
    let pool_options = if opts.is_memory() {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(opts.max_connections)
    };

    let pool = pool_options
        .acquire_timeout(opts.acquire_timeout)
        .connect_with(connect_options)
        .await
        .map_err(|e| e.to_string())?;

    // 探活
    if let Err(e) = sqlx::query("SELECT 1").execute(&pool).await {
        pool.close().await;
        return Err(format!("liveness probe failed: {}", e));
    }

    Ok(pool)
}

async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sessions (
            session_id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            turn_count INTEGER NOT NULL DEFAULT 0,
            terminated INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS turns (
            session_id TEXT NOT NULL,
            turn_order INTEGER NOT NULL,
            role TEXT NOT NULL,
            speaker_name TEXT,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            PRIMARY KEY (session_id, turn_order),
            FOREIGN KEY (session_id) REFERENCES sessions(session_id)
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sessions_channel ON sessions(channel_id, terminated)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS crawl_checkpoint (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_crawl_timestamp TEXT,
            status TEXT NOT NULL,
            pages_crawled INTEGER NOT NULL DEFAULT 0,
            error_message TEXT
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_memory() {
        let handles = connect(&ConnectOptions::new("sqlite::memory:")).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(handles.pool())
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }

    #[tokio::test]
    async fn test_connect_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        // 父目录不存在，SQLite 无法创建文件
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("missing/dir/parley.db").display()
        );
        let opts = ConnectOptions::new(url).with_retries(3, Duration::from_millis(1));

        let started = std::time::Instant::now();
        let err = connect(&opts).await.err().expect("connect should fail");
        match err {
            StoreError::Connectivity { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected connectivity error, got {other:?}"),
        }
        // 1ms + 2ms 的退避
        assert!(started.elapsed() >= Duration::from_millis(3));
    }
}

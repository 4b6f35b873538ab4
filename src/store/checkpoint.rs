//! 爬取检查点（单例记录）
//!
//! 调度器在每次爬取决策前读取；爬虫在开始与结束时写入。记录落在存储里而非进程内存，
//! 进程重启后依然能据此判断本周期是否已经爬过。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::core::StoreError;
use crate::store::conversations::{format_time, parse_time};

/// 爬取状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Idle,
    InProgress,
    Success,
    Failed,
}

impl CrawlStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Idle => "idle",
            CrawlStatus::InProgress => "in_progress",
            CrawlStatus::Success => "success",
            CrawlStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "idle" => Ok(CrawlStatus::Idle),
            "in_progress" => Ok(CrawlStatus::InProgress),
            "success" => Ok(CrawlStatus::Success),
            "failed" => Ok(CrawlStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown crawl status '{}'", other))),
        }
    }
}

/// 检查点内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlCheckpoint {
    pub last_crawl_timestamp: Option<DateTime<Utc>>,
    pub status: CrawlStatus,
    pub pages_crawled: usize,
    pub error_message: Option<String>,
}

impl Default for CrawlCheckpoint {
    fn default() -> Self {
        Self {
            last_crawl_timestamp: None,
            status: CrawlStatus::Idle,
            pages_crawled: 0,
            error_message: None,
        }
    }
}

/// 检查点存储句柄
#[derive(Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 读取检查点；从未写入时返回 Idle 默认值
    pub async fn load(&self) -> Result<CrawlCheckpoint, StoreError> {
        let row = sqlx::query(
            "SELECT last_crawl_timestamp, status, pages_crawled, error_message
             FROM crawl_checkpoint WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(CrawlCheckpoint::default());
        };

        let last: Option<String> = row.try_get("last_crawl_timestamp")?;
        let status: String = row.try_get("status")?;
        let pages: i64 = row.try_get("pages_crawled")?;
        Ok(CrawlCheckpoint {
            last_crawl_timestamp: last.as_deref().map(parse_time).transpose()?,
            status: CrawlStatus::parse(&status)?,
            pages_crawled: pages as usize,
            error_message: row.try_get("error_message")?,
        })
    }

    pub async fn save(&self, checkpoint: &CrawlCheckpoint) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO crawl_checkpoint (id, last_crawl_timestamp, status, pages_crawled, error_message)
             VALUES (1, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                last_crawl_timestamp = excluded.last_crawl_timestamp,
                status = excluded.status,
                pages_crawled = excluded.pages_crawled,
                error_message = excluded.error_message",
        )
        .bind(checkpoint.last_crawl_timestamp.as_ref().map(format_time))
        .bind(checkpoint.status.as_str())
        .bind(checkpoint.pages_crawled as i64)
        .bind(&checkpoint.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// 标记爬取开始：状态 in_progress，时间戳更新为 `at`
    pub async fn mark_started(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.save(&CrawlCheckpoint {
            last_crawl_timestamp: Some(at),
            status: CrawlStatus::InProgress,
            pages_crawled: 0,
            error_message: None,
        })
        .await
    }

    /// 标记爬取结束，保留开始时写入的时间戳
    pub async fn mark_finished(
        &self,
        status: CrawlStatus,
        pages_crawled: usize,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut checkpoint = self.load().await?;
        checkpoint.status = status;
        checkpoint.pages_crawled = pages_crawled;
        checkpoint.error_message = error_message;
        if checkpoint.last_crawl_timestamp.is_none() {
            checkpoint.last_crawl_timestamp = Some(Utc::now());
        }
        self.save(&checkpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{connect, ConnectOptions};

    #[tokio::test]
    async fn test_checkpoint_lifecycle() {
        let handles = connect(&ConnectOptions::new("sqlite::memory:")).await.unwrap();
        let store = handles.checkpoints;

        let initial = store.load().await.unwrap();
        assert_eq!(initial, CrawlCheckpoint::default());

        let started = Utc::now();
        store.mark_started(started).await.unwrap();
        let cp = store.load().await.unwrap();
        assert_eq!(cp.status, CrawlStatus::InProgress);
        assert_eq!(
            cp.last_crawl_timestamp.map(|t| t.timestamp_micros()),
            Some(started.timestamp_micros())
        );

        store
            .mark_finished(CrawlStatus::Success, 12, None)
            .await
            .unwrap();
        let cp = store.load().await.unwrap();
        assert_eq!(cp.status, CrawlStatus::Success);
        assert_eq!(cp.pages_crawled, 12);
        assert_eq!(
            cp.last_crawl_timestamp.map(|t| t.timestamp_micros()),
            Some(started.timestamp_micros())
        );
    }
}

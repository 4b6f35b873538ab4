//! 语义索引：文档块按 `(source_url, chunk_index)` 覆盖写入，余弦相似度 top-k 检索
//!
//! 只做按键追加/覆盖，不需要读-改-写事务。表结构在首次使用时惰性创建，
//! 由单个 OnceCell 保护，不在调用点分散判断是否已初始化。

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::OnceCell;

use crate::core::IndexError;

/// 索引的基本单元
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub source_url: String,
    pub chunk_index: usize,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// 检索结果
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

/// 相似度检索后端
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    /// 按 `(source_url, chunk_index)` 写入或覆盖
    async fn upsert(&self, chunk: &DocumentChunk) -> Result<(), IndexError>;

    /// 删除该页 chunk_index >= `keep` 的旧块（页面变短时）
    async fn prune_source(&self, source_url: &str, keep: usize) -> Result<(), IndexError>;

    /// 清空全部条目（全量重建前）
    async fn clear(&self) -> Result<(), IndexError>;

    /// 余弦相似度降序的前 k 条
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>, IndexError>;

    /// 已索引的 `(source_url, chunk_index)` 键，按键排序
    async fn keys(&self) -> Result<Vec<(String, usize)>, IndexError>;
}

/// SQLite 上的暴力检索实现，向量以 JSON 数组存储
pub struct SqliteIndex {
    pool: SqlitePool,
    schema: OnceCell<()>,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            schema: OnceCell::new(),
        }
    }

    async fn ensure_schema(&self) -> Result<(), IndexError> {
        self.schema
            .get_or_try_init(|| async {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS document_chunks (
                        source_url TEXT NOT NULL,
                        chunk_index INTEGER NOT NULL,
                        text TEXT NOT NULL,
                        embedding TEXT NOT NULL,
                        PRIMARY KEY (source_url, chunk_index)
                    )",
                )
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|e| IndexError::Write(e.to_string()))
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl SemanticIndex for SqliteIndex {
    async fn upsert(&self, chunk: &DocumentChunk) -> Result<(), IndexError> {
        self.ensure_schema().await?;
        let embedding =
            serde_json::to_string(&chunk.embedding).map_err(|e| IndexError::Write(e.to_string()))?;
        sqlx::query(
            "INSERT INTO document_chunks (source_url, chunk_index, text, embedding)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(source_url, chunk_index) DO UPDATE SET
                text = excluded.text,
                embedding = excluded.embedding",
        )
        .bind(&chunk.source_url)
        .bind(chunk.chunk_index as i64)
        .bind(&chunk.text)
        .bind(embedding)
        .execute(&self.pool)
        .await
        .map_err(|e| IndexError::Write(e.to_string()))?;
        Ok(())
    }

    async fn prune_source(&self, source_url: &str, keep: usize) -> Result<(), IndexError> {
        self.ensure_schema().await?;
        sqlx::query("DELETE FROM document_chunks WHERE source_url = ? AND chunk_index >= ?")
            .bind(source_url)
            .bind(keep as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| IndexError::Write(e.to_string()))?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), IndexError> {
        self.ensure_schema().await?;
        sqlx::query("DELETE FROM document_chunks")
            .execute(&self.pool)
            .await
            .map_err(|e| IndexError::Write(e.to_string()))?;
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        self.ensure_schema().await?;
        let rows = sqlx::query("SELECT source_url, chunk_index, text, embedding FROM document_chunks")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| IndexError::Read(e.to_string()))?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("embedding").map_err(|e| IndexError::Read(e.to_string()))?;
            let embedding: Vec<f32> = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping chunk with unreadable embedding");
                    continue;
                }
            };
            let score = cosine_similarity(query, &embedding);
            let chunk_index: i64 = row.try_get("chunk_index").map_err(|e| IndexError::Read(e.to_string()))?;
            scored.push(ScoredChunk {
                chunk: DocumentChunk {
                    source_url: row.try_get("source_url").map_err(|e| IndexError::Read(e.to_string()))?,
                    chunk_index: chunk_index as usize,
                    text: row.try_get("text").map_err(|e| IndexError::Read(e.to_string()))?,
                    embedding,
                },
                score,
            });
        }

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn keys(&self) -> Result<Vec<(String, usize)>, IndexError> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT source_url, chunk_index FROM document_chunks ORDER BY source_url, chunk_index",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IndexError::Read(e.to_string()))?;
        rows.iter()
            .map(|r| {
                let url: String = r.try_get("source_url")?;
                let idx: i64 = r.try_get("chunk_index")?;
                Ok((url, idx as usize))
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(|e| IndexError::Read(e.to_string()))
    }
}

/// 余弦相似度；维度不一致或零向量时为 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

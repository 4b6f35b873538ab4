//! 知识检索：查询嵌入 + top-k 相似度检索
//!
//! 没有上下文是正常情况：索引为空、未初始化，或嵌入/检索失败时都返回空列表而不是错误。

use std::sync::Arc;

use crate::knowledge::SemanticIndex;
use crate::llm::EmbeddingProvider;

pub struct Retriever {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn SemanticIndex>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, index: Arc<dyn SemanticIndex>) -> Self {
        Self { embedder, index }
    }

    /// 按相似度降序返回前 k 条文本片段
    pub async fn retrieve(&self, query: &str, k: usize) -> Vec<String> {
        if query.trim().is_empty() || k == 0 {
            return Vec::new();
        }
        let vector = match self.embedder.embed(query).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed, continuing without context");
                return Vec::new();
            }
        };
        match self.index.search(&vector, k).await {
            Ok(hits) => {
                tracing::debug!(hits = hits.len(), "knowledge retrieved");
                hits.into_iter().map(|h| h.chunk.text).collect()
            }
            Err(e) => {
                tracing::warn!(error = %e, "knowledge search failed, continuing without context");
                Vec::new()
            }
        }
    }

    /// 拼接为单个上下文字符串（不再排序）
    pub async fn context_for(&self, query: &str, k: usize) -> String {
        self.retrieve(query, k).await.join("\n\n")
    }
}

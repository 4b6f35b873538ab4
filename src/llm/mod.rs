//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）、嵌入

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, HashingEmbedder, OpenAiEmbedder};
pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{ChatMessage, ChatRole, LlmClient};

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &crate::config::LlmSection) -> Arc<dyn LlmClient> {
    match std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()) {
        Some(key) => {
            tracing::info!("Using OpenAI-compatible LLM ({})", cfg.model);
            Arc::new(OpenAiClient::new(
                cfg.base_url.as_deref(),
                &cfg.model,
                Some(&key),
                Duration::from_secs(cfg.timeouts.request.max(1)),
            ))
        }
        None => {
            tracing::warn!("No OPENAI_API_KEY set, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

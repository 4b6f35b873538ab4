//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PARLEY__*` 覆盖（双下划线表示嵌套，如 `PARLEY__CRAWLER__MAX_PAGES=50`）。
//! 角色注册表来自 `[[agents]]` 数组，启动后不可变。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub store: StoreSection,
    pub llm: LlmSection,
    pub orchestrator: OrchestratorSection,
    pub crawler: CrawlerSection,
    pub scheduler: SchedulerSection,
    pub server: ServerSection,
    pub agents: Vec<AgentSection>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [store] 段：SQLite 地址、连接池与启动重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// sqlx 连接串，如 `sqlite:data/parley.db?mode=rwc` 或 `sqlite::memory:`
    pub url: String,
    pub max_connections: u32,
    /// 启动时最多尝试次数
    pub max_retries: u32,
    /// 首次重试等待（毫秒），之后每次翻倍
    pub initial_delay_ms: u64,
    /// 单次获取连接 / 执行语句的超时（秒）
    pub acquire_timeout_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: "sqlite:data/parley.db?mode=rwc".to_string(),
            max_connections: 5,
            max_retries: 5,
            initial_delay_ms: 500,
            acquire_timeout_secs: 10,
        }
    }
}

/// [llm] 段：开场白生成与 LLM 生成后端、嵌入模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    pub embedding_model: String,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            embedding_model: "text-embedding-3-small".to_string(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
    pub embedding: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 60,
            embedding: 20,
        }
    }
}

/// 生成协作方实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GenerationBackend {
    /// POST 到角色的 generation_endpoint
    #[default]
    Http,
    /// 直接调用 OpenAI 兼容接口
    Llm,
}

/// 投递协作方实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryBackend {
    /// POST 到角色的 delivery_endpoint
    #[default]
    Http,
    /// 只写日志（本地调试）
    Log,
}

/// [orchestrator] 段：轮次上限、超时、历史窗口、结束标记
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 会话最多轮次（含用户的首条消息），达到即终止
    pub max_turns: usize,
    /// 单次 orchestrate 请求最多产生的角色轮次
    pub turns_per_request: usize,
    /// 送给生成方的最近轮次数
    pub history_window: usize,
    pub generation_timeout_secs: u64,
    pub delivery_timeout_secs: u64,
    /// 检索上下文条数
    pub retrieval_k: usize,
    pub end_marker: String,
    pub generation: GenerationBackend,
    pub delivery: DeliveryBackend,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_turns: 12,
            turns_per_request: 12,
            history_window: 20,
            generation_timeout_secs: 60,
            delivery_timeout_secs: 15,
            retrieval_k: 3,
            end_marker: "[END]".to_string(),
            generation: GenerationBackend::default(),
            delivery: DeliveryBackend::default(),
        }
    }
}

/// [crawler] 段：起始 URL、页数上限、礼貌间隔、分块参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerSection {
    pub start_url: String,
    pub max_pages: usize,
    pub delay_ms: u64,
    pub request_timeout_secs: u64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// 全量重建：开始前清空索引
    pub rebuild: bool,
}

impl Default for CrawlerSection {
    fn default() -> Self {
        Self {
            start_url: String::new(),
            max_pages: 100,
            delay_ms: 1000,
            request_timeout_secs: 15,
            chunk_size: 1000,
            chunk_overlap: 200,
            rebuild: true,
        }
    }
}

/// [scheduler] 段：自动开场与周期爬取
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub enabled: bool,
    /// 自动开场发往的频道
    pub channel_id: String,
    /// 每天自动开场次数
    pub conversations_per_day: usize,
    /// 活跃时段（UTC 小时，左闭右开）
    pub active_start_hour: u32,
    pub active_end_hour: u32,
    /// 爬取周期（小时）
    pub crawl_period_hours: u64,
    /// 检查是否需要爬取的间隔（秒）
    pub crawl_check_interval_secs: u64,
    /// 生成开场白时参考的频道历史条数
    pub starter_history: usize,
    /// 生成开场白时是否检索知识库
    pub starter_use_knowledge: bool,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_id: String::new(),
            conversations_per_day: 3,
            active_start_hour: 9,
            active_end_hour: 23,
            crawl_period_hours: 24 * 7,
            crawl_check_interval_secs: 3600,
            starter_history: 10,
            starter_use_knowledge: true,
        }
    }
}

/// [server] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

/// [[agents]] 项：一个模拟角色
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    pub name: String,
    /// 频道中的提及方式，如 `<@1234>`；缺省为 `@name`
    #[serde(default)]
    pub mention_handle: Option<String>,
    #[serde(default)]
    pub generation_endpoint: String,
    #[serde(default)]
    pub delivery_endpoint: String,
}

/// 从 config 目录加载配置，环境变量 PARLEY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PARLEY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PARLEY")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_usable() {
        let cfg = AppConfig::default();
        assert!(cfg.orchestrator.max_turns > 0);
        assert!(cfg.crawler.chunk_overlap < cfg.crawler.chunk_size);
        assert!(cfg.scheduler.active_start_hour < cfg.scheduler.active_end_hour);
        assert_eq!(cfg.orchestrator.generation, GenerationBackend::Http);
        assert!(cfg.agents.is_empty());
    }

    #[test]
    fn test_load_from_file_with_agents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        std::fs::write(
            &path,
            r#"
[orchestrator]
max_turns = 4
generation = "llm"
delivery = "log"

[crawler]
start_url = "https://docs.example.com/"
max_pages = 7

[[agents]]
name = "Ada"
mention_handle = "<@1>"

[[agents]]
name = "Grace"
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.orchestrator.max_turns, 4);
        assert_eq!(cfg.orchestrator.generation, GenerationBackend::Llm);
        assert_eq!(cfg.orchestrator.delivery, DeliveryBackend::Log);
        assert_eq!(cfg.crawler.max_pages, 7);
        assert_eq!(cfg.agents[0].name, "Ada");
        assert_eq!(cfg.agents[0].mention_handle.as_deref(), Some("<@1>"));
        assert_eq!(cfg.agents[1].name, "Grace");
    }
}

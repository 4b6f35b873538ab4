//! 集成测试共用的假协作方

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use parley::agents::{AgentDefinition, Deliverer, Generator};
use parley::config::{AgentSection, AppConfig};
use parley::core::{CrawlError, ServiceContext, ServiceContextBuilder, ShutdownManager};
use parley::knowledge::PageFetcher;
use parley::llm::{HashingEmbedder, MockLlmClient};
use parley::store::{StoreHandles, Turn};
use reqwest::Url;

/// 生成方的一步脚本
#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    /// 永不返回（触发超时）
    Hang,
    Fail(String),
}

pub fn reply(text: &str) -> Step {
    Step::Reply(text.to_string())
}

/// 按脚本依次应答；脚本用完后回复 "ok"
#[derive(Default)]
pub struct ScriptedGenerator {
    steps: Mutex<VecDeque<Step>>,
    speakers: Mutex<Vec<String>>,
    history_lens: Mutex<Vec<usize>>,
}

impl ScriptedGenerator {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            ..Default::default()
        })
    }

    pub fn speakers(&self) -> Vec<String> {
        self.speakers.lock().unwrap().clone()
    }

    pub fn history_lens(&self) -> Vec<usize> {
        self.history_lens.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, agent: &AgentDefinition, history: &[Turn], _context: &str) -> Result<String, String> {
        self.speakers.lock().unwrap().push(agent.name.clone());
        self.history_lens.lock().unwrap().push(history.len());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            None => Ok("ok".to_string()),
            Some(Step::Reply(text)) => Ok(text),
            Some(Step::Fail(reason)) => Err(reason),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("too late".to_string())
            }
        }
    }
}

/// 记录投递内容；`failing` 为真时所有投递失败
#[derive(Default)]
pub struct RecordingDeliverer {
    pub failing: bool,
    delivered: Mutex<Vec<(String, String, String)>>,
}

impl RecordingDeliverer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            failing: true,
            ..Default::default()
        })
    }

    /// (agent, text, channel)
    pub fn delivered(&self) -> Vec<(String, String, String)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deliverer for RecordingDeliverer {
    async fn deliver(&self, agent: &AgentDefinition, text: &str, channel_id: &str) -> Result<(), String> {
        if self.failing {
            return Err("relay unavailable".to_string());
        }
        self.delivered
            .lock()
            .unwrap()
            .push((agent.name.clone(), text.to_string(), channel_id.to_string()));
        Ok(())
    }
}

/// 内存站点：URL → HTML；记录每个 URL 的抓取次数
#[derive(Default)]
pub struct FakeSite {
    pages: HashMap<String, String>,
    failing: Vec<String>,
    fetches: Mutex<Vec<String>>,
    total: AtomicUsize,
}

impl FakeSite {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加页面：正文 + 链接列表
    pub fn page(mut self, url: &str, text: &str, links: &[&str]) -> Self {
        let anchors: String = links
            .iter()
            .map(|l| format!(r#"<a href="{}">link</a> "#, l))
            .collect();
        let html = format!(
            "<html><head><title>t</title></head><body><nav>{}</nav><main><p>{}</p></main></body></html>",
            anchors, text
        );
        self.pages.insert(url.to_string(), html);
        self
    }

    pub fn failing(mut self, url: &str) -> Self {
        self.failing.push(url.to_string());
        self
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn total_fetches(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for FakeSite {
    async fn fetch(&self, url: &Url) -> Result<String, CrawlError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.fetches.lock().unwrap().push(url.to_string());
        if self.failing.iter().any(|f| f == url.as_str()) {
            return Err(CrawlError::Fetch {
                url: url.to_string(),
                reason: "HTTP 500".to_string(),
            });
        }
        self.pages.get(url.as_str()).cloned().ok_or_else(|| CrawlError::Fetch {
            url: url.to_string(),
            reason: "HTTP 404".to_string(),
        })
    }
}

pub fn agent_section(name: &str) -> AgentSection {
    AgentSection {
        name: name.to_string(),
        mention_handle: None,
        generation_endpoint: String::new(),
        delivery_endpoint: String::new(),
    }
}

/// 内存库 + 给定角色的配置；爬取无间隔
pub fn test_config(agents: &[&str]) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.store.url = "sqlite::memory:".to_string();
    cfg.agents = agents.iter().map(|n| agent_section(n)).collect();
    cfg.crawler.delay_ms = 0;
    cfg.crawler.chunk_size = 200;
    cfg.crawler.chunk_overlap = 20;
    cfg.scheduler.channel_id = String::new();
    cfg
}

/// 用假协作方装配完整上下文（Mock LLM、哈希嵌入、固定种子）
pub fn build_context(
    cfg: AppConfig,
    store: StoreHandles,
    generator: Arc<ScriptedGenerator>,
    deliverer: Arc<RecordingDeliverer>,
    site: Arc<FakeSite>,
) -> Arc<ServiceContext> {
    let ctx = ServiceContextBuilder::new(cfg, store)
        .with_llm(Arc::new(MockLlmClient))
        .with_embedder(Arc::new(HashingEmbedder::default()))
        .with_generator(generator)
        .with_deliverer(deliverer)
        .with_fetcher(site)
        .with_seed(7)
        .build(Arc::new(ShutdownManager::new()))
        .unwrap();
    Arc::new(ctx)
}

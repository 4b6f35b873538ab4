//! 服务上下文：启动时一次性装配所有共享句柄，之后以 Arc 传递
//!
//! HTTP 处理器、调度器、爬虫共享同一个 ServiceContext；协作方（生成、投递、抓取、LLM、嵌入）
//! 默认按配置创建，也可在构建器上替换（集成测试用假实现）。

use std::sync::Arc;
use std::time::Duration;

use crate::agents::{AgentRegistry, Deliverer, Generator, HttpDeliverer, HttpGenerator, LlmGenerator, LogDeliverer};
use crate::config::{AppConfig, DeliveryBackend, GenerationBackend};
use crate::core::{ShutdownManager, StartupError};
use crate::knowledge::{
    Chunker, ChunkingConfig, CrawlParams, Crawler, HttpFetcher, PageFetcher, Retriever, SemanticIndex, SqliteIndex,
};
use crate::llm::{create_embedder_from_config, create_llm_from_config, EmbeddingProvider, LlmClient};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::scheduler::{ConversationStarter, Scheduler, SchedulerSettings};
use crate::store::{connect, ConnectOptions, StoreHandles};

/// 共享句柄
pub struct ServiceContext {
    pub config: AppConfig,
    pub store: StoreHandles,
    pub registry: Arc<AgentRegistry>,
    pub llm: Arc<dyn LlmClient>,
    pub index: Arc<dyn SemanticIndex>,
    pub retriever: Arc<Retriever>,
    pub crawler: Arc<Crawler>,
    pub orchestrator: Arc<Orchestrator>,
    pub shutdown: Arc<ShutdownManager>,
}

impl ServiceContext {
    /// 按配置连接存储并装配（存储不可达即返回致命错误）
    pub async fn build(config: AppConfig, shutdown: Arc<ShutdownManager>) -> Result<Self, StartupError> {
        let store = connect(&ConnectOptions::from_config(&config.store)).await?;
        ServiceContextBuilder::new(config, store).build(shutdown)
    }

    /// 配置中的默认爬取参数
    pub fn default_crawl_params(&self) -> CrawlParams {
        CrawlParams::from_config(&self.config.crawler)
    }

    /// 调度器（未启用时为 None）
    pub fn scheduler(&self) -> Option<Scheduler> {
        let cfg = &self.config.scheduler;
        if !cfg.enabled {
            return None;
        }
        let mut starter = ConversationStarter::new(
            Arc::clone(&self.llm),
            self.store.conversations.clone(),
            cfg.starter_history,
        );
        if cfg.starter_use_knowledge {
            starter = starter.with_knowledge(Arc::clone(&self.retriever), self.config.orchestrator.retrieval_k);
        }
        Some(Scheduler::new(
            SchedulerSettings::from(cfg),
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.crawler),
            self.store.checkpoints.clone(),
            starter,
            self.default_crawl_params(),
            self.shutdown.token(),
        ))
    }
}

/// ServiceContext 构建器：未显式提供的协作方按配置创建
pub struct ServiceContextBuilder {
    config: AppConfig,
    store: StoreHandles,
    llm: Option<Arc<dyn LlmClient>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    generator: Option<Arc<dyn Generator>>,
    deliverer: Option<Arc<dyn Deliverer>>,
    fetcher: Option<Arc<dyn PageFetcher>>,
    seed: Option<u64>,
}

impl ServiceContextBuilder {
    pub fn new(config: AppConfig, store: StoreHandles) -> Self {
        Self {
            config,
            store,
            llm: None,
            embedder: None,
            generator: None,
            deliverer: None,
            fetcher: None,
            seed: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_deliverer(mut self, deliverer: Arc<dyn Deliverer>) -> Self {
        self.deliverer = Some(deliverer);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// 固定发言者选择的随机种子
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self, shutdown: Arc<ShutdownManager>) -> Result<ServiceContext, StartupError> {
        let cfg = &self.config;

        let registry = Arc::new(
            AgentRegistry::from_config(&cfg.agents).map_err(|e| StartupError::Config(e.to_string()))?,
        );
        if registry.is_empty() {
            tracing::warn!("no agents configured, orchestrate requests will be rejected");
        }

        let llm = match self.llm {
            Some(llm) => llm,
            None => create_llm_from_config(&cfg.llm),
        };
        let embedder = match self.embedder {
            Some(embedder) => embedder,
            None => create_embedder_from_config(&cfg.llm),
        };

        let generator: Arc<dyn Generator> = match self.generator {
            Some(generator) => generator,
            None => match cfg.orchestrator.generation {
                GenerationBackend::Http => Arc::new(HttpGenerator::new(Duration::from_secs(
                    cfg.orchestrator.generation_timeout_secs.max(1),
                ))?),
                GenerationBackend::Llm => {
                    Arc::new(LlmGenerator::new(Arc::clone(&llm), cfg.orchestrator.end_marker.clone()))
                }
            },
        };
        let deliverer: Arc<dyn Deliverer> = match self.deliverer {
            Some(deliverer) => deliverer,
            None => match cfg.orchestrator.delivery {
                DeliveryBackend::Http => Arc::new(HttpDeliverer::new(Duration::from_secs(
                    cfg.orchestrator.delivery_timeout_secs.max(1),
                ))?),
                DeliveryBackend::Log => Arc::new(LogDeliverer),
            },
        };
        let fetcher: Arc<dyn PageFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(Duration::from_secs(
                cfg.crawler.request_timeout_secs.max(1),
            ))?),
        };

        let index: Arc<dyn SemanticIndex> = Arc::new(SqliteIndex::new(self.store.pool().clone()));
        let retriever = Arc::new(Retriever::new(Arc::clone(&embedder), Arc::clone(&index)));

        let chunker = Chunker::new(ChunkingConfig {
            chunk_size: cfg.crawler.chunk_size,
            chunk_overlap: cfg.crawler.chunk_overlap,
        });
        let crawler = Arc::new(Crawler::new(
            fetcher,
            embedder,
            Arc::clone(&index),
            self.store.checkpoints.clone(),
            chunker,
        ));

        let mut orchestrator = Orchestrator::new(
            Arc::clone(&registry),
            self.store.conversations.clone(),
            Arc::clone(&retriever),
            generator,
            deliverer,
            OrchestratorSettings::from(&cfg.orchestrator),
        );
        if let Some(seed) = self.seed {
            orchestrator = orchestrator.with_seed(seed);
        }

        tracing::info!(
            agents = registry.len(),
            generation = ?cfg.orchestrator.generation,
            delivery = ?cfg.orchestrator.delivery,
            llm = llm.name(),
            "service context ready"
        );

        Ok(ServiceContext {
            config: self.config,
            store: self.store,
            registry,
            llm,
            index,
            retriever,
            crawler,
            orchestrator: Arc::new(orchestrator),
            shutdown,
        })
    }
}

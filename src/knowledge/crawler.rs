//! 知识爬虫：单站点广度优先爬取 → 分块 → 嵌入 → 写入语义索引
//!
//! - 显式 frontier 队列 + visited 集合（入队即标记），同一次爬取中任何 URL 最多抓取一次，环形链接不会重复处理
//! - 只跟随与起始 URL 同一网络位置（host + 端口）的链接
//! - 单页抓取失败、单块写入失败只记录日志并跳过
//! - 同一时刻最多一次爬取（crawl guard），避免并发 clear/重建破坏索引
//! - 开始时检查点写 in_progress，结束时写 success / failed 与页数

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{CrawlError, IndexError};
use crate::knowledge::{html, Chunker, DocumentChunk, SemanticIndex};
use crate::llm::EmbeddingProvider;
use crate::store::{CheckpointStore, CrawlStatus};

/// 单次爬取参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlParams {
    pub start_url: String,
    pub max_pages: usize,
    /// 两次抓取之间的礼貌间隔
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    /// 开始前清空索引
    pub rebuild: bool,
}

impl CrawlParams {
    pub fn from_config(cfg: &crate::config::CrawlerSection) -> Self {
        Self {
            start_url: cfg.start_url.clone(),
            max_pages: cfg.max_pages,
            delay: Duration::from_millis(cfg.delay_ms),
            rebuild: cfg.rebuild,
        }
    }
}

/// 以浮点秒数（JSON）表示的 Duration
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        // 负数、NaN 与超出 Duration 范围的值都拒绝
        Duration::try_from_secs_f64(secs)
            .map_err(|e| serde::de::Error::custom(format!("invalid delay {secs}: {e}")))
    }
}

/// 爬取结果统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlReport {
    /// 按抓取顺序的 URL（不会重复）
    pub visited: Vec<String>,
    /// 成功抓取并处理的页数
    pub pages_crawled: usize,
    pub failed_pages: usize,
    pub chunks_indexed: usize,
}

/// 页面抓取
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// 返回页面 HTML；失败返回 CrawlError::Fetch
    async fn fetch(&self, url: &Url) -> Result<String, CrawlError>;
}

/// 基于 reqwest 的抓取器：请求超时、仅接受 HTML/文本
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        const USER_AGENT: &str = concat!("parley-crawler/", env!("CARGO_PKG_VERSION"));
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml;q=0.9,text/plain;q=0.8"),
        );
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, CrawlError> {
        let fail = |reason: String| CrawlError::Fetch {
            url: url.to_string(),
            reason,
        };
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| fail(format!("request failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(fail(format!("HTTP {}", resp.status())));
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_ascii_lowercase();
        if !(content_type.contains("html") || content_type.starts_with("text/")) {
            return Err(fail(format!("unsupported content type {}", content_type)));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| fail(format!("read body: {}", e)))?;
        Ok(body.trim_start_matches('\u{FEFF}').to_string())
    }
}

/// 爬取名额；drop 即释放
#[derive(Debug)]
pub struct CrawlPermit(OwnedMutexGuard<()>);

/// 爬虫：frontier / visited 只属于单次运行
pub struct Crawler {
    fetcher: Arc<dyn PageFetcher>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn SemanticIndex>,
    checkpoints: CheckpointStore,
    chunker: Chunker,
    running: Arc<Mutex<()>>,
}

impl Crawler {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn SemanticIndex>,
        checkpoints: CheckpointStore,
        chunker: Chunker,
    ) -> Self {
        Self {
            fetcher,
            embedder,
            index,
            checkpoints,
            chunker,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// 是否有爬取正在进行
    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// 在当前任务中执行一次爬取
    pub async fn run(&self, params: CrawlParams, stop: CancellationToken) -> Result<CrawlReport, CrawlError> {
        let _permit = self.try_reserve()?;
        self.run_guarded(params, stop, Utc::now()).await
    }

    /// 在独立任务中执行爬取；guard 在返回前已取得，已有爬取时立即返回 AlreadyRunning
    pub fn spawn(
        self: &Arc<Self>,
        params: CrawlParams,
        stop: CancellationToken,
    ) -> Result<JoinHandle<Result<CrawlReport, CrawlError>>, CrawlError> {
        self.spawn_at(params, stop, Utc::now())
    }

    /// 同 spawn，检查点的开始时间使用调用方给定的时刻（调度器预写检查点时用同一时刻）
    pub fn spawn_at(
        self: &Arc<Self>,
        params: CrawlParams,
        stop: CancellationToken,
        started_at: DateTime<Utc>,
    ) -> Result<JoinHandle<Result<CrawlReport, CrawlError>>, CrawlError> {
        let permit = self.try_reserve()?;
        Ok(self.spawn_reserved(permit, params, stop, started_at))
    }

    /// 先占住爬取名额；持有期间 spawn / run 均返回 AlreadyRunning
    pub fn try_reserve(&self) -> Result<CrawlPermit, CrawlError> {
        self.running
            .clone()
            .try_lock_owned()
            .map(CrawlPermit)
            .map_err(|_| CrawlError::AlreadyRunning)
    }

    /// 用已占住的名额启动爬取，任务结束时释放
    pub fn spawn_reserved(
        self: &Arc<Self>,
        permit: CrawlPermit,
        params: CrawlParams,
        stop: CancellationToken,
        started_at: DateTime<Utc>,
    ) -> JoinHandle<Result<CrawlReport, CrawlError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            this.run_guarded(params, stop, started_at).await
        })
    }

    async fn run_guarded(
        &self,
        params: CrawlParams,
        stop: CancellationToken,
        started_at: DateTime<Utc>,
    ) -> Result<CrawlReport, CrawlError> {
        tracing::info!(
            start_url = %params.start_url,
            max_pages = params.max_pages,
            rebuild = params.rebuild,
            "crawl started"
        );
        self.checkpoints.mark_started(started_at).await?;

        let mut report = CrawlReport::default();
        let outcome = self.crawl(&params, &stop, &mut report).await;

        let (status, error) = match &outcome {
            Ok(()) => (CrawlStatus::Success, None),
            Err(e) => (CrawlStatus::Failed, Some(e.to_string())),
        };
        if let Err(e) = self
            .checkpoints
            .mark_finished(status, report.pages_crawled, error)
            .await
        {
            tracing::error!(error = %e, "failed to record crawl completion");
        }

        match outcome {
            Ok(()) => {
                tracing::info!(
                    pages = report.pages_crawled,
                    failed = report.failed_pages,
                    chunks = report.chunks_indexed,
                    "crawl finished"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(error = %e, pages = report.pages_crawled, "crawl failed");
                Err(e)
            }
        }
    }

    async fn crawl(
        &self,
        params: &CrawlParams,
        stop: &CancellationToken,
        report: &mut CrawlReport,
    ) -> Result<(), CrawlError> {
        let start = Url::parse(params.start_url.trim())
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
            .map(html::normalize)
            .ok_or_else(|| CrawlError::InvalidStartUrl(params.start_url.clone()))?;

        if params.rebuild {
            self.index.clear().await?;
            tracing::info!("index cleared for rebuild");
        }

        let mut frontier: VecDeque<Url> = VecDeque::from([start.clone()]);
        let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
        let mut attempts = 0usize;

        while attempts < params.max_pages {
            let Some(url) = frontier.pop_front() else { break };
            if stop.is_cancelled() {
                return Err(CrawlError::Cancelled);
            }
            if attempts > 0 && !params.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(params.delay) => {}
                    _ = stop.cancelled() => return Err(CrawlError::Cancelled),
                }
            }
            attempts += 1;
            report.visited.push(url.to_string());

            let page = match self.fetcher.fetch(&url).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "page skipped");
                    report.failed_pages += 1;
                    continue;
                }
            };

            for link in html::extract_links(&page, &url) {
                if visited.insert(link.to_string()) {
                    frontier.push_back(link);
                }
            }

            let text = html::extract_main_text(&page);
            report.chunks_indexed += self.index_page(url.as_str(), &text).await;
            report.pages_crawled += 1;
            tracing::debug!(url = %url, queued = frontier.len(), "page crawled");
        }

        if attempts > 0 && report.pages_crawled == 0 {
            return Err(CrawlError::NothingFetched);
        }
        Ok(())
    }

    /// 分块、嵌入、写入；返回成功写入的块数
    async fn index_page(&self, url: &str, text: &str) -> usize {
        let pieces = self.chunker.chunk(text);
        let mut written = 0;

        for (chunk_index, piece) in pieces.iter().enumerate() {
            let embedding = match self.embedder.embed(piece).await {
                Ok(v) if !v.is_empty() => v,
                Ok(_) => {
                    tracing::warn!(url, chunk_index, "empty embedding, chunk skipped");
                    continue;
                }
                Err(e) => {
                    let e = IndexError::Embedding(e);
                    tracing::warn!(url, chunk_index, error = %e, "chunk skipped");
                    continue;
                }
            };
            let chunk = DocumentChunk {
                source_url: url.to_string(),
                chunk_index,
                text: piece.clone(),
                embedding,
            };
            match self.index.upsert(&chunk).await {
                Ok(()) => written += 1,
                Err(e) => tracing::warn!(url, chunk_index, error = %e, "chunk skipped"),
            }
        }

        if let Err(e) = self.index.prune_source(url, pieces.len()).await {
            tracing::warn!(url, error = %e, "failed to prune stale chunks");
        }
        written
    }
}

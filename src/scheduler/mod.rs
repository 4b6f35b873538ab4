//! 调度器：单个长驻任务，驱动自动开场与周期爬取
//!
//! - 对话：每天在活跃时段内按均分时段抖动出 N 个时间点，到点合成开场白并走编排器的新会话路径
//! - 爬取：定期对比检查点时间戳，到期则先写检查点（in_progress + now）再启动爬取任务，
//!   重启后依据持久化的时间戳，同一周期最多启动一次
//! - 任何调度动作出错只记录 SchedulingError，循环继续；关闭 token 触发后退出

pub mod plan;
pub mod starter;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerSection;
use crate::core::SchedulingError;
use crate::knowledge::{CrawlParams, Crawler};
use crate::orchestrator::{OrchestrateRequest, OrchestrateResponse, Orchestrator};
use crate::store::CheckpointStore;

pub use plan::{crawl_due, next_day_plan, plan_conversations, plan_for_date, ActiveWindow};
pub use starter::ConversationStarter;

/// 调度器显示名（记录为开场消息的发言者）
const SCHEDULER_DISPLAY_NAME: &str = "scheduler";

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// 为空时不自动开场
    pub channel_id: String,
    pub conversations_per_day: usize,
    pub window: ActiveWindow,
    pub crawl_period: chrono::Duration,
    pub crawl_check_interval: Duration,
}

impl From<&SchedulerSection> for SchedulerSettings {
    fn from(cfg: &SchedulerSection) -> Self {
        Self {
            channel_id: cfg.channel_id.trim().to_string(),
            conversations_per_day: cfg.conversations_per_day,
            window: ActiveWindow::new(cfg.active_start_hour, cfg.active_end_hour),
            crawl_period: chrono::Duration::hours(cfg.crawl_period_hours.max(1) as i64),
            crawl_check_interval: Duration::from_secs(cfg.crawl_check_interval_secs.max(1)),
        }
    }
}

pub struct Scheduler {
    settings: SchedulerSettings,
    orchestrator: Arc<Orchestrator>,
    crawler: Arc<Crawler>,
    checkpoints: CheckpointStore,
    starter: ConversationStarter,
    crawl_params: CrawlParams,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        orchestrator: Arc<Orchestrator>,
        crawler: Arc<Crawler>,
        checkpoints: CheckpointStore,
        starter: ConversationStarter,
        crawl_params: CrawlParams,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            orchestrator,
            crawler,
            checkpoints,
            starter,
            crawl_params,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut rng = StdRng::from_entropy();
        let conversations_enabled =
            !self.settings.channel_id.is_empty() && self.settings.conversations_per_day > 0;

        let (mut plan_date, mut plan) = if conversations_enabled {
            plan_conversations(
                Utc::now(),
                self.settings.window,
                self.settings.conversations_per_day,
                &mut rng,
            )
        } else {
            (Utc::now().date_naive(), Vec::new())
        };
        if conversations_enabled {
            log_plan(plan_date, &plan);
        } else {
            tracing::info!("automatic conversations disabled (no channel configured)");
        }

        let mut crawl_tick = tokio::time::interval(self.settings.crawl_check_interval);
        crawl_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("scheduler started");
        loop {
            // 计划用完（或首个计划为空）时排下一天
            if conversations_enabled && plan.is_empty() {
                (plan_date, plan) = next_day_plan(
                    plan_date,
                    self.settings.window,
                    self.settings.conversations_per_day,
                    &mut rng,
                );
                log_plan(plan_date, &plan);
            }

            let next = plan.first().copied();
            let wait = next
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::MAX);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = crawl_tick.tick() => {
                    if let Err(e) = self.check_crawl(Utc::now()).await {
                        tracing::error!(error = %e, "scheduled crawl check failed");
                    }
                }
                _ = tokio::time::sleep(wait), if next.is_some() => {
                    plan.remove(0);
                    match self.start_conversation(&mut rng).await {
                        Ok(resp) => tracing::info!(
                            session_id = %resp.session_id,
                            turns = resp.turns.len(),
                            "scheduled conversation started"
                        ),
                        Err(e) => tracing::error!(error = %e, "scheduled conversation failed"),
                    }
                }
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// 到期则写检查点并启动爬取；返回是否启动了爬取
    pub async fn check_crawl(&self, now: DateTime<Utc>) -> Result<bool, SchedulingError> {
        if self.crawl_params.start_url.trim().is_empty() {
            tracing::debug!("no crawl start url configured");
            return Ok(false);
        }
        // 先占住名额再读写检查点，HTTP 触发的爬取无法插到中间
        let permit = match self.crawler.try_reserve() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!("crawl already running, check skipped");
                return Ok(false);
            }
        };
        let checkpoint = self.checkpoints.load().await?;
        if !crawl_due(&checkpoint, now, self.settings.crawl_period) {
            tracing::debug!(
                last_crawl = ?checkpoint.last_crawl_timestamp,
                status = ?checkpoint.status,
                "crawl not due"
            );
            return Ok(false);
        }

        // 先落检查点再启动，崩溃重启后不会在同一周期重复爬取
        self.checkpoints.mark_started(now).await?;
        let handle = self.crawler.spawn_reserved(
            permit,
            self.crawl_params.clone(),
            self.shutdown.child_token(),
            now,
        );
        tracing::info!(start_url = %self.crawl_params.start_url, "scheduled crawl launched");

        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(report)) => tracing::info!(pages = report.pages_crawled, "scheduled crawl done"),
                Ok(Err(e)) => tracing::warn!(error = %e, "scheduled crawl failed"),
                Err(e) => tracing::error!(error = %e, "crawl task panicked"),
            }
        });
        Ok(true)
    }

    /// 合成开场白，并以随机发起者开启新会话
    pub async fn start_conversation<R: rand::Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<OrchestrateResponse, SchedulingError> {
        let initiator = self
            .orchestrator
            .registry()
            .iter()
            .choose(rng)
            .map(|a| a.name.clone())
            .ok_or(crate::core::OrchestrationError::NoAgents)?;
        let opener = self.starter.compose(&self.settings.channel_id).await?;
        tracing::info!(channel_id = %self.settings.channel_id, initiator = %initiator, "starting scheduled conversation");

        let resp = self
            .orchestrator
            .orchestrate(OrchestrateRequest {
                user_query: opener,
                channel_id: self.settings.channel_id.clone(),
                initiator_agent: Some(initiator),
                display_name: Some(SCHEDULER_DISPLAY_NAME.to_string()),
                is_new_conversation: true,
                ..Default::default()
            })
            .await?;
        Ok(resp)
    }
}

fn log_plan(date: NaiveDate, plan: &[DateTime<Utc>]) {
    let times: Vec<String> = plan.iter().map(|t| t.format("%H:%M").to_string()).collect();
    tracing::info!(%date, planned = ?times, "conversation plan");
}

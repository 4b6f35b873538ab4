//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发同一个 CancellationToken：HTTP 服务停止接收请求，调度器退出循环，
//! 进行中的爬取在两次抓取之间停止并记为 failed；之后按注册顺序执行收尾钩子（等待爬取收尾、关闭连接池）。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::knowledge::Crawler;
use crate::store::StoreHandles;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
    /// 主应用自行结束
    Finished,
}

/// 关闭信号：一个共享 token + 首次触发的原因
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 各长驻任务持有的 token；爬取任务使用其 child_token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                tracing::info!(reason = ?reason, "shutdown requested");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭后执行的收尾钩子
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志中的名称
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行收尾钩子，每个钩子单独限时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    hooks: Vec<Box<dyn ShutdownCleanup>>,
    hook_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            hooks: Vec::new(),
            hook_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.hook_timeout = Duration::from_secs(secs);
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, hook: T) {
        self.hooks.push(Box::new(hook));
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }

    /// 钩子失败或超时只记录，继续执行后面的钩子
    pub async fn run_cleanup(&self) {
        for hook in &self.hooks {
            let name = hook.name();
            match tokio::time::timeout(self.hook_timeout, hook.cleanup()).await {
                Ok(Ok(())) => tracing::info!(hook = name, "cleanup done"),
                Ok(Err(e)) => tracing::warn!(hook = name, error = %e, "cleanup failed"),
                Err(_) => tracing::warn!(hook = name, timeout = ?self.hook_timeout, "cleanup timed out"),
            }
        }
    }
}

/// 关闭存储连接池（应放在最后）
pub struct StoreCleanup {
    store: StoreHandles,
}

impl StoreCleanup {
    pub fn new(store: StoreHandles) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ShutdownCleanup for StoreCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.store.close().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "store"
    }
}

/// 等待进行中的爬取响应取消并写完检查点
pub struct CrawlDrain {
    crawler: Arc<Crawler>,
    poll: Duration,
}

impl CrawlDrain {
    pub fn new(crawler: Arc<Crawler>) -> Self {
        Self {
            crawler,
            poll: Duration::from_millis(50),
        }
    }
}

#[async_trait]
impl ShutdownCleanup for CrawlDrain {
    async fn cleanup(&self) -> anyhow::Result<()> {
        while self.crawler.is_running() {
            tokio::time::sleep(self.poll).await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "crawl"
    }
}

/// 运行主应用直到其结束（应用自身监听关闭 token 退出），随后确保 token 已取消并执行收尾
pub async fn run_with_graceful_shutdown<F>(coordinator: &ShutdownCoordinator, app: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let manager = coordinator.manager();
    manager.install_signal_handlers();

    let result = app.await;
    match &result {
        Ok(()) => manager.shutdown(ShutdownReason::Finished),
        Err(e) => {
            tracing::error!(error = %e, "application failed");
            manager.shutdown(ShutdownReason::FatalError(e.to_string()));
        }
    }

    coordinator.run_cleanup().await;
    tracing::info!(reason = ?manager.reason(), "shutdown complete");
    result
}

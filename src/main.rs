//! Parley - 多角色对话编排服务
//!
//! 入口：初始化日志、加载配置、连接存储（不可达即退出）、启动调度器与 HTTP 服务，
//! 收到关闭信号后等待爬取收尾并关闭连接池。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use parley::config::load_config;
use parley::core::{
    run_with_graceful_shutdown, CrawlDrain, ServiceContext, ShutdownCoordinator, ShutdownManager, StoreCleanup,
};
use parley::{observability, server};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 可选：第一个参数为额外的配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;
    ensure_sqlite_dir(&cfg.store.url)?;

    let shutdown = Arc::new(ShutdownManager::new());
    let ctx = Arc::new(
        ServiceContext::build(cfg, Arc::clone(&shutdown))
            .await
            .context("Startup failed")?,
    );

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown)).with_timeout(10);
    coordinator.register(CrawlDrain::new(Arc::clone(&ctx.crawler)));
    coordinator.register(StoreCleanup::new(ctx.store.clone()));

    let listener = TcpListener::bind(ctx.config.server.bind.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", ctx.config.server.bind))?;

    let scheduler = ctx.scheduler().map(|s| s.spawn());
    if scheduler.is_none() {
        tracing::info!("scheduler disabled");
    }

    run_with_graceful_shutdown(&coordinator, async move {
        server::serve(Arc::clone(&ctx), listener)
            .await
            .context("HTTP server failed")?;
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                tracing::error!("scheduler task failed: {}", e);
            }
        }
        Ok(())
    })
    .await
}

/// SQLite 文件所在目录不存在时创建（内存库跳过）
fn ensure_sqlite_dir(url: &str) -> anyhow::Result<()> {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return Ok(());
    };
    let path = rest.trim_start_matches("//");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.contains(":memory:") {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
    }
    Ok(())
}

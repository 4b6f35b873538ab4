//! HTTP 接口
//!
//! - POST /orchestrate        驱动一次编排
//! - POST /crawl/trigger      后台启动爬取（202），已有爬取时 409
//! - GET  /crawl/status       当前检查点
//! - GET  /sessions/:id/turns 会话全部轮次
//! - GET  /health

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;

use crate::core::{CrawlError, OrchestrationError, ServiceContext, StoreError};
use crate::knowledge::CrawlParams;
use crate::orchestrator::{OrchestrateRequest, OrchestrateResponse};
use crate::store::{CrawlCheckpoint, Turn};

type AppState = Arc<ServiceContext>;

/// 统一错误响应：`{"status":"error","error":...,"kind":...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message: message.into(),
        }
    }
}

impl From<OrchestrationError> for ApiError {
    fn from(e: OrchestrationError) -> Self {
        let status = match &e {
            OrchestrationError::GenerationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            OrchestrationError::Generation { .. }
            | OrchestrationError::EmptyGeneration(_)
            | OrchestrationError::Delivery { .. } => StatusCode::BAD_GATEWAY,
            OrchestrationError::SessionTerminated(_) => StatusCode::CONFLICT,
            OrchestrationError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            OrchestrationError::UnknownAgent(_) | OrchestrationError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestrationError::NoAgents => StatusCode::SERVICE_UNAVAILABLE,
            OrchestrationError::Store(store) if store.is_connectivity() => StatusCode::SERVICE_UNAVAILABLE,
            OrchestrationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        OrchestrationError::Store(e).into()
    }
}

impl From<CrawlError> for ApiError {
    fn from(e: CrawlError) -> Self {
        let e = match e {
            CrawlError::Store(store) => return store.into(),
            other => other,
        };
        let (status, kind) = match &e {
            CrawlError::AlreadyRunning => (StatusCode::CONFLICT, "crawl_running"),
            CrawlError::InvalidStartUrl(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "crawl_error"),
        };
        Self {
            status,
            kind,
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "status": "error",
            "error": self.message,
            "kind": self.kind,
        });
        (self.status, Json(body)).into_response()
    }
}

pub fn router(ctx: AppState) -> Router {
    Router::new()
        .route("/orchestrate", post(orchestrate))
        .route("/crawl/trigger", post(crawl_trigger))
        .route("/crawl/status", get(crawl_status))
        .route("/sessions/:id/turns", get(session_turns))
        .route("/health", get(|| async { "OK" }))
        .with_state(ctx)
}

/// 服务直到关闭 token 触发，进行中的请求处理完再返回
pub async fn serve(ctx: AppState, listener: TcpListener) -> std::io::Result<()> {
    let token = ctx.shutdown.token();
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Listening on http://{}", addr);
    }
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

async fn orchestrate(
    State(ctx): State<AppState>,
    body: Result<Json<OrchestrateRequest>, JsonRejection>,
) -> Result<Json<OrchestrateResponse>, ApiError> {
    let Json(req) = body?;
    match ctx.orchestrator.orchestrate(req).await {
        Ok(resp) => Ok(Json(resp)),
        Err(e) => {
            tracing::warn!(kind = e.kind(), error = %e, "orchestrate failed");
            Err(e.into())
        }
    }
}

/// 缺省字段取配置值；delay 单位为秒
#[derive(Debug, Default, Deserialize)]
struct CrawlTriggerRequest {
    #[serde(default)]
    start_url: Option<String>,
    #[serde(default)]
    max_pages: Option<usize>,
    #[serde(default)]
    delay: Option<f64>,
    #[serde(default)]
    rebuild: Option<bool>,
}

#[derive(Debug, Serialize)]
struct CrawlAccepted {
    status: &'static str,
    #[serde(flatten)]
    params: CrawlParams,
}

async fn crawl_trigger(
    State(ctx): State<AppState>,
    body: Result<Json<CrawlTriggerRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CrawlAccepted>), ApiError> {
    let Json(req) = body?;
    let defaults = ctx.default_crawl_params();

    let start_url = req
        .start_url
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or(defaults.start_url);
    let valid = Url::parse(&start_url)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false);
    if !valid {
        return Err(ApiError::bad_request(format!("invalid start_url '{}'", start_url)));
    }
    let delay = match req.delay {
        Some(secs) => std::time::Duration::try_from_secs_f64(secs)
            .map_err(|_| ApiError::bad_request("delay must be a non-negative number of seconds"))?,
        None => defaults.delay,
    };
    let params = CrawlParams {
        start_url,
        max_pages: req.max_pages.unwrap_or(defaults.max_pages),
        delay,
        rebuild: req.rebuild.unwrap_or(defaults.rebuild),
    };

    let handle = ctx
        .crawler
        .spawn(params.clone(), ctx.shutdown.token().child_token())?;
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(report)) => tracing::info!(pages = report.pages_crawled, "triggered crawl done"),
            Ok(Err(e)) => tracing::warn!(error = %e, "triggered crawl failed"),
            Err(e) => tracing::error!(error = %e, "crawl task panicked"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(CrawlAccepted {
            status: "started",
            params,
        }),
    ))
}

async fn crawl_status(State(ctx): State<AppState>) -> Result<Json<CrawlCheckpoint>, ApiError> {
    Ok(Json(ctx.store.checkpoints.load().await?))
}

async fn session_turns(
    State(ctx): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Turn>>, ApiError> {
    Ok(Json(ctx.orchestrator.history(&id).await?))
}

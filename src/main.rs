mod backend;
mod clock;
mod config;
mod error;
mod fallback;
mod feed;
mod http_client;
mod launcher;
mod machine;
mod orchestrator;
mod prober;
mod stream;
#[cfg(test)]
mod testing;
mod types;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Multipart, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::backend::HttpBackend;
use crate::config::AppConfig;
use crate::error::TaskError;
use crate::orchestrator::Orchestrator;
use crate::types::{PackageUpload, ResourceUpdateParams, Task};

#[derive(Clone)]
struct AppState {
    orchestrator: Orchestrator,
    refresh: broadcast::Sender<Task>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let config = AppConfig::from_env();
    let backend = HttpBackend::new(&config.server)
        .with_context(|| format!("弹幕服务地址无效: {}", config.server.base_url))?;
    info!("🔗 弹幕服务: {}", config.server.base_url);

    // 任务结束后通知前端刷新
    let (refresh, _) = broadcast::channel::<Task>(16);
    let notify = refresh.clone();
    let orchestrator = Orchestrator::new(
        Arc::new(backend),
        config.orchestrator.clone(),
        Arc::new(move |task: &Task| {
            let _ = notify.send(task.clone());
        }),
    );
    let state = AppState {
        orchestrator,
        refresh,
    };

    // CORS 配置
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    // 路由
    let app = Router::new()
        .route("/api", get(api_info_handler))
        .route("/health", get(health_handler))
        // 任务
        .route(
            "/api/task",
            get(task_handler).post(start_handler).delete(clear_handler),
        )
        .route("/api/task/cancel", post(cancel_handler))
        .route("/api/task/events", get(events_handler))
        // 安装包
        .route("/api/install", post(install_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("🚀 任务控制台启动于 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("无法监听 {}", addr))?;
    axum::serve(listener, app).await.context("服务异常退出")?;
    Ok(())
}

/// GET /api - API 信息
async fn api_info_handler() -> impl IntoResponse {
    Json(json!({
        "name": "Danmu Task Console",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "弹幕服务后台任务进度控制台",
        "endpoints": {
            "GET /api/task": "当前任务状态",
            "POST /api/task": "启动资源更新任务 {repoUrl, fullReplace}",
            "DELETE /api/task": "清除已结束的任务",
            "POST /api/task/cancel": "取消当前任务",
            "GET /api/task/events": "任务状态推送 (SSE: state / refresh)",
            "POST /api/install": "上传安装包 (multipart: file)",
            "GET /health": "健康检查"
        }
    }))
}

/// GET /health - 健康检查
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// GET /api/task - 当前任务快照
async fn task_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.snapshot())
}

/// POST /api/task - 启动任务
async fn start_handler(
    State(state): State<AppState>,
    Json(params): Json<ResourceUpdateParams>,
) -> Response {
    match state.orchestrator.start(params).await {
        Ok(task_id) => (StatusCode::ACCEPTED, Json(json!({ "taskId": task_id }))).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/task/cancel - 取消任务, 立即生效
async fn cancel_handler(State(state): State<AppState>) -> Response {
    match state.orchestrator.cancel().await {
        Ok(()) => Json(state.orchestrator.snapshot()).into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /api/task - 清除已结束的任务
async fn clear_handler(State(state): State<AppState>) -> Response {
    let view = state.orchestrator.snapshot();
    if view.task.is_none() {
        return error_response(TaskError::NoActiveTask);
    }
    if !view.is_settled() {
        return error_response(TaskError::TaskInProgress);
    }

    state.orchestrator.clear().await;
    StatusCode::NO_CONTENT.into_response()
}

/// GET /api/task/events - SSE 状态推送
async fn events_handler(State(state): State<AppState>) -> Response {
    let stream = feed::task_feed(state.orchestrator.watch(), state.refresh.subscribe());
    let body = Body::from_stream(stream.map(Ok::<_, std::convert::Infallible>));

    (
        [
            (header::CONTENT_TYPE, "text/event-stream; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}

/// POST /api/install - 上传安装包
async fn install_handler(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut upload: Option<PackageUpload> = None;

    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("package.zip").to_string();
        match field.bytes().await {
            Ok(bytes) => {
                upload = Some(PackageUpload {
                    file_name,
                    bytes: bytes.to_vec(),
                });
            }
            Err(e) => {
                warn!("读取上传文件失败: {}", e);
                return error_response(TaskError::Validation(format!("读取上传文件失败: {}", e)));
            }
        }
    }

    let Some(upload) = upload else {
        return error_response(TaskError::Validation("缺少 file 字段".to_string()));
    };

    match state.orchestrator.install(upload).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: TaskError) -> Response {
    let status = match &e {
        TaskError::Validation(_) => StatusCode::BAD_REQUEST,
        TaskError::NoActiveTask | TaskError::TaskInProgress => StatusCode::CONFLICT,
        TaskError::Transport(_) => StatusCode::BAD_GATEWAY,
        TaskError::TaskFailure(_) | TaskError::RestartTimeout | TaskError::StatusUnknown => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "detail": e.to_string() }))).into_response()
}

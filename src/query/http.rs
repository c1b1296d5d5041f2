use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::IndexError;
use crate::index::engine::IndexEngine;
use crate::index::rebuild::{CancelToken, RebuildMode, RebuildOptions};
use crate::store::fast::FastStore;
use crate::store::primary::PrimaryStore;

/// 引擎上的薄 HTTP 壳。路由即外部操作面；引擎自身不知道 HTTP 存在。
pub struct ApiServer<P, F> {
    engine: Arc<IndexEngine<P, F>>,
}

#[derive(Deserialize)]
pub struct PageParams {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_sort")]
    pub sort: String,
    #[serde(default = "default_dir")]
    pub dir: String,
}

fn default_page() -> u64 {
    1
}
fn default_page_size() -> u64 {
    20
}
fn default_sort() -> String {
    "updated".to_string()
}
fn default_dir() -> String {
    "desc".to_string()
}

#[derive(Deserialize)]
pub struct RebuildRequest {
    pub mode: RebuildMode,
    #[serde(default)]
    pub skip_thumbnail_caching: bool,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Deserialize)]
pub struct VerifyParams {
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Serialize)]
pub struct RebuildAccepted {
    pub accepted: bool,
    pub mode: RebuildMode,
}

impl<P: PrimaryStore, F: FastStore> ApiServer<P, F> {
    pub fn new(engine: Arc<IndexEngine<P, F>>) -> Self {
        Self { engine }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/collections", get(page_handler::<P, F>))
            .route("/collections/random", get(random_handler::<P, F>))
            .route("/index/stats", get(stats_handler::<P, F>))
            .route("/index/rebuild", post(rebuild_handler::<P, F>))
            .route("/index/verify", post(verify_handler::<P, F>))
            .with_state(self.engine)
    }

    pub async fn run(self, port: u16) -> anyhow::Result<()> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        tracing::info!("HTTP API listening on port {}", port);
        axum::serve(listener, app).await?;
        Ok(())
    }
}

fn http_error(e: IndexError) -> (StatusCode, String) {
    let code = match &e {
        IndexError::InvalidPage { .. }
        | IndexError::InvalidSortKey(_)
        | IndexError::InvalidSortDirection(_) => StatusCode::BAD_REQUEST,
        IndexError::RebuildInProgress => StatusCode::CONFLICT,
        IndexError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        IndexError::Primary(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, e.to_string())
}

async fn page_handler<P: PrimaryStore, F: FastStore>(
    Query(params): Query<PageParams>,
    State(engine): State<Arc<IndexEngine<P, F>>>,
) -> Result<Json<crate::model::PageResult>, (StatusCode, String)> {
    engine
        .get_collection_page(params.page, params.page_size, &params.sort, &params.dir)
        .map(Json)
        .map_err(http_error)
}

async fn random_handler<P: PrimaryStore, F: FastStore>(
    State(engine): State<Arc<IndexEngine<P, F>>>,
) -> Result<Json<crate::model::IndexSummary>, (StatusCode, String)> {
    match engine.get_random_collection().map_err(http_error)? {
        Some(summary) => Ok(Json(summary)),
        None => Err((StatusCode::NOT_FOUND, "no collections indexed".to_string())),
    }
}

async fn stats_handler<P: PrimaryStore, F: FastStore>(
    State(engine): State<Arc<IndexEngine<P, F>>>,
) -> Result<Json<crate::index::stats::IndexStats>, (StatusCode, String)> {
    engine.get_index_stats().map(Json).map_err(http_error)
}

/// 202 立即返回；进度由 /index/stats 的 watermark/有效性体现。
/// 并发触发拿 409，由调用方稍后重试。
async fn rebuild_handler<P: PrimaryStore, F: FastStore>(
    State(engine): State<Arc<IndexEngine<P, F>>>,
    Json(req): Json<RebuildRequest>,
) -> Result<(StatusCode, Json<RebuildAccepted>), (StatusCode, String)> {
    let opts = RebuildOptions {
        mode: req.mode,
        skip_thumbnail_caching: req.skip_thumbnail_caching,
        dry_run: req.dry_run,
    };
    let handle = engine
        .spawn_rebuild(opts, CancelToken::new())
        .map_err(http_error)?;
    // 结果只进日志；句柄的 watch 端留给进程内消费者。
    tokio::spawn(async move {
        let _ = handle.wait().await;
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(RebuildAccepted {
            accepted: true,
            mode: req.mode,
        }),
    ))
}

async fn verify_handler<P: PrimaryStore, F: FastStore>(
    Query(params): Query<VerifyParams>,
    State(engine): State<Arc<IndexEngine<P, F>>>,
) -> Result<Json<crate::index::stats::VerifyResult>, (StatusCode, String)> {
    engine
        .verify_index(params.dry_run, &CancelToken::new())
        .await
        .map(Json)
        .map_err(http_error)
}

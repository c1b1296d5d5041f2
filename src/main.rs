use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;
use tracing::info;

use col_idx::config::ServiceConfig;
use col_idx::index::{CancelToken, IndexEngine, RebuildMode, RebuildOptions};
use col_idx::model::{CollectionKind, CollectionRecord, ThumbnailInfo};
use col_idx::query::http::ApiServer;
use col_idx::store::{MemoryFastStore, MemoryPrimaryStore};

#[derive(Parser)]
#[command(name = "col-idx", about = "Read-optimized index engine for media collection libraries")]
struct Args {
    /// TOML 配置路径；缺省走默认值。
    #[arg(long)]
    config: Option<PathBuf>,

    /// 覆盖配置里的 HTTP 端口。
    #[arg(long)]
    port: Option<u16>,

    /// 向内存 primary store 注入 N 条演示集合（0 = 不注入）。
    #[arg(long, default_value_t = 0)]
    seed: usize,

    /// ChangedOnly 周期 rebuild 的间隔秒数。
    #[arg(long, default_value_t = 300)]
    sync_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = ServiceConfig::load(args.config.as_deref())?;
    let port = args.port.unwrap_or(cfg.http_port);

    info!("Starting col-idx: index synchronization engine");

    let primary = Arc::new(MemoryPrimaryStore::new());
    if args.seed > 0 {
        seed_demo_collections(&primary, args.seed);
        info!("Seeded {} demo collections", args.seed);
    }
    let fast = Arc::new(MemoryFastStore::new());
    let engine = Arc::new(IndexEngine::new(primary, fast, &cfg));

    // 首次建立：后台全量，启动不等它。
    match engine.spawn_rebuild(
        RebuildOptions {
            mode: RebuildMode::Full,
            skip_thumbnail_caching: false,
            dry_run: false,
        },
        CancelToken::new(),
    ) {
        Ok(handle) => {
            tokio::spawn(async move {
                let _ = handle.wait().await;
            });
        }
        Err(e) => tracing::warn!("initial rebuild not started: {e}"),
    }

    // 周期同步：增量追 watermark + 缓存目录计数纠偏。
    let sync_engine = engine.clone();
    let interval = args.sync_interval;
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(interval)).await;
            sync_engine.reconcile_cache_folders();
            match sync_engine.spawn_rebuild(
                RebuildOptions::default(),
                CancelToken::new(),
            ) {
                Ok(handle) => {
                    let _ = handle.wait().await;
                }
                // 已有 rebuild 在跑：本轮合并跳过。
                Err(e) => tracing::debug!("periodic sync skipped: {e}"),
            }
        }
    });

    let api = ApiServer::new(engine);
    tokio::spawn(async move {
        if let Err(e) = api.run(port).await {
            tracing::error!("HTTP server exited: {e}");
        }
    });

    info!("col-idx ready. Browse via: http://localhost:{port}/collections");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    Ok(())
}

/// 演示数据：时间戳错开，便于观察 ChangedOnly 的 watermark 行为。
fn seed_demo_collections(primary: &MemoryPrimaryStore, n: usize) {
    let base = Utc::now() - Duration::hours(n as i64);
    for i in 0..n {
        let id = format!("col-{i:05}");
        let at = base + Duration::hours(i as i64);
        primary.upsert(CollectionRecord {
            name: format!("Collection {i:05}"),
            path: PathBuf::from(format!("/library/collection-{i:05}")),
            kind: if i % 4 == 0 {
                CollectionKind::Archive
            } else {
                CollectionKind::Folder
            },
            image_count: (i % 90 + 10) as u32,
            thumbnail_count: (i % 90 + 10) as u32,
            cache_image_count: 0,
            total_size_bytes: (i as u64 + 1) * 3 * 1024 * 1024,
            created_at: at,
            updated_at: at,
            first_image_id: Some(format!("img-{i:05}-0001")),
            thumbnail: ThumbnailInfo::default(),
            id,
        });
    }
}

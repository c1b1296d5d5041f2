use std::sync::Arc;

use tokio::sync::watch;

use crate::cache::{CacheFolder, CacheFolderAllocator, CachePlacement};
use crate::config::ServiceConfig;
use crate::error::IndexError;
use crate::index::builder::SummaryBuilder;
use crate::index::rebuild::{
    CancelToken, RebuildCoordinator, RebuildHandle, RebuildOptions,
};
use crate::index::stats::{IndexStats, RebuildProgress, RebuildStats, VerifyResult};
use crate::index::verify::ConsistencyVerifier;
use crate::model::{IndexSummary, PageResult};
use crate::query::service::QueryService;
use crate::store::fast::FastStore;
use crate::store::primary::PrimaryStore;

/// 引擎门面：外部 CRUD/API 层只跟它打交道。
///
/// 组合四个部件：rebuild 编排、一致性校验、读服务、缓存目录分配。
/// 自身无状态，全部状态在两个 store 和分配器的计数器里。
pub struct IndexEngine<P, F> {
    coordinator: Arc<RebuildCoordinator<P, F>>,
    verifier: ConsistencyVerifier<P, F>,
    query: QueryService<P, F>,
    allocator: Arc<CacheFolderAllocator>,
}

impl<P: PrimaryStore, F: FastStore> IndexEngine<P, F> {
    pub fn new(primary: Arc<P>, fast: Arc<F>, cfg: &ServiceConfig) -> Self {
        let folders = cfg
            .cache_folders
            .iter()
            .map(|c| Arc::new(CacheFolder::from_config(c)))
            .collect();
        Self::with_allocator(primary, fast, cfg, Arc::new(CacheFolderAllocator::new(folders)))
    }

    pub fn with_allocator(
        primary: Arc<P>,
        fast: Arc<F>,
        cfg: &ServiceConfig,
        allocator: Arc<CacheFolderAllocator>,
    ) -> Self {
        let builder = Arc::new(SummaryBuilder::from_config(&cfg.rebuild));
        let coordinator = Arc::new(RebuildCoordinator::new(
            primary.clone(),
            fast.clone(),
            builder.clone(),
            cfg.effective_workers(),
            cfg.rebuild.batch_size,
        ));
        let verifier = ConsistencyVerifier::new(primary.clone(), fast.clone(), builder);
        let query = QueryService::new(primary, fast);
        Self {
            coordinator,
            verifier,
            query,
            allocator,
        }
    }

    /// 同步 rebuild：等完整统计。并发调用拿 `RebuildInProgress`。
    pub async fn rebuild_index(
        &self,
        opts: RebuildOptions,
        cancel: &CancelToken,
    ) -> Result<RebuildStats, IndexError> {
        self.coordinator.rebuild(opts, cancel).await
    }

    /// 后台 rebuild：立即返回句柄（进度 watch + 可等待结果）。
    pub fn spawn_rebuild(
        &self,
        opts: RebuildOptions,
        cancel: CancelToken,
    ) -> Result<RebuildHandle, IndexError> {
        self.coordinator.spawn(opts, cancel)
    }

    pub fn rebuild_progress(&self) -> watch::Receiver<RebuildProgress> {
        self.coordinator.progress()
    }

    pub fn rebuild_in_progress(&self) -> bool {
        self.coordinator.in_progress()
    }

    pub async fn verify_index(
        &self,
        dry_run: bool,
        cancel: &CancelToken,
    ) -> Result<VerifyResult, IndexError> {
        self.verifier.verify(dry_run, cancel).await
    }

    pub fn get_index_stats(&self) -> Result<IndexStats, IndexError> {
        self.query.index_stats()
    }

    pub fn is_index_valid(&self) -> bool {
        self.query.is_index_valid()
    }

    pub fn get_collection_page(
        &self,
        page: u64,
        page_size: u64,
        sort_by: &str,
        direction: &str,
    ) -> Result<PageResult, IndexError> {
        self.query.get_page(page, page_size, sort_by, direction)
    }

    pub fn get_random_collection(&self) -> Result<Option<IndexSummary>, IndexError> {
        self.query.get_random()
    }

    /// 为缓存工件选落盘位置。None = 没有目录有容量，调用方跳过缓存。
    pub fn select_cache_folder_for_artifact(
        &self,
        collection_id: &str,
        artifact_id: &str,
        width: u32,
        height: u32,
        format: &str,
        estimated_bytes: u64,
    ) -> Option<CachePlacement> {
        self.allocator.select_cache_path(
            collection_id,
            artifact_id,
            width,
            height,
            format,
            estimated_bytes,
        )
    }

    /// 带外任务：缓存目录计数器从磁盘纠偏。
    pub fn reconcile_cache_folders(&self) {
        self.allocator.reconcile_from_disk();
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::IndexError;
use crate::index::builder::SummaryBuilder;
use crate::index::stats::{read_process_rss, RebuildProgress, RebuildStats};
use crate::index::verify::{compute_diff, IndexDiff};
use crate::index::{read_watermark, remove_ops, upsert_ops};
use crate::model::{CollectionId, CollectionRecord, SortKey};
use crate::store::fast::{FastOp, FastStore};
use crate::store::keys;
use crate::store::primary::PrimaryStore;

/// rebuild 的四种模式：本质是"待触碰 id 选择集"上的小状态机。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebuildMode {
    /// 只取 updatedAt 晚于 watermark 的集合。最便宜，默认推荐。
    ChangedOnly,
    /// 选择集交给 verifier 的 diff：只重建真正不一致的部分，并补发删除。
    Verify,
    /// 先清空再全量。首次建立或疑似损坏时用，O(总集合数)。
    Full,
    /// 全量但不清空：schema 变更后就地覆盖旧字段，避免窗口期记录缺失。
    ForceRebuildAll,
}

/// 不可变的运行配置。没有动态 option bag：字段全部枚举化。
#[derive(Clone, Copy, Debug)]
pub struct RebuildOptions {
    pub mode: RebuildMode,
    /// 跳过缩略图嵌入（约省四成墙钟时间）。
    pub skip_thumbnail_caching: bool,
    /// 只算统计不写 store：给 Full/ForceRebuildAll 预估成本用。
    pub dry_run: bool,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            mode: RebuildMode::ChangedOnly,
            skip_thumbnail_caching: false,
            dry_run: false,
        }
    }
}

/// 协作式取消：批次边界检查。被取消的运行返回截断统计而非错误，
/// 已写入的条目单条自洽，索引保持可用（可能偏旧）。
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct GateState {
    in_progress: bool,
}

/// 后台 rebuild 的句柄：进度 watch + 可等待的结果。
/// 取代"触发即返回、调用方靠固定延迟猜进度"的旧模式。
pub struct RebuildHandle {
    pub progress: watch::Receiver<RebuildProgress>,
    task: JoinHandle<Result<RebuildStats, IndexError>>,
}

impl RebuildHandle {
    pub async fn wait(self) -> Result<RebuildStats, IndexError> {
        match self.task.await {
            Ok(r) => r,
            Err(e) => Err(IndexError::Primary(format!("rebuild task failed: {e}"))),
        }
    }
}

/// Rebuild 编排器。
///
/// 单写者门只围住编排本身，不围住单条写入；并发调用直接拿到
/// `RebuildInProgress`。读请求从不经过这把门。
pub struct RebuildCoordinator<P, F> {
    primary: Arc<P>,
    fast: Arc<F>,
    builder: Arc<SummaryBuilder>,
    gate: Mutex<GateState>,
    pool: Arc<rayon::ThreadPool>,
    batch_size: usize,
    progress_tx: watch::Sender<RebuildProgress>,
}

/// 错误样本上限：完整失败明细走日志，统计里只留样本。
const ERROR_SAMPLE_CAP: usize = 16;

impl<P: PrimaryStore, F: FastStore> RebuildCoordinator<P, F> {
    pub fn new(
        primary: Arc<P>,
        fast: Arc<F>,
        builder: Arc<SummaryBuilder>,
        workers: usize,
        batch_size: usize,
    ) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("col-idx-build-{i}"))
            .build()
            .expect("summary build pool");
        let (progress_tx, _) = watch::channel(RebuildProgress::Idle);
        Self {
            primary,
            fast,
            builder,
            gate: Mutex::new(GateState::default()),
            pool: Arc::new(pool),
            batch_size: batch_size.max(1),
            progress_tx,
        }
    }

    pub fn progress(&self) -> watch::Receiver<RebuildProgress> {
        self.progress_tx.subscribe()
    }

    pub fn in_progress(&self) -> bool {
        self.gate.lock().in_progress
    }

    fn try_start(&self) -> bool {
        let mut st = self.gate.lock();
        if st.in_progress {
            return false;
        }
        st.in_progress = true;
        true
    }

    fn finish(&self) {
        self.gate.lock().in_progress = false;
    }

    /// 同步入口：持门跑完整个运行。并发调用返回 `RebuildInProgress`。
    pub async fn rebuild(
        &self,
        opts: RebuildOptions,
        cancel: &CancelToken,
    ) -> Result<RebuildStats, IndexError> {
        if !self.try_start() {
            return Err(IndexError::RebuildInProgress);
        }
        let result = self.run(opts, cancel).await;
        self.finish();
        result
    }

    /// 后台入口：门在 spawn 时立即判定，调用方同步拿到句柄或 `RebuildInProgress`。
    pub fn spawn(
        self: &Arc<Self>,
        opts: RebuildOptions,
        cancel: CancelToken,
    ) -> Result<RebuildHandle, IndexError> {
        if !self.try_start() {
            return Err(IndexError::RebuildInProgress);
        }
        let this = self.clone();
        let task = tokio::spawn(async move {
            let result = this.run(opts, &cancel).await;
            this.finish();
            match &result {
                Ok(stats) => tracing::info!("{stats}"),
                Err(e) => tracing::error!("background rebuild failed: {e}"),
            }
            result
        });
        Ok(RebuildHandle {
            progress: self.progress(),
            task,
        })
    }

    async fn run(
        &self,
        opts: RebuildOptions,
        cancel: &CancelToken,
    ) -> Result<RebuildStats, IndexError> {
        let started = Instant::now();
        // watermark 取选择集采样时刻：运行期间的新变更留给下一轮 ChangedOnly，
        // 绝不会因为"推进到结束时刻"而漏掉。
        let run_watermark = Utc::now().timestamp_millis().max(0) as u64;
        let mut peak_rss = read_process_rss();

        tracing::info!(mode = ?opts.mode, dry_run = opts.dry_run, "rebuild starting");

        let (selection, removals) = self.select(&opts).await?;
        let total = selection.len() as u64;
        let _ = self
            .progress_tx
            .send(RebuildProgress::Running { processed: 0, total });

        let mut rebuilt: u64 = 0;
        let mut skipped: u64 = 0;
        let mut processed: u64 = 0;
        let mut truncated = false;
        let mut error_samples: Vec<String> = Vec::new();

        for chunk in selection.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                truncated = true;
                tracing::warn!(processed, total, "rebuild cancelled, reporting truncated run");
                break;
            }

            let batch: Vec<CollectionRecord> = chunk.to_vec();
            let batch_len = batch.len() as u64;
            let builder = self.builder.clone();
            let pool = self.pool.clone();
            let skip_thumb = opts.skip_thumbnail_caching;

            // 缩略图嵌入是 IO+CPU 混合负载：spawn_blocking 下走专用 rayon 池。
            let built = tokio::task::spawn_blocking(move || {
                pool.install(|| {
                    batch
                        .par_iter()
                        .map(|rec| (rec.id.clone(), builder.build(rec, skip_thumb)))
                        .collect::<Vec<_>>()
                })
            })
            .await;

            let built = match built {
                Ok(v) => v,
                Err(e) => {
                    // 批内 panic：整批按 skipped 计，继续后面的批次。
                    tracing::error!("summary build batch panicked: {e}");
                    skipped += batch_len;
                    processed += batch_len;
                    continue;
                }
            };

            for (id, res) in built {
                match res {
                    Ok(summary) => {
                        if !opts.dry_run {
                            self.fast.pipeline(upsert_ops(&summary))?;
                        }
                        rebuilt += 1;
                    }
                    Err(e) => {
                        skipped += 1;
                        tracing::warn!(collection = %id, "summary build failed: {e}");
                        if error_samples.len() < ERROR_SAMPLE_CAP {
                            error_samples.push(format!("{id}: {e}"));
                        }
                    }
                }
            }

            processed += batch_len;
            peak_rss = peak_rss.max(read_process_rss());
            let _ = self
                .progress_tx
                .send(RebuildProgress::Running { processed, total });
        }

        // Verify 模式的删除集：在 upsert 之后补发；取消的运行不动存量。
        if !opts.dry_run && !truncated {
            for id in &removals {
                self.fast.pipeline(remove_ops(id))?;
            }

            // watermark 只在全部 upsert 落定后推进：
            // 中途崩溃不会把 watermark 推过未处理的条目。
            let mut meta_ops = vec![FastOp::Set {
                key: keys::WATERMARK_KEY.to_string(),
                value: run_watermark.to_string().into_bytes(),
            }];
            // schema 版本只由重写了每一条记录的模式盖章。增量/修复运行
            // 不改存量记录的形状，盖章会把旧形状的索引宣告成新版本。
            if matches!(opts.mode, RebuildMode::Full | RebuildMode::ForceRebuildAll) {
                meta_ops.push(FastOp::Set {
                    key: keys::SCHEMA_KEY.to_string(),
                    value: keys::SCHEMA_VERSION.to_string().into_bytes(),
                });
            }
            self.fast.pipeline(meta_ops)?;
        }

        let _ = self
            .progress_tx
            .send(RebuildProgress::Finished { rebuilt, skipped });

        Ok(RebuildStats {
            mode: opts.mode,
            dry_run: opts.dry_run,
            truncated,
            duration_ms: started.elapsed().as_millis() as u64,
            total_collections: total,
            rebuilt_collections: rebuilt,
            skipped_collections: skipped,
            error_samples,
            peak_rss_bytes: peak_rss,
            finished_at: Utc::now(),
        })
    }

    /// 模式 → (选择集, 删除集)。
    async fn select(
        &self,
        opts: &RebuildOptions,
    ) -> Result<(Vec<CollectionRecord>, Vec<CollectionId>), IndexError> {
        match opts.mode {
            RebuildMode::ChangedOnly => {
                let wm = read_watermark(self.fast.as_ref())?.unwrap_or(0);
                let changed = self.primary.fetch_changed_since(wm)?;
                tracing::debug!(watermark = wm, changed = changed.len(), "changed-only selection");
                Ok((changed, Vec::new()))
            }
            RebuildMode::Full => {
                if !opts.dry_run {
                    self.clear_index()?;
                }
                Ok((self.primary.fetch_all()?, Vec::new()))
            }
            RebuildMode::ForceRebuildAll => Ok((self.primary.fetch_all()?, Vec::new())),
            RebuildMode::Verify => {
                let diff: IndexDiff = compute_diff(self.primary.as_ref(), self.fast.as_ref())?;
                let mut ids = diff.to_add;
                ids.extend(diff.to_update);
                let records = self.primary.fetch_many(&ids)?;
                Ok((records, diff.to_remove))
            }
        }
    }

    /// Full 模式的前置清空：按 updated 结构枚举现存 id 删 summary，再清全部排序结构。
    fn clear_index(&self) -> Result<(), IndexError> {
        let members = self
            .fast
            .sorted_set_scores(&keys::ordering_key(SortKey::Updated))?;
        let mut ops: Vec<FastOp> = members
            .into_iter()
            .map(|(id, _)| FastOp::Delete {
                key: keys::summary_key(&id),
            })
            .collect();
        for key in SortKey::ALL {
            ops.push(FastOp::ZClear {
                set: keys::ordering_key(key),
            });
        }
        tracing::info!(entries = ops.len(), "full rebuild: clearing index");
        self.fast.pipeline(ops)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CollectionKind, ThumbnailInfo};
    use crate::store::memory::MemoryFastStore;
    use crate::store::primary::MemoryPrimaryStore;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn rec(id: &str, updated_ms: i64) -> CollectionRecord {
        CollectionRecord {
            id: id.to_string(),
            name: format!("col-{id}"),
            path: format!("/library/{id}").into(),
            kind: CollectionKind::Folder,
            image_count: 4,
            thumbnail_count: 4,
            cache_image_count: 1,
            total_size_bytes: 2048,
            created_at: Utc.timestamp_millis_opt(updated_ms - 1000).unwrap(),
            updated_at: Utc.timestamp_millis_opt(updated_ms).unwrap(),
            first_image_id: Some(format!("img-{id}")),
            thumbnail: ThumbnailInfo::default(),
        }
    }

    fn coordinator(
        primary: Arc<MemoryPrimaryStore>,
        fast: Arc<MemoryFastStore>,
    ) -> Arc<RebuildCoordinator<MemoryPrimaryStore, MemoryFastStore>> {
        Arc::new(RebuildCoordinator::new(
            primary,
            fast,
            Arc::new(SummaryBuilder::new(256, 64 * 1024)),
            2,
            8,
        ))
    }

    fn opts(mode: RebuildMode) -> RebuildOptions {
        RebuildOptions {
            mode,
            skip_thumbnail_caching: true,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn full_rebuild_populates_every_ordering_exactly_once() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        for i in 0..25 {
            primary.upsert(rec(&format!("c{i:02}"), 1_000 + i));
        }
        let fast = Arc::new(MemoryFastStore::new());
        let coord = coordinator(primary.clone(), fast.clone());

        let stats = coord
            .rebuild(opts(RebuildMode::Full), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(stats.total_collections, 25);
        assert_eq!(stats.rebuilt_collections, 25);
        assert_eq!(stats.skipped_collections, 0);
        assert!(!stats.truncated);

        for key in SortKey::ALL {
            let members = fast
                .sorted_set_range(&keys::ordering_key(key), 0, 1000, false)
                .unwrap();
            assert_eq!(members.len(), 25, "{:?}", key);
            let unique: HashSet<_> = members.iter().collect();
            assert_eq!(unique.len(), 25, "{:?}", key);
        }
        for i in 0..25 {
            let id = format!("c{i:02}");
            assert!(fast.get(&keys::summary_key(&id)).unwrap().is_some(), "{id}");
        }
    }

    #[tokio::test]
    async fn changed_only_touches_only_records_past_watermark() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        primary.upsert(rec("old", 1_000));
        primary.upsert(rec("newer", 5_000));
        let fast = Arc::new(MemoryFastStore::new());
        // 既有 watermark：晚于 old、早于 newer。
        fast.set(keys::WATERMARK_KEY, b"3000".to_vec()).unwrap();

        let coord = coordinator(primary, fast.clone());
        let stats = coord
            .rebuild(opts(RebuildMode::ChangedOnly), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(stats.total_collections, 1);
        assert_eq!(stats.rebuilt_collections, 1);
        assert!(fast.get(&keys::summary_key("newer")).unwrap().is_some());
        assert!(fast.get(&keys::summary_key("old")).unwrap().is_none());

        // watermark 已推进：立即再跑一轮应选不出任何东西。
        let stats2 = coord
            .rebuild(opts(RebuildMode::ChangedOnly), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(stats2.total_collections, 0);
    }

    #[tokio::test]
    async fn full_clears_stale_entries_force_does_not() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        primary.upsert(rec("live", 1_000));
        let fast = Arc::new(MemoryFastStore::new());
        // 索引里的幽灵条目（primary 已不存在）。
        fast.set(&keys::summary_key("ghost"), b"{}".to_vec()).unwrap();
        fast.sorted_set_add(&keys::ordering_key(SortKey::Updated), "ghost", 9)
            .unwrap();

        let coord = coordinator(primary, fast.clone());

        coord
            .rebuild(opts(RebuildMode::ForceRebuildAll), &CancelToken::new())
            .await
            .unwrap();
        // Force 不清空：幽灵还在（要靠 Verify 收拾）。
        assert!(fast.get(&keys::summary_key("ghost")).unwrap().is_some());

        coord
            .rebuild(opts(RebuildMode::Full), &CancelToken::new())
            .await
            .unwrap();
        assert!(fast.get(&keys::summary_key("ghost")).unwrap().is_none());
        assert!(fast.get(&keys::summary_key("live")).unwrap().is_some());
        assert_eq!(
            fast.sorted_set_card(&keys::ordering_key(SortKey::Updated))
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn dry_run_writes_nothing_but_counts_everything() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        for i in 0..5 {
            primary.upsert(rec(&format!("c{i}"), 1_000 + i));
        }
        let fast = Arc::new(MemoryFastStore::new());
        let coord = coordinator(primary, fast.clone());

        let stats = coord
            .rebuild(
                RebuildOptions {
                    mode: RebuildMode::Full,
                    skip_thumbnail_caching: true,
                    dry_run: true,
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.rebuilt_collections, 5);
        assert!(stats.dry_run);
        assert_eq!(
            fast.sorted_set_card(&keys::ordering_key(SortKey::Updated))
                .unwrap(),
            0
        );
        assert!(fast.get(keys::WATERMARK_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn incremental_runs_never_stamp_schema_version() {
        use crate::index::read_schema_version;

        let primary = Arc::new(MemoryPrimaryStore::new());
        primary.upsert(rec("a", 1_000));
        let fast = Arc::new(MemoryFastStore::new());
        // 旧版本索引 + 已追平的 watermark：模拟 schema 升级后的第一个周期同步。
        fast.set(
            keys::SCHEMA_KEY,
            (keys::SCHEMA_VERSION - 1).to_string().into_bytes(),
        )
        .unwrap();
        fast.set(keys::WATERMARK_KEY, b"2000".to_vec()).unwrap();

        let coord = coordinator(primary, fast.clone());

        // ChangedOnly 空转：一条没重建，schema 必须保持旧版本。
        let stats = coord
            .rebuild(opts(RebuildMode::ChangedOnly), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(stats.rebuilt_collections, 0);
        assert_eq!(
            read_schema_version(fast.as_ref()).unwrap(),
            Some(keys::SCHEMA_VERSION - 1)
        );

        // Verify 只修复漂移条目，同样不盖章。
        coord
            .rebuild(opts(RebuildMode::Verify), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(
            read_schema_version(fast.as_ref()).unwrap(),
            Some(keys::SCHEMA_VERSION - 1)
        );

        // 全量重写之后才允许提升到当前版本。
        coord
            .rebuild(opts(RebuildMode::ForceRebuildAll), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(
            read_schema_version(fast.as_ref()).unwrap(),
            Some(keys::SCHEMA_VERSION)
        );
    }

    #[tokio::test]
    async fn per_item_failure_is_counted_not_fatal() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        primary.upsert(rec("good", 1_000));
        let mut bad = rec("bad", 2_000);
        bad.thumbnail = ThumbnailInfo {
            generated: true,
            valid: true,
            path: Some("/nope/missing.png".into()),
            format: Some("png".into()),
        };
        primary.upsert(bad);
        let fast = Arc::new(MemoryFastStore::new());
        let coord = coordinator(primary, fast.clone());

        // 不跳过缩略图：bad 的缺失文件触发单条失败。
        let stats = coord
            .rebuild(
                RebuildOptions {
                    mode: RebuildMode::Full,
                    skip_thumbnail_caching: false,
                    dry_run: false,
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.rebuilt_collections, 1);
        assert_eq!(stats.skipped_collections, 1);
        assert_eq!(stats.error_samples.len(), 1);
        assert!(fast.get(&keys::summary_key("good")).unwrap().is_some());
        assert!(fast.get(&keys::summary_key("bad")).unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_rebuild_is_rejected_then_allowed() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        primary.upsert(rec("a", 1));
        let fast = Arc::new(MemoryFastStore::new());
        let coord = coordinator(primary, fast);

        let handle = coord
            .spawn(opts(RebuildMode::Full), CancelToken::new())
            .unwrap();
        // 门已被占：第二次 spawn 必须立即拒绝。
        assert!(matches!(
            coord.spawn(opts(RebuildMode::Full), CancelToken::new()),
            Err(IndexError::RebuildInProgress)
        ));

        let stats = handle.wait().await.unwrap();
        assert_eq!(stats.rebuilt_collections, 1);
        // 门已释放。
        assert!(coord.spawn(opts(RebuildMode::Full), CancelToken::new()).is_ok());
    }

    #[tokio::test]
    async fn cancelled_run_reports_truncated_and_keeps_watermark() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        for i in 0..50 {
            primary.upsert(rec(&format!("c{i:02}"), 1_000 + i));
        }
        let fast = Arc::new(MemoryFastStore::new());
        let coord = coordinator(primary, fast.clone());

        let cancel = CancelToken::new();
        cancel.cancel(); // 第一批之前就取消
        let stats = coord
            .rebuild(opts(RebuildMode::Full), &cancel)
            .await
            .unwrap();

        assert!(stats.truncated);
        assert_eq!(stats.rebuilt_collections, 0);
        // 截断的运行不推进 watermark。
        assert!(fast.get(keys::WATERMARK_KEY).unwrap().is_none());
    }

    #[tokio::test]
    async fn unavailable_fast_store_fails_rebuild_outright() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        primary.upsert(rec("a", 1));
        let fast = Arc::new(MemoryFastStore::new());
        fast.set_available(false);
        let coord = coordinator(primary, fast);

        let err = coord
            .rebuild(opts(RebuildMode::ChangedOnly), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::StoreUnavailable(_)));
    }
}

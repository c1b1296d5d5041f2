use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::IndexError;
use crate::index::builder::SummaryBuilder;
use crate::index::rebuild::CancelToken;
use crate::index::stats::VerifyResult;
use crate::index::{remove_ops, upsert_ops};
use crate::model::{CollectionId, SortKey};
use crate::store::fast::FastStore;
use crate::store::keys;
use crate::store::primary::PrimaryStore;

/// primary vs 索引的三路 diff。
#[derive(Clone, Debug, Default)]
pub struct IndexDiff {
    pub primary_count: u64,
    pub index_count: u64,
    /// primary 有、索引没有。
    pub to_add: Vec<CollectionId>,
    /// 两边都有，但 primary 的 updatedAt 更新（漂移）。
    pub to_update: Vec<CollectionId>,
    /// 索引有、primary 没有。
    pub to_remove: Vec<CollectionId>,
}

impl IndexDiff {
    pub fn is_consistent(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_remove.is_empty()
    }
}

/// 两边各流一遍 (id, updatedAt 毫秒) 做集合差。
/// 索引侧的时间戳直接取 updated 排序结构的 score，零 summary 读取。
pub(crate) fn compute_diff<P: PrimaryStore, F: FastStore>(
    primary: &P,
    fast: &F,
) -> Result<IndexDiff, IndexError> {
    let primary_stamps: HashMap<CollectionId, u64> = primary.stamps()?.into_iter().collect();
    let index_stamps: HashMap<CollectionId, u64> = fast
        .sorted_set_scores(&keys::ordering_key(SortKey::Updated))?
        .into_iter()
        .collect();

    let mut diff = IndexDiff {
        primary_count: primary_stamps.len() as u64,
        index_count: index_stamps.len() as u64,
        ..Default::default()
    };

    for (id, p_ms) in &primary_stamps {
        match index_stamps.get(id) {
            None => diff.to_add.push(id.clone()),
            Some(i_ms) if p_ms > i_ms => diff.to_update.push(id.clone()),
            Some(_) => {}
        }
    }
    for id in index_stamps.keys() {
        if !primary_stamps.contains_key(id) {
            diff.to_remove.push(id.clone());
        }
    }

    // 确定性输出（测试与报表友好）。
    diff.to_add.sort();
    diff.to_update.sort();
    diff.to_remove.sort();
    Ok(diff)
}

/// 一致性校验器：diff 报告 + 可选修复。
///
/// 漂移是这个规模下的稳态现象，所以结果永远是"报告"而不是错误。
pub struct ConsistencyVerifier<P, F> {
    primary: Arc<P>,
    fast: Arc<F>,
    builder: Arc<SummaryBuilder>,
}

impl<P: PrimaryStore, F: FastStore> ConsistencyVerifier<P, F> {
    pub fn new(primary: Arc<P>, fast: Arc<F>, builder: Arc<SummaryBuilder>) -> Self {
        Self {
            primary,
            fast,
            builder,
        }
    }

    pub fn diff(&self) -> Result<IndexDiff, IndexError> {
        compute_diff(self.primary.as_ref(), self.fast.as_ref())
    }

    /// dry_run=false 时就地修复：add/update 走 builder + upsert pipeline，
    /// remove 用单个 pipeline 同时删 summary 和剪 ordering（不留孤儿）。
    pub async fn verify(
        &self,
        dry_run: bool,
        cancel: &CancelToken,
    ) -> Result<VerifyResult, IndexError> {
        let started = Instant::now();
        let diff = self.diff()?;

        tracing::info!(
            add = diff.to_add.len(),
            update = diff.to_update.len(),
            remove = diff.to_remove.len(),
            dry_run,
            "index verify diff computed"
        );

        if !dry_run {
            let mut fix_ids: Vec<CollectionId> =
                Vec::with_capacity(diff.to_add.len() + diff.to_update.len());
            fix_ids.extend(diff.to_add.iter().cloned());
            fix_ids.extend(diff.to_update.iter().cloned());

            for rec in self.primary.fetch_many(&fix_ids)? {
                if cancel.is_cancelled() {
                    tracing::warn!("verify repair cancelled, remaining drift left for next run");
                    break;
                }
                match self.builder.build(&rec, false) {
                    Ok(summary) => self.fast.pipeline(upsert_ops(&summary))?,
                    Err(e) => {
                        // 修不了的条目留给下一轮：verify 自身不失败。
                        tracing::warn!(collection = %rec.id, "verify repair build failed: {e}");
                    }
                }
            }

            for id in &diff.to_remove {
                if cancel.is_cancelled() {
                    break;
                }
                self.fast.pipeline(remove_ops(id))?;
            }
        }

        Ok(VerifyResult {
            primary_count: diff.primary_count,
            index_count: diff.index_count,
            is_consistent: diff.is_consistent(),
            to_add: diff.to_add,
            to_update: diff.to_update,
            to_remove: diff.to_remove,
            dry_run,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CollectionKind, CollectionRecord, IndexSummary, ThumbnailInfo};
    use crate::store::memory::MemoryFastStore;
    use crate::store::primary::MemoryPrimaryStore;
    use chrono::{TimeZone, Utc};

    fn rec(id: &str, updated_ms: i64) -> CollectionRecord {
        CollectionRecord {
            id: id.to_string(),
            name: id.to_string(),
            path: format!("/library/{id}").into(),
            kind: CollectionKind::Archive,
            image_count: 1,
            thumbnail_count: 0,
            cache_image_count: 0,
            total_size_bytes: 64,
            created_at: Utc.timestamp_millis_opt(0).unwrap(),
            updated_at: Utc.timestamp_millis_opt(updated_ms).unwrap(),
            first_image_id: None,
            thumbnail: ThumbnailInfo::default(),
        }
    }

    /// 直接向 fast store 注入一条索引条目（绕过 coordinator）。
    fn seed_index(fast: &MemoryFastStore, rec: &CollectionRecord) {
        let summary = IndexSummary::project(rec);
        fast.pipeline(upsert_ops(&summary)).unwrap();
    }

    fn verifier(
        primary: Arc<MemoryPrimaryStore>,
        fast: Arc<MemoryFastStore>,
    ) -> ConsistencyVerifier<MemoryPrimaryStore, MemoryFastStore> {
        ConsistencyVerifier::new(primary, fast, Arc::new(SummaryBuilder::new(256, 64 * 1024)))
    }

    #[tokio::test]
    async fn diff_reports_add_update_remove() {
        // primary {A,B,C}，索引 {A(stale), D} → add={B,C} update={A} remove={D}
        let primary = Arc::new(MemoryPrimaryStore::new());
        primary.upsert(rec("A", 2_000));
        primary.upsert(rec("B", 1_000));
        primary.upsert(rec("C", 1_000));

        let fast = Arc::new(MemoryFastStore::new());
        seed_index(&fast, &rec("A", 1_000)); // 旧时间戳
        seed_index(&fast, &rec("D", 1_000)); // primary 已删

        let v = verifier(primary, fast);
        let result = v.verify(true, &CancelToken::new()).await.unwrap();

        assert_eq!(result.to_add, vec!["B".to_string(), "C".to_string()]);
        assert_eq!(result.to_update, vec!["A".to_string()]);
        assert_eq!(result.to_remove, vec!["D".to_string()]);
        assert!(!result.is_consistent);
        assert_eq!(result.primary_count, 3);
        assert_eq!(result.index_count, 2);
    }

    #[tokio::test]
    async fn repair_then_reverify_is_idempotent() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        primary.upsert(rec("A", 2_000));
        primary.upsert(rec("B", 1_000));

        let fast = Arc::new(MemoryFastStore::new());
        seed_index(&fast, &rec("A", 1_000));
        seed_index(&fast, &rec("gone", 500));

        let v = verifier(primary, fast.clone());
        let first = v.verify(false, &CancelToken::new()).await.unwrap();
        assert!(!first.is_consistent);

        // 第二轮：无中间变更，必须全零且一致。
        let second = v.verify(false, &CancelToken::new()).await.unwrap();
        assert!(second.is_consistent);
        assert!(second.to_add.is_empty());
        assert!(second.to_update.is_empty());
        assert!(second.to_remove.is_empty());
    }

    #[tokio::test]
    async fn remove_leaves_no_orphans_in_any_ordering() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        let fast = Arc::new(MemoryFastStore::new());
        seed_index(&fast, &rec("zombie", 1_000));

        let v = verifier(primary, fast.clone());
        v.verify(false, &CancelToken::new()).await.unwrap();

        assert!(fast.get(&keys::summary_key("zombie")).unwrap().is_none());
        for key in SortKey::ALL {
            assert_eq!(
                fast.sorted_set_card(&keys::ordering_key(key)).unwrap(),
                0,
                "{:?}",
                key
            );
        }
    }

    #[tokio::test]
    async fn dry_run_repairs_nothing() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        primary.upsert(rec("A", 1_000));
        let fast = Arc::new(MemoryFastStore::new());

        let v = verifier(primary, fast.clone());
        let result = v.verify(true, &CancelToken::new()).await.unwrap();
        assert_eq!(result.to_add, vec!["A".to_string()]);
        assert!(fast.get(&keys::summary_key("A")).unwrap().is_none());
    }

    #[tokio::test]
    async fn sub_millisecond_equal_stamps_are_not_drift() {
        let primary = Arc::new(MemoryPrimaryStore::new());
        primary.upsert(rec("A", 1_000));
        let fast = Arc::new(MemoryFastStore::new());
        seed_index(&fast, &rec("A", 1_000));

        let v = verifier(primary, fast);
        let result = v.verify(true, &CancelToken::new()).await.unwrap();
        assert!(result.is_consistent);
    }
}

use std::cmp::Reverse;
use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;

use crate::model::{CollectionId, CollectionRecord, SortDirection, SortKey};

#[derive(Debug, Error)]
pub enum PrimaryError {
    #[error("primary store query failed: {0}")]
    Query(String),
}

/// 权威存储的抽象面：持久、可查询的文档库。引擎只读。
///
/// 具体数据库产品不在约束范围内；这里定义引擎需要的最小查询集。
pub trait PrimaryStore: Send + Sync + 'static {
    fn count(&self) -> Result<u64, PrimaryError>;

    fn get(&self, id: &str) -> Result<Option<CollectionRecord>, PrimaryError>;

    /// 全量 (id, updatedAt 毫秒) 流，verify 的 diff 输入。
    fn stamps(&self) -> Result<Vec<(CollectionId, u64)>, PrimaryError>;

    fn fetch_all(&self) -> Result<Vec<CollectionRecord>, PrimaryError>;

    fn fetch_many(&self, ids: &[CollectionId]) -> Result<Vec<CollectionRecord>, PrimaryError>;

    /// updatedAt 严格大于 watermark 的集合（ChangedOnly 的选择集）。
    fn fetch_changed_since(&self, watermark_millis: u64)
        -> Result<Vec<CollectionRecord>, PrimaryError>;

    /// 慢速兜底分页：语义与索引路径一致（同排序键、同方向、同分段）。
    fn fetch_page(
        &self,
        page: u64,
        page_size: u64,
        sort: SortKey,
        dir: SortDirection,
    ) -> Result<(Vec<CollectionRecord>, u64), PrimaryError>;
}

/// 进程内参考实现：测试与演示二进制使用。
#[derive(Default)]
pub struct MemoryPrimaryStore {
    records: RwLock<HashMap<CollectionId, CollectionRecord>>,
}

impl MemoryPrimaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, rec: CollectionRecord) {
        self.records.write().insert(rec.id.clone(), rec);
    }

    pub fn remove(&self, id: &str) -> Option<CollectionRecord> {
        self.records.write().remove(id)
    }

    /// 推进 updatedAt（模拟外部 CRUD 层的修改）。
    pub fn touch(&self, id: &str, at: chrono::DateTime<chrono::Utc>) {
        if let Some(r) = self.records.write().get_mut(id) {
            r.updated_at = at;
        }
    }
}

impl PrimaryStore for MemoryPrimaryStore {
    fn count(&self) -> Result<u64, PrimaryError> {
        Ok(self.records.read().len() as u64)
    }

    fn get(&self, id: &str) -> Result<Option<CollectionRecord>, PrimaryError> {
        Ok(self.records.read().get(id).cloned())
    }

    fn stamps(&self) -> Result<Vec<(CollectionId, u64)>, PrimaryError> {
        Ok(self
            .records
            .read()
            .values()
            .map(|r| (r.id.clone(), r.updated_at.timestamp_millis().max(0) as u64))
            .collect())
    }

    fn fetch_all(&self) -> Result<Vec<CollectionRecord>, PrimaryError> {
        Ok(self.records.read().values().cloned().collect())
    }

    fn fetch_many(&self, ids: &[CollectionId]) -> Result<Vec<CollectionRecord>, PrimaryError> {
        let g = self.records.read();
        Ok(ids.iter().filter_map(|id| g.get(id).cloned()).collect())
    }

    fn fetch_changed_since(
        &self,
        watermark_millis: u64,
    ) -> Result<Vec<CollectionRecord>, PrimaryError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.updated_at.timestamp_millis().max(0) as u64 > watermark_millis)
            .cloned()
            .collect())
    }

    fn fetch_page(
        &self,
        page: u64,
        page_size: u64,
        sort: SortKey,
        dir: SortDirection,
    ) -> Result<(Vec<CollectionRecord>, u64), PrimaryError> {
        let mut all: Vec<CollectionRecord> = self.records.read().values().cloned().collect();
        let total = all.len() as u64;
        // (score, id) 双键排序：与索引路径的有序结构顺序完全一致。
        match dir {
            SortDirection::Asc => {
                all.sort_by_key(|r| (sort.score_of_record(r), r.id.clone()))
            }
            SortDirection::Desc => {
                all.sort_by_key(|r| (Reverse(sort.score_of_record(r)), Reverse(r.id.clone())))
            }
        }
        let start = (page - 1).saturating_mul(page_size) as usize;
        let items = all.into_iter().skip(start).take(page_size as usize).collect();
        Ok((items, total))
    }
}

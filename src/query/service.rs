use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;

use crate::error::IndexError;
use crate::index::stats::IndexStats;
use crate::index::{read_schema_version, read_watermark};
use crate::model::{IndexSummary, PageResult, SortDirection, SortKey};
use crate::store::fast::FastStore;
use crate::store::keys;
use crate::store::primary::PrimaryStore;

/// 单页上限：防御性限幅，不是业务参数。
const MAX_PAGE_SIZE: u64 = 500;

/// 读路径服务：索引命中时 O(1) 分页/随机采样，索引无效或 fast store
/// 不可达时回退 primary store 兜底（同样的分页语义，更高延迟，绝不报错）。
pub struct QueryService<P, F> {
    primary: Arc<P>,
    fast: Arc<F>,
}

impl<P: PrimaryStore, F: FastStore> QueryService<P, F> {
    pub fn new(primary: Arc<P>, fast: Arc<F>) -> Self {
        Self { primary, fast }
    }

    /// 廉价有效性判定：schema 版本匹配 + 两边基数相等。不做全量 verify。
    pub fn is_index_valid(&self) -> bool {
        let Ok(Some(schema)) = read_schema_version(self.fast.as_ref()) else {
            return false;
        };
        if schema != keys::SCHEMA_VERSION {
            return false;
        }
        let Ok(card) = self
            .fast
            .sorted_set_card(&keys::ordering_key(SortKey::Updated))
        else {
            return false;
        };
        match self.primary.count() {
            Ok(n) => n == card,
            Err(_) => false,
        }
    }

    pub fn get_page(
        &self,
        page: u64,
        page_size: u64,
        sort_by: &str,
        direction: &str,
    ) -> Result<PageResult, IndexError> {
        let sort = SortKey::parse(sort_by)?;
        let dir = SortDirection::parse(direction)?;
        if page < 1 || page_size < 1 || page_size > MAX_PAGE_SIZE {
            return Err(IndexError::InvalidPage { page, page_size });
        }

        if self.is_index_valid() {
            match self.page_from_index(page, page_size, sort, dir) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    // 判定和读取之间 store 挂了：继续走兜底，不让调用方看到错误。
                    tracing::warn!("index read failed mid-request, falling back: {e}");
                }
            }
        } else {
            tracing::debug!("index invalid, serving page from primary store");
        }

        self.page_from_primary(page, page_size, sort, dir)
    }

    fn page_from_index(
        &self,
        page: u64,
        page_size: u64,
        sort: SortKey,
        dir: SortDirection,
    ) -> Result<PageResult, IndexError> {
        let set = keys::ordering_key(sort);
        let total = self.fast.sorted_set_card(&set)?;
        // page 是调用方给的任意 u64：饱和运算，越界页得到空页而不是回绕。
        let start = (page - 1).saturating_mul(page_size);
        let descending = dir == SortDirection::Desc;
        let members = self.fast.sorted_set_range(&set, start, page_size, descending)?;

        let mut items = Vec::with_capacity(members.len());
        for id in &members {
            match self.fast.get(&keys::summary_key(id))? {
                Some(bytes) => match serde_json::from_slice::<IndexSummary>(&bytes) {
                    Ok(s) => items.push(s),
                    Err(e) => tracing::warn!(collection = %id, "corrupt summary skipped: {e}"),
                },
                // 与并发 remove 竞态：跳过即可，下一次 verify 会收敛。
                None => tracing::debug!(collection = %id, "summary missing for ordered member"),
            }
        }

        Ok(PageResult {
            has_next: page.saturating_mul(page_size) < total,
            has_prev: page > 1,
            items,
            total,
            page,
            page_size,
            degraded: false,
        })
    }

    fn page_from_primary(
        &self,
        page: u64,
        page_size: u64,
        sort: SortKey,
        dir: SortDirection,
    ) -> Result<PageResult, IndexError> {
        let (records, total) = self.primary.fetch_page(page, page_size, sort, dir)?;
        Ok(PageResult {
            items: records.iter().map(IndexSummary::project).collect(),
            has_next: page.saturating_mul(page_size) < total,
            has_prev: page > 1,
            total,
            page,
            page_size,
            degraded: true,
        })
    }

    /// O(1) 随机采样：总数 → 均匀 rank → 单条 range 读。不扫描。
    pub fn get_random(&self) -> Result<Option<IndexSummary>, IndexError> {
        if self.is_index_valid() {
            match self.random_from_index() {
                Ok(r) => return Ok(r),
                Err(e) => tracing::warn!("random read failed mid-request, falling back: {e}"),
            }
        }

        // 兜底：同样的均匀 rank，单条分页读 primary。
        let total = self.primary.count()?;
        if total == 0 {
            return Ok(None);
        }
        let rank = rand::thread_rng().gen_range(0..total);
        let (records, _) =
            self.primary
                .fetch_page(rank + 1, 1, SortKey::Updated, SortDirection::Asc)?;
        Ok(records.first().map(IndexSummary::project))
    }

    fn random_from_index(&self) -> Result<Option<IndexSummary>, IndexError> {
        let set = keys::ordering_key(SortKey::Updated);
        let total = self.fast.sorted_set_card(&set)?;
        if total == 0 {
            return Ok(None);
        }
        let rank = rand::thread_rng().gen_range(0..total);
        let members = self.fast.sorted_set_range(&set, rank, 1, false)?;
        let Some(id) = members.first() else {
            return Ok(None);
        };
        let Some(bytes) = self.fast.get(&keys::summary_key(id))? else {
            return Ok(None);
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }

    /// GetIndexStats：fast store 宕机时也要能答（is_valid=false + primary 总数）。
    pub fn index_stats(&self) -> Result<IndexStats, IndexError> {
        let schema_version = read_schema_version(self.fast.as_ref()).unwrap_or(None);
        let last_rebuild_time: Option<DateTime<Utc>> = read_watermark(self.fast.as_ref())
            .unwrap_or(None)
            .and_then(|ms| Utc.timestamp_millis_opt(ms as i64).single());
        let is_valid = self.is_index_valid();

        let total = if is_valid {
            self.fast
                .sorted_set_card(&keys::ordering_key(SortKey::Updated))
                .unwrap_or(0)
        } else {
            self.primary.count()?
        };

        Ok(IndexStats {
            total_collections: total,
            last_rebuild_time,
            is_valid,
            needs_force_rebuild: matches!(schema_version, Some(v) if v < keys::SCHEMA_VERSION),
            schema_version,
        })
    }
}

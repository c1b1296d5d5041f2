use thiserror::Error;

use crate::store::fast::StoreError;
use crate::store::primary::PrimaryError;

/// 引擎层错误分类。
///
/// 只有 read 路径上的 `StoreUnavailable` 与非法入参会作为硬错误抛给调用方；
/// 其余状况（单条构建失败、缓存目录满、索引漂移）都降级处理，不在此枚举中。
#[derive(Debug, Error)]
pub enum IndexError {
    /// fast store 不可达。read 路径回退 primary store；rebuild/verify 直接失败。
    #[error("fast store unavailable: {0}")]
    StoreUnavailable(String),

    /// 单写者门拒绝：已有 rebuild 在跑。调用方稍后重试即可，不是应用错误。
    #[error("a rebuild is already in progress")]
    RebuildInProgress,

    #[error("invalid page parameters: page={page} page_size={page_size}")]
    InvalidPage { page: u64, page_size: u64 },

    #[error("unknown sort key: {0:?}")]
    InvalidSortKey(String),

    #[error("unknown sort direction: {0:?}")]
    InvalidSortDirection(String),

    #[error("primary store error: {0}")]
    Primary(String),
}

impl From<StoreError> for IndexError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => IndexError::StoreUnavailable(msg),
        }
    }
}

impl From<PrimaryError> for IndexError {
    fn from(e: PrimaryError) -> Self {
        IndexError::Primary(e.to_string())
    }
}

pub mod builder;
pub mod engine;
pub mod rebuild;
pub mod stats;
pub mod verify;

pub use builder::{BuildError, SummaryBuilder};
pub use engine::IndexEngine;
pub use rebuild::{CancelToken, RebuildCoordinator, RebuildHandle, RebuildMode, RebuildOptions};
pub use stats::{IndexStats, RebuildProgress, RebuildStats, VerifyResult};
pub use verify::ConsistencyVerifier;

use crate::model::{IndexSummary, SortKey};
use crate::store::fast::{FastOp, FastStore, StoreError};
use crate::store::keys;

/// 一条 summary 的完整 upsert：哈希记录 + 每个排序结构各一条 ZAdd。
/// 单个 pipeline 应用，保证 summary 与 ordering 不会只写了一半。
pub(crate) fn upsert_ops(summary: &IndexSummary) -> Vec<FastOp> {
    // IndexSummary 是纯数据结构（无非字符串键 map），序列化不会失败。
    let value = serde_json::to_vec(summary).expect("IndexSummary serializes");
    let mut ops = Vec::with_capacity(1 + SortKey::ALL.len());
    ops.push(FastOp::Set {
        key: keys::summary_key(&summary.id),
        value,
    });
    for key in SortKey::ALL {
        ops.push(FastOp::ZAdd {
            set: keys::ordering_key(key),
            member: summary.id.clone(),
            score: key.score(summary),
        });
    }
    ops
}

/// 对称的移除：删 summary + 从每个排序结构剪除，同一 pipeline。
/// 保证不会出现"summary 已删但 ordering 还挂着"的孤儿（反向亦然）。
pub(crate) fn remove_ops(id: &str) -> Vec<FastOp> {
    let mut ops = Vec::with_capacity(1 + SortKey::ALL.len());
    ops.push(FastOp::Delete {
        key: keys::summary_key(id),
    });
    for key in SortKey::ALL {
        ops.push(FastOp::ZRem {
            set: keys::ordering_key(key),
            member: id.to_string(),
        });
    }
    ops
}

pub(crate) fn read_watermark<F: FastStore>(fast: &F) -> Result<Option<u64>, StoreError> {
    Ok(fast
        .get(keys::WATERMARK_KEY)?
        .and_then(|b| String::from_utf8(b).ok())
        .and_then(|s| s.trim().parse().ok()))
}

pub(crate) fn read_schema_version<F: FastStore>(fast: &F) -> Result<Option<u32>, StoreError> {
    Ok(fast
        .get(keys::SCHEMA_KEY)?
        .and_then(|b| String::from_utf8(b).ok())
        .and_then(|s| s.trim().parse().ok()))
}

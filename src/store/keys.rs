//! fast store 的键布局。
//!
//! - `col:sum:{id}`    每个集合一条 JSON IndexSummary
//! - `col:ord:{key}`   每个排序键一个有序结构，member=id, score=键值
//! - `col:meta:*`      watermark / schema 标量

use crate::model::SortKey;

/// IndexSummary 的形状版本。每次改字段布局就 +1，
/// 读到旧版本号的实例会被标记为 needs_force_rebuild。
pub const SCHEMA_VERSION: u32 = 3;

pub const WATERMARK_KEY: &str = "col:meta:watermark";
pub const SCHEMA_KEY: &str = "col:meta:schema";

pub fn summary_key(id: &str) -> String {
    format!("col:sum:{id}")
}

pub fn ordering_key(sort: SortKey) -> String {
    format!("col:ord:{}", sort.as_str())
}

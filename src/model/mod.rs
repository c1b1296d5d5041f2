use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::IndexError;

pub type CollectionId = String;

/// 集合类型：目录 或 压缩包。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Folder,
    Archive,
}

/// 首图缩略图的持久化元数据（primary store 内嵌字段）。
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ThumbnailInfo {
    pub generated: bool,
    pub valid: bool,
    pub path: Option<PathBuf>,
    pub format: Option<String>,
}

/// primary store 中的权威集合实体。本引擎只读，不写。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub id: CollectionId,
    pub name: String,
    pub path: PathBuf,
    pub kind: CollectionKind,
    pub image_count: u32,
    pub thumbnail_count: u32,
    pub cache_image_count: u32,
    pub total_size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub first_image_id: Option<String>,
    pub thumbnail: ThumbnailInfo,
}

/// fast store 中的反规范化投影：列表视图所需的全部字段，零额外往返。
///
/// `thumbnail_base64` 为预编码负载；为空时消费端回退按需缩略图端点
/// （`first_image_thumbnail_url`）。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexSummary {
    pub id: CollectionId,
    pub name: String,
    pub path: String,
    pub kind: CollectionKind,
    pub image_count: u32,
    pub thumbnail_count: u32,
    pub cache_image_count: u32,
    pub total_size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub first_image_id: Option<String>,
    pub first_image_thumbnail_url: Option<String>,
    pub thumbnail_base64: Option<String>,
}

impl IndexSummary {
    /// 纯投影：不含缩略图嵌入（那是 SummaryBuilder 的副作用部分）。
    /// fallback 读路径也用它把 primary 记录直接映射成响应形状。
    pub fn project(rec: &CollectionRecord) -> Self {
        Self {
            id: rec.id.clone(),
            name: rec.name.clone(),
            path: rec.path.to_string_lossy().into_owned(),
            kind: rec.kind,
            image_count: rec.image_count,
            thumbnail_count: rec.thumbnail_count,
            cache_image_count: rec.cache_image_count,
            total_size_bytes: rec.total_size_bytes,
            created_at: rec.created_at,
            updated_at: rec.updated_at,
            first_image_id: rec.first_image_id.clone(),
            first_image_thumbnail_url: rec
                .first_image_id
                .as_ref()
                .map(|img| format!("/collections/{}/images/{}/thumbnail", rec.id, img)),
            thumbnail_base64: None,
        }
    }

    pub fn updated_millis(&self) -> u64 {
        self.updated_at.timestamp_millis().max(0) as u64
    }
}

/// 支持的排序键。每个键对应 fast store 中一个独立的有序结构。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Updated,
    Created,
    Name,
    Size,
    Images,
}

impl SortKey {
    pub const ALL: [SortKey; 5] = [
        SortKey::Updated,
        SortKey::Created,
        SortKey::Name,
        SortKey::Size,
        SortKey::Images,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Updated => "updated",
            SortKey::Created => "created",
            SortKey::Name => "name",
            SortKey::Size => "size",
            SortKey::Images => "images",
        }
    }

    pub fn parse(s: &str) -> Result<Self, IndexError> {
        match s {
            "updated" | "updated_at" => Ok(SortKey::Updated),
            "created" | "created_at" => Ok(SortKey::Created),
            "name" => Ok(SortKey::Name),
            "size" => Ok(SortKey::Size),
            "images" | "image_count" => Ok(SortKey::Images),
            other => Err(IndexError::InvalidSortKey(other.to_string())),
        }
    }

    /// 有序结构的 score。时间键用 epoch 毫秒，name 用保序的 8 字节前缀整数。
    pub fn score(self, s: &IndexSummary) -> u64 {
        match self {
            SortKey::Updated => s.updated_millis(),
            SortKey::Created => s.created_at.timestamp_millis().max(0) as u64,
            SortKey::Name => name_score(&s.name),
            SortKey::Size => s.total_size_bytes,
            SortKey::Images => s.image_count as u64,
        }
    }

    /// primary 记录版本（fallback 排序用，必须与 score() 同序）。
    pub fn score_of_record(self, r: &CollectionRecord) -> u64 {
        match self {
            SortKey::Updated => r.updated_at.timestamp_millis().max(0) as u64,
            SortKey::Created => r.created_at.timestamp_millis().max(0) as u64,
            SortKey::Name => name_score(&r.name),
            SortKey::Size => r.total_size_bytes,
            SortKey::Images => r.image_count as u64,
        }
    }
}

/// 小写后取前 8 字节，big-endian 拼成 u64：前缀保序，精确 collation 不是目标。
/// 同分（同前缀）的成员在有序结构内按 id 稳定排序。
fn name_score(name: &str) -> u64 {
    let mut buf = [0u8; 8];
    for (i, b) in name.to_lowercase().bytes().take(8).enumerate() {
        buf[i] = b;
    }
    u64::from_be_bytes(buf)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn parse(s: &str) -> Result<Self, IndexError> {
        match s {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(IndexError::InvalidSortDirection(other.to_string())),
        }
    }
}

/// 分页结果。`degraded=true` 表示本次由 primary store 兜底（索引无效或不可达），
/// 数据正确但无内联缩略图、延迟更高。
#[derive(Clone, Debug, Serialize)]
pub struct PageResult {
    pub items: Vec<IndexSummary>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub has_next: bool,
    pub has_prev: bool,
    pub degraded: bool,
}

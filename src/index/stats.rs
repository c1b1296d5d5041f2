use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::index::rebuild::RebuildMode;
use crate::model::CollectionId;

/// 一次 rebuild 运行的结果记录。只在内存里活到被调用方消费，不落盘。
#[derive(Clone, Debug, Serialize)]
pub struct RebuildStats {
    pub mode: RebuildMode,
    pub dry_run: bool,
    /// 被取消的运行：统计截断，不报错。索引保持可用（可能偏旧）。
    pub truncated: bool,
    pub duration_ms: u64,
    pub total_collections: u64,
    pub rebuilt_collections: u64,
    pub skipped_collections: u64,
    /// 单条构建失败的样本（截断到少量条目，完整失败不进错误日志以外的地方）。
    pub error_samples: Vec<String>,
    /// 运行期间观测到的进程 RSS 峰值。
    pub peak_rss_bytes: u64,
    pub finished_at: DateTime<Utc>,
}

impl fmt::Display for RebuildStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rebuild mode={:?} dry_run={} truncated={} total={} rebuilt={} skipped={} in {}ms (peak rss {})",
            self.mode,
            self.dry_run,
            self.truncated,
            self.total_collections,
            self.rebuilt_collections,
            self.skipped_collections,
            self.duration_ms,
            human_bytes(self.peak_rss_bytes),
        )
    }
}

/// verify 的 diff 报告。漂移是稳态会出现的正常情况：报告，不抛错。
#[derive(Clone, Debug, Serialize)]
pub struct VerifyResult {
    pub primary_count: u64,
    pub index_count: u64,
    pub to_add: Vec<CollectionId>,
    pub to_update: Vec<CollectionId>,
    pub to_remove: Vec<CollectionId>,
    pub is_consistent: bool,
    pub dry_run: bool,
    pub duration_ms: u64,
}

/// GetIndexStats 的快照。
#[derive(Clone, Debug, Serialize)]
pub struct IndexStats {
    pub total_collections: u64,
    pub last_rebuild_time: Option<DateTime<Utc>>,
    pub is_valid: bool,
    pub schema_version: Option<u32>,
    /// schema 落后于当前版本：应触发 ForceRebuildAll 而不是继续服务半旧记录。
    pub needs_force_rebuild: bool,
}

/// rebuild 进度（watch channel 推送，供调用层轮询/展示）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum RebuildProgress {
    Idle,
    Running { processed: u64, total: u64 },
    Finished { rebuilt: u64, skipped: u64 },
}

/// 从 /proc/self/statm 读取进程 RSS。
pub fn read_process_rss() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|s| {
            // statm 格式: size resident shared text lib data dt (单位: 页)
            let parts: Vec<&str> = s.split_whitespace().collect();
            parts.get(1)?.parse::<u64>().ok()
        })
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

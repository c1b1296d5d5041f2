use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use sysinfo::Disks;

use crate::config::CacheFolderConfig;

/// 实时磁盘剩余空间探测。抽出 trait 便于测试注入固定值。
pub trait DiskProbe: Send + Sync {
    fn free_space(&self, path: &Path) -> Option<u64>;
}

/// sysinfo 实现：按挂载点最长前缀匹配取 available_space。
/// 每次调用重新刷新列表；分配不在热路径上，代价可接受。
pub struct SysDiskProbe;

impl DiskProbe for SysDiskProbe {
    fn free_space(&self, path: &Path) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

/// 缓存目录：配置 + 在线状态。
///
/// `current_size` 是磁盘占用的缓存值而非真相；分配流量原子递增，
/// `reconcile_from_disk` 定期从实际占用纠偏。
pub struct CacheFolder {
    pub name: String,
    pub root: PathBuf,
    /// 数值越大越优先。
    pub priority: i32,
    /// 0 = 不限。
    pub max_size_bytes: u64,
    current_size: AtomicU64,
    active: AtomicBool,
}

impl CacheFolder {
    pub fn new(name: &str, root: PathBuf, priority: i32, max_size_bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            root,
            priority,
            max_size_bytes,
            current_size: AtomicU64::new(0),
            active: AtomicBool::new(true),
        }
    }

    pub fn from_config(cfg: &CacheFolderConfig) -> Self {
        let f = Self::new(&cfg.name, cfg.root.clone(), cfg.priority, cfg.max_size_bytes);
        f.active.store(cfg.active, Ordering::Release);
        f
    }

    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, on: bool) {
        self.active.store(on, Ordering::Release);
    }

    fn has_room(&self, estimated: u64) -> bool {
        if self.max_size_bytes == 0 {
            return true;
        }
        // checked_add：巨大的预估值不得回绕后混进容量过滤。
        self.current_size()
            .checked_add(estimated)
            .map_or(false, |sum| sum <= self.max_size_bytes)
    }

    /// 逻辑剩余空间（max - current）；不限时按 u64::MAX。
    fn logical_free(&self) -> u64 {
        if self.max_size_bytes == 0 {
            u64::MAX
        } else {
            self.max_size_bytes.saturating_sub(self.current_size())
        }
    }
}

/// 一次成功的目录选择：拿着它写完文件后 commit 实际字节数。
pub struct CachePlacement {
    pub folder: Arc<CacheFolder>,
    pub path: PathBuf,
}

impl CachePlacement {
    /// 写入成功后登记占用。fetch_add 原子性：并发写同目录不丢计数。
    pub fn commit(&self, written_bytes: u64) {
        self.folder
            .current_size
            .fetch_add(written_bytes, Ordering::AcqRel);
    }
}

/// 缓存目录分配器。
///
/// 选择算法：active 过滤 → 容量过滤（max!=0 且 current+est>max 出局）→
/// 最高 priority → 同 priority 按实时磁盘剩余空间（探测不到时退回逻辑剩余）。
/// 没有候选即 NoFolderAvailable：调用方跳过缓存，绝不让请求失败。
pub struct CacheFolderAllocator {
    folders: Vec<Arc<CacheFolder>>,
    probe: Box<dyn DiskProbe>,
}

impl CacheFolderAllocator {
    pub fn new(folders: Vec<Arc<CacheFolder>>) -> Self {
        Self::with_probe(folders, Box::new(SysDiskProbe))
    }

    pub fn with_probe(folders: Vec<Arc<CacheFolder>>, probe: Box<dyn DiskProbe>) -> Self {
        Self { folders, probe }
    }

    pub fn folders(&self) -> &[Arc<CacheFolder>] {
        &self.folders
    }

    pub fn select_folder(&self, estimated_bytes: u64) -> Option<Arc<CacheFolder>> {
        let mut best: Option<(&Arc<CacheFolder>, u64)> = None;
        for f in &self.folders {
            if !f.is_active() || !f.has_room(estimated_bytes) {
                continue;
            }
            // 并列判定用的空闲值：优先实盘探测，避免外部落盘文件造成的计数偏差。
            let free = self.probe.free_space(&f.root).unwrap_or_else(|| f.logical_free());
            let better = match &best {
                None => true,
                Some((cur, cur_free)) => {
                    f.priority > cur.priority || (f.priority == cur.priority && free > *cur_free)
                }
            };
            if better {
                best = Some((f, free));
            }
        }
        match best {
            Some((f, _)) => Some(f.clone()),
            None => {
                tracing::debug!(
                    estimated_bytes,
                    "no cache folder has capacity, caching will be skipped"
                );
                None
            }
        }
    }

    /// 为一个缓存工件（缩略图/重采样图）定路径。None = 跳过缓存。
    pub fn select_cache_path(
        &self,
        collection_id: &str,
        artifact_id: &str,
        width: u32,
        height: u32,
        format: &str,
        estimated_bytes: u64,
    ) -> Option<CachePlacement> {
        let folder = self.select_folder(estimated_bytes)?;
        let path = folder
            .root
            .join(collection_id)
            .join(format!("{artifact_id}_{width}x{height}.{format}"));
        Some(CachePlacement { folder, path })
    }

    /// 带外纠偏：从磁盘实际占用重算每个目录的 current_size。
    /// 计数器只是磁盘状态的缓存，定期以真相覆盖。
    pub fn reconcile_from_disk(&self) {
        for f in &self.folders {
            let actual = disk_usage(&f.root);
            let before = f.current_size.swap(actual, Ordering::AcqRel);
            if before != actual {
                tracing::info!(
                    folder = %f.name,
                    before,
                    actual,
                    "cache folder size reconciled from disk"
                );
            }
        }
    }
}

/// 非递归栈式遍历求目录占用。不可读的子树保守跳过。
fn disk_usage(root: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let rd = match std::fs::read_dir(&dir) {
            Ok(rd) => rd,
            Err(_) => continue,
        };
        for ent in rd.flatten() {
            let Ok(md) = ent.metadata() else { continue };
            if md.is_dir() {
                stack.push(ent.path());
            } else {
                total += md.len();
            }
        }
    }
    total
}

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 服务配置（TOML）。文件缺省时全部走默认值。
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub http_port: u16,
    pub rebuild: RebuildConfig,
    /// `[[cache_folder]]` 表：缓存工件的候选落盘目录。
    #[serde(rename = "cache_folder")]
    pub cache_folders: Vec<CacheFolderConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            http_port: 6080,
            rebuild: RebuildConfig::default(),
            cache_folders: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    /// 构建 worker 数；0 = 按 CPU 核数。并行度是调优项，不是正确性要求。
    pub workers: usize,
    /// 内联缩略图的最长边上限（超出则重编码）。
    pub thumbnail_edge: u32,
    /// 内联负载的字节上限；小于该值的缩略图原样嵌入，不重编码。
    pub max_embed_bytes: usize,
    /// 一个并行构建批次的集合数。
    pub batch_size: usize,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            thumbnail_edge: 256,
            max_embed_bytes: 64 * 1024,
            batch_size: 64,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheFolderConfig {
    pub name: String,
    pub root: PathBuf,
    #[serde(default)]
    pub priority: i32,
    /// 0 = 不限。
    #[serde(default)]
    pub max_size_bytes: u64,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl ServiceConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::warn!("config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let cfg: ServiceConfig = toml::from_str(&text)?;
        Ok(cfg)
    }

    pub fn effective_workers(&self) -> usize {
        if self.rebuild.workers == 0 {
            num_cpus::get()
        } else {
            self.rebuild.workers
        }
    }
}

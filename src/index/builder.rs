use std::io::Cursor;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;

use crate::config::RebuildConfig;
use crate::model::{CollectionRecord, IndexSummary};

/// 单条构建失败：记入本轮错误列表并跳过该集合，绝不中止整批。
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("thumbnail read failed for {path:?}: {source}")]
    ThumbnailRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("thumbnail decode failed for {path:?}: {source}")]
    ThumbnailDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("thumbnail encode failed: {0}")]
    ThumbnailEncode(image::ImageError),
}

/// 集合实体 → 反规范化索引记录。
///
/// 除缩略图嵌入外是纯投影。嵌入是 rebuild 的主要成本（约四成墙钟时间），
/// 所以 `skip_thumbnail_caching` 是独立的 rebuild 选项。
pub struct SummaryBuilder {
    /// 内联缩略图的最长边上限。
    max_edge: u32,
    /// 小于该值的文件原样嵌入，省一次解码。
    max_embed_bytes: usize,
}

impl SummaryBuilder {
    pub fn new(max_edge: u32, max_embed_bytes: usize) -> Self {
        Self {
            max_edge,
            max_embed_bytes,
        }
    }

    pub fn from_config(cfg: &RebuildConfig) -> Self {
        Self::new(cfg.thumbnail_edge, cfg.max_embed_bytes)
    }

    /// skip_thumbnail=true 时只做投影；否则在缩略图"已生成且有效"时读盘嵌入。
    /// 缩略图缺失/未生成/标记无效 ⇒ 负载留空（消费端走按需端点），不是错误。
    pub fn build(
        &self,
        rec: &CollectionRecord,
        skip_thumbnail: bool,
    ) -> Result<IndexSummary, BuildError> {
        let mut summary = IndexSummary::project(rec);

        if skip_thumbnail {
            return Ok(summary);
        }
        let t = &rec.thumbnail;
        let Some(path) = t.path.as_ref().filter(|_| t.generated && t.valid) else {
            return Ok(summary);
        };

        let bytes = std::fs::read(path).map_err(|source| BuildError::ThumbnailRead {
            path: path.clone(),
            source,
        })?;

        let payload = if bytes.len() <= self.max_embed_bytes {
            bytes
        } else {
            self.reencode_bounded(&bytes, path)?
        };

        summary.thumbnail_base64 = Some(BASE64.encode(payload));
        Ok(summary)
    }

    /// 超限缩略图重编码：缩到 max_edge 内再转 JPEG。
    fn reencode_bounded(&self, bytes: &[u8], path: &PathBuf) -> Result<Vec<u8>, BuildError> {
        let img = image::load_from_memory(bytes).map_err(|source| BuildError::ThumbnailDecode {
            path: path.clone(),
            source,
        })?;
        let small = img.thumbnail(self.max_edge, self.max_edge);
        let mut out = Cursor::new(Vec::new());
        small
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .map_err(BuildError::ThumbnailEncode)?;
        Ok(out.into_inner())
    }
}

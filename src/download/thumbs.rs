use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Asset;

/// Post-download hook producing a thumbnail for a stored asset.
///
/// Implementations receive the asset, the absolute path of the downloaded
/// file and the thumbnails root, and return a path relative to that root
/// (or `None` when no thumbnail applies). The actual renderer is an
/// external tool; this crate only defines the seam.
#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    async fn generate(
        &self,
        asset: &Asset,
        source: &Path,
        thumb_root: &Path,
    ) -> Result<Option<String>>;
}

/// Default hook: no thumbnails.
pub struct NoopThumbnailer;

#[async_trait]
impl ThumbnailGenerator for NoopThumbnailer {
    async fn generate(
        &self,
        _asset: &Asset,
        _source: &Path,
        _thumb_root: &Path,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

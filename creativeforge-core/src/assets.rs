//! Uploaded asset registry with TTL expiry.

use image::ImageFormat;
use moka::future::Cache;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::model::{Asset, AssetId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("Upload is empty")]
    Empty,

    #[error("Upload of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Image could not be decoded: {0}")]
    Undecodable(String),
}

/// Formats accepted for upload.
fn mime_for(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::WebP => Some("image/webp"),
        _ => None,
    }
}

/// Sniff the format and read dimensions without decoding pixels.
pub fn probe(bytes: &[u8]) -> Result<(&'static str, u32, u32), AssetError> {
    let reader = image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| AssetError::Undecodable(e.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| AssetError::UnsupportedFormat("unrecognised".into()))?;
    let mime = mime_for(format).ok_or_else(|| AssetError::UnsupportedFormat(format!("{format:?}").to_lowercase()))?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| AssetError::Undecodable(e.to_string()))?;
    if width == 0 || height == 0 {
        return Err(AssetError::Undecodable("zero-sized image".into()));
    }
    Ok((mime, width, height))
}

#[derive(Clone)]
pub struct AssetStore {
    assets: Cache<AssetId, Arc<Asset>>,
    max_bytes: usize,
}

impl AssetStore {
    pub fn new(capacity: u64, ttl: Duration, max_bytes: usize) -> Self {
        Self {
            assets: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
            max_bytes,
        }
    }

    pub async fn register(&self, bytes: Vec<u8>) -> Result<Arc<Asset>, AssetError> {
        if bytes.is_empty() {
            return Err(AssetError::Empty);
        }
        if bytes.len() > self.max_bytes {
            return Err(AssetError::TooLarge { size: bytes.len(), max: self.max_bytes });
        }
        let (mime, width, height) = probe(&bytes)?;
        let asset = Arc::new(Asset::new(AssetId::generate(), bytes, mime, width, height));
        self.assets.insert(asset.id.clone(), asset.clone()).await;
        tracing::info!(asset_id = %asset.id, mime, width, height, "asset registered");
        Ok(asset)
    }

    pub async fn get(&self, id: &AssetId) -> Option<Arc<Asset>> {
        self.assets.get(id).await
    }

    /// Live assets, after pending expiries are applied.
    pub async fn count(&self) -> u64 {
        self.assets.run_pending_tasks().await;
        self.assets.entry_count()
    }
}

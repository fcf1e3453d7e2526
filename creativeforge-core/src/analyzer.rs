//! Asset analysis: vision detection plus local pixel statistics.
//!
//! Results are cached per asset id. Concurrent requests for an asset that
//! is not cached yet share a single in-flight analysis; the cache is only
//! written once that analysis has fully succeeded.

use chrono::Utc;
use image::{GenericImageView, RgbaImage};
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capability::{with_timeout, RawDetection, VisionCapability};
use crate::coalesce::Coalescer;
use crate::color::Color;
use crate::model::{AnalysisResult, Asset, AssetId, BoundingBox, DetectedObject, DetectionStatus, ForegroundBox};

/// Scale used when the foreground extent is unknown.
pub const DEFAULT_SUGGESTED_SCALE: f32 = 0.6;

const DOMINANT_COLORS: usize = 5;
const HISTOGRAM_SAMPLE_EDGE: u32 = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnalyzeError {
    #[error("Asset not found: {0}")]
    AssetNotFound(AssetId),

    #[error("Unsupported asset: {0}")]
    UnsupportedAsset(String),

    #[error("Analysis unavailable: {0}")]
    AnalysisUnavailable(String),
}

impl AnalyzeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AnalysisUnavailable(_))
    }
}

/// Locally computed facts about the pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelStats {
    pub dominant_colors: Vec<Color>,
    pub has_transparent_background: bool,
    pub foreground: Option<ForegroundBox>,
    pub suggested_scale: f32,
}

/// Decode and measure an image. Pure and deterministic.
pub fn pixel_stats(bytes: &[u8]) -> Result<PixelStats, AnalyzeError> {
    let image = image::load_from_memory(bytes).map_err(|e| AnalyzeError::UnsupportedAsset(e.to_string()))?;
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(AnalyzeError::UnsupportedAsset("zero-sized image".into()));
    }
    let rgba = image.to_rgba8();

    let foreground = alpha_bbox(&rgba);
    let transparent = rgba.pixels().filter(|p| p.0[3] < 128).count();
    let has_transparent_background = image.color().has_alpha() && transparent * 50 >= rgba.len() / 4;

    let suggested_scale = match foreground {
        Some(fg) if has_transparent_background => {
            let object = fg.width.min(fg.height) as f32;
            let canvas = width.min(height) as f32;
            ((0.5 * canvas / object) * 100.0).round() / 100.0
        }
        _ => DEFAULT_SUGGESTED_SCALE,
    };

    let sample = image.thumbnail(HISTOGRAM_SAMPLE_EDGE, HISTOGRAM_SAMPLE_EDGE).to_rgba8();

    Ok(PixelStats {
        dominant_colors: dominant_colors(&sample, DOMINANT_COLORS),
        has_transparent_background,
        foreground: if has_transparent_background { foreground } else { None },
        suggested_scale,
    })
}

/// Extent of pixels with any opacity.
fn alpha_bbox(rgba: &RgbaImage) -> Option<ForegroundBox> {
    let (mut x0, mut y0, mut x1, mut y1) = (u32::MAX, u32::MAX, 0u32, 0u32);
    for (x, y, p) in rgba.enumerate_pixels() {
        if p.0[3] > 0 {
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
        }
    }
    (x0 != u32::MAX).then(|| ForegroundBox { x: x0, y: y0, width: x1 - x0 + 1, height: y1 - y0 + 1 })
}

/// Most frequent colours over a 4-bit-per-channel histogram of opaque
/// pixels. Each bucket reports its mean colour.
fn dominant_colors(rgba: &RgbaImage, n: usize) -> Vec<Color> {
    let mut buckets: HashMap<u16, (u64, [u64; 3])> = HashMap::new();
    for p in rgba.pixels() {
        let [r, g, b, a] = p.0;
        if a < 128 {
            continue;
        }
        let key = ((r as u16 >> 4) << 8) | ((g as u16 >> 4) << 4) | (b as u16 >> 4);
        let entry = buckets.entry(key).or_insert((0, [0; 3]));
        entry.0 += 1;
        entry.1[0] += r as u64;
        entry.1[1] += g as u64;
        entry.1[2] += b as u64;
    }
    let mut ranked: Vec<(u16, (u64, [u64; 3]))> = buckets.into_iter().collect();
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(n)
        .map(|(_, (count, sum))| {
            let mean = |s: u64| (s / count) as u8;
            Color::rgb(mean(sum[0]), mean(sum[1]), mean(sum[2]))
        })
        .collect()
}

/// Validate raw vision output. Missing confidence counts as certain;
/// unlabeled objects are dropped.
pub fn detected_objects(raw: RawDetection) -> Vec<DetectedObject> {
    raw.objects
        .into_iter()
        .filter_map(|o| {
            let label = o.label.trim().to_string();
            if label.is_empty() {
                return None;
            }
            let confidence = o.confidence.filter(|c| c.is_finite()).unwrap_or(1.0).clamp(0.0, 1.0);
            let bounding_box = o.bbox.filter(|b| b.iter().all(|v| v.is_finite())).map(|[a, b, c, d]| BoundingBox {
                x1: a.min(c),
                y1: b.min(d),
                x2: a.max(c),
                y2: b.max(d),
            });
            Some(DetectedObject { label, bounding_box, confidence })
        })
        .collect()
}

type AnalysisOutcome = Result<Arc<AnalysisResult>, AnalyzeError>;

#[derive(Clone)]
pub struct AssetAnalyzer {
    vision: Arc<dyn VisionCapability>,
    cache: Cache<AssetId, Arc<AnalysisResult>>,
    inflight: Arc<Coalescer<AssetId, AnalysisOutcome>>,
    timeout: Duration,
}

impl AssetAnalyzer {
    pub fn new(vision: Arc<dyn VisionCapability>, capacity: u64, ttl: Duration, timeout: Duration) -> Self {
        Self {
            vision,
            cache: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
            inflight: Arc::new(Coalescer::new()),
            timeout,
        }
    }

    pub async fn cached(&self, id: &AssetId) -> Option<Arc<AnalysisResult>> {
        self.cache.get(id).await
    }

    pub async fn analyze(&self, asset: Arc<Asset>) -> AnalysisOutcome {
        if let Some(hit) = self.cache.get(&asset.id).await {
            debug!(asset_id = %asset.id, "analysis cache hit");
            return Ok(hit);
        }
        let key = asset.id.clone();
        let this = self.clone();
        self.inflight.run(key, move || async move { this.run_analysis(asset).await }).await
    }

    async fn run_analysis(self, asset: Arc<Asset>) -> AnalysisOutcome {
        // A caller that lost the race to a finished leader lands here.
        if let Some(hit) = self.cache.get(&asset.id).await {
            return Ok(hit);
        }

        let stats = self.local_stats(&asset).await?;
        let started = Instant::now();
        let raw = with_timeout(self.timeout, self.vision.detect(&asset))
            .await
            .map_err(|e| {
                warn!(asset_id = %asset.id, provider = self.vision.name(), error = %e, "vision detection failed");
                AnalyzeError::AnalysisUnavailable(e.to_string())
            })?;
        let product_type = raw.product_type.clone().filter(|t| !t.trim().is_empty());
        let objects = detected_objects(raw);
        info!(
            asset_id = %asset.id,
            provider = self.vision.name(),
            objects = objects.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "asset analyzed"
        );

        let result = Arc::new(build_result(&asset, DetectionStatus::Complete, objects, product_type, stats));
        self.cache.insert(asset.id.clone(), result.clone()).await;
        Ok(result)
    }

    /// Pixel-only analysis with detection marked unavailable. Not cached, so
    /// a later call can still obtain a full analysis.
    pub async fn local_only(&self, asset: &Arc<Asset>) -> AnalysisOutcome {
        let stats = self.local_stats(asset).await?;
        Ok(Arc::new(build_result(asset, DetectionStatus::Unavailable, vec![], None, stats)))
    }

    async fn local_stats(&self, asset: &Arc<Asset>) -> Result<PixelStats, AnalyzeError> {
        let bytes = asset.bytes.clone();
        tokio::task::spawn_blocking(move || pixel_stats(&bytes))
            .await
            .map_err(|e| AnalyzeError::UnsupportedAsset(format!("pixel analysis aborted: {e}")))?
    }
}

fn build_result(
    asset: &Asset,
    detection: DetectionStatus,
    detected_objects: Vec<DetectedObject>,
    product_type: Option<String>,
    stats: PixelStats,
) -> AnalysisResult {
    AnalysisResult {
        asset_id: asset.id.clone(),
        detection,
        detected_objects,
        product_type,
        dominant_colors: stats.dominant_colors,
        has_transparent_background: stats.has_transparent_background,
        foreground: stats.foreground,
        suggested_scale: stats.suggested_scale,
        analyzed_at: Utc::now(),
    }
}

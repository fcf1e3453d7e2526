//! Core records: assets, analysis results and user content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::color::Color;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn generate() -> Self {
        Self(format!("ast_{}", Uuid::new_v4().simple()))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Uploaded image. Immutable once created.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: AssetId,
    #[serde(skip)]
    pub bytes: Arc<[u8]>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(id: AssetId, bytes: impl Into<Arc<[u8]>>, mime_type: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id,
            bytes: bytes.into(),
            mime_type: mime_type.into(),
            width,
            height,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedObject {
    pub label: String,
    #[serde(default)]
    pub bounding_box: Option<BoundingBox>,
    pub confidence: f32,
}

/// Whether object detection actually ran.
///
/// `Complete` with zero objects means "nothing detected", which is a valid
/// answer. `Unavailable` means the vision capability could not be reached and
/// nothing is known about the image contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    Complete,
    Unavailable,
}

/// Pixel extent of non-transparent content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForegroundBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub asset_id: AssetId,
    pub detection: DetectionStatus,
    pub detected_objects: Vec<DetectedObject>,
    #[serde(default)]
    pub product_type: Option<String>,
    pub dominant_colors: Vec<Color>,
    pub has_transparent_background: bool,
    #[serde(default)]
    pub foreground: Option<ForegroundBox>,
    pub suggested_scale: f32,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn detection_complete(&self) -> bool {
        self.detection == DetectionStatus::Complete
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.detected_objects.iter().map(|o| o.label.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BrandColors {
    #[serde(default)]
    pub primary: Option<Color>,
    #[serde(default)]
    pub secondary: Option<Color>,
    #[serde(default)]
    pub accent: Option<Color>,
}

impl BrandColors {
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.secondary.is_none() && self.accent.is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = Color> + '_ {
        [self.primary, self.secondary, self.accent].into_iter().flatten()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundSpec {
    #[serde(default)]
    pub color: Option<Color>,
    #[serde(default)]
    pub image_asset_id: Option<AssetId>,
}

/// Free-text creative content supplied by the advertiser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSpec {
    pub headline: String,
    #[serde(default)]
    pub subheadline: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub offer: Option<String>,
    #[serde(default)]
    pub brand_colors: BrandColors,
    #[serde(default)]
    pub background: BackgroundSpec,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContentError {
    #[error("headline is required")]
    MissingHeadline,

    #[error("{field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },
}

/// Length bounds for free-text fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextLimits {
    pub headline: usize,
    pub other: usize,
}

impl Default for TextLimits {
    fn default() -> Self {
        Self { headline: 90, other: 240 }
    }
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl ContentSpec {
    pub fn check(&self, limits: &TextLimits) -> Result<(), ContentError> {
        if self.headline.trim().is_empty() {
            return Err(ContentError::MissingHeadline);
        }
        if self.headline.chars().count() > limits.headline {
            return Err(ContentError::TooLong { field: "headline", max: limits.headline });
        }
        let others = [
            ("subheadline", &self.subheadline),
            ("description", &self.description),
            ("price", &self.price),
            ("offer", &self.offer),
        ];
        for (field, value) in others {
            if value.as_ref().map_or(0, |v| v.chars().count()) > limits.other {
                return Err(ContentError::TooLong { field, max: limits.other });
            }
        }
        Ok(())
    }

    pub fn subheadline(&self) -> Option<&str> {
        non_blank(&self.subheadline)
    }

    pub fn description(&self) -> Option<&str> {
        non_blank(&self.description)
    }

    pub fn price(&self) -> Option<&str> {
        non_blank(&self.price)
    }

    pub fn offer(&self) -> Option<&str> {
        non_blank(&self.offer)
    }

    /// Text shown on the value tile, offer first.
    pub fn value_tile_text(&self) -> Option<String> {
        let parts: Vec<&str> = [self.offer(), self.price()].into_iter().flatten().collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headline_required() {
        let spec = ContentSpec { headline: "   ".into(), ..Default::default() };
        assert_eq!(spec.check(&TextLimits::default()), Err(ContentError::MissingHeadline));
    }

    #[test]
    fn test_length_bounds() {
        let spec = ContentSpec {
            headline: "Fresh".into(),
            description: Some("x".repeat(300)),
            ..Default::default()
        };
        assert_eq!(
            spec.check(&TextLimits::default()),
            Err(ContentError::TooLong { field: "description", max: 240 })
        );
    }

    #[test]
    fn test_value_tile_text_blank_fields_ignored() {
        let spec = ContentSpec {
            headline: "Fresh".into(),
            price: Some("£4.99".into()),
            offer: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(spec.value_tile_text().as_deref(), Some("£4.99"));
    }

    #[test]
    fn test_content_spec_camel_case() {
        let json = r##"{"headline":"Hi","brandColors":{"primary":"#ff0000"},"background":{"color":"#fff"}}"##;
        let spec: ContentSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.brand_colors.primary, Some(Color::rgb(255, 0, 0)));
        assert_eq!(spec.background.color, Some(Color::WHITE));
    }
}

//! Export Gate - size-capped deliverables
//!
//! An evaluated layout is rasterized once, then encoded down a bounded
//! ladder of quality and resolution steps until it fits the ceiling.

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageOutputFormat, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

use crate::hashing::sha256_hex;
use crate::layout::Ratio;
use crate::pipeline::EvaluatedLayout;
use crate::render::{rasterize, AssetImages};

const JPEG_QUALITIES: [u8; 6] = [92, 85, 75, 65, 55, 45];
const SCALES: [f32; 8] = [1.0, 0.85, 0.7, 0.55, 0.4, 0.3, 0.2, 0.15];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
}

impl ExportFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Png => "image/png",
            ExportFormat::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpg",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpeg",
        })
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ExportFormat::Png),
            "jpeg" | "jpg" => Ok(ExportFormat::Jpeg),
            other => Err(format!("unsupported export format '{other}'")),
        }
    }
}

/// One encoding attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LadderStep {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    pub scale: f32,
    pub size_bytes: usize,
}

impl fmt::Display for LadderStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.quality {
            Some(q) => write!(f, "q{q}@{:.2}x={}B", self.scale, self.size_bytes),
            None => write!(f, "{:.2}x={}B", self.scale, self.size_bytes),
        }
    }
}

fn describe_ladder(ladder: &[LadderStep]) -> String {
    ladder.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExportError {
    #[error("Export exceeds {max_bytes} bytes after {} attempts: {}", ladder.len(), describe_ladder(ladder))]
    ExportTooLarge { max_bytes: usize, ladder: Vec<LadderStep> },

    #[error("Export ceiling must be positive")]
    InvalidCeiling,

    #[error("Encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportArtifact {
    pub ratio: Ratio,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub size_bytes: usize,
    pub format: ExportFormat,
    pub width: u32,
    pub height: u32,
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    pub scale: f32,
    /// Every attempt made, the last one being this artifact.
    pub ladder: Vec<LadderStep>,
    pub report_id: String,
}

/// Planned (quality, scale) steps for `format`, capped at `max_attempts`.
pub fn ladder_plan(format: ExportFormat, max_attempts: usize) -> Vec<(Option<u8>, f32)> {
    let plan: Vec<(Option<u8>, f32)> = match format {
        ExportFormat::Png => SCALES.iter().map(|s| (None, *s)).collect(),
        ExportFormat::Jpeg => {
            let floor = JPEG_QUALITIES[JPEG_QUALITIES.len() - 1];
            JPEG_QUALITIES
                .iter()
                .map(|q| (Some(*q), 1.0))
                .chain(SCALES[1..].iter().map(|s| (Some(floor), *s)))
                .collect()
        }
    };
    plan.into_iter().take(max_attempts.max(1)).collect()
}

fn encode(img: &RgbaImage, format: ExportFormat, quality: Option<u8>) -> Result<Vec<u8>, ExportError> {
    let rgb = DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(img.clone()).to_rgb8());
    let target = match format {
        ExportFormat::Png => ImageOutputFormat::Png,
        ExportFormat::Jpeg => ImageOutputFormat::Jpeg(quality.unwrap_or(JPEG_QUALITIES[0])),
    };
    let mut buf = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut buf), target)
        .map_err(|e| ExportError::Encode(e.to_string()))?;
    Ok(buf)
}

#[derive(Debug, Clone)]
pub struct ExportGate {
    max_attempts: usize,
}

impl ExportGate {
    pub fn new(max_attempts: usize) -> Self {
        Self { max_attempts: max_attempts.max(1) }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Encode `evaluated` under `max_bytes`. CPU-bound; run it off the
    /// async executor. Never touches the layout.
    pub fn export(
        &self,
        evaluated: &EvaluatedLayout,
        assets: &AssetImages,
        format: ExportFormat,
        max_bytes: usize,
    ) -> Result<ExportArtifact, ExportError> {
        if max_bytes == 0 {
            return Err(ExportError::InvalidCeiling);
        }
        let layout = evaluated.layout();
        let full = rasterize(layout, assets, 1.0);
        let mut ladder = Vec::new();

        for (quality, scale) in ladder_plan(format, self.max_attempts) {
            let frame = if scale < 1.0 {
                let w = ((full.width() as f32 * scale).round() as u32).max(1);
                let h = ((full.height() as f32 * scale).round() as u32).max(1);
                imageops::resize(&full, w, h, FilterType::Triangle)
            } else {
                full.clone()
            };
            let bytes = encode(&frame, format, quality)?;
            let step = LadderStep { quality, scale, size_bytes: bytes.len() };
            ladder.push(step);
            debug!(ratio = %layout.ratio, %format, %step, max_bytes, "export attempt");

            if bytes.len() <= max_bytes {
                let artifact = ExportArtifact {
                    ratio: layout.ratio,
                    size_bytes: bytes.len(),
                    sha256: sha256_hex(&bytes),
                    bytes,
                    format,
                    width: frame.width(),
                    height: frame.height(),
                    quality,
                    scale,
                    ladder,
                    report_id: evaluated.report().report_id.clone(),
                };
                info!(
                    ratio = %artifact.ratio,
                    %format,
                    size_bytes = artifact.size_bytes,
                    attempts = artifact.ladder.len(),
                    "export produced"
                );
                return Ok(artifact);
            }
        }

        info!(ratio = %layout.ratio, %format, max_bytes, attempts = ladder.len(), "export too large");
        Err(ExportError::ExportTooLarge { max_bytes, ladder })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_plan_capped() {
        let plan = ladder_plan(ExportFormat::Jpeg, 8);
        assert_eq!(plan.len(), 8);
        assert_eq!(plan[0], (Some(92), 1.0));
        assert_eq!(plan[6], (Some(45), 0.85));
        assert_eq!(ladder_plan(ExportFormat::Png, 3).len(), 3);
        assert_eq!(ladder_plan(ExportFormat::Png, 0).len(), 1);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("JPG".parse::<ExportFormat>().unwrap(), ExportFormat::Jpeg);
        assert!("gif".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn test_too_large_discloses_ladder() {
        let err = ExportError::ExportTooLarge {
            max_bytes: 10,
            ladder: vec![LadderStep { quality: Some(92), scale: 1.0, size_bytes: 900 }],
        };
        assert!(err.to_string().contains("q92@1.00x=900B"));
    }
}

//! AI capability boundary.
//!
//! The pipeline only talks to vision and generative models through these
//! traits. Providers are swappable: `http` speaks an OpenAI-compatible chat
//! API, `offline` is a deterministic local stand-in.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::CapabilitySettings;
use crate::layout::{Canvas, ElementKind, ElementRole, Ratio};
use crate::model::{Asset, ContentSpec};
use crate::palette::ResolvedPalette;
use crate::semantic::{JudgeRequest, SemanticJudgement};

pub mod extract;
pub mod http;
pub mod offline;

pub use http::{HttpCapability, ModelNames};
pub use offline::OfflineCapability;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("capability unavailable: {0}")]
    Unavailable(String),

    #[error("capability call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed capability response: {0}")]
    Malformed(String),
}

impl CapabilityError {
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Run a capability call under an explicit deadline.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, CapabilityError>
where
    F: Future<Output = Result<T, CapabilityError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CapabilityError::Timeout(limit)),
    }
}

/// Raw object as reported by a vision model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawObject {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
}

/// Unvalidated vision output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub objects: Vec<RawObject>,
}

/// Structured input for one layout generation call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutPrompt {
    pub ratio: Ratio,
    pub canvas: Canvas,
    pub content: ContentSpec,
    pub palette: ResolvedPalette,
    pub detected_labels: Vec<String>,
    pub has_logo: bool,
    pub has_background_image: bool,
    pub alcohol_detected: bool,
    /// Set on the retry after a malformed response.
    pub strict: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateBackground {
    #[serde(default)]
    pub color: Option<String>,
}

/// One element of a generated layout. Geometry is given as canvas fractions
/// in `[0, 1]`; values above 1 are read as pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateElement {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    #[serde(default)]
    pub role: Option<ElementRole>,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub fill: Option<String>,
    #[serde(default)]
    pub font_size: Option<f64>,
}

/// Wire format a generator must return (as JSON text).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayoutCandidate {
    #[serde(default)]
    pub background: Option<CandidateBackground>,
    #[serde(default)]
    pub elements: Vec<CandidateElement>,
}

#[async_trait]
pub trait VisionCapability: Send + Sync {
    fn name(&self) -> &str;

    async fn detect(&self, asset: &Asset) -> Result<RawDetection, CapabilityError>;
}

#[async_trait]
pub trait GenerativeCapability: Send + Sync {
    fn name(&self) -> &str;

    /// Returns the raw model text; parsing belongs to the synthesizer so a
    /// malformed answer can be retried with a stricter prompt.
    async fn generate_layout(&self, prompt: &LayoutPrompt) -> Result<String, CapabilityError>;

    async fn judge_semantic_match(&self, request: &JudgeRequest) -> Result<SemanticJudgement, CapabilityError>;
}

/// The provider pair the pipeline runs against.
#[derive(Clone)]
pub struct Capabilities {
    pub vision: Arc<dyn VisionCapability>,
    pub generator: Arc<dyn GenerativeCapability>,
}

impl Capabilities {
    pub fn offline() -> Self {
        let offline = Arc::new(OfflineCapability::new());
        Self { vision: offline.clone(), generator: offline }
    }

    pub fn from_settings(settings: &CapabilitySettings) -> Self {
        match settings {
            CapabilitySettings::Offline => Self::offline(),
            CapabilitySettings::Http { base_url, api_key, models } => {
                let http = Arc::new(HttpCapability::new(base_url.clone(), api_key.clone(), models.clone()));
                Self { vision: http.clone(), generator: http }
            }
        }
    }

    pub fn provider(&self) -> &str {
        self.generator.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, CapabilityError>(1)
        };
        let err = with_timeout(Duration::from_millis(10), slow).await.unwrap_err();
        assert_eq!(err, CapabilityError::Timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_candidate_parses_minimal_element() {
        let json = r#"{"elements":[{"type":"text","role":"headline","x":0.1,"y":0.05,"width":0.8,"height":0.1,"text":"Hi"}]}"#;
        let c: LayoutCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(c.elements.len(), 1);
        assert_eq!(c.elements[0].role, Some(ElementRole::Headline));
    }
}

//! Deterministic local provider.
//!
//! Used when no model endpoint is configured. Detection reports no objects
//! (a valid "nothing detected" answer), layouts come from fixed per-ratio
//! templates and semantic judgements use the shared lexicon.

use async_trait::async_trait;

use super::{
    CandidateBackground, CandidateElement, CapabilityError, GenerativeCapability, LayoutCandidate, LayoutPrompt,
    RawDetection, VisionCapability,
};
use crate::color::{readable_text_color, Color, WCAG_AA_CONTRAST};
use crate::layout::{ElementKind, ElementRole, Ratio};
use crate::model::Asset;
use crate::semantic::{lexicon_judgement, JudgeRequest, SemanticJudgement};

#[derive(Debug, Clone, Default)]
pub struct OfflineCapability;

impl OfflineCapability {
    pub fn new() -> Self {
        Self
    }
}

/// Fractional slots `(x, y, w, h)` for each role, per ratio.
struct Slots {
    headline: [f64; 4],
    subheadline: [f64; 4],
    packshot: [f64; 4],
    price: [f64; 4],
    description: [f64; 4],
    logo: [f64; 4],
    drinkaware: [f64; 4],
    decoration: [f64; 4],
}

fn slots(ratio: Ratio) -> Slots {
    match ratio {
        Ratio::Square => Slots {
            headline: [0.08, 0.06, 0.74, 0.12],
            subheadline: [0.10, 0.19, 0.72, 0.06],
            packshot: [0.225, 0.28, 0.55, 0.45],
            price: [0.70, 0.76, 0.26, 0.12],
            description: [0.08, 0.90, 0.60, 0.05],
            logo: [0.84, 0.04, 0.12, 0.12],
            drinkaware: [0.04, 0.50, 0.18, 0.06],
            decoration: [0.62, 0.30, 0.34, 0.34],
        },
        // Keeps clear of the top 200 px and bottom 250 px.
        Ratio::Vertical => Slots {
            headline: [0.06, 0.12, 0.70, 0.08],
            subheadline: [0.06, 0.21, 0.70, 0.04],
            packshot: [0.15, 0.27, 0.70, 0.40],
            price: [0.62, 0.70, 0.32, 0.08],
            description: [0.06, 0.80, 0.60, 0.04],
            logo: [0.80, 0.11, 0.14, 0.08],
            drinkaware: [0.04, 0.60, 0.25, 0.04],
            decoration: [0.55, 0.30, 0.40, 0.25],
        },
        Ratio::Landscape => Slots {
            headline: [0.48, 0.08, 0.38, 0.16],
            subheadline: [0.48, 0.27, 0.44, 0.08],
            packshot: [0.04, 0.10, 0.40, 0.80],
            price: [0.70, 0.66, 0.26, 0.20],
            description: [0.48, 0.88, 0.48, 0.07],
            logo: [0.88, 0.04, 0.09, 0.14],
            drinkaware: [0.48, 0.50, 0.20, 0.10],
            decoration: [0.02, 0.05, 0.30, 0.55],
        },
    }
}

/// Default slot for `role` on a `ratio` canvas, as `(x, y, w, h)` fractions.
/// Slots of different roles never contain one another.
pub fn slot(ratio: Ratio, role: ElementRole) -> [f64; 4] {
    let s = slots(ratio);
    match role {
        ElementRole::Headline => s.headline,
        ElementRole::Subheadline => s.subheadline,
        ElementRole::Description | ElementRole::Tag => s.description,
        ElementRole::Price => s.price,
        ElementRole::Packshot => s.packshot,
        ElementRole::Logo => s.logo,
        ElementRole::Drinkaware => s.drinkaware,
        ElementRole::Decoration => s.decoration,
    }
}

fn element(kind: ElementKind, role: ElementRole, slot: [f64; 4]) -> CandidateElement {
    CandidateElement {
        kind,
        role: Some(role),
        x: slot[0],
        y: slot[1],
        width: slot[2],
        height: slot[3],
        text: None,
        color: None,
        fill: None,
        font_size: None,
    }
}

fn text_element(role: ElementRole, slot: [f64; 4], text: &str, color: Color, font_size: f64) -> CandidateElement {
    CandidateElement {
        text: Some(text.to_string()),
        color: Some(color.to_hex()),
        font_size: Some(font_size.round()),
        ..element(ElementKind::Text, role, slot)
    }
}

/// Template layout for a prompt. Pure function of the prompt.
pub fn template_layout(prompt: &LayoutPrompt) -> LayoutCandidate {
    let s = slots(prompt.ratio);
    let h = prompt.canvas.height as f64;
    let palette = &prompt.palette;
    let bg = palette.background;
    let ink = readable_text_color(&bg, &[palette.secondary, palette.primary], WCAG_AA_CONTRAST);
    let content = &prompt.content;

    let mut elements = vec![CandidateElement {
        fill: Some(palette.accent.to_hex()),
        ..element(ElementKind::Shape, ElementRole::Decoration, s.decoration)
    }];
    elements.push(element(ElementKind::Image, ElementRole::Packshot, s.packshot));
    elements.push(text_element(ElementRole::Headline, s.headline, &content.headline, ink, h * 0.065));
    if let Some(sub) = content.subheadline() {
        elements.push(text_element(ElementRole::Subheadline, s.subheadline, sub, ink, h * 0.034));
    }
    if let Some(tile_text) = content.value_tile_text() {
        let tile_ink = readable_text_color(&palette.primary, &[palette.secondary], WCAG_AA_CONTRAST);
        elements.push(CandidateElement {
            fill: Some(palette.primary.to_hex()),
            ..text_element(ElementRole::Price, s.price, &tile_text, tile_ink, h * 0.042)
        });
    }
    if let Some(desc) = content.description() {
        elements.push(text_element(ElementRole::Description, s.description, desc, ink, h * 0.022));
    }
    if prompt.has_logo {
        elements.push(element(ElementKind::Logo, ElementRole::Logo, s.logo));
    }
    if prompt.alcohol_detected {
        let lockup = Color::high_contrast_on(&bg);
        elements.push(text_element(ElementRole::Drinkaware, s.drinkaware, "drinkaware.co.uk", lockup, h * 0.02));
    }

    LayoutCandidate {
        background: Some(CandidateBackground { color: Some(bg.to_hex()) }),
        elements,
    }
}

#[async_trait]
impl VisionCapability for OfflineCapability {
    fn name(&self) -> &str {
        "offline"
    }

    async fn detect(&self, _asset: &Asset) -> Result<RawDetection, CapabilityError> {
        Ok(RawDetection::default())
    }
}

#[async_trait]
impl GenerativeCapability for OfflineCapability {
    fn name(&self) -> &str {
        "offline"
    }

    async fn generate_layout(&self, prompt: &LayoutPrompt) -> Result<String, CapabilityError> {
        serde_json::to_string(&template_layout(prompt)).map_err(|e| CapabilityError::Malformed(e.to_string()))
    }

    async fn judge_semantic_match(&self, request: &JudgeRequest) -> Result<SemanticJudgement, CapabilityError> {
        Ok(lexicon_judgement(request))
    }
}

//! Layout synthesis.
//!
//! The generative capability proposes a candidate; `assemble` turns it into
//! a `LayoutSpec` that satisfies the hard constraints (canvas bounds, no fully
//! covered text, a single logo, required elements, legible contrast) and
//! records every adjustment it made in `LayoutSpec::repairs`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capability::extract::extract_json;
use crate::capability::offline::slot;
use crate::capability::{with_timeout, CandidateElement, CapabilityError, GenerativeCapability, LayoutCandidate, LayoutPrompt};
use crate::color::{readable_text_color, Color, WCAG_AA_CONTRAST};
use crate::layout::{BackgroundRef, Canvas, ElementKind, ElementRole, LayoutElement, LayoutSpec, Ratio, Rect, StyleRefs};
use crate::model::{AnalysisResult, AssetId, ContentError, ContentSpec, TextLimits};
use crate::palette::ResolvedPalette;
use crate::semantic::alcohol_detected;

pub const DRINKAWARE_TEXT: &str = "drinkaware.co.uk";

/// One attempt plus one retry, whatever the failures were.
const MAX_LAYOUT_ATTEMPTS: u32 = 2;

/// Roles that may appear at most once on a creative.
const UNIQUE_ROLES: [ElementRole; 5] = [
    ElementRole::Headline,
    ElementRole::Packshot,
    ElementRole::Logo,
    ElementRole::Price,
    ElementRole::Drinkaware,
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("Layout generation for {ratio} failed after {attempts} attempt(s): {reason}")]
    LayoutGenerationFailed { ratio: Ratio, attempts: u32, reason: String },

    #[error("Invalid content: {0}")]
    InputError(#[from] ContentError),
}

/// Everything a ratio needs, shareable across concurrent ratio tasks.
#[derive(Debug, Clone)]
pub struct SynthesisInput {
    pub content: Arc<ContentSpec>,
    pub analysis: Arc<AnalysisResult>,
    pub palette: ResolvedPalette,
    pub logo_asset: Option<AssetId>,
}

pub struct AssemblyContext<'a> {
    pub ratio: Ratio,
    pub content: &'a ContentSpec,
    pub palette: ResolvedPalette,
    pub packshot_asset: &'a AssetId,
    pub logo_asset: Option<&'a AssetId>,
    pub alcohol_detected: bool,
}

#[derive(Clone)]
pub struct LayoutSynthesizer {
    generator: Arc<dyn GenerativeCapability>,
    timeout: Duration,
    backoff: Duration,
    limits: TextLimits,
    min_label_confidence: f32,
}

impl LayoutSynthesizer {
    pub fn new(generator: Arc<dyn GenerativeCapability>, timeout: Duration, backoff: Duration) -> Self {
        Self {
            generator,
            timeout,
            backoff,
            limits: TextLimits::default(),
            min_label_confidence: 0.3,
        }
    }

    pub fn with_text_limits(mut self, limits: TextLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_min_label_confidence(mut self, min: f32) -> Self {
        self.min_label_confidence = min;
        self
    }

    fn prompt(&self, input: &SynthesisInput, ratio: Ratio, alcohol: bool, strict: bool) -> LayoutPrompt {
        LayoutPrompt {
            ratio,
            canvas: ratio.canvas(),
            content: (*input.content).clone(),
            palette: input.palette,
            detected_labels: input
                .analysis
                .detected_objects
                .iter()
                .filter(|o| o.confidence >= self.min_label_confidence)
                .map(|o| o.label.clone())
                .collect(),
            has_logo: input.logo_asset.is_some(),
            has_background_image: input.content.background.image_asset_id.is_some(),
            alcohol_detected: alcohol,
            strict,
        }
    }

    /// Generate and repair the layout for one ratio.
    ///
    /// The first failure of either kind gets the only retry: a malformed
    /// answer is retried with a stricter prompt, an unreachable capability
    /// after a backoff. The second failure is returned, never papered over
    /// with a fallback layout.
    #[instrument(skip_all, fields(ratio = %ratio, provider = self.generator.name()))]
    pub async fn synthesize(&self, input: &SynthesisInput, ratio: Ratio) -> Result<LayoutSpec, SynthesisError> {
        input.content.check(&self.limits)?;
        let alcohol = alcohol_detected(&input.analysis, self.min_label_confidence);

        let mut strict = false;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let prompt = self.prompt(input, ratio, alcohol, strict);
            let started = Instant::now();
            let outcome = with_timeout(self.timeout, self.generator.generate_layout(&prompt))
                .await
                .and_then(|text| parse_candidate(&text));
            debug!(attempt = attempts, strict, elapsed_ms = started.elapsed().as_millis() as u64, "layout generation returned");

            let failure = match outcome {
                Ok(candidate) => {
                    let ctx = AssemblyContext {
                        ratio,
                        content: &input.content,
                        palette: input.palette,
                        packshot_asset: &input.analysis.asset_id,
                        logo_asset: input.logo_asset.as_ref(),
                        alcohol_detected: alcohol,
                    };
                    let layout = assemble(&candidate, &ctx);
                    info!(attempts, elements = layout.elements.len(), repairs = layout.repairs.len(), "layout synthesized");
                    return Ok(layout);
                }
                Err(e) => e,
            };

            if attempts >= MAX_LAYOUT_ATTEMPTS {
                warn!(attempts, error = %failure, "layout generation failed");
                return Err(SynthesisError::LayoutGenerationFailed { ratio, attempts, reason: failure.to_string() });
            }
            warn!(attempt = attempts, error = %failure, "retrying layout generation");
            if failure.is_malformed() {
                strict = true;
            } else {
                tokio::time::sleep(self.backoff).await;
            }
        }
    }
}

/// Parse generator output into a candidate with at least one element.
pub fn parse_candidate(text: &str) -> Result<LayoutCandidate, CapabilityError> {
    let value = extract_json(text).ok_or_else(|| CapabilityError::Malformed("no JSON object in layout response".into()))?;
    let candidate: LayoutCandidate =
        serde_json::from_value(value).map_err(|e| CapabilityError::Malformed(format!("layout does not match schema: {e}")))?;
    if candidate.elements.is_empty() {
        return Err(CapabilityError::Malformed("layout has no elements".into()));
    }
    Ok(candidate)
}

enum RoleText {
    NotText,
    Text(String),
    Missing,
}

/// Copy shown by a role. Advertiser copy always wins over generated text.
fn role_text(role: ElementRole, ctx: &AssemblyContext<'_>, generated: Option<&str>) -> RoleText {
    let content = ctx.content;
    let pick = |v: Option<&str>| v.map_or(RoleText::Missing, |t| RoleText::Text(t.to_string()));
    match role {
        ElementRole::Headline => pick(Some(content.headline.trim())),
        ElementRole::Subheadline => pick(content.subheadline()),
        ElementRole::Description => pick(content.description()),
        ElementRole::Price => content.value_tile_text().map_or(RoleText::Missing, RoleText::Text),
        ElementRole::Drinkaware => RoleText::Text(DRINKAWARE_TEXT.into()),
        ElementRole::Tag => pick(generated.map(str::trim).filter(|t| !t.is_empty())),
        ElementRole::Packshot | ElementRole::Logo | ElementRole::Decoration => RoleText::NotText,
    }
}

fn kind_for(role: ElementRole) -> ElementKind {
    match role {
        ElementRole::Packshot => ElementKind::Image,
        ElementRole::Logo => ElementKind::Logo,
        ElementRole::Decoration => ElementKind::Shape,
        _ => ElementKind::Text,
    }
}

/// Pixel rectangle for a candidate. Geometry is read as canvas fractions
/// unless some value exceeds 1.
fn candidate_rect(c: &CandidateElement, canvas: &Canvas) -> Option<Rect> {
    let vals = [c.x, c.y, c.width, c.height];
    if vals.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let (sx, sy) = if vals.iter().any(|v| *v > 1.0) {
        (1.0, 1.0)
    } else {
        (canvas.width as f64, canvas.height as f64)
    };
    let px = |v: f64, scale: f64| (v * scale).max(0.0).round() as u32;
    let rect = Rect::new(px(c.x, sx), px(c.y, sy), px(c.width, sx), px(c.height, sy));
    (!rect.is_empty()).then_some(rect)
}

fn default_font(role: ElementRole, rect: &Rect) -> u32 {
    ((rect.height as f64 * 0.55).round() as u32).max(role.min_font_px())
}

/// Keep `rect` on the canvas and, where the ratio has one, out of the safe zone.
fn fit(rect: Rect, canvas: &Canvas, ratio: Ratio, non_decorative: bool) -> Rect {
    let mut r = rect.clamped_to(canvas);
    if let (true, Some((top, bottom))) = (non_decorative, ratio.safe_zone()) {
        let max_bottom = canvas.height.saturating_sub(bottom);
        let band = max_bottom.saturating_sub(top);
        r.height = r.height.min(band);
        if r.y < top {
            r.y = top;
        }
        if r.bottom() > max_bottom as u64 {
            r.y = max_bottom - r.height;
        }
    }
    r
}

struct Builder<'a> {
    ctx: &'a AssemblyContext<'a>,
    canvas: Canvas,
    counters: HashMap<ElementRole, usize>,
    repairs: Vec<String>,
}

impl<'a> Builder<'a> {
    fn next_id(&mut self, role: ElementRole) -> String {
        let n = self.counters.entry(role).or_insert(0);
        *n += 1;
        format!("{}-{}", role, n)
    }

    fn element(&mut self, role: ElementRole, rect: Rect, text: Option<String>, source: Option<&CandidateElement>) -> LayoutElement {
        let id = self.next_id(role);
        let parse = |v: Option<&String>| v.and_then(|s| s.parse::<Color>().ok());
        let kind = kind_for(role);
        let mut style = StyleRefs {
            text_color: parse(source.and_then(|c| c.color.as_ref())),
            fill: parse(source.and_then(|c| c.fill.as_ref())),
            ..Default::default()
        };
        if text.is_some() {
            style.font_size_px = source
                .and_then(|c| c.font_size)
                .filter(|f| f.is_finite() && *f >= 1.0)
                .map(|f| f.round() as u32)
                .or_else(|| Some(default_font(role, &rect)));
        }
        style.text = text;
        match role {
            ElementRole::Packshot => style.asset_ref = Some(self.ctx.packshot_asset.clone()),
            ElementRole::Logo => style.asset_ref = self.ctx.logo_asset.cloned(),
            ElementRole::Price if style.fill.is_none() => style.fill = Some(self.ctx.palette.primary),
            _ => {}
        }

        let fitted = rect.clamped_to(&self.canvas);
        if source.is_some() && fitted != rect {
            self.repairs.push(format!("clamped {id} to the canvas"));
        }
        LayoutElement { id, kind, role, rect: fitted, style }
    }
}

fn layer(role: ElementRole) -> u8 {
    match role {
        ElementRole::Decoration => 0,
        ElementRole::Packshot => 1,
        _ => 2,
    }
}

/// Turn a generated candidate into a constraint-satisfying layout. Pure.
pub fn assemble(candidate: &LayoutCandidate, ctx: &AssemblyContext<'_>) -> LayoutSpec {
    let canvas = ctx.ratio.canvas();
    let mut b = Builder { ctx, canvas, counters: HashMap::new(), repairs: Vec::new() };
    let mut elements: Vec<LayoutElement> = Vec::with_capacity(candidate.elements.len() + 3);
    let mut present: HashSet<ElementRole> = HashSet::new();

    for (i, c) in candidate.elements.iter().enumerate() {
        let role = c.role.unwrap_or_else(|| ElementRole::default_for(c.kind));
        let Some(rect) = candidate_rect(c, &canvas) else {
            b.repairs.push(format!("dropped candidate element {i} ({role}): unusable geometry"));
            continue;
        };
        if role == ElementRole::Logo && ctx.logo_asset.is_none() {
            b.repairs.push(format!("dropped candidate element {i} (logo): no logo asset supplied"));
            continue;
        }
        if UNIQUE_ROLES.contains(&role) && present.contains(&role) {
            b.repairs.push(format!("dropped duplicate {role} element"));
            continue;
        }
        let text = match role_text(role, ctx, c.text.as_deref()) {
            RoleText::NotText => None,
            RoleText::Text(t) => Some(t),
            RoleText::Missing => {
                b.repairs.push(format!("dropped candidate element {i} ({role}): no copy for it"));
                continue;
            }
        };
        present.insert(role);
        elements.push(b.element(role, rect, text, Some(c)));
    }

    let mut required = vec![ElementRole::Packshot, ElementRole::Headline];
    if ctx.logo_asset.is_some() {
        required.push(ElementRole::Logo);
    }
    if ctx.content.value_tile_text().is_some() {
        required.push(ElementRole::Price);
    }
    if ctx.alcohol_detected {
        required.push(ElementRole::Drinkaware);
    }
    for role in required {
        if present.contains(&role) {
            continue;
        }
        let [x, y, w, h] = slot(ctx.ratio, role);
        let rect = Rect::from_fractions(&canvas, x, y, w, h);
        let text = match role_text(role, ctx, None) {
            RoleText::Text(t) => Some(t),
            _ => None,
        };
        let el = b.element(role, rect, text, None);
        b.repairs.push(format!("inserted {} element", el.id));
        elements.push(el);
    }

    elements.sort_by_key(|e| layer(e.role));

    for el in elements.iter_mut().filter(|e| e.is_non_decorative()) {
        let fitted = fit(el.rect, &canvas, ctx.ratio, true);
        if fitted != el.rect {
            el.rect = fitted;
            b.repairs.push(format!("moved {} out of the {} safe zone", el.id, ctx.ratio));
        }
    }

    separate_covered(&mut elements, ctx.ratio, &canvas, &mut b.repairs);

    for el in elements.iter_mut().filter(|e| e.carries_text()) {
        let min = el.role.min_font_px();
        if el.style.font_size_px.map_or(true, |f| f < min) {
            el.style.font_size_px = Some(min);
            b.repairs.push(format!("raised {} font size to {min}px", el.id));
        }
    }

    let background = ctx
        .content
        .background
        .color
        .or_else(|| {
            candidate
                .background
                .as_ref()
                .and_then(|bg| bg.color.as_deref())
                .and_then(|c| c.parse().ok())
        })
        .unwrap_or(ctx.palette.background);

    let mut spec = LayoutSpec {
        ratio: ctx.ratio,
        canvas,
        elements,
        background: BackgroundRef { color: background, image_ref: ctx.content.background.image_asset_id.clone() },
        logo_asset: ctx.logo_asset.cloned(),
        repairs: Vec::new(),
    };
    ensure_contrast(&mut spec, &ctx.palette, &mut b.repairs);
    spec.repairs = b.repairs;
    spec
}

/// Move or drop non-decorative elements until none fully covers another.
fn separate_covered(elements: &mut Vec<LayoutElement>, ratio: Ratio, canvas: &Canvas, repairs: &mut Vec<String>) {
    let guarded: Vec<usize> = (0..elements.len()).filter(|&i| elements[i].is_non_decorative()).collect();
    let mut dropped: Vec<usize> = Vec::new();

    for (pos, &i) in guarded.iter().enumerate() {
        let earlier: Vec<usize> = guarded[..pos].iter().copied().filter(|j| !dropped.contains(j)).collect();
        let covering = |r: &Rect| earlier.iter().copied().find(|&j| elements[j].rect.fully_overlaps(r));
        let Some(other) = covering(&elements[i].rect) else {
            continue;
        };

        let current = elements[i].rect;
        let blocker = elements[other].rect;
        let [x, y, w, h] = slot(ratio, elements[i].role);
        let candidates = [
            Rect::from_fractions(canvas, x, y, w, h),
            Rect { x: blocker.right().min(u32::MAX as u64) as u32, ..current },
            Rect { x: blocker.x.saturating_sub(current.width), ..current },
            Rect { y: blocker.bottom().min(u32::MAX as u64) as u32, ..current },
            Rect { y: blocker.y.saturating_sub(current.height), ..current },
        ];
        let placed = candidates
            .into_iter()
            .map(|r| fit(r, canvas, ratio, true))
            .find(|r| covering(r).is_none());

        let id = elements[i].id.clone();
        let other_id = elements[other].id.clone();
        match placed {
            Some(r) => {
                elements[i].rect = r;
                repairs.push(format!("moved {id} so it no longer fully overlaps {other_id}"));
            }
            None => {
                dropped.push(i);
                repairs.push(format!("dropped {id}: no position avoids fully overlapping {other_id}"));
            }
        }
    }

    dropped.sort_unstable();
    for i in dropped.into_iter().rev() {
        elements.remove(i);
    }
}

/// Replace text colours that miss AA contrast with a readable palette colour.
/// Text with an image behind it first gets an opaque backing fill, so its
/// contrast is measured against a colour the rendered creative shows.
fn ensure_contrast(spec: &mut LayoutSpec, palette: &ResolvedPalette, repairs: &mut Vec<String>) {
    let candidates = [palette.secondary, palette.primary, palette.accent, palette.background];
    for i in 0..spec.elements.len() {
        if !spec.elements[i].carries_text() {
            continue;
        }
        let local = match spec.local_background(i) {
            Some(color) => color,
            None => {
                let el = &mut spec.elements[i];
                el.style.fill = Some(palette.background);
                repairs.push(format!("added a {} backing fill behind {} over an image", palette.background, el.id));
                palette.background
            }
        };
        let current = spec.elements[i].style.text_color;
        if current.map_or(false, |c| c.contrast_ratio(&local) >= WCAG_AA_CONTRAST) {
            continue;
        }
        let replacement = readable_text_color(&local, &candidates, WCAG_AA_CONTRAST);
        let el = &mut spec.elements[i];
        if let Some(old) = current {
            repairs.push(format!(
                "substituted text colour on {} ({} to {}, {:.2}:1 against {})",
                el.id,
                old,
                replacement,
                replacement.contrast_ratio(&local),
                local
            ));
        }
        el.style.text_color = Some(replacement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CandidateBackground;
    use crate::model::DetectionStatus;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn content() -> ContentSpec {
        ContentSpec {
            headline: "Crunchy Crisps".into(),
            price: Some("£1.50".into()),
            ..Default::default()
        }
    }

    fn el(kind: ElementKind, role: ElementRole, geom: [f64; 4]) -> CandidateElement {
        CandidateElement {
            kind,
            role: Some(role),
            x: geom[0],
            y: geom[1],
            width: geom[2],
            height: geom[3],
            text: None,
            color: None,
            fill: None,
            font_size: None,
        }
    }

    fn assemble_with(candidate: LayoutCandidate, ratio: Ratio, content: &ContentSpec, logo: Option<&AssetId>) -> LayoutSpec {
        let packshot = AssetId::new("ast_pack");
        let ctx = AssemblyContext {
            ratio,
            content,
            palette: ResolvedPalette::default(),
            packshot_asset: &packshot,
            logo_asset: logo,
            alcohol_detected: false,
        };
        assemble(&candidate, &ctx)
    }

    fn assert_in_bounds(spec: &LayoutSpec) {
        for e in &spec.elements {
            assert!(e.rect.within(&spec.canvas), "{} out of bounds: {:?}", e.id, e.rect);
        }
    }

    #[test]
    fn test_out_of_bounds_candidate_is_clamped() {
        let candidate = LayoutCandidate {
            background: None,
            elements: vec![el(ElementKind::Text, ElementRole::Headline, [900.0, -40.0, 600.0, 120.0])],
        };
        let spec = assemble_with(candidate, Ratio::Square, &content(), None);
        assert_in_bounds(&spec);
        assert!(spec.repairs.iter().any(|r| r.contains("clamped headline-1")));
        assert_eq!(spec.elements_with_role(ElementRole::Headline).next().unwrap().text(), Some("Crunchy Crisps"));
    }

    #[test]
    fn test_required_elements_inserted() {
        let candidate = LayoutCandidate {
            background: Some(CandidateBackground { color: Some("#102030".into()) }),
            elements: vec![el(ElementKind::Shape, ElementRole::Decoration, [0.0, 0.0, 0.2, 0.2])],
        };
        let logo = AssetId::new("ast_logo");
        let spec = assemble_with(candidate, Ratio::Landscape, &content(), Some(&logo));
        for role in [ElementRole::Packshot, ElementRole::Headline, ElementRole::Logo, ElementRole::Price] {
            assert_eq!(spec.elements_with_role(role).count(), 1, "{role}");
        }
        assert_eq!(spec.background.color, Color::rgb(0x10, 0x20, 0x30));
        let logo_el = spec.elements_with_role(ElementRole::Logo).next().unwrap();
        assert_eq!(logo_el.style.asset_ref.as_ref(), Some(&logo));
    }

    #[test]
    fn test_logo_exactly_once_and_dropped_without_asset() {
        let candidate = LayoutCandidate {
            background: None,
            elements: vec![
                el(ElementKind::Logo, ElementRole::Logo, [0.8, 0.0, 0.1, 0.1]),
                el(ElementKind::Logo, ElementRole::Logo, [0.0, 0.8, 0.1, 0.1]),
            ],
        };
        let logo = AssetId::new("ast_logo");
        let with = assemble_with(candidate.clone(), Ratio::Square, &content(), Some(&logo));
        assert_eq!(with.elements_with_role(ElementRole::Logo).count(), 1);

        let without = assemble_with(candidate, Ratio::Square, &content(), None);
        assert_eq!(without.elements_with_role(ElementRole::Logo).count(), 0);
    }

    #[test]
    fn test_vertical_safe_zone_respected() {
        let candidate = LayoutCandidate {
            background: None,
            elements: vec![
                el(ElementKind::Text, ElementRole::Headline, [0.1, 0.0, 0.8, 0.05]),
                el(ElementKind::Text, ElementRole::Price, [0.6, 0.95, 0.3, 0.05]),
            ],
        };
        let spec = assemble_with(candidate, Ratio::Vertical, &content(), None);
        for e in spec.elements.iter().filter(|e| e.is_non_decorative()) {
            assert!(e.rect.y >= 200, "{} enters top band", e.id);
            assert!(e.rect.bottom() <= 1920 - 250, "{} enters bottom band", e.id);
        }
    }

    #[test]
    fn test_full_overlap_is_separated() {
        let candidate = LayoutCandidate {
            background: None,
            elements: vec![
                el(ElementKind::Text, ElementRole::Headline, [0.1, 0.1, 0.8, 0.3]),
                el(ElementKind::Text, ElementRole::Price, [0.2, 0.15, 0.2, 0.1]),
            ],
        };
        let spec = assemble_with(candidate, Ratio::Square, &content(), None);
        let guarded: Vec<_> = spec.elements.iter().filter(|e| e.is_non_decorative()).collect();
        for (i, a) in guarded.iter().enumerate() {
            for b in &guarded[i + 1..] {
                assert!(!a.rect.fully_overlaps(&b.rect), "{} covers {}", a.id, b.id);
            }
        }
        assert!(spec.repairs.iter().any(|r| r.contains("no longer fully overlaps")));
    }

    #[test]
    fn test_low_contrast_substituted_and_fonts_raised() {
        let mut headline = el(ElementKind::Text, ElementRole::Headline, [0.1, 0.1, 0.8, 0.1]);
        headline.color = Some("#EEEEEE".into());
        headline.font_size = Some(9.0);
        let candidate = LayoutCandidate {
            background: Some(CandidateBackground { color: Some("#FFFFFF".into()) }),
            elements: vec![headline],
        };
        let spec = assemble_with(candidate, Ratio::Square, &content(), None);
        for i in 0..spec.elements.len() {
            if let Some(ratio) = spec.text_contrast(i) {
                assert!(ratio >= WCAG_AA_CONTRAST, "{}", spec.elements[i].id);
            }
        }
        let h = spec.elements_with_role(ElementRole::Headline).next().unwrap();
        assert_eq!(h.style.font_size_px, Some(20));
        assert!(spec.repairs.iter().any(|r| r.starts_with("substituted text colour on headline-1")));
    }

    #[test]
    fn test_parse_candidate_rejects_empty_and_prose() {
        assert!(parse_candidate("sorry, I cannot help").unwrap_err().is_malformed());
        assert!(parse_candidate(r#"{"elements": []}"#).unwrap_err().is_malformed());
        assert!(parse_candidate(r#"```json
{"elements":[{"type":"text","x":0,"y":0,"width":0.5,"height":0.1}]}
```"#)
        .is_ok());
    }

    struct Scripted {
        answers: Mutex<VecDeque<Result<String, CapabilityError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: Vec<Result<String, CapabilityError>>) -> Self {
            Self { answers: Mutex::new(answers.into()), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl GenerativeCapability for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate_layout(&self, _prompt: &LayoutPrompt) -> Result<String, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(CapabilityError::Unavailable("script exhausted".into())))
        }

        async fn judge_semantic_match(
            &self,
            _request: &crate::semantic::JudgeRequest,
        ) -> Result<crate::semantic::SemanticJudgement, CapabilityError> {
            Err(CapabilityError::Unavailable("not scripted".into()))
        }
    }

    fn input() -> SynthesisInput {
        SynthesisInput {
            content: Arc::new(content()),
            analysis: Arc::new(AnalysisResult {
                asset_id: AssetId::new("ast_pack"),
                detection: DetectionStatus::Complete,
                detected_objects: vec![],
                product_type: None,
                dominant_colors: vec![],
                has_transparent_background: false,
                foreground: None,
                suggested_scale: 0.6,
                analyzed_at: Utc::now(),
            }),
            palette: ResolvedPalette::default(),
            logo_asset: None,
        }
    }

    const GOOD: &str = r#"{"elements":[{"type":"text","role":"headline","x":0.1,"y":0.1,"width":0.8,"height":0.1}]}"#;

    #[tokio::test]
    async fn test_malformed_then_good_succeeds() {
        let generator = Arc::new(Scripted::new(vec![Ok("not json".into()), Ok(GOOD.into())]));
        let synth = LayoutSynthesizer::new(generator.clone(), Duration::from_secs(1), Duration::from_millis(1));
        let spec = synth.synthesize(&input(), Ratio::Square).await.unwrap();
        assert_eq!(spec.ratio, Ratio::Square);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_malformed_surfaces_error() {
        let generator = Arc::new(Scripted::new(vec![Ok("nope".into()), Ok("still nope".into()), Ok(GOOD.into())]));
        let synth = LayoutSynthesizer::new(generator.clone(), Duration::from_secs(1), Duration::from_millis(1));
        let err = synth.synthesize(&input(), Ratio::Vertical).await.unwrap_err();
        assert!(matches!(err, SynthesisError::LayoutGenerationFailed { ratio: Ratio::Vertical, attempts: 2, .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unavailable_retried_once() {
        let down = || Err(CapabilityError::Unavailable("503".into()));
        let generator = Arc::new(Scripted::new(vec![down(), down(), Ok(GOOD.into())]));
        let synth = LayoutSynthesizer::new(generator.clone(), Duration::from_secs(1), Duration::from_millis(1));
        let err = synth.synthesize(&input(), Ratio::Landscape).await.unwrap_err();
        assert!(matches!(err, SynthesisError::LayoutGenerationFailed { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_mixed_failures_share_one_retry() {
        let generator = Arc::new(Scripted::new(vec![
            Ok("not json".into()),
            Err(CapabilityError::Unavailable("503".into())),
            Ok(GOOD.into()),
        ]));
        let synth = LayoutSynthesizer::new(generator.clone(), Duration::from_secs(1), Duration::from_millis(1));
        let err = synth.synthesize(&input(), Ratio::Square).await.unwrap_err();
        assert!(matches!(err, SynthesisError::LayoutGenerationFailed { attempts: 2, .. }));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

        let generator = Arc::new(Scripted::new(vec![
            Err(CapabilityError::Unavailable("503".into())),
            Ok("not json".into()),
            Ok(GOOD.into()),
        ]));
        let synth = LayoutSynthesizer::new(generator.clone(), Duration::from_secs(1), Duration::from_millis(1));
        assert!(synth.synthesize(&input(), Ratio::Square).await.is_err());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_text_over_background_image_gets_backing_fill() {
        let mut dark = content();
        dark.background.image_asset_id = Some(AssetId::new("ast_dark_bg"));
        let mut headline = el(ElementKind::Text, ElementRole::Headline, [0.1, 0.1, 0.8, 0.1]);
        headline.color = Some("#FFFFFF".into());
        let candidate = LayoutCandidate {
            background: Some(CandidateBackground { color: Some("#FFFFFF".into()) }),
            elements: vec![headline],
        };
        let spec = assemble_with(candidate, Ratio::Square, &dark, None);
        assert_eq!(spec.background.image_ref, Some(AssetId::new("ast_dark_bg")));

        for (i, e) in spec.elements.iter().enumerate().filter(|(_, e)| e.carries_text()) {
            assert!(spec.local_background(i).is_some(), "{} has no solid backdrop", e.id);
            assert!(spec.text_contrast(i).unwrap() >= WCAG_AA_CONTRAST, "{}", e.id);
        }
        let h = spec.elements_with_role(ElementRole::Headline).next().unwrap();
        assert_eq!(h.style.fill, Some(ResolvedPalette::default().background));
        assert!(spec.repairs.iter().any(|r| r.contains("backing fill behind headline-1")));
    }

    #[tokio::test]
    async fn test_invalid_content_is_input_error() {
        let generator = Arc::new(Scripted::new(vec![Ok(GOOD.into())]));
        let synth = LayoutSynthesizer::new(generator.clone(), Duration::from_secs(1), Duration::from_millis(1));
        let mut bad = input();
        bad.content = Arc::new(ContentSpec::default());
        let err = synth.synthesize(&bad, Ratio::Square).await.unwrap_err();
        assert_eq!(err, SynthesisError::InputError(ContentError::MissingHeadline));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }
}

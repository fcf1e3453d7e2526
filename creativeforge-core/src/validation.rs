//! Validation System - Catalog-Driven Compliance
//!
//! Deterministic checks are pure functions of the layout, content and
//! analysis. Semantic checks ask the judge capability with both normalized
//! signals and fail closed when it cannot answer.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capability::{with_timeout, GenerativeCapability};
use crate::catalog::{
    AbsentPolicy, ComplianceRule, DeterministicCheck, Evaluator, RuleCatalog, RuleCategory, SemanticCheck, Severity,
};
use crate::color::Color;
use crate::hashing::compute_input_digest;
use crate::layout::{ElementRole, LayoutSpec, Ratio};
use crate::model::{AnalysisResult, ContentSpec};
use crate::semantic::{alcohol_detected, is_alcohol_label, normalize_claim, normalized_labels, ClaimField, JudgeRequest};
use crate::ENGINE_VERSION;

/// Verdict text for a semantic rule whose capability could not answer.
pub const UNABLE_TO_VERIFY: &str = "unable to verify";

static PRICE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)[£$€₹]\s?\d+(?:[.,]\d+)*|\b\d+(?:[.,]\d+)*\s?(?:gbp|usd|eur|inr)\b|\b\d+\s?p\b|\b(?:was|now|save)\s+[£$€₹]?\d+",
    )
    .expect("price pattern is valid")
});

static PERCENT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)%|\bper\s?cent\b").expect("percent pattern is valid"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    Deterministic,
    Semantic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleVerdict {
    pub rule_id: String,
    pub category: RuleCategory,
    pub severity: Severity,
    pub evaluator: EvaluatorKind,
    pub passed: bool,
    pub explanation: String,
    pub waivable: bool,
}

impl RuleVerdict {
    fn new(rule: &ComplianceRule, passed: bool, explanation: String) -> Self {
        Self {
            rule_id: rule.id.clone(),
            category: rule.category,
            severity: rule.severity,
            evaluator: if rule.evaluator.is_semantic() { EvaluatorKind::Semantic } else { EvaluatorKind::Deterministic },
            passed,
            explanation,
            waivable: rule.waivable(),
        }
    }
}

/// One report per layout evaluation. Never mutated; re-validation produces
/// a new report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    pub report_id: String,
    pub layout_ratio: Ratio,
    pub catalog_version: String,
    pub engine_version: String,
    pub per_rule: Vec<RuleVerdict>,
    /// AND of every rule, regardless of severity.
    pub overall_passed: bool,
    pub input_digest: String,
    pub generated_at: DateTime<Utc>,
}

impl ComplianceReport {
    pub fn from_verdicts(layout_ratio: Ratio, catalog_version: &str, per_rule: Vec<RuleVerdict>, input_digest: String) -> Self {
        Self {
            report_id: format!("rpt_{}", Uuid::new_v4().simple()),
            layout_ratio,
            catalog_version: catalog_version.to_string(),
            engine_version: ENGINE_VERSION.to_string(),
            overall_passed: per_rule.iter().all(|v| v.passed),
            per_rule,
            input_digest,
            generated_at: Utc::now(),
        }
    }

    pub fn verdict(&self, rule_id: &str) -> Option<&RuleVerdict> {
        self.per_rule.iter().find(|v| v.rule_id == rule_id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RuleVerdict> {
        self.per_rule.iter().filter(|v| !v.passed)
    }
}

/// Inputs to deterministic checks.
pub struct CheckContext<'a> {
    pub layout: &'a LayoutSpec,
    pub content: &'a ContentSpec,
    pub analysis: &'a AnalysisResult,
    pub min_label_confidence: f32,
}

fn pass(explanation: impl Into<String>) -> (bool, String) {
    (true, explanation.into())
}

fn fail(explanation: impl Into<String>) -> (bool, String) {
    (false, explanation.into())
}

/// Keyword occurrence starting on a word boundary. A trailing `*` makes the
/// keyword a stem; otherwise it must also end on a boundary.
pub fn contains_keyword(text: &str, keyword: &str) -> bool {
    let text = text.to_lowercase();
    let (needle, stem) = match keyword.strip_suffix('*') {
        Some(s) => (s.to_lowercase(), true),
        None => (keyword.to_lowercase(), false),
    };
    if needle.is_empty() {
        return false;
    }
    text.match_indices(&needle).any(|(at, m)| {
        let before = text[..at].chars().next_back().map_or(true, |c| !c.is_alphanumeric());
        let after = stem || text[at + m.len()..].chars().next().map_or(true, |c| !c.is_alphanumeric());
        before && after
    })
}

/// Evaluate one deterministic check. Pure.
pub fn evaluate_check(check: &DeterministicCheck, ctx: &CheckContext<'_>) -> (bool, String) {
    let layout = ctx.layout;
    let canvas = layout.ratio.canvas();
    let texts = || layout.elements.iter().filter_map(|e| e.text().map(|t| (e, t)));

    match check {
        DeterministicCheck::WithinCanvas => {
            if !layout.canvas_matches_ratio() {
                return fail(format!(
                    "declared canvas {}x{} does not match {} ({}x{})",
                    layout.canvas.width, layout.canvas.height, layout.ratio, canvas.width, canvas.height
                ));
            }
            let out: Vec<&str> = layout
                .elements
                .iter()
                .filter(|e| !e.rect.within(&canvas))
                .map(|e| e.id.as_str())
                .collect();
            if out.is_empty() {
                pass(format!("all {} elements inside the {}x{} canvas", layout.elements.len(), canvas.width, canvas.height))
            } else {
                fail(format!("outside the {}x{} canvas: {}", canvas.width, canvas.height, out.join(", ")))
            }
        }

        DeterministicCheck::NoFullOverlap => {
            let guarded: Vec<_> = layout.elements.iter().filter(|e| e.is_non_decorative()).collect();
            let mut pairs = Vec::new();
            for (i, a) in guarded.iter().enumerate() {
                for b in &guarded[i + 1..] {
                    if a.rect.fully_overlaps(&b.rect) {
                        pairs.push(format!("{} and {}", a.id, b.id));
                    }
                }
            }
            if pairs.is_empty() {
                pass("no text, logo or value tile is fully covered")
            } else {
                fail(format!("fully overlapping: {}", pairs.join("; ")))
            }
        }

        DeterministicCheck::SafeZone => {
            let Some((top, bottom)) = layout.ratio.safe_zone() else {
                return pass(format!("no safe zone applies to {}", layout.ratio));
            };
            let limit = canvas.height.saturating_sub(bottom) as u64;
            let out: Vec<&str> = layout
                .elements
                .iter()
                .filter(|e| e.is_non_decorative() && (e.rect.y < top || e.rect.bottom() > limit))
                .map(|e| e.id.as_str())
                .collect();
            if out.is_empty() {
                pass(format!("top {top}px and bottom {bottom}px are clear"))
            } else {
                fail(format!("inside the top {top}px / bottom {bottom}px safe zone: {}", out.join(", ")))
            }
        }

        DeterministicCheck::LogoPresentOnce => {
            let logos = layout.elements_with_role(ElementRole::Logo).count();
            match &layout.logo_asset {
                None => pass("no logo supplied"),
                Some(id) => {
                    let matching = layout
                        .elements_with_role(ElementRole::Logo)
                        .filter(|e| e.style.asset_ref.as_ref() == Some(id))
                        .count();
                    match (logos, matching) {
                        (1, 1) => pass(format!("logo {id} appears once")),
                        (0, _) => fail(format!("supplied logo {id} does not appear")),
                        (1, 0) => fail(format!("logo element does not reference supplied logo {id}")),
                        (n, _) => fail(format!("logo appears in {n} elements")),
                    }
                }
            }
        }

        DeterministicCheck::LogoMinArea { min_fraction } => {
            let total = canvas.area().max(1) as f64;
            let small: Vec<String> = layout
                .elements_with_role(ElementRole::Logo)
                .filter_map(|e| {
                    let frac = e.rect.area() as f64 / total;
                    (frac < *min_fraction).then(|| format!("{} covers {:.2}%", e.id, frac * 100.0))
                })
                .collect();
            if layout.elements_with_role(ElementRole::Logo).next().is_none() {
                pass("no logo element")
            } else if small.is_empty() {
                pass(format!("logo covers at least {:.2}% of the canvas", min_fraction * 100.0))
            } else {
                fail(format!("{} (minimum {:.2}%)", small.join(", "), min_fraction * 100.0))
            }
        }

        DeterministicCheck::BrandColorsUsed => {
            let brand: Vec<_> = ctx.content.brand_colors.iter().collect();
            if brand.is_empty() {
                return pass("no brand colours supplied");
            }
            let used = std::iter::once(layout.background.color).chain(
                layout
                    .elements
                    .iter()
                    .flat_map(|e| [e.style.fill, e.style.text_color].into_iter().flatten()),
            );
            let used: Vec<_> = used.collect();
            match brand.iter().find(|c| used.contains(c)) {
                Some(c) => pass(format!("brand colour {c} is used")),
                None => fail(format!(
                    "none of the brand colours {} appear",
                    brand.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                )),
            }
        }

        DeterministicCheck::PricePresent { when_absent } => match ctx.content.price() {
            None => match when_absent {
                AbsentPolicy::Fail => fail("no price supplied and this catalog requires one"),
                AbsentPolicy::Pass => pass("no price supplied; price is optional in this catalog"),
            },
            Some(price) => {
                let shown = layout
                    .elements_with_role(ElementRole::Price)
                    .any(|e| e.text().map_or(false, |t| t.contains(price)));
                if shown {
                    pass(format!("value tile shows {price}"))
                } else {
                    fail(format!("price {price} supplied but no value tile shows it"))
                }
            }
        },

        DeterministicCheck::PriceOnlyInValueTile => {
            let found: Vec<String> = texts()
                .filter(|(e, _)| e.role != ElementRole::Price)
                .filter_map(|(e, t)| PRICE_TOKEN.find(t).map(|m| format!("'{}' in {}", m.as_str(), e.id)))
                .collect();
            if found.is_empty() {
                pass("no price-like text outside the value tile")
            } else {
                fail(format!("price-like text outside the value tile: {}", found.join(", ")))
            }
        }

        DeterministicCheck::NoPercentages => {
            let found: Vec<String> = texts()
                .filter_map(|(e, t)| PERCENT_TOKEN.find(t).map(|m| format!("'{}' in {}", m.as_str(), e.id)))
                .collect();
            if found.is_empty() {
                pass("no percentages")
            } else {
                fail(format!("percentages are not allowed: {}", found.join(", ")))
            }
        }

        DeterministicCheck::RestrictedCopy { keywords } => {
            let found: Vec<String> = texts()
                .filter(|(e, _)| e.role != ElementRole::Price)
                .flat_map(|(e, t)| {
                    keywords
                        .iter()
                        .filter(move |k| contains_keyword(t, k))
                        .map(move |k| format!("'{}' in {}", k.trim_end_matches('*'), e.id))
                })
                .collect();
            if found.is_empty() {
                pass("no restricted copy")
            } else {
                fail(format!("restricted copy: {}", found.join(", ")))
            }
        }

        DeterministicCheck::DrinkawareLockup => {
            let has_lockup = layout
                .elements_with_role(ElementRole::Drinkaware)
                .any(|e| e.text().map_or(false, |t| t.to_lowercase().contains("drinkaware")));
            if !ctx.analysis.detection_complete() {
                return if has_lockup {
                    pass("Drinkaware lock-up present")
                } else {
                    fail("cannot rule out alcohol: object detection was unavailable and no Drinkaware lock-up is present")
                };
            }
            if !alcohol_detected(ctx.analysis, ctx.min_label_confidence) {
                return pass("no alcohol detected");
            }
            let seen: Vec<&str> = ctx
                .analysis
                .detected_objects
                .iter()
                .filter(|o| o.confidence >= ctx.min_label_confidence && is_alcohol_label(&o.label))
                .map(|o| o.label.as_str())
                .collect();
            let seen = if seen.is_empty() { "product type".to_string() } else { seen.join(", ") };
            if has_lockup {
                pass(format!("alcohol detected ({seen}); Drinkaware lock-up present"))
            } else {
                fail(format!("alcohol detected ({seen}) but no Drinkaware lock-up"))
            }
        }

        DeterministicCheck::TextContrast { min_ratio } => {
            let mut checked = 0;
            let mut low = Vec::new();
            for (i, element) in layout.elements.iter().enumerate().filter(|(_, e)| e.carries_text()) {
                checked += 1;
                let Some(backdrop) = layout.local_background(i) else {
                    low.push(format!("{} sits over an image with no backing fill", element.id));
                    continue;
                };
                let fg = element.style.text_color.unwrap_or(Color::BLACK);
                let ratio = fg.contrast_ratio(&backdrop);
                if ratio < *min_ratio {
                    low.push(format!("{} {:.2}:1 against {}", element.id, ratio, backdrop));
                }
            }
            if low.is_empty() {
                pass(format!("all {checked} text elements at least {min_ratio}:1"))
            } else {
                fail(format!("below {min_ratio}:1: {}", low.join(", ")))
            }
        }

        DeterministicCheck::MinFontSize => {
            let small: Vec<String> = texts()
                .filter_map(|(e, _)| {
                    let min = e.role.min_font_px();
                    match e.style.font_size_px {
                        None => Some(format!("{} has no font size", e.id)),
                        Some(px) if px < min => Some(format!("{} is {px}px (minimum {min}px)", e.id)),
                        Some(_) => None,
                    }
                })
                .collect();
            if small.is_empty() {
                pass("all text meets minimum font sizes")
            } else {
                fail(small.join(", "))
            }
        }
    }
}

/// Deterministic rules of `catalog`, in catalog order. Semantic rules are
/// skipped.
pub fn evaluate_deterministic(catalog: &RuleCatalog, ctx: &CheckContext<'_>) -> Vec<RuleVerdict> {
    catalog
        .rules
        .iter()
        .filter_map(|rule| match &rule.evaluator {
            Evaluator::Deterministic(check) => {
                let (passed, explanation) = evaluate_check(check, ctx);
                Some(RuleVerdict::new(rule, passed, explanation))
            }
            Evaluator::Semantic(_) => None,
        })
        .collect()
}

/// Normalized claim/label pair sent to the judge, or `None` when there is
/// nothing to compare.
pub fn judge_request(content: &ContentSpec, analysis: &AnalysisResult, min_confidence: f32) -> Option<JudgeRequest> {
    let mut claims = vec![normalize_claim(ClaimField::Headline, &content.headline)];
    if let Some(sub) = content.subheadline() {
        claims.push(normalize_claim(ClaimField::Subheadline, sub));
    }
    if let Some(desc) = content.description() {
        claims.push(normalize_claim(ClaimField::Description, desc));
    }
    claims.retain(|c| !c.terms.is_empty());
    let labels = normalized_labels(analysis, min_confidence);
    if claims.is_empty() || labels.is_empty() {
        return None;
    }
    Some(JudgeRequest { claims, labels })
}

pub struct ComplianceValidator {
    catalog: Arc<RuleCatalog>,
    judge: Arc<dyn GenerativeCapability>,
    timeout: Duration,
    backoff: Duration,
    min_label_confidence: f32,
}

impl ComplianceValidator {
    pub fn new(catalog: Arc<RuleCatalog>, judge: Arc<dyn GenerativeCapability>, timeout: Duration, backoff: Duration) -> Self {
        Self { catalog, judge, timeout, backoff, min_label_confidence: 0.3 }
    }

    pub fn with_min_label_confidence(mut self, min: f32) -> Self {
        self.min_label_confidence = min;
        self
    }

    pub fn catalog(&self) -> &Arc<RuleCatalog> {
        &self.catalog
    }

    /// Evaluate every rule of the catalog. Always returns a report: a
    /// failed rule is a verdict, not an error.
    pub async fn validate(&self, layout: &LayoutSpec, content: &ContentSpec, analysis: &AnalysisResult) -> ComplianceReport {
        let ctx = CheckContext { layout, content, analysis, min_label_confidence: self.min_label_confidence };
        let mut per_rule = Vec::with_capacity(self.catalog.rules.len());
        for rule in &self.catalog.rules {
            let (passed, explanation) = match &rule.evaluator {
                Evaluator::Deterministic(check) => evaluate_check(check, &ctx),
                Evaluator::Semantic(check) => self.evaluate_semantic(check, content, analysis).await,
            };
            if !passed {
                debug!(rule = %rule.id, ratio = %layout.ratio, %explanation, "rule failed");
            }
            per_rule.push(RuleVerdict::new(rule, passed, explanation));
        }

        let input_digest = compute_input_digest(layout, content, analysis, &self.catalog.catalog_version)
            .unwrap_or_else(|e| {
                warn!(error = %e, "input digest unavailable");
                String::new()
            });
        let report = ComplianceReport::from_verdicts(layout.ratio, &self.catalog.catalog_version, per_rule, input_digest);
        info!(
            ratio = %layout.ratio,
            report_id = %report.report_id,
            overall_passed = report.overall_passed,
            failed = report.failures().count(),
            "layout validated"
        );
        report
    }

    async fn evaluate_semantic(&self, check: &SemanticCheck, content: &ContentSpec, analysis: &AnalysisResult) -> (bool, String) {
        match check {
            SemanticCheck::ClaimMatchesProduct { min_confidence } => {
                if !analysis.detection_complete() {
                    return fail(format!("{UNABLE_TO_VERIFY}: object detection was unavailable for this asset"));
                }
                let Some(request) = judge_request(content, analysis, *min_confidence as f32) else {
                    return pass("nothing to compare: no product claim or no confidently detected object");
                };

                for attempt in 1..=2u32 {
                    match with_timeout(self.timeout, self.judge.judge_semantic_match(&request)).await {
                        Ok(judgement) => {
                            let mut explanation = judgement.explanation;
                            if !judgement.aligned && !explanation.contains("detected objects are") {
                                let mismatch = request.describe_mismatch();
                                explanation = if explanation.trim().is_empty() {
                                    mismatch
                                } else {
                                    format!("{explanation}; {mismatch}")
                                };
                            }
                            return (judgement.aligned, explanation);
                        }
                        Err(e) => {
                            warn!(attempt, provider = self.judge.name(), error = %e, "semantic judgement failed");
                            if attempt == 1 {
                                tokio::time::sleep(self.backoff).await;
                            }
                        }
                    }
                }
                fail(UNABLE_TO_VERIFY)
            }
        }
    }
}

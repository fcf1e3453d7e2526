//! Rule Catalog - Versioned Compliance Contracts
//!
//! Rules are data: each entry names a deterministic or semantic evaluator
//! plus its parameters. The validator interprets the catalog; it has no
//! per-rule branching of its own.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::ENGINE_VERSION;

pub type RuleId = String;

pub const BUILTIN_CATALOG_VERSION: &str = "2024.11.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RuleCategory {
    Layout,
    Brand,
    Legal,
    Accessibility,
    ContentConsistency,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// What a conditional rule reports when its subject is absent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbsentPolicy {
    /// The absence itself is a failure.
    Fail,
    /// Vacuously satisfied. Must be chosen explicitly in the catalog.
    Pass,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "check", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DeterministicCheck {
    WithinCanvas,
    /// No text, logo or value tile completely covers another.
    NoFullOverlap,
    SafeZone,
    LogoPresentOnce,
    LogoMinArea { min_fraction: f64 },
    BrandColorsUsed,
    PricePresent { when_absent: AbsentPolicy },
    PriceOnlyInValueTile,
    NoPercentages,
    /// Keywords are matched on word starts; a trailing `*` matches any suffix.
    RestrictedCopy { keywords: Vec<String> },
    DrinkawareLockup,
    TextContrast { min_ratio: f64 },
    MinFontSize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "check", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SemanticCheck {
    /// Headline and subheadline claims agree with the detected product.
    ClaimMatchesProduct { min_confidence: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evaluator {
    Deterministic(DeterministicCheck),
    Semantic(SemanticCheck),
}

impl Evaluator {
    pub fn is_semantic(&self) -> bool {
        matches!(self, Evaluator::Semantic(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceRule {
    pub id: RuleId,
    pub category: RuleCategory,
    pub description: String,
    pub severity: Severity,
    pub evaluator: Evaluator,
}

impl ComplianceRule {
    /// Legal rules and errors are never auto-waivable.
    pub fn waivable(&self) -> bool {
        self.category != RuleCategory::Legal && self.severity != Severity::Error
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read rule catalog: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse rule catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Rule catalog has no rules")]
    Empty,

    #[error("Duplicate rule id: {0}")]
    DuplicateRuleId(String),

    #[error("Invalid version string: {0}")]
    InvalidVersion(String),

    #[error("Catalog {catalog} requires engine >= {required}, current is {current}")]
    EngineVersionMismatch { catalog: String, required: String, current: String },
}

/// Immutable, versioned set of rules. Loaded once at start-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuleCatalog {
    pub catalog_version: String,
    pub engine_min_version: String,
    pub rules: Vec<ComplianceRule>,
}

fn rule(id: &str, category: RuleCategory, severity: Severity, description: &str, evaluator: Evaluator) -> ComplianceRule {
    ComplianceRule {
        id: id.to_string(),
        category,
        description: description.to_string(),
        severity,
        evaluator,
    }
}

pub const RESTRICTED_KEYWORDS: &[&str] = &[
    "t&c",
    "t&cs",
    "terms and conditions",
    "win",
    "prize",
    "competition",
    "guarantee*",
    "money-back",
    "money back",
    "sustainab*",
    "green",
    "charity",
    "best",
    "#1",
    "free trial",
];

impl RuleCatalog {
    /// The retailer rule set (Appendix A and B).
    pub fn builtin() -> Self {
        use DeterministicCheck as D;
        use Evaluator::{Deterministic, Semantic};
        use RuleCategory::*;
        use Severity::*;

        Self {
            catalog_version: BUILTIN_CATALOG_VERSION.to_string(),
            engine_min_version: "1.0.0".to_string(),
            rules: vec![
                rule("within-canvas", Layout, Error, "Every element lies inside the canvas", Deterministic(D::WithinCanvas)),
                rule(
                    "no-full-overlap",
                    Layout,
                    Error,
                    "No text, logo or value tile is completely covered by another",
                    Deterministic(D::NoFullOverlap),
                ),
                rule(
                    "safe-zone",
                    Layout,
                    Error,
                    "9:16 creatives keep the top 200px and bottom 250px free of text, logos and value tiles",
                    Deterministic(D::SafeZone),
                ),
                rule(
                    "logo-present-once",
                    Brand,
                    Error,
                    "A supplied logo appears in exactly one element",
                    Deterministic(D::LogoPresentOnce),
                ),
                rule(
                    "logo-min-area",
                    Brand,
                    Warning,
                    "Logo covers at least 0.5% of the canvas",
                    Deterministic(D::LogoMinArea { min_fraction: 0.005 }),
                ),
                rule(
                    "brand-colors-used",
                    Brand,
                    Warning,
                    "Supplied brand colours appear on the creative",
                    Deterministic(D::BrandColorsUsed),
                ),
                rule(
                    "price-present",
                    Legal,
                    Error,
                    "A value tile carries the price; a creative without a price does not pass",
                    Deterministic(D::PricePresent { when_absent: AbsentPolicy::Fail }),
                ),
                rule(
                    "price-only-in-value-tile",
                    Legal,
                    Error,
                    "Prices and currency appear only inside the value tile",
                    Deterministic(D::PriceOnlyInValueTile),
                ),
                rule("no-percentages", Legal, Error, "Percentages never appear on the creative", Deterministic(D::NoPercentages)),
                rule(
                    "restricted-copy",
                    Legal,
                    Error,
                    "No competition, guarantee, sustainability, charity or superlative claims",
                    Deterministic(D::RestrictedCopy {
                        keywords: RESTRICTED_KEYWORDS.iter().map(|k| k.to_string()).collect(),
                    }),
                ),
                rule(
                    "drinkaware-lockup",
                    Legal,
                    Error,
                    "Creatives showing alcohol carry a Drinkaware lock-up",
                    Deterministic(D::DrinkawareLockup),
                ),
                rule(
                    "text-contrast",
                    Accessibility,
                    Error,
                    "Text meets WCAG AA contrast (4.5:1) against its local background",
                    Deterministic(D::TextContrast { min_ratio: crate::color::WCAG_AA_CONTRAST }),
                ),
                rule(
                    "min-font-size",
                    Accessibility,
                    Error,
                    "Headline and subheadline at least 20px, other text at least 12px",
                    Deterministic(D::MinFontSize),
                ),
                rule(
                    "claim-matches-product",
                    ContentConsistency,
                    Error,
                    "Headline and subheadline describe the product shown in the image",
                    Semantic(SemanticCheck::ClaimMatchesProduct { min_confidence: 0.3 }),
                ),
            ],
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let catalog: RuleCatalog = serde_json::from_str(json)?;
        catalog.check()?;
        Ok(catalog)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Reject empty catalogs, duplicate ids and catalogs newer than the engine.
    pub fn check(&self) -> Result<(), CatalogError> {
        if self.rules.is_empty() {
            return Err(CatalogError::Empty);
        }
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                return Err(CatalogError::DuplicateRuleId(rule.id.clone()));
            }
        }

        let engine = semver::Version::parse(ENGINE_VERSION)
            .map_err(|_| CatalogError::InvalidVersion(ENGINE_VERSION.to_string()))?;
        let min = semver::Version::parse(&self.engine_min_version)
            .map_err(|_| CatalogError::InvalidVersion(self.engine_min_version.clone()))?;
        if engine < min {
            return Err(CatalogError::EngineVersionMismatch {
                catalog: self.catalog_version.clone(),
                required: self.engine_min_version.clone(),
                current: ENGINE_VERSION.to_string(),
            });
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ComplianceRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn list(&self) -> &[ComplianceRule] {
        &self.rules
    }
}

impl Default for RuleCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

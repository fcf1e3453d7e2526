//! Shared vocabulary for mismatch detection.
//!
//! Vision labels ("soda_can") and copy ("Rich Chocolate Taste") are both
//! reduced to normalized terms and product categories before any judge sees
//! them, so a verdict can be reproduced from the stored inputs alone.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::model::AnalysisResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductCategory {
    Beverage,
    Alcohol,
    Confectionery,
    Snack,
    Dairy,
    Bakery,
    Produce,
    Meat,
    Frozen,
    PersonalCare,
    Household,
    Pet,
    Baby,
}

impl ProductCategory {
    /// Categories that can describe the same product.
    fn family(&self) -> u8 {
        match self {
            ProductCategory::Beverage | ProductCategory::Alcohol => 1,
            ProductCategory::Confectionery | ProductCategory::Snack | ProductCategory::Bakery => 2,
            other => 10 + *other as u8,
        }
    }

    pub fn compatible_with(&self, other: &ProductCategory) -> bool {
        self.family() == other.family()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Beverage => "beverage",
            Alcohol => "alcohol",
            Confectionery => "confectionery",
            Snack => "snack",
            Dairy => "dairy",
            Bakery => "bakery",
            Produce => "produce",
            Meat => "meat",
            Frozen => "frozen",
            PersonalCare => "personal_care",
            Household => "household",
            Pet => "pet",
            Baby => "baby",
        }
    }
}

impl fmt::Display for ProductCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use ProductCategory::*;

/// Singular terms and short phrases mapped to categories. Multi-word entries
/// match as whole phrases.
const LEXICON: &[(&str, ProductCategory)] = &[
    ("ice cream", Frozen),
    ("dog food", Pet),
    ("cat food", Pet),
    ("soft drink", Beverage),
    ("energy drink", Beverage),
    ("soda", Beverage),
    ("cola", Beverage),
    ("lemonade", Beverage),
    ("juice", Beverage),
    ("water", Beverage),
    ("coffee", Beverage),
    ("tea", Beverage),
    ("smoothie", Beverage),
    ("drink", Beverage),
    ("beverage", Beverage),
    ("beer", Alcohol),
    ("lager", Alcohol),
    ("ale", Alcohol),
    ("cider", Alcohol),
    ("wine", Alcohol),
    ("prosecco", Alcohol),
    ("champagne", Alcohol),
    ("vodka", Alcohol),
    ("gin", Alcohol),
    ("rum", Alcohol),
    ("whisky", Alcohol),
    ("whiskey", Alcohol),
    ("tequila", Alcohol),
    ("liqueur", Alcohol),
    ("spirit", Alcohol),
    ("alcohol", Alcohol),
    ("chocolate", Confectionery),
    ("candy", Confectionery),
    ("sweet", Confectionery),
    ("toffee", Confectionery),
    ("caramel", Confectionery),
    ("gum", Confectionery),
    ("lollipop", Confectionery),
    ("crisp", Snack),
    ("chip", Snack),
    ("popcorn", Snack),
    ("pretzel", Snack),
    ("nut", Snack),
    ("cracker", Snack),
    ("milk", Dairy),
    ("cheese", Dairy),
    ("yogurt", Dairy),
    ("yoghurt", Dairy),
    ("butter", Dairy),
    ("bread", Bakery),
    ("cake", Bakery),
    ("biscuit", Bakery),
    ("cookie", Bakery),
    ("croissant", Bakery),
    ("muffin", Bakery),
    ("apple", Produce),
    ("banana", Produce),
    ("strawberry", Produce),
    ("tomato", Produce),
    ("avocado", Produce),
    ("lettuce", Produce),
    ("grape", Produce),
    ("chicken", Meat),
    ("beef", Meat),
    ("bacon", Meat),
    ("sausage", Meat),
    ("ham", Meat),
    ("pizza", Frozen),
    ("shampoo", PersonalCare),
    ("soap", PersonalCare),
    ("toothpaste", PersonalCare),
    ("deodorant", PersonalCare),
    ("lotion", PersonalCare),
    ("detergent", Household),
    ("bleach", Household),
    ("cleaner", Household),
    ("nappy", Baby),
    ("diaper", Baby),
];

/// Words that carry no product meaning in ad copy.
const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "of", "for", "with", "in", "on", "at", "to", "your", "our", "you",
    "new", "now", "rich", "taste", "tasty", "delicious", "great", "fresh", "refreshing", "real",
    "pure", "perfect", "every", "day", "time", "try", "get", "it", "is", "its", "this", "that",
];

/// Lowercase, turn separators into spaces, strip punctuation.
pub fn normalize_text(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '&' || c == '%' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn singular(token: &str) -> &str {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        &token[..token.len() - 1]
    } else {
        token
    }
}

fn term_matches(token: &str, entry: &str) -> bool {
    if token == entry || singular(token) == entry {
        return true;
    }
    entry
        .strip_suffix('y')
        .map_or(false, |stem| token.strip_suffix("ies") == Some(stem))
}

/// Categories mentioned anywhere in normalized text.
pub fn categorize(normalized: &str) -> BTreeSet<ProductCategory> {
    let tokens: Vec<&str> = normalized.split_whitespace().collect();
    let mut found = BTreeSet::new();
    for (entry, category) in LEXICON {
        let hit = if entry.contains(' ') {
            format!(" {normalized} ").contains(&format!(" {entry} "))
        } else {
            tokens.iter().any(|t| term_matches(t, entry))
        };
        if hit {
            found.insert(*category);
        }
    }
    found
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedLabel {
    pub raw: String,
    pub label: String,
    pub categories: BTreeSet<ProductCategory>,
    pub confidence: f32,
}

pub fn normalize_label(raw: &str, confidence: f32) -> NormalizedLabel {
    let label = normalize_text(raw);
    NormalizedLabel {
        raw: raw.to_string(),
        categories: categorize(&label),
        label,
        confidence,
    }
}

/// Detected objects at or above `min_confidence`, normalized.
pub fn normalized_labels(analysis: &AnalysisResult, min_confidence: f32) -> Vec<NormalizedLabel> {
    analysis
        .detected_objects
        .iter()
        .filter(|o| o.confidence >= min_confidence && !o.label.trim().is_empty())
        .map(|o| normalize_label(&o.label, o.confidence))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimField {
    Headline,
    Subheadline,
    Description,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedClaim {
    pub field: ClaimField,
    pub text: String,
    pub terms: Vec<String>,
    pub categories: BTreeSet<ProductCategory>,
}

pub fn normalize_claim(field: ClaimField, text: &str) -> NormalizedClaim {
    let normalized = normalize_text(text);
    let terms = normalized
        .split_whitespace()
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect();
    NormalizedClaim {
        field,
        text: text.trim().to_string(),
        terms,
        categories: categorize(&normalized),
    }
}

/// Both signals, explicitly, for a semantic-match judgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeRequest {
    pub claims: Vec<NormalizedClaim>,
    pub labels: Vec<NormalizedLabel>,
}

impl JudgeRequest {
    pub fn claimed_categories(&self) -> BTreeSet<ProductCategory> {
        self.claims.iter().flat_map(|c| c.categories.iter().copied()).collect()
    }

    pub fn detected_categories(&self) -> BTreeSet<ProductCategory> {
        self.labels.iter().flat_map(|l| l.categories.iter().copied()).collect()
    }

    /// Human-readable summary of what the copy claims vs what was seen.
    pub fn describe_mismatch(&self) -> String {
        let claimed: Vec<String> = self
            .claims
            .iter()
            .flat_map(|c| c.terms.iter().filter(|t| !categorize(t).is_empty()).cloned())
            .collect();
        let claimed = if claimed.is_empty() {
            self.claims.iter().map(|c| c.text.clone()).collect::<Vec<_>>().join(" / ")
        } else {
            claimed.join(", ")
        };
        let seen: Vec<String> = self
            .labels
            .iter()
            .map(|l| format!("{} ({:.2})", l.label, l.confidence))
            .collect();
        let cats = |set: BTreeSet<ProductCategory>| {
            set.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        };
        format!(
            "copy claims '{}' [{}] but detected objects are {} [{}]",
            claimed,
            cats(self.claimed_categories()),
            seen.join(", "),
            cats(self.detected_categories()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticJudgement {
    pub aligned: bool,
    #[serde(default)]
    pub explanation: String,
}

/// Deterministic lexicon judgement used by the offline provider.
pub fn lexicon_judgement(request: &JudgeRequest) -> SemanticJudgement {
    let claimed = request.claimed_categories();
    let detected = request.detected_categories();
    if claimed.is_empty() {
        return SemanticJudgement {
            aligned: true,
            explanation: "copy makes no product-category claim".into(),
        };
    }
    if detected.is_empty() {
        return SemanticJudgement {
            aligned: true,
            explanation: "detected objects carry no product category to contradict the copy".into(),
        };
    }
    let aligned = claimed.iter().any(|c| detected.iter().any(|d| c.compatible_with(d)));
    let explanation = if aligned {
        "claimed product category matches detected objects".to_string()
    } else {
        format!("mismatch: {}", request.describe_mismatch())
    };
    SemanticJudgement { aligned, explanation }
}

pub fn is_alcohol_label(raw: &str) -> bool {
    categorize(&normalize_text(raw)).contains(&Alcohol)
}

/// Any confident detected object or the product type names an alcoholic drink.
pub fn alcohol_detected(analysis: &AnalysisResult, min_confidence: f32) -> bool {
    analysis
        .detected_objects
        .iter()
        .any(|o| o.confidence >= min_confidence && is_alcohol_label(&o.label))
        || analysis.product_type.as_deref().map_or(false, is_alcohol_label)
}

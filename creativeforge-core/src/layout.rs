//! Layout specifications: ratios, canvases and positioned elements.
//!
//! A `LayoutSpec` is fully self-contained: everything needed to validate or
//! rasterize it is in the value itself or referenced by asset id.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::color::Color;
use crate::model::AssetId;

/// Target aspect ratio. Canvas sizes follow the retailer's delivery presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Ratio {
    #[serde(rename = "1:1", alias = "square")]
    Square,
    #[serde(rename = "9:16", alias = "vertical")]
    Vertical,
    #[serde(rename = "1.91:1", alias = "landscape")]
    Landscape,
}

impl Ratio {
    pub const ALL: [Ratio; 3] = [Ratio::Square, Ratio::Vertical, Ratio::Landscape];

    pub fn canvas(&self) -> Canvas {
        match self {
            Ratio::Square => Canvas { width: 1080, height: 1080 },
            Ratio::Vertical => Canvas { width: 1080, height: 1920 },
            Ratio::Landscape => Canvas { width: 1200, height: 628 },
        }
    }

    /// Vertical bands (top, bottom) in pixels that must stay clear of text,
    /// logos and value tiles.
    pub fn safe_zone(&self) -> Option<(u32, u32)> {
        match self {
            Ratio::Vertical => Some((200, 250)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Ratio::Square => "1:1",
            Ratio::Vertical => "9:16",
            Ratio::Landscape => "1.91:1",
        }
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ratio {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1:1" | "square" => Ok(Ratio::Square),
            "9:16" | "vertical" => Ok(Ratio::Vertical),
            "1.91:1" | "landscape" => Ok(Ratio::Landscape),
            other => Err(format!("unknown ratio '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

impl Canvas {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn bounds(&self) -> Rect {
        Rect { x: 0, y: 0, width: self.width, height: self.height }
    }
}

/// Pixel rectangle on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Build from canvas fractions.
    pub fn from_fractions(canvas: &Canvas, x: f64, y: f64, w: f64, h: f64) -> Self {
        let px = |v: f64, total: u32| (v * total as f64).round().max(0.0) as u32;
        Self {
            x: px(x, canvas.width),
            y: px(y, canvas.height),
            width: px(w, canvas.width),
            height: px(h, canvas.height),
        }
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn within(&self, canvas: &Canvas) -> bool {
        self.right() <= canvas.width as u64 && self.bottom() <= canvas.height as u64
    }

    pub fn intersection_area(&self, other: &Rect) -> u64 {
        let left = self.x.max(other.x) as u64;
        let top = self.y.max(other.y) as u64;
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            0
        } else {
            (right - left) * (bottom - top)
        }
    }

    /// `other` lies entirely inside `self`.
    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x && other.y >= self.y && other.right() <= self.right() && other.bottom() <= self.bottom()
    }

    /// One of the two rectangles is completely covered by the other.
    pub fn fully_overlaps(&self, other: &Rect) -> bool {
        !self.is_empty() && !other.is_empty() && (self.contains(other) || other.contains(self))
    }

    /// Shift and shrink so the rectangle fits inside `canvas`.
    pub fn clamped_to(&self, canvas: &Canvas) -> Rect {
        let width = self.width.min(canvas.width);
        let height = self.height.min(canvas.height);
        Rect {
            x: self.x.min(canvas.width - width),
            y: self.y.min(canvas.height - height),
            width,
            height,
        }
    }
}

/// Element type as consumed by the builder UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Text,
    Image,
    Logo,
    Shape,
}

/// What an element is for on the creative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementRole {
    Headline,
    Subheadline,
    Description,
    Tag,
    /// Value tile carrying price and offer copy.
    Price,
    Packshot,
    Logo,
    Drinkaware,
    Decoration,
}

impl ElementRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementRole::Headline => "headline",
            ElementRole::Subheadline => "subheadline",
            ElementRole::Description => "description",
            ElementRole::Tag => "tag",
            ElementRole::Price => "price",
            ElementRole::Packshot => "packshot",
            ElementRole::Logo => "logo",
            ElementRole::Drinkaware => "drinkaware",
            ElementRole::Decoration => "decoration",
        }
    }

    /// Smallest legible font size for text in this role.
    pub fn min_font_px(&self) -> u32 {
        match self {
            ElementRole::Headline | ElementRole::Subheadline => 20,
            _ => 12,
        }
    }

    pub fn default_for(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Text => ElementRole::Description,
            ElementKind::Image => ElementRole::Packshot,
            ElementKind::Logo => ElementRole::Logo,
            ElementKind::Shape => ElementRole::Decoration,
        }
    }
}

impl fmt::Display for ElementRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_color: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_size_px: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_ref: Option<AssetId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutElement {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub role: ElementRole,
    pub rect: Rect,
    #[serde(default)]
    pub style: StyleRefs,
}

impl LayoutElement {
    /// Text, logos and the value tile must never be fully covered.
    pub fn is_non_decorative(&self) -> bool {
        matches!(self.kind, ElementKind::Text | ElementKind::Logo)
            || matches!(self.role, ElementRole::Price | ElementRole::Drinkaware)
    }

    pub fn text(&self) -> Option<&str> {
        self.style.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    pub fn carries_text(&self) -> bool {
        self.text().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundRef {
    pub color: Color,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<AssetId>,
}

/// One creative for one ratio. Elements are listed back to front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSpec {
    pub ratio: Ratio,
    pub canvas: Canvas,
    pub elements: Vec<LayoutElement>,
    pub background: BackgroundRef,
    /// Logo asset requested at synthesis time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_asset: Option<AssetId>,
    /// Adjustments the synthesizer made to the generated candidate.
    #[serde(default)]
    pub repairs: Vec<String>,
}

impl LayoutSpec {
    pub fn elements_with_role(&self, role: ElementRole) -> impl Iterator<Item = &LayoutElement> {
        self.elements.iter().filter(move |e| e.role == role)
    }

    /// The declared canvas is the one the ratio defines.
    pub fn canvas_matches_ratio(&self) -> bool {
        self.canvas == self.ratio.canvas()
    }

    /// Solid colour directly behind element `index`: its own fill, else the
    /// topmost filled element below it that fully contains it, else the
    /// canvas colour. `None` when an image shows through behind it (an
    /// image element overlapping it, or a background image), since the
    /// colour there is not known from the layout alone.
    pub fn local_background(&self, index: usize) -> Option<Color> {
        let element = self.elements.get(index)?;
        if let Some(fill) = element.style.fill {
            return Some(fill);
        }
        for below in self.elements[..index].iter().rev() {
            if let Some(fill) = below.style.fill {
                if below.rect.contains(&element.rect) {
                    return Some(fill);
                }
            }
            if below.style.asset_ref.is_some() && below.rect.intersection_area(&element.rect) > 0 {
                return None;
            }
        }
        match self.background.image_ref {
            Some(_) => None,
            None => Some(self.background.color),
        }
    }

    /// Contrast of a text-bearing element against a known solid backdrop.
    /// Missing text colour is treated as black.
    pub fn text_contrast(&self, index: usize) -> Option<f64> {
        let element = self.elements.get(index)?;
        if !element.carries_text() {
            return None;
        }
        let fg = element.style.text_color.unwrap_or(Color::BLACK);
        Some(fg.contrast_ratio(&self.local_background(index)?))
    }
}

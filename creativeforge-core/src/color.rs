//! Colour values and WCAG contrast math.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// WCAG AA minimum contrast for normal text.
pub const WCAG_AA_CONTRAST: f64 = 4.5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid colour value: {0}")]
pub struct ColorParseError(pub String);

/// Opaque sRGB colour, serialized as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgb(0, 0, 0);
    pub const WHITE: Color = Color::rgb(255, 255, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }

    pub fn to_rgba(&self) -> [u8; 4] {
        [self.r, self.g, self.b, 255]
    }

    /// Relative luminance per WCAG 2.x.
    pub fn relative_luminance(&self) -> f64 {
        fn channel(c: u8) -> f64 {
            let c = c as f64 / 255.0;
            if c <= 0.039_28 {
                c / 12.92
            } else {
                ((c + 0.055) / 1.055).powf(2.4)
            }
        }
        0.2126 * channel(self.r) + 0.7152 * channel(self.g) + 0.0722 * channel(self.b)
    }

    /// Contrast ratio in `[1, 21]`, symmetric in its arguments.
    pub fn contrast_ratio(&self, other: &Color) -> f64 {
        let a = self.relative_luminance();
        let b = other.relative_luminance();
        let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
        (hi + 0.05) / (lo + 0.05)
    }

    /// HSV saturation in `[0, 1]`.
    pub fn saturation(&self) -> f64 {
        let max = self.r.max(self.g).max(self.b) as f64;
        let min = self.r.min(self.g).min(self.b) as f64;
        if max == 0.0 {
            0.0
        } else {
            (max - min) / max
        }
    }

    pub fn is_neutral(&self) -> bool {
        self.saturation() < 0.15
    }

    /// Black or white, whichever contrasts more with `background`.
    /// One of the two always clears 4.5:1.
    pub fn high_contrast_on(background: &Color) -> Color {
        if Color::BLACK.contrast_ratio(background) >= Color::WHITE.contrast_ratio(background) {
            Color::BLACK
        } else {
            Color::WHITE
        }
    }

    /// Move towards white (`amount > 0`) or black (`amount < 0`).
    pub fn shade(&self, amount: f64) -> Color {
        let amount = amount.clamp(-1.0, 1.0);
        let mix = |c: u8| -> u8 {
            let c = c as f64;
            let v = if amount >= 0.0 {
                c + (255.0 - c) * amount
            } else {
                c * (1.0 + amount)
            };
            v.round().clamp(0.0, 255.0) as u8
        };
        Color::rgb(mix(self.r), mix(self.g), mix(self.b))
    }
}

/// Pick the first candidate meeting `min_ratio` against `background`,
/// falling back to black or white.
pub fn readable_text_color(background: &Color, candidates: &[Color], min_ratio: f64) -> Color {
    candidates
        .iter()
        .copied()
        .find(|c| c.contrast_ratio(background) >= min_ratio)
        .unwrap_or_else(|| Color::high_contrast_on(background))
}

impl FromStr for Color {
    type Err = ColorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let hex = raw.strip_prefix('#').unwrap_or(raw);
        let parse = |h: &str| u8::from_str_radix(h, 16).map_err(|_| ColorParseError(s.to_string()));
        match hex.len() {
            3 => {
                let expand = |i: usize| parse(&hex[i..i + 1].repeat(2));
                Ok(Color::rgb(expand(0)?, expand(1)?, expand(2)?))
            }
            // Alpha is accepted and dropped; layouts are opaque.
            6 | 8 => Ok(Color::rgb(parse(&hex[0..2])?, parse(&hex[2..4])?, parse(&hex[4..6])?)),
            _ => Err(ColorParseError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Color {
    type Error = ColorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Color> for String {
    fn from(c: Color) -> Self {
        c.to_hex()
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!("#fff".parse::<Color>().unwrap(), Color::WHITE);
        assert_eq!("#457EB2".parse::<Color>().unwrap(), Color::rgb(0x45, 0x7E, 0xB2));
        assert_eq!("000000BB".parse::<Color>().unwrap(), Color::BLACK);
        assert!("#12345".parse::<Color>().is_err());
        assert!("#zzzzzz".parse::<Color>().is_err());
    }

    #[test]
    fn test_contrast_extremes() {
        let ratio = Color::BLACK.contrast_ratio(&Color::WHITE);
        assert!((ratio - 21.0).abs() < 1e-9);
        assert!((Color::WHITE.contrast_ratio(&Color::WHITE) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_high_contrast_always_passes_aa() {
        for v in (0..=255u16).step_by(5) {
            let bg = Color::rgb(v as u8, (255 - v) as u8, (v / 2) as u8);
            let fg = Color::high_contrast_on(&bg);
            assert!(fg.contrast_ratio(&bg) >= WCAG_AA_CONTRAST, "bg {bg}");
        }
    }

    #[test]
    fn test_serde_hex_string() {
        let c: Color = serde_json::from_str("\"#ffed21\"").unwrap();
        assert_eq!(serde_json::to_string(&c).unwrap(), "\"#FFED21\"");
    }
}

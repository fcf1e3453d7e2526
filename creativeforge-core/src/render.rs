//! Rasterizer for layout specs.
//!
//! Draws backgrounds, fills and image assets exactly. Text is drawn as ink
//! bars sized from the font size and character count; the builder UI does
//! real typesetting, exports only need the right footprint and colours.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::color::Color;
use crate::layout::{LayoutSpec, Rect};
use crate::model::{Asset, AssetId};

/// Placeholder drawn when a referenced asset is gone or undecodable.
const MISSING_ASSET: Color = Color::rgb(0xE0, 0xE0, 0xE0);

pub type AssetImages = HashMap<AssetId, Arc<Asset>>;

fn rgba(c: Color) -> Rgba<u8> {
    Rgba(c.to_rgba())
}

/// Pixel box of `rect` at `scale`, clipped to the image.
fn scaled(rect: &Rect, scale: f32, img: &RgbaImage) -> Option<(u32, u32, u32, u32)> {
    let s = |v: u32| (v as f32 * scale).round() as u32;
    let (x, y) = (s(rect.x), s(rect.y));
    if x >= img.width() || y >= img.height() {
        return None;
    }
    let w = s(rect.width).max(1).min(img.width() - x);
    let h = s(rect.height).max(1).min(img.height() - y);
    Some((x, y, w, h))
}

fn fill(img: &mut RgbaImage, (x, y, w, h): (u32, u32, u32, u32), color: Color) {
    let px = rgba(color);
    for yy in y..y + h {
        for xx in x..x + w {
            img.put_pixel(xx, yy, px);
        }
    }
}

/// Fit `asset` inside the box keeping its aspect ratio, centred.
fn draw_asset(img: &mut RgbaImage, area: (u32, u32, u32, u32), asset: Option<&Arc<Asset>>, cover: bool) {
    let (x, y, w, h) = area;
    let decoded = asset.and_then(|a| match image::load_from_memory(&a.bytes) {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(asset_id = %a.id, error = %e, "asset could not be decoded for rendering");
            None
        }
    });
    let Some(decoded) = decoded else {
        fill(img, area, MISSING_ASSET);
        return;
    };

    let (sw, sh) = (decoded.width().max(1) as f32, decoded.height().max(1) as f32);
    let factor = if cover { (w as f32 / sw).max(h as f32 / sh) } else { (w as f32 / sw).min(h as f32 / sh) };
    let tw = ((sw * factor).round() as u32).max(1);
    let th = ((sh * factor).round() as u32).max(1);
    let mut resized = imageops::resize(&decoded.to_rgba8(), tw, th, FilterType::Triangle);
    if cover {
        let cx = tw.saturating_sub(w) / 2;
        let cy = th.saturating_sub(h) / 2;
        resized = imageops::crop_imm(&resized, cx, cy, w.min(tw), h.min(th)).to_image();
    }
    let ox = x as i64 + (w as i64 - resized.width() as i64) / 2;
    let oy = y as i64 + (h as i64 - resized.height() as i64) / 2;
    imageops::overlay(img, &resized, ox, oy);
}

/// Greedy word wrap into ink bars inside the box.
fn draw_text(img: &mut RgbaImage, area: (u32, u32, u32, u32), text: &str, color: Color, font_px: f32) {
    let (x, y, w, h) = area;
    let char_w = (font_px * 0.55).max(1.0);
    let line_h = (font_px * 1.25).max(1.0);
    let bar_h = ((font_px * 0.62).round() as u32).max(1);
    let space = char_w.round() as u32;

    let mut line = 0u32;
    let mut cursor = 0u32;
    for word in text.split_whitespace() {
        let len = ((word.chars().count() as f32 * char_w).round() as u32).clamp(1, w);
        if cursor > 0 && cursor + space + len > w {
            line += 1;
            cursor = 0;
        }
        let top = (line as f32 * line_h + (line_h - bar_h as f32) / 2.0).round() as u32;
        if top + bar_h > h {
            break;
        }
        let start = if cursor == 0 { 0 } else { cursor + space };
        fill(img, (x + start, y + top, len, bar_h), color);
        cursor = start + len;
    }
}

/// Render `layout` at `scale` (1.0 is the ratio's native canvas size).
pub fn rasterize(layout: &LayoutSpec, assets: &AssetImages, scale: f32) -> RgbaImage {
    let canvas = layout.ratio.canvas();
    let width = ((canvas.width as f32 * scale).round() as u32).max(1);
    let height = ((canvas.height as f32 * scale).round() as u32).max(1);
    let mut img = RgbaImage::from_pixel(width, height, rgba(layout.background.color));

    if let Some(id) = &layout.background.image_ref {
        draw_asset(&mut img, (0, 0, width, height), assets.get(id), true);
    }

    for element in &layout.elements {
        let Some(area) = scaled(&element.rect, scale, &img) else {
            continue;
        };
        if let Some(color) = element.style.fill {
            fill(&mut img, area, color);
        }
        if let Some(id) = &element.style.asset_ref {
            draw_asset(&mut img, area, assets.get(id), false);
        }
        if let Some(text) = element.text() {
            let font = element.style.font_size_px.unwrap_or_else(|| element.role.min_font_px()) as f32 * scale;
            draw_text(&mut img, area, text, element.style.text_color.unwrap_or(Color::BLACK), font);
        }
    }
    img
}

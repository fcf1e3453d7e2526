//! Brand palettes: history store and advisor.
//!
//! The history store is the only durable state shared between requests.
//! Writes are appends; counts are derived on read, so concurrent writers
//! never race on a read-modify-write.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::color::Color;
use crate::model::{AnalysisResult, BrandColors, ContentSpec};

/// Number of palettes returned when callers do not ask for a count.
pub const DEFAULT_FREQUENT: usize = 6;

#[derive(Debug, Error)]
pub enum PaletteStoreError {
    #[error("palette store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("palette store record is corrupt at line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot record an empty palette")]
    EmptyPalette,
}

/// One recorded use of a palette.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaletteRecord {
    pub colors: BrandColors,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaletteUsage {
    pub colors: BrandColors,
    pub usage_count: u64,
    pub last_used: DateTime<Utc>,
}

pub trait PaletteStore: Send + Sync {
    fn record_usage(&self, colors: &BrandColors) -> Result<(), PaletteStoreError>;

    /// Most used palettes, highest count first, ties broken by recency.
    fn frequent(&self, n: usize) -> Result<Vec<PaletteUsage>, PaletteStoreError>;
}

fn aggregate(records: impl IntoIterator<Item = PaletteRecord>, n: usize) -> Vec<PaletteUsage> {
    let mut by_colors: HashMap<BrandColors, PaletteUsage> = HashMap::new();
    for record in records {
        by_colors
            .entry(record.colors.clone())
            .and_modify(|u| {
                u.usage_count += 1;
                u.last_used = u.last_used.max(record.recorded_at);
            })
            .or_insert(PaletteUsage {
                colors: record.colors,
                usage_count: 1,
                last_used: record.recorded_at,
            });
    }
    let mut usages: Vec<PaletteUsage> = by_colors.into_values().collect();
    usages.sort_by(|a, b| {
        b.usage_count
            .cmp(&a.usage_count)
            .then_with(|| b.last_used.cmp(&a.last_used))
    });
    usages.truncate(n);
    usages
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryPaletteStore {
    records: RwLock<Vec<PaletteRecord>>,
}

impl MemoryPaletteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PaletteStore for MemoryPaletteStore {
    fn record_usage(&self, colors: &BrandColors) -> Result<(), PaletteStoreError> {
        if colors.is_empty() {
            return Err(PaletteStoreError::EmptyPalette);
        }
        self.records.write().push(PaletteRecord { colors: colors.clone(), recorded_at: Utc::now() });
        Ok(())
    }

    fn frequent(&self, n: usize) -> Result<Vec<PaletteUsage>, PaletteStoreError> {
        let snapshot = self.records.read().clone();
        Ok(aggregate(snapshot, n))
    }
}

/// Append-only JSON-lines file. Each record is a single `write_all` of one
/// line on a file opened in append mode.
pub struct JsonlPaletteStore {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonlPaletteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PaletteStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, writer: Mutex::new(file) })
    }

    fn read_all(&self) -> Result<Vec<PaletteRecord>, PaletteStoreError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .map_err(|source| PaletteStoreError::Corrupt { line: idx + 1, source })?;
            records.push(record);
        }
        Ok(records)
    }
}

impl PaletteStore for JsonlPaletteStore {
    fn record_usage(&self, colors: &BrandColors) -> Result<(), PaletteStoreError> {
        if colors.is_empty() {
            return Err(PaletteStoreError::EmptyPalette);
        }
        let record = PaletteRecord { colors: colors.clone(), recorded_at: Utc::now() };
        let mut line = serde_json::to_string(&record).map_err(|source| PaletteStoreError::Corrupt { line: 0, source })?;
        line.push('\n');
        let mut file = self.writer.lock();
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn frequent(&self, n: usize) -> Result<Vec<PaletteUsage>, PaletteStoreError> {
        Ok(aggregate(self.read_all()?, n))
    }
}

/// Fully resolved colours for one creative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPalette {
    pub primary: Color,
    pub secondary: Color,
    pub accent: Color,
    pub background: Color,
}

impl Default for ResolvedPalette {
    fn default() -> Self {
        Self {
            primary: Color::rgb(0x00, 0x53, 0x9F),
            secondary: Color::rgb(0x1A, 0x1A, 0x1A),
            accent: Color::rgb(0xEE, 0x1C, 0x2E),
            background: Color::WHITE,
        }
    }
}

/// Suggests and resolves palettes from image analysis and palette history.
#[derive(Clone)]
pub struct PaletteAdvisor {
    store: Arc<dyn PaletteStore>,
}

impl PaletteAdvisor {
    pub fn new(store: Arc<dyn PaletteStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn PaletteStore> {
        &self.store
    }

    /// Palette derived from the image, followed by the most used historical
    /// palettes. Never more than `n` entries and no duplicates.
    pub fn suggest(&self, analysis: &AnalysisResult, n: usize) -> Result<Vec<BrandColors>, PaletteStoreError> {
        let mut out: Vec<BrandColors> = Vec::with_capacity(n);
        let derived = derive_from_image(&analysis.dominant_colors);
        if !derived.is_empty() && n > 0 {
            out.push(derived);
        }
        for usage in self.store.frequent(n)? {
            if out.len() >= n {
                break;
            }
            if !out.contains(&usage.colors) {
                out.push(usage.colors);
            }
        }
        Ok(out)
    }

    /// Brand colours win; gaps are filled from the image, then defaults.
    pub fn resolve(&self, content: &ContentSpec, analysis: Option<&AnalysisResult>) -> ResolvedPalette {
        resolve_palette(content, analysis.map(|a| a.dominant_colors.as_slice()).unwrap_or(&[]))
    }
}

/// Saturated dominant colours become primary/secondary/accent in order.
pub fn derive_from_image(dominant: &[Color]) -> BrandColors {
    let mut vivid = dominant.iter().copied().filter(|c| !c.is_neutral());
    BrandColors {
        primary: vivid.next(),
        secondary: vivid.next(),
        accent: vivid.next(),
    }
}

pub fn resolve_palette(content: &ContentSpec, dominant: &[Color]) -> ResolvedPalette {
    let defaults = ResolvedPalette::default();
    let derived = derive_from_image(dominant);
    let brand = &content.brand_colors;

    let background = content
        .background
        .color
        .or_else(|| {
            dominant
                .iter()
                .copied()
                .filter(|c| c.is_neutral() && c.relative_luminance() > 0.7)
                .max_by(|a, b| a.relative_luminance().total_cmp(&b.relative_luminance()))
        })
        .unwrap_or(defaults.background);

    let primary = brand.primary.or(derived.primary).unwrap_or(defaults.primary);
    let secondary = brand.secondary.or(derived.secondary).unwrap_or(defaults.secondary);
    let accent = brand.accent.or(derived.accent).unwrap_or(defaults.accent);

    // Value tile must stand out from the canvas.
    let primary = if primary != background {
        primary
    } else if background.relative_luminance() > 0.5 {
        primary.shade(-0.4)
    } else {
        primary.shade(0.4)
    };

    ResolvedPalette { primary, secondary, accent, background }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetId, DetectionStatus};

    fn colors(hex: &str) -> BrandColors {
        BrandColors { primary: Some(hex.parse().unwrap()), ..Default::default() }
    }

    fn analysis(dominant: Vec<Color>) -> AnalysisResult {
        AnalysisResult {
            asset_id: AssetId::new("ast_test"),
            detection: DetectionStatus::Complete,
            detected_objects: vec![],
            product_type: None,
            dominant_colors: dominant,
            has_transparent_background: false,
            foreground: None,
            suggested_scale: 0.6,
            analyzed_at: Utc::now(),
        }
    }

    #[test]
    fn test_memory_store_counts_usage() {
        let store = MemoryPaletteStore::new();
        store.record_usage(&colors("#ff0000")).unwrap();
        store.record_usage(&colors("#00ff00")).unwrap();
        store.record_usage(&colors("#ff0000")).unwrap();

        let top = store.frequent(6).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].colors, colors("#ff0000"));
        assert_eq!(top[0].usage_count, 2);
        assert_eq!(store.frequent(1).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_palette_rejected() {
        let store = MemoryPaletteStore::new();
        assert!(matches!(store.record_usage(&BrandColors::default()), Err(PaletteStoreError::EmptyPalette)));
    }

    #[test]
    fn test_jsonl_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("palettes.jsonl");
        {
            let store = JsonlPaletteStore::open(&path).unwrap();
            store.record_usage(&colors("#112233")).unwrap();
            store.record_usage(&colors("#112233")).unwrap();
        }
        let store = JsonlPaletteStore::open(&path).unwrap();
        store.record_usage(&colors("#445566")).unwrap();
        let top = store.frequent(DEFAULT_FREQUENT).unwrap();
        assert_eq!(top[0].usage_count, 2);
        assert_eq!(top[1].usage_count, 1);
    }

    #[test]
    fn test_jsonl_concurrent_writers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonlPaletteStore::open(dir.path().join("p.jsonl")).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store.record_usage(&colors("#abcdef")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.frequent(1).unwrap()[0].usage_count, 200);
    }

    #[test]
    fn test_resolve_prefers_brand_then_image() {
        let content = ContentSpec {
            headline: "x".into(),
            brand_colors: BrandColors { accent: Some(Color::rgb(0, 200, 0)), ..Default::default() },
            ..Default::default()
        };
        let red = Color::rgb(220, 20, 20);
        let palette = resolve_palette(&content, &[Color::rgb(250, 250, 250), red]);
        assert_eq!(palette.primary, red);
        assert_eq!(palette.accent, Color::rgb(0, 200, 0));
        assert_eq!(palette.background, Color::rgb(250, 250, 250));
    }

    #[test]
    fn test_suggest_puts_image_palette_first() {
        let store = Arc::new(MemoryPaletteStore::new());
        store.record_usage(&colors("#123456")).unwrap();
        let advisor = PaletteAdvisor::new(store);
        let red = Color::rgb(220, 20, 20);
        let suggestions = advisor.suggest(&analysis(vec![red]), 6).unwrap();
        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[0].primary, Some(red));
        assert_eq!(suggestions[1], colors("#123456"));
    }
}

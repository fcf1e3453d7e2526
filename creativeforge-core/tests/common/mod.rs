//! Shared fakes for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageFormat, Rgba, RgbaImage};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use creativeforge_core::capability::offline::template_layout;
use creativeforge_core::capability::{
    Capabilities, CapabilityError, GenerativeCapability, LayoutPrompt, RawDetection, RawObject, VisionCapability,
};
use creativeforge_core::semantic::{lexicon_judgement, JudgeRequest, SemanticJudgement};
use creativeforge_core::{Asset, CreativePipeline, EngineConfig, MemoryPaletteStore, Ratio, RuleCatalog};

/// Vision fake that counts calls and can be slow or down.
pub struct FakeVision {
    pub objects: Vec<(String, f32)>,
    pub delay: Duration,
    pub down: bool,
    pub calls: AtomicUsize,
}

impl FakeVision {
    pub fn seeing(objects: &[(&str, f32)]) -> Self {
        Self {
            objects: objects.iter().map(|(l, c)| (l.to_string(), *c)).collect(),
            delay: Duration::ZERO,
            down: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn down() -> Self {
        Self { down: true, ..Self::seeing(&[]) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionCapability for FakeVision {
    fn name(&self) -> &str {
        "fake-vision"
    }

    async fn detect(&self, _asset: &Asset) -> Result<RawDetection, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.down {
            return Err(CapabilityError::Unavailable("vision returned 503".into()));
        }
        Ok(RawDetection {
            product_type: None,
            objects: self
                .objects
                .iter()
                .map(|(label, confidence)| RawObject { label: label.clone(), confidence: Some(*confidence), bbox: None })
                .collect(),
        })
    }
}

/// Generator fake: template layouts except for ratios told to fail, and a
/// lexicon judge that can be switched off.
#[derive(Default)]
pub struct FakeGenerator {
    pub failing_ratios: HashSet<Ratio>,
    pub judge_down: bool,
    pub layout_calls: AtomicUsize,
    pub judge_calls: AtomicUsize,
}

impl FakeGenerator {
    pub fn failing(ratios: &[Ratio]) -> Self {
        Self { failing_ratios: ratios.iter().copied().collect(), ..Default::default() }
    }

    pub fn judge_down() -> Self {
        Self { judge_down: true, ..Default::default() }
    }

    pub fn judge_calls(&self) -> usize {
        self.judge_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeCapability for FakeGenerator {
    fn name(&self) -> &str {
        "fake-generator"
    }

    async fn generate_layout(&self, prompt: &LayoutPrompt) -> Result<String, CapabilityError> {
        self.layout_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_ratios.contains(&prompt.ratio) {
            return Err(CapabilityError::Unavailable("layout model returned 503".into()));
        }
        serde_json::to_string(&template_layout(prompt)).map_err(|e| CapabilityError::Malformed(e.to_string()))
    }

    async fn judge_semantic_match(&self, request: &JudgeRequest) -> Result<SemanticJudgement, CapabilityError> {
        self.judge_calls.fetch_add(1, Ordering::SeqCst);
        if self.judge_down {
            return Err(CapabilityError::Timeout(Duration::from_millis(5)));
        }
        Ok(lexicon_judgement(request))
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        capability_timeout_ms: 2_000,
        retry_backoff_ms: 1,
        ..Default::default()
    }
}

pub fn pipeline_with(vision: Arc<FakeVision>, generator: Arc<FakeGenerator>) -> CreativePipeline {
    let capabilities = Capabilities { vision, generator };
    CreativePipeline::new(
        test_config(),
        capabilities,
        Arc::new(RuleCatalog::builtin()),
        Arc::new(MemoryPaletteStore::new()),
    )
    .expect("builtin catalog is valid")
}

/// Product cut-out: red square on a transparent canvas.
pub fn packshot_png() -> Vec<u8> {
    let mut img = RgbaImage::from_pixel(200, 200, Rgba([0, 0, 0, 0]));
    for y in 50..150 {
        for x in 60..140 {
            img.put_pixel(x, y, Rgba([190, 20, 30, 255]));
        }
    }
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).expect("png encodes");
    buf
}

/// Opaque noise, which compresses badly.
pub fn noisy_png(w: u32, h: u32) -> Vec<u8> {
    let mut state: u32 = 0x9E37_79B9;
    let img = RgbaImage::from_fn(w, h, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let [r, g, b, _] = state.to_le_bytes();
        Rgba([r, g, b, 255])
    });
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).expect("png encodes");
    buf
}

//! CreativeForge Core - Retail Media Creative Compiler
//!
//! # Ground Rules
//! 1. Layouts Are Self-Contained
//! 2. The Rule Catalog Is Data
//! 3. Every Layout Is Evaluated Before Export
//! 4. Unverifiable Means Failed
//! 5. Reports Carry Their Input Digest
//! 6. Models Suggest, Engine Enforces

pub mod analyzer;
pub mod assets;
pub mod capability;
pub mod catalog;
pub mod coalesce;
pub mod color;
pub mod config;
pub mod export;
pub mod hashing;
pub mod layout;
pub mod model;
pub mod palette;
pub mod pipeline;
pub mod render;
pub mod semantic;
pub mod server;
pub mod synthesizer;
pub mod validation;

pub use analyzer::{AnalyzeError, AssetAnalyzer};
pub use capability::{Capabilities, CapabilityError, GenerativeCapability, VisionCapability};
pub use catalog::{ComplianceRule, RuleCatalog, RuleCategory, Severity};
pub use config::{CapabilitySettings, EngineConfig};
pub use export::{ExportArtifact, ExportError, ExportFormat, ExportGate};
pub use hashing::{canonical_json, compute_input_digest, sha256_hex};
pub use layout::{LayoutSpec, Ratio};
pub use model::{AnalysisResult, Asset, AssetId, ContentSpec};
pub use palette::{JsonlPaletteStore, MemoryPaletteStore, PaletteAdvisor, PaletteStore};
pub use pipeline::{CreativePipeline, EvaluatedLayout, GenerateRequest, GenerationOutcome, PipelineError, RatioOutcome};
pub use synthesizer::{LayoutSynthesizer, SynthesisError};
pub use validation::{ComplianceReport, ComplianceValidator, RuleVerdict};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

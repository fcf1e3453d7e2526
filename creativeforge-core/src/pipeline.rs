//! Creative Pipeline - Single Entry Point
//!
//! Every layout handed out has been validated, and export only accepts an
//! `EvaluatedLayout`, which only this module constructs. Ratios are
//! synthesized and validated as independent tasks.

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::analyzer::{AnalyzeError, AssetAnalyzer};
use crate::assets::{AssetError, AssetStore};
use crate::capability::Capabilities;
use crate::catalog::{CatalogError, RuleCatalog};
use crate::config::EngineConfig;
use crate::export::{ExportArtifact, ExportError, ExportFormat, ExportGate};
use crate::layout::{LayoutSpec, Ratio};
use crate::model::{AnalysisResult, Asset, AssetId, BrandColors, ContentError, ContentSpec};
use crate::palette::{PaletteAdvisor, PaletteStore, PaletteStoreError, PaletteUsage};
use crate::render::AssetImages;
use crate::synthesizer::{LayoutSynthesizer, SynthesisError, SynthesisInput};
use crate::validation::{ComplianceReport, ComplianceValidator};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Asset not found: {0}")]
    AssetNotFound(AssetId),

    #[error("Generation not found: {generation_id} ({ratio})")]
    GenerationNotFound { generation_id: String, ratio: Ratio },

    #[error("Invalid upload: {0}")]
    Upload(#[from] AssetError),

    #[error("Invalid content: {0}")]
    InputError(#[from] ContentError),

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error(transparent)]
    Analyze(#[from] AnalyzeError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("Palette store error: {0}")]
    Palette(#[from] PaletteStoreError),

    #[error("Rule catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Analyze(e) => e.is_retryable(),
            Self::Task(_) => true,
            _ => false,
        }
    }
}

/// A layout together with the report it was evaluated into. Immutable; a
/// re-validation replaces the whole pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatedLayout {
    generation_id: String,
    layout: LayoutSpec,
    report: ComplianceReport,
    #[serde(skip)]
    content: Arc<ContentSpec>,
    #[serde(skip)]
    analysis: Arc<AnalysisResult>,
}

impl EvaluatedLayout {
    pub(crate) fn new(
        generation_id: String,
        layout: LayoutSpec,
        report: ComplianceReport,
        content: Arc<ContentSpec>,
        analysis: Arc<AnalysisResult>,
    ) -> Self {
        Self { generation_id, layout, report, content, analysis }
    }

    pub fn generation_id(&self) -> &str {
        &self.generation_id
    }

    pub fn layout(&self) -> &LayoutSpec {
        &self.layout
    }

    pub fn report(&self) -> &ComplianceReport {
        &self.report
    }

    pub fn content(&self) -> &ContentSpec {
        &self.content
    }

    pub fn analysis(&self) -> &AnalysisResult {
        &self.analysis
    }

    /// Asset ids the layout references.
    pub fn asset_refs(&self) -> BTreeSet<AssetId> {
        self.layout
            .elements
            .iter()
            .filter_map(|e| e.style.asset_ref.clone())
            .chain(self.layout.background.image_ref.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub asset_id: AssetId,
    #[serde(default)]
    pub logo_asset_id: Option<AssetId>,
    pub content_spec: ContentSpec,
    /// Empty means every configured ratio.
    #[serde(default)]
    pub ratios: Vec<Ratio>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RatioFailure {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl RatioFailure {
    fn from_synthesis(e: &SynthesisError) -> Self {
        match e {
            SynthesisError::LayoutGenerationFailed { attempts, .. } => Self {
                kind: "layout_generation_failed",
                message: e.to_string(),
                attempts: Some(*attempts),
            },
            SynthesisError::InputError(_) => Self { kind: "input_error", message: e.to_string(), attempts: None },
        }
    }

    fn aborted(ratio: Ratio) -> Self {
        Self {
            kind: "aborted",
            message: format!("synthesis task for {ratio} did not complete"),
            attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RatioOutcome {
    Evaluated(Arc<EvaluatedLayout>),
    Failed { error: RatioFailure },
}

impl RatioOutcome {
    pub fn evaluated(&self) -> Option<&Arc<EvaluatedLayout>> {
        match self {
            RatioOutcome::Evaluated(e) => Some(e),
            RatioOutcome::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&RatioFailure> {
        match self {
            RatioOutcome::Evaluated(_) => None,
            RatioOutcome::Failed { error } => Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutcome {
    pub generation_id: String,
    pub results: BTreeMap<Ratio, RatioOutcome>,
}

/// The creative pipeline - single entry point for analysis, generation,
/// validation and export.
pub struct CreativePipeline {
    config: EngineConfig,
    provider: String,
    assets: AssetStore,
    analyzer: AssetAnalyzer,
    advisor: PaletteAdvisor,
    synthesizer: LayoutSynthesizer,
    validator: Arc<ComplianceValidator>,
    export_gate: ExportGate,
    generations: Cache<(String, Ratio), Arc<EvaluatedLayout>>,
}

impl CreativePipeline {
    pub fn new(
        config: EngineConfig,
        capabilities: Capabilities,
        catalog: Arc<RuleCatalog>,
        palette_store: Arc<dyn PaletteStore>,
    ) -> Result<Self, PipelineError> {
        catalog.check()?;
        let timeout = config.capability_timeout();
        let backoff = config.retry_backoff();
        Ok(Self {
            provider: capabilities.provider().to_string(),
            assets: AssetStore::new(config.asset_capacity, config.asset_ttl(), config.max_upload_bytes),
            analyzer: AssetAnalyzer::new(
                capabilities.vision.clone(),
                config.analysis_cache_capacity,
                config.analysis_ttl(),
                timeout,
            ),
            advisor: PaletteAdvisor::new(palette_store),
            synthesizer: LayoutSynthesizer::new(capabilities.generator.clone(), timeout, backoff)
                .with_text_limits(config.text_limits)
                .with_min_label_confidence(config.min_label_confidence),
            validator: Arc::new(
                ComplianceValidator::new(catalog, capabilities.generator, timeout, backoff)
                    .with_min_label_confidence(config.min_label_confidence),
            ),
            export_gate: ExportGate::new(config.export_max_attempts),
            generations: Cache::builder()
                .max_capacity(config.asset_capacity.saturating_mul(Ratio::ALL.len() as u64))
                .time_to_live(config.generation_ttl())
                .build(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn catalog(&self) -> &RuleCatalog {
        self.validator.catalog()
    }

    pub async fn register_asset(&self, bytes: Vec<u8>) -> Result<Arc<Asset>, PipelineError> {
        Ok(self.assets.register(bytes).await?)
    }

    pub async fn asset_count(&self) -> u64 {
        self.assets.count().await
    }

    pub async fn asset(&self, id: &AssetId) -> Result<Arc<Asset>, PipelineError> {
        self.assets.get(id).await.ok_or_else(|| PipelineError::AssetNotFound(id.clone()))
    }

    /// Cached, coalesced analysis of a registered asset.
    pub async fn analyze(&self, asset_id: &AssetId) -> Result<Arc<AnalysisResult>, PipelineError> {
        let asset = self
            .assets
            .get(asset_id)
            .await
            .ok_or_else(|| AnalyzeError::AssetNotFound(asset_id.clone()))?;
        Ok(self.analyzer.analyze(asset).await?)
    }

    /// Analysis for generation. When detection is unavailable the pipeline
    /// proceeds on pixel statistics alone and the semantic rule fails closed.
    async fn analysis_for_generation(&self, asset: Arc<Asset>) -> Result<Arc<AnalysisResult>, PipelineError> {
        match self.analyzer.analyze(asset.clone()).await {
            Ok(analysis) => Ok(analysis),
            Err(e) if e.is_retryable() => {
                warn!(asset_id = %asset.id, error = %e, "continuing without object detection");
                Ok(self.analyzer.local_only(&asset).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Synthesize and validate every requested ratio independently.
    ///
    /// Request-level problems (invalid content, unknown assets) fail the
    /// whole call. A ratio that fails to synthesize is reported in its own
    /// slot and never affects the others.
    #[instrument(skip_all, fields(asset_id = %request.asset_id))]
    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerationOutcome, PipelineError> {
        request.content_spec.check(&self.config.text_limits)?;
        let asset = self.asset(&request.asset_id).await?;
        if let Some(logo) = &request.logo_asset_id {
            self.asset(logo).await?;
        }
        if let Some(bg) = &request.content_spec.background.image_asset_id {
            self.asset(bg).await?;
        }
        let ratios: BTreeSet<Ratio> = if request.ratios.is_empty() {
            self.config.ratios.iter().copied().collect()
        } else {
            request.ratios.iter().copied().collect()
        };

        let analysis = self.analysis_for_generation(asset).await?;
        let content = Arc::new(request.content_spec);
        let palette = self.advisor.resolve(&content, Some(&analysis));
        if !content.brand_colors.is_empty() {
            if let Err(e) = self.advisor.store().record_usage(&content.brand_colors) {
                warn!(error = %e, "palette usage not recorded");
            }
        }

        let generation_id = format!("gen_{}", Uuid::new_v4().simple());
        let input = SynthesisInput {
            content: content.clone(),
            analysis: analysis.clone(),
            palette,
            logo_asset: request.logo_asset_id,
        };

        // Dropping the set aborts every task, so an abandoned request stops
        // its capability calls.
        let mut tasks = JoinSet::new();
        for ratio in ratios.iter().copied() {
            let synthesizer = self.synthesizer.clone();
            let validator = self.validator.clone();
            let input = input.clone();
            let span = info_span!("ratio", %ratio, generation_id = %generation_id);
            tasks.spawn(
                async move {
                    let outcome = match synthesizer.synthesize(&input, ratio).await {
                        Ok(layout) => {
                            let report = validator.validate(&layout, &input.content, &input.analysis).await;
                            Ok((layout, report))
                        }
                        Err(e) => Err(e),
                    };
                    (ratio, outcome)
                }
                .instrument(span),
            );
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (ratio, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "ratio task did not complete");
                    continue;
                }
            };
            let slot = match outcome {
                Ok((layout, report)) => {
                    let evaluated = Arc::new(EvaluatedLayout::new(
                        generation_id.clone(),
                        layout,
                        report,
                        content.clone(),
                        analysis.clone(),
                    ));
                    self.generations.insert((generation_id.clone(), ratio), evaluated.clone()).await;
                    RatioOutcome::Evaluated(evaluated)
                }
                Err(e) => RatioOutcome::Failed { error: RatioFailure::from_synthesis(&e) },
            };
            results.insert(ratio, slot);
        }
        for ratio in ratios {
            results
                .entry(ratio)
                .or_insert_with(|| RatioOutcome::Failed { error: RatioFailure::aborted(ratio) });
        }

        let passed = results
            .values()
            .filter_map(RatioOutcome::evaluated)
            .filter(|e| e.report().overall_passed)
            .count();
        let failed = results.values().filter(|r| r.failure().is_some()).count();
        info!(%generation_id, ratios = results.len(), passed, failed, "generation complete");
        Ok(GenerationOutcome { generation_id, results })
    }

    /// Validate a layout. With a generation id, the stored pair for that
    /// ratio is superseded by the new layout and report.
    ///
    /// The layout's canvas must be the one its ratio defines.
    pub async fn validate(
        &self,
        layout: LayoutSpec,
        content: ContentSpec,
        analysis: AnalysisResult,
        generation_id: Option<&str>,
    ) -> Result<ComplianceReport, PipelineError> {
        if !layout.canvas_matches_ratio() {
            let expected = layout.ratio.canvas();
            return Err(PipelineError::InvalidLayout(format!(
                "canvas {}x{} does not match {} ({}x{})",
                layout.canvas.width, layout.canvas.height, layout.ratio, expected.width, expected.height
            )));
        }
        let key = match generation_id {
            Some(id) => {
                let key = (id.to_string(), layout.ratio);
                if !self.generations.contains_key(&key) {
                    return Err(PipelineError::GenerationNotFound { generation_id: id.to_string(), ratio: layout.ratio });
                }
                Some(key)
            }
            None => None,
        };

        let report = self.validator.validate(&layout, &content, &analysis).await;
        if let Some(key) = key {
            let evaluated = EvaluatedLayout::new(key.0.clone(), layout, report.clone(), Arc::new(content), Arc::new(analysis));
            info!(generation_id = %key.0, ratio = %key.1, report_id = %report.report_id, "evaluated layout superseded");
            self.generations.insert(key, Arc::new(evaluated)).await;
        }
        Ok(report)
    }

    pub async fn evaluated(&self, generation_id: &str, ratio: Ratio) -> Result<Arc<EvaluatedLayout>, PipelineError> {
        self.generations
            .get(&(generation_id.to_string(), ratio))
            .await
            .ok_or_else(|| PipelineError::GenerationNotFound { generation_id: generation_id.to_string(), ratio })
    }

    /// Export the current evaluated layout for `ratio`. A failed report does
    /// not block export; the report id travels with the artifact.
    pub async fn export(
        &self,
        generation_id: &str,
        ratio: Ratio,
        format: ExportFormat,
        max_bytes: Option<usize>,
    ) -> Result<ExportArtifact, PipelineError> {
        let evaluated = self.evaluated(generation_id, ratio).await?;
        if !evaluated.report().overall_passed {
            warn!(generation_id, %ratio, report_id = %evaluated.report().report_id, "exporting a layout that failed compliance");
        }
        let mut images = AssetImages::new();
        for id in evaluated.asset_refs() {
            match self.assets.get(&id).await {
                Some(asset) => {
                    images.insert(id, asset);
                }
                None => warn!(asset_id = %id, "referenced asset expired before export"),
            }
        }

        let gate = self.export_gate.clone();
        let max_bytes = max_bytes.unwrap_or(self.config.default_export_max_bytes);
        let artifact = tokio::task::spawn_blocking(move || gate.export(&evaluated, &images, format, max_bytes))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;
        Ok(artifact)
    }

    pub async fn suggest_palettes(&self, asset_id: &AssetId, n: usize) -> Result<Vec<BrandColors>, PipelineError> {
        let analysis = self.analyze(asset_id).await?;
        Ok(self.advisor.suggest(&analysis, n)?)
    }

    pub fn record_palette(&self, colors: &BrandColors) -> Result<(), PipelineError> {
        Ok(self.advisor.store().record_usage(colors)?)
    }

    pub fn frequent_palettes(&self, n: usize) -> Result<Vec<PaletteUsage>, PipelineError> {
        Ok(self.advisor.store().frequent(n)?)
    }
}

//! CreativeForge CLI
//!
//! Commands: serve, rules, validate, generate
//! Outputs JSON to stdout, logs to stderr
//! Returns 2 when a creative fails compliance

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use creativeforge_core::capability::ModelNames;
use creativeforge_core::validation::ComplianceValidator;
use creativeforge_core::{
    AnalysisResult, Capabilities, CapabilitySettings, ContentSpec, CreativePipeline, EngineConfig, ExportFormat,
    GenerateRequest, JsonlPaletteStore, LayoutSpec, MemoryPaletteStore, PaletteStore, Ratio, RatioOutcome,
    RuleCatalog,
};

#[derive(Parser)]
#[command(name = "creativeforge-cli")]
#[command(about = "CreativeForge CLI - Retail Media Creative Compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Rule catalog JSON (built-in catalog when omitted)
    #[arg(long, global = true, env = "CREATIVEFORGE_RULES")]
    rules: Option<PathBuf>,

    /// Engine configuration JSON
    #[arg(long, global = true, env = "CREATIVEFORGE_CONFIG")]
    config: Option<PathBuf>,

    /// Capability call timeout in milliseconds
    #[arg(long, global = true, env = "CREATIVEFORGE_TIMEOUT_MS")]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        #[arg(long, env = "CREATIVEFORGE_BIND", default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// OpenAI-compatible endpoint; the offline provider is used when omitted
        #[arg(long, env = "CREATIVEFORGE_CAPABILITY_URL")]
        capability_url: Option<String>,

        #[arg(long, env = "CREATIVEFORGE_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        #[arg(long, env = "CREATIVEFORGE_VISION_MODEL")]
        vision_model: Option<String>,

        #[arg(long, env = "CREATIVEFORGE_LAYOUT_MODEL")]
        layout_model: Option<String>,

        #[arg(long, env = "CREATIVEFORGE_JUDGE_MODEL")]
        judge_model: Option<String>,

        /// Append-only palette history file (in-memory when omitted)
        #[arg(long, env = "CREATIVEFORGE_PALETTE_STORE")]
        palette_store: Option<PathBuf>,
    },

    /// Print the rule catalog
    Rules,

    /// Validate a layout with the offline judge
    Validate {
        /// JSON payload {layout, contentSpec, analysisResult}
        #[arg(short, long)]
        payload: String,
    },

    /// Run the full offline pipeline on an image
    Generate {
        #[arg(long)]
        image: PathBuf,

        /// JSON ContentSpec
        #[arg(long)]
        content: String,

        /// Output directory for layouts, reports and PNGs
        #[arg(long)]
        out: PathBuf,

        #[arg(long)]
        logo: Option<PathBuf>,

        #[arg(long, value_delimiter = ',')]
        ratios: Vec<Ratio>,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidatePayload {
    layout: LayoutSpec,
    content_spec: ContentSpec,
    analysis_result: AnalysisResult,
}

fn emit<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => println!(r#"{{"error": "Failed to serialize output: {}"}}"#, e),
    }
}

fn fail(message: impl std::fmt::Display) -> ExitCode {
    emit(&serde_json::json!({ "error": message.to_string() }));
    ExitCode::FAILURE
}

fn load_config(cli: &Cli) -> Result<EngineConfig, String> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| format!("Failed to read config: {e}"))?;
            serde_json::from_str(&text).map_err(|e| format!("Invalid config: {e}"))?
        }
        None => EngineConfig::default(),
    };
    if let Some(ms) = cli.timeout_ms {
        config.capability_timeout_ms = ms;
    }
    Ok(config)
}

fn load_catalog(path: Option<&Path>) -> Result<RuleCatalog, String> {
    match path {
        Some(p) => RuleCatalog::load_from_file(p).map_err(|e| format!("Failed to load rules: {e}")),
        None => Ok(RuleCatalog::builtin()),
    }
}

fn ratio_slug(ratio: Ratio) -> String {
    ratio.as_str().replace(':', "x")
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    std::fs::write(path, text).map_err(|e| format!("Failed to write {}: {e}", path.display()))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("creativeforge_core=info,tower_http=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };
    let rules_path = cli.rules.clone().or_else(|| config.storage.rule_catalog.clone());
    let catalog = match load_catalog(rules_path.as_deref()) {
        Ok(c) => Arc::new(c),
        Err(e) => return fail(e),
    };

    match cli.command {
        Commands::Rules => {
            emit(&*catalog);
            ExitCode::SUCCESS
        }

        Commands::Validate { payload } => {
            let input: ValidatePayload = match serde_json::from_str(&payload) {
                Ok(i) => i,
                Err(e) => return fail(format!("Invalid payload: {e}")),
            };
            let capabilities = Capabilities::offline();
            let validator = ComplianceValidator::new(
                catalog,
                capabilities.generator,
                config.capability_timeout(),
                config.retry_backoff(),
            )
            .with_min_label_confidence(config.min_label_confidence);
            let report = validator
                .validate(&input.layout, &input.content_spec, &input.analysis_result)
                .await;
            emit(&report);
            if report.overall_passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2) // Compliance failure
            }
        }

        Commands::Serve {
            bind,
            capability_url,
            api_key,
            vision_model,
            layout_model,
            judge_model,
            palette_store,
        } => {
            let settings = match capability_url {
                Some(base_url) => {
                    let defaults = ModelNames::default();
                    CapabilitySettings::Http {
                        base_url,
                        api_key,
                        models: ModelNames {
                            vision: vision_model.unwrap_or(defaults.vision),
                            layout: layout_model.unwrap_or(defaults.layout),
                            judge: judge_model.unwrap_or(defaults.judge),
                        },
                    }
                }
                None => CapabilitySettings::Offline,
            };
            let store: Arc<dyn PaletteStore> = match palette_store.or_else(|| config.storage.palette_store.clone()) {
                Some(path) => match JsonlPaletteStore::open(&path) {
                    Ok(s) => Arc::new(s),
                    Err(e) => return fail(format!("Failed to open palette store: {e}")),
                },
                None => Arc::new(MemoryPaletteStore::new()),
            };
            let pipeline = match CreativePipeline::new(config, Capabilities::from_settings(&settings), catalog, store) {
                Ok(p) => Arc::new(p),
                Err(e) => return fail(e),
            };
            match creativeforge_core::server::serve(pipeline, bind).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => fail(format!("Server error: {e}")),
            }
        }

        Commands::Generate { image, content, out, logo, ratios } => {
            let content_spec: ContentSpec = match serde_json::from_str(&content) {
                Ok(c) => c,
                Err(e) => return fail(format!("Invalid content: {e}")),
            };
            let pipeline = match CreativePipeline::new(
                config,
                Capabilities::offline(),
                catalog,
                Arc::new(MemoryPaletteStore::new()),
            ) {
                Ok(p) => p,
                Err(e) => return fail(e),
            };
            match generate(&pipeline, &image, logo.as_deref(), content_spec, ratios, &out).await {
                Ok((summary, all_passed)) => {
                    emit(&summary);
                    if all_passed {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::from(2)
                    }
                }
                Err(e) => fail(e),
            }
        }
    }
}

async fn generate(
    pipeline: &CreativePipeline,
    image: &Path,
    logo: Option<&Path>,
    content_spec: ContentSpec,
    ratios: Vec<Ratio>,
    out: &Path,
) -> Result<(serde_json::Value, bool), String> {
    let read = |p: &Path| std::fs::read(p).map_err(|e| format!("Failed to read {}: {e}", p.display()));
    let asset = pipeline.register_asset(read(image)?).await.map_err(|e| e.to_string())?;
    let logo_asset_id = match logo {
        Some(p) => Some(pipeline.register_asset(read(p)?).await.map_err(|e| e.to_string())?.id.clone()),
        None => None,
    };
    std::fs::create_dir_all(out).map_err(|e| format!("Failed to create {}: {e}", out.display()))?;

    let outcome = pipeline
        .generate(GenerateRequest { asset_id: asset.id.clone(), logo_asset_id, content_spec, ratios })
        .await
        .map_err(|e| e.to_string())?;

    let mut all_passed = true;
    let mut summary = Vec::new();
    for (ratio, result) in &outcome.results {
        let slug = ratio_slug(*ratio);
        match result {
            RatioOutcome::Evaluated(evaluated) => {
                write_json(&out.join(format!("{slug}.layout.json")), evaluated.layout())?;
                write_json(&out.join(format!("{slug}.report.json")), evaluated.report())?;
                let png = match pipeline.export(&outcome.generation_id, *ratio, ExportFormat::Png, None).await {
                    Ok(artifact) => {
                        let path = out.join(format!("{slug}.png"));
                        std::fs::write(&path, &artifact.bytes).map_err(|e| format!("Failed to write {}: {e}", path.display()))?;
                        serde_json::json!({ "path": path, "sizeBytes": artifact.size_bytes, "sha256": artifact.sha256 })
                    }
                    Err(e) => serde_json::json!({ "error": e.to_string() }),
                };
                let passed = evaluated.report().overall_passed;
                all_passed &= passed;
                summary.push(serde_json::json!({
                    "ratio": ratio,
                    "overallPassed": passed,
                    "failedRules": evaluated.report().failures().map(|v| v.rule_id.clone()).collect::<Vec<_>>(),
                    "export": png,
                }));
            }
            RatioOutcome::Failed { error } => {
                all_passed = false;
                summary.push(serde_json::json!({ "ratio": ratio, "error": error }));
            }
        }
    }
    Ok((serde_json::json!({ "generationId": outcome.generation_id, "results": summary }), all_passed))
}

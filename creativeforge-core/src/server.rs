//! HTTP surface consumed by the builder UI.

use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::analyzer::AnalyzeError;
use crate::assets::{probe, AssetError};
use crate::catalog::RuleCatalog;
use crate::export::{ExportError, ExportFormat};
use crate::layout::{LayoutSpec, Ratio};
use crate::model::{AnalysisResult, AssetId, BrandColors, ContentSpec};
use crate::palette::{PaletteUsage, DEFAULT_FREQUENT};
use crate::pipeline::{CreativePipeline, GenerateRequest, GenerationOutcome, PipelineError};
use crate::validation::ComplianceReport;
use crate::ENGINE_VERSION;

const MAX_LISTED_PALETTES: usize = 50;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Pipeline(PipelineError),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        Self::Pipeline(e)
    }
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        use PipelineError as P;
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "input_error"),
            ApiError::Pipeline(e) => match e {
                P::AssetNotFound(_) | P::Analyze(AnalyzeError::AssetNotFound(_)) => (StatusCode::NOT_FOUND, "asset_not_found"),
                P::GenerationNotFound { .. } => (StatusCode::NOT_FOUND, "generation_not_found"),
                P::Upload(AssetError::TooLarge { .. }) => (StatusCode::PAYLOAD_TOO_LARGE, "input_error"),
                P::Upload(_) | P::InputError(_) | P::InvalidLayout(_) => (StatusCode::BAD_REQUEST, "input_error"),
                P::Analyze(AnalyzeError::UnsupportedAsset(_)) => (StatusCode::BAD_REQUEST, "unsupported_asset"),
                P::Analyze(AnalyzeError::AnalysisUnavailable(_)) => (StatusCode::SERVICE_UNAVAILABLE, "analysis_unavailable"),
                P::Export(ExportError::ExportTooLarge { .. }) => (StatusCode::UNPROCESSABLE_ENTITY, "export_too_large"),
                P::Export(ExportError::InvalidCeiling) => (StatusCode::BAD_REQUEST, "input_error"),
                P::Export(ExportError::Encode(_)) => (StatusCode::INTERNAL_SERVER_ERROR, "export_failed"),
                P::Task(_) => (StatusCode::SERVICE_UNAVAILABLE, "task_failed"),
                P::Palette(_) => (StatusCode::INTERNAL_SERVER_ERROR, "palette_store_error"),
                P::Catalog(_) => (StatusCode::INTERNAL_SERVER_ERROR, "catalog_error"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let mut body = match &self {
            ApiError::BadRequest(msg) => json!({ "error": msg, "kind": kind }),
            ApiError::Pipeline(e) => json!({ "error": e.to_string(), "kind": kind, "retryable": e.is_retryable() }),
        };
        if let ApiError::Pipeline(PipelineError::Export(ExportError::ExportTooLarge { max_bytes, ladder })) = &self {
            body["maxBytes"] = json!(max_bytes);
            body["ladder"] = json!(ladder);
        }
        if status.is_server_error() {
            tracing::error!(%status, error = %body["error"], "request failed");
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    engine_version: &'static str,
    provider: String,
    catalog_version: String,
    assets: u64,
}

async fn health(State(pipeline): State<Arc<CreativePipeline>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        engine_version: ENGINE_VERSION,
        provider: pipeline.provider().to_string(),
        catalog_version: pipeline.catalog().catalog_version.clone(),
        assets: pipeline.asset_count().await,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody {
    /// Base64 image bytes, optionally as a data URL.
    bytes: String,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadReply {
    asset_id: AssetId,
    width: u32,
    height: u32,
    mime_type: String,
}

fn decode_upload(raw: &str) -> Result<Vec<u8>, ApiError> {
    let payload = match raw.strip_prefix("data:") {
        Some(url) => url.split_once(',').map(|(_, data)| data).unwrap_or(url),
        None => raw,
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| ApiError::BadRequest(format!("bytes are not valid base64: {e}")))
}

/// Compare a declared mime type with the sniffed one before anything is stored.
fn check_declared_mime(bytes: &[u8], declared: Option<&str>) -> Result<(), ApiError> {
    let Some(declared) = declared else {
        return Ok(());
    };
    let (actual, _, _) = probe(bytes).map_err(PipelineError::from)?;
    let declared = if declared.eq_ignore_ascii_case("image/jpg") { "image/jpeg" } else { declared };
    if !declared.eq_ignore_ascii_case(actual) {
        return Err(ApiError::BadRequest(format!("declared {declared} but content is {actual}")));
    }
    Ok(())
}

async fn upload(State(pipeline): State<Arc<CreativePipeline>>, Json(body): Json<UploadBody>) -> ApiResult<Json<UploadReply>> {
    let bytes = decode_upload(&body.bytes)?;
    check_declared_mime(&bytes, body.mime_type.as_deref())?;
    let asset = pipeline.register_asset(bytes).await?;
    Ok(Json(UploadReply {
        asset_id: asset.id.clone(),
        width: asset.width,
        height: asset.height,
        mime_type: asset.mime_type.clone(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetRef {
    asset_id: AssetId,
    #[serde(default)]
    n: Option<usize>,
}

async fn analyze_image(State(pipeline): State<Arc<CreativePipeline>>, Json(body): Json<AssetRef>) -> ApiResult<Json<AnalysisResult>> {
    let analysis = pipeline.analyze(&body.asset_id).await?;
    Ok(Json((*analysis).clone()))
}

async fn generate_layout(
    State(pipeline): State<Arc<CreativePipeline>>,
    Json(request): Json<GenerateRequest>,
) -> ApiResult<Json<GenerationOutcome>> {
    Ok(Json(pipeline.generate(request).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateBody {
    layout: LayoutSpec,
    content_spec: ContentSpec,
    analysis_result: AnalysisResult,
    #[serde(default)]
    generation_id: Option<String>,
}

async fn validate(State(pipeline): State<Arc<CreativePipeline>>, Json(body): Json<ValidateBody>) -> ApiResult<Json<ComplianceReport>> {
    let report = pipeline
        .validate(body.layout, body.content_spec, body.analysis_result, body.generation_id.as_deref())
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportQuery {
    generation_id: String,
    ratio: Ratio,
    #[serde(default)]
    format: Option<ExportFormat>,
    #[serde(default)]
    max_bytes: Option<usize>,
}

async fn export(State(pipeline): State<Arc<CreativePipeline>>, Query(query): Query<ExportQuery>) -> ApiResult<Response> {
    let format = query.format.unwrap_or(ExportFormat::Png);
    let artifact = pipeline
        .export(&query.generation_id, query.ratio, format, query.max_bytes)
        .await?;
    let headers = [
        ("content-type", artifact.format.mime_type().to_string()),
        ("x-artifact-sha256", artifact.sha256.clone()),
        ("x-export-quality", artifact.quality.map_or_else(|| "lossless".to_string(), |q| q.to_string())),
        ("x-export-scale", format!("{:.2}", artifact.scale)),
        ("x-report-id", artifact.report_id.clone()),
    ];
    Ok((headers, artifact.bytes).into_response())
}

async fn rules(State(pipeline): State<Arc<CreativePipeline>>) -> Json<RuleCatalog> {
    Json(pipeline.catalog().clone())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaletteBody {
    brand_colors: BrandColors,
}

async fn record_palette(State(pipeline): State<Arc<CreativePipeline>>, Json(body): Json<PaletteBody>) -> ApiResult<StatusCode> {
    if body.brand_colors.is_empty() {
        return Err(ApiError::BadRequest("brandColors must name at least one colour".into()));
    }
    pipeline.record_palette(&body.brand_colors)?;
    Ok(StatusCode::CREATED)
}

#[derive(Deserialize)]
struct CountQuery {
    #[serde(default)]
    n: Option<usize>,
}

async fn frequent_palettes(
    State(pipeline): State<Arc<CreativePipeline>>,
    Query(query): Query<CountQuery>,
) -> ApiResult<Json<Vec<PaletteUsage>>> {
    let n = query.n.unwrap_or(DEFAULT_FREQUENT).min(MAX_LISTED_PALETTES);
    Ok(Json(pipeline.frequent_palettes(n)?))
}

async fn suggest_palettes(State(pipeline): State<Arc<CreativePipeline>>, Json(body): Json<AssetRef>) -> ApiResult<Json<Vec<BrandColors>>> {
    let n = body.n.unwrap_or(DEFAULT_FREQUENT).min(MAX_LISTED_PALETTES);
    Ok(Json(pipeline.suggest_palettes(&body.asset_id, n).await?))
}

pub fn router(pipeline: Arc<CreativePipeline>) -> Router {
    // Base64 inflates uploads by a third.
    let body_limit = pipeline.config().max_upload_bytes / 3 * 4 + 64 * 1024;
    Router::new()
        .route("/health", get(health))
        .route("/assets", post(upload))
        .route("/analyze-image", post(analyze_image))
        .route("/generate-layout", post(generate_layout))
        .route("/validate", post(validate))
        .route("/export", get(export))
        .route("/rules", get(rules))
        .route("/palettes", post(record_palette))
        .route("/palettes/frequent", get(frequent_palettes))
        .route("/palettes/suggest", post(suggest_palettes))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

pub async fn serve(pipeline: Arc<CreativePipeline>, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(pipeline);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "creativeforge listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_upload_accepts_data_url() {
        assert_eq!(decode_upload("aGk=").unwrap(), b"hi");
        assert_eq!(decode_upload("data:image/png;base64,aGk=").unwrap(), b"hi");
        assert!(matches!(decode_upload("***"), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_declared_mime_checked_against_content() {
        let mut png = Vec::new();
        image::RgbaImage::new(4, 4)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        assert!(check_declared_mime(&png, None).is_ok());
        assert!(check_declared_mime(&png, Some("IMAGE/PNG")).is_ok());
        assert!(matches!(check_declared_mime(&png, Some("image/jpeg")), Err(ApiError::BadRequest(_))));
        assert!(matches!(check_declared_mime(b"text", Some("image/png")), Err(ApiError::Pipeline(_))));
    }

    #[test]
    fn test_status_mapping() {
        let too_large = ApiError::from(PipelineError::Export(ExportError::ExportTooLarge { max_bytes: 1, ladder: vec![] }));
        assert_eq!(too_large.status_and_kind().0, StatusCode::UNPROCESSABLE_ENTITY);
        let unavailable = ApiError::from(PipelineError::Analyze(AnalyzeError::AnalysisUnavailable("down".into())));
        assert_eq!(unavailable.status_and_kind().0, StatusCode::SERVICE_UNAVAILABLE);
        let missing = ApiError::from(PipelineError::AssetNotFound(AssetId::new("ast_x")));
        assert_eq!(missing.status_and_kind().0, StatusCode::NOT_FOUND);
    }
}

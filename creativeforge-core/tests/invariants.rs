//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees.

mod common;

use serde_json::json;
use std::sync::Arc;

use common::{packshot_png, pipeline_with, FakeGenerator, FakeVision};
use creativeforge_core::catalog::{AbsentPolicy, CatalogError, DeterministicCheck, Evaluator};
use creativeforge_core::hashing::{canonical_json, compute_input_digest};
use creativeforge_core::validation::{evaluate_deterministic, CheckContext, ComplianceValidator};
use creativeforge_core::{
    ContentSpec, CreativePipeline, EvaluatedLayout, ExportFormat, GenerateRequest, PipelineError, Ratio, RuleCatalog,
};

async fn evaluated_square(pipeline: &CreativePipeline) -> (String, Arc<EvaluatedLayout>) {
    let asset = pipeline.register_asset(packshot_png()).await.unwrap();
    let outcome = pipeline
        .generate(GenerateRequest {
            asset_id: asset.id.clone(),
            logo_asset_id: None,
            content_spec: ContentSpec {
                headline: "Ice Cold Soda".into(),
                price: Some("£1.00".into()),
                ..Default::default()
            },
            ratios: vec![Ratio::Square],
        })
        .await
        .unwrap();
    let evaluated = outcome.results[&Ratio::Square].evaluated().unwrap().clone();
    (outcome.generation_id, evaluated)
}

fn fake_pipeline() -> CreativePipeline {
    pipeline_with(Arc::new(FakeVision::seeing(&[("soda_can", 0.94)])), Arc::new(FakeGenerator::default()))
}

#[tokio::test]
async fn invariant_every_rule_is_reported_in_catalog_order() {
    let pipeline = fake_pipeline();
    let (_, evaluated) = evaluated_square(&pipeline).await;

    let reported: Vec<_> = evaluated.report().per_rule.iter().map(|v| v.rule_id.as_str()).collect();
    let catalog: Vec<_> = pipeline.catalog().rules.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(reported, catalog);
}

#[tokio::test]
async fn invariant_overall_is_and_of_verdicts() {
    let pipeline = fake_pipeline();
    let (_, evaluated) = evaluated_square(&pipeline).await;
    let report = evaluated.report();

    assert_eq!(report.overall_passed, report.per_rule.iter().all(|v| v.passed));
    assert_eq!(report.layout_ratio, Ratio::Square);
    assert_eq!(report.catalog_version, pipeline.catalog().catalog_version);
    assert!(!report.input_digest.is_empty());
}

#[tokio::test]
async fn invariant_deterministic_rules_are_repeatable() {
    let pipeline = fake_pipeline();
    let (_, evaluated) = evaluated_square(&pipeline).await;
    let ctx = CheckContext {
        layout: evaluated.layout(),
        content: evaluated.content(),
        analysis: evaluated.analysis(),
        min_label_confidence: pipeline.config().min_label_confidence,
    };

    let first = evaluate_deterministic(pipeline.catalog(), &ctx);
    let second = evaluate_deterministic(pipeline.catalog(), &ctx);
    assert_eq!(first, second);
    assert_eq!(first.len(), pipeline.catalog().rules.iter().filter(|r| !r.evaluator.is_semantic()).count());

    for verdict in &first {
        let reported = evaluated.report().verdict(&verdict.rule_id).unwrap();
        assert_eq!(reported.passed, verdict.passed, "{}", verdict.rule_id);
    }
}

#[tokio::test]
async fn invariant_input_digest_stable() {
    let pipeline = fake_pipeline();
    let (_, evaluated) = evaluated_square(&pipeline).await;
    let version = &pipeline.catalog().catalog_version;

    let d1 = compute_input_digest(evaluated.layout(), evaluated.content(), evaluated.analysis(), version).unwrap();
    let d2 = compute_input_digest(evaluated.layout(), evaluated.content(), evaluated.analysis(), version).unwrap();
    assert_eq!(d1, d2);
    assert_eq!(d1, evaluated.report().input_digest);

    let mut edited = evaluated.content().clone();
    edited.headline.push('!');
    let d3 = compute_input_digest(evaluated.layout(), &edited, evaluated.analysis(), version).unwrap();
    assert_ne!(d1, d3);
}

#[tokio::test]
async fn invariant_export_requires_evaluation() {
    let pipeline = fake_pipeline();
    let err = pipeline
        .export("gen_never_generated", Ratio::Square, ExportFormat::Png, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::GenerationNotFound { .. }));

    let (generation_id, evaluated) = evaluated_square(&pipeline).await;
    let err = pipeline.export(&generation_id, Ratio::Vertical, ExportFormat::Png, None).await.unwrap_err();
    assert!(matches!(err, PipelineError::GenerationNotFound { .. }));

    let artifact = pipeline.export(&generation_id, Ratio::Square, ExportFormat::Png, None).await.unwrap();
    assert_eq!(artifact.report_id, evaluated.report().report_id);
}

#[tokio::test]
async fn invariant_validator_never_errors() {
    let pipeline = fake_pipeline();
    let (_, evaluated) = evaluated_square(&pipeline).await;
    let validator = ComplianceValidator::new(
        Arc::new(pipeline.catalog().clone()),
        Arc::new(FakeGenerator::judge_down()),
        std::time::Duration::from_millis(50),
        std::time::Duration::from_millis(1),
    );

    let report = validator.validate(evaluated.layout(), evaluated.content(), evaluated.analysis()).await;
    assert_eq!(report.per_rule.len(), pipeline.catalog().rules.len());
    assert!(!report.verdict("claim-matches-product").unwrap().passed);
    assert!(!report.overall_passed);
}

#[test]
fn invariant_canonical_json_deterministic() {
    let obj1 = json!({"z": 1, "a": 2, "m": {"b": 1, "a": 2}});
    let obj2 = json!({"a": 2, "m": {"a": 2, "b": 1}, "z": 1});

    let c1 = canonical_json(&obj1).unwrap();
    let c2 = canonical_json(&obj2).unwrap();

    // Must be identical despite different input ordering
    assert_eq!(c1, c2);
}

#[test]
fn invariant_catalog_newer_than_engine_rejected() {
    let mut catalog = serde_json::to_value(RuleCatalog::builtin()).unwrap();
    catalog["engineMinVersion"] = json!("99.0.0");

    let err = RuleCatalog::from_json_str(&catalog.to_string()).unwrap_err();
    assert!(matches!(err, CatalogError::EngineVersionMismatch { .. }));
}

#[test]
fn invariant_builtin_price_rule_fails_when_absent() {
    let catalog = RuleCatalog::builtin();
    let rule = catalog.get("price-present").unwrap();
    assert_eq!(
        rule.evaluator,
        Evaluator::Deterministic(DeterministicCheck::PricePresent { when_absent: AbsentPolicy::Fail })
    );
    assert!(!rule.waivable());
}

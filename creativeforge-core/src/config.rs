//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::capability::ModelNames;
use crate::layout::Ratio;
use crate::model::TextLimits;

/// 32 MiB, the largest accepted upload.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub capability_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub analysis_cache_capacity: u64,
    pub analysis_ttl_secs: u64,
    pub asset_capacity: u64,
    pub asset_ttl_secs: u64,
    pub generation_ttl_secs: u64,
    pub max_upload_bytes: usize,
    pub export_max_attempts: usize,
    pub default_export_max_bytes: usize,
    /// Detected objects below this confidence are ignored by rules.
    pub min_label_confidence: f32,
    pub text_limits: TextLimits,
    pub ratios: Vec<Ratio>,
    /// Used when the matching CLI flag is not given.
    pub storage: StoragePaths,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capability_timeout_ms: 20_000,
            retry_backoff_ms: 250,
            analysis_cache_capacity: 10_000,
            analysis_ttl_secs: 3_600,
            asset_capacity: 1_000,
            asset_ttl_secs: 3_600,
            generation_ttl_secs: 3_600,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            export_max_attempts: 8,
            default_export_max_bytes: 500 * 1024,
            min_label_confidence: 0.3,
            text_limits: TextLimits::default(),
            ratios: Ratio::ALL.to_vec(),
            storage: StoragePaths::default(),
        }
    }
}

impl EngineConfig {
    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn analysis_ttl(&self) -> Duration {
        Duration::from_secs(self.analysis_ttl_secs)
    }

    pub fn asset_ttl(&self) -> Duration {
        Duration::from_secs(self.asset_ttl_secs)
    }

    pub fn generation_ttl(&self) -> Duration {
        Duration::from_secs(self.generation_ttl_secs)
    }
}

/// Which capability provider backs the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "provider")]
pub enum CapabilitySettings {
    /// Deterministic local provider. Chosen explicitly, never as a fallback.
    #[default]
    Offline,
    Http {
        base_url: String,
        #[serde(default, skip_serializing)]
        api_key: Option<String>,
        #[serde(default)]
        models: ModelNames,
    },
}

/// Paths for optional on-disk state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePaths {
    pub rule_catalog: Option<PathBuf>,
    pub palette_store: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.capability_timeout(), Duration::from_secs(20));
        assert_eq!(cfg.max_upload_bytes, 33_554_432);
        assert_eq!(cfg.ratios.len(), 3);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"exportMaxAttempts": 3}"#).unwrap();
        assert_eq!(cfg.export_max_attempts, 3);
        assert_eq!(cfg.retry_backoff_ms, 250);
        assert!(cfg.storage.rule_catalog.is_none());
    }

    #[test]
    fn test_storage_paths_from_json() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{"storage": {"paletteStore": "/var/lib/creativeforge/palettes.jsonl"}}"#).unwrap();
        assert_eq!(cfg.storage.palette_store, Some(PathBuf::from("/var/lib/creativeforge/palettes.jsonl")));
        assert!(cfg.storage.rule_catalog.is_none());
    }

    #[test]
    fn test_api_key_not_serialized() {
        let settings = CapabilitySettings::Http {
            base_url: "http://localhost:8080/v1".into(),
            api_key: Some("secret".into()),
            models: ModelNames::default(),
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"provider\":\"http\""));
    }
}

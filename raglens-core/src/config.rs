//! Configuration system for RAGLens.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides. Configuration is
//! loaded from `~/.config/raglens/config.toml` and/or `.raglens/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Top-level configuration for the evaluation engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub diagnosis: DiagnosisConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Connection settings for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Model identifier (e.g., "gpt-4o", "claude-sonnet-4-20250514").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Optional base URL override for the API endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    /// Cost per 1M input tokens (USD).
    #[serde(default)]
    pub input_cost_per_million: f64,
    /// Cost per 1M output tokens (USD).
    #[serde(default)]
    pub output_cost_per_million: f64,
}

impl ProviderConfig {
    pub fn anthropic() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
            max_tokens: default_max_tokens(),
            timeout_secs: default_provider_timeout(),
            input_cost_per_million: 3.0,
            output_cost_per_million: 15.0,
        }
    }

    pub fn openai() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            max_tokens: default_max_tokens(),
            timeout_secs: default_provider_timeout(),
            input_cost_per_million: 2.50,
            output_cost_per_million: 10.00,
        }
    }
}

fn default_max_tokens() -> usize {
    2000
}

fn default_provider_timeout() -> u64 {
    60
}

/// The configured providers and which one plays which role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "ProviderConfig::anthropic")]
    pub anthropic: ProviderConfig,
    #[serde(default = "ProviderConfig::openai")]
    pub openai: ProviderConfig,
    /// Provider used to generate answers during golden-set runs.
    #[serde(default = "default_generation_provider")]
    pub default_generation: String,
    /// Provider used as the judge.
    #[serde(default = "default_judge_provider")]
    pub default_judge: String,
}

fn default_generation_provider() -> String {
    "openai".to_string()
}

fn default_judge_provider() -> String {
    "anthropic".to_string()
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            anthropic: ProviderConfig::anthropic(),
            openai: ProviderConfig::openai(),
            default_generation: default_generation_provider(),
            default_judge: default_judge_provider(),
        }
    }
}

impl ProvidersConfig {
    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        match name {
            "anthropic" => Some(&self.anthropic),
            "openai" => Some(&self.openai),
            _ => None,
        }
    }
}

/// Exponential backoff policy for transient provider errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; `2` means at most three attempts.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Pinned to zero for reproducible scoring.
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
    /// Ceiling on in-flight judge calls for batch judging.
    pub concurrency: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 2000,
            timeout_secs: 60,
            concurrency: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Ceiling on concurrently processed test cases.
    pub concurrency: usize,
    /// A successful case passes when its overall score is at least this value.
    pub pass_threshold: f64,
    /// Consecutive case failures that mark the whole run as failed (0 disables).
    pub consecutive_failure_limit: usize,
    pub default_top_k: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            pass_threshold: 0.7,
            consecutive_failure_limit: 5,
            default_top_k: 5,
        }
    }
}

/// Thresholds for diagnosis statistics and alert rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisConfig {
    pub default_period_days: u32,
    /// Fractional drop below the baseline average that raises a score-drop alert.
    pub score_drop_fraction: f64,
    pub high_score_threshold: f64,
    pub low_score_threshold: f64,
    /// A group's share of low scores must reach this multiple of its volume share.
    pub concentration_factor: f64,
    /// Minimum low-score records in a group before concentration is reported.
    pub concentration_min_low: usize,
    /// Below this many evaluations the window is reported as too small.
    pub min_evaluations: usize,
    pub top_low_scoring: usize,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            default_period_days: 7,
            score_drop_fraction: 0.10,
            high_score_threshold: 0.8,
            low_score_threshold: 0.6,
            concentration_factor: 2.0,
            concentration_min_low: 3,
            min_evaluations: 10,
            top_low_scoring: 10,
        }
    }
}

/// Background evaluation of live traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub enabled: bool,
    /// Fraction of interactions evaluated, in `[0, 1]`.
    pub rate: f64,
    pub queue_capacity: usize,
    pub workers: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: 0.1,
            queue_capacity: 64,
            workers: 2,
        }
    }
}

/// Where golden-set runs fetch context from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// HTTP endpoint of the retrieval service. Without it, runs use an empty static corpus.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

fn default_retrieval_timeout() -> u64 {
    15
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database file for the SQLite backend. Defaults to the project data directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| data_dir().join("raglens.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8088,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(message: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                message: message.into(),
            })
        }
        fn unit_range(name: &str, value: f64) -> Result<(), ConfigError> {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be within [0, 1], got {value}"));
            }
            Ok(())
        }

        unit_range("sampling.rate", self.sampling.rate)?;
        unit_range("batch.pass_threshold", self.batch.pass_threshold)?;
        unit_range("diagnosis.score_drop_fraction", self.diagnosis.score_drop_fraction)?;
        unit_range("diagnosis.high_score_threshold", self.diagnosis.high_score_threshold)?;
        unit_range("diagnosis.low_score_threshold", self.diagnosis.low_score_threshold)?;

        if self.diagnosis.low_score_threshold > self.diagnosis.high_score_threshold {
            return invalid("diagnosis.low_score_threshold must not exceed high_score_threshold");
        }
        if self.diagnosis.concentration_factor <= 0.0 {
            return invalid("diagnosis.concentration_factor must be positive");
        }
        if !(1..=crate::diagnosis::MAX_PERIOD_DAYS).contains(&self.diagnosis.default_period_days) {
            return invalid(format!(
                "diagnosis.default_period_days must be between 1 and {}",
                crate::diagnosis::MAX_PERIOD_DAYS
            ));
        }
        if self.batch.concurrency == 0 || self.judge.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.batch.default_top_k == 0 {
            return invalid("batch.default_top_k must be at least 1");
        }
        if self.sampling.queue_capacity == 0 || self.sampling.workers == 0 {
            return invalid("sampling.queue_capacity and sampling.workers must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.judge.temperature) {
            return invalid("judge.temperature must be within [0, 2]");
        }
        for name in [
            &self.providers.default_generation,
            &self.providers.default_judge,
        ] {
            if self.providers.get(name).is_none() {
                return invalid(format!("unknown provider '{name}'"));
            }
        }
        Ok(())
    }
}

/// Project data directory used for logs and the default database.
pub fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "raglens", "raglens")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".raglens"))
}

/// Load configuration by merging defaults, config files, environment and overrides.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&EngineConfig>,
) -> Result<EngineConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "raglens", "raglens") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".raglens").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (RAGLENS_BATCH__CONCURRENCY, RAGLENS_SAMPLING__RATE, etc.)
    figment = figment.merge(Env::prefixed("RAGLENS_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: EngineConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.judge.temperature, 0.0);
        assert_eq!(config.batch.concurrency, 5);
        assert_eq!(config.batch.pass_threshold, 0.7);
        assert_eq!(config.diagnosis.default_period_days, 7);
        assert_eq!(config.diagnosis.score_drop_fraction, 0.10);
        assert_eq!(config.sampling.rate, 0.1);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized.providers.openai.model, config.providers.openai.model);
        assert_eq!(deserialized.diagnosis.min_evaluations, config.diagnosis.min_evaluations);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
[batch]
concurrency = 2
pass_threshold = 0.5
consecutive_failure_limit = 0
default_top_k = 3
"#,
        )
        .unwrap();
        assert_eq!(config.batch.concurrency, 2);
        assert_eq!(config.judge.concurrency, 5);
        assert_eq!(config.providers.default_judge, "anthropic");
    }

    #[test]
    fn test_load_config_with_overrides() {
        let mut overrides = EngineConfig::default();
        overrides.batch.concurrency = 9;
        overrides.diagnosis.score_drop_fraction = 0.25;

        let config = load_config(None, Some(&overrides)).unwrap();
        assert_eq!(config.batch.concurrency, 9);
        assert_eq!(config.diagnosis.score_drop_fraction, 0.25);
    }

    #[test]
    fn test_load_config_from_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let raglens_dir = dir.path().join(".raglens");
        std::fs::create_dir_all(&raglens_dir).unwrap();
        std::fs::write(
            raglens_dir.join("config.toml"),
            r#"
[diagnosis]
default_period_days = 14
score_drop_fraction = 0.2
high_score_threshold = 0.85
low_score_threshold = 0.5
concentration_factor = 1.5
concentration_min_low = 2
min_evaluations = 20
top_low_scoring = 5

[store]
backend = "sqlite"
path = "/tmp/raglens-test.db"
"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.diagnosis.default_period_days, 14);
        assert_eq!(config.diagnosis.min_evaluations, 20);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(
            config.store.resolved_path(),
            PathBuf::from("/tmp/raglens-test.db")
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = EngineConfig::default();
        config.sampling.rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.batch.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.diagnosis.low_score_threshold = 0.9;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.providers.default_judge = "gemini".into();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.diagnosis.default_period_days = 100_000_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_provider_lookup() {
        let providers = ProvidersConfig::default();
        assert_eq!(providers.get("openai").unwrap().api_key_env, "OPENAI_API_KEY");
        assert!(providers.get("cohere").is_none());
    }
}

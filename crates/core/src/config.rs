use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::index::DEFAULT_DIMENSION;
use crate::intent::DEFAULT_MODEL_ESCALATION_THRESHOLD;
use crate::rules::DEFAULT_RULE_TTL_SECS;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub intent: IntentConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub dimension: usize,
}

#[derive(Clone, Debug)]
pub struct IntentConfig {
    /// Rule-stage confidence below which the model stage runs.
    pub model_escalation_threshold: f32,
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Whole-pipeline deadline; stages past it are abandoned.
    pub timeout_secs: u64,
    pub rate_limit_per_minute: u32,
    pub history_window: usize,
    pub search_limit: usize,
    pub search_min_score: f32,
    pub rule_cache_ttl_secs: i64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub embedding_api_key: Option<String>,
    pub pipeline_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
            },
            embedding: EmbeddingConfig {
                api_key: None,
                base_url: None,
                model: "text-embedding-3-small".to_string(),
                dimension: DEFAULT_DIMENSION,
            },
            intent: IntentConfig {
                model_escalation_threshold: DEFAULT_MODEL_ESCALATION_THRESHOLD,
            },
            pipeline: PipelineConfig {
                timeout_secs: 10,
                rate_limit_per_minute: 60,
                history_window: 10,
                search_limit: 5,
                search_min_score: 0.2,
                rule_cache_ttl_secs: DEFAULT_RULE_TTL_SECS,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    embedding: Option<EmbeddingPatch>,
    intent: Option<IntentPatch>,
    pipeline: Option<PipelinePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    dimension: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct IntentPatch {
    model_escalation_threshold: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct PipelinePatch {
    timeout_secs: Option<u64>,
    rate_limit_per_minute: Option<u32>,
    history_window: Option<usize>,
    search_limit: Option<usize>,
    search_min_score: Option<f32>,
    rule_cache_ttl_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tably.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(embedding) = patch.embedding {
            if let Some(embedding_api_key_value) = embedding.api_key {
                self.embedding.api_key = Some(secret_value(embedding_api_key_value));
            }
            if let Some(base_url) = embedding.base_url {
                self.embedding.base_url = Some(base_url);
            }
            if let Some(model) = embedding.model {
                self.embedding.model = model;
            }
            if let Some(dimension) = embedding.dimension {
                self.embedding.dimension = dimension;
            }
        }

        if let Some(intent) = patch.intent {
            if let Some(threshold) = intent.model_escalation_threshold {
                self.intent.model_escalation_threshold = threshold;
            }
        }

        if let Some(pipeline) = patch.pipeline {
            if let Some(timeout_secs) = pipeline.timeout_secs {
                self.pipeline.timeout_secs = timeout_secs;
            }
            if let Some(rate_limit_per_minute) = pipeline.rate_limit_per_minute {
                self.pipeline.rate_limit_per_minute = rate_limit_per_minute;
            }
            if let Some(history_window) = pipeline.history_window {
                self.pipeline.history_window = history_window;
            }
            if let Some(search_limit) = pipeline.search_limit {
                self.pipeline.search_limit = search_limit;
            }
            if let Some(search_min_score) = pipeline.search_min_score {
                self.pipeline.search_min_score = search_min_score;
            }
            if let Some(rule_cache_ttl_secs) = pipeline.rule_cache_ttl_secs {
                self.pipeline.rule_cache_ttl_secs = rule_cache_ttl_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TABLY_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("TABLY_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TABLY_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("TABLY_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("TABLY_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("TABLY_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TABLY_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("TABLY_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("TABLY_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TABLY_EMBEDDING_BASE_URL") {
            self.embedding.base_url = Some(value);
        }
        if let Some(value) = read_env("TABLY_EMBEDDING_MODEL") {
            self.embedding.model = value;
        }
        if let Some(value) = read_env("TABLY_EMBEDDING_DIMENSION") {
            self.embedding.dimension =
                parse_u64("TABLY_EMBEDDING_DIMENSION", &value)? as usize;
        }

        if let Some(value) = read_env("TABLY_INTENT_ESCALATION_THRESHOLD") {
            self.intent.model_escalation_threshold =
                parse_f32("TABLY_INTENT_ESCALATION_THRESHOLD", &value)?;
        }

        if let Some(value) = read_env("TABLY_PIPELINE_TIMEOUT_SECS") {
            self.pipeline.timeout_secs = parse_u64("TABLY_PIPELINE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TABLY_PIPELINE_RATE_LIMIT_PER_MINUTE") {
            self.pipeline.rate_limit_per_minute =
                parse_u32("TABLY_PIPELINE_RATE_LIMIT_PER_MINUTE", &value)?;
        }

        let log_level = read_env("TABLY_LOGGING_LEVEL").or_else(|| read_env("TABLY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("TABLY_LOGGING_FORMAT").or_else(|| read_env("TABLY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(embedding_api_key) = overrides.embedding_api_key {
            self.embedding.api_key = Some(secret_value(embedding_api_key));
        }
        if let Some(timeout_secs) = overrides.pipeline_timeout_secs {
            self.pipeline.timeout_secs = timeout_secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm(&self.llm)?;
        validate_embedding(&self.embedding)?;
        validate_intent(&self.intent)?;
        validate_pipeline(&self.pipeline)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tably.toml"), PathBuf::from("config/tably.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }
    if llm.timeout_secs == 0 || llm.timeout_secs > 120 {
        return Err(ConfigError::Validation("llm.timeout_secs must be in range 1..=120".to_string()));
    }
    if llm.provider != LlmProvider::Ollama {
        let has_key =
            llm.api_key.as_ref().map(|key| !key.expose_secret().is_empty()).unwrap_or(false);
        if !has_key {
            return Err(ConfigError::Validation(
                "llm.api_key is required for hosted providers".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_embedding(embedding: &EmbeddingConfig) -> Result<(), ConfigError> {
    if embedding.model.trim().is_empty() {
        return Err(ConfigError::Validation("embedding.model must not be empty".to_string()));
    }
    if embedding.dimension == 0 || embedding.dimension > 8192 {
        return Err(ConfigError::Validation(
            "embedding.dimension must be in range 1..=8192".to_string(),
        ));
    }
    Ok(())
}

fn validate_intent(intent: &IntentConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&intent.model_escalation_threshold) {
        return Err(ConfigError::Validation(
            "intent.model_escalation_threshold must be in range 0.0..=1.0".to_string(),
        ));
    }
    Ok(())
}

fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), ConfigError> {
    if !(1..=30).contains(&pipeline.timeout_secs) {
        return Err(ConfigError::Validation(
            "pipeline.timeout_secs must be in range 1..=30".to_string(),
        ));
    }
    if pipeline.rate_limit_per_minute == 0 {
        return Err(ConfigError::Validation(
            "pipeline.rate_limit_per_minute must be greater than zero".to_string(),
        ));
    }
    if pipeline.search_limit == 0 {
        return Err(ConfigError::Validation(
            "pipeline.search_limit must be greater than zero".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&pipeline.search_min_score) {
        return Err(ConfigError::Validation(
            "pipeline.search_min_score must be in range 0.0..=1.0".to_string(),
        ));
    }
    if pipeline.rule_cache_ttl_secs <= 0 {
        return Err(ConfigError::Validation(
            "pipeline.rule_cache_ttl_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let allowed = ["trace", "debug", "info", "warn", "error"];
    if !allowed.contains(&logging.level.to_ascii_lowercase().as_str()) {
        return Err(ConfigError::Validation(format!(
            "logging.level must be one of {}",
            allowed.join("|")
        )));
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() })
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() })
}

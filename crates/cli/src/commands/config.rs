use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use tably_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key: &str, env_var: &str| {
        field_source(key, env_var, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    let provider = format!("{:?}", config.llm.provider).to_lowercase();
    lines.push(render_line("llm.provider", &provider, source("llm.provider", "TABLY_LLM_PROVIDER")));
    lines.push(render_line("llm.model", &config.llm.model, source("llm.model", "TABLY_LLM_MODEL")));
    let llm_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_secret(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());
    lines.push(render_line("llm.api_key", &llm_key, source("llm.api_key", "TABLY_LLM_API_KEY")));
    lines.push(render_line(
        "llm.base_url",
        config.llm.base_url.as_deref().unwrap_or("<unset>"),
        source("llm.base_url", "TABLY_LLM_BASE_URL"),
    ));
    lines.push(render_line(
        "llm.timeout_secs",
        &config.llm.timeout_secs.to_string(),
        source("llm.timeout_secs", "TABLY_LLM_TIMEOUT_SECS"),
    ));

    lines.push(render_line(
        "embedding.model",
        &config.embedding.model,
        source("embedding.model", "TABLY_EMBEDDING_MODEL"),
    ));
    lines.push(render_line(
        "embedding.dimension",
        &config.embedding.dimension.to_string(),
        source("embedding.dimension", "TABLY_EMBEDDING_DIMENSION"),
    ));

    lines.push(render_line(
        "intent.model_escalation_threshold",
        &config.intent.model_escalation_threshold.to_string(),
        source("intent.model_escalation_threshold", "TABLY_INTENT_ESCALATION_THRESHOLD"),
    ));

    lines.push(render_line(
        "pipeline.timeout_secs",
        &config.pipeline.timeout_secs.to_string(),
        source("pipeline.timeout_secs", "TABLY_PIPELINE_TIMEOUT_SECS"),
    ));
    lines.push(render_line(
        "pipeline.rate_limit_per_minute",
        &config.pipeline.rate_limit_per_minute.to_string(),
        source("pipeline.rate_limit_per_minute", "TABLY_PIPELINE_RATE_LIMIT_PER_MINUTE"),
    ));
    lines.push(render_line(
        "pipeline.search_limit",
        &config.pipeline.search_limit.to_string(),
        source("pipeline.search_limit", ""),
    ));
    lines.push(render_line(
        "pipeline.search_min_score",
        &config.pipeline.search_min_score.to_string(),
        source("pipeline.search_min_score", ""),
    ));

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", "TABLY_LOGGING_LEVEL"),
    ));
    let format = format!("{:?}", config.logging.format).to_lowercase();
    lines.push(render_line("logging.format", &format, source("logging.format", "TABLY_LOGGING_FORMAT")));

    lines.join("\n")
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("  {key} = {value}  [{source}]")
}

fn redact_secret(secret: &str) -> String {
    if secret.len() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", &secret[..4])
    }
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("tably.toml"), PathBuf::from("config/tably.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    dotted_key: &str,
    env_var: &str,
    doc: Option<&Value>,
    file_path: Option<&Path>,
) -> String {
    if !env_var.is_empty() && env::var(env_var).map(|value| !value.trim().is_empty()).unwrap_or(false)
    {
        return format!("env:{env_var}");
    }
    if let (Some(doc), Some(path)) = (doc, file_path) {
        if file_has_key(doc, dotted_key) {
            return format!("file:{}", path.display());
        }
    }
    "default".to_string()
}

fn file_has_key(doc: &Value, dotted_key: &str) -> bool {
    let mut current = doc;
    for part in dotted_key.split('.') {
        match current.get(part) {
            Some(next) => current = next,
            None => return false,
        }
    }
    true
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CONFIG_SCHEMA: &str = include_str!("config.schema.json");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub gateway: Gateway,
    pub billing: Billing,
    pub responder: Responder,
    pub audit: Audit,
    #[serde(default)]
    pub limits: Limits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    pub mode: String,
    pub endpoint: Option<String>,
    pub timeout_ms: i64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_bot_account_id")]
    pub bot_account_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Billing {
    pub webhook_secret: String,
    #[serde(default = "default_signature_tolerance_secs")]
    pub signature_tolerance_secs: i64,
    #[serde(default)]
    pub plan_tokens: BTreeMap<String, i64>,
    #[serde(default = "default_plan_tokens")]
    pub default_plan_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Responder {
    pub mode: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_responder_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub capture_knowledge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub sink: String,
    pub jsonl_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    // 0 means unlimited.
    #[serde(default)]
    pub max_open_per_creator: usize,
}

fn default_retry_max_attempts() -> usize {
    1
}

fn default_retry_backoff_ms() -> u64 {
    0
}

fn default_bot_account_id() -> String {
    "deskhand-bot".to_string()
}

fn default_signature_tolerance_secs() -> i64 {
    300
}

fn default_plan_tokens() -> i64 {
    1
}

fn default_responder_timeout_ms() -> i64 {
    800
}

fn default_confidence_threshold() -> f64 {
    0.6
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(CONFIG_SCHEMA).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    match cfg.gateway.mode.as_str() {
        "simulated" => {}
        "webhook" => {
            if cfg
                .gateway
                .endpoint
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "gateway.endpoint is required when gateway.mode=webhook".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "gateway.mode={other} is not implemented; supported: simulated, webhook"
            )));
        }
    }
    if cfg.gateway.retry_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "gateway.retry_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.gateway.timeout_ms <= 0 {
        return Err(ConfigError::UnsupportedConfig(
            "gateway.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.billing.webhook_secret.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "billing.webhook_secret must not be empty".to_string(),
        ));
    }
    if cfg.billing.signature_tolerance_secs <= 0 {
        return Err(ConfigError::UnsupportedConfig(
            "billing.signature_tolerance_secs must be >= 1".to_string(),
        ));
    }
    match cfg.responder.mode.as_str() {
        "disabled" | "builtin" => {}
        "webhook" => {
            if cfg
                .responder
                .endpoint
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "responder.endpoint is required when responder.mode=webhook".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "responder.mode={other} is not implemented; supported: disabled, builtin, webhook"
            )));
        }
    }
    if !(0.0..=1.0).contains(&cfg.responder.confidence_threshold) {
        return Err(ConfigError::UnsupportedConfig(
            "responder.confidence_threshold must be within 0.0..=1.0".to_string(),
        ));
    }
    if cfg.audit.sink != "jsonl" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "audit.sink={} is not implemented; supported: jsonl",
            cfg.audit.sink
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("deskhand-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

gateway:
  mode: "simulated"
  timeout_ms: 800

billing:
  webhook_secret: "test-secret"

responder:
  mode: "disabled"

audit:
  sink: "jsonl"
  jsonl_path: "./deskhand-audit.jsonl"
"#
        .to_string()
    }

    #[test]
    fn accepts_minimal_config_and_applies_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("minimal config should be accepted");
        assert_eq!(cfg.gateway.retry_max_attempts, 1);
        assert_eq!(cfg.gateway.bot_account_id, "deskhand-bot");
        assert_eq!(cfg.billing.signature_tolerance_secs, 300);
        assert_eq!(cfg.billing.default_plan_tokens, 1);
        assert_eq!(cfg.limits.max_open_per_creator, 0);
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_webhook_gateway_without_endpoint() {
        let path = write_temp_config(&base_yaml().replace("mode: \"simulated\"", "mode: \"webhook\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_unknown_responder_mode() {
        let path = write_temp_config(&base_yaml().replace("mode: \"disabled\"", "mode: \"oracle\""));
        let err = load_and_validate(&path).expect_err("expected rejection");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_unsupported_audit_sink_at_runtime() {
        let path = write_temp_config(&base_yaml().replace("sink: \"jsonl\"", "sink: \"stdout\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_out_of_range_confidence_threshold() {
        let path = write_temp_config(&base_yaml().replace(
            "mode: \"disabled\"",
            "mode: \"builtin\"\n  confidence_threshold: 1.5",
        ));
        let err = load_and_validate(&path).expect_err("expected rejection");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }
}

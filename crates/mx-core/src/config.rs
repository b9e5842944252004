use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level fabric configuration.
///
/// Loaded from `~/.matrix-fabric/config.toml` when present, then overridden
/// by the `MATRIX_*` / retrieval / embedding environment variables. Unknown
/// environment variables are ignored; malformed values fall back to the
/// default with a warning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FabricConfig {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl FabricConfig {
    /// Load config from the default path, falling back to defaults when the
    /// file does not exist, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            let text =
                std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            FabricConfig::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Load from a specific path (no environment overrides).
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Environment-only configuration (defaults + env overrides).
    pub fn from_env() -> Self {
        let mut cfg = FabricConfig::default();
        cfg.apply_env();
        cfg
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".matrix-fabric")
            .join("config.toml")
    }

    /// Apply recognized environment variables on top of the current values.
    pub fn apply_env(&mut self) {
        env_override("MATRIX_HUB_PORT", &mut self.hub.port);
        env_override_string("MATRIX_HUB_HOST", &mut self.hub.host);
        if let Ok(pin) = std::env::var("MATRIX_HUB_PIN") {
            self.hub.pin = if pin.eq_ignore_ascii_case("disabled") {
                PinSetting::Disabled
            } else {
                PinSetting::Configured(pin)
            };
        }
        if let Ok(secret) = std::env::var("MATRIX_HUB_SECRET") {
            self.hub.secret = Some(secret);
        }
        env_override("MATRIX_TOKEN_EXPIRY_HOURS", &mut self.hub.token_expiry_hours);
        env_override_opt_string("MATRIX_HUB_TLS_CERT", &mut self.hub.tls_cert);
        env_override_opt_string("MATRIX_HUB_TLS_KEY", &mut self.hub.tls_key);
        env_override_opt_string("MATRIX_HUB_TLS_PASSPHRASE", &mut self.hub.tls_passphrase);

        env_override("MATRIX_DAEMON_PORT", &mut self.daemon.port);
        env_override("INDEXER_DAEMON_PORT", &mut self.daemon.indexer_port);

        env_override("VECTOR_WEIGHT", &mut self.retrieval.vector_weight);
        env_override("KEYWORD_WEIGHT", &mut self.retrieval.keyword_weight);

        env_override_string("EMBEDDING_PROVIDER", &mut self.embedding.provider);
        env_override_string("EMBEDDING_MODEL", &mut self.embedding.model);
        env_override("EMBEDDING_BATCH_SIZE", &mut self.embedding.batch_size);

        if let Ok(raw) = std::env::var("MEMORY_AGENT_ID") {
            match raw.parse() {
                Ok(v) => self.identity.agent_id = Some(v),
                Err(_) => tracing::warn!(value = %raw, "MEMORY_AGENT_ID is not numeric, ignoring"),
            }
        }
        env_override_opt_string("MEMORY_PROJECT_PATH", &mut self.identity.project_path);
    }
}

fn env_override<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(var = name, value = %raw, "unparseable env value, keeping default"),
        }
    }
}

fn env_override_string(name: &str, slot: &mut String) {
    if let Ok(raw) = std::env::var(name) {
        *slot = raw;
    }
}

fn env_override_opt_string(name: &str, slot: &mut Option<String>) {
    if let Ok(raw) = std::env::var(name) {
        *slot = Some(raw);
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

/// How the hub gates `/register`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PinSetting {
    /// Generate a random 6-char alphanumeric PIN at startup and log it.
    #[default]
    Random,
    /// Operator-supplied PIN.
    Configured(String),
    /// No PIN check at all.
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_hub_port")]
    pub port: u16,
    #[serde(default = "default_hub_host")]
    pub host: String,
    #[serde(default)]
    pub pin: PinSetting,
    /// Required for production token issuance; a random secret is minted at
    /// startup when absent.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_token_expiry_hours")]
    pub token_expiry_hours: u64,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
    #[serde(default)]
    pub tls_passphrase: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: default_hub_port(),
            host: default_hub_host(),
            pin: PinSetting::default(),
            secret: None,
            token_expiry_hours: default_token_expiry_hours(),
            tls_cert: None,
            tls_key: None,
            tls_passphrase: None,
        }
    }
}

fn default_hub_port() -> u16 {
    8081
}
fn default_hub_host() -> String {
    "localhost".into()
}
fn default_token_expiry_hours() -> u64 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_indexer_port")]
    pub indexer_port: u16,
    /// Display name announced to the hub; matrix id defaults to it.
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_daemon_port(),
            indexer_port: default_indexer_port(),
            display_name: None,
        }
    }
}

fn default_daemon_port() -> u16 {
    37888
}
fn default_indexer_port() -> u16 {
    37889
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.matrix-fabric/fabric.db".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
        }
    }
}

fn default_vector_weight() -> f64 {
    0.36
}
fn default_keyword_weight() -> f64 {
    0.64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_batch")]
    pub batch_size: usize,
    /// Base URL of the embedding endpoint; provider-specific default applies
    /// when unset.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Base URL of the ANN store.
    #[serde(default = "default_ann_url")]
    pub ann_url: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            batch_size: default_embedding_batch(),
            base_url: None,
            ann_url: default_ann_url(),
        }
    }
}

fn default_embedding_provider() -> String {
    "openai".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_embedding_batch() -> usize {
    32
}
fn default_ann_url() -> String {
    "http://127.0.0.1:6333".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    #[serde(default)]
    pub agent_id: Option<i64>,
    #[serde(default)]
    pub project_path: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = FabricConfig::default();
        assert_eq!(cfg.hub.port, 8081);
        assert_eq!(cfg.hub.host, "localhost");
        assert_eq!(cfg.hub.token_expiry_hours, 2);
        assert_eq!(cfg.daemon.port, 37888);
        assert_eq!(cfg.daemon.indexer_port, 37889);
        assert!((cfg.retrieval.vector_weight - 0.36).abs() < f64::EPSILON);
        assert!((cfg.retrieval.keyword_weight - 0.64).abs() < f64::EPSILON);
        assert_eq!(cfg.embedding.batch_size, 32);
        assert_eq!(cfg.hub.pin, PinSetting::Random);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = FabricConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: FabricConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.hub.port, cfg.hub.port);
        assert_eq!(parsed.daemon.port, cfg.daemon.port);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let parsed: FabricConfig = toml::from_str("[hub]\nport = 9999\n").unwrap();
        assert_eq!(parsed.hub.port, 9999);
        assert_eq!(parsed.hub.host, "localhost");
        assert_eq!(parsed.daemon.port, 37888);
    }

    #[test]
    fn pin_disabled_parses() {
        let parsed: FabricConfig = toml::from_str("[hub]\npin = \"disabled\"\n").unwrap();
        assert_eq!(parsed.hub.pin, PinSetting::Disabled);
    }
}

//! Configuration system
//!
//! Handles loading configuration from multiple sources:
//! - Global config (~/.config/chatrelay/config.toml)
//! - Project config (./chatrelay.toml or .chatrelay/config.toml)
//! - Environment variables (CHATRELAY_*, OPENAI_API_KEY)

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Chat model selectors offered to clients
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub entitlements: EntitlementsConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub mcp: McpConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            models: default_models(),
            providers: HashMap::new(),
            limits: LimitsConfig::default(),
            entitlements: EntitlementsConfig::default(),
            stream: StreamConfig::default(),
            mcp: McpConfig::default(),
            store: StoreConfig::default(),
            auth: AuthConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

fn default_models() -> HashMap<String, ModelConfig> {
    let mut models = HashMap::new();
    models.insert(
        "chat-model".to_string(),
        ModelConfig {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            reasoning: false,
        },
    );
    models.insert(
        "chat-model-reasoning".to_string(),
        ModelConfig {
            provider: "openai".to_string(),
            model: "o4-mini".to_string(),
            reasoning: true,
        },
    );
    models
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
        }
    }
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    /// Key into `providers`
    pub provider: String,
    /// Model id sent to the backend
    pub model: String,
    /// Reasoning-only models run without any tools
    #[serde(default)]
    pub reasoning: bool,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    /// API key (can also be set via env var)
    pub api_key: Option<String>,

    /// Base URL override for OpenAI-compatible endpoints
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("api_key_len", &self.api_key.as_ref().map(|k| k.len()))
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Model steps per generation
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Wall-clock ceiling for one generation
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    /// How long a finished reply stays resumable
    #[serde(default = "default_resume_freshness_secs")]
    pub resume_freshness_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_duration_secs: default_max_duration_secs(),
            resume_freshness_secs: default_resume_freshness_secs(),
        }
    }
}

impl LimitsConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn resume_freshness(&self) -> Duration {
        Duration::from_secs(self.resume_freshness_secs)
    }
}

fn default_max_steps() -> usize {
    5
}

fn default_max_duration_secs() -> u64 {
    60
}

fn default_resume_freshness_secs() -> u64 {
    15
}

/// Messages per rolling 24 hours, per user kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementsConfig {
    #[serde(default = "default_guest_messages")]
    pub guest_messages_per_day: usize,
    #[serde(default = "default_regular_messages")]
    pub regular_messages_per_day: usize,
}

impl Default for EntitlementsConfig {
    fn default() -> Self {
        Self {
            guest_messages_per_day: default_guest_messages(),
            regular_messages_per_day: default_regular_messages(),
        }
    }
}

fn default_guest_messages() -> usize {
    20
}

fn default_regular_messages() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Allow clients to reattach to in-flight generations
    #[serde(default = "default_true")]
    pub resumable: bool,
    /// Buffered events per live stream before slow readers lag
    #[serde(default = "default_stream_capacity")]
    pub capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            resumable: true,
            capacity: default_stream_capacity(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_stream_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default = "default_mcp_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_mcp_timeout(),
        }
    }
}

impl McpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_mcp_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Snapshot path for the file backend; defaults to the data dir
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Config::data_dir()
                .map(|d| d.join("chats.json"))
                .context("Could not determine data directory for the chat store"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserKind {
    Guest,
    #[default]
    Regular,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UserCredential {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub kind: UserKind,
}

impl std::fmt::Debug for UserCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredential")
            .field("token", &"<REDACTED>")
            .field("user_id", &self.user_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub users: Vec<UserCredential>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_weather_base_url")]
    pub weather_base_url: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            weather_base_url: default_weather_base_url(),
        }
    }
}

fn default_weather_base_url() -> String {
    "https://api.open-meteo.com".to_string()
}

/// One config file. Sections that are present replace the lower layer's
/// section; maps and lists are extended.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigLayer {
    server: Option<ServerConfig>,
    models: HashMap<String, ModelConfig>,
    providers: HashMap<String, ProviderConfig>,
    limits: Option<LimitsConfig>,
    entitlements: Option<EntitlementsConfig>,
    stream: Option<StreamConfig>,
    mcp: Option<McpConfig>,
    store: Option<StoreConfig>,
    auth: Option<AuthConfig>,
    tools: Option<ToolsConfig>,
}

impl Config {
    /// Load configuration from all sources (global, project, env)
    pub async fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            let content = fs::read_to_string(&global_path).await?;
            config = config.merge_str(&content).with_context(|| {
                format!("Invalid config file {}", global_path.display())
            })?;
        }

        for name in ["chatrelay.toml", ".chatrelay/config.toml"] {
            let path = PathBuf::from(name);
            if path.exists() {
                let content = fs::read_to_string(&path).await?;
                config = config
                    .merge_str(&content)
                    .with_context(|| format!("Invalid config file {}", path.display()))?;
            }
        }

        config.apply_env(|key| std::env::var(key).ok());

        Ok(config)
    }

    /// Defaults overlaid with one TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::default().merge_str(content)
    }

    /// Get the global config directory path
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "chatrelay", "chatrelay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get the data directory path
    pub fn data_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "chatrelay", "chatrelay").map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Initialize default configuration file
    pub async fn init_default() -> Result<Option<PathBuf>> {
        let Some(path) = Self::global_config_path() else {
            return Ok(None);
        };
        if path.exists() {
            anyhow::bail!("Config already exists at {}", path.display());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(&Self::default())?;
        fs::write(&path, content).await?;
        tracing::info!(path = %path.display(), "Created config");
        Ok(Some(path))
    }

    /// Copy safe to print: api keys and bearer tokens are masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for provider in config.providers.values_mut() {
            if provider.api_key.is_some() {
                provider.api_key = Some("<REDACTED>".to_string());
            }
        }
        for user in &mut config.auth.users {
            user.token = "<REDACTED>".to_string();
        }
        config
    }

    /// Look up a chat model selector.
    pub fn model(&self, selector: &str) -> Option<&ModelConfig> {
        self.models.get(selector)
    }

    fn merge_str(self, content: &str) -> Result<Self> {
        let layer: ConfigLayer = toml::from_str(content)?;
        Ok(self.merge(layer))
    }

    fn merge(mut self, other: ConfigLayer) -> Self {
        if let Some(server) = other.server {
            self.server = server;
        }
        self.models.extend(other.models);
        self.providers.extend(other.providers);
        if let Some(limits) = other.limits {
            self.limits = limits;
        }
        if let Some(entitlements) = other.entitlements {
            self.entitlements = entitlements;
        }
        if let Some(stream) = other.stream {
            self.stream = stream;
        }
        if let Some(mcp) = other.mcp {
            self.mcp = mcp;
        }
        if let Some(store) = other.store {
            self.store = store;
        }
        if let Some(auth) = other.auth {
            self.auth.users.extend(auth.users);
        }
        if let Some(tools) = other.tools {
            self.tools = tools;
        }
        self
    }

    /// Apply environment variable overrides
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("CHATRELAY_HOSTNAME") {
            self.server.hostname = val;
        }
        if let Some(val) = var("CHATRELAY_PORT") {
            match val.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!(value = %val, "Invalid CHATRELAY_PORT; keeping configured port"),
            }
        }
        if let Some(val) = var("OPENAI_API_KEY") {
            self.providers
                .entry("openai".to_string())
                .or_default()
                .api_key = Some(val);
        }
        if let Some(val) = var("OPENAI_BASE_URL") {
            self.providers
                .entry("openai".to_string())
                .or_default()
                .base_url = Some(val);
        }
        if let Some(val) = var("CHATRELAY_MAX_STEPS") {
            match val.parse() {
                Ok(steps) => self.limits.max_steps = steps,
                Err(_) => tracing::warn!(value = %val, "Invalid CHATRELAY_MAX_STEPS"),
            }
        }
        if let Some(val) = var("CHATRELAY_RESUMABLE_STREAMS") {
            match parse_bool(&val) {
                Ok(enabled) => self.stream.resumable = enabled,
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid CHATRELAY_RESUMABLE_STREAMS value; expected true/false"
                ),
            }
        }
        if let Some(val) = var("CHATRELAY_STORE") {
            match val.to_ascii_lowercase().as_str() {
                "memory" => self.store.backend = StoreBackend::Memory,
                "file" => self.store.backend = StoreBackend::File,
                _ => tracing::warn!(value = %val, "Invalid CHATRELAY_STORE; expected memory/file"),
            }
        }
        if let Some(val) = var("CHATRELAY_STORE_PATH") {
            self.store.path = Some(PathBuf::from(val));
        }
        if let Some(token) = var("CHATRELAY_AUTH_TOKEN").filter(|t| !t.is_empty()) {
            let user_id = var("CHATRELAY_AUTH_USER").unwrap_or_else(|| "local-user".to_string());
            self.auth.users.push(UserCredential {
                token,
                user_id,
                kind: UserKind::Regular,
            });
        }
        if let Some(val) = var("CHATRELAY_WEATHER_BASE_URL") {
            self.tools.weather_base_url = val;
        }
    }
}

pub fn parse_bool(value: &str) -> Result<bool> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Invalid boolean value: {}", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = Config::default();
        assert_eq!(config.limits.max_steps, 5);
        assert_eq!(config.limits.max_duration_secs, 60);
        assert_eq!(config.limits.resume_freshness_secs, 15);
        assert_eq!(config.entitlements.guest_messages_per_day, 20);
        assert!(config.stream.resumable);
        assert!(!config.model("chat-model").unwrap().reasoning);
        assert!(config.model("chat-model-reasoning").unwrap().reasoning);
    }

    #[test]
    fn file_layer_replaces_sections_and_extends_maps() {
        let config = Config::from_toml_str(
            r#"
            [limits]
            max_steps = 3

            [models.fast]
            provider = "local"
            model = "llama"

            [store]
            backend = "file"
            path = "/tmp/chats.json"

            [[auth.users]]
            token = "t1"
            user_id = "u1"
            kind = "guest"
            "#,
        )
        .unwrap();

        assert_eq!(config.limits.max_steps, 3);
        // Missing keys inside a present section fall back to defaults.
        assert_eq!(config.limits.max_duration_secs, 60);
        assert!(config.model("fast").is_some());
        assert!(config.model("chat-model").is_some());
        assert_eq!(config.store.backend, StoreBackend::File);
        assert_eq!(config.auth.users[0].kind, UserKind::Guest);
    }

    #[test]
    fn env_overrides_apply_last() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("CHATRELAY_PORT", "8080"),
            ("OPENAI_API_KEY", "sk-test"),
            ("CHATRELAY_RESUMABLE_STREAMS", "off"),
            ("CHATRELAY_AUTH_TOKEN", "secret"),
            ("CHATRELAY_STORE", "file"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 8080);
        assert_eq!(
            config.providers["openai"].api_key.as_deref(),
            Some("sk-test")
        );
        assert!(!config.stream.resumable);
        assert_eq!(config.auth.users[0].user_id, "local-user");
        assert_eq!(config.store.backend, StoreBackend::File);
    }

    #[test]
    fn secrets_are_redacted_in_debug() {
        let provider = ProviderConfig {
            api_key: Some("sk-very-secret".to_string()),
            base_url: None,
        };
        let user = UserCredential {
            token: "tok-very-secret".to_string(),
            user_id: "u".to_string(),
            kind: UserKind::Regular,
        };
        assert!(!format!("{:?}", provider).contains("very-secret"));
        assert!(!format!("{:?}", user).contains("very-secret"));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("Yes").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [provider]
//                    model = "mixtral-8x7b-32768"
//
//   env var:         RELAY_PROVIDER__MODEL=...   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub provider: ProviderFileConfig,
}

/// Server bind settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Auth-related tunables (lives under `[auth]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthFileConfig {
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_allow_registration")]
    pub allow_registration: bool,
}

impl Default for AuthFileConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            allow_registration: default_allow_registration(),
        }
    }
}

/// Completion provider tunables (lives under `[provider]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API key; `GROQ_API_KEY` is honored as a fallback.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_title_temperature")]
    pub title_temperature: f32,
    #[serde(default = "default_title_max_tokens")]
    pub title_max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProviderFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
            title_temperature: default_title_temperature(),
            title_max_tokens: default_title_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_session_ttl() -> u64 {
    7200
}
fn default_allow_registration() -> bool {
    true
}
fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}
fn default_model() -> String {
    "mixtral-8x7b-32768".to_string()
}
fn default_temperature() -> f32 {
    1.0
}
fn default_top_p() -> f32 {
    1.0
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_title_temperature() -> f32 {
    0.7
}
fn default_title_max_tokens() -> u32 {
    10
}
fn default_request_timeout_secs() -> u64 {
    120
}

/// Build a figment that layers: struct defaults → config.toml → RELAY_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_PROVIDER__MODEL=...`        →  `provider.model = ...`
///   `RELAY_AUTH__SESSION_TTL_SECS=60`  →  `auth.session_ttl_secs = 60`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("RELAY_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Authentication configuration (runtime view).
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Bearer token time-to-live in seconds
    pub session_ttl_secs: u64,
    /// Whether new user registration is open
    pub allow_registration: bool,
}

impl AuthConfig {
    pub fn from_file(fc: &AuthFileConfig) -> Self {
        Self {
            session_ttl_secs: fc.session_ttl_secs,
            allow_registration: fc.allow_registration,
        }
    }
}

/// Completion provider configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub title_temperature: f32,
    pub title_max_tokens: u32,
    /// Bound on the initial request and on each fragment gap.
    pub request_timeout: Duration,
}

impl ProviderConfig {
    /// Resolve the runtime view. The API key comes from the figment layers or,
    /// failing that, the `GROQ_API_KEY` environment variable.
    pub fn from_file(fc: &ProviderFileConfig) -> Result<Self> {
        let api_key = fc
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("GROQ_API_KEY").ok().filter(|k| !k.is_empty()))
            .context("provider API key missing: set provider.api_key or GROQ_API_KEY")?;

        Ok(Self {
            base_url: fc.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: fc.model.clone(),
            temperature: fc.temperature,
            top_p: fc.top_p,
            max_tokens: fc.max_tokens,
            title_temperature: fc.title_temperature,
            title_max_tokens: fc.title_max_tokens,
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
        })
    }
}

// =============================================================================
// Directory layout config (not tunable via figment — derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayDirs {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
}

impl RelayDirs {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = custom_dir.unwrap_or_else(|| {
            dirs::home_dir()
                .expect("Could not find home directory")
                .join(".chat-relay")
        });

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let db_path = data_dir.join("chat.db");

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir, db_path })
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path.display())
    }
}

//! Configuration module for cai-mcp
//! Loads server settings from a JSON file, all fields defaulted

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable pointing at an alternative config file
pub const CONFIG_ENV_VAR: &str = "CAI_MCP_CONFIG";

/// Server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    /// Where the token comes from
    pub credential: CredentialConfig,
    /// Upstream platform endpoints
    pub api: ApiConfig,
    /// HTTP transport configuration
    pub http: HttpConfig,
}

/// Token sources
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Environment variable checked before the token file
    pub env_var: String,
    /// Persisted token file (relative paths resolve against the working directory)
    pub token_file: PathBuf,
}

/// Character.AI endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Primary API host (chats, turns, rooms, voices)
    pub neo_url: String,
    /// Secondary "plus" host (account, characters)
    pub plus_url: String,
    /// Chat socket endpoint
    pub ws_url: String,
    /// Per-request timeout; none means the transport default
    pub request_timeout_secs: Option<u64>,
    /// Quiet period that ends a group chat reply round
    pub group_idle_ms: u64,
}

/// HTTP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Enable HTTP transport
    pub enabled: bool,
    /// Host to bind to (default: 127.0.0.1 for security)
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Client session timeout in seconds
    pub session_timeout_secs: u64,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            env_var: "CAI_TOKEN".to_string(),
            token_file: PathBuf::from(".cai_token"),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            neo_url: "https://neo.character.ai".to_string(),
            plus_url: "https://plus.character.ai".to_string(),
            ws_url: "wss://neo.character.ai/ws/".to_string(),
            request_timeout_secs: None,
            group_idle_ms: 4000,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false, // Disabled by default for security
            host: "127.0.0.1".to_string(),
            port: 3000,
            session_timeout_secs: 3600, // 1 hour
        }
    }
}

impl ServerConfig {
    fn with_defaults(mut self) -> Self {
        if self.log_level.is_empty() {
            self.log_level = "info".to_string();
        }
        self
    }
}

/// Default config file location (~/.cai-mcp/config.json)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cai-mcp").join("config.json"))
}

/// Load server configuration
///
/// An explicit path must exist; the default location is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<ServerConfig> {
    if let Some(path) = explicit {
        return read_config(path);
    }

    match default_config_path() {
        Some(path) if path.exists() => read_config(&path),
        _ => Ok(ServerConfig::default().with_defaults()),
    }
}

fn read_config(path: &Path) -> Result<ServerConfig> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read config at {:?}", path))?;

    let config: ServerConfig = serde_json::from_str(&content)
        .context(format!("Failed to parse config JSON at {:?}", path))?;

    Ok(config.with_defaults())
}

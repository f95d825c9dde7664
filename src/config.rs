use crate::types::{DestinationKind, TransformConfig};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub retry: RetryConfig,
    pub ocr: OcrConfig,
    pub attachments: AttachmentConfig,
    pub origins: OriginsConfig,
    pub destinations: Vec<DestinationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.channel-relay/metrics.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_seconds: i64,
    pub tick_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_seconds: 5,
            tick_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub enabled: bool,
    pub command: String,
    pub language: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "tesseract".to_string(),
            language: "eng".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentConfig {
    pub download_dir: String,
    pub allowed_extensions: Vec<String>,
    pub allowed_mime_types: Vec<String>,
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            download_dir: "~/.channel-relay/downloads".to_string(),
            allowed_extensions: ["jpg", "jpeg", "png", "gif", "webp", "pdf", "txt"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_mime_types: [
                "image/jpeg",
                "image/png",
                "image/gif",
                "image/webp",
                "application/pdf",
                "text/plain",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginsConfig {
    pub telegram: TelegramConfig,
    pub rss: RssConfig,
}

/// Bot credentials are shared by the channel-post poller and the telegram destination kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub poll_interval_seconds: u64,
    pub api_base_url: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: None,
            poll_interval_seconds: 2,
            api_base_url: "https://api.telegram.org".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RssConfig {
    pub enabled: bool,
    pub feeds: Vec<String>,
    pub poll_interval_seconds: u64,
}

impl Default for RssConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            feeds: Vec::new(),
            poll_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub name: String,
    pub kind: DestinationKind,
    /// Webhook URL for webhook kinds, chat specifier for telegram.
    pub address: String,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub restricted_mode: bool,
    #[serde(default)]
    pub ocr: bool,
    #[serde(default)]
    pub parser: Option<TransformConfig>,
}

impl Config {
    /// Logs configuration problems. Offending rules stay in place and are
    /// treated as no-ops where they are applied.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for dest in &self.destinations {
            if dest.address.trim().is_empty() {
                problems.push(format!("destination {} has no address", dest.name));
            }
            if dest.channels.is_empty() {
                problems.push(format!("destination {} has no channels", dest.name));
            }
            if dest.kind == DestinationKind::Telegram && self.origins.telegram.bot_token.is_none() {
                problems.push(format!(
                    "destination {} is a telegram destination but no bot token is configured",
                    dest.name
                ));
            }
            for entry in &dest.channels {
                if entry.keywords.iter().any(|kw| kw.trim().is_empty()) {
                    problems.push(format!(
                        "destination {} channel {} has a blank keyword",
                        dest.name, entry.id
                    ));
                }
                if let Some(parser) = entry.parser {
                    if parser.trim_front_lines < 0 || parser.trim_back_lines < 0 {
                        problems.push(format!(
                            "destination {} channel {} has negative trim bounds",
                            dest.name, entry.id
                        ));
                    }
                }
            }
        }
        for problem in &problems {
            warn!(problem = %problem, "configuration problem");
        }
        problems
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("CHANNEL_RELAY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.channel-relay/channel-relay.json"))
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();
    let mut cfg = Config::default();

    if config_path.exists() {
        match fs::read_to_string(&config_path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(file_cfg) => cfg = file_cfg,
                Err(err) => {
                    warn!(path = %config_path.display(), error = %err, "invalid config file, using defaults")
                }
            },
            Err(err) => {
                warn!(path = %config_path.display(), error = %err, "unreadable config file, using defaults")
            }
        }
    }

    apply_env_overrides(&mut cfg);
    cfg
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(token) = env_value("CHANNEL_RELAY_TOKEN") {
        cfg.auth.token = Some(token);
    }
    if let Some(url) = env_value("CHANNEL_RELAY_DATABASE_URL") {
        cfg.database.url = Some(url);
    }
    if let Some(path) = env_value("CHANNEL_RELAY_SQLITE_PATH") {
        cfg.database.sqlite_path = path;
    }
    if let Some(token) = env_value("CHANNEL_RELAY_TELEGRAM_BOT_TOKEN") {
        cfg.origins.telegram.bot_token = Some(token);
    }
    if let Some(dir) = env_value("CHANNEL_RELAY_DOWNLOAD_DIR") {
        cfg.attachments.download_dir = dir;
    }
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}?mode=rwc", path.to_string_lossy())
}

pub fn resolve_download_dir(cfg: &Config) -> PathBuf {
    expand_tilde(&cfg.attachments.download_dir)
}

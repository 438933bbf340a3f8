use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub phone: PhoneConfig,
    pub media: MediaConfig,
    pub storage: StorageConfig,
    pub backfill: BackfillConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Required in `X-Wa-Inbox-Token` by the admin routes when set.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
            admin_token: None,
        }
    }
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
            sqlite_path: "~/.wa-inbox/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub webhook_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            webhook_path: "/v1/webhook/:instance".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    pub country_code: String,
    /// Applied to subscriber-only numbers. `None` leaves them untouched.
    pub default_area_code: Option<String>,
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            country_code: "55".to_string(),
            default_area_code: Some("11".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_secs: u64,
    pub deadline_secs: u64,
    pub max_image_dimension: u32,
    pub max_sticker_dimension: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            attempt_timeout_secs: 30,
            deadline_secs: 300,
            max_image_dimension: 1600,
            max_sticker_dimension: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `fs` writes under `root_dir`; `http` uploads to `upload_url`.
    pub backend: String,
    pub root_dir: String,
    pub public_base_url: String,
    pub upload_url: Option<String>,
    pub api_token: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "fs".to_string(),
            root_dir: "~/.wa-inbox/media".to_string(),
            public_base_url: "http://127.0.0.1:8092/media".to_string(),
            upload_url: None,
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub batch: i64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: 60,
            batch: 25,
        }
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
    env::var("WA_INBOX_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.wa-inbox/wa-inbox.json"))
}

fn env_override(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();

    let mut cfg = Config::default();

    if config_path.exists() {
        match fs::read_to_string(&config_path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(file_cfg) => cfg = file_cfg,
                Err(err) => tracing::warn!(path = %config_path.display(), "ignoring invalid config file: {err}"),
            },
            Err(err) => tracing::warn!(path = %config_path.display(), "cannot read config file: {err}"),
        }
    }

    apply_env_overrides(&mut cfg);
    cfg
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(url) = env_override("WA_INBOX_DATABASE_URL") {
        cfg.database.url = Some(url);
    }
    if let Some(path) = env_override("WA_INBOX_SQLITE_PATH") {
        cfg.database.sqlite_path = path;
    }
    if let Some(url) = env_override("WA_INBOX_GATEWAY_URL") {
        cfg.gateway.base_url = Some(url);
    }
    if let Some(key) = env_override("WA_INBOX_GATEWAY_API_KEY") {
        cfg.gateway.api_key = Some(key);
    }
    if let Some(dir) = env_override("WA_INBOX_STORAGE_DIR") {
        cfg.storage.root_dir = dir;
    }
    if let Some(url) = env_override("WA_INBOX_STORAGE_PUBLIC_URL") {
        cfg.storage.public_base_url = url;
    }
    if let Some(url) = env_override("WA_INBOX_STORAGE_UPLOAD_URL") {
        cfg.storage.backend = "http".to_string();
        cfg.storage.upload_url = Some(url);
    }
    if let Some(token) = env_override("WA_INBOX_STORAGE_TOKEN") {
        cfg.storage.api_token = Some(token);
    }
    if let Some(token) = env_override("WA_INBOX_ADMIN_TOKEN") {
        cfg.server.admin_token = Some(token);
    }
    if let Some(area) = env_override("WA_INBOX_DEFAULT_AREA_CODE") {
        cfg.phone.default_area_code = match area.as_str() {
            "none" | "off" => None,
            _ => Some(area),
        };
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

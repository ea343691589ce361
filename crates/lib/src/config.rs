//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.tg-relay/config.json`) and then overridden
//! by environment variables (`TG_CHANNELS`, `DISCORD_WEBHOOK`, ...), which is how
//! systemd units and container deployments usually configure it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::format::LinkStyle;
use crate::targets::{parse_targets, Target};

/// Top-level relay config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Telegram side: credentials, channels, network.
    #[serde(default)]
    pub source: SourceConfig,

    /// Webhook side: URL and formatting.
    #[serde(default)]
    pub destination: DestinationConfig,

    /// Force unattended mode even when a terminal is attached.
    #[serde(default)]
    pub headless: bool,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    /// Bot token from BotFather. Overridden by TG_BOT_TOKEN; falls back to the session file.
    pub bot_token: Option<String>,

    /// Bot API base URL (default https://api.telegram.org).
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Session name; the token obtained at interactive login is stored in `<config dir>/<session>.session`.
    #[serde(default = "default_session")]
    pub session: String,

    /// Channels to relay (`@name` or numeric id). Entries may be comma-separated lists.
    #[serde(default)]
    pub channels: Vec<String>,

    /// Single channel; used only when `channels` is empty.
    pub channel: Option<String>,

    /// Headless connect timeout in seconds (default 15).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Interactive start timeout in seconds (default 120; covers typing credentials).
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    /// Per-request timeout for Bot API calls in seconds (default 8).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Bind outgoing connections to IPv4 (default true; IPv6 routes are broken on some VPS).
    #[serde(default = "default_true")]
    pub ipv4_only: bool,

    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Optional proxy for the Telegram side. SOCKS5 wins when both are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub socks5: Option<ProxyEndpoint>,
    pub http: Option<ProxyEndpoint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyScheme {
    Socks5,
    Http,
}

impl ProxyConfig {
    /// The proxy to use, if any.
    pub fn selected(&self) -> Option<(ProxyScheme, &ProxyEndpoint)> {
        self.socks5
            .as_ref()
            .filter(|p| !p.host.trim().is_empty())
            .map(|p| (ProxyScheme::Socks5, p))
            .or_else(|| {
                self.http
                    .as_ref()
                    .filter(|p| !p.host.trim().is_empty())
                    .map(|p| (ProxyScheme::Http, p))
            })
    }
}

/// Webhook destination settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConfig {
    /// Webhook URL. Mandatory. Overridden by DISCORD_WEBHOOK.
    pub webhook_url: Option<String>,

    /// Prepended to every caption, before the `[title]` (e.g. "[ANNOUNCEMENTS] ").
    #[serde(default)]
    pub prefix: String,

    /// Wrap deep links in `<...>` so the destination does not render previews.
    #[serde(default)]
    pub disable_preview: bool,

    /// Images above this size are replaced by a text notice (default 8 MiB).
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

/// Logger settings, consumed once by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace (default info).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append log lines to this file instead of stderr.
    pub file: Option<PathBuf>,

    /// Debug logging for the Telegram client module.
    #[serde(default)]
    pub platform_debug: bool,
}

/// Mandatory settings missing or invalid. Fatal at startup.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("webhook URL not configured: set DISCORD_WEBHOOK or destination.webhookUrl")]
    MissingWebhook,
    #[error("invalid webhook URL {0:?}: must start with http:// or https://")]
    InvalidWebhook(String),
    #[error("no channels provided: set TG_CHANNELS='@chan1,-100123...' or TG_CHANNEL='@one'")]
    NoTargets,
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_session() -> String {
    "forwarder".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_start_timeout_secs() -> u64 {
    120
}

fn default_request_timeout_secs() -> u64 {
    8
}

fn default_true() -> bool {
    true
}

fn default_max_upload_bytes() -> u64 {
    8 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_api_base(),
            session: default_session(),
            channels: Vec::new(),
            channel: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            start_timeout_secs: default_start_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            ipv4_only: true,
            proxy: ProxyConfig::default(),
        }
    }
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            prefix: String::new(),
            disable_preview: false,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
            platform_debug: false,
        }
    }
}

impl SourceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl DestinationConfig {
    pub fn link_style(&self) -> LinkStyle {
        if self.disable_preview {
            LinkStyle::NoPreview
        } else {
            LinkStyle::Bare
        }
    }
}

impl Config {
    /// Targets from `channels` (or `channel` when the list is empty), deduplicated in input order.
    pub fn targets(&self) -> Vec<Target> {
        let channels: Vec<&str> = self
            .source
            .channels
            .iter()
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
            .collect();
        if !channels.is_empty() {
            parse_targets(&channels)
        } else {
            self.source
                .channel
                .as_deref()
                .map(|c| parse_targets(&[c]))
                .unwrap_or_default()
        }
    }

    /// Check mandatory settings; returns the webhook URL and the non-empty target list.
    pub fn validate(&self) -> std::result::Result<(String, Vec<Target>), ConfigError> {
        let url = self
            .destination
            .webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::MissingWebhook)?;
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ConfigError::InvalidWebhook(url.to_string()));
        }
        let targets = self.targets();
        if targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        Ok((url.to_string(), targets))
    }

    /// Apply environment overrides. `lookup` is `std::env::var(..).ok()` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> std::result::Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("TG_BOT_TOKEN") {
            self.source.bot_token = Some(v);
        }
        if let Some(v) = get("TG_API_BASE") {
            self.source.api_base = v;
        }
        if let Some(v) = get("TG_SESSION") {
            self.source.session = v;
        }
        if let Some(v) = get("TG_CHANNELS") {
            self.source.channels = vec![v];
        }
        if let Some(v) = get("TG_CHANNEL") {
            self.source.channel = Some(v);
        }
        if let Some(v) = get("TG_CONNECT_TIMEOUT") {
            self.source.connect_timeout_secs = parse_number("TG_CONNECT_TIMEOUT", &v)?;
        }
        if let Some(v) = get("TG_START_TIMEOUT") {
            self.source.start_timeout_secs = parse_number("TG_START_TIMEOUT", &v)?;
        }
        if let Some(v) = get("DISCORD_WEBHOOK") {
            self.destination.webhook_url = Some(v);
        }
        // Prefix keeps its trailing whitespace ("[ANN] ").
        if let Some(v) = lookup("DISCORD_PREFIX") {
            self.destination.prefix = v;
        }
        if let Some(v) = get("DISABLE_PREVIEW") {
            self.destination.disable_preview = is_truthy(&v);
        }
        if let Some(v) = get("MAX_UPLOAD_BYTES") {
            self.destination.max_upload_bytes = parse_number("MAX_UPLOAD_BYTES", &v)?;
        }
        if let Some(v) = get("RELAY_HEADLESS") {
            self.headless = is_truthy(&v);
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v.to_lowercase();
        }
        if let Some(v) = get("LOG_FILE") {
            self.logging.file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("TELEGRAM_LOG") {
            self.logging.platform_debug = is_truthy(&v);
        }
        if let Some(p) = proxy_from_env("SOCKS5", &get)? {
            self.source.proxy.socks5 = Some(p);
        }
        if let Some(p) = proxy_from_env("HTTP_PROXY", &get)? {
            self.source.proxy.http = Some(p);
        }
        Ok(())
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: &str) -> std::result::Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}

/// `<PREFIX>_HOST` + `<PREFIX>_PORT` (both required), optional `_USER` / `_PASS`.
fn proxy_from_env<G>(prefix: &str, get: &G) -> std::result::Result<Option<ProxyEndpoint>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let (Some(host), Some(port)) = (get(&format!("{}_HOST", prefix)), get(&format!("{}_PORT", prefix))) else {
        return Ok(None);
    };
    let var = if prefix == "SOCKS5" { "SOCKS5_PORT" } else { "HTTP_PROXY_PORT" };
    Ok(Some(ProxyEndpoint {
        host,
        port: parse_number(var, &port)?,
        username: get(&format!("{}_USER", prefix)),
        password: get(&format!("{}_PASS", prefix)),
    }))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".tg-relay").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Directory holding the config file (and session files).
pub fn config_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf()
}

/// Load config from `path` (or the default path). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

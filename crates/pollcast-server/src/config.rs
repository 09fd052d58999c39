use anyhow::{bail, Context, Result};
use pollcast_core::{AppConfig, RateLimitConfig, DEFAULT_UPDATE_TOPIC};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_JWT_SECRET: &str = "change-me-in-production";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub bus: BusConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub public_url: Option<String>,
    /// Extra browser origins allowed to open WebSocket connections.
    pub allowed_origins: Vec<String>,
    /// Stable process identity in shared subscriber sets. Random when unset.
    pub node_id: Option<String>,
    pub ws_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            public_url: None,
            allowed_origins: Vec::new(),
            node_id: None,
            ws_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/pollcast.db?mode=rwc".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// `memory://` for a single process, `redis://host:port` to share state
    /// across processes.
    pub url: String,
    pub topic: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "memory://".to_string(),
            topic: DEFAULT_UPDATE_TOPIC.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_expiry_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
            jwt_expiry_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => bail!("unknown log format '{other}' (expected 'text' or 'json')"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Config {
    /// Read `path` (missing file means defaults), then apply `POLLCAST_*`
    /// environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {path}"))?;
            Self::from_toml(&raw).with_context(|| format!("invalid config file {path}"))?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("POLLCAST_BIND_ADDRESS") {
            self.server.bind_address = v;
        }
        if let Some(v) = lookup("POLLCAST_PUBLIC_URL") {
            self.server.public_url = Some(v).filter(|v| !v.trim().is_empty());
        }
        if let Some(v) = lookup("POLLCAST_ALLOWED_ORIGINS") {
            self.server.allowed_origins = v
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("POLLCAST_NODE_ID") {
            self.server.node_id = Some(v);
        }
        if let Some(v) = lookup("POLLCAST_DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = lookup("POLLCAST_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_var("POLLCAST_DATABASE_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("POLLCAST_BUS_URL") {
            self.bus.url = v;
        }
        if let Some(v) = lookup("POLLCAST_BUS_TOPIC") {
            self.bus.topic = v;
        }
        if let Some(v) = lookup("POLLCAST_JWT_SECRET") {
            self.auth.jwt_secret = v;
        }
        if let Some(v) = lookup("POLLCAST_JWT_EXPIRY_SECONDS") {
            self.auth.jwt_expiry_seconds = parse_var("POLLCAST_JWT_EXPIRY_SECONDS", &v)?;
        }
        if let Some(v) = lookup("POLLCAST_RATE_LIMIT_WINDOW_MS") {
            self.rate_limit.window_ms = parse_var("POLLCAST_RATE_LIMIT_WINDOW_MS", &v)?;
        }
        if let Some(v) = lookup("POLLCAST_RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limit.max_requests = parse_var("POLLCAST_RATE_LIMIT_MAX_REQUESTS", &v)?;
        }
        if let Some(v) = lookup("POLLCAST_LOG_FORMAT") {
            self.logging.format = v.parse()?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.trim().is_empty() {
            bail!("auth.jwt_secret must not be empty");
        }
        if self.bus.topic.trim().is_empty() {
            bail!("bus.topic must not be empty");
        }
        if self.rate_limit.window_ms == 0 || self.rate_limit.max_requests == 0 {
            bail!("rate_limit.window_ms and rate_limit.max_requests must be positive");
        }
        Ok(())
    }

    pub fn uses_default_jwt_secret(&self) -> bool {
        self.auth.jwt_secret == DEFAULT_JWT_SECRET
    }

    pub fn app_config(&self) -> AppConfig {
        AppConfig {
            node_id: self
                .server
                .node_id
                .clone()
                .unwrap_or_else(pollcast_core::new_node_id),
            jwt_secret: self.auth.jwt_secret.clone(),
            jwt_expiry_seconds: self.auth.jwt_expiry_seconds,
            rate_limit: self.rate_limit,
            update_topic: self.bus.topic.clone(),
            public_url: self.server.public_url.clone(),
            allowed_origins: self.server.allowed_origins.clone(),
            ws_queue_capacity: self.server.ws_queue_capacity,
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {key} value '{value}': {e}"))
}

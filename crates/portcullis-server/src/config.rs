//! Server configuration loaded from `PORTCULLIS_*` environment variables.
//!
//! # Environment Variables
//!
//! - `PORTCULLIS_BIND_ADDR`: HTTP listen address. Default: `0.0.0.0:3000`
//! - `PORTCULLIS_ISSUER`: Token issuer and public base URL. Default: `http://localhost:3000/`
//! - `PORTCULLIS_DB_PATH`: libsql database file. In-memory when unset
//! - `PORTCULLIS_SESSION_HASH_KEY`: HMAC key for session tokens at rest (optional)
//! - `PORTCULLIS_DEFAULT_AUDIENCE`: Access token audience when the tenant has none
//! - `PORTCULLIS_KEY_RETENTION_DAYS`: Age at which the signing key is rotated. Default: 30
//! - `PORTCULLIS_JWKS_CACHE_HORIZON_SECS`: How long revoked keys stay published. Default: 600
//! - `PORTCULLIS_HTTP_TIMEOUT_SECS`: Timeout for calls to federated providers. Default: 10
//! - `PORTCULLIS_KEY_ROTATION_INTERVAL_HOURS`: Background rotation check, 0 disables. Default: 0
//! - `PORTCULLIS_CORS_ORIGINS`: Comma-separated allowed origins. Permissive when unset
//! - `PORTCULLIS_SOCIAL_PROVIDERS_JSON`: JSON array of social provider configurations
//! - `PORTCULLIS_BOOTSTRAP_FILE`: JSON file with tenants, applications and connections to seed
//! - `PORTCULLIS_LOG_FORMAT`: `pretty` (default) or `json`

use chrono::Duration;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::auth::social::ProviderSettings;

pub const DEFAULT_AUDIENCE: &str = "urn:portcullis:default";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Always ends with `/`.
    pub issuer: String,
    pub db_path: Option<PathBuf>,
    pub session_hash_key: Option<String>,
    pub default_audience: String,
    pub key_retention: Duration,
    pub jwks_cache_horizon: Duration,
    pub http_timeout: std::time::Duration,
    pub key_rotation_interval: Option<std::time::Duration>,
    pub cors_origins: Vec<String>,
    pub social_providers: Vec<ProviderSettings>,
    pub bootstrap_path: Option<PathBuf>,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            issuer: "http://localhost:3000/".to_string(),
            db_path: None,
            session_hash_key: None,
            default_audience: DEFAULT_AUDIENCE.to_string(),
            key_retention: Duration::days(30),
            jwks_cache_horizon: Duration::seconds(600),
            http_timeout: std::time::Duration::from_secs(10),
            key_rotation_interval: None,
            cors_origins: Vec::new(),
            social_providers: Vec::new(),
            bootstrap_path: None,
            log_format: LogFormat::Pretty,
        }
    }
}

fn env_opt(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env_opt(var) {
        Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
            var,
            reason: format!("{}", e),
        }),
        None => Ok(default),
    }
}

/// Normalizes an issuer URL so it ends with exactly one `/`.
pub fn normalize_issuer(issuer: &str) -> String {
    format!("{}/", issuer.trim().trim_end_matches('/'))
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_addr = match env_opt("PORTCULLIS_BIND_ADDR") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::Invalid {
                var: "PORTCULLIS_BIND_ADDR",
                reason: format!("{}", e),
            })?,
            None => defaults.bind_addr,
        };

        let issuer = env_opt("PORTCULLIS_ISSUER")
            .map(|v| normalize_issuer(&v))
            .unwrap_or(defaults.issuer);
        url::Url::parse(&issuer).map_err(|e| ConfigError::Invalid {
            var: "PORTCULLIS_ISSUER",
            reason: e.to_string(),
        })?;

        let retention_days = env_u64("PORTCULLIS_KEY_RETENTION_DAYS", 30)?;
        let horizon_secs = env_u64("PORTCULLIS_JWKS_CACHE_HORIZON_SECS", 600)?;
        let timeout_secs = env_u64("PORTCULLIS_HTTP_TIMEOUT_SECS", 10)?;
        let rotation_hours = env_u64("PORTCULLIS_KEY_ROTATION_INTERVAL_HOURS", 0)?;

        let cors_origins = env_opt("PORTCULLIS_CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let social_providers = match env_opt("PORTCULLIS_SOCIAL_PROVIDERS_JSON") {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid {
                var: "PORTCULLIS_SOCIAL_PROVIDERS_JSON",
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };

        Ok(Self {
            bind_addr,
            issuer,
            db_path: env_opt("PORTCULLIS_DB_PATH").map(PathBuf::from),
            session_hash_key: env_opt("PORTCULLIS_SESSION_HASH_KEY"),
            default_audience: env_opt("PORTCULLIS_DEFAULT_AUDIENCE")
                .unwrap_or(defaults.default_audience),
            key_retention: Duration::days(retention_days as i64),
            jwks_cache_horizon: Duration::seconds(horizon_secs as i64),
            http_timeout: std::time::Duration::from_secs(timeout_secs),
            key_rotation_interval: (rotation_hours > 0)
                .then(|| std::time::Duration::from_secs(rotation_hours * 3600)),
            cors_origins,
            social_providers,
            bootstrap_path: env_opt("PORTCULLIS_BOOTSTRAP_FILE").map(PathBuf::from),
            log_format: env_opt("PORTCULLIS_LOG_FORMAT")
                .map(|v| LogFormat::from_str(&v))
                .unwrap_or_default(),
        })
    }

    /// Absolute URL for a path under the issuer.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.issuer, path.trim_start_matches('/'))
    }

    /// Cookies are marked `Secure` when the issuer is served over https.
    pub fn secure_cookies(&self) -> bool {
        self.issuer.starts_with("https://")
    }

    /// Log the effective configuration. Secrets are reported as set/unset only.
    pub fn log_config(&self) {
        info!("Issuer: {}", self.issuer);
        info!("Bind address: {}", self.bind_addr);
        match &self.db_path {
            Some(path) => info!("Database: {}", path.display()),
            None => info!("Database: in-memory (development mode)"),
        }
        info!(
            "Session hash key: {}",
            if self.session_hash_key.is_some() {
                "set"
            } else {
                "unset (plain SHA-256)"
            }
        );
        info!("Default audience: {}", self.default_audience);
        info!(
            "Signing keys: retention {} days, JWKS horizon {}s",
            self.key_retention.num_days(),
            self.jwks_cache_horizon.num_seconds()
        );
        match self.key_rotation_interval {
            Some(interval) => info!("Key rotation check every {}s", interval.as_secs()),
            None => info!("Background key rotation: disabled"),
        }
        let providers: Vec<_> = self.social_providers.iter().map(|p| p.strategy.as_str()).collect();
        info!("Social providers: {:?}", providers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_is_normalized_with_single_trailing_slash() {
        assert_eq!(normalize_issuer("https://id.example.com"), "https://id.example.com/");
        assert_eq!(normalize_issuer("https://id.example.com//"), "https://id.example.com/");
    }

    #[test]
    fn default_config_values() {
        let config = ServerConfig::default();
        assert_eq!(config.default_audience, DEFAULT_AUDIENCE);
        assert_eq!(config.key_retention.num_days(), 30);
        assert!(config.key_rotation_interval.is_none());
        assert!(!config.secure_cookies());
        assert_eq!(config.url("/u/login"), "http://localhost:3000/u/login");
    }

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::from_str("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_str("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("anything"), LogFormat::Pretty);
    }
}

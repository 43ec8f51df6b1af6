use crate::cors::{AccessControlPolicy, CorsMode};
use crate::proxy::AppState;
use http::Uri;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the TOML config file.
pub const CONFIG_PATH_ENV: &str = "PROXYD_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "proxyd.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    /// Only requests under this path prefix are proxied; everything else is 404.
    #[serde(default)]
    pub path_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_max_body_size")]
    pub max_body_size_bytes: u64,
    #[serde(default = "default_client_max_age")]
    pub client_max_age_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CorsConfig {
    #[serde(default)]
    pub mode: CorsMode,
    #[serde(default = "default_allow_methods")]
    pub allow_methods: String,
    #[serde(default = "default_allow_headers")]
    pub allow_headers: String,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default = "default_allow_loopback")]
    pub allow_loopback: bool,
    #[serde(default)]
    pub fallback_origin: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            cache: CacheConfig::default(),
            cors: CorsConfig::default(),
        }
    }

    /// Apply `PROXYD_*` environment overrides on top of the file values.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("PROXYD_BASE_PROXY_URL").filter(|v| !v.is_empty()) {
            self.upstream.url = url;
        }
        if let Some(key) = lookup("PROXYD_PROXY_API_KEY").filter(|v| !v.is_empty()) {
            self.upstream.api_key = Some(key);
        }
        if let Some(addr) = lookup("PROXYD_LISTEN_ADDR").filter(|v| !v.is_empty()) {
            self.server.listen_addr = addr;
        }
        if let Some(ttl) = lookup("PROXYD_CACHE_TTL_SECONDS") {
            self.cache.ttl_seconds = ttl.trim().parse().map_err(|e| ConfigError::Invalid {
                field: "PROXYD_CACHE_TTL_SECONDS",
                reason: format!("{e}"),
            })?;
        }
        Ok(())
    }

    /// Reject configurations the proxy cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.upstream_uri()?;

        http::HeaderName::from_bytes(self.upstream.api_key_header.as_bytes()).map_err(|e| {
            ConfigError::Invalid {
                field: "upstream.api_key_header",
                reason: e.to_string(),
            }
        })?;

        if let Some(prefix) = &self.server.path_prefix {
            if !prefix.starts_with('/') {
                return Err(ConfigError::Invalid {
                    field: "server.path_prefix",
                    reason: format!("{prefix:?} must start with '/'"),
                });
            }
        }

        if self.upstream.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "upstream.timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.cache.sweep_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                field: "cache.sweep_interval_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }

        self.access_control_policy().map(|_| ())
    }

    pub fn upstream_uri(&self) -> Result<Uri, ConfigError> {
        let uri: Uri = self.upstream.url.parse().map_err(|e: http::uri::InvalidUri| {
            ConfigError::Invalid {
                field: "upstream.url",
                reason: e.to_string(),
            }
        })?;
        match (uri.scheme_str(), uri.authority()) {
            (Some("http" | "https"), Some(_)) => Ok(uri),
            _ => Err(ConfigError::Invalid {
                field: "upstream.url",
                reason: format!("{} must be an absolute http(s) URL", self.upstream.url),
            }),
        }
    }

    pub fn access_control_policy(&self) -> Result<AccessControlPolicy, ConfigError> {
        AccessControlPolicy::from_config(&self.cors)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
            path_prefix: None,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            api_key: None,
            api_key_header: default_api_key_header(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl(),
            max_body_size_bytes: default_max_body_size(),
            client_max_age_seconds: default_client_max_age(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            mode: CorsMode::default(),
            allow_methods: default_allow_methods(),
            allow_headers: default_allow_headers(),
            allowed_domains: Vec::new(),
            allow_loopback: default_allow_loopback(),
            fallback_origin: None,
        }
    }
}

/// Compare old and new config, apply safe changes, warn about the rest.
///
/// - TTL changed → applied to the store for subsequent puts
/// - CORS section changed → new policy swapped in atomically
/// - Upstream, listener or capture limits changed → WARN, restart required
pub fn diff_and_apply(old: &Config, new: &Config, state: &AppState) {
    if old.cache.ttl_seconds != new.cache.ttl_seconds {
        state.cache.set_ttl(new.ttl());
        if new.cache.ttl_seconds == 0 {
            tracing::warn!("config reloaded: TTL is zero, caching disabled");
        }
        tracing::info!(
            old = old.cache.ttl_seconds,
            new = new.cache.ttl_seconds,
            "config reloaded: TTL changed"
        );
    }

    if old.cors != new.cors {
        match new.access_control_policy() {
            Ok(policy) => {
                state.cors.store(std::sync::Arc::new(policy));
                tracing::info!(mode = ?new.cors.mode, "config reloaded: CORS policy changed");
            }
            Err(e) => {
                tracing::error!(error = %e, "rejected CORS change, keeping previous policy");
            }
        }
    }

    if old.server != new.server || old.upstream != new.upstream {
        tracing::warn!("server or upstream settings changed, restart to apply");
    }

    if old.cache.max_body_size_bytes != new.cache.max_body_size_bytes
        || old.cache.client_max_age_seconds != new.cache.client_max_age_seconds
        || old.cache.sweep_interval_seconds != new.cache.sweep_interval_seconds
    {
        tracing::warn!("cache limits changed, restart to apply");
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:1137".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_upstream_url() -> String {
    "https://api.coingecko.com".to_string()
}
fn default_api_key_header() -> String {
    "x-cg-pro-api-key".to_string()
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_ttl() -> u64 {
    60
}
fn default_max_body_size() -> u64 {
    10 * 1024 * 1024
}
fn default_client_max_age() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_allow_methods() -> String {
    "GET, HEAD, OPTIONS".to_string()
}
fn default_allow_headers() -> String {
    "Accept, Content-Type, Origin".to_string()
}
fn default_allow_loopback() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default_config());
        assert_eq!(config.server.listen_addr, "0.0.0.0:1137");
        assert_eq!(config.upstream.url, "https://api.coingecko.com");
        assert_eq!(config.cache.max_body_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.cors.mode, CorsMode::Open);
        config.validate().unwrap();
    }

    #[test]
    fn parses_full_file() {
        let config = Config::parse(
            r#"
            [server]
            listen_addr = "127.0.0.1:8080"
            path_prefix = "/api/v3"

            [upstream]
            url = "https://pro-api.coingecko.com"
            api_key = "secret"
            timeout_ms = 2500

            [cache]
            ttl_seconds = 15

            [cors]
            mode = "restricted"
            allowed_domains = ["example.com"]
            fallback_origin = "https://app.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.path_prefix.as_deref(), Some("/api/v3"));
        assert_eq!(config.upstream.api_key.as_deref(), Some("secret"));
        assert_eq!(config.upstream.api_key_header, "x-cg-pro-api-key");
        assert_eq!(config.cache.ttl_seconds, 15);
        assert_eq!(config.cache.client_max_age_seconds, 30);
        assert_eq!(config.cors.mode, CorsMode::Restricted);
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("PROXYD_BASE_PROXY_URL", "http://127.0.0.1:3000"),
            ("PROXYD_PROXY_API_KEY", "k"),
            ("PROXYD_CACHE_TTL_SECONDS", "5"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default_config();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.upstream.url, "http://127.0.0.1:3000");
        assert_eq!(config.upstream.api_key.as_deref(), Some("k"));
        assert_eq!(config.cache.ttl_seconds, 5);
        assert_eq!(config.server.listen_addr, "0.0.0.0:1137");
    }

    #[test]
    fn bad_ttl_override_is_rejected() {
        let mut config = Config::default_config();
        let err = config
            .apply_overrides(|name| (name == "PROXYD_CACHE_TTL_SECONDS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "PROXYD_CACHE_TTL_SECONDS", .. }));
    }

    #[test]
    fn relative_upstream_url_is_rejected() {
        let mut config = Config::default_config();
        config.upstream.url = "/api".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "upstream.url", .. })
        ));
    }

    #[test]
    fn prefix_must_be_absolute() {
        let mut config = Config::default_config();
        config.server.path_prefix = Some("api".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn restricted_mode_needs_fallback_origin() {
        let config = Config::parse(
            r#"
            [cors]
            mode = "restricted"
            allowed_domains = ["example.com"]
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "cors.fallback_origin", .. })
        ));
    }
}

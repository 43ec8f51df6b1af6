use crate::config::{ConfigError, CorsConfig};
use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, VARY,
};
use http::{HeaderMap, HeaderValue, Uri};
use serde::Deserialize;

/// How `Access-Control-Allow-Origin` is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorsMode {
    /// Every origin gets `*`.
    #[default]
    Open,
    /// Approved origins are echoed back, everyone else gets the fallback origin.
    Restricted,
}

/// The three CORS values for one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsHeaders {
    pub allow_origin: HeaderValue,
    pub allow_methods: HeaderValue,
    pub allow_headers: HeaderValue,
    /// The allowed origin depends on the request's `Origin`.
    pub varies_by_origin: bool,
}

impl CorsHeaders {
    /// Overwrite the CORS headers in `headers` with these values.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, self.allow_origin.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
        if self.varies_by_origin {
            headers.append(VARY, HeaderValue::from_static("Origin"));
        }
    }
}

/// Stateless origin policy. Evaluated for every response, cache hits
/// included, because a shared cache entry may have been captured for a
/// caller with a different `Origin`.
///
/// Host comparison is ASCII case-insensitive and an allowed domain matches
/// itself and subdomains at any depth (`example.com` admits
/// `a.b.example.com`).
#[derive(Debug, Clone)]
pub struct AccessControlPolicy {
    mode: CorsMode,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
    allowed_domains: Vec<String>,
    allow_loopback: bool,
    fallback_origin: HeaderValue,
}

impl AccessControlPolicy {
    pub fn from_config(config: &CorsConfig) -> Result<Self, ConfigError> {
        let header = |field: &'static str, value: &str| {
            HeaderValue::from_str(value).map_err(|e| ConfigError::Invalid {
                field,
                reason: e.to_string(),
            })
        };

        let fallback_origin = match (config.mode, config.fallback_origin.as_deref()) {
            (_, Some(origin)) => header("cors.fallback_origin", origin)?,
            (CorsMode::Open, None) => HeaderValue::from_static("*"),
            (CorsMode::Restricted, None) => {
                return Err(ConfigError::Invalid {
                    field: "cors.fallback_origin",
                    reason: "required when cors.mode is \"restricted\"".to_string(),
                })
            }
        };

        Ok(Self {
            mode: config.mode,
            allow_methods: header("cors.allow_methods", &config.allow_methods)?,
            allow_headers: header("cors.allow_headers", &config.allow_headers)?,
            allowed_domains: config
                .allowed_domains
                .iter()
                .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            allow_loopback: config.allow_loopback,
            fallback_origin,
        })
    }

    pub fn mode(&self) -> CorsMode {
        self.mode
    }

    /// Compute the CORS headers for a request carrying `origin`.
    pub fn evaluate(&self, origin: Option<&HeaderValue>) -> CorsHeaders {
        let allow_origin = match self.mode {
            CorsMode::Open => HeaderValue::from_static("*"),
            CorsMode::Restricted => match origin {
                Some(origin) if self.is_approved(origin) => origin.clone(),
                _ => self.fallback_origin.clone(),
            },
        };

        CorsHeaders {
            allow_origin,
            allow_methods: self.allow_methods.clone(),
            allow_headers: self.allow_headers.clone(),
            varies_by_origin: self.mode == CorsMode::Restricted,
        }
    }

    fn is_approved(&self, origin: &HeaderValue) -> bool {
        let Some(host) = origin_host(origin) else {
            return false;
        };

        if self.allow_loopback && matches!(host.as_str(), "localhost" | "127.0.0.1" | "[::1]") {
            return true;
        }

        self.allowed_domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }
}

/// Lowercased host of an `Origin` value, if it is a well-formed http(s) origin.
fn origin_host(origin: &HeaderValue) -> Option<String> {
    let uri: Uri = origin.to_str().ok()?.parse().ok()?;
    match uri.scheme_str() {
        Some("http" | "https") => {}
        _ => return None,
    }
    if uri.path_and_query().is_some_and(|pq| pq.as_str() != "/") {
        return None;
    }
    uri.host().map(|h| h.to_ascii_lowercase())
}

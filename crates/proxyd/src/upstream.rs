use crate::config::{Config, ConfigError};
use crate::headers;
use axum::body::Body;
use http::header::HeaderName;
use http::uri::{Authority, Scheme};
use http::{HeaderValue, Request, Response, Uri};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;

pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("failed to build upstream request: {0}")]
    Build(#[from] http::Error),
    #[error("upstream request failed: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
}

impl ForwardError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Build(_) => "build",
            ForwardError::Transport(_) => "transport",
            ForwardError::Timeout(_) => "timeout",
        }
    }
}

/// Build the HTTP(S) client used for upstream requests.
pub fn build_client() -> Result<HttpClient, rustls::Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();

    Ok(Client::builder(TokioExecutor::new()).build(https))
}

/// The single upstream every request is forwarded to.
#[derive(Debug, Clone)]
pub struct Upstream {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    api_key: Option<(HeaderName, HeaderValue)>,
    timeout: Duration,
}

impl Upstream {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let uri = config.upstream_uri()?;
        let invalid = |reason: String| ConfigError::Invalid {
            field: "upstream.url",
            reason,
        };
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| invalid("missing scheme".to_string()))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("missing host".to_string()))?;

        let api_key = match &config.upstream.api_key {
            Some(key) => {
                let name = HeaderName::from_bytes(config.upstream.api_key_header.as_bytes())
                    .map_err(|e| ConfigError::Invalid {
                        field: "upstream.api_key_header",
                        reason: e.to_string(),
                    })?;
                let mut value =
                    HeaderValue::from_str(key).map_err(|e| ConfigError::Invalid {
                        field: "upstream.api_key",
                        reason: e.to_string(),
                    })?;
                value.set_sensitive(true);
                Some((name, value))
            }
            None => None,
        };

        Ok(Self {
            scheme,
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
            api_key,
            timeout: Duration::from_millis(config.upstream.timeout_ms),
        })
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Rewrite a client request URI onto the upstream host.
    fn uri_for(&self, client_uri: &Uri) -> Result<Uri, http::Error> {
        let path_and_query = client_uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(format!("{}{}", self.base_path, path_and_query))
            .build()
    }

    /// Forward a client request and wait for the upstream's response head.
    ///
    /// Method, path, query, body and end-to-end headers pass through; the
    /// host is rewritten and the configured API key injected.
    pub async fn forward(
        &self,
        client: &HttpClient,
        req: Request<Body>,
    ) -> Result<Response<Incoming>, ForwardError> {
        let (mut parts, body) = req.into_parts();
        let uri = self.uri_for(&parts.uri)?;

        headers::sanitize_forwarded(&mut parts.headers);
        if let Some((name, value)) = &self.api_key {
            parts.headers.insert(name.clone(), value.clone());
        }

        let mut out = Request::new(body);
        *out.method_mut() = parts.method;
        *out.uri_mut() = uri;
        *out.headers_mut() = parts.headers;

        match tokio::time::timeout(self.timeout, client.request(out)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ForwardError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(url: &str, api_key: Option<&str>) -> Upstream {
        let mut config = Config::default_config();
        config.upstream.url = url.to_string();
        config.upstream.api_key = api_key.map(str::to_string);
        Upstream::from_config(&config).unwrap()
    }

    #[test]
    fn rewrites_onto_upstream_host() {
        let up = upstream("https://api.coingecko.com", None);
        let uri = up
            .uri_for(&"/api/v3/coins?ids=bitcoin".parse().unwrap())
            .unwrap();
        assert_eq!(uri, "https://api.coingecko.com/api/v3/coins?ids=bitcoin");
    }

    #[test]
    fn joins_base_path() {
        let up = upstream("http://127.0.0.1:3000/gecko/", None);
        let uri = up.uri_for(&"/api/v3/ping".parse().unwrap()).unwrap();
        assert_eq!(uri, "http://127.0.0.1:3000/gecko/api/v3/ping");
    }

    #[test]
    fn api_key_is_sensitive() {
        let up = upstream("https://pro-api.coingecko.com", Some("cg-secret"));
        let (name, value) = up.api_key.as_ref().unwrap();
        assert_eq!(name, "x-cg-pro-api-key");
        assert_eq!(value, "cg-secret");
        assert!(value.is_sensitive());
    }

    #[tokio::test]
    async fn client_builds() {
        build_client().unwrap();
    }
}

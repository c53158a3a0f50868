//! Target discovery.
//!
//! Resolves an HTTP debugging endpoint (`http://127.0.0.1:9222`) to the browser's
//! WebSocket URL via `GET /json/version`:
//! - Connection failures and 5xx responses retried with exponential backoff
//! - Any other non-success status fails immediately
//! - `ws://` / `wss://` URLs are returned as-is without a request

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub request_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("unsupported endpoint URL: {0}")]
    UnsupportedUrl(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("request to {url} failed after {attempts} attempts: {message}")]
    Unreachable {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("invalid /json/version response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: Option<String>,
    #[serde(rename = "Browser", default)]
    browser: Option<String>,
}

/// Resolve `endpoint` to a DevTools WebSocket URL.
pub async fn discover(endpoint: &str, config: &DiscoveryConfig) -> Result<String, DiscoveryError> {
    if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
        return Ok(endpoint.to_string());
    }
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(DiscoveryError::UnsupportedUrl(endpoint.to_string()));
    }

    let url = format!("{}/json/version", endpoint.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(|e| DiscoveryError::Client(e.to_string()))?;

    let mut attempt: u32 = 0;
    let response = loop {
        let failure = match client.get(&url).send().await {
            Ok(response) if response.status().is_server_error() => {
                format!("HTTP {}", response.status().as_u16())
            }
            Ok(response) if response.status().is_success() => break response,
            Ok(response) => {
                return Err(DiscoveryError::Status {
                    url,
                    status: response.status().as_u16(),
                });
            }
            Err(e) => e.to_string(),
        };

        attempt += 1;
        if attempt > config.max_retries {
            tracing::error!(%url, attempts = attempt, error = %failure, "Target discovery failed after max retries");
            return Err(DiscoveryError::Unreachable {
                url,
                attempts: attempt,
                message: failure,
            });
        }

        let backoff = config.backoff_base * (1 << attempt.min(10));
        tracing::warn!(
            %url,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %failure,
            "Target not ready, retrying"
        );
        tokio::time::sleep(backoff).await;
    };

    let info: VersionInfo = response
        .json()
        .await
        .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;

    let ws_url = info.web_socket_debugger_url.ok_or_else(|| {
        DiscoveryError::InvalidResponse("missing webSocketDebuggerUrl".to_string())
    })?;

    tracing::info!(browser = info.browser.as_deref().unwrap_or("unknown"), %ws_url, "Target discovered");
    Ok(ws_url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> DiscoveryConfig {
        DiscoveryConfig {
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn version_body() -> serde_json::Value {
        serde_json::json!({
            "Browser": "HeadlessChrome/120.0",
            "Protocol-Version": "1.3",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc"
        })
    }

    #[tokio::test]
    async fn websocket_url_is_returned_unchanged() {
        let url = "ws://127.0.0.1:9222/devtools/page/1";
        assert_eq!(discover(url, &test_config()).await.unwrap(), url);
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let err = discover("ftp://example.com", &test_config())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::UnsupportedUrl(_)));
    }

    #[tokio::test]
    async fn reads_debugger_url_from_version_endpoint() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(version_body()))
            .expect(1)
            .mount(&server)
            .await;

        let endpoint = format!("{}/", server.uri());
        let ws_url = discover(&endpoint, &test_config()).await.unwrap();
        assert_eq!(ws_url, "ws://127.0.0.1:9222/devtools/browser/abc");
    }

    #[tokio::test]
    async fn retries_on_server_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(version_body()))
            .expect(1)
            .mount(&server)
            .await;

        let ws_url = discover(&server.uri(), &test_config()).await.unwrap();
        assert!(ws_url.starts_with("ws://"));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = discover(&server.uri(), &test_config()).await.unwrap_err();
        match err {
            DiscoveryError::Unreachable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = discover(&server.uri(), &test_config()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn missing_debugger_url_is_invalid() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/json/version"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"Browser": "x"})),
            )
            .mount(&server)
            .await;

        let err = discover(&server.uri(), &test_config()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidResponse(_)));
    }
}

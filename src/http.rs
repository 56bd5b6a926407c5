use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{
    header,
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, ClientBuilder, StatusCode,
};
use sha2::Sha256;
use tokio::time::Duration;
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};

use crate::models::{FlagsResponse, LogBatch};

const API_URL: &str = "https://api.featureflagshq.com";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Raised on a 401 so callers can tally auth failures separately and skip
/// retrying a request that will never succeed.
#[derive(Debug)]
pub struct AuthError;

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid credentials")
    }
}

impl std::error::Error for AuthError {}

pub fn is_auth_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<AuthError>().is_some()
}

/// HMAC-SHA256 over `client_id:timestamp:payload`, base64-encoded.
fn generate_signature(client_id: &str, client_secret: &str, payload: &str, timestamp: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(client_secret.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(format!("{}:{}:{}", client_id, timestamp, payload).as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn create_http_connection_client(
    client_id: &str,
    environment: &str,
    timeout: Option<Duration>,
) -> Client {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        HeaderName::from_static("x-client-id"),
        HeaderValue::from_str(client_id).expect("should be able to cast client id"),
    );
    headers.insert(
        HeaderName::from_static("x-environment"),
        HeaderValue::from_str(environment).expect("should be able to cast environment"),
    );
    headers.insert(
        HeaderName::from_static("x-sdk-version"),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static(concat!("featureflagshq-rust-sdk/", env!("CARGO_PKG_VERSION"))),
    );
    ClientBuilder::new()
        .pool_idle_timeout(Some(Duration::from_secs(60)))
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .timeout(timeout.unwrap_or(DEFAULT_TIMEOUT))
        .default_headers(headers)
        .build()
        .expect("should be able to build the http client")
}

/// Transport for the two outbound calls. Surfaces a single success/failure
/// per call; retries transient errors internally with exponential backoff.
#[derive(Clone)]
pub struct FlagsHttpClient {
    base_url: String,
    client_id: String,
    client_secret: String,
    session_id: String,
    max_retries: u32,
    http_client: Client,
}

impl FlagsHttpClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_id: String,
        client_secret: String,
        api_url: Option<String>,
        environment: String,
        session_id: String,
        timeout: Option<Duration>,
        max_retries: u32,
    ) -> Self {
        let base_url = api_url
            .unwrap_or_else(|| API_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let http_client = create_http_connection_client(&client_id, &environment, timeout);
        Self {
            base_url,
            client_id,
            client_secret,
            session_id,
            max_retries,
            http_client,
        }
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        // 300ms, 600ms, 1.2s, ...
        ExponentialBackoff::from_millis(2)
            .factor(150)
            .take(self.max_retries as usize)
    }

    fn signed_headers(&self, payload: &str) -> Vec<(&'static str, String)> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature =
            generate_signature(&self.client_id, &self.client_secret, payload, &timestamp);
        vec![
            ("x-timestamp", timestamp),
            ("x-signature", signature),
            ("x-session-id", self.session_id.clone()),
        ]
    }

    /// Fetches all active flag definitions for this environment. Either the
    /// whole response parses or the call fails; partial data is never
    /// returned.
    pub async fn fetch_flags(&self) -> Result<FlagsResponse> {
        let url = format!("{}/v1/flags/", self.base_url);

        RetryIf::spawn(
            self.retry_strategy(),
            || async {
                let mut request = self.http_client.get(&url);
                for (name, value) in self.signed_headers("") {
                    request = request.header(name, value);
                }
                let response = request.send().await;
                let res = match response {
                    Ok(result) => match result.status() {
                        StatusCode::OK => Ok(result),
                        StatusCode::UNAUTHORIZED => Err(anyhow::Error::new(AuthError)),
                        err => Err(anyhow!("featureflagshq error fetching flags: {}", err)),
                    },
                    Err(err) => Err(anyhow!("failed to send request to fetch flags: {}", err)),
                }?;

                res.json::<FlagsResponse>()
                    .await
                    .map_err(|e| anyhow!("error parsing flags response: {}", e))
            },
            |err: &anyhow::Error| !is_auth_error(err),
        )
        .await
    }

    /// Submits a batch of access log entries. Accept/reject only, no
    /// partial-batch semantics.
    pub async fn upload_logs(&self, batch: &LogBatch) -> Result<()> {
        let url = format!("{}/v1/logs/batch/", self.base_url);
        let payload = serde_json::to_string(batch)?;

        RetryIf::spawn(
            self.retry_strategy(),
            || async {
                let mut request = self.http_client.post(&url).body(payload.clone());
                for (name, value) in self.signed_headers(&payload) {
                    request = request.header(name, value);
                }
                let response = request.send().await;
                match response {
                    Ok(result) => match result.status() {
                        StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => Ok(()),
                        StatusCode::UNAUTHORIZED => Err(anyhow::Error::new(AuthError)),
                        err => Err(anyhow!("featureflagshq error uploading logs: {}", err)),
                    },
                    Err(err) => Err(anyhow!("failed to send request to upload logs: {}", err)),
                }
            },
            |err: &anyhow::Error| !is_auth_error(err),
        )
        .await
    }
}

#[cfg(test)]
mod test {
    use httptest::{matchers::request, responders::json_encoded, responders::status_code, Expectation, Server};
    use serde_json::json;

    use crate::models::{SessionMetadata, StatsSnapshot};

    use super::*;

    fn create_client(server: &Server) -> FlagsHttpClient {
        FlagsHttpClient::new(
            "client_id".to_string(),
            "client_secret".to_string(),
            Some(format!("http://{}", server.addr())),
            "test".to_string(),
            "session".to_string(),
            None,
            0,
        )
    }

    #[test]
    fn test_generate_signature_is_stable() {
        let a = generate_signature("id", "secret", "payload", "1700000000");
        let b = generate_signature("id", "secret", "payload", "1700000000");
        assert_eq!(a, b);
        let c = generate_signature("id", "secret", "payload", "1700000001");
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_fetch_flags() -> Result<()> {
        let http_server = Server::run();
        http_server.expect(
            Expectation::matching(request::method_path("GET", "/v1/flags/")).respond_with(
                json_encoded(json!({
                    "environment": {"name": "test"},
                    "data": [
                        {
                            "key": "beta",
                            "type": "bool",
                            "value": "true",
                            "is_active": true,
                            "rollout": {"percentage": 100},
                        }
                    ],
                })),
            ),
        );

        let client = create_client(&http_server);
        let response = client.fetch_flags().await?;
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.environment, Some(json!({"name": "test"})));

        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_flags_unauthorized() {
        let http_server = Server::run();
        http_server.expect(
            Expectation::matching(request::method_path("GET", "/v1/flags/"))
                .respond_with(status_code(401)),
        );

        let client = create_client(&http_server);
        let err = client.fetch_flags().await.expect_err("401 should fail");
        assert!(is_auth_error(&err));
    }

    #[tokio::test]
    async fn test_upload_logs() -> Result<()> {
        let http_server = Server::run();
        http_server.expect(
            Expectation::matching(request::method_path("POST", "/v1/logs/batch/"))
                .respond_with(json_encoded(json!({"accepted": true}))),
        );

        let client = create_client(&http_server);
        let batch = LogBatch {
            logs: vec![],
            session_metadata: SessionMetadata {
                session_id: "session".to_string(),
                environment: None,
                sdk_type: "rust-client".to_string(),
                sdk_version: env!("CARGO_PKG_VERSION").to_string(),
                stats: StatsSnapshot {
                    total_evaluations: 0,
                    blocked_evaluations: 0,
                    coercion_errors: 0,
                    invalid_inputs: 0,
                    segment_matches: 0,
                    rollout_evaluations: 0,
                    unique_users_count: 0,
                    unique_flags_count: 0,
                    api_calls: Default::default(),
                    errors: Default::default(),
                    evaluation_times: Default::default(),
                    pending_log_entries: 0,
                    dropped_log_entries: 0,
                    last_sync: None,
                    last_log_upload: None,
                },
            },
        };
        client.upload_logs(&batch).await?;
        Ok(())
    }
}

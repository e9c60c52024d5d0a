use std::time::Duration;

use error_printer::ErrorPrinter;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{RetryTransientMiddleware, Retryable, RetryableStrategy, default_on_request_failure};
use tracing::debug;

use crate::constants::*;
use crate::error::{Result, TransferClientError};

/// Transport-level retry and timeout settings shared by every request a client makes.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: *CLIENT_RETRY_MAX_ATTEMPTS,
            base_delay: *CLIENT_RETRY_BASE_DELAY,
            max_delay: *CLIENT_RETRY_MAX_DELAY,
            request_timeout: *CLIENT_REQUEST_TIMEOUT,
            connect_timeout: *CLIENT_CONNECT_TIMEOUT,
            read_timeout: *CLIENT_READ_TIMEOUT,
        }
    }
}

impl RetryConfig {
    /// No retries and short delays; for tests against mock servers.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay.max(base_delay);
        self
    }
}

/// Retries 502/503/504 and connection-level failures; everything else is final.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransientStatusStrategy;

impl RetryableStrategy for TransientStatusStrategy {
    fn handle(&self, res: &std::result::Result<reqwest::Response, reqwest_middleware::Error>) -> Option<Retryable> {
        match res {
            Ok(response) => match response.status() {
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                    debug!(status = %response.status(), url = %response.url(), "transient status, will retry");
                    Some(Retryable::Transient)
                },
                _ => None,
            },
            Err(e) => default_on_request_failure(e),
        }
    }
}

pub fn get_retry_policy_and_strategy(config: &RetryConfig) -> (ExponentialBackoff, TransientStatusStrategy) {
    let policy = ExponentialBackoff::builder()
        .retry_bounds(config.base_delay, config.max_delay.max(config.base_delay))
        .build_with_max_retries(config.max_attempts);
    (policy, TransientStatusStrategy)
}

/// Builds a client with connect/read timeouts and the transient-retry middleware.
pub fn build_http_client(config: &RetryConfig) -> Result<ClientWithMiddleware> {
    let reqwest_client = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .build()
        .map_err(TransferClientError::from)
        .log_error("building http client")?;

    let (policy, strategy) = get_retry_policy_and_strategy(config);
    Ok(ClientBuilder::new(reqwest_client)
        .with(RetryTransientMiddleware::new_with_policy_and_strategy(policy, strategy))
        .build())
}

/// Maps a non-success response onto the error taxonomy. Runs after transport retries, so a
/// 5xx here means the service stayed unavailable.
pub(crate) async fn check_response(response: reqwest::Response, context: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let err = match status {
        StatusCode::NOT_FOUND => TransferClientError::NotFound(context.to_owned()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => crate::error::classify_denied(context, &body),
        s if s.is_server_error() => TransferClientError::ServiceUnavailable(format!("{context}: {s}")),
        s => TransferClientError::Other(format!("{context}: {s}: {body}")),
    };
    debug!(%status, context, "request failed: {err}");
    Err(err)
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    #[traced_test]
    async fn test_retries_transient_statuses_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let config = RetryConfig::default()
            .with_max_attempts(3)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5));
        let client = build_http_client(&config).unwrap();
        let response = client.get(format!("{}/flaky", server.uri())).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert!(logs_contain("transient status, will retry"));
    }

    #[tokio::test]
    async fn test_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let config = RetryConfig::default()
            .with_max_attempts(3)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5));
        let client = build_http_client(&config).unwrap();
        let response = client.get(format!("{}/missing", server.uri())).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }
}

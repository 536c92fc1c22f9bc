use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, RETRY_AFTER},
    multipart, Client, StatusCode,
};
use serde::Deserialize;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::{read_non_empty_env, read_u32_env, read_u64_env},
    error::ActivationError,
};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";
const VERIFY_PATH: &str = "/verify";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 200;
const DEFAULT_MAX_BACKOFF_MS: u64 = 1_000;

/// Remote speaker-scoring endpoint.
#[async_trait]
pub trait VerificationClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn verify(
        &self,
        wav_bytes: Vec<u8>,
        device_id: &str,
    ) -> Result<VerificationResponse, ActivationError>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VerificationResponse {
    pub score: f32,
    #[serde(rename = "match")]
    pub is_match: bool,
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default)]
    pub message: Option<String>,
}

impl VerificationResponse {
    fn validate(self) -> Result<Self, ActivationError> {
        if !(0.0..=1.0).contains(&self.score) {
            return Err(ActivationError::InvalidResponse(format!(
                "score {} is outside [0, 1]",
                self.score
            )));
        }
        if let Some(threshold) = self.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ActivationError::InvalidResponse(format!(
                    "threshold {threshold} is outside [0, 1]"
                )));
            }
        }
        Ok(self)
    }
}

#[derive(Debug, Clone)]
pub struct VerificationClientConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
}

impl Default for VerificationClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            retry_max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl VerificationClientConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(base_url) = read_non_empty_env("VOICE_VERIFY_BASE_URL") {
            config.base_url = base_url;
        }

        if let Some(timeout_ms) = read_u64_env("VOICE_VERIFY_TIMEOUT_MS") {
            config.request_timeout_ms = timeout_ms.max(1);
        }

        if let Some(max_retries) = read_u32_env("VOICE_VERIFY_MAX_RETRIES") {
            config.max_retries = max_retries;
        }

        if let Some(initial_backoff_ms) = read_u64_env("VOICE_VERIFY_RETRY_INITIAL_BACKOFF_MS") {
            config.retry_initial_backoff_ms = initial_backoff_ms.max(1);
        }

        if let Some(max_backoff_ms) = read_u64_env("VOICE_VERIFY_RETRY_MAX_BACKOFF_MS") {
            config.retry_max_backoff_ms = max_backoff_ms.max(1);
        }

        if config.retry_initial_backoff_ms > config.retry_max_backoff_ms {
            config.retry_initial_backoff_ms = config.retry_max_backoff_ms;
        }

        debug!(
            base_url = %config.base_url,
            request_timeout_ms = config.request_timeout_ms,
            max_retries = config.max_retries,
            retry_initial_backoff_ms = config.retry_initial_backoff_ms,
            retry_max_backoff_ms = config.retry_max_backoff_ms,
            "loaded verification client config"
        );
        config
    }

    pub fn endpoint(&self) -> String {
        format!("{}{VERIFY_PATH}", self.base_url.trim_end_matches('/'))
    }
}

/// Backoff schedule shared by transport and HTTP retries.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RetryPolicy {
    max_retries: u32,
    initial: Duration,
    ceiling: Duration,
}

impl RetryPolicy {
    fn from_config(config: &VerificationClientConfig) -> Self {
        let ceiling = Duration::from_millis(config.retry_max_backoff_ms.max(1));
        Self {
            max_retries: config.max_retries,
            initial: Duration::from_millis(config.retry_initial_backoff_ms.max(1)).min(ceiling),
            ceiling,
        }
    }

    fn allows(&self, retry: u32) -> bool {
        retry < self.max_retries
    }

    /// Doubles from `initial` per retry, landing in the upper half of the
    /// step. A server `Retry-After` replaces the step but never exceeds the
    /// ceiling, so a verification budget cannot be parked for minutes.
    fn delay(&self, retry: u32, server_hint: Option<Duration>, jitter: f64) -> Duration {
        if let Some(hint) = server_hint {
            return hint.min(self.ceiling);
        }
        let step_ms = self
            .initial
            .saturating_mul(2_u32.saturating_pow(retry.min(16)))
            .min(self.ceiling)
            .as_millis() as u64;
        let half_ms = step_ms / 2;
        let offset_ms = ((step_ms - half_ms) as f64 * jitter.clamp(0.0, 1.0)) as u64;
        Duration::from_millis((half_ms + offset_ms).max(1))
    }
}

/// Uniform value in `[0, 1)` taken from the random bits of a v4 UUID.
fn jitter_fraction() -> f64 {
    let bits = (Uuid::new_v4().as_u128() as u64) >> 11;
    bits as f64 / (1_u64 << 53) as f64
}

#[derive(Debug)]
struct AttemptFailure {
    error: ActivationError,
    retryable: bool,
    retry_after: Option<Duration>,
}

impl AttemptFailure {
    fn transport(error: reqwest::Error) -> Self {
        Self {
            retryable: error.is_timeout() || error.is_connect(),
            error: ActivationError::Network(error.to_string()),
            retry_after: None,
        }
    }

    fn fatal(error: ActivationError) -> Self {
        Self {
            error,
            retryable: false,
            retry_after: None,
        }
    }

    async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let retry_after = matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
        )
        .then(|| retry_hint(response.headers()))
        .flatten();
        let body = response.text().await.unwrap_or_default();
        let message = parse_error_message(&body).unwrap_or_else(|| {
            format!(
                "Verification request failed with status {}",
                status.as_u16()
            )
        });
        debug!(
            status = status.as_u16(),
            retry_after_ms = retry_after.map(|hint| hint.as_millis() as u64),
            "verification endpoint returned an error status"
        );

        Self {
            retryable: matches!(
                status,
                StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT
            ) || status.is_server_error(),
            error: ActivationError::Network(message),
            retry_after,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpVerificationClient {
    client: Client,
    endpoint: String,
    retry: RetryPolicy,
}

impl HttpVerificationClient {
    pub fn new(config: VerificationClientConfig) -> Result<Self, ActivationError> {
        let timeout = Duration::from_millis(config.request_timeout_ms.max(1));
        let client = Client::builder().timeout(timeout).build().map_err(|error| {
            ActivationError::Config(format!("Unable to build verification HTTP client: {error}"))
        })?;
        let endpoint = config.endpoint();
        info!(
            endpoint = %endpoint,
            request_timeout_ms = timeout.as_millis() as u64,
            max_retries = config.max_retries,
            "verification client initialized"
        );
        Ok(Self {
            client,
            endpoint,
            retry: RetryPolicy::from_config(&config),
        })
    }

    async fn attempt(
        &self,
        wav_bytes: Bytes,
        device_id: &str,
    ) -> Result<VerificationResponse, AttemptFailure> {
        let audio_len = wav_bytes.len() as u64;
        let audio_part = multipart::Part::stream_with_length(wav_bytes, audio_len)
            .file_name("clip.wav")
            .mime_str("audio/wav")
            .map_err(|error| {
                AttemptFailure::fatal(ActivationError::Audio(format!(
                    "Unable to prepare verification upload: {error}"
                )))
            })?;
        let form = multipart::Form::new()
            .text("device_id", device_id.to_string())
            .part("audio", audio_part);

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(AttemptFailure::transport)?;
        if !response.status().is_success() {
            return Err(AttemptFailure::from_response(response).await);
        }

        response
            .json::<VerificationResponse>()
            .await
            .map_err(|error| AttemptFailure::fatal(ActivationError::InvalidResponse(error.to_string())))?
            .validate()
            .map_err(AttemptFailure::fatal)
    }
}

#[async_trait]
impl VerificationClient for HttpVerificationClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn verify(
        &self,
        wav_bytes: Vec<u8>,
        device_id: &str,
    ) -> Result<VerificationResponse, ActivationError> {
        if wav_bytes.is_empty() {
            return Err(ActivationError::Audio(
                "Verification clip is empty".to_string(),
            ));
        }

        let wav_bytes = Bytes::from(wav_bytes);
        info!(
            endpoint = %self.endpoint,
            audio_bytes = wav_bytes.len(),
            "starting speaker verification request"
        );

        let mut retry = 0;
        loop {
            match self.attempt(wav_bytes.clone(), device_id).await {
                Ok(response) => {
                    info!(
                        attempts = retry + 1,
                        score = response.score,
                        is_match = response.is_match,
                        "speaker verification request succeeded"
                    );
                    return Ok(response);
                }
                Err(failure) if failure.retryable && self.retry.allows(retry) => {
                    let delay = self.retry.delay(retry, failure.retry_after, jitter_fraction());
                    warn!(
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "retrying speaker verification"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(failure) => {
                    error!(
                        attempts = retry + 1,
                        error = %failure.error,
                        "speaker verification request failed"
                    );
                    return Err(failure.error);
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn parse_error_message(raw_body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ErrorEnvelope>(raw_body).ok()?;
    [parsed.message, parsed.detail, parsed.error]
        .into_iter()
        .flatten()
        .map(|message| message.trim().to_string())
        .find(|message| !message.is_empty())
}

/// `Retry-After` as delta seconds or an HTTP date; past dates mean "now".
fn retry_hint(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    match raw.parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(_) => httpdate::parse_http_date(raw)
            .ok()
            .map(|at| at.duration_since(SystemTime::now()).unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use std::time::Instant;

    use super::*;

    fn config_for_test(server: &Server) -> VerificationClientConfig {
        VerificationClientConfig {
            base_url: server.url(),
            request_timeout_ms: 2_000,
            max_retries: 2,
            retry_initial_backoff_ms: 10,
            retry_max_backoff_ms: 50,
        }
    }

    fn client_with_config(config: VerificationClientConfig) -> HttpVerificationClient {
        HttpVerificationClient::new(config).expect("client construction should succeed")
    }

    #[tokio::test]
    async fn posts_clip_and_device_id_as_multipart() {
        let mut server = Server::new_async().await;
        let request_mock = server
            .mock("POST", "/verify")
            .match_header(
                "content-type",
                Matcher::Regex("multipart/form-data".to_string()),
            )
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#"name="device_id""#.to_string()),
                Matcher::Regex("device-123".to_string()),
                Matcher::Regex(r#"filename="clip.wav""#.to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"score":0.9,"match":true,"threshold":0.78,"message":"ok"}"#)
            .create_async()
            .await;

        let client = client_with_config(config_for_test(&server));
        let response = client
            .verify(vec![1, 2, 3, 4], "device-123")
            .await
            .expect("request should succeed");

        request_mock.assert_async().await;
        assert_eq!(
            response,
            VerificationResponse {
                score: 0.9,
                is_match: true,
                threshold: Some(0.78),
                message: Some("ok".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn rejects_out_of_range_score() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/verify")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"score":1.7,"match":true}"#)
            .create_async()
            .await;

        let client = client_with_config(config_for_test(&server));
        let error = client
            .verify(vec![1, 2, 3], "device-123")
            .await
            .expect_err("out-of-range score should fail");

        assert!(matches!(error, ActivationError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn retries_server_errors_then_returns_success() {
        let mut server = Server::new_async().await;
        let server_error_mock = server
            .mock("POST", "/verify")
            .expect(1)
            .with_status(503)
            .with_header("content-type", "application/json")
            .with_body(r#"{"message":"scoring backend warming up"}"#)
            .create_async()
            .await;
        let success_mock = server
            .mock("POST", "/verify")
            .expect(1)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"score":0.4,"match":false,"threshold":0.78}"#)
            .create_async()
            .await;

        let mut config = config_for_test(&server);
        config.retry_initial_backoff_ms = 80;
        config.retry_max_backoff_ms = 80;
        let client = client_with_config(config);

        let started_at = Instant::now();
        let response = client
            .verify(vec![1, 2, 3], "device-123")
            .await
            .expect("request should succeed after retry");
        let elapsed = started_at.elapsed();

        server_error_mock.assert_async().await;
        success_mock.assert_async().await;
        assert!(!response.is_match);
        assert!(
            elapsed >= Duration::from_millis(35),
            "elapsed {elapsed:?} should include retry backoff",
        );
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let mut server = Server::new_async().await;
        let request_mock = server
            .mock("POST", "/verify")
            .expect(1)
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"detail":"device not enrolled"}"#)
            .create_async()
            .await;

        let client = client_with_config(config_for_test(&server));
        let error = client
            .verify(vec![1, 2, 3], "device-123")
            .await
            .expect_err("request should fail");

        request_mock.assert_async().await;
        assert_eq!(
            error,
            ActivationError::Network("device not enrolled".to_string())
        );
    }

    #[tokio::test]
    async fn rate_limit_exhausts_retry_budget() {
        let mut server = Server::new_async().await;
        let rate_limited_mock = server
            .mock("POST", "/verify")
            .expect(3)
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let client = client_with_config(config_for_test(&server));
        let error = client
            .verify(vec![1, 2, 3], "device-123")
            .await
            .expect_err("request should fail");

        rate_limited_mock.assert_async().await;
        assert_eq!(
            error,
            ActivationError::Network("Verification request failed with status 429".to_string())
        );
    }

    #[tokio::test]
    async fn empty_clip_is_rejected_without_request() {
        let mut server = Server::new_async().await;
        let request_mock = server
            .mock("POST", "/verify")
            .expect(0)
            .create_async()
            .await;

        let client = client_with_config(config_for_test(&server));
        let error = client
            .verify(Vec::new(), "device-123")
            .await
            .expect_err("empty clip should fail");

        request_mock.assert_async().await;
        assert!(matches!(error, ActivationError::Audio(_)));
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "2".parse().expect("valid header"));

        assert_eq!(retry_hint(&headers), Some(Duration::from_secs(2)));
    }

    #[test]
    fn past_retry_after_date_means_retry_now() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().expect("valid header"),
        );

        assert_eq!(retry_hint(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn backoff_doubles_within_upper_half_and_stops_at_ceiling() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial: Duration::from_millis(100),
            ceiling: Duration::from_millis(300),
        };

        assert_eq!(policy.delay(0, None, 0.0), Duration::from_millis(50));
        assert_eq!(policy.delay(0, None, 1.0), Duration::from_millis(100));
        assert_eq!(policy.delay(1, None, 1.0), Duration::from_millis(200));
        assert_eq!(policy.delay(4, None, 1.0), Duration::from_millis(300));
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }

    #[test]
    fn server_retry_hint_is_capped_at_ceiling() {
        let policy = RetryPolicy {
            max_retries: 2,
            initial: Duration::from_millis(10),
            ceiling: Duration::from_millis(50),
        };

        assert_eq!(
            policy.delay(0, Some(Duration::from_secs(3_600)), 0.5),
            Duration::from_millis(50)
        );
        assert_eq!(
            policy.delay(0, Some(Duration::from_millis(20)), 0.5),
            Duration::from_millis(20)
        );
    }

    #[tokio::test]
    async fn long_retry_after_does_not_stall_the_request() {
        let mut server = Server::new_async().await;
        let rate_limited_mock = server
            .mock("POST", "/verify")
            .expect(1)
            .with_status(429)
            .with_header("retry-after", "3600")
            .create_async()
            .await;
        let success_mock = server
            .mock("POST", "/verify")
            .expect(1)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"score":0.85,"match":true}"#)
            .create_async()
            .await;

        let client = client_with_config(config_for_test(&server));
        let started_at = Instant::now();
        let response = client
            .verify(vec![1, 2, 3], "device-123")
            .await
            .expect("request should succeed after a capped wait");

        rate_limited_mock.assert_async().await;
        success_mock.assert_async().await;
        assert!(response.is_match);
        assert!(started_at.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn connection_refused_is_retried_then_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind a port");
        let port = listener.local_addr().expect("bound address").port();
        drop(listener);

        let client = client_with_config(VerificationClientConfig {
            base_url: format!("http://127.0.0.1:{port}"),
            request_timeout_ms: 1_000,
            max_retries: 2,
            retry_initial_backoff_ms: 20,
            retry_max_backoff_ms: 40,
        });

        let started_at = Instant::now();
        let error = client
            .verify(vec![1, 2, 3], "device-123")
            .await
            .expect_err("closed port should fail");

        assert!(matches!(error, ActivationError::Network(_)));
        // Two backoffs of at least 10ms and 20ms.
        assert!(
            started_at.elapsed() >= Duration::from_millis(30),
            "elapsed {:?} should include both retries",
            started_at.elapsed()
        );
    }

    #[test]
    fn endpoint_joins_base_url_without_double_slash() {
        let config = VerificationClientConfig {
            base_url: "https://verify.example.com/".to_string(),
            ..VerificationClientConfig::default()
        };

        assert_eq!(config.endpoint(), "https://verify.example.com/verify");
    }
}

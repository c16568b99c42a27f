//! HTTP retry policy with exponential backoff.
//!
//! # Policy
//!
//! - Max retries: 2 (3 total attempts), configurable through `[retry]`
//! - Initial delay: 500ms, doubled per retry, capped at 8 seconds
//! - Down-jitter of up to 25% (multiplier in [0.75, 1.0])
//!
//! # Retryable Conditions
//!
//! - HTTP 408, 409, 429, 5xx
//! - Connection errors and timeouts before a response arrived
//! - `x-should-retry: true` forces a retry, `x-should-retry: false` forbids one
//!
//! # Headers
//!
//! - `X-Quire-Retry-Count`: 0 for the first attempt, 1+ for retries
//! - `Idempotency-Key`: `quire-retry-{uuid}`, identical across all attempts
//!
//! Only the request phase is retried. Once a success status arrives the body
//! belongs to the caller and a broken stream is reported, never replayed.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode, header::HeaderMap};
use uuid::Uuid;

const RETRY_COUNT_HEADER: &str = "X-Quire-Retry-Count";
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";
const MAX_SERVER_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction by which a delay may be shortened at random.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// A single attempt with no backoff.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default().with_max_retries(0)
    }
}

/// Server-requested delay from `Retry-After-Ms` or `Retry-After`.
///
/// Values outside `(0, 60s)` are ignored.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let millis = header("retry-after-ms")
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|ms| ms.is_finite() && *ms > 0.0)
        .map(|ms| Duration::from_secs_f64(ms / 1000.0));
    let secs = || {
        header("retry-after")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    };

    millis
        .or_else(secs)
        .filter(|d| *d > Duration::ZERO && *d < MAX_SERVER_DELAY)
}

/// Whether a failed status should be attempted again.
#[must_use]
pub fn should_retry(status: StatusCode, headers: &HeaderMap) -> bool {
    match headers.get("x-should-retry").and_then(|v| v.to_str().ok()) {
        Some(v) if v.eq_ignore_ascii_case("true") => return true,
        Some(v) if v.eq_ignore_ascii_case("false") => return false,
        _ => {}
    }
    matches!(status.as_u16(), 408 | 409 | 429 | 500..=599)
}

/// Delay before retry number `backoff_step + 1`.
#[must_use]
pub fn calculate_retry_delay(
    backoff_step: u32,
    config: &RetryConfig,
    headers: Option<&HeaderMap>,
) -> Duration {
    if let Some(delay) = headers.and_then(parse_retry_after) {
        return delay;
    }

    let exponent = i32::try_from(backoff_step).unwrap_or(i32::MAX);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());
    let jitter = 1.0 - rand::random::<f64>() * config.jitter_factor;
    Duration::from_secs_f64(capped * jitter)
}

pub fn add_retry_headers(
    builder: RequestBuilder,
    retry_count: u32,
    idempotency_key: &str,
) -> RequestBuilder {
    builder
        .header(RETRY_COUNT_HEADER, retry_count.to_string())
        .header(IDEMPOTENCY_HEADER, idempotency_key)
}

#[must_use]
pub fn generate_idempotency_key() -> String {
    format!("quire-retry-{}", Uuid::new_v4())
}

/// How a retried request ended.
#[derive(Debug)]
pub enum RetryOutcome {
    /// 2xx response.
    Success(Response),
    /// Non-2xx response that was either not retryable or the last attempt.
    HttpError(Response),
    /// No response at all.
    ConnectionError {
        attempts: u32,
        source: reqwest::Error,
    },
}

impl RetryOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Send a request, retrying per `config`.
///
/// `build_request` is called once per attempt, so it must produce an
/// equivalent request each time.
pub async fn send_with_retry<F>(build_request: F, config: &RetryConfig) -> RetryOutcome
where
    F: Fn() -> RequestBuilder,
{
    let idempotency_key = generate_idempotency_key();
    let mut attempt: u32 = 0;

    loop {
        let last_attempt = attempt >= config.max_retries;
        let request = add_retry_headers(build_request(), attempt, &idempotency_key);

        let delay = match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return RetryOutcome::Success(response);
                }
                if last_attempt || !should_retry(status, response.headers()) {
                    return RetryOutcome::HttpError(response);
                }
                let delay = calculate_retry_delay(attempt, config, Some(response.headers()));
                tracing::debug!(
                    status = %status,
                    retry_count = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying request after error status"
                );
                delay
            }
            Err(e) => {
                if last_attempt || !is_retryable_error(&e) {
                    return RetryOutcome::ConnectionError {
                        attempts: attempt + 1,
                        source: e,
                    };
                }
                let delay = calculate_retry_delay(attempt, config, None);
                tracing::debug!(
                    error = %e,
                    retry_count = attempt + 1,
                    delay_ms = delay.as_millis(),
                    "Retrying request after connection error"
                );
                delay
            }
        };

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_ms_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        headers.insert("retry-after", HeaderValue::from_static("5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(5)));
    }

    #[test]
    fn retry_after_out_of_range_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("120"));
        assert_eq!(parse_retry_after(&headers), None);

        headers.clear();
        headers.insert("retry-after", HeaderValue::from_static("0"));
        assert_eq!(parse_retry_after(&headers), None);

        headers.clear();
        headers.insert("retry-after-ms", HeaderValue::from_static("NaN"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn retryable_statuses() {
        let headers = HeaderMap::new();
        for status in [408, 409, 429, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(status).unwrap();
            assert!(should_retry(status, &headers), "{status} should retry");
        }
        for status in [400, 401, 403, 404, 422] {
            let status = StatusCode::from_u16(status).unwrap();
            assert!(!should_retry(status, &headers), "{status} should not retry");
        }
    }

    #[test]
    fn should_retry_header_overrides_status() {
        let mut headers = HeaderMap::new();
        headers.insert("x-should-retry", HeaderValue::from_static("TRUE"));
        assert!(should_retry(StatusCode::BAD_REQUEST, &headers));

        headers.insert("x-should-retry", HeaderValue::from_static("false"));
        assert!(!should_retry(StatusCode::SERVICE_UNAVAILABLE, &headers));
    }

    #[test]
    fn delay_doubles_within_jitter_bounds() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            let first = calculate_retry_delay(0, &config, None);
            assert!(first >= Duration::from_millis(375) && first <= Duration::from_millis(500));
            let second = calculate_retry_delay(1, &config, None);
            assert!(second >= Duration::from_millis(750) && second <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn delay_is_capped() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(calculate_retry_delay(10, &config, None), config.max_delay);
        assert_eq!(calculate_retry_delay(u32::MAX, &config, None), config.max_delay);
    }

    #[test]
    fn delay_honors_server_hint() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("3"));
        let delay = calculate_retry_delay(0, &RetryConfig::default(), Some(&headers));
        assert_eq!(delay, Duration::from_secs(3));
    }

    #[test]
    fn idempotency_keys_are_unique() {
        let a = generate_idempotency_key();
        let b = generate_idempotency_key();
        assert!(a.starts_with("quire-retry-"));
        assert_ne!(a, b);
    }
}

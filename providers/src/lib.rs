//! Network collaborators for Quire: the generation backend and the document store.
//!
//! # Architecture
//!
//! - [`generation`] - opens one streaming response per AI action (advise, edit, optimize)
//! - [`decode`] - turns a raw byte stream into [`StreamEvent`](quire_types::StreamEvent)s
//! - [`documents`] - loads, saves and lists vault documents
//! - [`retry`] - backoff policy shared by every request
//!
//! The engine talks to these through the [`GenerationBackend`](generation::GenerationBackend),
//! [`DocumentStore`](documents::DocumentStore) and [`TreeSource`](documents::TreeSource)
//! traits so it can be driven by in-memory fakes in tests.
//!
//! # Error Handling
//!
//! Failures to *open* a stream are returned as [`TransportError`]. Failures that
//! happen once bytes are flowing surface as a terminal `StreamEvent::Error` from
//! the decoder, so partial output is never lost.

pub mod decode;
pub mod documents;
mod error;
pub mod generation;
pub mod retry;

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Url;

pub use decode::{ByteStream, StreamDecoder};
pub use documents::{DocumentStore, HttpDocumentStore, TreeSource};
pub use error::{StoreError, TransportError};
pub use generation::{GenerationBackend, GenerationRequest, HttpGenerationClient};
pub use quire_types;
pub use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_MAX_IDLE_PER_HOST: usize = 16;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Shared client. Generation requests carry no overall timeout since a
/// response may stream for minutes; store calls set one per request.
pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        base_client_builder().build().unwrap_or_else(|e| {
            tracing::error!("Failed to build tuned HTTP client: {e}. Falling back to defaults.");
            reqwest::Client::new()
        })
    })
}

fn base_client_builder() -> reqwest::ClientBuilder {
    use reqwest::header::{HeaderMap, HeaderValue};

    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        "X-Quire-Client",
        HeaderValue::from_static(concat!("quire/", env!("CARGO_PKG_VERSION"))),
    );

    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .default_headers(default_headers)
}

/// Parse a server base URL, tolerating a trailing slash.
pub fn parse_base_url(raw: &str) -> Result<Url, TransportError> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed)
        .map_err(|e| TransportError::Connection(format!("invalid server URL {raw:?}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(TransportError::Connection(format!(
            "server URL {raw:?} cannot carry request paths"
        )));
    }
    Ok(url)
}

/// `base` with `segments` appended as percent-encoded path segments.
pub(crate) fn endpoint<'a>(base: &Url, segments: impl IntoIterator<Item = &'a str>) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Read at most 32 KiB of an error response.
pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// The server reports failures as `{"message": "..."}` (or `{"detail": "..."}`).
/// Falls back to the raw body when neither is present.
pub(crate) fn server_message(body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        detail: Option<serde_json::Value>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            message: Some(message),
            ..
        }) => message,
        Ok(ErrorBody {
            detail: Some(serde_json::Value::String(detail)),
            ..
        }) => detail,
        _ => body.trim().to_string(),
    }
}

/// Collapse a [`retry::RetryOutcome`] into a successful response or a transport error.
pub(crate) async fn into_success(
    outcome: retry::RetryOutcome,
) -> Result<reqwest::Response, TransportError> {
    match outcome {
        retry::RetryOutcome::Success(response) => Ok(response),
        retry::RetryOutcome::HttpError(response) => {
            let status = response.status().as_u16();
            let body = read_capped_error_body(response).await;
            Err(TransportError::Http {
                status,
                body: server_message(&body),
            })
        }
        retry::RetryOutcome::ConnectionError { attempts, source } => {
            Err(TransportError::Connection(if attempts > 1 {
                format!("{source} (after {attempts} attempts)")
            } else {
                source.to_string()
            }))
        }
    }
}

//! Streaming generation endpoints.
//!
//! Each AI action is one `POST` whose response body is the record stream
//! consumed by [`StreamDecoder`](crate::StreamDecoder). Opening the stream is
//! retried; reading it is not.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use quire_types::{DocKey, GenerationMode, NonEmptyString};

use crate::retry::{RetryConfig, send_with_retry};
use crate::{ByteStream, TransportError, endpoint, http_client, into_success};

/// What the user asked for, with the text each mode requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationRequest {
    Advise { question: NonEmptyString },
    Edit { instruction: NonEmptyString },
    Optimize,
}

impl GenerationRequest {
    #[must_use]
    pub const fn mode(&self) -> GenerationMode {
        match self {
            GenerationRequest::Advise { .. } => GenerationMode::Advise,
            GenerationRequest::Edit { .. } => GenerationMode::Edit,
            GenerationRequest::Optimize => GenerationMode::Optimize,
        }
    }
}

/// The remote side that produces generated text.
///
/// Implementations must give up promptly with [`TransportError::Cancelled`]
/// when `token` fires before the stream is open. Once a stream is returned,
/// cancellation is enforced by the decoder.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn advise(
        &self,
        key: &DocKey,
        question: &str,
        token: &CancellationToken,
    ) -> Result<ByteStream, TransportError>;

    async fn edit(
        &self,
        key: &DocKey,
        instruction: &str,
        token: &CancellationToken,
    ) -> Result<ByteStream, TransportError>;

    async fn optimize(
        &self,
        key: &DocKey,
        token: &CancellationToken,
    ) -> Result<ByteStream, TransportError>;

    async fn open_stream(
        &self,
        key: &DocKey,
        request: &GenerationRequest,
        token: &CancellationToken,
    ) -> Result<ByteStream, TransportError> {
        match request {
            GenerationRequest::Advise { question } => self.advise(key, question, token).await,
            GenerationRequest::Edit { instruction } => self.edit(key, instruction, token).await,
            GenerationRequest::Optimize => self.optimize(key, token).await,
        }
    }
}

#[derive(Serialize)]
struct AdviseBody<'a> {
    filename: &'a str,
    question: &'a str,
}

#[derive(Serialize)]
struct EditBody<'a> {
    filename: &'a str,
    requirement: &'a str,
}

#[derive(Serialize)]
struct OptimizeBody<'a> {
    filename: &'a str,
}

/// [`GenerationBackend`] over the vault server's `/ai/*` endpoints.
#[derive(Debug, Clone)]
pub struct HttpGenerationClient {
    base_url: Url,
    retry: RetryConfig,
}

impl HttpGenerationClient {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            retry: RetryConfig::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn post<B>(
        &self,
        action: &str,
        body: &B,
        token: &CancellationToken,
    ) -> Result<ByteStream, TransportError>
    where
        B: Serialize + Sync,
    {
        let url = endpoint(&self.base_url, ["ai", action]);
        let client = http_client();

        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => {
                tracing::debug!(action, "Generation request abandoned before response");
                return Err(TransportError::Cancelled);
            }
            outcome = send_with_retry(|| client.post(url.clone()).json(body), &self.retry) => outcome,
        };

        let response = match into_success(outcome).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(action, error = %e, "Generation request failed");
                return Err(e);
            }
        };
        tracing::debug!(action, status = %response.status(), "Generation stream opened");

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Stream(e.to_string())))
            .boxed())
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationClient {
    async fn advise(
        &self,
        key: &DocKey,
        question: &str,
        token: &CancellationToken,
    ) -> Result<ByteStream, TransportError> {
        let body = AdviseBody {
            filename: key.as_str(),
            question,
        };
        self.post("advise", &body, token).await
    }

    async fn edit(
        &self,
        key: &DocKey,
        instruction: &str,
        token: &CancellationToken,
    ) -> Result<ByteStream, TransportError> {
        let body = EditBody {
            filename: key.as_str(),
            requirement: instruction,
        };
        self.post("edit", &body, token).await
    }

    async fn optimize(
        &self,
        key: &DocKey,
        token: &CancellationToken,
    ) -> Result<ByteStream, TransportError> {
        let body = OptimizeBody {
            filename: key.as_str(),
        };
        self.post("optimize", &body, token).await
    }
}

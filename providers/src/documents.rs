//! Document store and tree listing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use quire_config::DEFAULT_REQUEST_TIMEOUT;
use quire_types::{DocKey, TreeNode};

use crate::retry::{RetryConfig, send_with_retry};
use crate::{StoreError, TransportError, endpoint, http_client, into_success};

/// Persistent home of document content.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, key: &DocKey) -> Result<String, StoreError>;

    async fn write(&self, key: &DocKey, content: &str) -> Result<(), StoreError>;
}

/// Source of the vault's file hierarchy.
#[async_trait]
pub trait TreeSource: Send + Sync {
    async fn list_tree(&self) -> Result<Vec<TreeNode>, StoreError>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct FileData {
    content: String,
}

#[derive(Deserialize)]
struct TreeData {
    tree: Vec<TreeNode>,
}

#[derive(Serialize)]
struct WriteBody<'a> {
    content: &'a str,
}

/// [`DocumentStore`] and [`TreeSource`] over the vault server's `/knowledge/*` endpoints.
///
/// Store calls time out after `quire_config::DEFAULT_REQUEST_TIMEOUT` unless
/// [`with_timeout`](Self::with_timeout) says otherwise. Streaming calls have no timeout.
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    base_url: Url,
    timeout: Duration,
    retry: RetryConfig,
}

impl HttpDocumentStore {
    #[must_use]
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn file_url(&self, key: &DocKey) -> Url {
        endpoint(
            &self.base_url,
            ["knowledge", "file"].into_iter().chain(key.segments()),
        )
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        key: Option<&DocKey>,
    ) -> Result<T, StoreError> {
        let client = http_client();
        let outcome =
            send_with_retry(|| client.get(url.clone()).timeout(self.timeout), &self.retry).await;
        let response = into_success(outcome)
            .await
            .map_err(|e| store_error(e, key))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| StoreError::Transport(TransportError::Stream(e.to_string())))?;
        serde_json::from_slice(&body).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

fn store_error(error: TransportError, key: Option<&DocKey>) -> StoreError {
    match (error, key) {
        (TransportError::Http { status: 404, .. }, Some(key)) => StoreError::NotFound(key.clone()),
        (TransportError::Http { status, body }, _) => StoreError::Rejected {
            status,
            message: body,
        },
        (other, _) => StoreError::Transport(other),
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn read(&self, key: &DocKey) -> Result<String, StoreError> {
        let envelope: Envelope<FileData> = self.get_json(self.file_url(key), Some(key)).await?;
        tracing::debug!(%key, bytes = envelope.data.content.len(), "Read document");
        Ok(envelope.data.content)
    }

    async fn write(&self, key: &DocKey, content: &str) -> Result<(), StoreError> {
        let url = self.file_url(key);
        let body = WriteBody { content };
        let client = http_client();
        let outcome = send_with_retry(
            || client.put(url.clone()).timeout(self.timeout).json(&body),
            &self.retry,
        )
        .await;
        into_success(outcome)
            .await
            .map_err(|e| store_error(e, Some(key)))?;
        tracing::debug!(%key, bytes = content.len(), "Wrote document");
        Ok(())
    }
}

#[async_trait]
impl TreeSource for HttpDocumentStore {
    async fn list_tree(&self) -> Result<Vec<TreeNode>, StoreError> {
        let url = endpoint(&self.base_url, ["knowledge", "tree"]);
        let envelope: Envelope<TreeData> = self.get_json(url, None).await?;
        Ok(envelope.data.tree)
    }
}

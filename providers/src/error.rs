use quire_types::DocKey;
use thiserror::Error;

/// Failure to open or read a byte stream from the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// The connection could not be established or was refused.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The connection broke while the body was being read.
    #[error("stream interrupted: {0}")]
    Stream(String),
    /// The request was abandoned because its token was cancelled.
    #[error("request cancelled")]
    Cancelled,
}

/// Failure of a load, save, or listing call against the document store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(DocKey),
    /// The server understood the request and refused it.
    #[error("document store rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The response body did not have the expected shape.
    #[error("unexpected response from document store: {0}")]
    Decode(String),
}

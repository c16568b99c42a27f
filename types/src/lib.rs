//! Core domain types for Quire.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

mod ids;
mod key;
mod tree;

pub use ids::GenerationId;
pub use key::{DocKey, DocKeyError};
pub use tree::{TreeNode, leaf_keys};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// NonEmpty String Types
// ============================================================================

/// A string guaranteed to be non-empty (after trimming).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NonEmptyString(String);

#[derive(Debug, Error)]
#[error("text must not be empty")]
pub struct EmptyStringError;

impl NonEmptyString {
    pub fn new(value: impl Into<String>) -> Result<Self, EmptyStringError> {
        let value = value.into();
        if value.trim().is_empty() {
            Err(EmptyStringError)
        } else {
            Ok(Self(value))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NonEmptyString {
    type Error = EmptyStringError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for NonEmptyString {
    type Error = EmptyStringError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

impl std::ops::Deref for NonEmptyString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for NonEmptyString {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

// ============================================================================
// Generation Modes
// ============================================================================

/// The three AI actions a document supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationMode {
    /// Answer a question about the document; output lands in the chat transcript.
    Advise,
    /// Rewrite the document following a free-form instruction.
    Edit,
    /// Reformat the document; no user text required.
    Optimize,
}

impl GenerationMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            GenerationMode::Advise => "advise",
            GenerationMode::Edit => "edit",
            GenerationMode::Optimize => "optimize",
        }
    }

    /// Whether the output becomes a preview awaiting confirmation.
    #[must_use]
    pub const fn produces_preview(self) -> bool {
        matches!(self, GenerationMode::Edit | GenerationMode::Optimize)
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Streaming Events
// ============================================================================

/// A decoded event from a generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One fragment of generated text.
    Content(String),
    /// The stream failed; no further events follow.
    Error(StreamFailure),
    /// The stream completed; no further events follow.
    End,
}

impl StreamEvent {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error(_) | StreamEvent::End)
    }
}

/// Why a generation stream failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamFailure {
    /// An explicit error record sent by the remote side.
    #[error("{0}")]
    Remote(String),
    /// The underlying connection failed or the request was refused.
    #[error("transport error: {0}")]
    Transport(String),
}

impl StreamFailure {
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            StreamFailure::Remote(msg) | StreamFailure::Transport(msg) => msg,
        }
    }
}

// ============================================================================
// Conversation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One entry of an advise conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            text: text.into(),
        }
    }
}

// ============================================================================
// Views
// ============================================================================

/// What the workspace is currently showing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ActiveView {
    /// No document and no settings: the neutral empty view.
    #[default]
    Empty,
    /// The reserved settings pseudo-tab.
    Settings,
    Document(DocKey),
}

impl ActiveView {
    #[must_use]
    pub fn document(&self) -> Option<&DocKey> {
        match self {
            ActiveView::Document(key) => Some(key),
            ActiveView::Empty | ActiveView::Settings => None,
        }
    }
}

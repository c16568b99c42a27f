//! Vault-relative document keys.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocKeyError {
    #[error("document key must not be empty")]
    Empty,
    #[error("document key must be relative to the vault: {0}")]
    Absolute(String),
    #[error("document key must not leave the vault: {0}")]
    Escapes(String),
}

/// Stable identifier of a document: its vault-relative path.
///
/// Keys are normalized on construction (`\` becomes `/`, `.` and empty
/// segments are dropped), so two spellings of the same path compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocKey(String);

impl DocKey {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, DocKeyError> {
        let raw = raw.as_ref().trim();
        if raw.is_empty() {
            return Err(DocKeyError::Empty);
        }

        let unified = raw.replace('\\', "/");
        if unified.starts_with('/') || has_drive_prefix(&unified) {
            return Err(DocKeyError::Absolute(raw.to_string()));
        }

        let mut segments = Vec::new();
        for segment in unified.split('/') {
            match segment {
                "" | "." => {}
                ".." => return Err(DocKeyError::Escapes(raw.to_string())),
                other => segments.push(other),
            }
        }

        if segments.is_empty() {
            return Err(DocKeyError::Empty);
        }
        Ok(Self(segments.join("/")))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments, for building request URLs.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Final path component.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    #[must_use]
    pub fn is_markdown(&self) -> bool {
        self.file_name()
            .rsplit_once('.')
            .is_some_and(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case("md"))
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocKey {
    type Error = DocKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for DocKey {
    type Error = DocKeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl std::str::FromStr for DocKey {
    type Err = DocKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<DocKey> for String {
    fn from(value: DocKey) -> Self {
        value.0
    }
}

impl AsRef<str> for DocKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

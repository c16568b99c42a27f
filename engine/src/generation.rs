//! The single live AI generation and the slot that holds it.

use std::fmt;

use tokio::sync::mpsc;

use quire_providers::CancellationToken;
use quire_types::{DocKey, GenerationId, GenerationMode, StreamEvent};

use crate::preview::{DiffStats, diff_stats, format_preview_diff};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStatus {
    Idle,
    Generating,
    Previewing,
    Committing,
}

impl GenerationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            GenerationStatus::Idle => "idle",
            GenerationStatus::Generating => "generating",
            GenerationStatus::Previewing => "previewing",
            GenerationStatus::Committing => "committing",
        }
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One streaming interaction against one document.
///
/// `accumulated` only grows, and only while `Generating`. Dropping the session
/// cancels its token, which stops the decode task and releases the stream.
#[derive(Debug)]
pub struct GenerationSession {
    id: GenerationId,
    key: DocKey,
    mode: GenerationMode,
    status: GenerationStatus,
    original_content: String,
    accumulated: String,
    token: CancellationToken,
    events: Option<mpsc::Receiver<StreamEvent>>,
}

impl GenerationSession {
    pub(crate) fn new(
        id: GenerationId,
        key: DocKey,
        mode: GenerationMode,
        original_content: String,
        token: CancellationToken,
        events: mpsc::Receiver<StreamEvent>,
    ) -> Self {
        Self {
            id,
            key,
            mode,
            status: GenerationStatus::Generating,
            original_content,
            accumulated: String::new(),
            token,
            events: Some(events),
        }
    }

    #[must_use]
    pub fn id(&self) -> GenerationId {
        self.id
    }

    #[must_use]
    pub fn key(&self) -> &DocKey {
        &self.key
    }

    #[must_use]
    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    #[must_use]
    pub fn status(&self) -> GenerationStatus {
        self.status
    }

    /// Document content when the generation started. Empty for advise.
    #[must_use]
    pub fn original_content(&self) -> &str {
        &self.original_content
    }

    #[must_use]
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Append a fragment. Ignored unless generating.
    pub(crate) fn append(&mut self, fragment: &str) -> bool {
        if self.status != GenerationStatus::Generating {
            tracing::debug!(id = %self.id, status = %self.status, "Dropping late fragment");
            return false;
        }
        self.accumulated.push_str(fragment);
        true
    }

    /// The stream ended cleanly: freeze the output for review.
    pub(crate) fn finish_stream(&mut self) -> bool {
        if self.status != GenerationStatus::Generating {
            return false;
        }
        self.status = GenerationStatus::Previewing;
        self.events = None;
        true
    }

    pub(crate) fn mark_committing(&mut self) -> bool {
        if self.status != GenerationStatus::Previewing {
            return false;
        }
        self.status = GenerationStatus::Committing;
        true
    }

    /// The write failed; the frozen output is reviewable again.
    pub(crate) fn commit_failed(&mut self) -> bool {
        if self.status != GenerationStatus::Committing {
            return false;
        }
        self.status = GenerationStatus::Previewing;
        true
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn events_mut(&mut self) -> Option<&mut mpsc::Receiver<StreamEvent>> {
        self.events.as_mut()
    }

    pub(crate) fn close_events(&mut self) {
        self.events = None;
    }

    /// Line-numbered diff of the original content against the output so far.
    #[must_use]
    pub fn preview_diff(&self) -> String {
        format_preview_diff(&self.original_content, &self.accumulated)
    }

    #[must_use]
    pub fn diff_stats(&self) -> DiffStats {
        diff_stats(&self.original_content, &self.accumulated)
    }
}

impl Drop for GenerationSession {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// The session that holds the slot, reported when a claim is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotOccupied {
    pub id: GenerationId,
    pub key: DocKey,
    pub status: GenerationStatus,
}

/// Holds at most one [`GenerationSession`] system-wide.
#[derive(Debug, Default)]
pub struct GenerationSlot {
    active: Option<GenerationSession>,
}

impl GenerationSlot {
    /// Error describing the current holder, if any.
    pub fn check_free(&self) -> Result<(), SlotOccupied> {
        match &self.active {
            None => Ok(()),
            Some(session) => Err(SlotOccupied {
                id: session.id,
                key: session.key.clone(),
                status: session.status,
            }),
        }
    }

    /// Install `session` if the slot is empty.
    pub fn try_claim(&mut self, session: GenerationSession) -> Result<(), SlotOccupied> {
        self.check_free()?;
        self.active = Some(session);
        Ok(())
    }

    #[must_use]
    pub fn get(&self) -> Option<&GenerationSession> {
        self.active.as_ref()
    }

    pub(crate) fn get_mut(&mut self) -> Option<&mut GenerationSession> {
        self.active.as_mut()
    }

    pub(crate) fn take(&mut self) -> Option<GenerationSession> {
        self.active.take()
    }

    /// Take the session only if it targets `key`.
    pub(crate) fn take_for(&mut self, key: &DocKey) -> Option<GenerationSession> {
        if self.active.as_ref().is_some_and(|s| &s.key == key) {
            self.active.take()
        } else {
            None
        }
    }

    /// Take the session only if it is in `status`.
    pub(crate) fn take_if(&mut self, status: GenerationStatus) -> Option<GenerationSession> {
        if self.active.as_ref().is_some_and(|s| s.status == status) {
            self.active.take()
        } else {
            None
        }
    }

    #[must_use]
    pub fn status(&self) -> GenerationStatus {
        self.active
            .as_ref()
            .map_or(GenerationStatus::Idle, |s| s.status)
    }
}

//! Per-document load/edit/save state.
//!
//! Store calls run on spawned tasks and report back over a channel owned by
//! the [`SessionStore`]; nothing about a session changes until the owner
//! applies the completion with [`SessionStore::poll_updates`] or
//! [`SessionStore::next_update`].

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use quire_providers::{DocumentStore, StoreError};
use quire_types::DocKey;

/// Who asked for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOrigin {
    /// The user saved their edit buffer.
    User,
    /// A confirmed generation preview is being committed.
    Generation,
}

/// State of one open document.
#[derive(Debug)]
pub struct DocumentSession {
    content: String,
    edit_buffer: String,
    is_editing: bool,
    is_loading: bool,
    saving: Option<SaveOrigin>,
    has_loaded: bool,
    epoch: u64,
}

impl DocumentSession {
    fn new(epoch: u64) -> Self {
        Self {
            content: String::new(),
            edit_buffer: String::new(),
            is_editing: false,
            is_loading: false,
            saving: None,
            has_loaded: false,
            epoch,
        }
    }

    /// Last persisted content; empty until the first load.
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn edit_buffer(&self) -> &str {
        &self.edit_buffer
    }

    #[must_use]
    pub fn is_editing(&self) -> bool {
        self.is_editing
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    #[must_use]
    pub fn is_saving(&self) -> bool {
        self.saving.is_some()
    }

    #[must_use]
    pub fn has_loaded(&self) -> bool {
        self.has_loaded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("document {0} is not open")]
    UnknownDocument(DocKey),
    #[error("document {0} has not finished loading")]
    NotLoaded(DocKey),
    #[error("document {0} is not being edited")]
    NotEditing(DocKey),
    #[error("document {0} is still loading")]
    LoadInFlight(DocKey),
    #[error("a save of {0} is already in progress")]
    SaveInFlight(DocKey),
}

/// Result of [`SessionStore::ensure_loaded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// Already loaded; nothing was fetched.
    Cached,
    /// A load for this session is already running.
    InFlight,
    /// A new load was started.
    Started,
}

/// An applied store completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Loaded {
        key: DocKey,
    },
    LoadFailed {
        key: DocKey,
        error: StoreError,
    },
    Saved {
        key: DocKey,
        origin: SaveOrigin,
    },
    SaveFailed {
        key: DocKey,
        origin: SaveOrigin,
        error: StoreError,
    },
}

#[derive(Debug)]
enum Completion {
    Load {
        key: DocKey,
        epoch: u64,
        result: Result<String, StoreError>,
    },
    Save {
        key: DocKey,
        epoch: u64,
        origin: SaveOrigin,
        text: String,
        result: Result<(), StoreError>,
    },
}

/// Keyed collection of [`DocumentSession`]s.
///
/// Each session carries an epoch. A session destroyed and created again gets
/// a new epoch, so completions addressed to the old incarnation are dropped.
pub struct SessionStore {
    store: Arc<dyn DocumentStore>,
    sessions: HashMap<DocKey, DocumentSession>,
    next_epoch: u64,
    tx: mpsc::UnboundedSender<Completion>,
    rx: mpsc::UnboundedReceiver<Completion>,
    in_flight: usize,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.sessions)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            sessions: HashMap::new(),
            next_epoch: 0,
            tx,
            rx,
            in_flight: 0,
        }
    }

    #[must_use]
    pub fn get(&self, key: &DocKey) -> Option<&DocumentSession> {
        self.sessions.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &DocKey) -> bool {
        self.sessions.contains_key(key)
    }

    /// Whether any store call has not been applied yet.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.in_flight > 0
    }

    /// Load `key` unless it is already loaded or loading.
    ///
    /// Creates the session on first use. A session whose last load failed is
    /// loaded again.
    pub fn ensure_loaded(&mut self, key: &DocKey) -> LoadStatus {
        let epoch = match self.sessions.get(key) {
            Some(session) if session.has_loaded => return LoadStatus::Cached,
            Some(session) if session.is_loading => return LoadStatus::InFlight,
            Some(session) => session.epoch,
            None => {
                let epoch = self.allocate_epoch();
                self.sessions.insert(key.clone(), DocumentSession::new(epoch));
                epoch
            }
        };

        if let Some(session) = self.sessions.get_mut(key) {
            session.is_loading = true;
        }
        tracing::debug!(%key, epoch, "Loading document");

        let store = Arc::clone(&self.store);
        let tx = self.tx.clone();
        let key = key.clone();
        self.in_flight += 1;
        tokio::spawn(async move {
            let result = store.read(&key).await;
            let _ = tx.send(Completion::Load { key, epoch, result });
        });
        LoadStatus::Started
    }

    /// Enter edit mode with a fresh copy of the content. Already editing is a no-op.
    pub fn begin_edit(&mut self, key: &DocKey) -> Result<(), SessionError> {
        let session = self.idle_session(key)?;
        if !session.has_loaded {
            return Err(SessionError::NotLoaded(key.clone()));
        }
        if !session.is_editing {
            session.is_editing = true;
            session.edit_buffer = session.content.clone();
        }
        Ok(())
    }

    /// Replace the edit buffer while editing.
    pub fn update_buffer(&mut self, key: &DocKey, text: impl Into<String>) -> Result<(), SessionError> {
        let session = self.idle_session(key)?;
        if !session.is_editing {
            return Err(SessionError::NotEditing(key.clone()));
        }
        session.edit_buffer = text.into();
        Ok(())
    }

    /// Leave edit mode, discarding unsaved changes.
    pub fn cancel_edit(&mut self, key: &DocKey) -> Result<(), SessionError> {
        let session = self.idle_session(key)?;
        session.is_editing = false;
        session.edit_buffer = session.content.clone();
        Ok(())
    }

    /// Persist `text` as the user's edit.
    ///
    /// The buffer holds `text` from here on, so a failed save can be retried
    /// without losing it.
    pub fn save(&mut self, key: &DocKey, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        let session = self.writable_session(key)?;
        if !session.is_editing {
            return Err(SessionError::NotEditing(key.clone()));
        }
        session.edit_buffer = text.clone();
        self.spawn_write(key, text, SaveOrigin::User);
        Ok(())
    }

    /// Persist generated text. The edit buffer is left alone until the write succeeds.
    pub fn commit(&mut self, key: &DocKey, text: impl Into<String>) -> Result<(), SessionError> {
        self.writable_session(key)?;
        self.spawn_write(key, text.into(), SaveOrigin::Generation);
        Ok(())
    }

    /// Forget `key`. Completions still in flight for it are ignored.
    pub fn destroy(&mut self, key: &DocKey) -> Option<DocumentSession> {
        let removed = self.sessions.remove(key);
        if removed.is_some() {
            tracing::debug!(%key, "Destroyed document session");
        }
        removed
    }

    /// Apply every completion that has already arrived.
    pub fn poll_updates(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Ok(completion) = self.rx.try_recv() {
            if let Some(update) = self.apply(completion) {
                updates.push(update);
            }
        }
        updates
    }

    /// Wait for the next completion that changes a live session.
    ///
    /// Returns `None` once nothing is in flight.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        while self.in_flight > 0 {
            let completion = self.rx.recv().await?;
            if let Some(update) = self.apply(completion) {
                return Some(update);
            }
        }
        None
    }

    fn allocate_epoch(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        epoch
    }

    /// A session that no save is blocking.
    fn idle_session(&mut self, key: &DocKey) -> Result<&mut DocumentSession, SessionError> {
        let session = self
            .sessions
            .get_mut(key)
            .ok_or_else(|| SessionError::UnknownDocument(key.clone()))?;
        if session.saving.is_some() {
            return Err(SessionError::SaveInFlight(key.clone()));
        }
        Ok(session)
    }

    /// A session that may start a write: no save and no load running.
    fn writable_session(&mut self, key: &DocKey) -> Result<&mut DocumentSession, SessionError> {
        let session = self.idle_session(key)?;
        if session.is_loading {
            return Err(SessionError::LoadInFlight(key.clone()));
        }
        Ok(session)
    }

    fn spawn_write(&mut self, key: &DocKey, text: String, origin: SaveOrigin) {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        session.saving = Some(origin);
        let epoch = session.epoch;
        tracing::debug!(%key, ?origin, bytes = text.len(), "Saving document");

        let store = Arc::clone(&self.store);
        let tx = self.tx.clone();
        let key = key.clone();
        self.in_flight += 1;
        tokio::spawn(async move {
            let result = store.write(&key, &text).await;
            let _ = tx.send(Completion::Save {
                key,
                epoch,
                origin,
                text,
                result,
            });
        });
    }

    fn apply(&mut self, completion: Completion) -> Option<SessionUpdate> {
        self.in_flight = self.in_flight.saturating_sub(1);

        match completion {
            Completion::Load { key, epoch, result } => {
                let Some(session) = self.sessions.get_mut(&key).filter(|s| s.epoch == epoch) else {
                    tracing::debug!(%key, epoch, "Dropping load for a closed document");
                    return None;
                };
                session.is_loading = false;
                match result {
                    Ok(content) => {
                        session.edit_buffer.clone_from(&content);
                        session.content = content;
                        session.has_loaded = true;
                        Some(SessionUpdate::Loaded { key })
                    }
                    Err(error) => {
                        tracing::warn!(%key, %error, "Document load failed");
                        Some(SessionUpdate::LoadFailed { key, error })
                    }
                }
            }
            Completion::Save {
                key,
                epoch,
                origin,
                text,
                result,
            } => {
                let Some(session) = self.sessions.get_mut(&key).filter(|s| s.epoch == epoch) else {
                    tracing::debug!(%key, epoch, "Dropping save result for a closed document");
                    return None;
                };
                session.saving = None;
                match result {
                    Ok(()) => {
                        session.edit_buffer.clone_from(&text);
                        session.content = text;
                        session.is_editing = false;
                        session.has_loaded = true;
                        Some(SessionUpdate::Saved { key, origin })
                    }
                    Err(error) => {
                        tracing::warn!(%key, ?origin, %error, "Document save failed");
                        Some(SessionUpdate::SaveFailed { key, origin, error })
                    }
                }
            }
        }
    }
}

//! The coordinator: tabs, document sessions, and the single live generation.
//!
//! All state is owned by [`Controller`] and mutated only through `&mut self`.
//! Store calls and generation streams run on spawned tasks; their results
//! are applied when the owner calls [`Controller::process_events`] (a
//! non-blocking tick) or awaits [`Controller::next_notices`].

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use quire_providers::{
    CancellationToken, DocumentStore, GenerationBackend, GenerationRequest, StoreError,
    StreamDecoder, TransportError, TreeSource,
};
use quire_types::{
    ActiveView, DocKey, GenerationId, GenerationMode, NonEmptyString, StreamEvent, StreamFailure,
    leaf_keys,
};

use crate::chat::ChatTranscript;
use crate::document::{DocumentSession, SaveOrigin, SessionError, SessionStore, SessionUpdate};
use crate::generation::{GenerationSession, GenerationSlot, GenerationStatus};
use crate::preview::DiffStats;
use crate::tabs::{TabManager, TabOpen};

const STREAM_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something the user should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    DocumentLoaded {
        key: DocKey,
    },
    LoadFailed {
        key: DocKey,
        error: StoreError,
    },
    DocumentSaved {
        key: DocKey,
    },
    SaveFailed {
        key: DocKey,
        error: StoreError,
    },
    /// Newly generated text. Consecutive fragments are merged.
    Fragment {
        id: GenerationId,
        key: DocKey,
        text: String,
    },
    /// An edit or optimize stream ended; the output awaits confirmation.
    PreviewReady {
        id: GenerationId,
        key: DocKey,
        stats: DiffStats,
    },
    AdviceComplete {
        id: GenerationId,
        key: DocKey,
    },
    Committed {
        id: GenerationId,
        key: DocKey,
    },
    /// The preview is still there; confirming again retries the write.
    CommitFailed {
        id: GenerationId,
        key: DocKey,
        error: StoreError,
    },
    GenerationFailed {
        id: GenerationId,
        key: DocKey,
        mode: GenerationMode,
        failure: StreamFailure,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("no document is active")]
    NoActiveDocument,
    #[error("{0} is not a markdown document")]
    UnsupportedDocument(DocKey),
    #[error("{0} is not open")]
    NotOpen(DocKey),
    #[error("{0} has not been loaded yet")]
    DocumentNotLoaded(DocKey),
    #[error("a generation for {key} is already {status}; cancel it first")]
    GenerationBusy { key: DocKey, status: GenerationStatus },
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("there is no preview to confirm")]
    NoPreview,
    #[error("the conversation for {0} is still streaming")]
    ConversationBusy(DocKey),
    #[error(transparent)]
    Session(#[from] SessionError),
}

enum Wake {
    Stream(Option<StreamEvent>),
    Session(Option<SessionUpdate>),
}

pub struct Controller {
    sessions: SessionStore,
    tabs: TabManager,
    backend: Arc<dyn GenerationBackend>,
    transcripts: HashMap<DocKey, ChatTranscript>,
    slot: GenerationSlot,
    next_id: GenerationId,
    markdown_only: bool,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("sessions", &self.sessions)
            .field("tabs", &self.tabs)
            .field("slot", &self.slot)
            .field("markdown_only", &self.markdown_only)
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(store: Arc<dyn DocumentStore>, backend: Arc<dyn GenerationBackend>) -> Self {
        Self {
            sessions: SessionStore::new(store),
            tabs: TabManager::default(),
            backend,
            transcripts: HashMap::new(),
            slot: GenerationSlot::default(),
            next_id: GenerationId::new(1),
            markdown_only: true,
        }
    }

    /// Whether only `.md` documents may be opened. On by default.
    #[must_use]
    pub fn with_markdown_only(mut self, markdown_only: bool) -> Self {
        self.markdown_only = markdown_only;
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[must_use]
    pub fn tabs(&self) -> &TabManager {
        &self.tabs
    }

    #[must_use]
    pub fn active_view(&self) -> &ActiveView {
        self.tabs.active()
    }

    #[must_use]
    pub fn session(&self, key: &DocKey) -> Option<&DocumentSession> {
        self.sessions.get(key)
    }

    #[must_use]
    pub fn generation(&self) -> Option<&GenerationSession> {
        self.slot.get()
    }

    #[must_use]
    pub fn generation_status(&self) -> GenerationStatus {
        self.slot.status()
    }

    #[must_use]
    pub fn transcript(&self, key: &DocKey) -> Option<&ChatTranscript> {
        self.transcripts.get(key)
    }

    // ------------------------------------------------------------------
    // Tabs
    // ------------------------------------------------------------------

    /// Open (or re-activate) a document and make sure it is loaded.
    pub fn open_document(&mut self, key: DocKey) -> Result<TabOpen, ControllerError> {
        if self.markdown_only && !key.is_markdown() {
            return Err(ControllerError::UnsupportedDocument(key));
        }
        self.sessions.ensure_loaded(&key);
        Ok(self.tabs.open(key))
    }

    /// Switch to an open document. A generation for another document keeps running.
    pub fn activate(&mut self, key: &DocKey) -> Result<(), ControllerError> {
        if self.tabs.activate(key) {
            Ok(())
        } else {
            Err(ControllerError::NotOpen(key.clone()))
        }
    }

    /// Close a tab, dropping its session and conversation.
    ///
    /// A generation targeting the document is discarded. A commit already
    /// writing is left to finish, but its result is ignored.
    pub fn close_document(&mut self, key: &DocKey) -> Result<(), ControllerError> {
        if !self.tabs.close(key) {
            return Err(ControllerError::NotOpen(key.clone()));
        }
        if let Some(session) = self.slot.take_for(key) {
            tracing::info!(id = %session.id(), %key, status = %session.status(), "Discarding generation for closed document");
            session.cancel();
        }
        self.sessions.destroy(key);
        self.transcripts.remove(key);
        Ok(())
    }

    pub fn open_settings(&mut self) {
        self.tabs.open_settings();
    }

    pub fn close_settings(&mut self) {
        self.tabs.close_settings();
    }

    /// Replace the open-candidates list from the vault tree. Returns how many were found.
    pub async fn refresh_tree(&mut self, source: &dyn TreeSource) -> Result<usize, StoreError> {
        let tree = source.list_tree().await?;
        let candidates: Vec<DocKey> = leaf_keys(&tree)
            .into_iter()
            .filter(|key| !self.markdown_only || key.is_markdown())
            .collect();
        let count = candidates.len();
        self.tabs.set_candidates(candidates);
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Editing
    // ------------------------------------------------------------------

    pub fn begin_edit(&mut self, key: &DocKey) -> Result<(), ControllerError> {
        Ok(self.sessions.begin_edit(key)?)
    }

    pub fn update_edit_buffer(
        &mut self,
        key: &DocKey,
        text: impl Into<String>,
    ) -> Result<(), ControllerError> {
        Ok(self.sessions.update_buffer(key, text)?)
    }

    pub fn cancel_edit(&mut self, key: &DocKey) -> Result<(), ControllerError> {
        Ok(self.sessions.cancel_edit(key)?)
    }

    pub fn save(&mut self, key: &DocKey, text: impl Into<String>) -> Result<(), ControllerError> {
        Ok(self.sessions.save(key, text)?)
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    pub fn start_advise(&mut self, question: &str) -> Result<GenerationId, ControllerError> {
        let question = NonEmptyString::new(question).map_err(|_| ControllerError::EmptyPrompt)?;
        self.start_generation(GenerationRequest::Advise { question })
    }

    pub fn start_edit(&mut self, instruction: &str) -> Result<GenerationId, ControllerError> {
        let instruction =
            NonEmptyString::new(instruction).map_err(|_| ControllerError::EmptyPrompt)?;
        self.start_generation(GenerationRequest::Edit { instruction })
    }

    pub fn start_optimize(&mut self) -> Result<GenerationId, ControllerError> {
        self.start_generation(GenerationRequest::Optimize)
    }

    /// Start a generation against the active document.
    ///
    /// Refused while any generation exists, whatever its document or status.
    pub fn start_generation(
        &mut self,
        request: GenerationRequest,
    ) -> Result<GenerationId, ControllerError> {
        let key = self
            .tabs
            .active_document()
            .cloned()
            .ok_or(ControllerError::NoActiveDocument)?;
        self.slot
            .check_free()
            .map_err(|busy| ControllerError::GenerationBusy {
                key: busy.key,
                status: busy.status,
            })?;

        let mode = request.mode();
        let original_content = if mode.produces_preview() {
            let session = self
                .sessions
                .get(&key)
                .filter(|s| s.has_loaded())
                .ok_or_else(|| ControllerError::DocumentNotLoaded(key.clone()))?;
            session.content().to_string()
        } else {
            String::new()
        };

        if let GenerationRequest::Advise { question } = &request {
            let transcript = self.transcripts.entry(key.clone()).or_default();
            transcript.push_user(question.as_str());
            transcript.begin_assistant();
        }

        let id = self.next_id;
        self.next_id = id.next();
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(STREAM_EVENT_CHANNEL_CAPACITY);
        let session =
            GenerationSession::new(id, key.clone(), mode, original_content, token.clone(), rx);
        self.slot
            .try_claim(session)
            .map_err(|busy| ControllerError::GenerationBusy {
                key: busy.key,
                status: busy.status,
            })?;

        tracing::info!(%id, %key, %mode, "Starting generation");
        let backend = Arc::clone(&self.backend);
        tokio::spawn(run_generation(backend, key, request, token, tx));
        Ok(id)
    }

    /// Stop a generation that is still streaming. Returns whether one was.
    ///
    /// An advise reply keeps what arrived so far. Edit and optimize output is
    /// dropped; the document is untouched either way.
    pub fn cancel_generation(&mut self) -> bool {
        let Some(session) = self.slot.take_if(GenerationStatus::Generating) else {
            return false;
        };
        session.cancel();
        if session.mode() == GenerationMode::Advise
            && let Some(transcript) = self.transcripts.get_mut(session.key())
        {
            transcript.abandon_assistant();
        }
        tracing::info!(id = %session.id(), key = %session.key(), "Generation cancelled");
        true
    }

    /// Throw away a preview. Returns whether there was one.
    pub fn discard_preview(&mut self) -> bool {
        let Some(session) = self.slot.take_if(GenerationStatus::Previewing) else {
            return false;
        };
        tracing::info!(id = %session.id(), key = %session.key(), "Preview discarded");
        true
    }

    /// Write the preview to the document store.
    ///
    /// The document's content changes only once the write succeeds; a failed
    /// write returns the generation to `Previewing`.
    pub fn confirm_preview(&mut self) -> Result<GenerationId, ControllerError> {
        let session = self
            .slot
            .get_mut()
            .filter(|s| s.status() == GenerationStatus::Previewing)
            .ok_or(ControllerError::NoPreview)?;

        self.sessions.commit(session.key(), session.accumulated())?;
        session.mark_committing();
        tracing::info!(id = %session.id(), key = %session.key(), bytes = session.accumulated().len(), "Committing preview");
        Ok(session.id())
    }

    pub fn clear_conversation(&mut self, key: &DocKey) -> Result<(), ControllerError> {
        let streaming_here = self.slot.get().is_some_and(|s| {
            s.key() == key
                && s.mode() == GenerationMode::Advise
                && s.status() == GenerationStatus::Generating
        });
        if streaming_here {
            return Err(ControllerError::ConversationBusy(key.clone()));
        }
        if let Some(transcript) = self.transcripts.get_mut(key) {
            transcript.clear();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event processing
    // ------------------------------------------------------------------

    /// Apply everything that has arrived, without waiting.
    pub fn process_events(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();

        for update in self.sessions.poll_updates() {
            self.apply_session_update(update, &mut notices);
        }

        loop {
            let Some(events) = self.slot.get_mut().and_then(GenerationSession::events_mut) else {
                break;
            };
            match events.try_recv() {
                Ok(event) => self.apply_stream_event(event, &mut notices),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.stream_closed(&mut notices);
                    break;
                }
            }
        }

        notices
    }

    /// Wait until something happens and return what it produced.
    ///
    /// Returns `None` when no load, save, or stream is outstanding.
    pub async fn next_notices(&mut self) -> Option<Vec<Notice>> {
        loop {
            let ready = self.process_events();
            if !ready.is_empty() {
                return Some(ready);
            }

            let stream_open = self
                .slot
                .get()
                .is_some_and(|s| s.status() == GenerationStatus::Generating);
            let sessions_pending = self.sessions.has_pending();
            if !stream_open && !sessions_pending {
                return None;
            }

            let events = self.slot.get_mut().and_then(GenerationSession::events_mut);
            let wake = tokio::select! {
                event = next_stream_event(events), if stream_open => Wake::Stream(event),
                update = self.sessions.next_update(), if sessions_pending => Wake::Session(update),
            };

            let mut notices = Vec::new();
            match wake {
                Wake::Stream(Some(event)) => self.apply_stream_event(event, &mut notices),
                Wake::Stream(None) => self.stream_closed(&mut notices),
                Wake::Session(Some(update)) => self.apply_session_update(update, &mut notices),
                Wake::Session(None) => {}
            }
            notices.extend(self.process_events());
            if !notices.is_empty() {
                return Some(merge_fragments(notices));
            }
        }
    }

    fn apply_stream_event(&mut self, event: StreamEvent, notices: &mut Vec<Notice>) {
        let Some(session) = self
            .slot
            .get_mut()
            .filter(|s| s.status() == GenerationStatus::Generating)
        else {
            return;
        };
        let id = session.id();
        let key = session.key().clone();
        let mode = session.mode();

        match event {
            StreamEvent::Content(text) => {
                if !session.append(&text) {
                    return;
                }
                if mode == GenerationMode::Advise
                    && let Some(transcript) = self.transcripts.get_mut(&key)
                {
                    transcript.append_assistant(&text);
                }
                push_fragment(notices, id, key, text);
            }
            StreamEvent::End if mode.produces_preview() => {
                session.finish_stream();
                let stats = session.diff_stats();
                tracing::info!(%id, %key, %stats, "Preview ready");
                notices.push(Notice::PreviewReady { id, key, stats });
            }
            StreamEvent::End => {
                self.slot.take();
                if let Some(transcript) = self.transcripts.get_mut(&key) {
                    transcript.finish_assistant();
                }
                tracing::info!(%id, %key, "Advice complete");
                notices.push(Notice::AdviceComplete { id, key });
            }
            StreamEvent::Error(failure) => {
                self.slot.take();
                if mode == GenerationMode::Advise
                    && let Some(transcript) = self.transcripts.get_mut(&key)
                {
                    transcript.fail_assistant(&failure.to_string());
                }
                tracing::warn!(%id, %key, %mode, %failure, "Generation failed");
                notices.push(Notice::GenerationFailed {
                    id,
                    key,
                    mode,
                    failure,
                });
            }
        }
    }

    /// The decode task went away without a terminal event.
    fn stream_closed(&mut self, notices: &mut Vec<Notice>) {
        if let Some(session) = self.slot.get_mut() {
            session.close_events();
        }
        self.apply_stream_event(
            StreamEvent::Error(StreamFailure::Transport(
                "stream closed before completion".to_string(),
            )),
            notices,
        );
    }

    fn apply_session_update(&mut self, update: SessionUpdate, notices: &mut Vec<Notice>) {
        match update {
            SessionUpdate::Loaded { key } => notices.push(Notice::DocumentLoaded { key }),
            SessionUpdate::LoadFailed { key, error } => {
                notices.push(Notice::LoadFailed { key, error });
            }
            SessionUpdate::Saved {
                key,
                origin: SaveOrigin::User,
            } => notices.push(Notice::DocumentSaved { key }),
            SessionUpdate::SaveFailed {
                key,
                origin: SaveOrigin::User,
                error,
            } => notices.push(Notice::SaveFailed { key, error }),
            SessionUpdate::Saved {
                key,
                origin: SaveOrigin::Generation,
            } => match self.committing_for(&key) {
                Some(id) => {
                    self.slot.take();
                    tracing::info!(%id, %key, "Preview committed");
                    notices.push(Notice::Committed { id, key });
                }
                None => notices.push(Notice::DocumentSaved { key }),
            },
            SessionUpdate::SaveFailed {
                key,
                origin: SaveOrigin::Generation,
                error,
            } => match self.committing_for(&key) {
                Some(id) => {
                    if let Some(session) = self.slot.get_mut() {
                        session.commit_failed();
                    }
                    notices.push(Notice::CommitFailed { id, key, error });
                }
                None => notices.push(Notice::SaveFailed { key, error }),
            },
        }
    }

    fn committing_for(&self, key: &DocKey) -> Option<GenerationId> {
        self.slot
            .get()
            .filter(|s| s.key() == key && s.status() == GenerationStatus::Committing)
            .map(GenerationSession::id)
    }
}

fn push_fragment(notices: &mut Vec<Notice>, id: GenerationId, key: DocKey, text: String) {
    if let Some(Notice::Fragment {
        id: last_id,
        text: last_text,
        ..
    }) = notices.last_mut()
        && *last_id == id
    {
        last_text.push_str(&text);
        return;
    }
    notices.push(Notice::Fragment { id, key, text });
}

fn merge_fragments(notices: Vec<Notice>) -> Vec<Notice> {
    let mut merged = Vec::with_capacity(notices.len());
    for notice in notices {
        match notice {
            Notice::Fragment { id, key, text } => push_fragment(&mut merged, id, key, text),
            other => merged.push(other),
        }
    }
    merged
}

async fn next_stream_event(events: Option<&mut mpsc::Receiver<StreamEvent>>) -> Option<StreamEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Open the stream and forward decoded events until a terminal one,
/// cancellation, or the receiving session going away.
async fn run_generation(
    backend: Arc<dyn GenerationBackend>,
    key: DocKey,
    request: GenerationRequest,
    token: CancellationToken,
    tx: mpsc::Sender<StreamEvent>,
) {
    let source = match backend.open_stream(&key, &request, &token).await {
        Ok(source) => source,
        Err(TransportError::Cancelled) => return,
        Err(e) => {
            if !token.is_cancelled() {
                let _ = tx
                    .send(StreamEvent::Error(StreamFailure::Transport(e.to_string())))
                    .await;
            }
            return;
        }
    };

    let mut decoder = StreamDecoder::new(source, token);
    while let Some(event) = decoder.next_event().await {
        let terminal = event.is_terminal();
        if tx.send(event).await.is_err() || terminal {
            break;
        }
    }
    tracing::debug!(%key, "Generation task finished");
}

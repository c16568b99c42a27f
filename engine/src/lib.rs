//! Core engine for Quire - document sessions and the AI generation state machine.
//!
//! This crate contains no terminal or rendering code. Front ends drive a
//! [`Controller`] and render what its accessors and [`Notice`]s report.
//!
//! # Generation lifecycle
//!
//! ```text
//! idle ─start─▶ generating ─end─▶ previewing ─confirm─▶ committing ─ok─▶ idle
//!                  │   │              │                     │
//!                  │   └─error─▶ idle └─discard─▶ idle      └─fail─▶ previewing
//!                  └─cancel─▶ idle
//! ```
//!
//! Advise generations skip `previewing`: their output lands in the document's
//! chat transcript and the session ends with the stream.

mod chat;
mod controller;
mod document;
mod generation;
mod preview;
mod tabs;

pub use chat::{ChatTranscript, FAILED_REPLY_BADGE};
pub use controller::{Controller, ControllerError, Notice};
pub use document::{
    DocumentSession, LoadStatus, SaveOrigin, SessionError, SessionStore, SessionUpdate,
};
pub use generation::{GenerationSession, GenerationSlot, GenerationStatus, SlotOccupied};
pub use preview::{DiffStats, diff_stats, format_preview_diff};
pub use tabs::{TabManager, TabOpen};

pub use quire_providers;
pub use quire_types;

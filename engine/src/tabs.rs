//! Open document tabs and the active view.

use quire_types::{ActiveView, DocKey};

/// Outcome of [`TabManager::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabOpen {
    Created,
    /// The key was already open and is now active.
    Activated,
}

/// Tabs in the order they were opened, plus what is currently shown.
///
/// The settings pseudo-tab lives outside the document list.
#[derive(Debug, Default)]
pub struct TabManager {
    tabs: Vec<DocKey>,
    active: ActiveView,
    settings_open: bool,
    candidates: Vec<DocKey>,
}

impl TabManager {
    #[must_use]
    pub fn tabs(&self) -> &[DocKey] {
        &self.tabs
    }

    #[must_use]
    pub fn active(&self) -> &ActiveView {
        &self.active
    }

    #[must_use]
    pub fn active_document(&self) -> Option<&DocKey> {
        self.active.document()
    }

    #[must_use]
    pub fn is_open(&self, key: &DocKey) -> bool {
        self.tabs.contains(key)
    }

    #[must_use]
    pub fn settings_open(&self) -> bool {
        self.settings_open
    }

    pub fn open(&mut self, key: DocKey) -> TabOpen {
        let outcome = if self.is_open(&key) {
            TabOpen::Activated
        } else {
            self.tabs.push(key.clone());
            TabOpen::Created
        };
        self.active = ActiveView::Document(key);
        outcome
    }

    /// Show an already open document.
    pub fn activate(&mut self, key: &DocKey) -> bool {
        if !self.is_open(key) {
            return false;
        }
        self.active = ActiveView::Document(key.clone());
        true
    }

    /// Remove `key`. If it was showing, fall back to the most recently opened
    /// remaining tab, then settings if open, then the empty view.
    pub fn close(&mut self, key: &DocKey) -> bool {
        let Some(index) = self.tabs.iter().position(|k| k == key) else {
            return false;
        };
        self.tabs.remove(index);
        if self.active.document() == Some(key) {
            self.active = self.fallback_view();
        }
        true
    }

    pub fn open_settings(&mut self) {
        self.settings_open = true;
        self.active = ActiveView::Settings;
    }

    pub fn close_settings(&mut self) {
        self.settings_open = false;
        if self.active == ActiveView::Settings {
            self.active = self.fallback_view();
        }
    }

    /// Documents offered for opening, as listed by the vault tree.
    #[must_use]
    pub fn candidates(&self) -> &[DocKey] {
        &self.candidates
    }

    pub fn set_candidates(&mut self, candidates: Vec<DocKey>) {
        self.candidates = candidates;
    }

    fn fallback_view(&self) -> ActiveView {
        match self.tabs.last() {
            Some(key) => ActiveView::Document(key.clone()),
            None if self.settings_open => ActiveView::Settings,
            None => ActiveView::Empty,
        }
    }
}

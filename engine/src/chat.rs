//! Advise conversations, one per document.

use quire_types::{ChatMessage, ChatRole};

/// Prefix of an assistant reply replaced after its stream failed.
pub const FAILED_REPLY_BADGE: &str = "[Generation failed]";

/// Ordered user/assistant messages. While a reply streams, the last message
/// is the assistant entry being appended to.
#[derive(Debug, Default, Clone)]
pub struct ChatTranscript {
    messages: Vec<ChatMessage>,
    streaming: bool,
}

impl ChatTranscript {
    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.messages.push(ChatMessage::user(text));
    }

    /// Open an empty assistant reply to stream into.
    pub fn begin_assistant(&mut self) {
        self.messages.push(ChatMessage::assistant(String::new()));
        self.streaming = true;
    }

    pub fn append_assistant(&mut self, fragment: &str) -> bool {
        match self.streaming_reply() {
            Some(reply) => {
                reply.text.push_str(fragment);
                true
            }
            None => false,
        }
    }

    /// The reply completed. A reply that received nothing is dropped.
    pub fn finish_assistant(&mut self) {
        self.close_reply();
    }

    /// The reply was cancelled; partial text stays.
    pub fn abandon_assistant(&mut self) {
        self.close_reply();
    }

    /// Replace the streaming reply with an error notice.
    pub fn fail_assistant(&mut self, message: &str) {
        if let Some(reply) = self.streaming_reply() {
            reply.text = format!("{FAILED_REPLY_BADGE} {message}");
        }
        self.streaming = false;
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.streaming = false;
    }

    fn streaming_reply(&mut self) -> Option<&mut ChatMessage> {
        if !self.streaming {
            return None;
        }
        self.messages
            .last_mut()
            .filter(|m| m.role == ChatRole::Assistant)
    }

    fn close_reply(&mut self) {
        if self.streaming_reply().is_some_and(|reply| reply.text.is_empty()) {
            self.messages.pop();
        }
        self.streaming = false;
    }
}

//! Ordered in-memory message sequence for the active thread. All mutation is
//! keyed by message id, never by position: concurrent UI updates may reorder
//! renders but never the sequence itself.

use crate::models::{CompletionState, Message, MessageRole};

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Replaces the content of the message with the given id. Returns false
    /// when no message matches (e.g. it was removed by a failure path).
    pub fn replace_content(&mut self, id: &str, content: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(m) => {
                m.content = content.to_string();
                true
            }
            None => false,
        }
    }

    /// Swaps a temporary id for the backend's durable one, in place. The
    /// swap happens at most once: a message that already carries a durable
    /// id is left untouched.
    pub fn assign_durable_id(&mut self, temp_id: &str, durable_id: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == temp_id) {
            Some(m) if m.has_temp_id() => {
                m.id = durable_id.to_string();
                true
            }
            _ => false,
        }
    }

    pub fn set_completion(&mut self, id: &str, state: CompletionState) -> bool {
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(m) => {
                m.completion = state;
                true
            }
            None => false,
        }
    }

    /// Removes and returns the message with the given id (failure rollback).
    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let pos = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(pos))
    }

    /// Id of the most recent message still marked as streaming, regardless of
    /// whether its temp id has already been swapped for a durable one.
    pub fn last_streaming_id(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.completion == CompletionState::Streaming)
            .map(|m| m.id.clone())
    }

    /// Model tag of the most recent assistant message, used to restore the
    /// model picker on thread reload. `None` when no assistant message
    /// carries a tag; the caller keeps its prior selection.
    pub fn last_assistant_model(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == MessageRole::Assistant)
            .find_map(|m| m.model.as_deref())
    }
}

//! In-memory conversation history.
//!
//! Messages are only ever appended, in turn order, and the whole sequence is
//! replayed to the model on every round. The one exception is
//! [`Conversation::truncate`], used to drop a failed query's partial turns.

use crate::inference::types::{ContentBlock, Message, Role};

/// Append-only message history for one conversation.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a user message with a single text block.
    pub fn push_user_text(&mut self, text: &str) {
        self.messages.push(Message::user_text(text));
    }

    /// Append the model's reply verbatim.
    pub fn push_assistant(&mut self, message: Message) {
        debug_assert_eq!(message.role, Role::Assistant);
        self.messages.push(message);
    }

    /// Append one user message carrying the tool results of a round, in order.
    pub fn push_tool_results(&mut self, results: Vec<ContentBlock>) {
        self.messages.push(Message {
            role: Role::User,
            content: results,
        });
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop everything after the first `len` messages.
    pub fn truncate(&mut self, len: usize) {
        self.messages.truncate(len);
    }
}

use std::collections::HashSet;

use shared::{
    domain::{ConversationId, MessageId},
    protocol::Message,
};

/// Local copy of one conversation's messages, oldest first.
///
/// Pages, own sends and realtime echoes can deliver the same message more
/// than once; each id is applied at most once. After [`ThreadState::close`]
/// every late result is ignored.
#[derive(Debug, Clone, Copy)]
enum Placement {
    AfterTies,
    BeforeTies,
}

#[derive(Debug, Clone)]
pub struct ThreadState {
    conversation_id: ConversationId,
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
    closed: bool,
}

impl ThreadState {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            seen: HashSet::new(),
            closed: false,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
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

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.seen.contains(&message_id)
    }

    /// Inserts `message` at its chronological position, after any message
    /// with the same timestamp. `false` if it was already present, belongs to
    /// another conversation or the thread is closed.
    pub fn apply(&mut self, message: Message) -> bool {
        self.insert(message, Placement::AfterTies)
    }

    /// Merges an older page (oldest first); returns how many of its messages
    /// were new. Page messages land before held messages that share their
    /// timestamp, and keep their page order among themselves.
    pub fn prepend_older(&mut self, page: Vec<Message>) -> usize {
        let mut added = 0;
        for message in page.into_iter().rev() {
            if self.insert(message, Placement::BeforeTies) {
                added += 1;
            }
        }
        added
    }

    fn insert(&mut self, message: Message, placement: Placement) -> bool {
        if self.closed
            || message.conversation_id != self.conversation_id
            || !self.seen.insert(message.id)
        {
            return false;
        }
        let at = message.created_at;
        let index = self.messages.partition_point(|existing| match placement {
            Placement::AfterTies => existing.created_at <= at,
            Placement::BeforeTies => existing.created_at < at,
        });
        self.messages.insert(index, message);
        true
    }

    /// Offset of the next older page for a newest-first read.
    pub fn next_offset(&self) -> u64 {
        self.messages.len() as u64
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
#[path = "tests/thread_tests.rs"]
mod tests;

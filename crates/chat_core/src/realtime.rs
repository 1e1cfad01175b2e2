use backend::{decode_row, BackendHandle, ChangeFilter, Filter};
use shared::{domain::ConversationId, protocol::Message};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{error::ChatError, tables::MESSAGES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Subscribed,
    Unsubscribed,
}

/// Opens live feeds of new messages, one per conversation screen.
pub struct SubscriptionManager {
    backend: BackendHandle,
}

impl SubscriptionManager {
    pub fn new(backend: BackendHandle) -> Self {
        Self { backend }
    }

    /// Calls `on_insert` for every message inserted into the conversation, in
    /// delivery order, until the handle is unsubscribed or dropped. Redelivered
    /// events are passed through as-is.
    pub async fn subscribe<F>(
        &self,
        conversation_id: ConversationId,
        mut on_insert: F,
    ) -> Result<ChannelHandle, ChatError>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let filter = ChangeFilter::inserts(MESSAGES)
            .with_filter(Filter::eq("conversation_id", conversation_id.to_string()));
        let mut subscription = self.backend.realtime.subscribe(filter).await?;
        debug!(%conversation_id, "realtime: subscribed");

        let task = tokio::spawn(async move {
            while let Some(change) = subscription.next().await {
                match decode_row::<Message>(change.record) {
                    Ok(message) => on_insert(message),
                    Err(err) => {
                        warn!(%conversation_id, error = %err, "realtime: skipping undecodable message");
                    }
                }
            }
            debug!(%conversation_id, "realtime: feed ended");
        });

        Ok(ChannelHandle {
            conversation_id,
            task: Some(task),
        })
    }

    pub fn unsubscribe(&self, handle: &mut ChannelHandle) {
        handle.unsubscribe();
    }
}

/// Owner of one live feed. Unsubscribing twice is a no-op and dropping the
/// handle unsubscribes.
pub struct ChannelHandle {
    conversation_id: ConversationId,
    task: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn state(&self) -> SubscriptionState {
        match &self.task {
            Some(task) if !task.is_finished() => SubscriptionState::Subscribed,
            _ => SubscriptionState::Unsubscribed,
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            // Aborting drops the subscription, which releases the server binding.
            task.abort();
            debug!(conversation_id = %self.conversation_id, "realtime: unsubscribed");
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;

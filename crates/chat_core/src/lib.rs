//! Messaging between two marketplace users: conversations, paginated threads,
//! media attachments, live updates and push alerts, all over one
//! [`BackendHandle`].

use std::{sync::Arc, time::Duration};

use backend::{BackendError, BackendHandle};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{Conversation, Message, ProfileSummary},
};
use tracing::{info, warn};

pub mod directory;
pub mod error;
pub mod media;
pub mod messages;
pub mod notifications;
pub mod realtime;
pub mod thread;

pub use directory::ConversationDirectory;
pub use error::ChatError;
pub use media::{extension_for, Attachment, MediaUploader};
pub use messages::MessageStore;
pub use notifications::{preview, NotificationDispatcher};
pub use realtime::{ChannelHandle, SubscriptionManager, SubscriptionState};
pub use thread::ThreadState;

pub mod tables {
    pub const CONVERSATIONS: &str = "conversations";
    pub const MESSAGES: &str = "messages";
    pub const PROFILES: &str = "profiles";
    pub const PUSH_TOKENS: &str = "push_tokens";
}

pub const DEFAULT_MEDIA_BUCKET: &str = "chat-media";
pub const DEFAULT_PAGE_SIZE: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSettings {
    pub media_bucket: String,
    pub page_size: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            media_bucket: DEFAULT_MEDIA_BUCKET.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub counterpart: ProfileSummary,
    pub unread: u64,
}

/// The messaging components wired over one backend handle, plus the send
/// flow that strings them together.
pub struct ChatClient {
    backend: BackendHandle,
    settings: ChatSettings,
    directory: Arc<ConversationDirectory>,
    messages: MessageStore,
    media: MediaUploader,
    realtime: SubscriptionManager,
    notifications: Arc<NotificationDispatcher>,
}

impl ChatClient {
    pub fn new(backend: BackendHandle, settings: ChatSettings) -> Self {
        let directory = Arc::new(ConversationDirectory::new(backend.clone()));
        let notifications = Arc::new(NotificationDispatcher::new(
            backend.clone(),
            Arc::clone(&directory),
        ));
        Self {
            messages: MessageStore::new(backend.clone()).with_notifier(Arc::clone(&notifications)),
            media: MediaUploader::new(backend.clone(), settings.media_bucket.clone()),
            realtime: SubscriptionManager::new(backend.clone()),
            directory,
            notifications,
            settings,
            backend,
        }
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn media(&self) -> &MediaUploader {
        &self.media
    }

    pub fn realtime(&self) -> &SubscriptionManager {
        &self.realtime
    }

    pub fn notifications(&self) -> &Arc<NotificationDispatcher> {
        &self.notifications
    }

    pub async fn current_user(&self) -> Result<UserId, ChatError> {
        match self.backend.auth.current_user().await {
            Ok(Some(user_id)) => Ok(user_id),
            Ok(None) | Err(BackendError::Unauthorized(_)) => Err(ChatError::AuthRequired),
            Err(err) => Err(ChatError::Backend(err)),
        }
    }

    /// Conversation between the session user and `other`, created on first contact.
    pub async fn open_conversation(&self, other: UserId) -> Result<Conversation, ChatError> {
        let user_id = self.current_user().await?;
        self.directory.get_or_create(user_id, other).await
    }

    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        let user_id = self.current_user().await?;
        let mut summaries = Vec::new();
        for conversation in self.directory.list_for_user(user_id).await {
            let counterpart = self
                .directory
                .resolve_other_participant(conversation.id, user_id)
                .await;
            let unread = self.messages.unread_count(conversation.id, user_id).await;
            summaries.push(ConversationSummary {
                conversation,
                counterpart,
                unread,
            });
        }
        Ok(summaries)
    }

    /// Page `page` of the thread (0 is the newest), oldest message first.
    pub async fn load_page(&self, conversation_id: ConversationId, page: u64) -> Vec<Message> {
        let limit = self.settings.page_size;
        self.messages
            .fetch_page(conversation_id, limit, page.saturating_mul(limit))
            .await
    }

    /// Fetches the page before what `thread` already holds and merges it.
    /// Returns how many messages were added.
    pub async fn load_older(&self, thread: &mut ThreadState) -> usize {
        let page = self
            .messages
            .fetch_page(
                thread.conversation_id(),
                self.settings.page_size,
                thread.next_offset(),
            )
            .await;
        thread.prepend_older(page)
    }

    /// Validates the draft, uploads the attachment if any, then stores the
    /// message. The push alert goes out on its own task.
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        text: &str,
        attachment: Option<Attachment>,
    ) -> Result<Message, ChatError> {
        let user_id = self.current_user().await?;
        if text.trim().is_empty() && attachment.is_none() {
            return Err(ChatError::EmptyMessage);
        }

        let uploaded = match attachment {
            Some(attachment) => {
                let url = self
                    .media
                    .try_upload(conversation_id, user_id, &attachment.uri, attachment.kind)
                    .await?;
                Some((url, attachment.kind))
            }
            None => None,
        };

        let stored = self
            .messages
            .insert(
                conversation_id,
                user_id,
                text,
                uploaded.as_ref().map(|(url, _)| url.as_str()),
                uploaded.as_ref().map(|(_, kind)| *kind),
            )
            .await;
        match stored {
            Some(message) => {
                info!(%conversation_id, message_id = %message.id, "chat: message sent");
                Ok(message)
            }
            None => {
                if let Some((url, _)) = uploaded {
                    if !self.media.remove(&url).await {
                        warn!(%conversation_id, %url, "chat: orphaned media left behind");
                    }
                }
                Err(ChatError::SendFailed)
            }
        }
    }

    /// Live feed of new messages in the conversation.
    pub async fn watch<F>(
        &self,
        conversation_id: ConversationId,
        on_insert: F,
    ) -> Result<ChannelHandle, ChatError>
    where
        F: FnMut(Message) + Send + 'static,
    {
        self.realtime.subscribe(conversation_id, on_insert).await
    }

    /// Gives push alerts spawned by earlier sends up to `timeout` to finish.
    /// Call before dropping the runtime; returns how many were abandoned.
    pub async fn flush_notifications(&self, timeout: Duration) -> usize {
        self.notifications.flush(timeout).await
    }

    /// Marks what the counterpart sent as read by the session user.
    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<u64, ChatError> {
        let user_id = self.current_user().await?;
        Ok(self
            .messages
            .mark_conversation_read(conversation_id, user_id)
            .await)
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

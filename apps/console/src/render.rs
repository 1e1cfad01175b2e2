use chat_core::{notifications::media_label, ConversationSummary};
use chrono::{DateTime, Utc};
use shared::{domain::UserId, protocol::Message};

const TIME_FORMAT: &str = "%d/%m %H:%M";

fn timestamp(at: DateTime<Utc>) -> String {
    at.format(TIME_FORMAT).to_string()
}

pub fn conversation_line(summary: &ConversationSummary) -> String {
    let conversation = &summary.conversation;
    let when = conversation
        .last_message_at
        .map(timestamp)
        .unwrap_or_else(|| "--/-- --:--".to_string());
    let last = conversation.last_message.as_deref().unwrap_or("");
    let badge = if summary.unread > 0 {
        format!(" [{}]", summary.unread)
    } else {
        String::new()
    };
    format!(
        "{}  {when}  {}{badge}: {last}",
        conversation.id, summary.counterpart.name
    )
}

/// One thread entry; the session user's own messages are marked with `>`.
pub fn message_line(message: &Message, me: Option<UserId>) -> String {
    let marker = if Some(message.sender_id) == me { '>' } else { '<' };
    let mut body = message.content.clone();
    if let Some(kind) = message.media_type {
        let label = media_label(kind);
        body = if body.is_empty() {
            label.to_string()
        } else {
            format!("{label} {body}")
        };
    }
    if let Some(url) = &message.media_url {
        body.push_str(&format!(" <{url}>"));
    }
    let receipt = if message.read_at.is_some() { " ✓✓" } else { "" };
    format!("{marker} {} {body}{receipt}", timestamp(message.created_at))
}

#[cfg(test)]
#[path = "tests/render_tests.rs"]
mod tests;

use super::*;
use serde_json::json;

#[test]
fn message_decodes_with_missing_optional_columns() {
    let message: Message = serde_json::from_value(json!({
        "id": "6f1c8d8e-6e0d-4f39-9a8e-0c3d3f0f5a11",
        "conversation_id": "0b8f3b7c-3c2f-4d8a-8d4e-1f0f3d2a9b10",
        "sender_id": "2a3e0f5e-7b5d-4c9e-8f1a-3b6c9d2e1f00",
        "created_at": "2026-10-16T12:00:00.123Z"
    }))
    .expect("decode");
    assert_eq!(message.content, "");
    assert!(message.media_url.is_none());
    assert!(message.media_type.is_none());
    assert!(message.read_at.is_none());
}

#[test]
fn new_message_serializes_absent_media_as_null() {
    let payload = serde_json::to_value(NewMessage {
        conversation_id: ConversationId::new(),
        sender_id: UserId::new(),
        content: "hola".into(),
        media_url: None,
        media_type: None,
    })
    .expect("encode");
    assert_eq!(payload["media_url"], Value::Null);
    assert_eq!(payload["media_type"], Value::Null);
}

#[test]
fn other_participant_is_symmetric() {
    let a = UserId::new();
    let b = UserId::new();
    let conversation = Conversation {
        id: ConversationId::new(),
        participant_1_id: a,
        participant_2_id: b,
        created_at: Utc::now(),
        updated_at: None,
        last_message: None,
        last_message_at: None,
        last_message_sender_id: None,
    };
    assert_eq!(conversation.other_participant(a), Some(b));
    assert_eq!(conversation.other_participant(b), Some(a));
    assert_eq!(conversation.other_participant(UserId::new()), None);
}

#[test]
fn profile_summary_falls_back_to_email_then_placeholder() {
    let id = UserId::new();
    let summary = ProfileSummary::from(Profile {
        id,
        full_name: Some("  ".into()),
        email: Some("ana@example.com".into()),
        avatar_url: None,
    });
    assert_eq!(summary.name, "ana@example.com");

    let summary = ProfileSummary::from(Profile {
        id,
        full_name: None,
        email: None,
        avatar_url: None,
    });
    assert_eq!(summary.name, UNKNOWN_USER_NAME);
    assert!(!summary.is_unknown());
}

#[test]
fn null_content_decodes_as_empty_text() {
    let message: Message = serde_json::from_value(json!({
        "id": "6f1c8d8e-6e0d-4f39-9a8e-0c3d3f0f5a11",
        "conversation_id": "0b8f3b7c-3c2f-4d8a-8d4e-1f0f3d2a9b10",
        "sender_id": "2a3e0f5e-7b5d-4c9e-8f1a-3b6c9d2e1f00",
        "content": null,
        "media_url": "https://cdn.example.com/chat-media/a.jpg",
        "media_type": "image",
        "created_at": "2026-10-16T12:00:00.123Z"
    }))
    .expect("decode");
    assert_eq!(message.content, "");
    assert_eq!(message.media_type, Some(MediaKind::Image));
}

use super::*;

use chrono::TimeZone;
use shared::{
    domain::{ConversationId, MediaKind, MessageId},
    protocol::{Conversation, ProfileSummary},
};

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, hour, minute, 0).unwrap()
}

fn message(sender_id: UserId, content: &str) -> Message {
    Message {
        id: MessageId::new(),
        conversation_id: ConversationId::new(),
        sender_id,
        content: content.to_string(),
        media_url: None,
        media_type: None,
        created_at: at(9, 5),
        read_at: None,
    }
}

#[test]
fn conversation_line_shows_counterpart_preview_and_badge() {
    let me = UserId::new();
    let summary = ConversationSummary {
        conversation: Conversation {
            id: ConversationId::new(),
            participant_1_id: me,
            participant_2_id: UserId::new(),
            created_at: at(8, 0),
            updated_at: None,
            last_message: Some("¿Sigue disponible?".into()),
            last_message_at: Some(at(9, 30)),
            last_message_sender_id: None,
        },
        counterpart: ProfileSummary::unknown(),
        unread: 2,
    };

    let line = conversation_line(&summary);
    assert!(line.contains("Usuario Desconocido [2]"));
    assert!(line.contains("16/10 09:30"));
    assert!(line.ends_with(": ¿Sigue disponible?"));

    let quiet = ConversationSummary { unread: 0, ..summary };
    assert!(!conversation_line(&quiet).contains('['));
}

#[test]
fn message_line_marks_direction_and_media() {
    let me = UserId::new();
    let mine = message(me, "hola");
    assert_eq!(message_line(&mine, Some(me)), "> 16/10 09:05 hola");

    let mut photo = message(UserId::new(), "");
    photo.media_type = Some(MediaKind::Image);
    photo.media_url = Some("file:///media/a.jpg".into());
    photo.read_at = Some(at(9, 6));
    assert_eq!(
        message_line(&photo, Some(me)),
        "< 16/10 09:05 📷 Imagen <file:///media/a.jpg> ✓✓"
    );
}

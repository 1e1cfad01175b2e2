use std::{collections::HashSet, sync::Arc};

use super::*;
use crate::test_support::{local_backend, seed_profile, BrokenDatabase, CannedDatabase, GatedDatabase};
use shared::protocol::UNKNOWN_USER_NAME;

#[tokio::test]
async fn get_or_create_reuses_the_pair_in_either_order() {
    let local = local_backend(None).await;
    let directory = ConversationDirectory::new(local.handle.clone());
    let (alice, bob) = (UserId::new(), UserId::new());

    let created = directory.get_or_create(alice, bob).await.expect("create");
    assert_eq!(created.participant_1_id, alice);
    assert_eq!(created.participant_2_id, bob);

    let again = directory.get_or_create(bob, alice).await.expect("lookup");
    assert_eq!(again.id, created.id);
    assert_eq!(directory.list_for_user(alice).await.len(), 1);
}

#[tokio::test]
async fn concurrent_get_or_create_can_create_duplicates() {
    let local = local_backend(None).await;
    let gated = Arc::new(GatedDatabase::new(
        Arc::clone(&local.handle.database),
        "conversations",
        2,
    ));
    let directory = ConversationDirectory::new(local.handle.clone().with_database(gated));
    let (alice, bob) = (UserId::new(), UserId::new());

    let (first, second) = tokio::join!(
        directory.get_or_create(alice, bob),
        directory.get_or_create(bob, alice)
    );
    let first = first.expect("first");
    let second = second.expect("second");

    assert_ne!(first.id, second.id, "both callers missed each other's row");
    let ids: HashSet<_> = directory
        .list_for_user(alice)
        .await
        .into_iter()
        .map(|conversation| conversation.id)
        .collect();
    assert_eq!(ids.len(), 2);
}

#[tokio::test]
async fn pair_constraint_turns_the_race_into_one_conversation() {
    let local = local_backend(None).await;
    local
        .storage
        .enforce_unique_conversation_pairs()
        .await
        .expect("index");
    let gated = Arc::new(GatedDatabase::new(
        Arc::clone(&local.handle.database),
        "conversations",
        2,
    ));
    let directory = ConversationDirectory::new(local.handle.clone().with_database(gated));
    let (alice, bob) = (UserId::new(), UserId::new());

    let (first, second) = tokio::join!(
        directory.get_or_create(alice, bob),
        directory.get_or_create(bob, alice)
    );
    assert_eq!(first.expect("first").id, second.expect("second").id);
}

#[tokio::test]
async fn list_orders_by_last_message_with_silent_conversations_last() {
    let local = local_backend(None).await;
    let directory = ConversationDirectory::new(local.handle.clone());
    let me = UserId::new();
    let silent = directory.get_or_create(me, UserId::new()).await.expect("silent");
    let older = directory.get_or_create(UserId::new(), me).await.expect("older");
    let newer = directory.get_or_create(me, UserId::new()).await.expect("newer");
    let _unrelated = directory
        .get_or_create(UserId::new(), UserId::new())
        .await
        .expect("unrelated");

    for (conversation, sender) in [(&older, older.participant_1_id), (&newer, me)] {
        local
            .handle
            .database
            .insert(
                "messages",
                serde_json::json!({ "conversation_id": conversation.id, "sender_id": sender, "content": "hola" }),
            )
            .await
            .expect("message");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let listed: Vec<_> = directory
        .list_for_user(me)
        .await
        .into_iter()
        .map(|conversation| conversation.id)
        .collect();
    assert_eq!(listed, vec![newer.id, older.id, silent.id]);
}

#[tokio::test]
async fn list_is_empty_when_backend_fails() {
    let local = local_backend(None).await;
    let directory =
        ConversationDirectory::new(local.handle.clone().with_database(Arc::new(BrokenDatabase)));
    assert!(directory.list_for_user(UserId::new()).await.is_empty());
}

#[tokio::test]
async fn list_keeps_conversations_around_a_malformed_row() {
    let me = UserId::new();
    let good = ConversationId::new();
    let rows = vec![
        serde_json::json!({
            "id": good,
            "participant_1_id": me,
            "participant_2_id": UserId::new(),
            "created_at": "2026-10-16T12:00:00.000Z",
        }),
        serde_json::json!({ "id": ConversationId::new(), "participant_1_id": me }),
    ];
    let local = local_backend(None).await;
    let directory = ConversationDirectory::new(
        local
            .handle
            .clone()
            .with_database(Arc::new(CannedDatabase::new(rows))),
    );

    let listed = directory.list_for_user(me).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, good);
}

#[tokio::test]
async fn resolves_counterpart_profile() {
    let local = local_backend(None).await;
    let directory = ConversationDirectory::new(local.handle.clone());
    let (alice, bob) = (UserId::new(), UserId::new());
    seed_profile(&local.handle, bob, Some("Bob Vendedor")).await;
    let conversation = directory.get_or_create(alice, bob).await.expect("create");

    let summary = directory
        .resolve_other_participant(conversation.id, alice)
        .await;
    assert_eq!(summary.user_id, Some(bob));
    assert_eq!(summary.name, "Bob Vendedor");
    assert_eq!(
        directory.other_participant_id(conversation.id, bob).await,
        Some(alice)
    );
}

#[tokio::test]
async fn unresolvable_counterpart_falls_back_to_placeholder() {
    let local = local_backend(None).await;
    let directory = ConversationDirectory::new(local.handle.clone());
    let (alice, bob) = (UserId::new(), UserId::new());
    let conversation = directory.get_or_create(alice, bob).await.expect("create");

    let missing_profile = directory
        .resolve_other_participant(conversation.id, alice)
        .await;
    assert_eq!(missing_profile.name, UNKNOWN_USER_NAME);

    let missing_conversation = directory
        .resolve_other_participant(ConversationId::new(), alice)
        .await;
    assert!(missing_conversation.is_unknown());

    let broken =
        ConversationDirectory::new(local.handle.clone().with_database(Arc::new(BrokenDatabase)));
    assert!(broken
        .resolve_other_participant(conversation.id, alice)
        .await
        .is_unknown());
}

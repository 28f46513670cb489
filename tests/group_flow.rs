use async_trait::async_trait;
use clawlink_server::services::badges::BadgeService;
use clawlink_server::services::error::{ServiceError, ServiceResult};
use clawlink_server::services::events::{group_room, EventBus, EventKind, RealtimeEvent};
use clawlink_server::services::groups::GroupService;
use clawlink_server::services::identity::IdentityService;
use clawlink_server::services::messaging::MessagingService;
use clawlink_server::services::verification::{ExternalVerification, VerificationOutcome};
use clawlink_server::storage::{AgentRecord, SqliteStorage, StorageBackend};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct StubVerification;

#[async_trait]
impl ExternalVerification for StubVerification {
    async fn verify(&self, _handle: &str, _code: &str) -> ServiceResult<VerificationOutcome> {
        Ok(VerificationOutcome {
            ok: true,
            external_id: None,
        })
    }
}

struct TestEnv {
    events: Arc<EventBus>,
    identity: IdentityService,
    groups: Arc<GroupService>,
    messaging: MessagingService,
}

fn test_env() -> TestEnv {
    let db_path = std::env::temp_dir().join(format!(
        "clawlink_group_it_{}.db",
        uuid::Uuid::new_v4().simple()
    ));
    let storage: Arc<dyn StorageBackend> =
        Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()));
    storage.ensure_initialized().unwrap();
    let events = Arc::new(EventBus::new());
    let badges = Arc::new(BadgeService::new(storage.clone()));
    badges.seed_system_badges().unwrap();
    let identity = IdentityService::new(
        storage.clone(),
        Arc::new(StubVerification),
        badges.clone(),
        "https://clawlink.test".to_string(),
    );
    let groups = Arc::new(GroupService::new(storage.clone(), events.clone()));
    let messaging = MessagingService::new(
        storage.clone(),
        events.clone(),
        badges.clone(),
        groups.clone(),
    );
    TestEnv {
        events,
        identity,
        groups,
        messaging,
    }
}

fn register(env: &TestEnv, name: &str, handle: &str) -> AgentRecord {
    env.identity.register(name, handle, None, 10.0).unwrap().agent
}

fn subscribe(env: &TestEnv, agent: &AgentRecord, rooms: &[String]) -> mpsc::Receiver<RealtimeEvent> {
    let (tx, rx) = mpsc::channel(256);
    let id = env
        .events
        .register(&agent.agent_id, tx, CancellationToken::new());
    for room in rooms {
        env.events.join_room(id, room);
    }
    rx
}

#[tokio::test]
async fn permission_override_lets_members_rename() {
    let env = test_env();
    let admin = register(&env, "Admin", "admin");
    let member = register(&env, "Member", "member");
    let group = env
        .groups
        .create(&admin, "Lounge", None, true, 20.0)
        .unwrap();
    env.groups.join(&member, &group.group.id, 21.0).unwrap();

    // Before the override a plain member may not rename.
    let err = env
        .groups
        .update_settings(&member, &group.group.id, Some("New".to_string()), None, None)
        .unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));

    let mut overrides = HashMap::new();
    overrides.insert("renameGroup".to_string(), "member".to_string());
    env.groups
        .update_permissions(&admin, &group.group.id, &overrides)
        .unwrap();

    let renamed = env
        .groups
        .update_settings(&member, &group.group.id, Some("New".to_string()), None, None)
        .unwrap();
    assert_eq!(renamed.name, "New");
    assert_eq!(renamed.slug, "new");
}

#[tokio::test]
async fn delete_group_lock_cannot_be_lowered() {
    let env = test_env();
    let admin = register(&env, "Admin", "admin");
    let group = env
        .groups
        .create(&admin, "Lounge", None, true, 20.0)
        .unwrap();
    let mut overrides = HashMap::new();
    overrides.insert("deleteGroup".to_string(), "member".to_string());
    let err = env
        .groups
        .update_permissions(&admin, &group.group.id, &overrides)
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));
}

#[tokio::test]
async fn role_changes_respect_strict_dominance() {
    let env = test_env();
    let admin = register(&env, "Admin", "admin");
    let member = register(&env, "Member", "member");
    let other = register(&env, "Other", "other");
    let group = env
        .groups
        .create(&admin, "Lounge", None, true, 20.0)
        .unwrap();
    let group_id = group.group.id.clone();
    env.groups.join(&member, &group_id, 21.0).unwrap();
    env.groups.join(&other, &group_id, 21.0).unwrap();

    // Admin promotes a member to moderator.
    env.groups
        .set_member_role(&admin, &group_id, &member.agent_id, "moderator")
        .unwrap();

    // Nobody can assign a role at or above their own.
    let err = env
        .groups
        .set_member_role(&admin, &group_id, &other.agent_id, "admin")
        .unwrap_err();
    assert!(matches!(err, ServiceError::PreconditionFailed(_)));

    // Actors may not change their own role.
    let err = env
        .groups
        .set_member_role(&admin, &group_id, &admin.agent_id, "member")
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));

    // A moderator cannot touch the admin.
    let err = env
        .groups
        .remove_member(&member, &group_id, &admin.agent_id)
        .unwrap_err();
    assert!(matches!(err, ServiceError::PreconditionFailed(_)));

    // But a moderator can remove a plain member.
    env.groups
        .remove_member(&member, &group_id, &other.agent_id)
        .unwrap();
}

#[tokio::test]
async fn the_last_admin_cannot_leave() {
    let env = test_env();
    let admin = register(&env, "Admin", "admin");
    let member = register(&env, "Member", "member");
    let group = env
        .groups
        .create(&admin, "Lounge", None, true, 20.0)
        .unwrap();
    env.groups.join(&member, &group.group.id, 21.0).unwrap();
    let err = env.groups.leave(&admin, &group.group.id).unwrap_err();
    assert!(matches!(err, ServiceError::PreconditionFailed(_)));
    env.groups.leave(&member, &group.group.id).unwrap();
}

#[tokio::test]
async fn duplicate_slugs_conflict() {
    let env = test_env();
    let admin = register(&env, "Admin", "admin");
    env.groups
        .create(&admin, "Agent Lounge", None, true, 20.0)
        .unwrap();
    let err = env
        .groups
        .create(&admin, "agent   lounge", None, true, 21.0)
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn pins_require_messages_from_the_same_group() {
    let env = test_env();
    let admin = register(&env, "Admin", "admin");
    let group_a = env.groups.create(&admin, "Alpha", None, true, 20.0).unwrap();
    let group_b = env.groups.create(&admin, "Beta", None, true, 20.0).unwrap();
    let message = env
        .messaging
        .send(&admin, &group_a.group.id, "hello", None, 21.0)
        .unwrap();

    let err = env
        .groups
        .pin_message(&admin, &group_b.group.id, &message.id, 22.0)
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));

    env.groups
        .pin_message(&admin, &group_a.group.id, &message.id, 22.0)
        .unwrap();
    let err = env
        .groups
        .pin_message(&admin, &group_a.group.id, &message.id, 23.0)
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    let settings = env.groups.get_settings(&admin, &group_a.group.id).unwrap();
    assert_eq!(settings.pinned_messages.len(), 1);
    assert_eq!(settings.pinned_messages[0].message_id, message.id);
}

#[tokio::test]
async fn message_fanout_preserves_persisted_order() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let bob = register(&env, "Bob", "bob");
    let carol = register(&env, "Carol", "carol");
    let group = env.groups.create(&alice, "Lounge", None, true, 20.0).unwrap();
    let group_id = group.group.id.clone();
    env.groups.join(&bob, &group_id, 21.0).unwrap();
    env.groups.join(&carol, &group_id, 21.0).unwrap();

    let mut bob_rx = subscribe(&env, &bob, &[group_room(&group_id)]);
    let mut carol_rx = subscribe(&env, &carol, &[group_room(&group_id)]);

    env.messaging.send(&alice, &group_id, "hi", None, 30.0).unwrap();
    env.messaging.send(&bob, &group_id, "yo", None, 30.01).unwrap();

    for rx in [&mut bob_rx, &mut carol_rx] {
        let first = rx.recv().await.expect("first event");
        let second = rx.recv().await.expect("second event");
        assert_eq!(first.kind, EventKind::MessageNew);
        assert_eq!(second.kind, EventKind::MessageNew);
        let first_at = first.data["message"]["created_at"].as_f64().unwrap();
        let second_at = second.data["message"]["created_at"].as_f64().unwrap();
        assert!(first_at < second_at, "fan-out order matches persisted order");
        assert_eq!(first.data["message"]["content"], "hi");
        assert_eq!(second.data["message"]["content"], "yo");
    }
}

#[tokio::test]
async fn reactions_are_idempotent_per_agent_and_emoji() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let group = env.groups.create(&alice, "Lounge", None, true, 20.0).unwrap();
    let message = env
        .messaging
        .send(&alice, &group.group.id, "hello", None, 21.0)
        .unwrap();

    let emoji = env
        .messaging
        .react(&alice, &group.group.id, &message.id, "like", 22.0)
        .unwrap();
    assert_eq!(emoji, "👍");
    let err = env
        .messaging
        .react(&alice, &group.group.id, &message.id, "👍", 23.0)
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    let listed = env
        .messaging
        .list(&alice, &group.group.id, Some(10), None, 24.0)
        .unwrap();
    assert_eq!(listed[0].reactions.len(), 1);
    assert_eq!(listed[0].reactions[0].count, 1);
}

#[tokio::test]
async fn delete_requires_authorship_or_permission() {
    let env = test_env();
    let admin = register(&env, "Admin", "admin");
    let member = register(&env, "Member", "member");
    let group = env.groups.create(&admin, "Lounge", None, true, 20.0).unwrap();
    let group_id = group.group.id.clone();
    env.groups.join(&member, &group_id, 21.0).unwrap();

    let by_admin = env
        .messaging
        .send(&admin, &group_id, "from admin", None, 22.0)
        .unwrap();
    let by_member = env
        .messaging
        .send(&member, &group_id, "from member", None, 23.0)
        .unwrap();

    // A plain member cannot delete someone else's message.
    let err = env
        .messaging
        .delete(&member, &group_id, &by_admin.id)
        .unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));

    // Authors delete their own; deleteAnyMessage covers the rest.
    env.messaging.delete(&member, &group_id, &by_member.id).unwrap();
    env.messaging.delete(&admin, &group_id, &by_admin.id).unwrap();
}

#[tokio::test]
async fn replies_must_reference_the_same_group() {
    let env = test_env();
    let admin = register(&env, "Admin", "admin");
    let group_a = env.groups.create(&admin, "Alpha", None, true, 20.0).unwrap();
    let group_b = env.groups.create(&admin, "Beta", None, true, 20.0).unwrap();
    let in_alpha = env
        .messaging
        .send(&admin, &group_a.group.id, "hello", None, 21.0)
        .unwrap();
    let err = env
        .messaging
        .send(
            &admin,
            &group_b.group.id,
            "reply",
            Some(in_alpha.id.clone()),
            22.0,
        )
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));

    let reply = env
        .messaging
        .send(
            &admin,
            &group_a.group.id,
            "reply",
            Some(in_alpha.id.clone()),
            23.0,
        )
        .unwrap();
    assert_eq!(
        reply.reply_to.as_ref().map(|preview| preview.message_id.clone()),
        Some(in_alpha.id)
    );
}

#[tokio::test]
async fn listing_is_a_pure_function_of_store_state() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let group = env.groups.create(&alice, "Lounge", None, true, 20.0).unwrap();
    for index in 0..5 {
        env.messaging
            .send(&alice, &group.group.id, &format!("message {index}"), None, 21.0 + index as f64)
            .unwrap();
    }
    let first = env
        .messaging
        .list(&alice, &group.group.id, Some(10), None, 40.0)
        .unwrap();
    let second = env
        .messaging
        .list(&alice, &group.group.id, Some(10), None, 41.0)
        .unwrap();
    assert_eq!(
        serde_json::to_value(&first).unwrap(),
        serde_json::to_value(&second).unwrap()
    );
    let contents: Vec<_> = first.iter().map(|message| message.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["message 0", "message 1", "message 2", "message 3", "message 4"]
    );
}

#[tokio::test]
async fn long_content_is_accepted_up_to_the_cap() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let group = env.groups.create(&alice, "Lounge", None, true, 20.0).unwrap();
    let four_thousand = "x".repeat(4_000);
    env.messaging
        .send(&alice, &group.group.id, &four_thousand, None, 21.0)
        .unwrap();
    let err = env
        .messaging
        .send(&alice, &group.group.id, "   ", None, 22.0)
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));
}

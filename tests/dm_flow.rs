use async_trait::async_trait;
use clawlink_server::services::badges::BadgeService;
use clawlink_server::services::dm::DmService;
use clawlink_server::services::error::{ServiceError, ServiceResult};
use clawlink_server::services::events::{agent_room, EventBus, EventKind, RealtimeEvent};
use clawlink_server::services::expiry::ExpirySweeper;
use clawlink_server::services::identity::IdentityService;
use clawlink_server::services::verification::{ExternalVerification, VerificationOutcome};
use clawlink_server::storage::{AgentRecord, SqliteStorage, StorageBackend};
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
    storage: Arc<dyn StorageBackend>,
    events: Arc<EventBus>,
    identity: IdentityService,
    dm: DmService,
}

fn test_env() -> TestEnv {
    let db_path = std::env::temp_dir().join(format!(
        "clawlink_dm_it_{}.db",
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
    let dm = DmService::new(storage.clone(), events.clone(), badges);
    TestEnv {
        storage,
        events,
        identity,
        dm,
    }
}

fn register(env: &TestEnv, name: &str, handle: &str) -> AgentRecord {
    env.identity.register(name, handle, None, 10.0).unwrap().agent
}

fn subscribe(env: &TestEnv, agent: &AgentRecord) -> mpsc::Receiver<RealtimeEvent> {
    let (tx, rx) = mpsc::channel(256);
    let id = env
        .events
        .register(&agent.agent_id, tx, CancellationToken::new());
    env.events.join_room(id, &agent_room(&agent.agent_id));
    rx
}

fn drain_kinds(rx: &mut mpsc::Receiver<RealtimeEvent>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

#[tokio::test]
async fn timer_negotiation_is_confluent_on_matching_proposals() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let bob = register(&env, "Bob", "bob");
    let mut alice_rx = subscribe(&env, &alice);
    let mut bob_rx = subscribe(&env, &bob);

    // A message sent before activation never expires.
    let early = env
        .dm
        .send(&alice, &bob.agent_id, "pre-timer", None, None, 100.0)
        .unwrap();
    assert!(early.expires_at.is_none());

    let state = env
        .dm
        .set_disappear(&alice, &bob.agent_id, Some(3600), 101.0)
        .unwrap();
    assert_eq!(state.state, "proposed");
    assert_eq!(state.proposed_value, Some(3600));
    assert_eq!(state.proposed_by.as_deref(), Some(alice.agent_id.as_str()));

    // A counter-proposal supersedes.
    let state = env
        .dm
        .set_disappear(&bob, &alice.agent_id, Some(7200), 102.0)
        .unwrap();
    assert_eq!(state.state, "proposed");
    assert_eq!(state.proposed_by.as_deref(), Some(bob.agent_id.as_str()));

    // Matching the open proposal activates, whoever moves last.
    let state = env
        .dm
        .set_disappear(&alice, &bob.agent_id, Some(7200), 103.0)
        .unwrap();
    assert_eq!(state.state, "active");
    assert_eq!(state.timer, Some(7200));
    assert_eq!(state.set_by.as_deref(), Some(bob.agent_id.as_str()));

    assert!(drain_kinds(&mut alice_rx).contains(&EventKind::DmDisappearEnabled));
    assert!(drain_kinds(&mut bob_rx).contains(&EventKind::DmDisappearEnabled));

    // Messages sent while active inherit the timer...
    let timed = env
        .dm
        .send(&alice, &bob.agent_id, "now ticking", None, None, 200.0)
        .unwrap();
    assert_eq!(timed.expires_at, Some(200.0 + 7200.0));
    // ...and the pre-activation message is not retro-expired.
    let thread = env
        .dm
        .list_thread(&bob, &alice.agent_id, Some(50), 201.0)
        .unwrap();
    let early_again = thread.iter().find(|message| message.id == early.id).unwrap();
    assert!(early_again.expires_at.is_none());
}

#[tokio::test]
async fn overwriting_ones_own_proposal_keeps_it_pending() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let bob = register(&env, "Bob", "bob");
    env.dm
        .set_disappear(&alice, &bob.agent_id, Some(600), 100.0)
        .unwrap();
    let state = env
        .dm
        .set_disappear(&alice, &bob.agent_id, Some(900), 101.0)
        .unwrap();
    assert_eq!(state.state, "proposed");
    assert_eq!(state.proposed_value, Some(900));
    assert_eq!(state.proposed_by.as_deref(), Some(alice.agent_id.as_str()));

    // Zero disables from any state.
    let state = env
        .dm
        .set_disappear(&bob, &alice.agent_id, Some(0), 102.0)
        .unwrap();
    assert_eq!(state.state, "disabled");
}

#[tokio::test]
async fn active_timers_require_renegotiation() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let bob = register(&env, "Bob", "bob");
    env.dm
        .set_disappear(&alice, &bob.agent_id, Some(600), 100.0)
        .unwrap();
    env.dm
        .set_disappear(&bob, &alice.agent_id, Some(600), 101.0)
        .unwrap();
    // Changing an active timer starts a fresh proposal; sends stop
    // expiring until the peer agrees again.
    let state = env
        .dm
        .set_disappear(&alice, &bob.agent_id, Some(1200), 102.0)
        .unwrap();
    assert_eq!(state.state, "proposed");
    let message = env
        .dm
        .send(&alice, &bob.agent_id, "in limbo", None, None, 103.0)
        .unwrap();
    assert!(message.expires_at.is_none());
}

#[tokio::test]
async fn per_side_clear_hides_history_for_one_side_only() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let bob = register(&env, "Bob", "bob");
    for (index, content) in ["one", "two", "three"].iter().enumerate() {
        env.dm
            .send(&alice, &bob.agent_id, content, None, None, 100.0 + index as f64)
            .unwrap();
    }
    env.dm
        .clear_conversation(&alice, &bob.agent_id, 200.0)
        .unwrap();

    let alice_view = env
        .dm
        .list_thread(&alice, &bob.agent_id, Some(50), 201.0)
        .unwrap();
    assert!(alice_view.is_empty());

    let bob_view = env
        .dm
        .list_thread(&bob, &alice.agent_id, Some(50), 201.0)
        .unwrap();
    assert_eq!(bob_view.len(), 3);
}

#[tokio::test]
async fn expiry_sweep_deletes_and_notifies_both_sides() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let bob = register(&env, "Bob", "bob");
    let mut alice_rx = subscribe(&env, &alice);
    let mut bob_rx = subscribe(&env, &bob);

    // Agree on a two-second timer.
    env.dm
        .set_disappear(&alice, &bob.agent_id, Some(2), 100.0)
        .unwrap();
    env.dm
        .set_disappear(&bob, &alice.agent_id, Some(2), 101.0)
        .unwrap();
    let message = env
        .dm
        .send(&alice, &bob.agent_id, "vanishing", None, None, 110.0)
        .unwrap();
    assert_eq!(message.expires_at, Some(112.0));

    let sweeper = ExpirySweeper::new(env.storage.clone(), env.events.clone());
    let removed = sweeper.sweep(113.0).unwrap();
    assert_eq!(removed, 1);

    for rx in [&mut alice_rx, &mut bob_rx] {
        let kinds = drain_kinds(rx);
        assert!(kinds.contains(&EventKind::DmExpired), "kinds: {kinds:?}");
    }

    let thread = env
        .dm
        .list_thread(&bob, &alice.agent_id, Some(50), 114.0)
        .unwrap();
    assert!(thread.is_empty());

    // A second sweep finds nothing.
    assert_eq!(sweeper.sweep(115.0).unwrap(), 0);
}

#[tokio::test]
async fn blocking_is_asymmetric_and_idempotent() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let bob = register(&env, "Bob", "bob");

    env.dm.block(&bob, &alice.agent_id, 100.0).unwrap();
    let err = env.dm.block(&bob, &alice.agent_id, 101.0).unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    // The blocked sender is refused; the blocker may still send.
    let err = env
        .dm
        .send(&alice, &bob.agent_id, "hello?", None, None, 102.0)
        .unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));
    env.dm
        .send(&bob, &alice.agent_id, "one way street", None, None, 103.0)
        .unwrap();

    // Unblock restores the initial state.
    env.dm.unblock(&bob, &alice.agent_id).unwrap();
    env.dm
        .send(&alice, &bob.agent_id, "hello again", None, None, 104.0)
        .unwrap();
    let err = env.dm.unblock(&bob, &alice.agent_id).unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn self_dm_and_self_block_are_invalid() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let err = env
        .dm
        .send(&alice, &alice.agent_id, "me myself", None, None, 100.0)
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));
    let err = env.dm.block(&alice, &alice.agent_id, 100.0).unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));
}

#[tokio::test]
async fn listing_marks_received_messages_read() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let bob = register(&env, "Bob", "bob");
    env.dm
        .send(&alice, &bob.agent_id, "unread", None, None, 100.0)
        .unwrap();

    let before = env.dm.conversations(&bob, 101.0).unwrap();
    assert_eq!(before[0].unread_count, 1);

    env.dm
        .list_thread(&bob, &alice.agent_id, Some(50), 102.0)
        .unwrap();
    let after = env.dm.conversations(&bob, 103.0).unwrap();
    assert_eq!(after[0].unread_count, 0);
}

#[tokio::test]
async fn dm_reactions_are_participant_only_and_unique() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let bob = register(&env, "Bob", "bob");
    let eve = register(&env, "Eve", "eve");
    let message = env
        .dm
        .send(&alice, &bob.agent_id, "react to me", None, None, 100.0)
        .unwrap();

    let err = env.dm.react(&eve, &message.id, "like", 101.0).unwrap_err();
    assert!(matches!(err, ServiceError::Forbidden(_)));

    assert_eq!(env.dm.react(&bob, &message.id, "love", 102.0).unwrap(), "❤️");
    let err = env.dm.react(&bob, &message.id, "love", 103.0).unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    env.dm.unreact(&bob, &message.id, "love").unwrap();
    let err = env.dm.unreact(&bob, &message.id, "love").unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn encrypted_messages_carry_ciphertext_and_placeholder_content() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let bob = register(&env, "Bob", "bob");
    let mut bob_rx = subscribe(&env, &bob);

    let message = env
        .dm
        .send(
            &alice,
            &bob.agent_id,
            "",
            None,
            Some(clawlink_server::services::dm::EncryptedPayload {
                ciphertext: "deadbeef".to_string(),
                sender_key_id: Some("key-1".to_string()),
            }),
            100.0,
        )
        .unwrap();
    assert!(message.encrypted);
    assert_eq!(message.ciphertext.as_deref(), Some("deadbeef"));
    assert_eq!(message.content, "[encrypted]");

    let kinds = drain_kinds(&mut bob_rx);
    assert!(kinds.contains(&EventKind::DmEncrypted));
    assert!(!kinds.contains(&EventKind::DmNew));
}

#[tokio::test]
async fn replies_must_stay_in_the_conversation() {
    let env = test_env();
    let alice = register(&env, "Alice", "alice");
    let bob = register(&env, "Bob", "bob");
    let carol = register(&env, "Carol", "carol");
    let with_bob = env
        .dm
        .send(&alice, &bob.agent_id, "to bob", None, None, 100.0)
        .unwrap();

    let err = env
        .dm
        .send(
            &alice,
            &carol.agent_id,
            "wrong thread",
            Some(with_bob.id.clone()),
            None,
            101.0,
        )
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));

    let reply = env
        .dm
        .send(
            &bob,
            &alice.agent_id,
            "right thread",
            Some(with_bob.id.clone()),
            None,
            102.0,
        )
        .unwrap();
    assert_eq!(
        reply.reply_to.map(|preview| preview.message_id),
        Some(with_bob.id)
    );
}

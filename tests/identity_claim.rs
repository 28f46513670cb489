use async_trait::async_trait;
use clawlink_server::services::badges::BadgeService;
use clawlink_server::services::error::{ServiceError, ServiceResult};
use clawlink_server::services::identity::IdentityService;
use clawlink_server::services::verification::{ExternalVerification, VerificationOutcome};
use clawlink_server::storage::{SqliteStorage, StorageBackend};
use std::sync::Arc;

const BASE_URL: &str = "https://clawlink.test";

struct StubVerification {
    ok: bool,
    external_id: Option<String>,
}

#[async_trait]
impl ExternalVerification for StubVerification {
    async fn verify(&self, _handle: &str, _code: &str) -> ServiceResult<VerificationOutcome> {
        Ok(VerificationOutcome {
            ok: self.ok,
            external_id: self.external_id.clone(),
        })
    }
}

fn test_storage() -> Arc<dyn StorageBackend> {
    let db_path = std::env::temp_dir().join(format!(
        "clawlink_identity_it_{}.db",
        uuid::Uuid::new_v4().simple()
    ));
    let storage = Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()));
    storage.ensure_initialized().unwrap();
    storage
}

fn identity_with(verification: Arc<dyn ExternalVerification>) -> (IdentityService, Arc<BadgeService>) {
    let storage = test_storage();
    let badges = Arc::new(BadgeService::new(storage.clone()));
    badges.seed_system_badges().unwrap();
    (
        IdentityService::new(storage, verification, badges.clone(), BASE_URL.to_string()),
        badges,
    )
}

fn approving_identity() -> (IdentityService, Arc<BadgeService>) {
    identity_with(Arc::new(StubVerification {
        ok: true,
        external_id: Some("9001".to_string()),
    }))
}

#[tokio::test]
async fn register_claim_verify_round_trip() {
    let (identity, badges) = approving_identity();
    let registered = identity.register("Ava", "ava", None, 100.0).unwrap();
    assert!(registered.api_key.starts_with("clk_"));
    assert!(registered.claim_url.starts_with(BASE_URL));
    assert!(!registered.agent.claimed);

    let token = registered.agent.claim_token.clone().unwrap();
    let prompt = identity.get_claim(&token, 101.0).unwrap();
    assert_eq!(
        prompt.tweet_text,
        format!("Claiming my @clawlink bot #{}", prompt.verification_code)
    );

    let claimed = identity.verify_claim(&token, "@ava_owner", 102.0).await.unwrap();
    assert!(claimed.claimed);
    assert_eq!(claimed.claimed_by.as_deref(), Some("ava_owner"));
    assert_eq!(claimed.claimed_by_external_id.as_deref(), Some("9001"));
    assert!(claimed.claim_token.is_none());
    assert!(claimed.verification_code.is_none());

    let awarded = badges.badges_for_agent(&claimed.agent_id, 103.0).unwrap();
    assert!(awarded.iter().any(|badge| badge.slug == "verified"));

    // Re-verifying an already-completed claim is a conflict.
    let err = identity
        .verify_claim(&token, "@ava_owner", 104.0)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn authenticate_returns_the_registered_agent() {
    let (identity, _badges) = approving_identity();
    let registered = identity.register("Bot", "bot_1", None, 50.0).unwrap();
    let authenticated = identity
        .authenticate_by_key(&registered.api_key, 60.0)
        .unwrap();
    assert_eq!(authenticated.agent_id, registered.agent.agent_id);
    assert!(authenticated.is_online);
    assert_eq!(authenticated.last_seen, 60.0);
}

#[tokio::test]
async fn unknown_or_malformed_keys_are_rejected() {
    let (identity, _badges) = approving_identity();
    identity.register("Bot", "bot_1", None, 50.0).unwrap();
    let err = identity
        .authenticate_by_key("clk_00000000000000000000000000000000", 51.0)
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unauthenticated(_)));
    let err = identity.authenticate_by_key("not-a-key", 51.0).unwrap_err();
    assert!(matches!(err, ServiceError::Unauthenticated(_)));
}

#[tokio::test]
async fn duplicate_handles_conflict_and_handles_fold_case() {
    let (identity, _badges) = approving_identity();
    let first = identity.register("Ava", "AVA", None, 10.0).unwrap();
    assert_eq!(first.agent.handle, "ava");
    let err = identity.register("Other", "ava", None, 11.0).unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn invalid_handles_are_rejected() {
    let (identity, _badges) = approving_identity();
    for bad in ["", "has space", "dash-ed", "emoji🦀"] {
        let err = identity.register("X", bad, None, 10.0).unwrap_err();
        assert!(matches!(err, ServiceError::Invalid(_)), "handle: {bad}");
    }
}

#[tokio::test]
async fn failed_external_lookup_leaves_the_claim_open() {
    let (identity, _badges) = identity_with(Arc::new(StubVerification {
        ok: false,
        external_id: None,
    }));
    let registered = identity.register("Ava", "ava", None, 10.0).unwrap();
    let token = registered.agent.claim_token.clone().unwrap();
    let err = identity
        .verify_claim(&token, "ava_owner", 11.0)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    // The claim is still answerable afterwards.
    assert!(identity.get_claim(&token, 12.0).is_ok());
}

#[tokio::test]
async fn unknown_claim_tokens_are_not_found() {
    let (identity, _badges) = approving_identity();
    let err = identity.get_claim("does-not-exist", 10.0).unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn early_agents_receive_the_pioneer_badge() {
    let (identity, badges) = approving_identity();
    let registered = identity.register("First", "first", None, 10.0).unwrap();
    let held = badges
        .badges_for_agent(&registered.agent.agent_id, 11.0)
        .unwrap();
    assert!(held.iter().any(|badge| badge.slug == "pioneer"));
}

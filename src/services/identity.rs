// Identity lifecycle: registration, API-key auth, claim tokens and
// human-readable verification codes, claim completion and badge auto-award.
use crate::services::badges::{BadgeService, AWARDED_BY_SYSTEM};
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::verification::ExternalVerification;
use crate::storage::{AgentRecord, StorageBackend, StoreError};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const API_KEY_PREFIX: &str = "clk_";
pub const SERVICE_HANDLE: &str = "clawlink";
const CLAIM_TOKEN_LEN: usize = 16;
const MAX_HANDLE_LEN: usize = 32;
const PIONEER_BADGE_LIMIT: i64 = 100;
const CLAIM_SESSION_TTL_SECS: f64 = 600.0;

// Ambiguity-free code alphabet: A-Z and 2-9 minus I, O, 0, 1.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_SUFFIX_LEN: usize = 4;

const CODE_WORDS: [&str; 24] = [
    "reef", "coral", "wave", "tide", "dune", "cliff", "pearl", "shell", "kelp", "drift", "foam",
    "gull", "crab", "claw", "cove", "bay", "surf", "sand", "storm", "mist", "moon", "star", "fern",
    "pine",
];

/// Public profile shape; never carries the api key, claim token or
/// verification code.
#[derive(Debug, Clone, Serialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub handle: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub avatar_generated: bool,
    pub birthdate: Option<String>,
    pub owner_name: Option<String>,
    pub claimed: bool,
    pub claimed_by: Option<String>,
    pub is_online: bool,
    pub last_seen: f64,
    pub created_at: f64,
}

impl AgentProfile {
    pub fn from_record(record: &AgentRecord) -> Self {
        Self {
            id: record.agent_id.clone(),
            name: record.name.clone(),
            handle: record.handle.clone(),
            bio: record.bio.clone(),
            avatar_url: record.avatar_url.clone(),
            avatar_generated: record.avatar_generated,
            birthdate: record.birthdate.clone(),
            owner_name: record.owner_name.clone(),
            claimed: record.claimed,
            claimed_by: record.claimed_by.clone(),
            is_online: record.is_online,
            last_seen: record.last_seen,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredAgent {
    pub agent: AgentRecord,
    pub api_key: String,
    pub claim_url: String,
    pub verification_code: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimPrompt {
    pub agent: AgentProfile,
    pub verification_code: String,
    pub tweet_text: String,
}

struct ClaimSession {
    expires_at: f64,
}

pub struct IdentityService {
    storage: Arc<dyn StorageBackend>,
    verification: Arc<dyn ExternalVerification>,
    badges: Arc<BadgeService>,
    base_url: String,
    // Process-local record of recently completed claims; lets a stale claim
    // URL answer "already claimed" instead of "not found" for a while.
    claim_sessions: Mutex<HashMap<String, ClaimSession>>,
}

impl IdentityService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        verification: Arc<dyn ExternalVerification>,
        badges: Arc<BadgeService>,
        base_url: String,
    ) -> Self {
        Self {
            storage,
            verification,
            badges,
            base_url: base_url.trim_end_matches('/').to_string(),
            claim_sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Handles are lowercase `[a-z0-9_]{1,32}`; uppercase input is folded.
    pub fn normalize_handle(raw: &str) -> ServiceResult<String> {
        let handle = raw.trim().to_lowercase();
        if handle.is_empty() || handle.len() > MAX_HANDLE_LEN {
            return Err(ServiceError::Invalid(
                "handle must be 1-32 characters".to_string(),
            ));
        }
        if !handle
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
        {
            return Err(ServiceError::Invalid(
                "handle may only contain a-z, 0-9 and underscore".to_string(),
            ));
        }
        Ok(handle)
    }

    fn generate_api_key() -> String {
        format!("{API_KEY_PREFIX}{}", Uuid::new_v4().simple())
    }

    fn generate_claim_token() -> String {
        Uuid::new_v4().simple().to_string().chars().take(CLAIM_TOKEN_LEN).collect()
    }

    fn generate_verification_code() -> String {
        let mut rng = rand::thread_rng();
        let word = CODE_WORDS[rng.gen_range(0..CODE_WORDS.len())];
        let suffix: String = (0..CODE_SUFFIX_LEN)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        format!("{word}-{suffix}")
    }

    fn claim_url_for(&self, token: &str) -> String {
        format!("{}/claim/{token}", self.base_url)
    }

    pub fn tweet_text(code: &str) -> String {
        format!("Claiming my @{SERVICE_HANDLE} bot #{code}")
    }

    pub fn register(
        &self,
        name: &str,
        handle: &str,
        bio: Option<String>,
        now: f64,
    ) -> ServiceResult<RegisteredAgent> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::Invalid("name is required".to_string()));
        }
        let handle = Self::normalize_handle(handle)?;
        if self.storage.get_agent_by_handle(&handle)?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "handle {handle} is already registered"
            )));
        }
        let api_key = Self::generate_api_key();
        let claim_token = Self::generate_claim_token();
        let verification_code = Self::generate_verification_code();
        let record = AgentRecord {
            agent_id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            handle: handle.clone(),
            bio: bio.map(|value| value.trim().to_string()).filter(|value| !value.is_empty()),
            avatar_url: Some(format!(
                "https://api.dicebear.com/9.x/bottts/svg?seed={handle}"
            )),
            avatar_generated: true,
            birthdate: None,
            owner_name: None,
            api_key: api_key.clone(),
            claim_token: Some(claim_token.clone()),
            verification_code: Some(verification_code.clone()),
            claimed: false,
            claimed_by: None,
            claimed_by_external_id: None,
            is_online: false,
            last_seen: now,
            created_at: now,
            updated_at: now,
        };
        match self.storage.insert_agent(&record) {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(ServiceError::Conflict(format!(
                    "handle {handle} is already registered"
                )));
            }
            Err(err) => return Err(err.into()),
        }
        if self.storage.count_agents()? <= PIONEER_BADGE_LIMIT {
            let _ = self
                .badges
                .award(&record.agent_id, "pioneer", AWARDED_BY_SYSTEM, None, now);
        }
        Ok(RegisteredAgent {
            agent: record,
            api_key,
            claim_url: self.claim_url_for(&claim_token),
            verification_code,
        })
    }

    pub fn get_claim(&self, token: &str, now: f64) -> ServiceResult<ClaimPrompt> {
        let agent = self.lookup_claim(token, now)?;
        let code = agent
            .verification_code
            .clone()
            .ok_or_else(|| ServiceError::internal("claim is missing its verification code"))?;
        Ok(ClaimPrompt {
            agent: AgentProfile::from_record(&agent),
            tweet_text: Self::tweet_text(&code),
            verification_code: code,
        })
    }

    pub async fn verify_claim(
        &self,
        token: &str,
        external_handle: &str,
        now: f64,
    ) -> ServiceResult<AgentRecord> {
        let external_handle = external_handle.trim().trim_start_matches('@').to_string();
        if external_handle.is_empty() {
            return Err(ServiceError::Invalid(
                "external handle is required".to_string(),
            ));
        }
        let mut agent = self.lookup_claim(token, now)?;
        let code = agent
            .verification_code
            .clone()
            .ok_or_else(|| ServiceError::internal("claim is missing its verification code"))?;
        let outcome = self.verification.verify(&external_handle, &code).await?;
        if !outcome.ok {
            return Err(ServiceError::NotFound(
                "verification post not found for this handle".to_string(),
            ));
        }
        agent.claimed = true;
        agent.claimed_by = Some(external_handle);
        agent.claimed_by_external_id = outcome.external_id;
        agent.claim_token = None;
        agent.verification_code = None;
        agent.updated_at = now;
        self.storage.update_agent(&agent)?;
        // Idempotent: re-awarding an existing badge is a no-op.
        let _ = self
            .badges
            .award(&agent.agent_id, "verified", AWARDED_BY_SYSTEM, None, now);
        self.claim_sessions.lock().insert(
            token.trim().to_string(),
            ClaimSession {
                expires_at: now + CLAIM_SESSION_TTL_SECS,
            },
        );
        Ok(agent)
    }

    pub fn authenticate_by_key(&self, api_key: &str, now: f64) -> ServiceResult<AgentRecord> {
        let cleaned = api_key.trim();
        if !cleaned.starts_with(API_KEY_PREFIX) {
            return Err(ServiceError::Unauthenticated(
                "malformed api key".to_string(),
            ));
        }
        let mut agent = self
            .storage
            .get_agent_by_api_key(cleaned)?
            .ok_or_else(|| ServiceError::Unauthenticated("unknown api key".to_string()))?;
        self.storage
            .set_agent_presence(&agent.agent_id, true, now)?;
        agent.is_online = true;
        agent.last_seen = now;
        Ok(agent)
    }

    fn lookup_claim(&self, token: &str, now: f64) -> ServiceResult<AgentRecord> {
        let cleaned = token.trim();
        if cleaned.is_empty() {
            return Err(ServiceError::NotFound("claim not found".to_string()));
        }
        self.purge_claim_sessions(now);
        match self.storage.get_agent_by_claim_token(cleaned)? {
            Some(agent) if agent.claimed => {
                Err(ServiceError::Conflict("agent is already claimed".to_string()))
            }
            Some(agent) => Ok(agent),
            None => {
                if self.claim_sessions.lock().contains_key(cleaned) {
                    Err(ServiceError::Conflict(
                        "agent is already claimed".to_string(),
                    ))
                } else {
                    Err(ServiceError::NotFound("claim not found".to_string()))
                }
            }
        }
    }

    fn purge_claim_sessions(&self, now: f64) {
        self.claim_sessions
            .lock()
            .retain(|_, session| session.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::IdentityService;

    #[test]
    fn handles_are_lowercased_and_validated() {
        assert_eq!(
            IdentityService::normalize_handle("Ava_7").unwrap(),
            "ava_7"
        );
        assert!(IdentityService::normalize_handle("").is_err());
        assert!(IdentityService::normalize_handle("has space").is_err());
        assert!(IdentityService::normalize_handle("dash-ed").is_err());
        assert!(IdentityService::normalize_handle(&"x".repeat(33)).is_err());
    }

    #[test]
    fn verification_codes_use_the_restricted_alphabet() {
        for _ in 0..50 {
            let code = IdentityService::generate_verification_code();
            let (word, suffix) = code.split_once('-').expect("word-suffix format");
            assert!(super::CODE_WORDS.contains(&word));
            assert_eq!(suffix.len(), super::CODE_SUFFIX_LEN);
            for ch in suffix.chars() {
                assert!(super::CODE_ALPHABET.contains(&(ch as u8)));
                assert!(!"IO01".contains(ch));
            }
        }
    }

    #[test]
    fn api_keys_carry_the_clk_prefix() {
        let key = IdentityService::generate_api_key();
        assert!(key.starts_with("clk_"));
        assert_eq!(key.len(), 4 + 32);
    }

    #[test]
    fn tweet_text_embeds_the_code() {
        assert_eq!(
            IdentityService::tweet_text("reef-X4B2"),
            "Claiming my @clawlink bot #reef-X4B2"
        );
    }
}

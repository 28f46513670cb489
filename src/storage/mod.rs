// Storage module: durable persistence for agents, groups, messages, DMs,
// reactions, pins, blocks and badges behind a swappable backend trait.

mod sqlite;

use crate::config::StorageConfig;
use std::fmt;
use std::sync::Arc;

pub use sqlite::SqliteStorage;

#[derive(Debug)]
pub enum StoreError {
    /// Uniqueness violation (duplicate handle, membership, reaction, ...).
    Conflict(String),
    Other(anyhow::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(message) => write!(f, "conflict: {message}"),
            Self::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message)
                if matches!(failure.code, rusqlite::ErrorCode::ConstraintViolation) =>
            {
                Self::Conflict(message.clone().unwrap_or_else(|| err.to_string()))
            }
            _ => Self::Other(err.into()),
        }
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Other(err.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    pub handle: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub avatar_generated: bool,
    pub birthdate: Option<String>,
    pub owner_name: Option<String>,
    pub api_key: String,
    pub claim_token: Option<String>,
    pub verification_code: Option<String>,
    pub claimed: bool,
    pub claimed_by: Option<String>,
    pub claimed_by_external_id: Option<String>,
    pub is_online: bool,
    pub last_seen: f64,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct GroupRecord {
    pub group_id: String,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub is_public: bool,
    pub created_by: String,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct GroupMemberRecord {
    pub group_id: String,
    pub agent_id: String,
    pub role: String,
    pub joined_at: f64,
}

/// One row per group; minimum role per gated action.
#[derive(Debug, Clone)]
pub struct GroupPermissionsRecord {
    pub group_id: String,
    pub rename_group: String,
    pub edit_description: String,
    pub edit_avatar: String,
    pub delete_group: String,
    pub remove_members: String,
    pub set_roles: String,
    pub invite_members: String,
    pub pin_messages: String,
    pub delete_any_message: String,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: String,
    pub group_id: String,
    pub agent_id: String,
    pub content: String,
    pub reply_to_id: Option<String>,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct ReactionRecord {
    pub message_id: String,
    pub agent_id: String,
    pub emoji: String,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct PinnedMessageRecord {
    pub group_id: String,
    pub message_id: String,
    pub pinned_by: String,
    pub pinned_at: f64,
}

#[derive(Debug, Clone)]
pub struct DirectMessageRecord {
    pub message_id: String,
    pub from_agent_id: String,
    pub to_agent_id: String,
    pub content: String,
    pub reply_to_id: Option<String>,
    pub read: bool,
    pub encrypted: bool,
    pub ciphertext: Option<String>,
    pub sender_key_id: Option<String>,
    pub expires_at: Option<f64>,
    pub created_at: f64,
}

/// One row per unordered agent pair, canonicalized as `agent1_id < agent2_id`.
#[derive(Debug, Clone)]
pub struct DmConversationRecord {
    pub agent1_id: String,
    pub agent2_id: String,
    pub disappear_timer: Option<i64>,
    pub disappear_set_by: Option<String>,
    pub pending_approval: bool,
    pub proposed_value: Option<i64>,
    pub proposed_by: Option<String>,
    pub agent1_cleared_at: Option<f64>,
    pub agent2_cleared_at: Option<f64>,
    pub created_at: f64,
    pub updated_at: f64,
}

#[derive(Debug, Clone)]
pub struct AgentBlockRecord {
    pub blocker_id: String,
    pub blocked_id: String,
    pub created_at: f64,
}

#[derive(Debug, Clone)]
pub struct BadgeRecord {
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub icon: String,
    pub color: String,
    pub priority: i64,
}

#[derive(Debug, Clone)]
pub struct AgentBadgeRecord {
    pub agent_id: String,
    pub badge_slug: String,
    pub awarded_at: f64,
    pub awarded_by: String,
    pub expires_at: Option<f64>,
}

/// Storage backend abstraction. All mutating services write through this
/// trait; uniqueness violations surface as `StoreError::Conflict`.
pub trait StorageBackend: Send + Sync {
    fn ensure_initialized(&self) -> StoreResult<()>;

    // agents
    fn insert_agent(&self, record: &AgentRecord) -> StoreResult<()>;
    fn update_agent(&self, record: &AgentRecord) -> StoreResult<()>;
    fn get_agent(&self, agent_id: &str) -> StoreResult<Option<AgentRecord>>;
    fn get_agent_by_handle(&self, handle: &str) -> StoreResult<Option<AgentRecord>>;
    fn get_agent_by_api_key(&self, api_key: &str) -> StoreResult<Option<AgentRecord>>;
    fn get_agent_by_claim_token(&self, claim_token: &str) -> StoreResult<Option<AgentRecord>>;
    fn get_agents_by_ids(&self, agent_ids: &[String]) -> StoreResult<Vec<AgentRecord>>;
    fn list_agents(&self, online_only: bool) -> StoreResult<Vec<AgentRecord>>;
    fn count_agents(&self) -> StoreResult<i64>;
    fn set_agent_presence(&self, agent_id: &str, is_online: bool, last_seen: f64)
        -> StoreResult<()>;

    // groups and membership
    fn create_group_with_admin(
        &self,
        group: &GroupRecord,
        admin: &GroupMemberRecord,
    ) -> StoreResult<()>;
    fn update_group(&self, record: &GroupRecord) -> StoreResult<()>;
    fn delete_group(&self, group_id: &str) -> StoreResult<i64>;
    fn get_group(&self, group_id: &str) -> StoreResult<Option<GroupRecord>>;
    fn get_group_by_slug(&self, slug: &str) -> StoreResult<Option<GroupRecord>>;
    fn list_groups(&self, public_only: bool) -> StoreResult<Vec<GroupRecord>>;
    fn insert_group_member(&self, record: &GroupMemberRecord) -> StoreResult<()>;
    fn remove_group_member(&self, group_id: &str, agent_id: &str) -> StoreResult<i64>;
    fn set_group_member_role(&self, group_id: &str, agent_id: &str, role: &str)
        -> StoreResult<()>;
    fn get_group_member(
        &self,
        group_id: &str,
        agent_id: &str,
    ) -> StoreResult<Option<GroupMemberRecord>>;
    fn list_group_members(&self, group_id: &str) -> StoreResult<Vec<GroupMemberRecord>>;
    fn list_agent_memberships(&self, agent_id: &str) -> StoreResult<Vec<GroupMemberRecord>>;
    fn count_group_members_with_role(&self, group_id: &str, role: &str) -> StoreResult<i64>;
    fn count_members_for_groups(&self, group_ids: &[String]) -> StoreResult<Vec<(String, i64)>>;
    fn get_group_permissions(&self, group_id: &str)
        -> StoreResult<Option<GroupPermissionsRecord>>;
    fn put_group_permissions(&self, record: &GroupPermissionsRecord) -> StoreResult<()>;

    // group messages
    fn insert_message(&self, record: &MessageRecord) -> StoreResult<()>;
    fn get_message(&self, message_id: &str) -> StoreResult<Option<MessageRecord>>;
    fn get_messages_by_ids(&self, message_ids: &[String]) -> StoreResult<Vec<MessageRecord>>;
    fn delete_message(&self, message_id: &str) -> StoreResult<i64>;
    fn list_group_messages(
        &self,
        group_id: &str,
        before: Option<f64>,
        limit: i64,
    ) -> StoreResult<Vec<MessageRecord>>;
    fn insert_message_reaction(&self, record: &ReactionRecord) -> StoreResult<()>;
    fn delete_message_reaction(
        &self,
        message_id: &str,
        agent_id: &str,
        emoji: &str,
    ) -> StoreResult<i64>;
    fn list_reactions_for_messages(
        &self,
        message_ids: &[String],
    ) -> StoreResult<Vec<ReactionRecord>>;
    fn insert_pinned_message(&self, record: &PinnedMessageRecord) -> StoreResult<()>;
    fn delete_pinned_message(&self, group_id: &str, message_id: &str) -> StoreResult<i64>;
    fn list_pinned_messages(&self, group_id: &str) -> StoreResult<Vec<PinnedMessageRecord>>;

    // direct messages
    fn insert_direct_message(&self, record: &DirectMessageRecord) -> StoreResult<()>;
    fn get_direct_message(&self, message_id: &str) -> StoreResult<Option<DirectMessageRecord>>;
    fn get_direct_messages_by_ids(
        &self,
        message_ids: &[String],
    ) -> StoreResult<Vec<DirectMessageRecord>>;
    fn list_conversation_messages(
        &self,
        agent_a: &str,
        agent_b: &str,
        since: Option<f64>,
        now: f64,
        limit: i64,
    ) -> StoreResult<Vec<DirectMessageRecord>>;
    fn mark_conversation_read(&self, to_agent_id: &str, from_agent_id: &str) -> StoreResult<i64>;
    fn count_unread_messages(
        &self,
        to_agent_id: &str,
        from_agent_id: &str,
        since: Option<f64>,
        now: f64,
    ) -> StoreResult<i64>;
    fn list_expired_direct_messages(&self, now: f64) -> StoreResult<Vec<DirectMessageRecord>>;
    fn delete_direct_messages_by_ids(&self, message_ids: &[String]) -> StoreResult<i64>;
    fn insert_dm_reaction(&self, record: &ReactionRecord) -> StoreResult<()>;
    fn delete_dm_reaction(&self, message_id: &str, agent_id: &str, emoji: &str)
        -> StoreResult<i64>;
    fn list_dm_reactions_for_messages(
        &self,
        message_ids: &[String],
    ) -> StoreResult<Vec<ReactionRecord>>;

    // conversations, blocks
    fn get_dm_conversation(
        &self,
        agent1_id: &str,
        agent2_id: &str,
    ) -> StoreResult<Option<DmConversationRecord>>;
    fn upsert_dm_conversation(&self, record: &DmConversationRecord) -> StoreResult<()>;
    fn list_agent_conversations(&self, agent_id: &str) -> StoreResult<Vec<DmConversationRecord>>;
    fn insert_agent_block(&self, record: &AgentBlockRecord) -> StoreResult<()>;
    fn delete_agent_block(&self, blocker_id: &str, blocked_id: &str) -> StoreResult<i64>;
    fn get_agent_block(
        &self,
        blocker_id: &str,
        blocked_id: &str,
    ) -> StoreResult<Option<AgentBlockRecord>>;
    fn list_agent_blocks(&self, blocker_id: &str) -> StoreResult<Vec<AgentBlockRecord>>;

    // badges
    fn seed_badges(&self, records: &[BadgeRecord]) -> StoreResult<()>;
    fn list_badges(&self) -> StoreResult<Vec<BadgeRecord>>;
    fn get_badge(&self, slug: &str) -> StoreResult<Option<BadgeRecord>>;
    fn insert_agent_badge(&self, record: &AgentBadgeRecord) -> StoreResult<()>;
    fn delete_agent_badge(&self, agent_id: &str, badge_slug: &str) -> StoreResult<i64>;
    fn list_agent_badges(
        &self,
        agent_id: &str,
        now: f64,
    ) -> StoreResult<Vec<(AgentBadgeRecord, BadgeRecord)>>;
    fn list_badges_for_agents(
        &self,
        agent_ids: &[String],
        now: f64,
    ) -> StoreResult<Vec<(AgentBadgeRecord, BadgeRecord)>>;
}

/// Build the storage backend from the configured database URL. A plain path
/// or `sqlite:` URL selects SQLite; other schemes are rejected here so the
/// failure is visible at startup instead of on first query.
pub fn build_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let url = config.database_url.trim();
    if let Some(rest) = url.strip_prefix("sqlite://") {
        return Ok(Arc::new(SqliteStorage::new(rest.to_string())));
    }
    if let Some(rest) = url.strip_prefix("sqlite:") {
        return Ok(Arc::new(SqliteStorage::new(rest.to_string())));
    }
    if url.contains("://") {
        anyhow::bail!("unsupported database url scheme: {url}");
    }
    Ok(Arc::new(SqliteStorage::new(url.to_string())))
}

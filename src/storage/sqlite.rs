// SQLite storage backend: single-file database, WAL mode, FK cascades.
use crate::storage::{
    AgentBadgeRecord, AgentBlockRecord, AgentRecord, BadgeRecord, DirectMessageRecord,
    DmConversationRecord, GroupMemberRecord, GroupPermissionsRecord, GroupRecord, MessageRecord,
    PinnedMessageRecord, ReactionRecord, StorageBackend, StoreError, StoreResult,
};
use anyhow::anyhow;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct SqliteStorage {
    db_path: PathBuf,
    initialized: AtomicBool,
    init_guard: Mutex<()>,
}

impl SqliteStorage {
    pub fn new(db_path: String) -> Self {
        let path = if db_path.trim().is_empty() {
            PathBuf::from("./data/clawlink.db")
        } else {
            PathBuf::from(db_path)
        };
        Self {
            db_path: path,
            initialized: AtomicBool::new(false),
            init_guard: Mutex::new(()),
        }
    }

    fn ensure_db_dir(&self) -> StoreResult<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn open(&self) -> StoreResult<Connection> {
        self.ensure_db_dir()?;
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Ok(conn)
    }

    fn map_agent(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
        Ok(AgentRecord {
            agent_id: row.get(0)?,
            name: row.get(1)?,
            handle: row.get(2)?,
            bio: row.get(3)?,
            avatar_url: row.get(4)?,
            avatar_generated: row.get::<_, i64>(5)? != 0,
            birthdate: row.get(6)?,
            owner_name: row.get(7)?,
            api_key: row.get(8)?,
            claim_token: row.get(9)?,
            verification_code: row.get(10)?,
            claimed: row.get::<_, i64>(11)? != 0,
            claimed_by: row.get(12)?,
            claimed_by_external_id: row.get(13)?,
            is_online: row.get::<_, i64>(14)? != 0,
            last_seen: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn map_group(row: &Row<'_>) -> rusqlite::Result<GroupRecord> {
        Ok(GroupRecord {
            group_id: row.get(0)?,
            name: row.get(1)?,
            slug: row.get(2)?,
            description: row.get(3)?,
            avatar_url: row.get(4)?,
            is_public: row.get::<_, i64>(5)? != 0,
            created_by: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn map_group_member(row: &Row<'_>) -> rusqlite::Result<GroupMemberRecord> {
        Ok(GroupMemberRecord {
            group_id: row.get(0)?,
            agent_id: row.get(1)?,
            role: row.get(2)?,
            joined_at: row.get(3)?,
        })
    }

    fn map_group_permissions(row: &Row<'_>) -> rusqlite::Result<GroupPermissionsRecord> {
        Ok(GroupPermissionsRecord {
            group_id: row.get(0)?,
            rename_group: row.get(1)?,
            edit_description: row.get(2)?,
            edit_avatar: row.get(3)?,
            delete_group: row.get(4)?,
            remove_members: row.get(5)?,
            set_roles: row.get(6)?,
            invite_members: row.get(7)?,
            pin_messages: row.get(8)?,
            delete_any_message: row.get(9)?,
        })
    }

    fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
        Ok(MessageRecord {
            message_id: row.get(0)?,
            group_id: row.get(1)?,
            agent_id: row.get(2)?,
            content: row.get(3)?,
            reply_to_id: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn map_reaction(row: &Row<'_>) -> rusqlite::Result<ReactionRecord> {
        Ok(ReactionRecord {
            message_id: row.get(0)?,
            agent_id: row.get(1)?,
            emoji: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn map_direct_message(row: &Row<'_>) -> rusqlite::Result<DirectMessageRecord> {
        Ok(DirectMessageRecord {
            message_id: row.get(0)?,
            from_agent_id: row.get(1)?,
            to_agent_id: row.get(2)?,
            content: row.get(3)?,
            reply_to_id: row.get(4)?,
            read: row.get::<_, i64>(5)? != 0,
            encrypted: row.get::<_, i64>(6)? != 0,
            ciphertext: row.get(7)?,
            sender_key_id: row.get(8)?,
            expires_at: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn map_conversation(row: &Row<'_>) -> rusqlite::Result<DmConversationRecord> {
        Ok(DmConversationRecord {
            agent1_id: row.get(0)?,
            agent2_id: row.get(1)?,
            disappear_timer: row.get(2)?,
            disappear_set_by: row.get(3)?,
            pending_approval: row.get::<_, i64>(4)? != 0,
            proposed_value: row.get(5)?,
            proposed_by: row.get(6)?,
            agent1_cleared_at: row.get(7)?,
            agent2_cleared_at: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn map_badge(row: &Row<'_>) -> rusqlite::Result<BadgeRecord> {
        Ok(BadgeRecord {
            slug: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            icon: row.get(3)?,
            color: row.get(4)?,
            priority: row.get(5)?,
        })
    }

    fn map_agent_badge_join(row: &Row<'_>) -> rusqlite::Result<(AgentBadgeRecord, BadgeRecord)> {
        Ok((
            AgentBadgeRecord {
                agent_id: row.get(0)?,
                badge_slug: row.get(1)?,
                awarded_at: row.get(2)?,
                awarded_by: row.get(3)?,
                expires_at: row.get(4)?,
            },
            BadgeRecord {
                slug: row.get(5)?,
                name: row.get(6)?,
                description: row.get(7)?,
                icon: row.get(8)?,
                color: row.get(9)?,
                priority: row.get(10)?,
            },
        ))
    }

    fn placeholders(count: usize) -> String {
        let mut output = String::with_capacity(count.saturating_mul(2));
        for index in 0..count {
            if index > 0 {
                output.push(',');
            }
            output.push('?');
        }
        output
    }
}

const AGENT_COLUMNS: &str = "agent_id, name, handle, bio, avatar_url, avatar_generated, \
     birthdate, owner_name, api_key, claim_token, verification_code, claimed, claimed_by, \
     claimed_by_external_id, is_online, last_seen, created_at, updated_at";

const GROUP_COLUMNS: &str =
    "group_id, name, slug, description, avatar_url, is_public, created_by, created_at";

const MESSAGE_COLUMNS: &str =
    "message_id, group_id, agent_id, content, reply_to_id, created_at, updated_at";

const DM_COLUMNS: &str = "message_id, from_agent_id, to_agent_id, content, reply_to_id, \
     is_read, encrypted, ciphertext, sender_key_id, expires_at, created_at";

const CONVERSATION_COLUMNS: &str = "agent1_id, agent2_id, disappear_timer, disappear_set_by, \
     pending_approval, proposed_value, proposed_by, agent1_cleared_at, agent2_cleared_at, \
     created_at, updated_at";

const PERMISSION_COLUMNS: &str = "group_id, rename_group, edit_description, edit_avatar, \
     delete_group, remove_members, set_roles, invite_members, pin_messages, delete_any_message";

impl StorageBackend for SqliteStorage {
    fn ensure_initialized(&self) -> StoreResult<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.init_guard.lock();
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
              agent_id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              handle TEXT NOT NULL UNIQUE,
              bio TEXT,
              avatar_url TEXT,
              avatar_generated INTEGER NOT NULL DEFAULT 0,
              birthdate TEXT,
              owner_name TEXT,
              api_key TEXT NOT NULL UNIQUE,
              claim_token TEXT UNIQUE,
              verification_code TEXT,
              claimed INTEGER NOT NULL DEFAULT 0,
              claimed_by TEXT,
              claimed_by_external_id TEXT,
              is_online INTEGER NOT NULL DEFAULT 0,
              last_seen REAL NOT NULL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agents_online
              ON agents (is_online);
            CREATE TABLE IF NOT EXISTS chat_groups (
              group_id TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              slug TEXT NOT NULL UNIQUE,
              description TEXT,
              avatar_url TEXT,
              is_public INTEGER NOT NULL DEFAULT 1,
              created_by TEXT NOT NULL,
              created_at REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS group_members (
              group_id TEXT NOT NULL REFERENCES chat_groups (group_id) ON DELETE CASCADE,
              agent_id TEXT NOT NULL,
              role TEXT NOT NULL,
              joined_at REAL NOT NULL,
              PRIMARY KEY (group_id, agent_id)
            );
            CREATE INDEX IF NOT EXISTS idx_group_members_agent
              ON group_members (agent_id);
            CREATE TABLE IF NOT EXISTS group_permissions (
              group_id TEXT PRIMARY KEY REFERENCES chat_groups (group_id) ON DELETE CASCADE,
              rename_group TEXT NOT NULL,
              edit_description TEXT NOT NULL,
              edit_avatar TEXT NOT NULL,
              delete_group TEXT NOT NULL,
              remove_members TEXT NOT NULL,
              set_roles TEXT NOT NULL,
              invite_members TEXT NOT NULL,
              pin_messages TEXT NOT NULL,
              delete_any_message TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS messages (
              message_id TEXT PRIMARY KEY,
              group_id TEXT NOT NULL REFERENCES chat_groups (group_id) ON DELETE CASCADE,
              agent_id TEXT NOT NULL,
              content TEXT NOT NULL,
              reply_to_id TEXT,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_group_created
              ON messages (group_id, created_at);
            CREATE TABLE IF NOT EXISTS message_reactions (
              message_id TEXT NOT NULL REFERENCES messages (message_id) ON DELETE CASCADE,
              agent_id TEXT NOT NULL,
              emoji TEXT NOT NULL,
              created_at REAL NOT NULL,
              PRIMARY KEY (message_id, agent_id, emoji)
            );
            CREATE TABLE IF NOT EXISTS pinned_messages (
              group_id TEXT NOT NULL REFERENCES chat_groups (group_id) ON DELETE CASCADE,
              message_id TEXT NOT NULL REFERENCES messages (message_id) ON DELETE CASCADE,
              pinned_by TEXT NOT NULL,
              pinned_at REAL NOT NULL,
              PRIMARY KEY (group_id, message_id)
            );
            CREATE TABLE IF NOT EXISTS direct_messages (
              message_id TEXT PRIMARY KEY,
              from_agent_id TEXT NOT NULL,
              to_agent_id TEXT NOT NULL,
              content TEXT NOT NULL,
              reply_to_id TEXT,
              is_read INTEGER NOT NULL DEFAULT 0,
              encrypted INTEGER NOT NULL DEFAULT 0,
              ciphertext TEXT,
              sender_key_id TEXT,
              expires_at REAL,
              created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_dm_pair_created
              ON direct_messages (from_agent_id, to_agent_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_dm_expires
              ON direct_messages (expires_at);
            CREATE TABLE IF NOT EXISTS dm_reactions (
              message_id TEXT NOT NULL REFERENCES direct_messages (message_id) ON DELETE CASCADE,
              agent_id TEXT NOT NULL,
              emoji TEXT NOT NULL,
              created_at REAL NOT NULL,
              PRIMARY KEY (message_id, agent_id, emoji)
            );
            CREATE TABLE IF NOT EXISTS dm_conversations (
              agent1_id TEXT NOT NULL,
              agent2_id TEXT NOT NULL,
              disappear_timer INTEGER,
              disappear_set_by TEXT,
              pending_approval INTEGER NOT NULL DEFAULT 0,
              proposed_value INTEGER,
              proposed_by TEXT,
              agent1_cleared_at REAL,
              agent2_cleared_at REAL,
              created_at REAL NOT NULL,
              updated_at REAL NOT NULL,
              PRIMARY KEY (agent1_id, agent2_id),
              CHECK (agent1_id < agent2_id)
            );
            CREATE INDEX IF NOT EXISTS idx_dm_conversations_agent2
              ON dm_conversations (agent2_id);
            CREATE TABLE IF NOT EXISTS agent_blocks (
              blocker_id TEXT NOT NULL,
              blocked_id TEXT NOT NULL,
              created_at REAL NOT NULL,
              PRIMARY KEY (blocker_id, blocked_id)
            );
            CREATE TABLE IF NOT EXISTS badges (
              slug TEXT PRIMARY KEY,
              name TEXT NOT NULL,
              description TEXT,
              icon TEXT NOT NULL,
              color TEXT NOT NULL,
              priority INTEGER NOT NULL DEFAULT 100
            );
            CREATE TABLE IF NOT EXISTS agent_badges (
              agent_id TEXT NOT NULL,
              badge_slug TEXT NOT NULL REFERENCES badges (slug) ON DELETE CASCADE,
              awarded_at REAL NOT NULL,
              awarded_by TEXT NOT NULL,
              expires_at REAL,
              PRIMARY KEY (agent_id, badge_slug)
            );
            "#,
        )?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn insert_agent(&self, record: &AgentRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO agents (agent_id, name, handle, bio, avatar_url, avatar_generated, \
             birthdate, owner_name, api_key, claim_token, verification_code, claimed, claimed_by, \
             claimed_by_external_id, is_online, last_seen, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.agent_id,
                record.name,
                record.handle,
                record.bio,
                record.avatar_url,
                record.avatar_generated as i64,
                record.birthdate,
                record.owner_name,
                record.api_key,
                record.claim_token,
                record.verification_code,
                record.claimed as i64,
                record.claimed_by,
                record.claimed_by_external_id,
                record.is_online as i64,
                record.last_seen,
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn update_agent(&self, record: &AgentRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE agents SET name = ?, bio = ?, avatar_url = ?, avatar_generated = ?, \
             birthdate = ?, owner_name = ?, claim_token = ?, verification_code = ?, claimed = ?, \
             claimed_by = ?, claimed_by_external_id = ?, is_online = ?, last_seen = ?, \
             updated_at = ? WHERE agent_id = ?",
            params![
                record.name,
                record.bio,
                record.avatar_url,
                record.avatar_generated as i64,
                record.birthdate,
                record.owner_name,
                record.claim_token,
                record.verification_code,
                record.claimed as i64,
                record.claimed_by,
                record.claimed_by_external_id,
                record.is_online as i64,
                record.last_seen,
                record.updated_at,
                record.agent_id
            ],
        )?;
        Ok(())
    }

    fn get_agent(&self, agent_id: &str) -> StoreResult<Option<AgentRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?"),
                params![agent_id.trim()],
                Self::map_agent,
            )
            .optional()?;
        Ok(row)
    }

    fn get_agent_by_handle(&self, handle: &str) -> StoreResult<Option<AgentRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE handle = ?"),
                params![handle.trim()],
                Self::map_agent,
            )
            .optional()?;
        Ok(row)
    }

    fn get_agent_by_api_key(&self, api_key: &str) -> StoreResult<Option<AgentRecord>> {
        self.ensure_initialized()?;
        let cleaned = api_key.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE api_key = ?"),
                params![cleaned],
                Self::map_agent,
            )
            .optional()?;
        Ok(row)
    }

    fn get_agent_by_claim_token(&self, claim_token: &str) -> StoreResult<Option<AgentRecord>> {
        self.ensure_initialized()?;
        let cleaned = claim_token.trim();
        if cleaned.is_empty() {
            return Ok(None);
        }
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE claim_token = ?"),
                params![cleaned],
                Self::map_agent,
            )
            .optional()?;
        Ok(row)
    }

    fn get_agents_by_ids(&self, agent_ids: &[String]) -> StoreResult<Vec<AgentRecord>> {
        self.ensure_initialized()?;
        if agent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let query = format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id IN ({})",
            Self::placeholders(agent_ids.len())
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(
            params_from_iter(agent_ids.iter().map(|id| SqlValue::from(id.clone()))),
            Self::map_agent,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_agents(&self, online_only: bool) -> StoreResult<Vec<AgentRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let query = if online_only {
            format!("SELECT {AGENT_COLUMNS} FROM agents WHERE is_online = 1 ORDER BY handle")
        } else {
            format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY handle")
        };
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map([], Self::map_agent)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn count_agents(&self) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let count = conn.query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))?;
        Ok(count)
    }

    fn set_agent_presence(
        &self,
        agent_id: &str,
        is_online: bool,
        last_seen: f64,
    ) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE agents SET is_online = ?, last_seen = ?, updated_at = ? WHERE agent_id = ?",
            params![is_online as i64, last_seen, last_seen, agent_id.trim()],
        )?;
        Ok(())
    }

    fn create_group_with_admin(
        &self,
        group: &GroupRecord,
        admin: &GroupMemberRecord,
    ) -> StoreResult<()> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO chat_groups (group_id, name, slug, description, avatar_url, is_public, \
             created_by, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                group.group_id,
                group.name,
                group.slug,
                group.description,
                group.avatar_url,
                group.is_public as i64,
                group.created_by,
                group.created_at
            ],
        )?;
        tx.execute(
            "INSERT INTO group_members (group_id, agent_id, role, joined_at) VALUES (?, ?, ?, ?)",
            params![admin.group_id, admin.agent_id, admin.role, admin.joined_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn update_group(&self, record: &GroupRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE chat_groups SET name = ?, slug = ?, description = ?, avatar_url = ?, \
             is_public = ? WHERE group_id = ?",
            params![
                record.name,
                record.slug,
                record.description,
                record.avatar_url,
                record.is_public as i64,
                record.group_id
            ],
        )?;
        Ok(())
    }

    fn delete_group(&self, group_id: &str) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM chat_groups WHERE group_id = ?",
            params![group_id.trim()],
        )?;
        Ok(affected as i64)
    }

    fn get_group(&self, group_id: &str) -> StoreResult<Option<GroupRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM chat_groups WHERE group_id = ?"),
                params![group_id.trim()],
                Self::map_group,
            )
            .optional()?;
        Ok(row)
    }

    fn get_group_by_slug(&self, slug: &str) -> StoreResult<Option<GroupRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM chat_groups WHERE slug = ?"),
                params![slug.trim()],
                Self::map_group,
            )
            .optional()?;
        Ok(row)
    }

    fn list_groups(&self, public_only: bool) -> StoreResult<Vec<GroupRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let query = if public_only {
            format!("SELECT {GROUP_COLUMNS} FROM chat_groups WHERE is_public = 1 ORDER BY created_at")
        } else {
            format!("SELECT {GROUP_COLUMNS} FROM chat_groups ORDER BY created_at")
        };
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map([], Self::map_group)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_group_member(&self, record: &GroupMemberRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO group_members (group_id, agent_id, role, joined_at) VALUES (?, ?, ?, ?)",
            params![record.group_id, record.agent_id, record.role, record.joined_at],
        )?;
        Ok(())
    }

    fn remove_group_member(&self, group_id: &str, agent_id: &str) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM group_members WHERE group_id = ? AND agent_id = ?",
            params![group_id.trim(), agent_id.trim()],
        )?;
        Ok(affected as i64)
    }

    fn set_group_member_role(
        &self,
        group_id: &str,
        agent_id: &str,
        role: &str,
    ) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "UPDATE group_members SET role = ? WHERE group_id = ? AND agent_id = ?",
            params![role, group_id.trim(), agent_id.trim()],
        )?;
        Ok(())
    }

    fn get_group_member(
        &self,
        group_id: &str,
        agent_id: &str,
    ) -> StoreResult<Option<GroupMemberRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT group_id, agent_id, role, joined_at FROM group_members \
                 WHERE group_id = ? AND agent_id = ?",
                params![group_id.trim(), agent_id.trim()],
                Self::map_group_member,
            )
            .optional()?;
        Ok(row)
    }

    fn list_group_members(&self, group_id: &str) -> StoreResult<Vec<GroupMemberRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT group_id, agent_id, role, joined_at FROM group_members \
             WHERE group_id = ? ORDER BY joined_at",
        )?;
        let rows = stmt.query_map(params![group_id.trim()], Self::map_group_member)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_agent_memberships(&self, agent_id: &str) -> StoreResult<Vec<GroupMemberRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT group_id, agent_id, role, joined_at FROM group_members \
             WHERE agent_id = ? ORDER BY joined_at",
        )?;
        let rows = stmt.query_map(params![agent_id.trim()], Self::map_group_member)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn count_group_members_with_role(&self, group_id: &str, role: &str) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ? AND role = ?",
            params![group_id.trim(), role],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn count_members_for_groups(&self, group_ids: &[String]) -> StoreResult<Vec<(String, i64)>> {
        self.ensure_initialized()?;
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let query = format!(
            "SELECT group_id, COUNT(*) FROM group_members WHERE group_id IN ({}) \
             GROUP BY group_id",
            Self::placeholders(group_ids.len())
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(
            params_from_iter(group_ids.iter().map(|id| SqlValue::from(id.clone()))),
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_group_permissions(
        &self,
        group_id: &str,
    ) -> StoreResult<Option<GroupPermissionsRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {PERMISSION_COLUMNS} FROM group_permissions WHERE group_id = ?"),
                params![group_id.trim()],
                Self::map_group_permissions,
            )
            .optional()?;
        Ok(row)
    }

    fn put_group_permissions(&self, record: &GroupPermissionsRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO group_permissions (group_id, rename_group, edit_description, \
             edit_avatar, delete_group, remove_members, set_roles, invite_members, pin_messages, \
             delete_any_message) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(group_id) DO UPDATE SET rename_group = excluded.rename_group, \
             edit_description = excluded.edit_description, edit_avatar = excluded.edit_avatar, \
             delete_group = excluded.delete_group, remove_members = excluded.remove_members, \
             set_roles = excluded.set_roles, invite_members = excluded.invite_members, \
             pin_messages = excluded.pin_messages, delete_any_message = excluded.delete_any_message",
            params![
                record.group_id,
                record.rename_group,
                record.edit_description,
                record.edit_avatar,
                record.delete_group,
                record.remove_members,
                record.set_roles,
                record.invite_members,
                record.pin_messages,
                record.delete_any_message
            ],
        )?;
        Ok(())
    }

    fn insert_message(&self, record: &MessageRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO messages (message_id, group_id, agent_id, content, reply_to_id, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                record.message_id,
                record.group_id,
                record.agent_id,
                record.content,
                record.reply_to_id,
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn get_message(&self, message_id: &str) -> StoreResult<Option<MessageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?"),
                params![message_id.trim()],
                Self::map_message,
            )
            .optional()?;
        Ok(row)
    }

    fn get_messages_by_ids(&self, message_ids: &[String]) -> StoreResult<Vec<MessageRecord>> {
        self.ensure_initialized()?;
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id IN ({})",
            Self::placeholders(message_ids.len())
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(
            params_from_iter(message_ids.iter().map(|id| SqlValue::from(id.clone()))),
            Self::map_message,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn delete_message(&self, message_id: &str) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM messages WHERE message_id = ?",
            params![message_id.trim()],
        )?;
        Ok(affected as i64)
    }

    fn list_group_messages(
        &self,
        group_id: &str,
        before: Option<f64>,
        limit: i64,
    ) -> StoreResult<Vec<MessageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE group_id = ?1 \
             AND (?2 IS NULL OR created_at < ?2) \
             ORDER BY created_at DESC, message_id DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![group_id.trim(), before, limit], Self::map_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_message_reaction(&self, record: &ReactionRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO message_reactions (message_id, agent_id, emoji, created_at) \
             VALUES (?, ?, ?, ?)",
            params![
                record.message_id,
                record.agent_id,
                record.emoji,
                record.created_at
            ],
        )?;
        Ok(())
    }

    fn delete_message_reaction(
        &self,
        message_id: &str,
        agent_id: &str,
        emoji: &str,
    ) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM message_reactions WHERE message_id = ? AND agent_id = ? AND emoji = ?",
            params![message_id.trim(), agent_id.trim(), emoji],
        )?;
        Ok(affected as i64)
    }

    fn list_reactions_for_messages(
        &self,
        message_ids: &[String],
    ) -> StoreResult<Vec<ReactionRecord>> {
        self.ensure_initialized()?;
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let query = format!(
            "SELECT message_id, agent_id, emoji, created_at FROM message_reactions \
             WHERE message_id IN ({}) ORDER BY created_at",
            Self::placeholders(message_ids.len())
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(
            params_from_iter(message_ids.iter().map(|id| SqlValue::from(id.clone()))),
            Self::map_reaction,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_pinned_message(&self, record: &PinnedMessageRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO pinned_messages (group_id, message_id, pinned_by, pinned_at) \
             VALUES (?, ?, ?, ?)",
            params![
                record.group_id,
                record.message_id,
                record.pinned_by,
                record.pinned_at
            ],
        )?;
        Ok(())
    }

    fn delete_pinned_message(&self, group_id: &str, message_id: &str) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM pinned_messages WHERE group_id = ? AND message_id = ?",
            params![group_id.trim(), message_id.trim()],
        )?;
        Ok(affected as i64)
    }

    fn list_pinned_messages(&self, group_id: &str) -> StoreResult<Vec<PinnedMessageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT group_id, message_id, pinned_by, pinned_at FROM pinned_messages \
             WHERE group_id = ? ORDER BY pinned_at",
        )?;
        let rows = stmt.query_map(params![group_id.trim()], |row| {
            Ok(PinnedMessageRecord {
                group_id: row.get(0)?,
                message_id: row.get(1)?,
                pinned_by: row.get(2)?,
                pinned_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_direct_message(&self, record: &DirectMessageRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO direct_messages (message_id, from_agent_id, to_agent_id, content, \
             reply_to_id, is_read, encrypted, ciphertext, sender_key_id, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.message_id,
                record.from_agent_id,
                record.to_agent_id,
                record.content,
                record.reply_to_id,
                record.read as i64,
                record.encrypted as i64,
                record.ciphertext,
                record.sender_key_id,
                record.expires_at,
                record.created_at
            ],
        )?;
        Ok(())
    }

    fn get_direct_message(&self, message_id: &str) -> StoreResult<Option<DirectMessageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!("SELECT {DM_COLUMNS} FROM direct_messages WHERE message_id = ?"),
                params![message_id.trim()],
                Self::map_direct_message,
            )
            .optional()?;
        Ok(row)
    }

    fn get_direct_messages_by_ids(
        &self,
        message_ids: &[String],
    ) -> StoreResult<Vec<DirectMessageRecord>> {
        self.ensure_initialized()?;
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let query = format!(
            "SELECT {DM_COLUMNS} FROM direct_messages WHERE message_id IN ({})",
            Self::placeholders(message_ids.len())
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(
            params_from_iter(message_ids.iter().map(|id| SqlValue::from(id.clone()))),
            Self::map_direct_message,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_conversation_messages(
        &self,
        agent_a: &str,
        agent_b: &str,
        since: Option<f64>,
        now: f64,
        limit: i64,
    ) -> StoreResult<Vec<DirectMessageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DM_COLUMNS} FROM direct_messages \
             WHERE ((from_agent_id = ?1 AND to_agent_id = ?2) \
                OR (from_agent_id = ?2 AND to_agent_id = ?1)) \
             AND (?3 IS NULL OR created_at > ?3) \
             AND (expires_at IS NULL OR expires_at > ?4) \
             ORDER BY created_at DESC, message_id DESC LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![agent_a.trim(), agent_b.trim(), since, now, limit],
            Self::map_direct_message,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn mark_conversation_read(&self, to_agent_id: &str, from_agent_id: &str) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE direct_messages SET is_read = 1 \
             WHERE to_agent_id = ? AND from_agent_id = ? AND is_read = 0",
            params![to_agent_id.trim(), from_agent_id.trim()],
        )?;
        Ok(affected as i64)
    }

    fn count_unread_messages(
        &self,
        to_agent_id: &str,
        from_agent_id: &str,
        since: Option<f64>,
        now: f64,
    ) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM direct_messages \
             WHERE to_agent_id = ?1 AND from_agent_id = ?2 AND is_read = 0 \
             AND (?3 IS NULL OR created_at > ?3) \
             AND (expires_at IS NULL OR expires_at > ?4)",
            params![to_agent_id.trim(), from_agent_id.trim(), since, now],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn list_expired_direct_messages(&self, now: f64) -> StoreResult<Vec<DirectMessageRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DM_COLUMNS} FROM direct_messages \
             WHERE expires_at IS NOT NULL AND expires_at < ? ORDER BY expires_at"
        ))?;
        let rows = stmt.query_map(params![now], Self::map_direct_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn delete_direct_messages_by_ids(&self, message_ids: &[String]) -> StoreResult<i64> {
        self.ensure_initialized()?;
        if message_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.open()?;
        let query = format!(
            "DELETE FROM direct_messages WHERE message_id IN ({})",
            Self::placeholders(message_ids.len())
        );
        let affected = conn.execute(
            &query,
            params_from_iter(message_ids.iter().map(|id| SqlValue::from(id.clone()))),
        )?;
        Ok(affected as i64)
    }

    fn insert_dm_reaction(&self, record: &ReactionRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO dm_reactions (message_id, agent_id, emoji, created_at) \
             VALUES (?, ?, ?, ?)",
            params![
                record.message_id,
                record.agent_id,
                record.emoji,
                record.created_at
            ],
        )?;
        Ok(())
    }

    fn delete_dm_reaction(
        &self,
        message_id: &str,
        agent_id: &str,
        emoji: &str,
    ) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM dm_reactions WHERE message_id = ? AND agent_id = ? AND emoji = ?",
            params![message_id.trim(), agent_id.trim(), emoji],
        )?;
        Ok(affected as i64)
    }

    fn list_dm_reactions_for_messages(
        &self,
        message_ids: &[String],
    ) -> StoreResult<Vec<ReactionRecord>> {
        self.ensure_initialized()?;
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let query = format!(
            "SELECT message_id, agent_id, emoji, created_at FROM dm_reactions \
             WHERE message_id IN ({}) ORDER BY created_at",
            Self::placeholders(message_ids.len())
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(
            params_from_iter(message_ids.iter().map(|id| SqlValue::from(id.clone()))),
            Self::map_reaction,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_dm_conversation(
        &self,
        agent1_id: &str,
        agent2_id: &str,
    ) -> StoreResult<Option<DmConversationRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM dm_conversations \
                     WHERE agent1_id = ? AND agent2_id = ?"
                ),
                params![agent1_id.trim(), agent2_id.trim()],
                Self::map_conversation,
            )
            .optional()?;
        Ok(row)
    }

    fn upsert_dm_conversation(&self, record: &DmConversationRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        if record.agent1_id >= record.agent2_id {
            return Err(StoreError::Other(anyhow!(
                "conversation pair is not canonical: {} >= {}",
                record.agent1_id,
                record.agent2_id
            )));
        }
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO dm_conversations (agent1_id, agent2_id, disappear_timer, \
             disappear_set_by, pending_approval, proposed_value, proposed_by, agent1_cleared_at, \
             agent2_cleared_at, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(agent1_id, agent2_id) DO UPDATE SET \
             disappear_timer = excluded.disappear_timer, \
             disappear_set_by = excluded.disappear_set_by, \
             pending_approval = excluded.pending_approval, \
             proposed_value = excluded.proposed_value, proposed_by = excluded.proposed_by, \
             agent1_cleared_at = excluded.agent1_cleared_at, \
             agent2_cleared_at = excluded.agent2_cleared_at, updated_at = excluded.updated_at",
            params![
                record.agent1_id,
                record.agent2_id,
                record.disappear_timer,
                record.disappear_set_by,
                record.pending_approval as i64,
                record.proposed_value,
                record.proposed_by,
                record.agent1_cleared_at,
                record.agent2_cleared_at,
                record.created_at,
                record.updated_at
            ],
        )?;
        Ok(())
    }

    fn list_agent_conversations(&self, agent_id: &str) -> StoreResult<Vec<DmConversationRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM dm_conversations \
             WHERE agent1_id = ?1 OR agent2_id = ?1 ORDER BY updated_at DESC"
        ))?;
        let rows = stmt.query_map(params![agent_id.trim()], Self::map_conversation)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_agent_block(&self, record: &AgentBlockRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO agent_blocks (blocker_id, blocked_id, created_at) VALUES (?, ?, ?)",
            params![record.blocker_id, record.blocked_id, record.created_at],
        )?;
        Ok(())
    }

    fn delete_agent_block(&self, blocker_id: &str, blocked_id: &str) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM agent_blocks WHERE blocker_id = ? AND blocked_id = ?",
            params![blocker_id.trim(), blocked_id.trim()],
        )?;
        Ok(affected as i64)
    }

    fn get_agent_block(
        &self,
        blocker_id: &str,
        blocked_id: &str,
    ) -> StoreResult<Option<AgentBlockRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT blocker_id, blocked_id, created_at FROM agent_blocks \
                 WHERE blocker_id = ? AND blocked_id = ?",
                params![blocker_id.trim(), blocked_id.trim()],
                |row| {
                    Ok(AgentBlockRecord {
                        blocker_id: row.get(0)?,
                        blocked_id: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn list_agent_blocks(&self, blocker_id: &str) -> StoreResult<Vec<AgentBlockRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT blocker_id, blocked_id, created_at FROM agent_blocks \
             WHERE blocker_id = ? ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![blocker_id.trim()], |row| {
            Ok(AgentBlockRecord {
                blocker_id: row.get(0)?,
                blocked_id: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn seed_badges(&self, records: &[BadgeRecord]) -> StoreResult<()> {
        self.ensure_initialized()?;
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for record in records {
            tx.execute(
                "INSERT OR IGNORE INTO badges (slug, name, description, icon, color, priority) \
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    record.slug,
                    record.name,
                    record.description,
                    record.icon,
                    record.color,
                    record.priority
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_badges(&self) -> StoreResult<Vec<BadgeRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT slug, name, description, icon, color, priority FROM badges \
             ORDER BY priority, slug",
        )?;
        let rows = stmt.query_map([], Self::map_badge)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn get_badge(&self, slug: &str) -> StoreResult<Option<BadgeRecord>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT slug, name, description, icon, color, priority FROM badges WHERE slug = ?",
                params![slug.trim()],
                Self::map_badge,
            )
            .optional()?;
        Ok(row)
    }

    fn insert_agent_badge(&self, record: &AgentBadgeRecord) -> StoreResult<()> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO agent_badges (agent_id, badge_slug, awarded_at, awarded_by, expires_at) \
             VALUES (?, ?, ?, ?, ?)",
            params![
                record.agent_id,
                record.badge_slug,
                record.awarded_at,
                record.awarded_by,
                record.expires_at
            ],
        )?;
        Ok(())
    }

    fn delete_agent_badge(&self, agent_id: &str, badge_slug: &str) -> StoreResult<i64> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM agent_badges WHERE agent_id = ? AND badge_slug = ?",
            params![agent_id.trim(), badge_slug.trim()],
        )?;
        Ok(affected as i64)
    }

    fn list_agent_badges(
        &self,
        agent_id: &str,
        now: f64,
    ) -> StoreResult<Vec<(AgentBadgeRecord, BadgeRecord)>> {
        self.ensure_initialized()?;
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT ab.agent_id, ab.badge_slug, ab.awarded_at, ab.awarded_by, ab.expires_at, \
             b.slug, b.name, b.description, b.icon, b.color, b.priority \
             FROM agent_badges ab JOIN badges b ON b.slug = ab.badge_slug \
             WHERE ab.agent_id = ?1 AND (ab.expires_at IS NULL OR ab.expires_at > ?2) \
             ORDER BY b.priority, b.slug",
        )?;
        let rows = stmt.query_map(params![agent_id.trim(), now], Self::map_agent_badge_join)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_badges_for_agents(
        &self,
        agent_ids: &[String],
        now: f64,
    ) -> StoreResult<Vec<(AgentBadgeRecord, BadgeRecord)>> {
        self.ensure_initialized()?;
        if agent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let query = format!(
            "SELECT ab.agent_id, ab.badge_slug, ab.awarded_at, ab.awarded_by, ab.expires_at, \
             b.slug, b.name, b.description, b.icon, b.color, b.priority \
             FROM agent_badges ab JOIN badges b ON b.slug = ab.badge_slug \
             WHERE ab.agent_id IN ({}) AND (ab.expires_at IS NULL OR ab.expires_at > ?) \
             ORDER BY b.priority, b.slug",
            Self::placeholders(agent_ids.len())
        );
        let mut stmt = conn.prepare(&query)?;
        let values = agent_ids
            .iter()
            .map(|id| SqlValue::from(id.clone()))
            .chain(std::iter::once(SqlValue::from(now)));
        let rows = stmt.query_map(params_from_iter(values), Self::map_agent_badge_join)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

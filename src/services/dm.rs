// Direct messaging: canonical pair conversations, per-side clears, blocks,
// reactions, and the two-party disappearing-timer negotiation.
use crate::services::badges::BadgeService;
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::events::{agent_room, EventBus, EventKind, RealtimeEvent};
use crate::services::messaging::{
    clamp_limit, group_reactions, reaction_emoji, truncate_preview, MAX_CONTENT_LEN,
};
use crate::storage::{
    AgentBlockRecord, AgentRecord, DirectMessageRecord, DmConversationRecord, ReactionRecord,
    StorageBackend, StoreError,
};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const ENCRYPTED_CONTENT_PLACEHOLDER: &str = "[encrypted]";
const MAX_DISAPPEAR_TIMER_SECS: i64 = 365 * 24 * 3600;

/// Canonical conversation identity: lexicographically smaller id first.
pub fn canonical_pair(a: &str, b: &str) -> (String, String) {
    let a = a.trim().to_string();
    let b = b.trim().to_string();
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub sender_key_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DmReplyPreview {
    pub message_id: String,
    pub from_agent_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DmMessageView {
    pub id: String,
    pub from_agent_id: String,
    pub from_badges: Vec<crate::services::badges::BadgeView>,
    pub to_agent_id: String,
    pub content: String,
    pub reply_to: Option<DmReplyPreview>,
    pub reactions: Vec<crate::services::messaging::ReactionGroupView>,
    pub read: bool,
    pub encrypted: bool,
    pub ciphertext: Option<String>,
    pub sender_key_id: Option<String>,
    pub expires_at: Option<f64>,
    pub created_at: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisappearView {
    pub state: String,
    pub timer: Option<i64>,
    pub set_by: Option<String>,
    pub proposed_value: Option<i64>,
    pub proposed_by: Option<String>,
}

impl DisappearView {
    fn from_record(record: &DmConversationRecord) -> Self {
        if record.pending_approval {
            Self {
                state: "proposed".to_string(),
                timer: None,
                set_by: None,
                proposed_value: record.proposed_value,
                proposed_by: record.proposed_by.clone(),
            }
        } else if record.disappear_timer.is_some() {
            Self {
                state: "active".to_string(),
                timer: record.disappear_timer,
                set_by: record.disappear_set_by.clone(),
                proposed_value: None,
                proposed_by: None,
            }
        } else {
            Self {
                state: "disabled".to_string(),
                timer: None,
                set_by: None,
                proposed_value: None,
                proposed_by: None,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationPeerView {
    pub agent_id: String,
    pub name: String,
    pub handle: String,
    pub avatar_url: Option<String>,
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummaryView {
    pub peer: ConversationPeerView,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<f64>,
    pub unread_count: i64,
    pub disappearing: DisappearView,
}

pub struct DmService {
    storage: Arc<dyn StorageBackend>,
    events: Arc<EventBus>,
    badges: Arc<BadgeService>,
}

impl DmService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        events: Arc<EventBus>,
        badges: Arc<BadgeService>,
    ) -> Self {
        Self {
            storage,
            events,
            badges,
        }
    }

    fn require_agent(&self, agent_id: &str) -> ServiceResult<AgentRecord> {
        self.storage
            .get_agent(agent_id)?
            .ok_or_else(|| ServiceError::NotFound("agent not found".to_string()))
    }

    /// Idempotent conversation lookup/creation for an unordered pair.
    pub fn get_or_create_conversation(
        &self,
        a: &str,
        b: &str,
        now: f64,
    ) -> ServiceResult<DmConversationRecord> {
        let (agent1, agent2) = canonical_pair(a, b);
        if let Some(existing) = self.storage.get_dm_conversation(&agent1, &agent2)? {
            return Ok(existing);
        }
        let record = DmConversationRecord {
            agent1_id: agent1.clone(),
            agent2_id: agent2.clone(),
            disappear_timer: None,
            disappear_set_by: None,
            pending_approval: false,
            proposed_value: None,
            proposed_by: None,
            agent1_cleared_at: None,
            agent2_cleared_at: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.upsert_dm_conversation(&record)?;
        Ok(record)
    }

    fn cleared_at_for(record: &DmConversationRecord, agent_id: &str) -> Option<f64> {
        if record.agent1_id == agent_id {
            record.agent1_cleared_at
        } else {
            record.agent2_cleared_at
        }
    }

    pub fn send(
        &self,
        actor: &AgentRecord,
        to_agent_id: &str,
        content: &str,
        reply_to_id: Option<String>,
        encrypted: Option<EncryptedPayload>,
        now: f64,
    ) -> ServiceResult<DmMessageView> {
        let to_agent_id = to_agent_id.trim();
        if to_agent_id == actor.agent_id {
            return Err(ServiceError::Invalid(
                "cannot send a direct message to yourself".to_string(),
            ));
        }
        self.require_agent(to_agent_id)?;
        // Blocker protection: the recipient's block stops the sender.
        if self
            .storage
            .get_agent_block(to_agent_id, &actor.agent_id)?
            .is_some()
        {
            return Err(ServiceError::Forbidden(
                "this agent is not accepting your messages".to_string(),
            ));
        }
        let content = if encrypted.is_some() {
            ENCRYPTED_CONTENT_PLACEHOLDER.to_string()
        } else {
            let cleaned = content.trim();
            if cleaned.is_empty() {
                return Err(ServiceError::Invalid("message content is empty".to_string()));
            }
            if cleaned.chars().count() > MAX_CONTENT_LEN {
                return Err(ServiceError::Invalid(format!(
                    "message content is too long (max {MAX_CONTENT_LEN} characters)"
                )));
            }
            cleaned.to_string()
        };
        let conversation =
            self.get_or_create_conversation(&actor.agent_id, to_agent_id, now)?;
        let reply_to_id = reply_to_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if let Some(reply_id) = reply_to_id.as_deref() {
            let target = self.storage.get_direct_message(reply_id)?;
            let in_conversation = target.is_some_and(|message| {
                canonical_pair(&message.from_agent_id, &message.to_agent_id)
                    == (conversation.agent1_id.clone(), conversation.agent2_id.clone())
            });
            if !in_conversation {
                return Err(ServiceError::Invalid(
                    "reply target is not in this conversation".to_string(),
                ));
            }
        }
        // Messages expire only while the timer is active (agreed by both).
        let expires_at = match (conversation.disappear_timer, conversation.pending_approval) {
            (Some(timer), false) => Some(now + timer as f64),
            _ => None,
        };
        let record = DirectMessageRecord {
            message_id: Uuid::new_v4().simple().to_string(),
            from_agent_id: actor.agent_id.clone(),
            to_agent_id: to_agent_id.to_string(),
            content,
            reply_to_id,
            read: false,
            encrypted: encrypted.is_some(),
            ciphertext: encrypted.as_ref().map(|payload| payload.ciphertext.clone()),
            sender_key_id: encrypted.and_then(|payload| payload.sender_key_id),
            expires_at,
            created_at: now,
        };
        self.storage.insert_direct_message(&record)?;
        let mut touched = conversation;
        touched.updated_at = now;
        self.storage.upsert_dm_conversation(&touched)?;
        let view = self
            .enrich(std::slice::from_ref(&record), now)?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::internal("enrichment dropped a fresh message"))?;
        let kind = if record.encrypted {
            EventKind::DmEncrypted
        } else {
            EventKind::DmNew
        };
        self.events.publish(
            &agent_room(to_agent_id),
            RealtimeEvent::new(kind, json!({ "message": view })),
        );
        Ok(view)
    }

    /// Thread between actor and other, oldest first, honoring the actor's
    /// clear timestamp and message expiry. Received messages are marked
    /// read after the listing is taken.
    pub fn list_thread(
        &self,
        actor: &AgentRecord,
        other_agent_id: &str,
        limit: Option<i64>,
        now: f64,
    ) -> ServiceResult<Vec<DmMessageView>> {
        let other_agent_id = other_agent_id.trim();
        self.require_agent(other_agent_id)?;
        let (agent1, agent2) = canonical_pair(&actor.agent_id, other_agent_id);
        let conversation = self.storage.get_dm_conversation(&agent1, &agent2)?;
        let since = conversation
            .as_ref()
            .and_then(|record| Self::cleared_at_for(record, &actor.agent_id));
        let mut records = self.storage.list_conversation_messages(
            &actor.agent_id,
            other_agent_id,
            since,
            now,
            clamp_limit(limit),
        )?;
        records.reverse();
        let views = self.enrich(&records, now)?;
        self.storage
            .mark_conversation_read(&actor.agent_id, other_agent_id)?;
        Ok(views)
    }

    pub fn conversations(&self, actor: &AgentRecord, now: f64) -> ServiceResult<Vec<ConversationSummaryView>> {
        let conversations = self.storage.list_agent_conversations(&actor.agent_id)?;
        let peer_ids: Vec<String> = conversations
            .iter()
            .map(|record| {
                if record.agent1_id == actor.agent_id {
                    record.agent2_id.clone()
                } else {
                    record.agent1_id.clone()
                }
            })
            .collect();
        let peers = self.storage.get_agents_by_ids(&peer_ids)?;
        let peers_by_id: HashMap<&str, &AgentRecord> = peers
            .iter()
            .map(|agent| (agent.agent_id.as_str(), agent))
            .collect();
        let mut output = Vec::with_capacity(conversations.len());
        for (record, peer_id) in conversations.iter().zip(peer_ids.iter()) {
            let Some(peer) = peers_by_id.get(peer_id.as_str()) else {
                continue;
            };
            let since = Self::cleared_at_for(record, &actor.agent_id);
            let last = self
                .storage
                .list_conversation_messages(&actor.agent_id, peer_id, since, now, 1)?
                .into_iter()
                .next();
            let unread =
                self.storage
                    .count_unread_messages(&actor.agent_id, peer_id, since, now)?;
            output.push(ConversationSummaryView {
                peer: ConversationPeerView {
                    agent_id: peer.agent_id.clone(),
                    name: peer.name.clone(),
                    handle: peer.handle.clone(),
                    avatar_url: peer.avatar_url.clone(),
                    is_online: peer.is_online,
                },
                last_message_preview: last.as_ref().map(|message| {
                    if message.encrypted {
                        ENCRYPTED_CONTENT_PLACEHOLDER.to_string()
                    } else {
                        truncate_preview(&message.content)
                    }
                }),
                last_message_at: last.map(|message| message.created_at),
                unread_count: unread,
                disappearing: DisappearView::from_record(record),
            });
        }
        Ok(output)
    }

    fn require_participant(
        &self,
        actor: &AgentRecord,
        message: &DirectMessageRecord,
    ) -> ServiceResult<()> {
        if message.from_agent_id != actor.agent_id && message.to_agent_id != actor.agent_id {
            return Err(ServiceError::Forbidden(
                "not a participant in this conversation".to_string(),
            ));
        }
        Ok(())
    }

    pub fn react(
        &self,
        actor: &AgentRecord,
        message_id: &str,
        reaction: &str,
        now: f64,
    ) -> ServiceResult<String> {
        let emoji = reaction_emoji(reaction)
            .ok_or_else(|| ServiceError::Invalid(format!("unknown reaction: {reaction}")))?;
        let message = self
            .storage
            .get_direct_message(message_id)?
            .ok_or_else(|| ServiceError::NotFound("message not found".to_string()))?;
        self.require_participant(actor, &message)?;
        let record = ReactionRecord {
            message_id: message.message_id.clone(),
            agent_id: actor.agent_id.clone(),
            emoji: emoji.to_string(),
            created_at: now,
        };
        match self.storage.insert_dm_reaction(&record) {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(ServiceError::Conflict("already reacted".to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        let payload = json!({
            "message_id": message.message_id,
            "agent_id": actor.agent_id,
            "emoji": emoji,
        });
        for participant in [&message.from_agent_id, &message.to_agent_id] {
            self.events.publish(
                &agent_room(participant),
                RealtimeEvent::new(EventKind::DmReactionAdded, payload.clone()),
            );
        }
        Ok(emoji.to_string())
    }

    pub fn unreact(
        &self,
        actor: &AgentRecord,
        message_id: &str,
        reaction: &str,
    ) -> ServiceResult<()> {
        let emoji = reaction_emoji(reaction)
            .ok_or_else(|| ServiceError::Invalid(format!("unknown reaction: {reaction}")))?;
        let message = self
            .storage
            .get_direct_message(message_id)?
            .ok_or_else(|| ServiceError::NotFound("message not found".to_string()))?;
        self.require_participant(actor, &message)?;
        // Delete first, then emit.
        let removed = self
            .storage
            .delete_dm_reaction(message_id, &actor.agent_id, emoji)?;
        if removed == 0 {
            return Err(ServiceError::NotFound("reaction not found".to_string()));
        }
        let payload = json!({
            "message_id": message.message_id,
            "agent_id": actor.agent_id,
            "emoji": emoji,
        });
        for participant in [&message.from_agent_id, &message.to_agent_id] {
            self.events.publish(
                &agent_room(participant),
                RealtimeEvent::new(EventKind::DmReactionRemoved, payload.clone()),
            );
        }
        Ok(())
    }

    /// Hides the history on the caller's side only.
    pub fn clear_conversation(
        &self,
        actor: &AgentRecord,
        other_agent_id: &str,
        now: f64,
    ) -> ServiceResult<()> {
        let other_agent_id = other_agent_id.trim();
        self.require_agent(other_agent_id)?;
        let mut conversation =
            self.get_or_create_conversation(&actor.agent_id, other_agent_id, now)?;
        if conversation.agent1_id == actor.agent_id {
            conversation.agent1_cleared_at = Some(now);
        } else {
            conversation.agent2_cleared_at = Some(now);
        }
        conversation.updated_at = now;
        self.storage.upsert_dm_conversation(&conversation)?;
        self.events.publish(
            &agent_room(other_agent_id),
            RealtimeEvent::new(
                EventKind::DmCleared,
                json!({ "agent_id": actor.agent_id }),
            ),
        );
        Ok(())
    }

    pub fn block(&self, actor: &AgentRecord, target_agent_id: &str, now: f64) -> ServiceResult<()> {
        let target_agent_id = target_agent_id.trim();
        if target_agent_id == actor.agent_id {
            return Err(ServiceError::Invalid("cannot block yourself".to_string()));
        }
        self.require_agent(target_agent_id)?;
        let record = AgentBlockRecord {
            blocker_id: actor.agent_id.clone(),
            blocked_id: target_agent_id.to_string(),
            created_at: now,
        };
        match self.storage.insert_agent_block(&record) {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(ServiceError::Conflict("already blocked".to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        self.events.publish(
            &agent_room(target_agent_id),
            RealtimeEvent::new(
                EventKind::DmBlocked,
                json!({ "agent_id": actor.agent_id }),
            ),
        );
        Ok(())
    }

    pub fn unblock(&self, actor: &AgentRecord, target_agent_id: &str) -> ServiceResult<()> {
        let removed = self
            .storage
            .delete_agent_block(&actor.agent_id, target_agent_id)?;
        if removed == 0 {
            return Err(ServiceError::NotFound("block not found".to_string()));
        }
        Ok(())
    }

    pub fn blocked_agents(&self, actor: &AgentRecord) -> ServiceResult<Vec<ConversationPeerView>> {
        let blocks = self.storage.list_agent_blocks(&actor.agent_id)?;
        let ids: Vec<String> = blocks.iter().map(|b| b.blocked_id.clone()).collect();
        let agents = self.storage.get_agents_by_ids(&ids)?;
        Ok(agents
            .iter()
            .map(|agent| ConversationPeerView {
                agent_id: agent.agent_id.clone(),
                name: agent.name.clone(),
                handle: agent.handle.clone(),
                avatar_url: agent.avatar_url.clone(),
                is_online: agent.is_online,
            })
            .collect())
    }

    pub fn disappear_settings(
        &self,
        actor: &AgentRecord,
        other_agent_id: &str,
        now: f64,
    ) -> ServiceResult<DisappearView> {
        self.require_agent(other_agent_id.trim())?;
        let conversation =
            self.get_or_create_conversation(&actor.agent_id, other_agent_id, now)?;
        Ok(DisappearView::from_record(&conversation))
    }

    /// Disappearing-timer state machine. `timer` of zero or None disables;
    /// a positive value proposes, seconds the peer's matching proposal, or
    /// supersedes a mismatched one.
    pub fn set_disappear(
        &self,
        actor: &AgentRecord,
        other_agent_id: &str,
        timer: Option<i64>,
        now: f64,
    ) -> ServiceResult<DisappearView> {
        let other_agent_id = other_agent_id.trim();
        self.require_agent(other_agent_id)?;
        let mut conversation =
            self.get_or_create_conversation(&actor.agent_id, other_agent_id, now)?;
        let timer = match timer {
            None | Some(0) => None,
            Some(value) if value < 0 => {
                return Err(ServiceError::Invalid(
                    "timer must be a non-negative number of seconds".to_string(),
                ));
            }
            Some(value) if value > MAX_DISAPPEAR_TIMER_SECS => {
                return Err(ServiceError::Invalid(
                    "timer may not exceed one year".to_string(),
                ));
            }
            Some(value) => Some(value),
        };
        match timer {
            None => {
                conversation.disappear_timer = None;
                conversation.disappear_set_by = None;
                conversation.pending_approval = false;
                conversation.proposed_value = None;
                conversation.proposed_by = None;
                conversation.updated_at = now;
                self.storage.upsert_dm_conversation(&conversation)?;
                self.events.publish(
                    &agent_room(other_agent_id),
                    RealtimeEvent::new(
                        EventKind::DmDisappearDisabled,
                        json!({ "agent_id": actor.agent_id }),
                    ),
                );
            }
            Some(value) => {
                let seconded = conversation.pending_approval
                    && conversation.proposed_by.as_deref() != Some(actor.agent_id.as_str())
                    && conversation.proposed_value == Some(value);
                if seconded {
                    conversation.disappear_timer = Some(value);
                    conversation.disappear_set_by = conversation.proposed_by.take();
                    conversation.pending_approval = false;
                    conversation.proposed_value = None;
                    conversation.updated_at = now;
                    self.storage.upsert_dm_conversation(&conversation)?;
                    let payload = json!({
                        "timer": value,
                        "set_by": conversation.disappear_set_by,
                    });
                    for participant in [actor.agent_id.as_str(), other_agent_id] {
                        self.events.publish(
                            &agent_room(participant),
                            RealtimeEvent::new(EventKind::DmDisappearEnabled, payload.clone()),
                        );
                    }
                } else {
                    // New proposal, an overwrite of one's own, or a
                    // superseding counter-proposal all land here.
                    conversation.disappear_timer = None;
                    conversation.disappear_set_by = None;
                    conversation.pending_approval = true;
                    conversation.proposed_value = Some(value);
                    conversation.proposed_by = Some(actor.agent_id.clone());
                    conversation.updated_at = now;
                    self.storage.upsert_dm_conversation(&conversation)?;
                    self.events.publish(
                        &agent_room(other_agent_id),
                        RealtimeEvent::new(
                            EventKind::DmDisappearProposed,
                            json!({ "timer": value, "proposed_by": actor.agent_id }),
                        ),
                    );
                }
            }
        }
        Ok(DisappearView::from_record(&conversation))
    }

    /// Batch enrichment mirroring the group path: one reactions query, one
    /// reply-preview query, one badge pass over distinct senders.
    fn enrich(
        &self,
        records: &[DirectMessageRecord],
        now: f64,
    ) -> ServiceResult<Vec<DmMessageView>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let message_ids: Vec<String> = records.iter().map(|m| m.message_id.clone()).collect();
        let reactions = self.storage.list_dm_reactions_for_messages(&message_ids)?;
        let reply_ids: Vec<String> = records
            .iter()
            .filter_map(|m| m.reply_to_id.clone())
            .collect();
        let reply_targets: HashMap<String, DirectMessageRecord> = self
            .storage
            .get_direct_messages_by_ids(&reply_ids)?
            .into_iter()
            .map(|record| (record.message_id.clone(), record))
            .collect();
        let mut sender_ids: Vec<String> = records.iter().map(|m| m.from_agent_id.clone()).collect();
        sender_ids.sort();
        sender_ids.dedup();
        let badges = self.badges.badges_for_agents(&sender_ids, now)?;
        let mut reactions_by_message: HashMap<&str, Vec<&ReactionRecord>> = HashMap::new();
        for reaction in &reactions {
            reactions_by_message
                .entry(reaction.message_id.as_str())
                .or_default()
                .push(reaction);
        }
        Ok(records
            .iter()
            .map(|record| DmMessageView {
                id: record.message_id.clone(),
                from_agent_id: record.from_agent_id.clone(),
                from_badges: badges
                    .get(&record.from_agent_id)
                    .cloned()
                    .unwrap_or_default(),
                to_agent_id: record.to_agent_id.clone(),
                content: record.content.clone(),
                reply_to: record.reply_to_id.as_deref().and_then(|reply_id| {
                    reply_targets.get(reply_id).map(|target| DmReplyPreview {
                        message_id: target.message_id.clone(),
                        from_agent_id: target.from_agent_id.clone(),
                        content: if target.encrypted {
                            ENCRYPTED_CONTENT_PLACEHOLDER.to_string()
                        } else {
                            truncate_preview(&target.content)
                        },
                    })
                }),
                reactions: group_reactions(
                    reactions_by_message
                        .get(record.message_id.as_str())
                        .map(Vec::as_slice)
                        .unwrap_or(&[]),
                ),
                read: record.read,
                encrypted: record.encrypted,
                ciphertext: record.ciphertext.clone(),
                sender_key_id: record.sender_key_id.clone(),
                expires_at: record.expires_at,
                created_at: record.created_at,
            })
            .collect())
    }

}

#[cfg(test)]
mod tests {
    use super::canonical_pair;

    #[test]
    fn pairs_canonicalize_regardless_of_order() {
        assert_eq!(
            canonical_pair("bbb", "aaa"),
            ("aaa".to_string(), "bbb".to_string())
        );
        assert_eq!(
            canonical_pair("aaa", "bbb"),
            ("aaa".to_string(), "bbb".to_string())
        );
    }
}

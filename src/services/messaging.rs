// Group messaging: send, delete, react, enriched listing. Listings run a
// fixed number of batch queries regardless of page size.
use crate::services::badges::{BadgeService, BadgeView};
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::events::{group_room, EventBus, EventKind, RealtimeEvent};
use crate::services::groups::GroupService;
use crate::services::permissions::GroupAction;
use crate::storage::{
    AgentRecord, MessageRecord, ReactionRecord, StorageBackend, StoreError,
};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const MAX_CONTENT_LEN: usize = 10_000;
pub const MAX_LIST_LIMIT: i64 = 100;
pub const DEFAULT_LIST_LIMIT: i64 = 50;
const REPLY_PREVIEW_LEN: usize = 100;

/// Closed reaction set. Input accepts the name or the emoji; output always
/// carries the emoji.
pub fn reaction_emoji(input: &str) -> Option<&'static str> {
    match input.trim() {
        "like" | "👍" => Some("👍"),
        "love" | "❤️" => Some("❤️"),
        "angry" | "😠" => Some("😠"),
        "sad" | "😢" => Some("😢"),
        _ => None,
    }
}

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    match limit {
        Some(value) if value > 0 => value.min(MAX_LIST_LIMIT),
        _ => DEFAULT_LIST_LIMIT,
    }
}

pub fn truncate_preview(content: &str) -> String {
    if content.chars().count() <= REPLY_PREVIEW_LEN {
        content.to_string()
    } else {
        content.chars().take(REPLY_PREVIEW_LEN).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorView {
    pub agent_id: String,
    pub name: String,
    pub handle: String,
    pub avatar_url: Option<String>,
    pub badges: Vec<BadgeView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyPreview {
    pub message_id: String,
    pub agent_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReactionGroupView {
    pub emoji: String,
    pub count: i64,
    pub agent_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichedMessageView {
    pub id: String,
    pub group_id: String,
    pub author: AuthorView,
    pub content: String,
    pub reply_to: Option<ReplyPreview>,
    pub reactions: Vec<ReactionGroupView>,
    pub created_at: f64,
}

pub struct MessagingService {
    storage: Arc<dyn StorageBackend>,
    events: Arc<EventBus>,
    badges: Arc<BadgeService>,
    groups: Arc<GroupService>,
}

impl MessagingService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        events: Arc<EventBus>,
        badges: Arc<BadgeService>,
        groups: Arc<GroupService>,
    ) -> Self {
        Self {
            storage,
            events,
            badges,
            groups,
        }
    }

    fn require_member(&self, group_id: &str, agent_id: &str) -> ServiceResult<()> {
        if self.storage.get_group(group_id)?.is_none() {
            return Err(ServiceError::NotFound("group not found".to_string()));
        }
        if self.storage.get_group_member(group_id, agent_id)?.is_none() {
            return Err(ServiceError::Forbidden(
                "not a member of this group".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_content(content: &str) -> ServiceResult<String> {
        let cleaned = content.trim();
        if cleaned.is_empty() {
            return Err(ServiceError::Invalid("message content is empty".to_string()));
        }
        if cleaned.chars().count() > MAX_CONTENT_LEN {
            return Err(ServiceError::Invalid(format!(
                "message content is too long (max {MAX_CONTENT_LEN} characters)"
            )));
        }
        Ok(cleaned.to_string())
    }

    pub fn send(
        &self,
        actor: &AgentRecord,
        group_id: &str,
        content: &str,
        reply_to_id: Option<String>,
        now: f64,
    ) -> ServiceResult<EnrichedMessageView> {
        self.require_member(group_id, &actor.agent_id)?;
        let content = Self::validate_content(content)?;
        let reply_to_id = reply_to_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        if let Some(reply_id) = reply_to_id.as_deref() {
            let target = self.storage.get_message(reply_id)?;
            if !target.is_some_and(|message| message.group_id == group_id) {
                return Err(ServiceError::Invalid(
                    "reply target is not a message in this group".to_string(),
                ));
            }
        }
        let record = MessageRecord {
            message_id: Uuid::new_v4().simple().to_string(),
            group_id: group_id.to_string(),
            agent_id: actor.agent_id.clone(),
            content,
            reply_to_id,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_message(&record)?;
        let view = self
            .enrich(std::slice::from_ref(&record), now)?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::internal("enrichment dropped a fresh message"))?;
        self.events.publish(
            &group_room(group_id),
            RealtimeEvent::new(
                EventKind::MessageNew,
                json!({ "group_id": group_id, "message": view }),
            ),
        );
        Ok(view)
    }

    /// Author may always delete their own message; otherwise the
    /// deleteAnyMessage permission applies.
    pub fn delete(
        &self,
        actor: &AgentRecord,
        group_id: &str,
        message_id: &str,
    ) -> ServiceResult<()> {
        self.require_member(group_id, &actor.agent_id)?;
        let message = self
            .storage
            .get_message(message_id)?
            .filter(|message| message.group_id == group_id)
            .ok_or_else(|| ServiceError::NotFound("message not found".to_string()))?;
        if message.agent_id != actor.agent_id {
            let check = self.groups.check_permission(
                group_id,
                &actor.agent_id,
                GroupAction::DeleteAnyMessage,
            )?;
            if !check.allowed {
                return Err(ServiceError::Forbidden(
                    "only the author or a moderator may delete this message".to_string(),
                ));
            }
        }
        self.storage.delete_message(message_id)?;
        self.events.publish(
            &group_room(group_id),
            RealtimeEvent::new(
                EventKind::MessageDeleted,
                json!({ "group_id": group_id, "message_id": message_id }),
            ),
        );
        Ok(())
    }

    pub fn react(
        &self,
        actor: &AgentRecord,
        group_id: &str,
        message_id: &str,
        reaction: &str,
        now: f64,
    ) -> ServiceResult<String> {
        self.require_member(group_id, &actor.agent_id)?;
        let emoji = reaction_emoji(reaction)
            .ok_or_else(|| ServiceError::Invalid(format!("unknown reaction: {reaction}")))?;
        if self
            .storage
            .get_message(message_id)?
            .filter(|message| message.group_id == group_id)
            .is_none()
        {
            return Err(ServiceError::NotFound("message not found".to_string()));
        }
        let record = ReactionRecord {
            message_id: message_id.to_string(),
            agent_id: actor.agent_id.clone(),
            emoji: emoji.to_string(),
            created_at: now,
        };
        match self.storage.insert_message_reaction(&record) {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(ServiceError::Conflict("already reacted".to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        self.events.publish(
            &group_room(group_id),
            RealtimeEvent::new(
                EventKind::MessageReactionAdded,
                json!({
                    "group_id": group_id,
                    "message_id": message_id,
                    "agent_id": actor.agent_id,
                    "emoji": emoji,
                }),
            ),
        );
        Ok(emoji.to_string())
    }

    pub fn unreact(
        &self,
        actor: &AgentRecord,
        group_id: &str,
        message_id: &str,
        reaction: &str,
    ) -> ServiceResult<()> {
        self.require_member(group_id, &actor.agent_id)?;
        let emoji = reaction_emoji(reaction)
            .ok_or_else(|| ServiceError::Invalid(format!("unknown reaction: {reaction}")))?;
        let removed = self
            .storage
            .delete_message_reaction(message_id, &actor.agent_id, emoji)?;
        if removed == 0 {
            return Err(ServiceError::NotFound("reaction not found".to_string()));
        }
        self.events.publish(
            &group_room(group_id),
            RealtimeEvent::new(
                EventKind::MessageReactionRemoved,
                json!({
                    "group_id": group_id,
                    "message_id": message_id,
                    "agent_id": actor.agent_id,
                    "emoji": emoji,
                }),
            ),
        );
        Ok(())
    }

    /// Newest `limit` messages returned in chronological order. `before` is
    /// a message id cursor for paging further back.
    pub fn list(
        &self,
        actor: &AgentRecord,
        group_id: &str,
        limit: Option<i64>,
        before: Option<String>,
        now: f64,
    ) -> ServiceResult<Vec<EnrichedMessageView>> {
        self.require_member(group_id, &actor.agent_id)?;
        let before_ts = match before.map(|value| value.trim().to_string()).filter(|v| !v.is_empty()) {
            Some(cursor) => {
                let message = self
                    .storage
                    .get_message(&cursor)?
                    .filter(|message| message.group_id == group_id)
                    .ok_or_else(|| {
                        ServiceError::Invalid("before cursor is not a message in this group".to_string())
                    })?;
                Some(message.created_at)
            }
            None => None,
        };
        let mut records =
            self.storage
                .list_group_messages(group_id, before_ts, clamp_limit(limit))?;
        records.reverse();
        self.enrich(&records, now)
    }

    /// Batch enrichment: one reactions query, one reply-preview query, one
    /// badge pass over distinct authors.
    pub fn enrich(
        &self,
        records: &[MessageRecord],
        now: f64,
    ) -> ServiceResult<Vec<EnrichedMessageView>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let message_ids: Vec<String> = records.iter().map(|m| m.message_id.clone()).collect();
        let reactions = self.storage.list_reactions_for_messages(&message_ids)?;
        let reply_ids: Vec<String> = records
            .iter()
            .filter_map(|m| m.reply_to_id.clone())
            .collect();
        let reply_targets = self.storage.get_messages_by_ids(&reply_ids)?;
        let mut author_ids: Vec<String> = records.iter().map(|m| m.agent_id.clone()).collect();
        author_ids.sort();
        author_ids.dedup();
        let authors = self.storage.get_agents_by_ids(&author_ids)?;
        let badges = self.badges.badges_for_agents(&author_ids, now)?;

        let authors_by_id: HashMap<&str, &AgentRecord> = authors
            .iter()
            .map(|agent| (agent.agent_id.as_str(), agent))
            .collect();
        let replies_by_id: HashMap<&str, &MessageRecord> = reply_targets
            .iter()
            .map(|message| (message.message_id.as_str(), message))
            .collect();
        let mut reactions_by_message: HashMap<&str, Vec<&ReactionRecord>> = HashMap::new();
        for reaction in &reactions {
            reactions_by_message
                .entry(reaction.message_id.as_str())
                .or_default()
                .push(reaction);
        }

        Ok(records
            .iter()
            .map(|record| {
                let author = authors_by_id.get(record.agent_id.as_str());
                EnrichedMessageView {
                    id: record.message_id.clone(),
                    group_id: record.group_id.clone(),
                    author: AuthorView {
                        agent_id: record.agent_id.clone(),
                        name: author.map(|a| a.name.clone()).unwrap_or_default(),
                        handle: author.map(|a| a.handle.clone()).unwrap_or_default(),
                        avatar_url: author.and_then(|a| a.avatar_url.clone()),
                        badges: badges.get(&record.agent_id).cloned().unwrap_or_default(),
                    },
                    content: record.content.clone(),
                    reply_to: record.reply_to_id.as_deref().and_then(|reply_id| {
                        replies_by_id.get(reply_id).map(|target| ReplyPreview {
                            message_id: target.message_id.clone(),
                            agent_id: target.agent_id.clone(),
                            content: truncate_preview(&target.content),
                        })
                    }),
                    reactions: group_reactions(
                        reactions_by_message
                            .get(record.message_id.as_str())
                            .map(Vec::as_slice)
                            .unwrap_or(&[]),
                    ),
                    created_at: record.created_at,
                }
            })
            .collect())
    }
}

pub fn group_reactions(reactions: &[&ReactionRecord]) -> Vec<ReactionGroupView> {
    let mut grouped: Vec<ReactionGroupView> = Vec::new();
    for reaction in reactions {
        match grouped
            .iter_mut()
            .find(|group| group.emoji == reaction.emoji)
        {
            Some(group) => {
                group.count += 1;
                group.agent_ids.push(reaction.agent_id.clone());
            }
            None => grouped.push(ReactionGroupView {
                emoji: reaction.emoji.clone(),
                count: 1,
                agent_ids: vec![reaction.agent_id.clone()],
            }),
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaction_names_and_emoji_both_resolve() {
        assert_eq!(reaction_emoji("like"), Some("👍"));
        assert_eq!(reaction_emoji("❤️"), Some("❤️"));
        assert_eq!(reaction_emoji("angry"), Some("😠"));
        assert_eq!(reaction_emoji("sad"), Some("😢"));
        assert_eq!(reaction_emoji("party"), None);
    }

    #[test]
    fn limit_clamps_at_one_hundred() {
        assert_eq!(clamp_limit(Some(500)), 100);
        assert_eq!(clamp_limit(Some(10)), 10);
        assert_eq!(clamp_limit(Some(0)), DEFAULT_LIST_LIMIT);
        assert_eq!(clamp_limit(None), DEFAULT_LIST_LIMIT);
    }

    #[test]
    fn preview_truncates_to_one_hundred_chars() {
        let long = "x".repeat(250);
        assert_eq!(truncate_preview(&long).chars().count(), 100);
        assert_eq!(truncate_preview("short"), "short");
    }

    #[test]
    fn reactions_group_by_emoji() {
        let rows = [
            ReactionRecord {
                message_id: "m1".to_string(),
                agent_id: "a".to_string(),
                emoji: "👍".to_string(),
                created_at: 1.0,
            },
            ReactionRecord {
                message_id: "m1".to_string(),
                agent_id: "b".to_string(),
                emoji: "👍".to_string(),
                created_at: 2.0,
            },
            ReactionRecord {
                message_id: "m1".to_string(),
                agent_id: "a".to_string(),
                emoji: "😢".to_string(),
                created_at: 3.0,
            },
        ];
        let refs: Vec<&ReactionRecord> = rows.iter().collect();
        let grouped = group_reactions(&refs);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].emoji, "👍");
        assert_eq!(grouped[0].count, 2);
        assert_eq!(grouped[1].count, 1);
    }
}

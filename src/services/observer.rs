// Unauthenticated read model over public groups and the agent directory.
// Private groups and their messages answer as not-found; secrets never
// appear because the view types do not carry them.
use crate::services::badges::{BadgeService, BadgeView};
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::groups::{GroupService, GroupView};
use crate::services::identity::AgentProfile;
use crate::services::messaging::{clamp_limit, group_reactions, truncate_preview};
use crate::storage::{AgentRecord, GroupRecord, ReactionRecord, StorageBackend};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ObserverAgentView {
    #[serde(flatten)]
    pub profile: AgentProfile,
    pub badges: Vec<BadgeView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObserverReactionView {
    pub emoji: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObserverMessageView {
    pub id: String,
    pub group_id: String,
    pub author_name: String,
    pub author_handle: String,
    pub author_badges: Vec<BadgeView>,
    pub content: String,
    pub reply_preview: Option<String>,
    pub reactions: Vec<ObserverReactionView>,
    pub created_at: f64,
}

pub struct ObserverService {
    storage: Arc<dyn StorageBackend>,
    badges: Arc<BadgeService>,
    groups: Arc<GroupService>,
}

impl ObserverService {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        badges: Arc<BadgeService>,
        groups: Arc<GroupService>,
    ) -> Self {
        Self {
            storage,
            badges,
            groups,
        }
    }

    fn require_public_group(&self, group_id: &str) -> ServiceResult<GroupRecord> {
        self.storage
            .get_group(group_id)?
            .filter(|group| group.is_public)
            .ok_or_else(|| ServiceError::NotFound("group not found".to_string()))
    }

    pub fn list_groups(&self) -> ServiceResult<Vec<GroupView>> {
        self.groups.list(true)
    }

    pub fn get_group(&self, group_id: &str) -> ServiceResult<GroupView> {
        let group = self.require_public_group(group_id)?;
        let detail = self.groups.get(&group.group_id)?;
        Ok(detail.group)
    }

    pub fn list_group_messages(
        &self,
        group_id: &str,
        limit: Option<i64>,
        now: f64,
    ) -> ServiceResult<Vec<ObserverMessageView>> {
        self.require_public_group(group_id)?;
        let mut records = self
            .storage
            .list_group_messages(group_id, None, clamp_limit(limit))?;
        records.reverse();
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
        let previews_by_id: HashMap<&str, String> = reply_targets
            .iter()
            .map(|message| {
                (
                    message.message_id.as_str(),
                    truncate_preview(&message.content),
                )
            })
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
                ObserverMessageView {
                    id: record.message_id.clone(),
                    group_id: record.group_id.clone(),
                    author_name: author.map(|a| a.name.clone()).unwrap_or_default(),
                    author_handle: author.map(|a| a.handle.clone()).unwrap_or_default(),
                    author_badges: badges.get(&record.agent_id).cloned().unwrap_or_default(),
                    content: record.content.clone(),
                    reply_preview: record
                        .reply_to_id
                        .as_deref()
                        .and_then(|reply_id| previews_by_id.get(reply_id).cloned()),
                    reactions: group_reactions(
                        reactions_by_message
                            .get(record.message_id.as_str())
                            .map(Vec::as_slice)
                            .unwrap_or(&[]),
                    )
                    .into_iter()
                    .map(|group| ObserverReactionView {
                        emoji: group.emoji,
                        count: group.count,
                    })
                    .collect(),
                    created_at: record.created_at,
                }
            })
            .collect())
    }

    pub fn list_agents(&self, online_only: bool, now: f64) -> ServiceResult<Vec<ObserverAgentView>> {
        let agents = self.storage.list_agents(online_only)?;
        let ids: Vec<String> = agents.iter().map(|a| a.agent_id.clone()).collect();
        let badges = self.badges.badges_for_agents(&ids, now)?;
        Ok(agents
            .iter()
            .map(|agent| ObserverAgentView {
                profile: AgentProfile::from_record(agent),
                badges: badges.get(&agent.agent_id).cloned().unwrap_or_default(),
            })
            .collect())
    }

    pub fn get_agent(&self, agent_id: &str, now: f64) -> ServiceResult<ObserverAgentView> {
        let agent = self
            .storage
            .get_agent(agent_id)?
            .ok_or_else(|| ServiceError::NotFound("agent not found".to_string()))?;
        Ok(ObserverAgentView {
            badges: self.badges.badges_for_agent(&agent.agent_id, now)?,
            profile: AgentProfile::from_record(&agent),
        })
    }
}

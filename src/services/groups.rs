// Group lifecycle: creation, membership, role changes, settings,
// permission overrides and pins. Every state change publishes one
// canonical event after the write commits.
use crate::services::error::{ServiceError, ServiceResult};
use crate::services::events::{group_room, EventBus, EventKind, RealtimeEvent};
use crate::services::permissions::{
    can_modify_role, check_group_permission, is_valid_role, resolve_required_role, GroupAction,
    ROLE_ADMIN, ROLE_MEMBER, ROLE_MODERATOR,
};
use crate::storage::{
    AgentRecord, GroupMemberRecord, GroupPermissionsRecord, GroupRecord, StorageBackend,
    StoreError,
};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

const MAX_GROUP_NAME_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 1_000;

#[derive(Debug, Clone, Serialize)]
pub struct GroupView {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub is_public: bool,
    pub created_by: String,
    pub created_at: f64,
    pub member_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMemberView {
    pub agent_id: String,
    pub name: String,
    pub handle: String,
    pub avatar_url: Option<String>,
    pub role: String,
    pub joined_at: f64,
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupDetailView {
    #[serde(flatten)]
    pub group: GroupView,
    pub members: Vec<GroupMemberView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PinnedMessageView {
    pub message_id: String,
    pub pinned_by: String,
    pub pinned_at: f64,
    pub content: Option<String>,
    pub author_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSettingsView {
    pub group: GroupView,
    pub actor_role: String,
    pub role_counts: HashMap<String, i64>,
    pub permissions: HashMap<String, String>,
    pub pinned_messages: Vec<PinnedMessageView>,
}

pub struct GroupService {
    storage: Arc<dyn StorageBackend>,
    events: Arc<EventBus>,
}

impl GroupService {
    pub fn new(storage: Arc<dyn StorageBackend>, events: Arc<EventBus>) -> Self {
        Self { storage, events }
    }

    pub fn slugify(name: &str) -> String {
        let mut slug = String::with_capacity(name.len());
        let mut last_dash = true;
        for ch in name.trim().to_lowercase().chars() {
            if ch.is_ascii_alphanumeric() {
                slug.push(ch);
                last_dash = false;
            } else if !last_dash {
                slug.push('-');
                last_dash = true;
            }
        }
        while slug.ends_with('-') {
            slug.pop();
        }
        slug
    }

    /// Resolve (member, overrides) and evaluate one gated action.
    pub fn check_permission(
        &self,
        group_id: &str,
        agent_id: &str,
        action: GroupAction,
    ) -> ServiceResult<crate::services::permissions::PermissionCheck> {
        let member = self.storage.get_group_member(group_id, agent_id)?;
        let overrides = self.storage.get_group_permissions(group_id)?;
        Ok(check_group_permission(
            member.as_ref(),
            overrides.as_ref(),
            action,
        ))
    }

    fn require_permission(
        &self,
        group_id: &str,
        agent_id: &str,
        action: GroupAction,
    ) -> ServiceResult<String> {
        let check = self.check_permission(group_id, agent_id, action)?;
        if !check.allowed {
            return Err(ServiceError::Forbidden(check.reason.unwrap_or_else(|| {
                format!("{} requires role {}", action.as_str(), check.required_role)
            })));
        }
        check
            .actor_role
            .ok_or_else(|| ServiceError::internal("allowed check without actor role"))
    }

    fn require_group(&self, group_id: &str) -> ServiceResult<GroupRecord> {
        self.storage
            .get_group(group_id)?
            .ok_or_else(|| ServiceError::NotFound("group not found".to_string()))
    }

    fn require_member(&self, group_id: &str, agent_id: &str) -> ServiceResult<GroupMemberRecord> {
        self.storage
            .get_group_member(group_id, agent_id)?
            .ok_or_else(|| ServiceError::Forbidden("not a member of this group".to_string()))
    }

    fn validate_name(name: &str) -> ServiceResult<String> {
        let cleaned = name.trim();
        if cleaned.is_empty() {
            return Err(ServiceError::Invalid("group name is required".to_string()));
        }
        if cleaned.chars().count() > MAX_GROUP_NAME_LEN {
            return Err(ServiceError::Invalid(format!(
                "group name is too long (max {MAX_GROUP_NAME_LEN} characters)"
            )));
        }
        Ok(cleaned.to_string())
    }

    fn group_view(&self, record: &GroupRecord) -> ServiceResult<GroupView> {
        let member_count = self
            .storage
            .count_members_for_groups(&[record.group_id.clone()])?
            .first()
            .map(|(_, count)| *count)
            .unwrap_or(0);
        Ok(Self::group_view_with_count(record, member_count))
    }

    fn group_view_with_count(record: &GroupRecord, member_count: i64) -> GroupView {
        GroupView {
            id: record.group_id.clone(),
            name: record.name.clone(),
            slug: record.slug.clone(),
            description: record.description.clone(),
            avatar_url: record.avatar_url.clone(),
            is_public: record.is_public,
            created_by: record.created_by.clone(),
            created_at: record.created_at,
            member_count,
        }
    }

    fn member_views(&self, members: &[GroupMemberRecord]) -> ServiceResult<Vec<GroupMemberView>> {
        let agent_ids: Vec<String> = members.iter().map(|m| m.agent_id.clone()).collect();
        let agents = self.storage.get_agents_by_ids(&agent_ids)?;
        let by_id: HashMap<&str, &AgentRecord> = agents
            .iter()
            .map(|agent| (agent.agent_id.as_str(), agent))
            .collect();
        Ok(members
            .iter()
            .map(|member| {
                let agent = by_id.get(member.agent_id.as_str());
                GroupMemberView {
                    agent_id: member.agent_id.clone(),
                    name: agent.map(|a| a.name.clone()).unwrap_or_default(),
                    handle: agent.map(|a| a.handle.clone()).unwrap_or_default(),
                    avatar_url: agent.and_then(|a| a.avatar_url.clone()),
                    role: member.role.clone(),
                    joined_at: member.joined_at,
                    is_online: agent.map(|a| a.is_online).unwrap_or(false),
                }
            })
            .collect())
    }

    pub fn resolved_permissions(&self, group_id: &str) -> ServiceResult<HashMap<String, String>> {
        let overrides = self.storage.get_group_permissions(group_id)?;
        Ok(GroupAction::ALL
            .iter()
            .map(|action| {
                (
                    action.as_str().to_string(),
                    resolve_required_role(overrides.as_ref(), *action),
                )
            })
            .collect())
    }

    pub fn create(
        &self,
        actor: &AgentRecord,
        name: &str,
        description: Option<String>,
        is_public: bool,
        now: f64,
    ) -> ServiceResult<GroupDetailView> {
        let name = Self::validate_name(name)?;
        let slug = Self::slugify(&name);
        if slug.is_empty() {
            return Err(ServiceError::Invalid(
                "group name must contain at least one alphanumeric character".to_string(),
            ));
        }
        if self.storage.get_group_by_slug(&slug)?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "a group with slug {slug} already exists"
            )));
        }
        let group = GroupRecord {
            group_id: Uuid::new_v4().simple().to_string(),
            name,
            slug,
            description: description
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            avatar_url: None,
            is_public,
            created_by: actor.agent_id.clone(),
            created_at: now,
        };
        let admin = GroupMemberRecord {
            group_id: group.group_id.clone(),
            agent_id: actor.agent_id.clone(),
            role: ROLE_ADMIN.to_string(),
            joined_at: now,
        };
        match self.storage.create_group_with_admin(&group, &admin) {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(ServiceError::Conflict(format!(
                    "a group with slug {} already exists",
                    group.slug
                )));
            }
            Err(err) => return Err(err.into()),
        }
        let view = GroupDetailView {
            group: Self::group_view_with_count(&group, 1),
            members: self.member_views(&[admin])?,
        };
        self.events
            .broadcast_all(None, RealtimeEvent::new(EventKind::GroupCreated, json!(view.group)));
        Ok(view)
    }

    pub fn get(&self, group_id: &str) -> ServiceResult<GroupDetailView> {
        let group = self.require_group(group_id)?;
        let members = self.storage.list_group_members(group_id)?;
        Ok(GroupDetailView {
            group: Self::group_view_with_count(&group, members.len() as i64),
            members: self.member_views(&members)?,
        })
    }

    pub fn list(&self, public_only: bool) -> ServiceResult<Vec<GroupView>> {
        let groups = self.storage.list_groups(public_only)?;
        let ids: Vec<String> = groups.iter().map(|g| g.group_id.clone()).collect();
        let counts: HashMap<String, i64> = self
            .storage
            .count_members_for_groups(&ids)?
            .into_iter()
            .collect();
        Ok(groups
            .iter()
            .map(|group| {
                Self::group_view_with_count(
                    group,
                    counts.get(&group.group_id).copied().unwrap_or(0),
                )
            })
            .collect())
    }

    pub fn join(&self, actor: &AgentRecord, group_id: &str, now: f64) -> ServiceResult<GroupMemberView> {
        self.require_group(group_id)?;
        let member = GroupMemberRecord {
            group_id: group_id.to_string(),
            agent_id: actor.agent_id.clone(),
            role: ROLE_MEMBER.to_string(),
            joined_at: now,
        };
        match self.storage.insert_group_member(&member) {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(ServiceError::Conflict(
                    "already a member of this group".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        }
        let view = self
            .member_views(&[member])?
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::internal("member view missing after join"))?;
        self.events.publish(
            &group_room(group_id),
            RealtimeEvent::new(
                EventKind::MemberJoined,
                json!({ "group_id": group_id, "member": view }),
            ),
        );
        Ok(view)
    }

    pub fn leave(&self, actor: &AgentRecord, group_id: &str) -> ServiceResult<()> {
        self.require_group(group_id)?;
        let member = self.require_member(group_id, &actor.agent_id)?;
        if member.role == ROLE_ADMIN
            && self
                .storage
                .count_group_members_with_role(group_id, ROLE_ADMIN)?
                <= 1
        {
            return Err(ServiceError::PreconditionFailed(
                "the last admin cannot leave; delete the group or promote another member first"
                    .to_string(),
            ));
        }
        self.storage.remove_group_member(group_id, &actor.agent_id)?;
        self.events.publish(
            &group_room(group_id),
            RealtimeEvent::new(
                EventKind::MemberLeft,
                json!({ "group_id": group_id, "agent_id": actor.agent_id }),
            ),
        );
        Ok(())
    }

    pub fn update_settings(
        &self,
        actor: &AgentRecord,
        group_id: &str,
        name: Option<String>,
        description: Option<String>,
        avatar_url: Option<String>,
    ) -> ServiceResult<GroupView> {
        let mut group = self.require_group(group_id)?;
        let mut changed = false;
        if let Some(name) = name {
            self.require_permission(group_id, &actor.agent_id, GroupAction::RenameGroup)?;
            let cleaned = Self::validate_name(&name)?;
            if cleaned != group.name {
                let slug = Self::slugify(&cleaned);
                if slug.is_empty() {
                    return Err(ServiceError::Invalid(
                        "group name must contain at least one alphanumeric character".to_string(),
                    ));
                }
                if slug != group.slug && self.storage.get_group_by_slug(&slug)?.is_some() {
                    return Err(ServiceError::Conflict(format!(
                        "a group with slug {slug} already exists"
                    )));
                }
                group.name = cleaned;
                group.slug = slug;
                changed = true;
            }
        }
        if let Some(description) = description {
            self.require_permission(group_id, &actor.agent_id, GroupAction::EditDescription)?;
            let cleaned = description.trim().to_string();
            if cleaned.chars().count() > MAX_DESCRIPTION_LEN {
                return Err(ServiceError::Invalid(format!(
                    "description is too long (max {MAX_DESCRIPTION_LEN} characters)"
                )));
            }
            group.description = Some(cleaned).filter(|value| !value.is_empty());
            changed = true;
        }
        if let Some(avatar_url) = avatar_url {
            self.require_permission(group_id, &actor.agent_id, GroupAction::EditAvatar)?;
            let cleaned = avatar_url.trim().to_string();
            if !cleaned.is_empty() && !cleaned.starts_with("http://") && !cleaned.starts_with("https://") {
                return Err(ServiceError::Invalid(
                    "avatar url must be an http(s) url".to_string(),
                ));
            }
            group.avatar_url = Some(cleaned).filter(|value| !value.is_empty());
            changed = true;
        }
        if changed {
            self.storage.update_group(&group)?;
        }
        let view = self.group_view(&group)?;
        if changed {
            self.events.publish(
                &group_room(group_id),
                RealtimeEvent::new(EventKind::GroupUpdated, json!(view)),
            );
        }
        Ok(view)
    }

    /// PUT semantics: the supplied map replaces all overrides; omitted
    /// actions fall back to their defaults.
    pub fn update_permissions(
        &self,
        actor: &AgentRecord,
        group_id: &str,
        entries: &HashMap<String, String>,
    ) -> ServiceResult<HashMap<String, String>> {
        self.require_group(group_id)?;
        let member = self.require_member(group_id, &actor.agent_id)?;
        if member.role != ROLE_ADMIN {
            return Err(ServiceError::Forbidden(
                "only admins may change group permissions".to_string(),
            ));
        }
        let mut record = GroupPermissionsRecord {
            group_id: group_id.to_string(),
            rename_group: GroupAction::RenameGroup.default_role().to_string(),
            edit_description: GroupAction::EditDescription.default_role().to_string(),
            edit_avatar: GroupAction::EditAvatar.default_role().to_string(),
            delete_group: GroupAction::DeleteGroup.default_role().to_string(),
            remove_members: GroupAction::RemoveMembers.default_role().to_string(),
            set_roles: GroupAction::SetRoles.default_role().to_string(),
            invite_members: GroupAction::InviteMembers.default_role().to_string(),
            pin_messages: GroupAction::PinMessages.default_role().to_string(),
            delete_any_message: GroupAction::DeleteAnyMessage.default_role().to_string(),
        };
        for (key, value) in entries {
            let action = GroupAction::parse(key).ok_or_else(|| {
                ServiceError::Invalid(format!("unknown permission action: {key}"))
            })?;
            let role = value.trim();
            if !is_valid_role(role) {
                return Err(ServiceError::Invalid(format!("unknown role: {role}")));
            }
            if action == GroupAction::DeleteGroup && role != ROLE_ADMIN {
                return Err(ServiceError::Invalid(
                    "deleteGroup is locked to admin".to_string(),
                ));
            }
            match action {
                GroupAction::RenameGroup => record.rename_group = role.to_string(),
                GroupAction::EditDescription => record.edit_description = role.to_string(),
                GroupAction::EditAvatar => record.edit_avatar = role.to_string(),
                GroupAction::DeleteGroup => record.delete_group = role.to_string(),
                GroupAction::RemoveMembers => record.remove_members = role.to_string(),
                GroupAction::SetRoles => record.set_roles = role.to_string(),
                GroupAction::InviteMembers => record.invite_members = role.to_string(),
                GroupAction::PinMessages => record.pin_messages = role.to_string(),
                GroupAction::DeleteAnyMessage => record.delete_any_message = role.to_string(),
            }
        }
        self.storage.put_group_permissions(&record)?;
        let resolved = self.resolved_permissions(group_id)?;
        self.events.publish(
            &group_room(group_id),
            RealtimeEvent::new(
                EventKind::GroupPermissionsUpdated,
                json!({ "group_id": group_id, "permissions": resolved }),
            ),
        );
        Ok(resolved)
    }

    pub fn delete(&self, actor: &AgentRecord, group_id: &str) -> ServiceResult<()> {
        self.require_group(group_id)?;
        self.require_permission(group_id, &actor.agent_id, GroupAction::DeleteGroup)?;
        self.storage.delete_group(group_id)?;
        self.events.broadcast_all(
            None,
            RealtimeEvent::new(EventKind::GroupDeleted, json!({ "group_id": group_id })),
        );
        Ok(())
    }

    pub fn remove_member(
        &self,
        actor: &AgentRecord,
        group_id: &str,
        target_agent_id: &str,
    ) -> ServiceResult<()> {
        self.require_group(group_id)?;
        if actor.agent_id == target_agent_id.trim() {
            return Err(ServiceError::Invalid(
                "use leave to remove yourself".to_string(),
            ));
        }
        let actor_role =
            self.require_permission(group_id, &actor.agent_id, GroupAction::RemoveMembers)?;
        let target = self
            .storage
            .get_group_member(group_id, target_agent_id)?
            .ok_or_else(|| ServiceError::NotFound("member not found".to_string()))?;
        if !can_modify_role(&actor_role, &target.role) {
            return Err(ServiceError::PreconditionFailed(
                "cannot remove a member of equal or higher role".to_string(),
            ));
        }
        self.storage.remove_group_member(group_id, target_agent_id)?;
        self.events.publish(
            &group_room(group_id),
            RealtimeEvent::new(
                EventKind::MemberRemoved,
                json!({
                    "group_id": group_id,
                    "agent_id": target.agent_id,
                    "removed_by": actor.agent_id,
                }),
            ),
        );
        Ok(())
    }

    pub fn set_member_role(
        &self,
        actor: &AgentRecord,
        group_id: &str,
        target_agent_id: &str,
        new_role: &str,
    ) -> ServiceResult<()> {
        self.require_group(group_id)?;
        let new_role = new_role.trim();
        if !is_valid_role(new_role) {
            return Err(ServiceError::Invalid(format!("unknown role: {new_role}")));
        }
        if actor.agent_id == target_agent_id.trim() {
            return Err(ServiceError::Invalid(
                "cannot change your own role".to_string(),
            ));
        }
        let actor_role =
            self.require_permission(group_id, &actor.agent_id, GroupAction::SetRoles)?;
        let target = self
            .storage
            .get_group_member(group_id, target_agent_id)?
            .ok_or_else(|| ServiceError::NotFound("member not found".to_string()))?;
        if !can_modify_role(&actor_role, &target.role) || !can_modify_role(&actor_role, new_role) {
            return Err(ServiceError::PreconditionFailed(
                "cannot assign a role equal to or above your own".to_string(),
            ));
        }
        self.storage
            .set_group_member_role(group_id, target_agent_id, new_role)?;
        self.events.publish(
            &group_room(group_id),
            RealtimeEvent::new(
                EventKind::MemberRoleChanged,
                json!({
                    "group_id": group_id,
                    "agent_id": target.agent_id,
                    "role": new_role,
                    "changed_by": actor.agent_id,
                }),
            ),
        );
        Ok(())
    }

    pub fn pin_message(
        &self,
        actor: &AgentRecord,
        group_id: &str,
        message_id: &str,
        now: f64,
    ) -> ServiceResult<()> {
        self.require_group(group_id)?;
        self.require_permission(group_id, &actor.agent_id, GroupAction::PinMessages)?;
        let message = self
            .storage
            .get_message(message_id)?
            .filter(|message| message.group_id == group_id)
            .ok_or_else(|| ServiceError::NotFound("message not found in this group".to_string()))?;
        let record = crate::storage::PinnedMessageRecord {
            group_id: group_id.to_string(),
            message_id: message.message_id.clone(),
            pinned_by: actor.agent_id.clone(),
            pinned_at: now,
        };
        match self.storage.insert_pinned_message(&record) {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(ServiceError::Conflict("message is already pinned".to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        self.events.publish(
            &group_room(group_id),
            RealtimeEvent::new(
                EventKind::MessagePinned,
                json!({
                    "group_id": group_id,
                    "message_id": message.message_id,
                    "pinned_by": actor.agent_id,
                }),
            ),
        );
        Ok(())
    }

    pub fn unpin_message(
        &self,
        actor: &AgentRecord,
        group_id: &str,
        message_id: &str,
    ) -> ServiceResult<()> {
        self.require_group(group_id)?;
        self.require_permission(group_id, &actor.agent_id, GroupAction::PinMessages)?;
        let removed = self.storage.delete_pinned_message(group_id, message_id)?;
        if removed == 0 {
            return Err(ServiceError::NotFound("message is not pinned".to_string()));
        }
        self.events.publish(
            &group_room(group_id),
            RealtimeEvent::new(
                EventKind::MessageUnpinned,
                json!({ "group_id": group_id, "message_id": message_id }),
            ),
        );
        Ok(())
    }

    pub fn get_settings(
        &self,
        actor: &AgentRecord,
        group_id: &str,
    ) -> ServiceResult<GroupSettingsView> {
        let group = self.require_group(group_id)?;
        let member = self.require_member(group_id, &actor.agent_id)?;
        let mut role_counts = HashMap::new();
        for role in [ROLE_ADMIN, ROLE_MODERATOR, ROLE_MEMBER] {
            role_counts.insert(
                role.to_string(),
                self.storage.count_group_members_with_role(group_id, role)?,
            );
        }
        let pins = self.storage.list_pinned_messages(group_id)?;
        let pin_ids: Vec<String> = pins.iter().map(|pin| pin.message_id.clone()).collect();
        let pinned_records = self.storage.get_messages_by_ids(&pin_ids)?;
        let by_id: HashMap<&str, &crate::storage::MessageRecord> = pinned_records
            .iter()
            .map(|message| (message.message_id.as_str(), message))
            .collect();
        let pinned_messages = pins
            .iter()
            .map(|pin| {
                let message = by_id.get(pin.message_id.as_str());
                PinnedMessageView {
                    message_id: pin.message_id.clone(),
                    pinned_by: pin.pinned_by.clone(),
                    pinned_at: pin.pinned_at,
                    content: message.map(|m| m.content.clone()),
                    author_id: message.map(|m| m.agent_id.clone()),
                }
            })
            .collect();
        Ok(GroupSettingsView {
            group: self.group_view(&group)?,
            actor_role: member.role,
            role_counts,
            permissions: self.resolved_permissions(group_id)?,
            pinned_messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::GroupService;

    #[test]
    fn slugify_collapses_and_trims() {
        assert_eq!(GroupService::slugify("Agent Lounge"), "agent-lounge");
        assert_eq!(GroupService::slugify("  Big -- Deal!  "), "big-deal");
        assert_eq!(GroupService::slugify("日本語"), "");
        assert_eq!(GroupService::slugify("a"), "a");
    }
}

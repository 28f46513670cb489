// Pure permission evaluator: role hierarchy plus per-group overrides.
use crate::storage::{GroupMemberRecord, GroupPermissionsRecord};

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_MODERATOR: &str = "moderator";
pub const ROLE_MEMBER: &str = "member";

/// Group actions gated by a minimum role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    RenameGroup,
    EditDescription,
    EditAvatar,
    DeleteGroup,
    RemoveMembers,
    SetRoles,
    InviteMembers,
    PinMessages,
    DeleteAnyMessage,
}

impl GroupAction {
    pub const ALL: [GroupAction; 9] = [
        GroupAction::RenameGroup,
        GroupAction::EditDescription,
        GroupAction::EditAvatar,
        GroupAction::DeleteGroup,
        GroupAction::RemoveMembers,
        GroupAction::SetRoles,
        GroupAction::InviteMembers,
        GroupAction::PinMessages,
        GroupAction::DeleteAnyMessage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RenameGroup => "renameGroup",
            Self::EditDescription => "editDescription",
            Self::EditAvatar => "editAvatar",
            Self::DeleteGroup => "deleteGroup",
            Self::RemoveMembers => "removeMembers",
            Self::SetRoles => "setRoles",
            Self::InviteMembers => "inviteMembers",
            Self::PinMessages => "pinMessages",
            Self::DeleteAnyMessage => "deleteAnyMessage",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "renameGroup" => Some(Self::RenameGroup),
            "editDescription" => Some(Self::EditDescription),
            "editAvatar" => Some(Self::EditAvatar),
            "deleteGroup" => Some(Self::DeleteGroup),
            "removeMembers" => Some(Self::RemoveMembers),
            "setRoles" => Some(Self::SetRoles),
            "inviteMembers" => Some(Self::InviteMembers),
            "pinMessages" => Some(Self::PinMessages),
            "deleteAnyMessage" => Some(Self::DeleteAnyMessage),
            _ => None,
        }
    }

    pub fn default_role(&self) -> &'static str {
        match self {
            Self::RenameGroup => ROLE_ADMIN,
            Self::EditDescription => ROLE_ADMIN,
            Self::EditAvatar => ROLE_ADMIN,
            Self::DeleteGroup => ROLE_ADMIN,
            Self::RemoveMembers => ROLE_MODERATOR,
            Self::SetRoles => ROLE_ADMIN,
            Self::InviteMembers => ROLE_MEMBER,
            Self::PinMessages => ROLE_MODERATOR,
            Self::DeleteAnyMessage => ROLE_MODERATOR,
        }
    }
}

pub fn is_valid_role(role: &str) -> bool {
    matches!(role, ROLE_ADMIN | ROLE_MODERATOR | ROLE_MEMBER)
}

pub fn role_level(role: &str) -> i32 {
    match role {
        ROLE_ADMIN => 3,
        ROLE_MODERATOR => 2,
        ROLE_MEMBER => 1,
        _ => 0,
    }
}

pub fn has_permission(user_role: &str, required_role: &str) -> bool {
    role_level(user_role) >= role_level(required_role)
}

/// Strict dominance: an actor may only modify roles below their own.
pub fn can_modify_role(actor_role: &str, target_role: &str) -> bool {
    role_level(actor_role) > role_level(target_role)
}

/// Minimum role for `action` under per-group overrides, falling back to the
/// action defaults when no override row exists.
pub fn resolve_required_role(
    overrides: Option<&GroupPermissionsRecord>,
    action: GroupAction,
) -> String {
    let Some(record) = overrides else {
        return action.default_role().to_string();
    };
    let role = match action {
        GroupAction::RenameGroup => record.rename_group.as_str(),
        GroupAction::EditDescription => record.edit_description.as_str(),
        GroupAction::EditAvatar => record.edit_avatar.as_str(),
        GroupAction::DeleteGroup => record.delete_group.as_str(),
        GroupAction::RemoveMembers => record.remove_members.as_str(),
        GroupAction::SetRoles => record.set_roles.as_str(),
        GroupAction::InviteMembers => record.invite_members.as_str(),
        GroupAction::PinMessages => record.pin_messages.as_str(),
        GroupAction::DeleteAnyMessage => record.delete_any_message.as_str(),
    };
    if is_valid_role(role) {
        role.to_string()
    } else {
        action.default_role().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct PermissionCheck {
    pub allowed: bool,
    pub actor_role: Option<String>,
    pub required_role: String,
    pub reason: Option<String>,
}

pub fn check_group_permission(
    member: Option<&GroupMemberRecord>,
    overrides: Option<&GroupPermissionsRecord>,
    action: GroupAction,
) -> PermissionCheck {
    let required_role = resolve_required_role(overrides, action);
    let Some(member) = member else {
        return PermissionCheck {
            allowed: false,
            actor_role: None,
            required_role,
            reason: Some("not a member of this group".to_string()),
        };
    };
    if has_permission(&member.role, &required_role) {
        PermissionCheck {
            allowed: true,
            actor_role: Some(member.role.clone()),
            required_role,
            reason: None,
        }
    } else {
        PermissionCheck {
            allowed: false,
            actor_role: Some(member.role.clone()),
            required_role: required_role.clone(),
            reason: Some(format!("requires role {required_role} or higher")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(role: &str) -> GroupMemberRecord {
        GroupMemberRecord {
            group_id: "g1".to_string(),
            agent_id: "a1".to_string(),
            role: role.to_string(),
            joined_at: 0.0,
        }
    }

    fn overrides(rename: &str) -> GroupPermissionsRecord {
        GroupPermissionsRecord {
            group_id: "g1".to_string(),
            rename_group: rename.to_string(),
            edit_description: ROLE_ADMIN.to_string(),
            edit_avatar: ROLE_ADMIN.to_string(),
            delete_group: ROLE_ADMIN.to_string(),
            remove_members: ROLE_MODERATOR.to_string(),
            set_roles: ROLE_ADMIN.to_string(),
            invite_members: ROLE_MEMBER.to_string(),
            pin_messages: ROLE_MODERATOR.to_string(),
            delete_any_message: ROLE_MODERATOR.to_string(),
        }
    }

    #[test]
    fn role_hierarchy_is_strictly_ordered() {
        assert!(has_permission(ROLE_ADMIN, ROLE_MODERATOR));
        assert!(has_permission(ROLE_MODERATOR, ROLE_MODERATOR));
        assert!(!has_permission(ROLE_MEMBER, ROLE_MODERATOR));
        assert!(can_modify_role(ROLE_ADMIN, ROLE_MODERATOR));
        assert!(!can_modify_role(ROLE_ADMIN, ROLE_ADMIN));
        assert!(!can_modify_role(ROLE_MODERATOR, ROLE_ADMIN));
    }

    #[test]
    fn defaults_apply_without_override_row() {
        let check = check_group_permission(
            Some(&member(ROLE_MODERATOR)),
            None,
            GroupAction::PinMessages,
        );
        assert!(check.allowed);
        let check = check_group_permission(
            Some(&member(ROLE_MODERATOR)),
            None,
            GroupAction::RenameGroup,
        );
        assert!(!check.allowed);
        assert_eq!(check.required_role, ROLE_ADMIN);
    }

    #[test]
    fn overrides_lower_required_role() {
        let lowered = overrides(ROLE_MEMBER);
        let check = check_group_permission(
            Some(&member(ROLE_MEMBER)),
            Some(&lowered),
            GroupAction::RenameGroup,
        );
        assert!(check.allowed);
    }

    #[test]
    fn non_member_is_denied_with_reason() {
        let check = check_group_permission(None, None, GroupAction::InviteMembers);
        assert!(!check.allowed);
        assert!(check.reason.is_some());
        assert!(check.actor_role.is_none());
    }

    #[test]
    fn unknown_role_text_falls_back_to_default() {
        let mut broken = overrides(ROLE_MEMBER);
        broken.pin_messages = "owner".to_string();
        assert_eq!(
            resolve_required_role(Some(&broken), GroupAction::PinMessages),
            ROLE_MODERATOR
        );
    }
}

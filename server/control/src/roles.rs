//! Role hierarchy and the moderation permission matrix.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Moderator,
    Admin,
    Owner,
}

impl Role {
    /// Numeric level: OWNER(4) > ADMIN(3) > MODERATOR(2) > USER(1); unknown is 0.
    pub fn level(self) -> u8 {
        match self {
            Role::Owner => 4,
            Role::Admin => 3,
            Role::Moderator => 2,
            Role::User => 1,
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        Some(match s {
            "owner" => Role::Owner,
            "admin" => Role::Admin,
            "moderator" => Role::Moderator,
            "user" => Role::User,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Moderator => "moderator",
            Role::User => "user",
        }
    }

    pub fn from_level(level: u8) -> Option<Role> {
        Some(match level {
            4 => Role::Owner,
            3 => Role::Admin,
            2 => Role::Moderator,
            1 => Role::User,
            _ => return None,
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gated moderation actions. Anything not listed here is open to every
/// connected user (chat, channel joins, typing, reactions, queries).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Kick,
    Mute,
    Ban,
    ManageChannels,
    DeleteAnyMessage,
    PinMessage,
    SetRole,
    ServerSettings,
    Announce,
    SetSlowMode,
    ManageRecordings,
}

/// Minimum role required for each gated action.
pub fn min_role(action: Action) -> Role {
    match action {
        Action::Kick => Role::Moderator,
        Action::DeleteAnyMessage => Role::Moderator,
        Action::PinMessage => Role::Moderator,
        Action::Mute => Role::Admin,
        Action::Ban => Role::Admin,
        Action::ManageChannels => Role::Admin,
        Action::ManageRecordings => Role::Admin,
        Action::SetRole => Role::Owner,
        Action::ServerSettings => Role::Owner,
        Action::Announce => Role::Owner,
        Action::SetSlowMode => Role::Owner,
    }
}

/// Whether `role` clears the bar for `action`.
pub fn allows(role: Role, action: Action) -> bool {
    role.level() >= min_role(action).level()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hierarchy_ordering() {
        assert!(Role::Owner.level() > Role::Admin.level());
        assert!(Role::Admin.level() > Role::Moderator.level());
        assert!(Role::Moderator.level() > Role::User.level());
        assert!(Role::User.level() > 0);
    }

    #[test]
    fn unknown_roles_parse_to_none() {
        assert_eq!(Role::parse("superuser"), None);
        assert_eq!(Role::parse("Owner"), None);
    }

    #[test]
    fn matrix_thresholds() {
        assert!(allows(Role::Moderator, Action::Kick));
        assert!(!allows(Role::User, Action::Kick));
        assert!(allows(Role::Admin, Action::Mute));
        assert!(!allows(Role::Moderator, Action::Ban));
        assert!(allows(Role::Moderator, Action::PinMessage));
        assert!(allows(Role::Moderator, Action::DeleteAnyMessage));
        assert!(!allows(Role::Admin, Action::SetRole));
        assert!(allows(Role::Owner, Action::Announce));
        assert!(!allows(Role::Admin, Action::SetSlowMode));
        assert!(allows(Role::Admin, Action::ManageChannels));
        assert!(allows(Role::Admin, Action::ManageRecordings));
    }

    #[test]
    fn serde_round_trip_is_lowercase() {
        let s = serde_json::to_string(&Role::Moderator).unwrap();
        assert_eq!(s, "\"moderator\"");
        let r: Role = serde_json::from_str("\"owner\"").unwrap();
        assert_eq!(r, Role::Owner);
    }
}

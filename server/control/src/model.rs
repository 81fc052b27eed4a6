use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::ids::{ChannelId, ClientId, MsgId};

/// Channel metadata as advertised in `channel_list`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_users: Option<u32>,
}

/// A chat message as retained by the room's bounded store. Kept around so
/// replies and moderation can render a preview after the original scrolls
/// out of clients' views.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMsg {
    pub sender: ClientId,
    pub username: String,
    pub text: String,
    pub channel_id: ChannelId,
    pub ts_ms: i64,
    pub deleted: bool,
}

impl StoredMsg {
    /// Short preview for reply rendering; deleted messages render a stub.
    pub fn preview(&self, max_chars: usize) -> String {
        if self.deleted {
            return "[deleted]".to_string();
        }
        let mut out: String = self.text.chars().take(max_chars).collect();
        if self.text.chars().count() > max_chars {
            out.push('\u{2026}');
        }
        out
    }
}

/// A server ban. Username bans always apply; `ip` widens the ban to the
/// address, `expires_at` makes it temporary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BanRecord {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    pub reason: String,
    pub banned_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BanRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    pub fn matches(&self, folded_username: &str, ip: IpAddr, now: DateTime<Utc>) -> bool {
        if self.is_expired(now) {
            return false;
        }
        self.username.to_lowercase() == folded_username || self.ip == Some(ip)
    }
}

/// ICE/TURN server advertisement handed to clients in `user_list`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// One reaction on a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: ClientId,
    pub emoji: String,
}

/// A pinned message reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PinnedMsg {
    pub msg_id: MsgId,
    pub channel_id: ChannelId,
    pub pinned_by: ClientId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_truncates_and_stubs_deleted() {
        let mut msg = StoredMsg {
            sender: ClientId(1),
            username: "alice".into(),
            text: "0123456789".into(),
            channel_id: ChannelId(1),
            ts_ms: 0,
            deleted: false,
        };
        assert_eq!(msg.preview(4), "0123\u{2026}");
        msg.deleted = true;
        assert_eq!(msg.preview(4), "[deleted]");
    }

    #[test]
    fn ban_matching() {
        let now = Utc::now();
        let ban = BanRecord {
            username: "Alice".into(),
            ip: Some("10.0.0.7".parse().unwrap()),
            reason: "No reason provided".into(),
            banned_by: "bob".into(),
            expires_at: None,
        };
        assert!(ban.matches("alice", "192.168.1.1".parse().unwrap(), now));
        assert!(ban.matches("carol", "10.0.0.7".parse().unwrap(), now));
        assert!(!ban.matches("carol", "192.168.1.1".parse().unwrap(), now));

        let expired = BanRecord {
            expires_at: Some(now - chrono::Duration::seconds(1)),
            ..ban
        };
        assert!(!expired.matches("alice", "10.0.0.7".parse().unwrap(), now));
    }
}

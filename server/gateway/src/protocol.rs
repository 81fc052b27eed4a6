//! Control-stream message schema.
//!
//! One JSON record per line, discriminated by `type`. Inbound and
//! outbound messages share the enum; outbound-only variants simply never
//! arrive (and are ignored if a client sends them anyway). The server
//! stamps `id`, `username`, `ts`, and `msg_id` on everything it relays —
//! client-supplied values for those fields are discarded.

use serde::{Deserialize, Serialize};

use lc_control::{ChannelId, ClientId, IceServer, MsgId, Role};

pub const MAX_CHAT_LEN: usize = 500;
pub const MAX_ANNOUNCE_LEN: usize = 500;
pub const MAX_SLOW_MODE_SECS: u32 = 3600;
pub const MAX_NACK_SEQS: usize = 10;

/// One row of the `user_list` snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: ClientId,
    pub username: String,
    pub channel_id: ChannelId,
    pub role: Role,
    pub muted: bool,
}

/// Channel metadata on the wire (re-exported shape from lc-control).
pub use lc_control::ChannelInfo;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub msg_id: MsgId,
    pub id: ClientId,
    pub username: String,
    pub message: String,
    pub channel_id: ChannelId,
    pub ts: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PinnedEntry {
    pub msg_id: MsgId,
    pub pinned_by: ClientId,
    pub preview: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReactionEntry {
    pub id: ClientId,
    pub emoji: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMsg {
    // ---- handshake / liveness ----
    Join {
        #[serde(default)]
        username: String,
    },
    Ping {
        #[serde(default)]
        ts: i64,
    },
    Pong {
        ts: i64,
    },

    // ---- chat ----
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_id: Option<MsgId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<ClientId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        channel_id: ChannelId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<MsgId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_preview: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq_num: Option<u64>,
    },
    EditMessage {
        msg_id: MsgId,
        #[serde(default)]
        message: String,
    },
    MessageEdited {
        msg_id: MsgId,
        message: String,
        ts: i64,
    },
    DeleteMessage {
        msg_id: MsgId,
    },
    MessageDeleted {
        msg_id: MsgId,
    },

    // ---- reactions ----
    AddReaction {
        msg_id: MsgId,
        #[serde(default)]
        emoji: String,
    },
    RemoveReaction {
        msg_id: MsgId,
        #[serde(default)]
        emoji: String,
    },
    GetReactions {
        msg_id: MsgId,
    },
    ReactionAdded {
        msg_id: MsgId,
        id: ClientId,
        emoji: String,
    },
    ReactionRemoved {
        msg_id: MsgId,
        id: ClientId,
        emoji: String,
    },
    ReactionsList {
        msg_id: MsgId,
        reactions: Vec<ReactionEntry>,
    },

    // ---- presence / channels ----
    Typing {
        #[serde(default)]
        channel_id: ChannelId,
    },
    UserTyping {
        id: ClientId,
        username: String,
        channel_id: ChannelId,
    },
    JoinChannel {
        #[serde(default)]
        channel_id: ChannelId,
    },
    UserChannel {
        id: ClientId,
        channel_id: ChannelId,
    },
    CreateChannel {
        #[serde(default)]
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_users: Option<u32>,
    },
    RenameChannel {
        channel_id: ChannelId,
        #[serde(default)]
        name: String,
    },
    DeleteChannel {
        channel_id: ChannelId,
    },
    MoveUser {
        id: ClientId,
        #[serde(default)]
        channel_id: ChannelId,
    },
    ChannelList {
        channels: Vec<ChannelInfo>,
    },
    UserList {
        users: Vec<UserEntry>,
        self_id: ClientId,
        server_name: String,
        owner_id: ClientId,
        api_port: u16,
        ice_servers: Vec<IceServer>,
        channels: Vec<ChannelInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        announcement: Option<String>,
    },
    UserJoined {
        id: ClientId,
        username: String,
        channel_id: ChannelId,
        role: Role,
    },
    UserLeft {
        id: ClientId,
        username: String,
    },
    OwnerChanged {
        id: ClientId,
    },

    // ---- moderation ----
    Kick {
        id: ClientId,
    },
    Kicked {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Ban {
        id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default)]
        ip_ban: bool,
        /// Ban length in seconds; absent means permanent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    Unban {
        #[serde(default)]
        username: String,
    },
    UserBanned {
        id: ClientId,
        username: String,
        reason: String,
    },
    UserUnbanned {
        username: String,
    },
    MuteUser {
        id: ClientId,
        /// Mute length in seconds; absent means until unmuted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    UnmuteUser {
        id: ClientId,
    },
    UserMuted {
        id: ClientId,
        muted: bool,
        /// UTC millis when a timed mute lapses.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mute_expiry: Option<i64>,
    },
    SetRole {
        id: ClientId,
        #[serde(default)]
        role: String,
    },
    RoleChanged {
        id: ClientId,
        role: Role,
    },

    // ---- server administration ----
    Rename {
        #[serde(default)]
        server_name: String,
    },
    ServerInfo {
        server_name: String,
    },
    RenameUser {
        #[serde(default)]
        username: String,
    },
    UserRenamed {
        id: ClientId,
        username: String,
    },
    Announce {
        #[serde(default)]
        message: String,
    },
    Announcement {
        message: String,
    },
    SetSlowMode {
        channel_id: ChannelId,
        #[serde(default)]
        seconds: u32,
    },
    SlowModeSet {
        channel_id: ChannelId,
        seconds: u32,
    },

    // ---- reliability ----
    Nack {
        id: ClientId,
        #[serde(default)]
        seqs: Vec<u16>,
    },
    Replay {
        channel_id: ChannelId,
        #[serde(default)]
        last_seq: u64,
    },

    // ---- search / pins ----
    SearchMessages {
        channel_id: ChannelId,
        #[serde(default)]
        query: String,
        /// Cursor: only results with msg_id below this. 0 means no cursor.
        #[serde(default)]
        before: u64,
        #[serde(default)]
        limit: u32,
    },
    SearchResults {
        channel_id: ChannelId,
        results: Vec<SearchHit>,
    },
    PinMessage {
        msg_id: MsgId,
        channel_id: ChannelId,
    },
    UnpinMessage {
        msg_id: MsgId,
        channel_id: ChannelId,
    },
    GetPinned {
        channel_id: ChannelId,
    },
    MessagePinned {
        msg_id: MsgId,
        channel_id: ChannelId,
        pinned_by: ClientId,
    },
    MessageUnpinned {
        msg_id: MsgId,
        channel_id: ChannelId,
    },
    PinnedList {
        channel_id: ChannelId,
        pins: Vec<PinnedEntry>,
    },

    // ---- link previews ----
    LinkPreview {
        msg_id: MsgId,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },

    // ---- recording ----
    StartRecording {
        channel_id: ChannelId,
    },
    StopRecording {
        channel_id: ChannelId,
    },
    ListRecordings,
    RecordingStarted {
        channel_id: ChannelId,
        file: String,
    },
    RecordingStopped {
        channel_id: ChannelId,
        file: String,
    },
    RecordingsList {
        files: Vec<String>,
    },

    /// Unrecognised `type` values parse here and are dropped silently.
    #[serde(other)]
    Unknown,
}

/// Current wall clock in UTC millis, the timestamp unit on the wire.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

//! Process-wide room registry.
//!
//! One reader/writer lock guards membership, channel metadata, the
//! bounded message stores, reactions, pins, replay rings, and slow-mode
//! rules. Critical sections never touch I/O: control writes go through
//! each client's mpsc outbox, datagram sends happen on snapshots taken
//! after the lock is released, and the hot fan-out path reads the
//! sender's channel and mute state from atomics.

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use lc_control::{
    model::{PinnedMsg, Reaction},
    names::fold,
    BanRecord, ChannelId, ChannelInfo, ClientId, MsgId, PersistedState, Role, StoredMsg,
};
use lc_media::{
    relay::{FanoutAbort, FanoutTarget, RecipientSource},
    CircuitBreaker, DatagramCache, DatagramTx,
};

use crate::bounded::BoundedMap;
use crate::frame;
use crate::limit::RateLimiter;
use crate::protocol::{now_ms, ControlMsg, UserEntry};

/// Replay ring depth per channel.
pub const REPLAY_CAP: usize = 500;

/// Bounded message store capacity.
pub const MSG_STORE_CAP: usize = 10_000;

/// Pins allowed per channel.
pub const MAX_PINS_PER_CHANNEL: usize = 25;

/// Depth of each client's control outbox; a stalled reader loses pushes
/// rather than stalling the room.
pub const OUTBOX_DEPTH: usize = 512;

/// Everything a session hands the room when it registers.
pub struct SessionHandles {
    pub outbox: mpsc::Sender<Bytes>,
    pub voice_tx: Arc<dyn DatagramTx>,
    pub cancel: CancellationToken,
    pub remote_ip: IpAddr,
}

/// One connected client. Fields on the fan-out path (channel, mute) are
/// atomics so broadcasts never take the room lock for them.
pub struct ClientEntry {
    pub id: ClientId,
    username: RwLock<String>,
    role: AtomicU8,
    channel: AtomicU64,
    muted: AtomicBool,
    mute_expiry_ms: AtomicI64,
    outbox: mpsc::Sender<Bytes>,
    pub voice_tx: Arc<dyn DatagramTx>,
    pub cache: DatagramCache,
    pub breaker: Arc<CircuitBreaker>,
    pub cancel: CancellationToken,
    pub remote_ip: IpAddr,
    limiter: Mutex<RateLimiter>,
    last_chat: Mutex<HashMap<ChannelId, Instant>>,
}

impl ClientEntry {
    fn new(id: ClientId, username: String, handles: SessionHandles, rate_limit: u32) -> Self {
        Self {
            id,
            username: RwLock::new(username),
            role: AtomicU8::new(Role::User.level()),
            channel: AtomicU64::new(ChannelId::LOBBY.0),
            muted: AtomicBool::new(false),
            mute_expiry_ms: AtomicI64::new(0),
            outbox: handles.outbox,
            voice_tx: handles.voice_tx,
            cache: DatagramCache::new(),
            breaker: Arc::new(CircuitBreaker::new()),
            cancel: handles.cancel,
            remote_ip: handles.remote_ip,
            limiter: Mutex::new(RateLimiter::new(rate_limit as f32, rate_limit as f32 * 2.0)),
            last_chat: Mutex::new(HashMap::new()),
        }
    }

    pub fn username(&self) -> String {
        self.username.read().clone()
    }

    pub fn role(&self) -> Role {
        Role::from_level(self.role.load(Ordering::Acquire)).unwrap_or(Role::User)
    }

    pub fn set_role(&self, role: Role) {
        self.role.store(role.level(), Ordering::Release);
    }

    pub fn channel_id(&self) -> ChannelId {
        ChannelId(self.channel.load(Ordering::Acquire))
    }

    pub fn set_channel(&self, channel: ChannelId) {
        self.channel.store(channel.0, Ordering::Release);
    }

    pub fn set_muted(&self, muted: bool, expiry_ms: i64) {
        self.mute_expiry_ms.store(expiry_ms, Ordering::Release);
        self.muted.store(muted, Ordering::Release);
    }

    /// Mute as observed on the fan-out path; a lapsed timed mute reads as
    /// unmuted even before the sweeper broadcasts.
    pub fn is_muted_now(&self, now_ms: i64) -> bool {
        if !self.muted.load(Ordering::Acquire) {
            return false;
        }
        let expiry = self.mute_expiry_ms.load(Ordering::Acquire);
        expiry == 0 || expiry > now_ms
    }

    fn mute_lapsed(&self, now_ms: i64) -> bool {
        if !self.muted.load(Ordering::Acquire) {
            return false;
        }
        let expiry = self.mute_expiry_ms.load(Ordering::Acquire);
        expiry != 0 && expiry <= now_ms
    }

    pub fn mute_state(&self) -> (bool, Option<i64>) {
        let muted = self.muted.load(Ordering::Acquire);
        let expiry = self.mute_expiry_ms.load(Ordering::Acquire);
        (muted, (muted && expiry != 0).then_some(expiry))
    }

    /// Enqueue one pre-marshalled line; a full outbox drops the push.
    pub fn send_line(&self, line: Bytes) -> bool {
        self.outbox.try_send(line).is_ok()
    }

    pub fn send_msg(&self, msg: &ControlMsg) -> bool {
        match frame::encode_line(msg) {
            Ok(line) => self.send_line(line),
            Err(e) => {
                warn!(client = %self.id, "control encode failed: {e}");
                false
            }
        }
    }

    /// Control-message rate limit; false means drop silently.
    pub fn check_rate(&self) -> bool {
        self.limiter.lock().check()
    }

    /// Slow-mode gate, one timer per channel per client.
    pub fn allow_chat(&self, channel: ChannelId, slow_secs: u32) -> bool {
        if slow_secs == 0 {
            return true;
        }
        let mut last = self.last_chat.lock();
        let now = Instant::now();
        match last.get(&channel) {
            Some(t) if now.duration_since(*t).as_secs() < u64::from(slow_secs) => false,
            _ => {
                last.insert(channel, now);
                true
            }
        }
    }
}

pub struct JoinOutcome {
    pub client: Arc<ClientEntry>,
    pub evicted: Option<Arc<ClientEntry>>,
    /// Set when evicting the previous owner handed ownership on.
    pub owner_changed_to: Option<ClientId>,
}

pub struct RemovalOutcome {
    pub entry: Arc<ClientEntry>,
    pub owner_changed_to: Option<ClientId>,
}

struct RoomInner {
    clients: HashMap<ClientId, Arc<ClientEntry>>,
    by_name: HashMap<String, ClientId>,
    owner: ClientId,
    server_name: String,
    channels: Vec<ChannelInfo>,
    next_channel_id: u64,
    next_client_id: u16,
    msg_owners: BoundedMap<MsgId, ClientId>,
    msg_store: BoundedMap<MsgId, StoredMsg>,
    reactions: HashMap<MsgId, Vec<Reaction>>,
    pins: Vec<PinnedMsg>,
    channel_seqs: HashMap<ChannelId, u64>,
    replay: HashMap<ChannelId, VecDeque<(u64, Bytes)>>,
    slow_modes: HashMap<ChannelId, u32>,
    announcement: Option<String>,
    bans: Vec<BanRecord>,
}

pub struct Room {
    inner: RwLock<RoomInner>,
    next_msg_id: AtomicU64,
    rate_limit: u32,
}

impl Room {
    pub fn new(persisted: PersistedState, default_server_name: &str, rate_limit: u32) -> Self {
        let mut channels = persisted.channels;
        if channels.is_empty() {
            channels.push(ChannelInfo {
                id: ChannelId(1),
                name: "General".to_string(),
                max_users: None,
            });
        }
        let next_channel_id = channels.iter().map(|c| c.id.0).max().unwrap_or(0) + 1;
        Self {
            inner: RwLock::new(RoomInner {
                clients: HashMap::new(),
                by_name: HashMap::new(),
                owner: ClientId::NONE,
                server_name: persisted
                    .server_name
                    .unwrap_or_else(|| default_server_name.to_string()),
                channels,
                next_channel_id,
                next_client_id: 1,
                msg_owners: BoundedMap::new(MSG_STORE_CAP),
                msg_store: BoundedMap::new(MSG_STORE_CAP),
                reactions: HashMap::new(),
                pins: Vec::new(),
                channel_seqs: HashMap::new(),
                replay: HashMap::new(),
                slow_modes: HashMap::new(),
                announcement: None,
                bans: persisted.bans,
            }),
            next_msg_id: AtomicU64::new(1),
            rate_limit,
        }
    }

    // ---- membership ----

    /// Register a client under a fresh id, atomically evicting any
    /// case-folded duplicate username. The caller cancels the evicted
    /// session and broadcasts its departure.
    pub fn add_or_replace_client(&self, username: &str, handles: SessionHandles) -> JoinOutcome {
        let mut inner = self.inner.write();
        let folded = fold(username);

        let evicted = match inner.by_name.remove(&folded) {
            Some(old_id) => inner.clients.remove(&old_id),
            None => None,
        };

        let id = loop {
            let candidate = inner.next_client_id;
            inner.next_client_id = inner.next_client_id.wrapping_add(1);
            if candidate != 0 && !inner.clients.contains_key(&ClientId(candidate)) {
                break ClientId(candidate);
            }
        };

        let client = Arc::new(ClientEntry::new(
            id,
            username.to_string(),
            handles,
            self.rate_limit,
        ));
        inner.clients.insert(id, client.clone());
        inner.by_name.insert(folded, id);

        let owner_changed_to = match &evicted {
            Some(old) if inner.owner == old.id => transfer_ownership_locked(&mut inner, old.id),
            _ => None,
        };

        JoinOutcome {
            client,
            evicted,
            owner_changed_to,
        }
    }

    /// Idempotent removal with ownership transfer.
    pub fn remove_client(&self, id: ClientId) -> Option<RemovalOutcome> {
        let mut inner = self.inner.write();
        let entry = inner.clients.remove(&id)?;
        let folded = fold(&entry.username());
        if inner.by_name.get(&folded) == Some(&id) {
            inner.by_name.remove(&folded);
        }
        let owner_changed_to = transfer_ownership_locked(&mut inner, id);
        Some(RemovalOutcome {
            entry,
            owner_changed_to,
        })
    }

    /// First joiner claims the empty room.
    pub fn claim_ownership(&self, id: ClientId) -> bool {
        let mut inner = self.inner.write();
        if !inner.owner.is_none() || !inner.clients.contains_key(&id) {
            return false;
        }
        inner.owner = id;
        if let Some(c) = inner.clients.get(&id) {
            c.set_role(Role::Owner);
        }
        true
    }

    pub fn get_client(&self, id: ClientId) -> Option<Arc<ClientEntry>> {
        self.inner.read().clients.get(&id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.inner.read().clients.len()
    }

    pub fn owner_id(&self) -> ClientId {
        self.inner.read().owner
    }

    /// Rename a client, refusing case-folded collisions with anyone else.
    pub fn rename_client(&self, id: ClientId, new_name: &str) -> bool {
        let mut inner = self.inner.write();
        let folded = fold(new_name);
        if matches!(inner.by_name.get(&folded), Some(other) if *other != id) {
            return false;
        }
        let Some(entry) = inner.clients.get(&id).cloned() else {
            return false;
        };
        let old_folded = fold(&entry.username());
        if inner.by_name.get(&old_folded) == Some(&id) {
            inner.by_name.remove(&old_folded);
        }
        inner.by_name.insert(folded, id);
        *entry.username.write() = new_name.to_string();
        true
    }

    pub fn user_list_snapshot(&self) -> Vec<UserEntry> {
        let inner = self.inner.read();
        let mut users: Vec<UserEntry> = inner
            .clients
            .values()
            .map(|c| UserEntry {
                id: c.id,
                username: c.username(),
                channel_id: c.channel_id(),
                role: c.role(),
                muted: c.is_muted_now(now_ms()),
            })
            .collect();
        users.sort_by_key(|u| u.id);
        users
    }

    // ---- control broadcast ----

    /// Marshal once, then push the same bytes to every connected client.
    /// `exclude = ClientId::NONE` sends to all.
    pub fn broadcast_control(&self, msg: &ControlMsg, exclude: ClientId) -> usize {
        let line = match frame::encode_line(msg) {
            Ok(line) => line,
            Err(e) => {
                warn!("broadcast encode failed: {e}");
                return 0;
            }
        };
        let inner = self.inner.read();
        let mut sent = 0;
        for (id, client) in &inner.clients {
            if *id != exclude && client.send_line(line.clone()) {
                sent += 1;
            }
        }
        sent
    }

    /// Broadcast to clients currently in `channel` only.
    pub fn broadcast_to_channel(&self, msg: &ControlMsg, channel: ChannelId) -> usize {
        let line = match frame::encode_line(msg) {
            Ok(line) => line,
            Err(e) => {
                warn!("broadcast encode failed: {e}");
                return 0;
            }
        };
        let inner = self.inner.read();
        let mut sent = 0;
        for client in inner.clients.values() {
            if client.channel_id() == channel && client.send_line(line.clone()) {
                sent += 1;
            }
        }
        sent
    }

    pub fn send_to(&self, id: ClientId, msg: &ControlMsg) -> bool {
        match self.get_client(id) {
            Some(client) => client.send_msg(msg),
            None => false,
        }
    }

    // ---- server metadata ----

    pub fn server_name(&self) -> String {
        self.inner.read().server_name.clone()
    }

    pub fn set_server_name(&self, name: &str) {
        self.inner.write().server_name = name.to_string();
    }

    pub fn announcement(&self) -> Option<String> {
        self.inner.read().announcement.clone()
    }

    pub fn set_announcement(&self, text: &str) {
        self.inner.write().announcement = Some(text.to_string());
    }

    // ---- channels ----

    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.inner.read().channels.clone()
    }

    pub fn channel_info(&self, id: ChannelId) -> Option<ChannelInfo> {
        self.inner.read().channels.iter().find(|c| c.id == id).cloned()
    }

    pub fn create_channel(&self, name: &str, max_users: Option<u32>) -> ChannelInfo {
        let mut inner = self.inner.write();
        let id = ChannelId(inner.next_channel_id);
        inner.next_channel_id += 1;
        let info = ChannelInfo {
            id,
            name: name.to_string(),
            max_users,
        };
        inner.channels.push(info.clone());
        info
    }

    pub fn rename_channel(&self, id: ChannelId, name: &str) -> bool {
        let mut inner = self.inner.write();
        match inner.channels.iter_mut().find(|c| c.id == id) {
            Some(ch) => {
                ch.name = name.to_string();
                true
            }
            None => false,
        }
    }

    /// Delete a channel, moving its occupants to the lobby. Refused when
    /// it is the last channel. Returns the moved clients.
    pub fn delete_channel(&self, id: ChannelId) -> Result<Vec<Arc<ClientEntry>>, &'static str> {
        let mut inner = self.inner.write();
        let Some(pos) = inner.channels.iter().position(|c| c.id == id) else {
            return Err("not found");
        };
        if inner.channels.len() == 1 {
            return Err("cannot delete the last channel");
        }
        inner.channels.remove(pos);
        inner.channel_seqs.remove(&id);
        inner.replay.remove(&id);
        inner.slow_modes.remove(&id);
        inner.pins.retain(|p| p.channel_id != id);

        let moved: Vec<Arc<ClientEntry>> = inner
            .clients
            .values()
            .filter(|c| c.channel_id() == id)
            .cloned()
            .collect();
        for client in &moved {
            client.set_channel(ChannelId::LOBBY);
        }
        Ok(moved)
    }

    /// Move a client into `target` (lobby always allowed), enforcing
    /// `max_users` before the switch.
    pub fn join_channel(&self, client: &ClientEntry, target: ChannelId) -> Result<(), &'static str> {
        let inner = self.inner.write();
        if !target.is_lobby() {
            let Some(info) = inner.channels.iter().find(|c| c.id == target) else {
                return Err("not found");
            };
            if let Some(max) = info.max_users {
                let occupants = inner
                    .clients
                    .values()
                    .filter(|c| c.id != client.id && c.channel_id() == target)
                    .count();
                if occupants >= max as usize {
                    return Err("channel full");
                }
            }
        }
        client.set_channel(target);
        Ok(())
    }

    // ---- chat stores ----

    pub fn next_msg_id(&self) -> MsgId {
        MsgId(self.next_msg_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Record a chat into the bounded owner and content stores. Runs
    /// before the broadcast so moderation always has the message.
    pub fn record_msg(&self, msg_id: MsgId, msg: StoredMsg) {
        let mut inner = self.inner.write();
        inner.msg_owners.insert(msg_id, msg.sender);
        inner.msg_store.insert(msg_id, msg);
    }

    pub fn msg_owner(&self, msg_id: MsgId) -> Option<ClientId> {
        self.inner.read().msg_owners.get(&msg_id).copied()
    }

    pub fn get_msg(&self, msg_id: MsgId) -> Option<StoredMsg> {
        self.inner.read().msg_store.get(&msg_id).cloned()
    }

    pub fn msg_preview(&self, msg_id: MsgId, max_chars: usize) -> Option<String> {
        self.inner
            .read()
            .msg_store
            .get(&msg_id)
            .map(|m| m.preview(max_chars))
    }

    pub fn mark_msg_deleted(&self, msg_id: MsgId) -> bool {
        match self.inner.write().msg_store.get_mut(&msg_id) {
            Some(m) => {
                m.deleted = true;
                true
            }
            None => false,
        }
    }

    pub fn update_msg_content(&self, msg_id: MsgId, text: &str) -> bool {
        match self.inner.write().msg_store.get_mut(&msg_id) {
            Some(m) if !m.deleted => {
                m.text = text.to_string();
                true
            }
            _ => false,
        }
    }

    /// Case-insensitive substring search, newest first, deleted skipped,
    /// paginated by `msg_id < before` (0 means no cursor).
    pub fn search_messages(
        &self,
        channel: ChannelId,
        query: &str,
        before: u64,
        limit: usize,
    ) -> Vec<(MsgId, StoredMsg)> {
        let needle = query.to_lowercase();
        let inner = self.inner.read();
        let mut out = Vec::new();
        for id in inner.msg_store.keys_newest_first() {
            if out.len() >= limit {
                break;
            }
            if before != 0 && id.0 >= before {
                continue;
            }
            let Some(msg) = inner.msg_store.get(id) else {
                continue;
            };
            if msg.deleted || msg.channel_id != channel {
                continue;
            }
            if !needle.is_empty() && !msg.text.to_lowercase().contains(&needle) {
                continue;
            }
            out.push((*id, msg.clone()));
        }
        out
    }

    // ---- reactions ----

    /// Idempotent: false when this (user, emoji) pair already reacted.
    pub fn add_reaction(&self, msg_id: MsgId, user: ClientId, emoji: &str) -> bool {
        let mut inner = self.inner.write();
        let list = inner.reactions.entry(msg_id).or_default();
        if list.iter().any(|r| r.user_id == user && r.emoji == emoji) {
            return false;
        }
        list.push(Reaction {
            user_id: user,
            emoji: emoji.to_string(),
        });
        true
    }

    /// False when no such reaction existed.
    pub fn remove_reaction(&self, msg_id: MsgId, user: ClientId, emoji: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(list) = inner.reactions.get_mut(&msg_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| !(r.user_id == user && r.emoji == emoji));
        list.len() != before
    }

    pub fn reactions_of(&self, msg_id: MsgId) -> Vec<Reaction> {
        self.inner
            .read()
            .reactions
            .get(&msg_id)
            .cloned()
            .unwrap_or_default()
    }

    // ---- pins ----

    /// False if already pinned or the channel is at its pin cap.
    pub fn pin_message(&self, msg_id: MsgId, channel: ChannelId, by: ClientId) -> bool {
        let mut inner = self.inner.write();
        if inner
            .pins
            .iter()
            .any(|p| p.msg_id == msg_id && p.channel_id == channel)
        {
            return false;
        }
        if inner.pins.iter().filter(|p| p.channel_id == channel).count() >= MAX_PINS_PER_CHANNEL {
            return false;
        }
        inner.pins.push(PinnedMsg {
            msg_id,
            channel_id: channel,
            pinned_by: by,
        });
        true
    }

    pub fn unpin_message(&self, msg_id: MsgId, channel: ChannelId) -> bool {
        let mut inner = self.inner.write();
        let before = inner.pins.len();
        inner
            .pins
            .retain(|p| !(p.msg_id == msg_id && p.channel_id == channel));
        inner.pins.len() != before
    }

    pub fn pinned_in(&self, channel: ChannelId) -> Vec<PinnedMsg> {
        self.inner
            .read()
            .pins
            .iter()
            .filter(|p| p.channel_id == channel)
            .cloned()
            .collect()
    }

    // ---- replay ----

    /// Stamp the next per-channel sequence number onto a chat message,
    /// push its marshalled form into the replay ring, and hand the
    /// stamped message back for broadcast.
    pub fn buffer_and_stamp(&self, channel: ChannelId, mut msg: ControlMsg) -> ControlMsg {
        let mut inner = self.inner.write();
        let seq = {
            let counter = inner.channel_seqs.entry(channel).or_insert(0);
            *counter += 1;
            *counter
        };
        if let ControlMsg::Chat { seq_num, .. } = &mut msg {
            *seq_num = Some(seq);
        }
        match frame::encode_line(&msg) {
            Ok(line) => {
                let ring = inner.replay.entry(channel).or_default();
                ring.push_back((seq, line));
                while ring.len() > REPLAY_CAP {
                    ring.pop_front();
                }
            }
            Err(e) => warn!("replay encode failed: {e}"),
        }
        msg
    }

    /// Buffered lines for `channel` with seq_num beyond `last_seq`.
    pub fn messages_since(&self, channel: ChannelId, last_seq: u64) -> Vec<Bytes> {
        self.inner
            .read()
            .replay
            .get(&channel)
            .map(|ring| {
                ring.iter()
                    .filter(|(seq, _)| *seq > last_seq)
                    .map(|(_, line)| line.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    // ---- slow mode ----

    pub fn slow_mode(&self, channel: ChannelId) -> u32 {
        self.inner
            .read()
            .slow_modes
            .get(&channel)
            .copied()
            .unwrap_or(0)
    }

    pub fn set_slow_mode(&self, channel: ChannelId, seconds: u32) {
        let mut inner = self.inner.write();
        if seconds == 0 {
            inner.slow_modes.remove(&channel);
        } else {
            inner.slow_modes.insert(channel, seconds);
        }
    }

    // ---- mutes ----

    /// Clear lapsed timed mutes and return who to announce.
    pub fn expire_mutes(&self, now_ms: i64) -> Vec<ClientId> {
        let inner = self.inner.read();
        let mut expired = Vec::new();
        for client in inner.clients.values() {
            if client.mute_lapsed(now_ms) {
                client.set_muted(false, 0);
                expired.push(client.id);
            }
        }
        expired
    }

    // ---- bans ----

    pub fn add_ban(&self, ban: BanRecord) {
        let mut inner = self.inner.write();
        let folded = fold(&ban.username);
        inner.bans.retain(|b| fold(&b.username) != folded);
        inner.bans.push(ban);
    }

    pub fn remove_ban(&self, username: &str) -> bool {
        let mut inner = self.inner.write();
        let folded = fold(username);
        let before = inner.bans.len();
        inner.bans.retain(|b| fold(&b.username) != folded);
        inner.bans.len() != before
    }

    pub fn is_banned(&self, folded_username: &str, ip: IpAddr) -> bool {
        let now = Utc::now();
        self.inner
            .read()
            .bans
            .iter()
            .any(|b| b.matches(folded_username, ip, now))
    }
}

fn transfer_ownership_locked(inner: &mut RoomInner, leaving: ClientId) -> Option<ClientId> {
    if inner.owner != leaving {
        return None;
    }
    let new_owner = inner
        .clients
        .keys()
        .copied()
        .min()
        .unwrap_or(ClientId::NONE);
    inner.owner = new_owner;
    if let Some(c) = inner.clients.get(&new_owner) {
        c.set_role(Role::Owner);
    }
    Some(new_owner)
}

impl RecipientSource for Room {
    fn fanout_targets(
        &self,
        sender: ClientId,
        out: &mut Vec<FanoutTarget>,
    ) -> Result<ChannelId, FanoutAbort> {
        let inner = self.inner.read();
        let Some(from) = inner.clients.get(&sender) else {
            return Err(FanoutAbort::UnknownSender);
        };
        let channel = from.channel_id();
        if channel.is_lobby() {
            return Err(FanoutAbort::Lobby);
        }
        if from.is_muted_now(now_ms()) {
            return Err(FanoutAbort::Muted);
        }
        for (id, client) in &inner.clients {
            if *id != sender && client.channel_id() == channel {
                out.push(FanoutTarget {
                    id: *id,
                    tx: client.voice_tx.clone(),
                    breaker: client.breaker.clone(),
                });
            }
        }
        Ok(channel)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use anyhow::Result;

    pub struct NullTx;

    #[async_trait::async_trait]
    impl DatagramTx for NullTx {
        async fn send(&self, _data: Bytes) -> Result<()> {
            Ok(())
        }
    }

    pub fn handles() -> (SessionHandles, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(OUTBOX_DEPTH);
        (
            SessionHandles {
                outbox: tx,
                voice_tx: Arc::new(NullTx),
                cancel: CancellationToken::new(),
                remote_ip: "127.0.0.1".parse().unwrap(),
            },
            rx,
        )
    }

    pub fn empty_room() -> Room {
        Room::new(PersistedState::default(), "Test Room", 100)
    }

    pub fn join(room: &Room, name: &str) -> (Arc<ClientEntry>, mpsc::Receiver<Bytes>) {
        let (handles, rx) = handles();
        let outcome = room.add_or_replace_client(name, handles);
        (outcome.client, rx)
    }
}

//! Control-message dispatcher.
//!
//! One entry point per parsed line. Authorization failures and malformed
//! requests are dropped without a reply so nothing about permission state
//! leaks beyond the roles already visible in `user_list`.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use lc_control::{
    names::{validate_name, MAX_CHANNEL_NAME_LEN},
    roles::{allows, Action},
    AuditEntry, BanRecord, ChannelId, ClientId, Role, MAX_NAME_LEN,
};
use lc_media::recorder::MAX_RECORDING;

use crate::preview;
use crate::protocol::{
    now_ms, ControlMsg, PinnedEntry, ReactionEntry, SearchHit, MAX_ANNOUNCE_LEN, MAX_CHAT_LEN,
    MAX_NACK_SEQS, MAX_SLOW_MODE_SECS,
};
use crate::room::ClientEntry;
use crate::state::GatewayCtx;

const MAX_EMOJI_LEN: usize = 64;
const REPLY_PREVIEW_CHARS: usize = 80;
const DEFAULT_SEARCH_LIMIT: u32 = 50;
const MAX_SEARCH_LIMIT: u32 = 100;
const DEFAULT_BAN_REASON: &str = "No reason provided";

fn permitted(client: &ClientEntry, action: Action) -> bool {
    let ok = allows(client.role(), action);
    if !ok {
        debug!(client = %client.id, action = ?action, "dropping unauthorized request");
    }
    ok
}

pub async fn handle(msg: ControlMsg, client: &Arc<ClientEntry>, ctx: &Arc<GatewayCtx>) {
    match msg {
        ControlMsg::Ping { ts } => {
            client.send_msg(&ControlMsg::Pong { ts });
        }

        ControlMsg::Chat {
            message,
            channel_id,
            file_id,
            reply_to,
            ..
        } => handle_chat(client, ctx, message, channel_id, file_id, reply_to).await,

        ControlMsg::EditMessage { msg_id, message } => {
            if ctx.room.msg_owner(msg_id) != Some(client.id) {
                return;
            }
            if message.is_empty() || message.len() > MAX_CHAT_LEN {
                return;
            }
            if ctx.room.update_msg_content(msg_id, &message) {
                ctx.room.broadcast_control(
                    &ControlMsg::MessageEdited {
                        msg_id,
                        message,
                        ts: now_ms(),
                    },
                    ClientId::NONE,
                );
            }
        }

        ControlMsg::DeleteMessage { msg_id } => {
            let own = ctx.room.msg_owner(msg_id) == Some(client.id);
            if !own && !permitted(client, Action::DeleteAnyMessage) {
                return;
            }
            if ctx.room.mark_msg_deleted(msg_id) {
                ctx.room
                    .broadcast_control(&ControlMsg::MessageDeleted { msg_id }, ClientId::NONE);
            }
        }

        ControlMsg::AddReaction { msg_id, emoji } => {
            if emoji.is_empty() || emoji.len() > MAX_EMOJI_LEN {
                return;
            }
            if ctx.room.add_reaction(msg_id, client.id, &emoji) {
                ctx.room.broadcast_control(
                    &ControlMsg::ReactionAdded {
                        msg_id,
                        id: client.id,
                        emoji,
                    },
                    ClientId::NONE,
                );
            }
        }

        ControlMsg::RemoveReaction { msg_id, emoji } => {
            if ctx.room.remove_reaction(msg_id, client.id, &emoji) {
                ctx.room.broadcast_control(
                    &ControlMsg::ReactionRemoved {
                        msg_id,
                        id: client.id,
                        emoji,
                    },
                    ClientId::NONE,
                );
            }
        }

        ControlMsg::GetReactions { msg_id } => {
            let reactions = ctx
                .room
                .reactions_of(msg_id)
                .into_iter()
                .map(|r| ReactionEntry {
                    id: r.user_id,
                    emoji: r.emoji,
                })
                .collect();
            client.send_msg(&ControlMsg::ReactionsList { msg_id, reactions });
        }

        ControlMsg::Typing { channel_id } => {
            if channel_id.is_lobby() {
                return;
            }
            ctx.room.broadcast_control(
                &ControlMsg::UserTyping {
                    id: client.id,
                    username: client.username(),
                    channel_id,
                },
                client.id,
            );
        }

        ControlMsg::JoinChannel { channel_id } => {
            if ctx.room.join_channel(client, channel_id).is_ok() {
                ctx.room.broadcast_control(
                    &ControlMsg::UserChannel {
                        id: client.id,
                        channel_id,
                    },
                    ClientId::NONE,
                );
            }
        }

        ControlMsg::MoveUser { id, channel_id } => {
            if !permitted(client, Action::ManageChannels) {
                return;
            }
            let Some(target) = ctx.room.get_client(id) else {
                return;
            };
            if ctx.room.join_channel(&target, channel_id).is_ok() {
                ctx.room.broadcast_control(
                    &ControlMsg::UserChannel { id, channel_id },
                    ClientId::NONE,
                );
            }
        }

        ControlMsg::CreateChannel { name, max_users } => {
            if !permitted(client, Action::ManageChannels) {
                return;
            }
            let Ok(name) = validate_name(&name, MAX_CHANNEL_NAME_LEN) else {
                return;
            };
            let info = ctx.room.create_channel(name, max_users);
            if let Err(e) = ctx.store.create_channel(&info).await {
                warn!(channel = %info.id, "channel persist failed: {e}");
            }
            broadcast_channel_list(ctx);
        }

        ControlMsg::RenameChannel { channel_id, name } => {
            if !permitted(client, Action::ManageChannels) {
                return;
            }
            let Ok(name) = validate_name(&name, MAX_CHANNEL_NAME_LEN) else {
                return;
            };
            if ctx.room.rename_channel(channel_id, name) {
                if let Err(e) = ctx.store.rename_channel(channel_id, name).await {
                    warn!(channel = %channel_id, "channel rename persist failed: {e}");
                }
                broadcast_channel_list(ctx);
            }
        }

        ControlMsg::DeleteChannel { channel_id } => {
            if !permitted(client, Action::ManageChannels) {
                return;
            }
            match ctx.room.delete_channel(channel_id) {
                Ok(moved) => {
                    if let Err(e) = ctx.store.delete_channel(channel_id).await {
                        warn!(channel = %channel_id, "channel delete persist failed: {e}");
                    }
                    broadcast_channel_list(ctx);
                    for entry in moved {
                        ctx.room.broadcast_control(
                            &ControlMsg::UserChannel {
                                id: entry.id,
                                channel_id: ChannelId::LOBBY,
                            },
                            ClientId::NONE,
                        );
                    }
                }
                Err(reason) => debug!(channel = %channel_id, reason, "channel delete refused"),
            }
        }

        ControlMsg::Kick { id } => {
            if !permitted(client, Action::Kick) || id == client.id {
                return;
            }
            let Some(target) = ctx.room.get_client(id) else {
                return;
            };
            if target.role() == Role::Owner {
                return;
            }
            target.send_msg(&ControlMsg::Kicked { reason: None });
            target.cancel.cancel();
        }

        ControlMsg::Ban {
            id,
            reason,
            ip_ban,
            duration,
        } => handle_ban(client, ctx, id, reason, ip_ban, duration).await,

        ControlMsg::Unban { username } => {
            if !permitted(client, Action::Ban) || username.is_empty() {
                return;
            }
            if ctx.room.remove_ban(&username) {
                if let Err(e) = ctx.store.remove_ban(&username).await {
                    warn!("unban persist failed: {e}");
                }
                let entry = AuditEntry::new(client.username(), "unban", &username, json!({}));
                if let Err(e) = ctx.store.record_audit(&entry).await {
                    warn!("audit write failed: {e}");
                }
                ctx.room
                    .broadcast_control(&ControlMsg::UserUnbanned { username }, ClientId::NONE);
            }
        }

        ControlMsg::MuteUser { id, duration } => {
            if !permitted(client, Action::Mute) || id == client.id {
                return;
            }
            let Some(target) = ctx.room.get_client(id) else {
                return;
            };
            if target.role() == Role::Owner {
                return;
            }
            let expiry = duration.map_or(0, |secs| now_ms() + (secs as i64) * 1000);
            target.set_muted(true, expiry);
            ctx.room.broadcast_control(
                &ControlMsg::UserMuted {
                    id,
                    muted: true,
                    mute_expiry: (expiry != 0).then_some(expiry),
                },
                ClientId::NONE,
            );
        }

        ControlMsg::UnmuteUser { id } => {
            if !permitted(client, Action::Mute) || id == client.id {
                return;
            }
            let Some(target) = ctx.room.get_client(id) else {
                return;
            };
            if target.role() == Role::Owner {
                return;
            }
            target.set_muted(false, 0);
            ctx.room.broadcast_control(
                &ControlMsg::UserMuted {
                    id,
                    muted: false,
                    mute_expiry: None,
                },
                ClientId::NONE,
            );
        }

        ControlMsg::SetRole { id, role } => {
            if !permitted(client, Action::SetRole) || id == client.id {
                return;
            }
            // Only these three are assignable; ownership moves by transfer.
            let Some(role) = Role::parse(&role) else {
                return;
            };
            if role == Role::Owner {
                return;
            }
            let Some(target) = ctx.room.get_client(id) else {
                return;
            };
            if target.role() == Role::Owner {
                return;
            }
            target.set_role(role);
            ctx.room
                .broadcast_control(&ControlMsg::RoleChanged { id, role }, ClientId::NONE);
        }

        ControlMsg::Rename { server_name } => {
            if !permitted(client, Action::ServerSettings) {
                return;
            }
            let Ok(name) = validate_name(&server_name, MAX_NAME_LEN) else {
                return;
            };
            ctx.room.set_server_name(name);
            if let Err(e) = ctx.store.persist_server_name(name).await {
                warn!("server name persist failed: {e}");
            }
            ctx.room.broadcast_control(
                &ControlMsg::ServerInfo {
                    server_name: name.to_string(),
                },
                ClientId::NONE,
            );
        }

        ControlMsg::RenameUser { username } => {
            let Ok(name) = validate_name(&username, MAX_NAME_LEN) else {
                return;
            };
            if ctx.room.rename_client(client.id, name) {
                ctx.room.broadcast_control(
                    &ControlMsg::UserRenamed {
                        id: client.id,
                        username: name.to_string(),
                    },
                    ClientId::NONE,
                );
            }
        }

        ControlMsg::Announce { message } => {
            if !permitted(client, Action::Announce) {
                return;
            }
            if message.is_empty() || message.len() > MAX_ANNOUNCE_LEN {
                return;
            }
            ctx.room.set_announcement(&message);
            ctx.room
                .broadcast_control(&ControlMsg::Announcement { message }, ClientId::NONE);
        }

        ControlMsg::SetSlowMode {
            channel_id,
            seconds,
        } => {
            if !permitted(client, Action::SetSlowMode) || channel_id.is_lobby() {
                return;
            }
            if ctx.room.channel_info(channel_id).is_none() {
                return;
            }
            let seconds = seconds.min(MAX_SLOW_MODE_SECS);
            ctx.room.set_slow_mode(channel_id, seconds);
            ctx.room.broadcast_control(
                &ControlMsg::SlowModeSet {
                    channel_id,
                    seconds,
                },
                ClientId::NONE,
            );
        }

        ControlMsg::Nack { id, seqs } => {
            let Some(sender) = ctx.room.get_client(id) else {
                return;
            };
            // Retransmits stay within the requester's own live channel.
            let channel = client.channel_id();
            if channel.is_lobby() || sender.channel_id() != channel {
                return;
            }
            for seq in seqs.into_iter().take(MAX_NACK_SEQS) {
                if let Some(datagram) = sender.cache.lookup(seq) {
                    let _ = client.voice_tx.send(datagram).await;
                }
            }
        }

        ControlMsg::Replay {
            channel_id,
            last_seq,
        } => {
            if channel_id.is_lobby() {
                return;
            }
            for line in ctx.room.messages_since(channel_id, last_seq) {
                client.send_line(line);
            }
        }

        ControlMsg::SearchMessages {
            channel_id,
            query,
            before,
            limit,
        } => {
            let limit = if limit == 0 {
                DEFAULT_SEARCH_LIMIT
            } else {
                limit.min(MAX_SEARCH_LIMIT)
            };
            let results = ctx
                .room
                .search_messages(channel_id, &query, before, limit as usize)
                .into_iter()
                .map(|(msg_id, m)| SearchHit {
                    msg_id,
                    id: m.sender,
                    username: m.username,
                    message: m.text,
                    channel_id: m.channel_id,
                    ts: m.ts_ms,
                })
                .collect();
            client.send_msg(&ControlMsg::SearchResults {
                channel_id,
                results,
            });
        }

        ControlMsg::PinMessage { msg_id, channel_id } => {
            if !permitted(client, Action::PinMessage) {
                return;
            }
            if ctx.room.get_msg(msg_id).is_none() {
                return;
            }
            if ctx.room.pin_message(msg_id, channel_id, client.id) {
                ctx.room.broadcast_control(
                    &ControlMsg::MessagePinned {
                        msg_id,
                        channel_id,
                        pinned_by: client.id,
                    },
                    ClientId::NONE,
                );
            }
        }

        ControlMsg::UnpinMessage { msg_id, channel_id } => {
            if !permitted(client, Action::PinMessage) {
                return;
            }
            if ctx.room.unpin_message(msg_id, channel_id) {
                ctx.room.broadcast_control(
                    &ControlMsg::MessageUnpinned { msg_id, channel_id },
                    ClientId::NONE,
                );
            }
        }

        ControlMsg::GetPinned { channel_id } => {
            let pins = ctx
                .room
                .pinned_in(channel_id)
                .into_iter()
                .map(|p| PinnedEntry {
                    msg_id: p.msg_id,
                    pinned_by: p.pinned_by,
                    preview: ctx
                        .room
                        .msg_preview(p.msg_id, REPLY_PREVIEW_CHARS)
                        .unwrap_or_default(),
                })
                .collect();
            client.send_msg(&ControlMsg::PinnedList { channel_id, pins });
        }

        ControlMsg::StartRecording { channel_id } => {
            if !permitted(client, Action::ManageRecordings) || channel_id.is_lobby() {
                return;
            }
            if ctx.room.channel_info(channel_id).is_none() {
                return;
            }
            let dir = std::path::Path::new(&ctx.cfg.recordings_dir);
            match ctx.relay.recorders().start(dir, channel_id) {
                Ok(rec) => {
                    ctx.room.broadcast_to_channel(
                        &ControlMsg::RecordingStarted {
                            channel_id,
                            file: rec.file_name().to_string(),
                        },
                        channel_id,
                    );
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(MAX_RECORDING).await;
                        if ctx.relay.recorders().stop_if_current(channel_id, &rec) {
                            ctx.room.broadcast_to_channel(
                                &ControlMsg::RecordingStopped {
                                    channel_id,
                                    file: rec.file_name().to_string(),
                                },
                                channel_id,
                            );
                        }
                    });
                }
                Err(e) => debug!(channel = %channel_id, "recording not started: {e}"),
            }
        }

        ControlMsg::StopRecording { channel_id } => {
            if !permitted(client, Action::ManageRecordings) {
                return;
            }
            if let Some(rec) = ctx.relay.recorders().stop(channel_id) {
                ctx.room.broadcast_to_channel(
                    &ControlMsg::RecordingStopped {
                        channel_id,
                        file: rec.file_name().to_string(),
                    },
                    channel_id,
                );
            }
        }

        ControlMsg::ListRecordings => {
            if !permitted(client, Action::ManageRecordings) {
                return;
            }
            let mut files = Vec::new();
            if let Ok(mut dir) = tokio::fs::read_dir(&ctx.cfg.recordings_dir).await {
                while let Ok(Some(entry)) = dir.next_entry().await {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.ends_with(".ogg") {
                        files.push(name);
                    }
                }
            }
            files.sort();
            client.send_msg(&ControlMsg::RecordingsList { files });
        }

        // A second join on a live session, outbound-only records echoed
        // back by confused clients, and unknown types all fall through.
        _ => {}
    }
}

async fn handle_chat(
    client: &Arc<ClientEntry>,
    ctx: &Arc<GatewayCtx>,
    message: String,
    channel_id: ChannelId,
    file_id: Option<String>,
    reply_to: Option<lc_control::MsgId>,
) {
    if message.is_empty() && file_id.is_none() {
        return;
    }
    if message.len() > MAX_CHAT_LEN {
        return;
    }

    // Slow mode never applies to admins and above.
    let slow = ctx.room.slow_mode(channel_id);
    if slow > 0
        && client.role().level() < Role::Admin.level()
        && !client.allow_chat(channel_id, slow)
    {
        return;
    }

    let msg_id = ctx.room.next_msg_id();
    let ts = now_ms();
    let username = client.username();
    let reply_preview = reply_to.and_then(|r| ctx.room.msg_preview(r, REPLY_PREVIEW_CHARS));

    // Stores are written before any delivery.
    ctx.room.record_msg(
        msg_id,
        lc_control::StoredMsg {
            sender: client.id,
            username: username.clone(),
            text: message.clone(),
            channel_id,
            ts_ms: ts,
            deleted: false,
        },
    );

    let outbound = ControlMsg::Chat {
        msg_id: Some(msg_id),
        id: Some(client.id),
        username: Some(username),
        message: message.clone(),
        channel_id,
        file_id,
        reply_to,
        reply_preview,
        ts: Some(ts),
        seq_num: None,
    };
    let outbound = ctx.room.buffer_and_stamp(channel_id, outbound);
    ctx.room.broadcast_control(&outbound, ClientId::NONE);

    if let Some(url) = preview::find_url(&message) {
        let url = url.to_string();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Some(p) = preview::fetch_preview(&ctx.http, &url).await {
                ctx.room.broadcast_control(
                    &ControlMsg::LinkPreview {
                        msg_id,
                        url,
                        title: p.title,
                        description: p.description,
                        image: p.image,
                    },
                    ClientId::NONE,
                );
            }
        });
    }
}

async fn handle_ban(
    client: &Arc<ClientEntry>,
    ctx: &Arc<GatewayCtx>,
    id: ClientId,
    reason: Option<String>,
    ip_ban: bool,
    duration: Option<u64>,
) {
    if !permitted(client, Action::Ban) {
        return;
    }
    let Some(target) = ctx.room.get_client(id) else {
        return;
    };
    if target.role() == Role::Owner {
        return;
    }

    let username = target.username();
    let reason = reason
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_BAN_REASON.to_string());
    let ban = BanRecord {
        username: username.clone(),
        ip: ip_ban.then_some(target.remote_ip),
        reason: reason.clone(),
        banned_by: client.username(),
        expires_at: duration
            .map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs as i64)),
    };

    ctx.room.add_ban(ban.clone());
    if let Err(e) = ctx.store.record_ban(&ban).await {
        warn!("ban persist failed: {e}");
    }
    let entry = AuditEntry::new(
        client.username(),
        "ban",
        &username,
        json!({ "reason": reason, "ip_ban": ip_ban, "duration": duration }),
    );
    if let Err(e) = ctx.store.record_audit(&entry).await {
        warn!("audit write failed: {e}");
    }

    ctx.room.broadcast_control(
        &ControlMsg::UserBanned {
            id,
            username,
            reason: reason.clone(),
        },
        ClientId::NONE,
    );
    target.send_msg(&ControlMsg::Kicked {
        reason: Some(reason),
    });
    target.cancel.cancel();
}

fn broadcast_channel_list(ctx: &GatewayCtx) {
    ctx.room.broadcast_control(
        &ControlMsg::ChannelList {
            channels: ctx.room.channels(),
        },
        ClientId::NONE,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::room::test_support::{handles, join};
    use crate::room::{Room, SessionHandles};
    use anyhow::Result;
    use bytes::Bytes;
    use clap::Parser;
    use dashmap::DashMap;
    use lc_control::{MsgId, PersistedState};
    use lc_media::{DatagramTx, NoopRelayMetrics, RecorderRegistry, VoiceRelay};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn test_ctx() -> Arc<GatewayCtx> {
        let room = Arc::new(Room::new(PersistedState::default(), "Test Room", 1000));
        let relay = Arc::new(VoiceRelay::new(
            room.clone(),
            Arc::new(RecorderRegistry::new()),
            Arc::new(NoopRelayMetrics),
        ));
        Arc::new(GatewayCtx {
            room: room.clone(),
            relay,
            store: Arc::new(lc_control::NullStore),
            cfg: Arc::new(Config::parse_from(["lc-gateway"])),
            http: preview::build_client(),
            per_ip: DashMap::new(),
            metrics: lc_metrics::ControlMetrics::new("lc_test"),
        })
    }

    fn recv(rx: &mut mpsc::Receiver<Bytes>) -> Option<ControlMsg> {
        rx.try_recv()
            .ok()
            .map(|line| serde_json::from_slice(&line).unwrap())
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) {
        while rx.try_recv().is_ok() {}
    }

    fn chat(message: &str, channel: ChannelId) -> ControlMsg {
        ControlMsg::Chat {
            msg_id: None,
            id: None,
            username: None,
            message: message.to_string(),
            channel_id: channel,
            file_id: None,
            reply_to: None,
            reply_preview: None,
            ts: None,
            seq_num: None,
        }
    }

    #[tokio::test]
    async fn ping_answers_directly_without_broadcast() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");
        let (_bob, mut rx_b) = join(&ctx.room, "bob");

        handle(ControlMsg::Ping { ts: 1234 }, &alice, &ctx).await;
        assert!(matches!(recv(&mut rx_a), Some(ControlMsg::Pong { ts: 1234 })));
        assert!(recv(&mut rx_b).is_none());
    }

    #[tokio::test]
    async fn chat_is_stamped_stored_and_delivered_to_all() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");
        let (_bob, mut rx_b) = join(&ctx.room, "bob");

        // Spoofed identity fields on the inbound message are discarded.
        let inbound = ControlMsg::Chat {
            msg_id: Some(MsgId(999)),
            id: Some(ClientId(999)),
            username: Some("mallory".into()),
            message: "hello".into(),
            channel_id: ChannelId(2),
            file_id: None,
            reply_to: None,
            reply_preview: None,
            ts: None,
            seq_num: None,
        };
        handle(inbound, &alice, &ctx).await;

        for rx in [&mut rx_a, &mut rx_b] {
            let Some(ControlMsg::Chat {
                msg_id,
                id,
                username,
                message,
                channel_id,
                ts,
                seq_num,
                ..
            }) = recv(rx)
            else {
                panic!("expected chat");
            };
            assert_eq!(id, Some(alice.id));
            assert_eq!(username.as_deref(), Some("alice"));
            assert_eq!(message, "hello");
            // Cross-channel chat is allowed; channel_id passes through.
            assert_eq!(channel_id, ChannelId(2));
            assert_eq!(seq_num, Some(1));
            assert!(ts.is_some());
            assert_eq!(msg_id, Some(MsgId(1)));
        }
        assert_eq!(ctx.room.msg_owner(MsgId(1)), Some(alice.id));
        assert_eq!(ctx.room.get_msg(MsgId(1)).unwrap().text, "hello");
    }

    #[tokio::test]
    async fn chat_length_boundaries() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");

        handle(chat(&"x".repeat(MAX_CHAT_LEN), ChannelId(1)), &alice, &ctx).await;
        assert!(recv(&mut rx_a).is_some());

        handle(chat(&"x".repeat(MAX_CHAT_LEN + 1), ChannelId(1)), &alice, &ctx).await;
        assert!(recv(&mut rx_a).is_none());

        // Empty without a file is rejected; empty with one goes through.
        handle(chat("", ChannelId(1)), &alice, &ctx).await;
        assert!(recv(&mut rx_a).is_none());
        handle(
            ControlMsg::Chat {
                msg_id: None,
                id: None,
                username: None,
                message: String::new(),
                channel_id: ChannelId(1),
                file_id: Some("blob-1".into()),
                reply_to: None,
                reply_preview: None,
                ts: None,
                seq_num: None,
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(recv(&mut rx_a).is_some());
    }

    #[tokio::test]
    async fn muted_sender_still_chats() {
        let ctx = test_ctx();
        let (alice, _rx_a) = join(&ctx.room, "alice");
        let (_bob, mut rx_b) = join(&ctx.room, "bob");
        alice.set_muted(true, 0);

        handle(chat("still here", ChannelId(1)), &alice, &ctx).await;
        assert!(matches!(recv(&mut rx_b), Some(ControlMsg::Chat { .. })));
    }

    #[tokio::test]
    async fn edit_is_owner_of_message_only() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");
        let (bob, _rx_b) = join(&ctx.room, "bob");

        handle(chat("original", ChannelId(1)), &alice, &ctx).await;
        drain(&mut rx_a);

        handle(
            ControlMsg::EditMessage {
                msg_id: MsgId(1),
                message: "bob's edit".into(),
            },
            &bob,
            &ctx,
        )
        .await;
        assert!(recv(&mut rx_a).is_none());
        assert_eq!(ctx.room.get_msg(MsgId(1)).unwrap().text, "original");

        handle(
            ControlMsg::EditMessage {
                msg_id: MsgId(1),
                message: "fixed".into(),
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(matches!(
            recv(&mut rx_a),
            Some(ControlMsg::MessageEdited { msg_id: MsgId(1), .. })
        ));
        assert_eq!(ctx.room.get_msg(MsgId(1)).unwrap().text, "fixed");
    }

    #[tokio::test]
    async fn delete_allows_author_and_moderators() {
        let ctx = test_ctx();
        let (alice, _rx_a) = join(&ctx.room, "alice");
        let (bob, mut rx_b) = join(&ctx.room, "bob");
        let (carol, _rx_c) = join(&ctx.room, "carol");

        handle(chat("one", ChannelId(1)), &alice, &ctx).await;
        handle(chat("two", ChannelId(1)), &alice, &ctx).await;
        drain(&mut rx_b);

        // A plain user cannot delete someone else's message.
        handle(ControlMsg::DeleteMessage { msg_id: MsgId(1) }, &carol, &ctx).await;
        assert!(recv(&mut rx_b).is_none());

        carol.set_role(Role::Moderator);
        handle(ControlMsg::DeleteMessage { msg_id: MsgId(1) }, &carol, &ctx).await;
        assert!(matches!(
            recv(&mut rx_b),
            Some(ControlMsg::MessageDeleted { msg_id: MsgId(1) })
        ));
        // The store keeps a deleted stub for reply previews.
        assert_eq!(
            ctx.room.msg_preview(MsgId(1), 20).as_deref(),
            Some("[deleted]")
        );

        // Authors can always delete their own.
        handle(ControlMsg::DeleteMessage { msg_id: MsgId(2) }, &alice, &ctx).await;
        assert!(matches!(
            recv(&mut rx_b),
            Some(ControlMsg::MessageDeleted { msg_id: MsgId(2) })
        ));
    }

    #[tokio::test]
    async fn reactions_broadcast_only_on_change() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");

        handle(
            ControlMsg::AddReaction {
                msg_id: MsgId(1),
                emoji: "👍".into(),
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(matches!(recv(&mut rx_a), Some(ControlMsg::ReactionAdded { .. })));

        handle(
            ControlMsg::AddReaction {
                msg_id: MsgId(1),
                emoji: "👍".into(),
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(recv(&mut rx_a).is_none());

        handle(
            ControlMsg::RemoveReaction {
                msg_id: MsgId(1),
                emoji: "🔥".into(),
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(recv(&mut rx_a).is_none());

        handle(
            ControlMsg::RemoveReaction {
                msg_id: MsgId(1),
                emoji: "👍".into(),
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(matches!(
            recv(&mut rx_a),
            Some(ControlMsg::ReactionRemoved { .. })
        ));
    }

    #[tokio::test]
    async fn typing_skips_sender_and_lobby() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");
        let (_bob, mut rx_b) = join(&ctx.room, "bob");

        handle(ControlMsg::Typing { channel_id: ChannelId::LOBBY }, &alice, &ctx).await;
        assert!(recv(&mut rx_b).is_none());

        handle(ControlMsg::Typing { channel_id: ChannelId(1) }, &alice, &ctx).await;
        assert!(recv(&mut rx_a).is_none());
        assert!(matches!(
            recv(&mut rx_b),
            Some(ControlMsg::UserTyping { channel_id: ChannelId(1), .. })
        ));
    }

    #[tokio::test]
    async fn join_channel_announces_to_everyone() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");

        handle(ControlMsg::JoinChannel { channel_id: ChannelId(1) }, &alice, &ctx).await;
        assert_eq!(alice.channel_id(), ChannelId(1));
        assert!(matches!(
            recv(&mut rx_a),
            Some(ControlMsg::UserChannel { channel_id: ChannelId(1), .. })
        ));

        // Unknown channels are silently refused.
        handle(ControlMsg::JoinChannel { channel_id: ChannelId(77) }, &alice, &ctx).await;
        assert_eq!(alice.channel_id(), ChannelId(1));
        assert!(recv(&mut rx_a).is_none());
    }

    #[tokio::test]
    async fn delete_channel_sends_channel_list_before_user_channel() {
        let ctx = test_ctx();
        let (alice, _rx_a) = join(&ctx.room, "alice");
        ctx.room.claim_ownership(alice.id);
        let (bob, mut rx_b) = join(&ctx.room, "bob");

        handle(
            ControlMsg::CreateChannel {
                name: "g".into(),
                max_users: None,
            },
            &alice,
            &ctx,
        )
        .await;
        handle(ControlMsg::JoinChannel { channel_id: ChannelId(1) }, &bob, &ctx).await;
        drain(&mut rx_b);

        handle(ControlMsg::DeleteChannel { channel_id: ChannelId(1) }, &alice, &ctx).await;

        let Some(ControlMsg::ChannelList { channels }) = recv(&mut rx_b) else {
            panic!("expected channel_list first");
        };
        assert!(channels.iter().all(|c| c.id != ChannelId(1)));
        let Some(ControlMsg::UserChannel { id, channel_id }) = recv(&mut rx_b) else {
            panic!("expected user_channel second");
        };
        assert_eq!(id, bob.id);
        assert!(channel_id.is_lobby());
        assert!(bob.channel_id().is_lobby());
    }

    #[tokio::test]
    async fn channel_crud_requires_privilege() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");

        handle(
            ControlMsg::CreateChannel {
                name: "nope".into(),
                max_users: None,
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(recv(&mut rx_a).is_none());
        assert_eq!(ctx.room.channels().len(), 1);
    }

    #[tokio::test]
    async fn kick_respects_hierarchy_and_cancels_target() {
        let ctx = test_ctx();
        let (alice, _rx_a) = join(&ctx.room, "alice");
        ctx.room.claim_ownership(alice.id);
        let (bob, mut rx_b) = join(&ctx.room, "bob");

        // Bob cannot kick, and nobody kicks the owner or themselves.
        handle(ControlMsg::Kick { id: alice.id }, &bob, &ctx).await;
        assert!(!alice.cancel.is_cancelled());
        bob.set_role(Role::Moderator);
        handle(ControlMsg::Kick { id: alice.id }, &bob, &ctx).await;
        assert!(!alice.cancel.is_cancelled());
        handle(ControlMsg::Kick { id: alice.id }, &alice, &ctx).await;
        assert!(!alice.cancel.is_cancelled());

        handle(ControlMsg::Kick { id: bob.id }, &alice, &ctx).await;
        assert!(matches!(recv(&mut rx_b), Some(ControlMsg::Kicked { .. })));
        assert!(bob.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn ban_defaults_reason_and_disconnects() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");
        alice.set_role(Role::Admin);
        let (bob, _rx_b) = join(&ctx.room, "bob");

        handle(
            ControlMsg::Ban {
                id: bob.id,
                reason: None,
                ip_ban: true,
                duration: None,
            },
            &alice,
            &ctx,
        )
        .await;

        let Some(ControlMsg::UserBanned { username, reason, .. }) = recv(&mut rx_a) else {
            panic!("expected user_banned");
        };
        assert_eq!(username, "bob");
        assert_eq!(reason, DEFAULT_BAN_REASON);
        assert!(bob.cancel.is_cancelled());
        assert!(ctx.room.is_banned("bob", "127.0.0.1".parse().unwrap()));
        // The IP ban matches any name from that address.
        assert!(ctx.room.is_banned("other", bob.remote_ip));
    }

    #[tokio::test]
    async fn mute_and_sweeperless_expiry() {
        let ctx = test_ctx();
        let (alice, _rx_a) = join(&ctx.room, "alice");
        alice.set_role(Role::Admin);
        let (bob, mut rx_b) = join(&ctx.room, "bob");

        handle(
            ControlMsg::MuteUser {
                id: bob.id,
                duration: Some(60),
            },
            &alice,
            &ctx,
        )
        .await;
        let Some(ControlMsg::UserMuted {
            muted: true,
            mute_expiry: Some(expiry),
            ..
        }) = recv(&mut rx_b)
        else {
            panic!("expected timed user_muted");
        };
        assert!(expiry > now_ms());
        assert!(bob.is_muted_now(now_ms()));

        handle(ControlMsg::UnmuteUser { id: bob.id }, &alice, &ctx).await;
        assert!(matches!(
            recv(&mut rx_b),
            Some(ControlMsg::UserMuted { muted: false, .. })
        ));
        assert!(!bob.is_muted_now(now_ms()));
    }

    #[tokio::test]
    async fn set_role_owner_rules() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");
        ctx.room.claim_ownership(alice.id);
        let (bob, _rx_b) = join(&ctx.room, "bob");

        // Owner role is never assignable.
        handle(
            ControlMsg::SetRole {
                id: bob.id,
                role: "owner".into(),
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(recv(&mut rx_a).is_none());
        assert_eq!(bob.role(), Role::User);

        // Self-targeting is refused.
        handle(
            ControlMsg::SetRole {
                id: alice.id,
                role: "admin".into(),
            },
            &alice,
            &ctx,
        )
        .await;
        assert_eq!(alice.role(), Role::Owner);

        handle(
            ControlMsg::SetRole {
                id: bob.id,
                role: "moderator".into(),
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(matches!(
            recv(&mut rx_a),
            Some(ControlMsg::RoleChanged { role: Role::Moderator, .. })
        ));
        assert_eq!(bob.role(), Role::Moderator);
    }

    #[tokio::test]
    async fn slow_mode_limits_users_but_not_admins() {
        let ctx = test_ctx();
        let (alice, _rx_a) = join(&ctx.room, "alice");
        ctx.room.claim_ownership(alice.id);
        let (bob, mut rx_b) = join(&ctx.room, "bob");

        handle(
            ControlMsg::SetSlowMode {
                channel_id: ChannelId(1),
                seconds: 30,
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(matches!(
            recv(&mut rx_b),
            Some(ControlMsg::SlowModeSet { seconds: 30, .. })
        ));

        handle(chat("first", ChannelId(1)), &bob, &ctx).await;
        assert!(matches!(recv(&mut rx_b), Some(ControlMsg::Chat { .. })));
        handle(chat("too soon", ChannelId(1)), &bob, &ctx).await;
        assert!(recv(&mut rx_b).is_none());

        // Admins and the owner bypass slow mode.
        handle(chat("one", ChannelId(1)), &alice, &ctx).await;
        handle(chat("two", ChannelId(1)), &alice, &ctx).await;
        assert!(matches!(recv(&mut rx_b), Some(ControlMsg::Chat { .. })));
        assert!(matches!(recv(&mut rx_b), Some(ControlMsg::Chat { .. })));

        // Values clamp into [0, 3600].
        handle(
            ControlMsg::SetSlowMode {
                channel_id: ChannelId(1),
                seconds: 50_000,
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(matches!(
            recv(&mut rx_b),
            Some(ControlMsg::SlowModeSet { seconds: MAX_SLOW_MODE_SECS, .. })
        ));
    }

    #[tokio::test]
    async fn announce_is_owner_gated_and_replaces() {
        let ctx = test_ctx();
        let (alice, _rx_a) = join(&ctx.room, "alice");
        let (bob, mut rx_b) = join(&ctx.room, "bob");

        handle(ControlMsg::Announce { message: "hi".into() }, &bob, &ctx).await;
        assert!(recv(&mut rx_b).is_none());

        ctx.room.claim_ownership(alice.id);
        handle(ControlMsg::Announce { message: "lan party".into() }, &alice, &ctx).await;
        assert!(matches!(recv(&mut rx_b), Some(ControlMsg::Announcement { .. })));
        handle(ControlMsg::Announce { message: "moved rooms".into() }, &alice, &ctx).await;
        assert_eq!(ctx.room.announcement().as_deref(), Some("moved rooms"));
    }

    struct SinkTx {
        sent: Mutex<Vec<Bytes>>,
    }

    #[async_trait::async_trait]
    impl DatagramTx for SinkTx {
        async fn send(&self, data: Bytes) -> Result<()> {
            self.sent.lock().push(data);
            Ok(())
        }
    }

    #[tokio::test]
    async fn nack_retransmits_within_channel_only() {
        let ctx = test_ctx();
        let (alice, _rx_a) = join(&ctx.room, "alice");

        let sink = Arc::new(SinkTx {
            sent: Mutex::new(Vec::new()),
        });
        let (h, _rx) = handles();
        let outcome = ctx.room.add_or_replace_client(
            "bob",
            SessionHandles {
                voice_tx: sink.clone(),
                ..h
            },
        );
        let bob = outcome.client;

        // Alice's cached datagrams, already stamped.
        for seq in 0..5u16 {
            alice
                .cache
                .insert(seq, Bytes::from(lc_voice::datagram::encode(alice.id.0, seq, b"pcm")));
        }

        // Different channels: nothing flows.
        handle(
            ControlMsg::Nack {
                id: alice.id,
                seqs: vec![1, 2],
            },
            &bob,
            &ctx,
        )
        .await;
        assert!(sink.sent.lock().is_empty());

        ctx.room.join_channel(&alice, ChannelId(1)).unwrap();
        ctx.room.join_channel(&bob, ChannelId(1)).unwrap();
        handle(
            ControlMsg::Nack {
                id: alice.id,
                seqs: vec![1, 3, 200],
            },
            &bob,
            &ctx,
        )
        .await;
        let sent = sink.sent.lock();
        // Seq 200 was never cached; the two hits arrive as cached bytes.
        assert_eq!(sent.len(), 2);
        let (hdr, payload) = lc_voice::parse(&sent[0]).unwrap();
        assert_eq!(hdr.sender, alice.id.0);
        assert_eq!(payload, b"pcm");
    }

    #[tokio::test]
    async fn replay_fills_gaps_per_channel() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");

        for i in 0..5 {
            handle(chat(&format!("m{i}"), ChannelId(1)), &alice, &ctx).await;
        }
        drain(&mut rx_a);

        handle(
            ControlMsg::Replay {
                channel_id: ChannelId(1),
                last_seq: 3,
            },
            &alice,
            &ctx,
        )
        .await;
        let mut seqs = Vec::new();
        while let Some(ControlMsg::Chat { seq_num, .. }) = recv(&mut rx_a) {
            seqs.push(seq_num.unwrap());
        }
        assert_eq!(seqs, vec![4, 5]);

        // The lobby has no replay.
        handle(
            ControlMsg::Replay {
                channel_id: ChannelId::LOBBY,
                last_seq: 0,
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(recv(&mut rx_a).is_none());
    }

    #[tokio::test]
    async fn search_returns_matches_newest_first() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");
        for word in ["apple pie", "banana split", "apple cake"] {
            handle(chat(word, ChannelId(1)), &alice, &ctx).await;
        }
        drain(&mut rx_a);

        handle(
            ControlMsg::SearchMessages {
                channel_id: ChannelId(1),
                query: "APPLE".into(),
                before: 0,
                limit: 0,
            },
            &alice,
            &ctx,
        )
        .await;
        let Some(ControlMsg::SearchResults { results, .. }) = recv(&mut rx_a) else {
            panic!("expected search_results");
        };
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].message, "apple cake");
        assert_eq!(results[1].message, "apple pie");
    }

    #[tokio::test]
    async fn pins_gate_on_role_and_existence() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");
        handle(chat("pin me", ChannelId(1)), &alice, &ctx).await;
        drain(&mut rx_a);

        handle(
            ControlMsg::PinMessage {
                msg_id: MsgId(1),
                channel_id: ChannelId(1),
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(recv(&mut rx_a).is_none());

        alice.set_role(Role::Moderator);
        // Unknown messages cannot be pinned.
        handle(
            ControlMsg::PinMessage {
                msg_id: MsgId(42),
                channel_id: ChannelId(1),
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(recv(&mut rx_a).is_none());

        handle(
            ControlMsg::PinMessage {
                msg_id: MsgId(1),
                channel_id: ChannelId(1),
            },
            &alice,
            &ctx,
        )
        .await;
        assert!(matches!(recv(&mut rx_a), Some(ControlMsg::MessagePinned { .. })));

        handle(ControlMsg::GetPinned { channel_id: ChannelId(1) }, &alice, &ctx).await;
        let Some(ControlMsg::PinnedList { pins, .. }) = recv(&mut rx_a) else {
            panic!("expected pinned_list");
        };
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].preview, "pin me");
    }

    #[tokio::test]
    async fn rename_user_validates_and_broadcasts() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");
        let (_bob, _rx_b) = join(&ctx.room, "bob");

        handle(ControlMsg::RenameUser { username: "  BOB ".into() }, &alice, &ctx).await;
        assert!(recv(&mut rx_a).is_none());
        assert_eq!(alice.username(), "alice");

        handle(ControlMsg::RenameUser { username: " alicia ".into() }, &alice, &ctx).await;
        let Some(ControlMsg::UserRenamed { username, .. }) = recv(&mut rx_a) else {
            panic!("expected user_renamed");
        };
        assert_eq!(username, "alicia");
    }

    #[tokio::test]
    async fn unknown_messages_are_ignored() {
        let ctx = test_ctx();
        let (alice, mut rx_a) = join(&ctx.room, "alice");
        handle(ControlMsg::Unknown, &alice, &ctx).await;
        // Outbound-only types from a confused client are ignored too.
        handle(ControlMsg::Pong { ts: 5 }, &alice, &ctx).await;
        assert!(recv(&mut rx_a).is_none());
    }
}

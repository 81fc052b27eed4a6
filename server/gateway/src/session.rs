//! Per-connection session runner.
//!
//! Lifecycle: accept the control stream, require a `join` as the first
//! line, register with the room, then run the control loop while a
//! sibling task pumps datagrams into the relay. Teardown is funnelled
//! through one path and is idempotent against the room.

use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{timeout, Duration},
};
use tracing::{debug, info};

use lc_control::{names::fold, validate_name, ClientId, MAX_NAME_LEN};

use crate::frame::{self, LineReader};
use crate::protocol::ControlMsg;
use crate::room::{ClientEntry, SessionHandles, OUTBOX_DEPTH};
use crate::state::{GatewayCtx, QuinnDatagramTx};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Application close codes; clients treat every refusal the same way.
const CLOSE_REFUSED: u32 = 1;

pub async fn run_connection(ctx: Arc<GatewayCtx>, incoming: quinn::Incoming) -> Result<()> {
    let conn = incoming.await.context("accept quic connection")?;

    let negotiated = conn
        .handshake_data()
        .and_then(|d| d.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
        .and_then(|d| d.protocol);
    if negotiated.as_deref() != Some(ctx.cfg.alpn.as_bytes()) {
        return Err(anyhow!(
            "ALPN mismatch: got {:?}, want {:?}",
            negotiated,
            ctx.cfg.alpn
        ));
    }

    let remote = conn.remote_address();
    let ip = remote.ip();
    debug!(%remote, "connected");

    let (send, recv) = timeout(HANDSHAKE_TIMEOUT, conn.accept_bi())
        .await
        .context("control accept_bi timeout")?
        .context("accept_bi failed")?;
    let mut reader = LineReader::new(recv);

    // The first line must be a join; anything else closes unregistered.
    let first = timeout(HANDSHAKE_TIMEOUT, reader.next_line())
        .await
        .context("join timeout")??
        .ok_or_else(|| anyhow!("stream closed before join"))?;
    let username = match serde_json::from_slice::<ControlMsg>(&first) {
        Ok(ControlMsg::Join { username }) => username,
        Ok(_) => {
            conn.close(CLOSE_REFUSED.into(), b"expected join");
            return Err(anyhow!("first message was not a join"));
        }
        Err(e) => {
            conn.close(CLOSE_REFUSED.into(), b"malformed join");
            return Err(anyhow!("malformed join: {e}"));
        }
    };
    let username = match validate_name(&username, MAX_NAME_LEN) {
        Ok(name) => name.to_string(),
        Err(e) => {
            conn.close(CLOSE_REFUSED.into(), b"invalid name");
            return Err(anyhow!("invalid username: {e}"));
        }
    };

    // Admission control happens before registration; refusals are
    // deliberately non-specific.
    if ctx.room.is_banned(&fold(&username), ip) {
        conn.close(CLOSE_REFUSED.into(), b"refused");
        return Err(anyhow!("banned client refused"));
    }
    if ctx.room.client_count() >= ctx.cfg.max_connections {
        conn.close(CLOSE_REFUSED.into(), b"refused");
        return Err(anyhow!("connection limit reached"));
    }
    {
        let mut count = ctx.per_ip.entry(ip).or_insert(0);
        if *count >= ctx.cfg.per_ip_limit {
            drop(count);
            conn.close(CLOSE_REFUSED.into(), b"refused");
            return Err(anyhow!("per-ip limit reached for {ip}"));
        }
        *count += 1;
    }
    let ip_guard = scopeguard::guard((ctx.clone(), ip), |(ctx, ip)| {
        if let Some(mut count) = ctx.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
    });

    // Single writer task owns the SendStream; everything else enqueues.
    let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_DEPTH);
    tokio::spawn(frame::run_writer(send, outbox_rx));

    let handles = SessionHandles {
        outbox: outbox_tx,
        voice_tx: Arc::new(QuinnDatagramTx { conn: conn.clone() }),
        cancel: tokio_util::sync::CancellationToken::new(),
        remote_ip: ip,
    };
    let outcome = ctx.room.add_or_replace_client(&username, handles);
    let client = outcome.client.clone();
    ctx.metrics.session_opened();
    info!(%remote, id = %client.id, username = %username, "registered");

    // The replaced session is told to close via its cancel handle; its
    // own teardown finds the room entry already gone, so the departure
    // is announced here.
    if let Some(old) = outcome.evicted {
        old.cancel.cancel();
        ctx.room.broadcast_control(
            &ControlMsg::UserLeft {
                id: old.id,
                username: old.username(),
            },
            ClientId::NONE,
        );
        if let Some(new_owner) = outcome.owner_changed_to {
            ctx.room
                .broadcast_control(&ControlMsg::OwnerChanged { id: new_owner }, ClientId::NONE);
        }
    }

    client.send_msg(&ControlMsg::UserList {
        users: ctx.room.user_list_snapshot(),
        self_id: client.id,
        server_name: ctx.room.server_name(),
        owner_id: ctx.room.owner_id(),
        api_port: ctx.cfg.api_port(),
        ice_servers: ctx.cfg.ice_servers(),
        channels: ctx.room.channels(),
        announcement: ctx.room.announcement(),
    });
    client.send_msg(&ControlMsg::ChannelList {
        channels: ctx.room.channels(),
    });
    ctx.room.broadcast_control(
        &ControlMsg::UserJoined {
            id: client.id,
            username: client.username(),
            channel_id: client.channel_id(),
            role: client.role(),
        },
        client.id,
    );
    if ctx.room.owner_id().is_none() && ctx.room.claim_ownership(client.id) {
        ctx.room
            .broadcast_control(&ControlMsg::OwnerChanged { id: client.id }, ClientId::NONE);
    }

    spawn_datagram_reader(ctx.clone(), conn.clone(), client.clone());

    // Control loop. Exits on stream error, EOF, or cancellation
    // (kick, ban, duplicate eviction, shutdown).
    loop {
        tokio::select! {
            _ = client.cancel.cancelled() => break,
            line = reader.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(id = %client.id, "control read failed: {e:#}");
                        break;
                    }
                };
                if !client.check_rate() {
                    ctx.metrics.dropped_line("rate_limited");
                    continue;
                }
                match serde_json::from_slice::<ControlMsg>(&line) {
                    Ok(msg) => crate::dispatch::handle(msg, &client, &ctx).await,
                    Err(e) => {
                        ctx.metrics.dropped_line("malformed");
                        info!(id = %client.id, "dropping malformed control line: {e}");
                    }
                }
            }
        }
    }

    teardown(&ctx, &client);
    conn.close(0u32.into(), b"bye");
    ctx.metrics.session_closed();
    drop(ip_guard);
    Ok(())
}

/// Remove from the room, announce the departure, and hand ownership on.
/// Safe to reach from every exit path; a second call finds nothing.
fn teardown(ctx: &GatewayCtx, client: &Arc<ClientEntry>) {
    client.cancel.cancel();
    let Some(out) = ctx.room.remove_client(client.id) else {
        return;
    };
    ctx.room.broadcast_control(
        &ControlMsg::UserLeft {
            id: out.entry.id,
            username: out.entry.username(),
        },
        ClientId::NONE,
    );
    if let Some(new_owner) = out.owner_changed_to {
        ctx.room
            .broadcast_control(&ControlMsg::OwnerChanged { id: new_owner }, ClientId::NONE);
    }
    info!(id = %client.id, "session closed");
}

/// Datagram path: validate, stamp the authoritative sender id, cache for
/// NACK, and hand off to the relay.
fn spawn_datagram_reader(ctx: Arc<GatewayCtx>, conn: quinn::Connection, client: Arc<ClientEntry>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = client.cancel.cancelled() => break,
                res = conn.read_datagram() => {
                    let Ok(datagram) = res else { break };
                    let Some((header, _)) = lc_voice::parse(&datagram) else {
                        debug!(id = %client.id, len = datagram.len(), "dropping invalid datagram");
                        continue;
                    };
                    let mut buf = BytesMut::with_capacity(datagram.len());
                    buf.extend_from_slice(&datagram);
                    lc_voice::stamp_sender(&mut buf, client.id.0);
                    let stamped = buf.freeze();
                    client.cache.insert(header.seq, stamped.clone());
                    ctx.relay.broadcast(client.id, stamped).await;
                }
            }
        }
    });
}

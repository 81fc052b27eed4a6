//! Periodic background workers.

use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::info;

use lc_control::ClientId;
use lc_media::VoiceRelay;

use crate::protocol::{now_ms, ControlMsg};
use crate::room::Room;

/// How often lapsed timed mutes are swept and announced.
const MUTE_SWEEP_EVERY: Duration = Duration::from_secs(1);

const METRICS_EVERY: Duration = Duration::from_secs(60);

/// Auto-unmute expired timed mutes and tell the room.
pub async fn mute_sweeper(room: Arc<Room>) {
    let mut tick = interval(MUTE_SWEEP_EVERY);
    loop {
        tick.tick().await;
        for id in room.expire_mutes(now_ms()) {
            room.broadcast_control(
                &ControlMsg::UserMuted {
                    id,
                    muted: false,
                    mute_expiry: None,
                },
                ClientId::NONE,
            );
        }
    }
}

/// Log relay totals; the counters reset on every read.
pub async fn metrics_logger(relay: Arc<VoiceRelay>, room: Arc<Room>) {
    let mut tick = interval(METRICS_EVERY);
    loop {
        tick.tick().await;
        let snap = relay.counters().take();
        info!(
            clients = room.client_count(),
            datagrams = snap.datagrams,
            bytes = snap.bytes,
            skipped = snap.skipped,
            "relay stats"
        );
    }
}

//! Shared gateway state handed to every session task.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::{net::IpAddr, sync::Arc};

use lc_control::StoreHooks;
use lc_media::{DatagramTx, VoiceRelay};

use crate::config::Config;
use crate::room::Room;

pub struct GatewayCtx {
    pub room: Arc<Room>,
    pub relay: Arc<VoiceRelay>,
    pub store: Arc<dyn StoreHooks>,
    pub cfg: Arc<Config>,
    pub http: reqwest::Client,
    /// Live connection count per source IP, enforced at handshake.
    pub per_ip: DashMap<IpAddr, u32>,
    pub metrics: lc_metrics::ControlMetrics,
}

/// QUIC datagram sender for the voice relay.
pub struct QuinnDatagramTx {
    pub conn: quinn::Connection,
}

#[async_trait::async_trait]
impl DatagramTx for QuinnDatagramTx {
    async fn send(&self, bytes: Bytes) -> Result<()> {
        self.conn
            .send_datagram(bytes)
            .map_err(|e| anyhow!("send_datagram: {e}"))
    }
}

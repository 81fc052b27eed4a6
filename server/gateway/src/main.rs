mod bounded;
mod config;
mod dispatch;
mod frame;
mod http;
mod limit;
mod metrics_adapter;
mod preview;
mod protocol;
mod room;
mod session;
mod state;
mod tasks;
mod tls;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dashmap::DashMap;
use quinn::{Endpoint, ServerConfig, TransportConfig};
use rustls::ServerConfig as RustlsServerConfig;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use lc_control::{db::SqliteStore, StoreHooks};
use lc_media::{RecorderRegistry, VoiceRelay};

use crate::config::Config;
use crate::room::Room;
use crate::state::GatewayCtx;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Arc::new(Config::parse());
    let addr: SocketAddr = cfg.addr.parse().context("parse --addr")?;
    let api_addr: SocketAddr = cfg.api_addr.parse().context("parse --api-addr")?;

    // Durable state seeds the room; memory is authoritative from here on.
    let store = Arc::new(SqliteStore::open(&cfg.db).await.context("open database")?);
    let persisted = store.load().await.context("load persisted state")?;
    let seeded = persisted.channels.is_empty();
    let room = Arc::new(Room::new(persisted, &cfg.server_name, cfg.rate_limit));
    if seeded {
        for ch in room.channels() {
            if let Err(e) = store.create_channel(&ch).await {
                warn!(channel = %ch.id, "seed channel persist failed: {e}");
            }
        }
    }

    let recorders = Arc::new(RecorderRegistry::new());
    let relay = Arc::new(VoiceRelay::new(
        room.clone(),
        recorders.clone(),
        metrics_adapter::relay_metrics(),
    ));

    let store_hooks: Arc<dyn StoreHooks> = store.clone();
    let ctx = Arc::new(GatewayCtx {
        room: room.clone(),
        relay: relay.clone(),
        store: store_hooks,
        cfg: cfg.clone(),
        http: preview::build_client(),
        per_ip: DashMap::new(),
        metrics: lc_metrics::ControlMetrics::new("lc"),
    });

    // QUIC listener.
    let (certs, key) = tls::load_or_generate_tls(
        cfg.tls_cert_pem.as_deref(),
        cfg.tls_key_pem.as_deref(),
        cfg.cert_validity,
    )?;
    let mut rustls = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    rustls.alpn_protocols = vec![cfg.alpn.as_bytes().to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(rustls)?,
    ));
    let mut transport = TransportConfig::default();
    transport.max_concurrent_bidi_streams(4u32.into());
    transport.datagram_receive_buffer_size(Some(1024 * 1024));
    transport.datagram_send_buffer_size(1024 * 1024);
    transport.keep_alive_interval(Some(Duration::from_secs(10)));
    transport.max_idle_timeout(Some(
        Duration::from_secs(cfg.idle_timeout)
            .try_into()
            .map_err(|_| anyhow!("--idle-timeout out of range"))?,
    ));
    server_config.transport_config(Arc::new(transport));

    let endpoint = Endpoint::server(server_config, addr)?;
    info!("listening on {}", endpoint.local_addr()?);

    tokio::spawn(tasks::mute_sweeper(room.clone()));
    tokio::spawn(tasks::metrics_logger(relay.clone(), room.clone()));
    {
        let room = room.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(api_addr, room).await {
                warn!("http api exited: {e:#}");
            }
        });
    }

    tokio::select! {
        r = accept_loop(endpoint.clone(), ctx) => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown");
        }
    }

    recorders.stop_all();
    endpoint.close(0u32.into(), b"server shutdown");
    Ok(())
}

async fn accept_loop(endpoint: Endpoint, ctx: Arc<GatewayCtx>) -> Result<()> {
    loop {
        let incoming = endpoint
            .accept()
            .await
            .ok_or_else(|| anyhow!("endpoint closed"))?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = session::run_connection(ctx, incoming).await {
                warn!("conn ended with error: {:#}", e);
            }
        });
    }
}

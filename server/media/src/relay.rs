//! Channel-scoped datagram fan-out.
//!
//! The relay owns no membership state. A `RecipientSource` (the room)
//! resolves the sender and snapshots targets under its own read lock into
//! a per-call scratch vector; every send happens after that lock is gone.

use anyhow::Result;
use bytes::Bytes;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::debug;

use lc_control::{ChannelId, ClientId};

use crate::breaker::{CircuitBreaker, SendDecision};
use crate::recorder::RecorderRegistry;

/// Sends one datagram toward a connected client. Non-blocking best-effort;
/// an error feeds the recipient's breaker.
#[async_trait::async_trait]
pub trait DatagramTx: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<()>;
}

/// One fan-out recipient, snapshotted from the room.
pub struct FanoutTarget {
    pub id: ClientId,
    pub tx: Arc<dyn DatagramTx>,
    pub breaker: Arc<CircuitBreaker>,
}

/// Why a fan-out was aborted before any send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanoutAbort {
    UnknownSender,
    Lobby,
    Muted,
}

/// Resolves a sender to its channel and co-channel recipients.
pub trait RecipientSource: Send + Sync {
    /// Fill `out` with every other client in the sender's channel whose
    /// session is live, and return the channel. The implementation must
    /// not hold its lock beyond this call.
    fn fanout_targets(
        &self,
        sender: ClientId,
        out: &mut Vec<FanoutTarget>,
    ) -> Result<ChannelId, FanoutAbort>;
}

pub trait RelayMetrics: Send + Sync {
    fn rx_packet(&self);
    fn rx_bytes(&self, n: usize);
    fn drop_reason(&self, reason: &'static str);
    fn forwarded(&self, fanout: usize);
}

pub struct NoopRelayMetrics;

impl RelayMetrics for NoopRelayMetrics {
    fn rx_packet(&self) {}
    fn rx_bytes(&self, _n: usize) {}
    fn drop_reason(&self, _reason: &'static str) {}
    fn forwarded(&self, _fanout: usize) {}
}

/// Room-level totals, reset when the metrics logger reads them.
#[derive(Default)]
pub struct RelayCounters {
    datagrams: AtomicU64,
    bytes: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub datagrams: u64,
    pub bytes: u64,
    pub skipped: u64,
}

impl RelayCounters {
    pub fn take(&self) -> CountersSnapshot {
        CountersSnapshot {
            datagrams: self.datagrams.swap(0, Ordering::Relaxed),
            bytes: self.bytes.swap(0, Ordering::Relaxed),
            skipped: self.skipped.swap(0, Ordering::Relaxed),
        }
    }
}

pub struct VoiceRelay {
    source: Arc<dyn RecipientSource>,
    recorders: Arc<RecorderRegistry>,
    metrics: Arc<dyn RelayMetrics>,
    counters: RelayCounters,
}

impl VoiceRelay {
    pub fn new(
        source: Arc<dyn RecipientSource>,
        recorders: Arc<RecorderRegistry>,
        metrics: Arc<dyn RelayMetrics>,
    ) -> Self {
        Self {
            source,
            recorders,
            metrics,
            counters: RelayCounters::default(),
        }
    }

    pub fn counters(&self) -> &RelayCounters {
        &self.counters
    }

    pub fn recorders(&self) -> &Arc<RecorderRegistry> {
        &self.recorders
    }

    /// Fan a stamped datagram out to the sender's channel.
    ///
    /// The datagram must already carry the server-assigned sender id in
    /// its first two bytes; the reader path stamps and caches before
    /// calling in.
    pub async fn broadcast(&self, sender: ClientId, datagram: Bytes) {
        self.counters.datagrams.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);
        self.metrics.rx_packet();
        self.metrics.rx_bytes(datagram.len());

        let mut targets = Vec::new();
        let channel = match self.source.fanout_targets(sender, &mut targets) {
            Ok(ch) => ch,
            Err(abort) => {
                self.metrics.drop_reason(match abort {
                    FanoutAbort::UnknownSender => "unknown_sender",
                    FanoutAbort::Lobby => "lobby",
                    FanoutAbort::Muted => "muted",
                });
                return;
            }
        };

        if let Some(rec) = self.recorders.active(channel) {
            rec.feed_datagram(&datagram);
        }

        let mut fanout = 0;
        for target in &targets {
            match target.breaker.check() {
                SendDecision::Skip => {
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    self.metrics.drop_reason("breaker_open");
                }
                SendDecision::Send => match target.tx.send(datagram.clone()).await {
                    Ok(()) => {
                        target.breaker.on_success(target.id);
                        fanout += 1;
                    }
                    Err(e) => {
                        target.breaker.on_failure(target.id);
                        debug!(recipient = %target.id, "datagram send failed: {e:#}");
                    }
                },
            }
        }
        if fanout > 0 {
            self.metrics.forwarded(fanout);
        }
    }
}

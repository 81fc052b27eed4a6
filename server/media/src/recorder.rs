//! Per-channel OGG/Opus recorders driven by the fan-out path.

use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{info, warn};

use lc_control::ChannelId;

use crate::ogg::OggStream;

/// A recording is force-stopped after this long.
pub const MAX_RECORDING: std::time::Duration = std::time::Duration::from_secs(2 * 60 * 60);

pub struct ChannelRecorder {
    channel: ChannelId,
    path: PathBuf,
    file_name: String,
    // One mutex serialises feed and stop; stop is idempotent because the
    // writer is taken out of the Option exactly once.
    inner: Mutex<Option<OggStream<BufWriter<File>>>>,
    packets: AtomicU64,
}

impl ChannelRecorder {
    /// Create `ch<N>_<yyyymmdd_hhmmss>.ogg` under `dir` and write the
    /// OpusHead/OpusTags pages.
    pub fn create(dir: &Path, channel: ChannelId) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create recordings dir {}", dir.display()))?;
        let file_name = format!("ch{}_{}.ogg", channel, Local::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(&file_name);
        let file = File::create(&path)
            .with_context(|| format!("create recording {}", path.display()))?;

        // Serial only needs to be unique per file; derive it from the
        // channel and wall clock.
        let serial = (channel.0 as u32) ^ (Local::now().timestamp() as u32);
        let mut ogg = OggStream::new(BufWriter::new(file), serial);
        ogg.write_headers().context("write opus headers")?;

        info!(%channel, file = %file_name, "recording started");
        Ok(Arc::new(Self {
            channel,
            path,
            file_name,
            inner: Mutex::new(Some(ogg)),
            packets: AtomicU64::new(0),
        }))
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one voice datagram. The 4-byte relay header is stripped;
    /// the Opus payload becomes one page. No-op after stop.
    pub fn feed_datagram(&self, datagram: &[u8]) {
        let Some((_, payload)) = lc_voice::parse(datagram) else {
            return;
        };
        if payload.is_empty() {
            return;
        }
        let mut guard = self.inner.lock();
        if let Some(ogg) = guard.as_mut() {
            if let Err(e) = ogg.write_packet(payload) {
                warn!(channel = %self.channel, "recording write failed, stopping: {e}");
                *guard = None;
                return;
            }
            self.packets.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Write the EOS page and close. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        let mut guard = self.inner.lock();
        let Some(mut ogg) = guard.take() else {
            return false;
        };
        if let Err(e) = ogg.finish() {
            warn!(channel = %self.channel, "recording finalise failed: {e}");
        }
        info!(
            channel = %self.channel,
            file = %self.file_name,
            packets = self.packets.load(Ordering::Relaxed),
            "recording stopped"
        );
        true
    }
}

/// Active recorders, one per channel at most.
pub struct RecorderRegistry {
    active: RwLock<HashMap<ChannelId, Arc<ChannelRecorder>>>,
}

impl Default for RecorderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RecorderRegistry {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Start a recorder for `channel`. Fails if one is already running.
    pub fn start(&self, dir: &Path, channel: ChannelId) -> Result<Arc<ChannelRecorder>> {
        let mut active = self.active.write();
        if active.contains_key(&channel) {
            anyhow::bail!("channel {channel} is already being recorded");
        }
        let rec = ChannelRecorder::create(dir, channel)?;
        active.insert(channel, rec.clone());
        Ok(rec)
    }

    pub fn active(&self, channel: ChannelId) -> Option<Arc<ChannelRecorder>> {
        self.active.read().get(&channel).cloned()
    }

    /// Stop and remove the recorder for `channel`, if any.
    pub fn stop(&self, channel: ChannelId) -> Option<Arc<ChannelRecorder>> {
        let rec = self.active.write().remove(&channel)?;
        rec.stop();
        Some(rec)
    }

    /// Stop `channel` only if `rec` is still the active recorder — used by
    /// the auto-stop timer so it cannot kill a later recording.
    pub fn stop_if_current(&self, channel: ChannelId, rec: &Arc<ChannelRecorder>) -> bool {
        let mut active = self.active.write();
        match active.get(&channel) {
            Some(current) if Arc::ptr_eq(current, rec) => {
                active.remove(&channel);
            }
            _ => return false,
        }
        drop(active);
        rec.stop()
    }

    pub fn stop_all(&self) {
        let drained: Vec<_> = self.active.write().drain().collect();
        for (_, rec) in drained {
            rec.stop();
        }
    }
}

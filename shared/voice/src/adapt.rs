//! Bitrate and jitter-depth adaptation.
//!
//! Pure decision functions driven by the telemetry a client already has:
//! smoothed packet loss, RTT, and observed inter-arrival jitter. The
//! encoder and jitter buffer apply the results; nothing here touches audio.

/// Opus bitrate ladder in kbit/s, lowest first.
pub const BITRATE_LADDER: [u32; 6] = [8, 12, 16, 24, 32, 48];

/// Loss fraction above which we step the bitrate down.
const LOSS_STEP_DOWN: f32 = 0.05;
/// Loss fraction below which we may step up, RTT permitting.
const LOSS_STEP_UP: f32 = 0.01;
/// RTT ceiling for stepping up, in milliseconds. Zero RTT means "unknown".
const RTT_STEP_UP_MAX_MS: u32 = 150;

/// Nearest ladder rung for an arbitrary bitrate; ties go to the lower rung.
fn snap(kbps: u32) -> usize {
    let mut best = 0;
    let mut best_dist = u32::MAX;
    for (i, &rung) in BITRATE_LADDER.iter().enumerate() {
        let dist = rung.abs_diff(kbps);
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }
    best
}

/// Next encoder bitrate given current conditions.
///
/// Steps down one rung when loss exceeds 5%, up one rung when loss is
/// under 1% and RTT is known and healthy, otherwise holds. A current
/// bitrate that is not on the ladder snaps to the nearest rung first.
pub fn next_bitrate(current_kbps: u32, loss_rate: f32, rtt_ms: u32) -> u32 {
    let idx = snap(current_kbps);
    if loss_rate > LOSS_STEP_DOWN {
        BITRATE_LADDER[idx.saturating_sub(1)]
    } else if loss_rate < LOSS_STEP_UP && rtt_ms > 0 && rtt_ms < RTT_STEP_UP_MAX_MS {
        BITRATE_LADDER[(idx + 1).min(BITRATE_LADDER.len() - 1)]
    } else {
        BITRATE_LADDER[idx]
    }
}

/// Target jitter-buffer depth in 20 ms frames, clamped to [1, 8].
pub fn target_jitter_depth(jitter_ms: u32, loss_rate: f32) -> u32 {
    if jitter_ms == 0 {
        return 1;
    }
    let frames = jitter_ms.div_ceil(20) + 1 + u32::from(loss_rate > 0.05);
    frames.clamp(1, 8)
}

/// Exponentially weighted moving average of packet loss.
pub fn smooth_loss(smoothed: f32, raw: f32, alpha: f32) -> f32 {
    alpha * raw + (1.0 - alpha) * smoothed
}

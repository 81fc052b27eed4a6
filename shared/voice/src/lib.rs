//! Shared voice-path primitives.
//!
//! Everything here is pure: the datagram wire format used on both ends of
//! the relay, and the client-side adaptation math (bitrate ladder, jitter
//! depth, loss smoothing, VAD, AGC). No I/O, no async, no dependencies.

pub mod adapt;
pub mod agc;
pub mod datagram;
pub mod vad;

pub use adapt::{next_bitrate, smooth_loss, target_jitter_depth, BITRATE_LADDER};
pub use datagram::{parse, stamp_sender, VoiceHeader, HEADER_LEN, MAX_DATAGRAM, MAX_PAYLOAD};

/// One Opus frame at 48 kHz / 20 ms.
pub const SAMPLES_PER_FRAME: u64 = 960;

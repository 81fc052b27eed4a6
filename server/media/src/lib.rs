//! Media plane: datagram fan-out, NACK retransmission cache, per-recipient
//! circuit breakers, and the OGG/Opus channel recorder.
//!
//! The relay treats voice packets as opaque payload after header
//! validation; it never decodes Opus and never mixes.

pub mod breaker;
pub mod cache;
pub mod ogg;
pub mod recorder;
pub mod relay;

pub use breaker::{CircuitBreaker, SendDecision};
pub use cache::DatagramCache;
pub use recorder::{ChannelRecorder, RecorderRegistry};
pub use relay::{
    DatagramTx, FanoutTarget, NoopRelayMetrics, RecipientSource, RelayCounters, RelayMetrics,
    VoiceRelay,
};

pub mod control;
pub mod voice;

pub use control::ControlMetrics;
pub use voice::VoiceMetricsImpl;

use metrics::{counter, histogram};

/// Metric names under: {ns}_voice_*
pub struct VoiceMetricsImpl {
    ns: &'static str,
}

impl VoiceMetricsImpl {
    pub fn new(namespace: &'static str) -> Self {
        Self { ns: namespace }
    }

    #[inline]
    pub fn rx_packet(&self) {
        counter!(format!("{}_voice_rx_packets_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn rx_bytes(&self, n: usize) {
        counter!(format!("{}_voice_rx_bytes_total", self.ns)).increment(n as u64);
    }

    #[inline]
    pub fn forwarded(&self, fanout: usize) {
        counter!(format!("{}_voice_forwarded_total", self.ns)).increment(1);
        histogram!(format!("{}_voice_fanout", self.ns)).record(fanout as f64);
    }

    #[inline]
    pub fn drop_reason(&self, reason: &'static str) {
        counter!(format!("{}_voice_drops_total", self.ns), "reason" => reason).increment(1);
    }

    #[inline]
    pub fn nack_retransmit(&self, n: usize) {
        counter!(format!("{}_voice_nack_retransmits_total", self.ns)).increment(n as u64);
    }
}

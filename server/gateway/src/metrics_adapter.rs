use std::sync::Arc;

use lc_media::RelayMetrics;
use lc_metrics::VoiceMetricsImpl;

pub fn relay_metrics() -> Arc<dyn RelayMetrics> {
    Arc::new(GatewayRelayMetrics {
        inner: VoiceMetricsImpl::new("lc"),
    })
}

struct GatewayRelayMetrics {
    inner: VoiceMetricsImpl,
}

impl RelayMetrics for GatewayRelayMetrics {
    fn rx_packet(&self) {
        self.inner.rx_packet();
    }
    fn rx_bytes(&self, n: usize) {
        self.inner.rx_bytes(n);
    }
    fn drop_reason(&self, reason: &'static str) {
        self.inner.drop_reason(reason);
    }
    fn forwarded(&self, fanout: usize) {
        self.inner.forwarded(fanout);
    }
}

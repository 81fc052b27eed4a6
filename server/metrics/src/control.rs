use metrics::counter;

/// Metric names under: {ns}_control_*
pub struct ControlMetrics {
    ns: &'static str,
}

impl ControlMetrics {
    pub fn new(namespace: &'static str) -> Self {
        Self { ns: namespace }
    }

    #[inline]
    pub fn rx_message(&self, kind: &'static str) {
        counter!(format!("{}_control_rx_total", self.ns), "kind" => kind).increment(1);
    }

    #[inline]
    pub fn dropped_line(&self, reason: &'static str) {
        counter!(format!("{}_control_dropped_lines_total", self.ns), "reason" => reason)
            .increment(1);
    }

    #[inline]
    pub fn broadcast(&self, recipients: usize) {
        counter!(format!("{}_control_broadcasts_total", self.ns)).increment(1);
        counter!(format!("{}_control_broadcast_sends_total", self.ns))
            .increment(recipients as u64);
    }

    #[inline]
    pub fn session_opened(&self) {
        counter!(format!("{}_control_sessions_opened_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn session_closed(&self) {
        counter!(format!("{}_control_sessions_closed_total", self.ns)).increment(1);
    }
}

//! Run-level accumulators and the stdout summary line. See spec.md §6.

/// Accumulators gathered over the course of one `Simulator::simulate()` run.
#[derive(Clone, Copy, Debug, Default)]
pub struct Stats {
    pub total_real: u64,
    pub total_fec: u64,
    pub total_dummy: u64,
    pub lost_real: u64,
    pub recovered_real: u64,
    pub retransmitted_real: u64,
    pub fct: f64,
    total_latency: f64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_latency(&mut self, latency: f64) {
        self.total_latency += latency;
    }

    pub fn avg_latency(&self) -> f64 {
        if self.total_real == 0 {
            0.0
        } else {
            self.total_latency / self.total_real as f64
        }
    }

    /// The exact stdout summary line spec.md §6 requires, byte for byte.
    pub fn to_line(&self) -> String {
        format!(
            "[TransportSimulator] Stats: Total Real={}, FEC={}, Dummy={}, Lost={}, Recovered={}, Retransmitted={}, FCT={:.4}, AvgLatency={:.4}",
            self.total_real,
            self.total_fec,
            self.total_dummy,
            self.lost_real,
            self.recovered_real,
            self.retransmitted_real,
            self.fct,
            self.avg_latency(),
        )
    }
}

use std::time::Duration;

/// Round-trip latency samples for one or more clients.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    pub ok: u64,
    pub bad: u64,
    pub bytes: u64,
    samples: Vec<Duration>,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn record(&mut self, rtt: Duration, bytes: usize) {
        self.ok += 1;
        self.bytes += bytes as u64;
        self.samples.push(rtt);
    }
    pub fn inc_bad(&mut self) {
        self.bad += 1;
    }
    pub fn merge(&mut self, other: &LatencyStats) {
        self.ok += other.ok;
        self.bad += other.bad;
        self.bytes += other.bytes;
        self.samples.extend_from_slice(&other.samples);
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
    pub fn avg(&self) -> Option<Duration> {
        let n = u32::try_from(self.samples.len()).ok().filter(|n| *n > 0)?;
        Some(self.samples.iter().sum::<Duration>() / n)
    }
    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }
    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }

    /// `avg=0.012s, min=0.010s, max=0.020s`
    pub fn summary(&self) -> String {
        let s = |d: Option<Duration>| d.unwrap_or_default().as_secs_f64();
        format!(
            "avg={:.3}s, min={:.3}s, max={:.3}s",
            s(self.avg()),
            s(self.min()),
            s(self.max())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reports_avg_min_max() {
        let mut st = LatencyStats::new();
        st.record(Duration::from_millis(10), 4);
        st.record(Duration::from_millis(30), 4);
        assert_eq!(st.avg(), Some(Duration::from_millis(20)));
        assert_eq!(st.min(), Some(Duration::from_millis(10)));
        assert_eq!(st.max(), Some(Duration::from_millis(30)));
        assert_eq!(st.summary(), "avg=0.020s, min=0.010s, max=0.030s");
        assert_eq!(st.bytes, 8);
    }

    #[test]
    fn merge_and_empty() {
        let mut all = LatencyStats::new();
        assert!(all.is_empty());
        assert_eq!(all.avg(), None);
        let mut one = LatencyStats::new();
        one.record(Duration::from_millis(5), 1);
        one.inc_bad();
        all.merge(&one);
        all.merge(&one);
        assert_eq!(all.ok, 2);
        assert_eq!(all.bad, 2);
        assert_eq!(all.avg(), Some(Duration::from_millis(5)));
    }
}

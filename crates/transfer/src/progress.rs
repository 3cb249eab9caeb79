use tokio::time::Instant;

/// Converts an acknowledged offset into a percentage rounded to one decimal.
///
/// An empty file counts as complete.
pub fn percent(offset: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    let raw = (offset.min(total) as f64 / total as f64) * 100.0;
    (raw * 10.0).round() / 10.0
}

/// Average throughput since a run started.
///
/// Bytes that were already on the server when the run began do not count,
/// so a resumed transfer reports the speed of this run only.
#[derive(Debug, Clone)]
pub struct ThroughputMeter {
    started_at: Instant,
    baseline: u64,
}

impl ThroughputMeter {
    /// Starts measuring now.
    pub fn start() -> Self {
        Self {
            started_at: Instant::now(),
            baseline: 0,
        }
    }

    /// Sets the offset this run resumed from.
    pub fn set_baseline(&mut self, offset: u64) {
        self.baseline = offset;
    }

    /// Returns bytes/second at `offset`, or `None` before any time or data
    /// has passed.
    pub fn bytes_per_second(&self, offset: u64) -> Option<f64> {
        let sent = offset.saturating_sub(self.baseline);
        let elapsed = self.started_at.elapsed();
        if sent == 0 || elapsed.is_zero() {
            return None;
        }
        Some(sent as f64 / elapsed.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn percent_rounds_to_one_decimal() {
        assert_eq!(percent(0, 100), 0.0);
        assert_eq!(percent(40, 100), 40.0);
        assert_eq!(percent(1, 3), 33.3);
        assert_eq!(percent(2, 3), 66.7);
        assert_eq!(percent(100, 100), 100.0);
    }

    #[test]
    fn percent_clamps_and_handles_empty() {
        assert_eq!(percent(150, 100), 100.0);
        assert_eq!(percent(0, 0), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn meter_unknown_before_data() {
        let meter = ThroughputMeter::start();
        assert!(meter.bytes_per_second(0).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn meter_averages_since_start() {
        let meter = ThroughputMeter::start();
        tokio::time::advance(Duration::from_secs(2)).await;
        let speed = meter.bytes_per_second(1000).unwrap();
        assert!((speed - 500.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn meter_ignores_resumed_bytes() {
        let mut meter = ThroughputMeter::start();
        meter.set_baseline(4000);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(meter.bytes_per_second(4000).is_none());
        let speed = meter.bytes_per_second(4100).unwrap();
        assert!((speed - 100.0).abs() < 1e-6);
    }
}

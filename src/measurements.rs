use crate::protocol::Direction;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Rates above this many KB/s are reported in MB/s.
pub const MB_THRESHOLD_KBPS: f64 = 1024.0;

/// Timing of a single block transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub block_size: u64,
    pub duration: Duration,
    pub bytes_per_second: f64,
}

impl Iteration {
    pub fn new(block_size: u64, duration: Duration) -> Self {
        // A zero reading is possible on coarse clocks; treat it as one nanosecond.
        let secs = duration.as_secs_f64().max(1e-9);
        Self {
            block_size,
            duration,
            bytes_per_second: block_size as f64 / secs,
        }
    }
}

/// Result of one bounded download or upload phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRun {
    pub direction: Direction,
    /// Time budget the run was given
    pub period: Duration,
    /// Sum of the measured block durations
    pub elapsed: Duration,
    pub iterations: Vec<Iteration>,
    /// Best single-iteration rate
    pub peak_bytes_per_second: f64,
}

impl MeasurementRun {
    pub fn new(direction: Direction, period: Duration) -> Self {
        Self {
            direction,
            period,
            elapsed: Duration::ZERO,
            iterations: Vec::new(),
            peak_bytes_per_second: 0.0,
        }
    }

    pub fn record(&mut self, iteration: Iteration) {
        self.elapsed += iteration.duration;
        self.peak_bytes_per_second = self.peak_bytes_per_second.max(iteration.bytes_per_second);
        self.iterations.push(iteration);
    }

    /// True once the accumulated block time reached the budget.
    pub fn is_exhausted(&self) -> bool {
        self.elapsed >= self.period
    }

    pub fn total_bytes(&self) -> u64 {
        self.iterations.iter().map(|i| i.block_size).sum()
    }
}

/// Formats a byte rate the way the log lines report it.
///
/// ```
/// use speedtest::measurements::format_rate;
///
/// assert_eq!(format_rate(512.0 * 1024.0), "512.00 KB/S");
/// assert_eq!(format_rate(3.0 * 1024.0 * 1024.0), "3.00 MB/S");
/// ```
pub fn format_rate(bytes_per_second: f64) -> String {
    let kbps = bytes_per_second / 1024.0;
    if kbps > MB_THRESHOLD_KBPS {
        format!("{:.2} MB/S", kbps / 1024.0)
    } else {
        format!("{:.2} KB/S", kbps)
    }
}

/// Snapshot of every run a client has completed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Measurements {
    pub runs: Vec<MeasurementRun>,
}

impl Measurements {
    /// Most recent run in `direction`.
    pub fn latest(&self, direction: Direction) -> Option<&MeasurementRun> {
        self.runs.iter().rev().find(|r| r.direction == direction)
    }

    pub fn peak_download(&self) -> Option<f64> {
        self.latest(Direction::ServerSends)
            .map(|r| r.peak_bytes_per_second)
    }

    pub fn peak_upload(&self) -> Option<f64> {
        self.latest(Direction::ClientSends)
            .map(|r| r.peak_bytes_per_second)
    }
}

/// Thread-safe store of completed runs.
#[derive(Debug, Clone, Default)]
pub struct MeasurementsCollector {
    inner: Arc<Mutex<Measurements>>,
}

impl MeasurementsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, run: MeasurementRun) {
        self.inner.lock().runs.push(run);
    }

    pub fn get(&self) -> Measurements {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_rate() {
        let it = Iteration::new(4096, Duration::from_millis(500));
        assert_eq!(it.bytes_per_second, 8192.0);
    }

    #[test]
    fn test_iteration_zero_duration_is_finite() {
        let it = Iteration::new(4096, Duration::ZERO);
        assert!(it.bytes_per_second.is_finite());
        assert!(it.bytes_per_second > 0.0);
    }

    #[test]
    fn test_run_tracks_peak_and_elapsed() {
        let mut run = MeasurementRun::new(Direction::ServerSends, Duration::from_secs(1));
        run.record(Iteration::new(1000, Duration::from_millis(100)));
        run.record(Iteration::new(2000, Duration::from_millis(400)));
        run.record(Iteration::new(4000, Duration::from_millis(200)));

        assert_eq!(run.elapsed, Duration::from_millis(700));
        assert_eq!(run.peak_bytes_per_second, 20_000.0);
        assert_eq!(run.total_bytes(), 7000);
        assert!(!run.is_exhausted());

        run.record(Iteration::new(8000, Duration::from_millis(300)));
        assert!(run.is_exhausted());
    }

    #[test]
    fn test_format_rate_threshold() {
        assert_eq!(format_rate(1024.0 * 1024.0), "1024.00 KB/S");
        assert_eq!(format_rate(1024.0 * 1025.0), "1.00 MB/S");
        assert_eq!(format_rate(0.0), "0.00 KB/S");
    }

    #[test]
    fn test_collector_latest_per_direction() {
        let collector = MeasurementsCollector::new();
        let mut down = MeasurementRun::new(Direction::ServerSends, Duration::from_secs(1));
        down.record(Iteration::new(100, Duration::from_secs(1)));
        let mut up = MeasurementRun::new(Direction::ClientSends, Duration::from_secs(1));
        up.record(Iteration::new(50, Duration::from_secs(1)));

        collector.push(down);
        collector.push(up);

        let measurements = collector.get();
        assert_eq!(measurements.runs.len(), 2);
        assert_eq!(measurements.peak_download(), Some(100.0));
        assert_eq!(measurements.peak_upload(), Some(50.0));
    }

    #[test]
    fn test_run_serializes() {
        let run = MeasurementRun::new(Direction::ClientSends, Duration::from_secs(2));
        let json = serde_json::to_string(&run).unwrap();
        assert!(json.contains("ClientSends"));
    }
}

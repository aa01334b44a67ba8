//! # throttle
//!
//! why: cap the bandwidth snapshot copies may take from disk and network
//! relations: injected into LocalSnapshotStore, consulted per copied chunk
//! what: SnapshotThrottle trait, ThroughputSnapshotThrottle

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// trait for gating snapshot transfer bandwidth
pub trait SnapshotThrottle: Send + Sync {
    /// ask to move `bytes`; returns how many may be moved now, 0 to wait
    fn throttled_by_throughput(&self, bytes: u64) -> u64;

    /// how long a caller that was granted nothing should wait before retrying
    fn retry_interval(&self) -> Duration {
        Duration::from_millis(10)
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    used: u64,
}

/// grants at most `throughput_bytes_per_sec` in every one-second window
#[derive(Debug)]
pub struct ThroughputSnapshotThrottle {
    throughput_bytes_per_sec: u64,
    window: Mutex<Window>,
}

impl ThroughputSnapshotThrottle {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new(throughput_bytes_per_sec: u64) -> Self {
        Self {
            throughput_bytes_per_sec,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
        }
    }
}

impl SnapshotThrottle for ThroughputSnapshotThrottle {
    fn throttled_by_throughput(&self, bytes: u64) -> u64 {
        let mut window = self.window.lock();
        if window.started.elapsed() >= Self::WINDOW {
            window.started = Instant::now();
            window.used = 0;
        }
        let granted = bytes.min(self.throughput_bytes_per_sec - window.used);
        window.used += granted;
        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_up_to_budget_per_window() {
        let throttle = ThroughputSnapshotThrottle::new(100);

        assert_eq!(throttle.throttled_by_throughput(60), 60);
        assert_eq!(throttle.throttled_by_throughput(60), 40);
        assert_eq!(throttle.throttled_by_throughput(1), 0);
    }

    #[test]
    fn budget_refills_after_window() {
        let throttle = ThroughputSnapshotThrottle::new(10);
        assert_eq!(throttle.throttled_by_throughput(10), 10);

        throttle.window.lock().started -= Duration::from_secs(2);

        assert_eq!(throttle.throttled_by_throughput(10), 10);
    }
}

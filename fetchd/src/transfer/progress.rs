//! Live transfer counters shared with the status API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Transient per-transfer counters.
///
/// `live_bytes` tracks every received byte and always runs at or ahead of
/// the record's durable checkpoint; both counters exist only while a
/// session is active and are lost on restart.
#[derive(Debug)]
pub struct TransferProgress {
    live_bytes: AtomicU64,
    speed_bytes_per_ms: AtomicU64,
}

impl TransferProgress {
    pub fn new(initial_bytes: u64) -> Self {
        Self {
            live_bytes: AtomicU64::new(initial_bytes),
            speed_bytes_per_ms: AtomicU64::new(0),
        }
    }

    pub fn live_bytes(&self) -> u64 {
        self.live_bytes.load(Ordering::SeqCst)
    }

    pub fn speed_bytes_per_ms(&self) -> u64 {
        self.speed_bytes_per_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn set_live_bytes(&self, bytes: u64) {
        self.live_bytes.store(bytes, Ordering::SeqCst);
    }

    pub(crate) fn set_speed(&self, bytes_per_ms: u64) {
        self.speed_bytes_per_ms.store(bytes_per_ms, Ordering::SeqCst);
    }
}

/// Chunk-granularity throughput smoothing over one-second windows.
#[derive(Debug, Default)]
pub(crate) struct ThroughputMeter {
    window_start: Option<Instant>,
    window_bytes: u64,
}

impl ThroughputMeter {
    /// Account a chunk and publish a new speed sample once the current
    /// window is at least a second old.
    pub(crate) fn record(&mut self, bytes: u64, progress: &TransferProgress) {
        let now = Instant::now();
        match self.window_start {
            None => {
                self.window_start = Some(now);
                self.window_bytes = bytes;
            }
            Some(start) => {
                self.window_bytes += bytes;
                let elapsed = now.duration_since(start);
                if elapsed >= Duration::from_secs(1) {
                    let millis = (elapsed.as_millis() as u64).max(1);
                    progress.set_speed(self.window_bytes / millis);
                    self.window_bytes = 0;
                    self.window_start = Some(now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_counters() {
        let progress = TransferProgress::new(10);
        assert_eq!(progress.live_bytes(), 10);
        assert_eq!(progress.speed_bytes_per_ms(), 0);

        progress.set_live_bytes(25);
        progress.set_speed(3);
        assert_eq!(progress.live_bytes(), 25);
        assert_eq!(progress.speed_bytes_per_ms(), 3);
    }

    #[test]
    fn test_meter_waits_for_full_window() {
        let progress = TransferProgress::new(0);
        let mut meter = ThroughputMeter::default();

        meter.record(100, &progress);
        meter.record(100, &progress);

        // Well under a second elapsed, no sample published yet.
        assert_eq!(progress.speed_bytes_per_ms(), 0);
    }
}

//! Deterministic telemetry for hosts without GPU tooling

use std::sync::atomic::{AtomicU64, Ordering};
use vision_core::types::{epoch_seconds, TelemetrySample};

/// Ticks per triangle-wave period
const PERIOD: u64 = 20;

pub const STUB_DEVICE_ID: &str = "virtual-gpu";
pub const STUB_MEMORY_TOTAL_MB: f64 = 8192.0;
pub const STUB_POWER_LIMIT_W: f64 = 250.0;

/// Synthetic source that always answers.
///
/// Values follow a triangle wave over an internal tick so consecutive samples
/// move but never leave the reported totals and limits.
#[derive(Debug, Default)]
pub struct StubSource {
    tick: AtomicU64,
}

impl StubSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next sample
    pub fn read(&self) -> TelemetrySample {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        self.sample_at(tick, epoch_seconds())
    }

    /// Sample for a given tick; pure
    pub fn sample_at(&self, tick: u64, timestamp: f64) -> TelemetrySample {
        let phase = triangle(tick);
        let gpu_util = 20.0 + 10.0 * phase;

        TelemetrySample {
            gpu_util_pct: gpu_util,
            mem_util_pct: gpu_util / 2.0,
            memory_used_mb: 1024.0 + 256.0 * phase,
            memory_total_mb: STUB_MEMORY_TOTAL_MB,
            power_w: 150.0 + 10.0 * phase,
            power_limit_w: STUB_POWER_LIMIT_W,
            temperature_c: 45.0 + 2.0 * phase,
            timestamp,
        }
        .normalized()
    }

    pub fn device_id(&self) -> &str {
        STUB_DEVICE_ID
    }
}

/// Triangle wave in [0, 1]
fn triangle(tick: u64) -> f64 {
    let half = PERIOD / 2;
    let position = tick % PERIOD;
    let rising = if position <= half { position } else { PERIOD - position };
    rising as f64 / half as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_triangle_range() {
        assert_eq!(triangle(0), 0.0);
        assert_eq!(triangle(PERIOD / 2), 1.0);
        assert_eq!(triangle(PERIOD), 0.0);
        for tick in 0..3 * PERIOD {
            let value = triangle(tick);
            assert!((0.0..=1.0).contains(&value));
        }
    }

    #[test]
    fn test_stub_samples_within_bounds() {
        let stub = StubSource::new();
        for _ in 0..50 {
            let sample = stub.read();
            assert!(sample.within_bounds());
            assert!(sample.gpu_util_pct >= 20.0 && sample.gpu_util_pct <= 30.0);
            assert_eq!(sample.memory_total_mb, STUB_MEMORY_TOTAL_MB);
            assert!(sample.timestamp > 0.0);
        }
    }

    #[test]
    fn test_stub_is_deterministic() {
        let a = StubSource::new().sample_at(7, 1.0);
        let b = StubSource::new().sample_at(7, 1.0);
        assert_eq!(a, b);
        assert_eq!(StubSource::new().device_id(), "virtual-gpu");
    }
}

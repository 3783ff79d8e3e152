//! Pool counters and stats snapshots
//!
//! Lifetime counters live in lock-free atomics so the hot paths never
//! contend on them. Command latencies additionally feed a small ring of
//! recent samples for percentile estimates; that ring takes a plain
//! mutex since it is touched once per completed command.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::pool::circuit::CircuitState;

/// Recent latency samples retained for percentile estimates
const LATENCY_WINDOW: usize = 512;

/// Lifetime counters, shared across the pool and its background tasks
#[derive(Default)]
pub(crate) struct PoolMetrics {
    pub(crate) acquires: AtomicU64,
    pub(crate) releases: AtomicU64,
    pub(crate) acquire_timeouts: AtomicU64,
    pub(crate) sessions_created: AtomicU64,
    pub(crate) sessions_destroyed: AtomicU64,
    pub(crate) commands_executed: AtomicU64,
    pub(crate) commands_failed: AtomicU64,
    pub(crate) command_retries: AtomicU64,
    pub(crate) probes_passed: AtomicU64,
    pub(crate) probes_failed: AtomicU64,
    pub(crate) breaker_opens: AtomicU64,
    latency_sum_us: AtomicU64,
    latency_count: AtomicU64,
    recent_latencies: Mutex<Vec<u64>>,
}

impl PoolMetrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_latency(&self, elapsed: Duration) {
        let us = elapsed.as_micros() as u64;
        self.latency_sum_us.fetch_add(us, Ordering::Relaxed);
        let n = self.latency_count.fetch_add(1, Ordering::Relaxed);

        let mut recent = match self.recent_latencies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if recent.len() < LATENCY_WINDOW {
            recent.push(us);
        } else {
            recent[(n as usize) % LATENCY_WINDOW] = us;
        }
    }

    pub(crate) fn avg_latency(&self) -> Duration {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency_sum_us.load(Ordering::Relaxed) / count)
    }

    /// Percentile over the recent-sample window
    pub(crate) fn latency_percentile(&self, pct: f64) -> Duration {
        let recent = match self.recent_latencies.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if recent.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted = recent.clone();
        drop(recent);
        sorted.sort_unstable();
        let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
        Duration::from_micros(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }
}

/// Point-in-time view of pool state and lifetime counters
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Sessions sitting idle, ready for handout
    pub idle_sessions: usize,
    /// Sessions currently leased to callers
    pub in_use_sessions: usize,
    /// Sessions being established or probed right now
    pub pending_sessions: usize,
    /// Total sessions the pool accounts for
    pub total_sessions: usize,
    /// Acquirers parked in the waiting queue
    pub waiting: usize,
    /// Current circuit breaker state
    pub circuit_state: CircuitState,
    /// Consecutive failures counted by the breaker
    pub circuit_failures: u32,

    pub acquires: u64,
    pub releases: u64,
    pub acquire_timeouts: u64,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub commands_executed: u64,
    pub commands_failed: u64,
    pub command_retries: u64,
    pub probes_passed: u64,
    pub probes_failed: u64,
    pub breaker_opens: u64,

    pub avg_command_latency: Duration,
    pub p50_command_latency: Duration,
    pub p95_command_latency: Duration,
    pub p99_command_latency: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_aggregation() {
        let m = PoolMetrics::new();
        for ms in [10u64, 20, 30, 40] {
            m.record_latency(Duration::from_millis(ms));
        }
        assert_eq!(m.avg_latency(), Duration::from_millis(25));
        assert_eq!(m.latency_percentile(50.0), Duration::from_millis(20));
        assert_eq!(m.latency_percentile(100.0), Duration::from_millis(40));
    }

    #[test]
    fn test_empty_metrics() {
        let m = PoolMetrics::new();
        assert_eq!(m.avg_latency(), Duration::ZERO);
        assert_eq!(m.latency_percentile(99.0), Duration::ZERO);
    }

    #[test]
    fn test_window_wraps() {
        let m = PoolMetrics::new();
        for i in 0..(LATENCY_WINDOW as u64 + 100) {
            m.record_latency(Duration::from_micros(i));
        }
        // Old samples were overwritten; the window holds the newest ones
        assert!(m.latency_percentile(1.0) >= Duration::from_micros(100));
    }
}

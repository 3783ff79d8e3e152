//! Observability events emitted by the pool
//!
//! Every lifecycle transition is published on a broadcast channel so
//! callers can wire pool behavior into their own metrics or alerting
//! without polling stats. Emission is fire-and-forget; a subscriber
//! that falls behind loses old events rather than slowing the pool.

/// Capacity of the broadcast channel backing [`subscribe`](crate::pool::SessionPool::subscribe)
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Why a session was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    /// Idle longer than the configured idle timeout
    IdleTimeout,
    /// Too many consecutive errors
    Unhealthy,
    /// Pool shutdown
    Shutdown,
}

/// Pool lifecycle and health events
#[derive(Debug, Clone)]
pub enum PoolEvent {
    PoolStarted { sessions: usize },
    PoolStopped,
    SessionCreated { session_id: u64 },
    SessionDestroyed { session_id: u64, reason: DestroyReason },
    LeaseGranted { session_id: u64 },
    LeaseReleased { session_id: u64, success: bool },
    HealthCheckPassed { session_id: u64 },
    HealthCheckFailed { session_id: u64 },
    CircuitOpened { failures: u32 },
    CircuitHalfOpened,
    CircuitClosed,
    CommandRetried { command: String, attempt: u32 },
}

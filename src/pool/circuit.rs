//! Circuit breaker for the session pool
//!
//! Three states gate whether new work may be attempted against the
//! device at all:
//! - Closed: normal operation, acquisitions are allowed
//! - Open: the endpoint is failing, acquisitions are rejected
//! - HalfOpen: testing recovery after the cooldown
//!
//! This is a pure, synchronous state machine consulted by the pool
//! manager under its own lock; it never runs a timer of its own. The
//! Open -> HalfOpen transition happens lazily, on the first acquisition
//! attempt after the cooldown has elapsed.
//!
//! HalfOpen admits any number of concurrent trials; the first success
//! closes the breaker, the first failure reopens it. This is looser
//! than the single-probe convention but bounds recovery latency when
//! many callers are queued behind an outage.

use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - acquisitions are allowed
    Closed,
    /// Endpoint has failed - acquisitions are rejected until cooldown
    Open,
    /// Testing recovery - trials allowed, one outcome decides
    HalfOpen,
}

impl CircuitState {
    /// Human-readable state name for logs and stats
    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// State change produced by an operation, reported so the pool manager
/// can emit the matching observability event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CircuitTransition {
    Opened,
    HalfOpened,
    Closed,
}

/// Pool-wide circuit breaker
#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    state: CircuitState,
    /// Consecutive failures while Closed or HalfOpen
    consecutive_failures: u32,
    /// When the breaker last opened
    opened_at: Option<Instant>,
    /// Failures before the circuit opens
    threshold: u32,
    /// How long the circuit stays open before admitting trials
    cooldown: Duration,
}

impl CircuitBreaker {
    pub(crate) fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            threshold,
            cooldown,
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }

    /// Gate an acquisition attempt.
    ///
    /// Returns the transition if the attempt flipped Open to HalfOpen,
    /// or `Err(remaining)` with the rest of the cooldown when the
    /// breaker rejects the attempt.
    pub(crate) fn check_acquire(
        &mut self,
        now: Instant,
    ) -> Result<Option<CircuitTransition>, Duration> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(None),
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(self.cooldown);
                if elapsed >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    Ok(Some(CircuitTransition::HalfOpened))
                } else {
                    Err(self.cooldown - elapsed)
                }
            }
        }
    }

    /// Record a successful operation.
    ///
    /// A single success while HalfOpen closes the breaker and zeroes the
    /// failure counter; while Closed it just clears the streak.
    pub(crate) fn record_success(&mut self) -> Option<CircuitTransition> {
        self.consecutive_failures = 0;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.opened_at = None;
                Some(CircuitTransition::Closed)
            }
            _ => None,
        }
    }

    /// Record a failed operation.
    ///
    /// Reaching the threshold while Closed opens the breaker; any
    /// failure while HalfOpen reopens it and restarts the cooldown.
    /// Failures while already Open are not accumulated.
    pub(crate) fn record_failure(&mut self, now: Instant) -> Option<CircuitTransition> {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                    Some(CircuitTransition::Opened)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures += 1;
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                Some(CircuitTransition::Opened)
            }
            CircuitState::Open => None,
        }
    }
}

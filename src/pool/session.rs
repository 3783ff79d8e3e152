//! Pooled device session with per-session health bookkeeping
//!
//! A `Session` pairs an authenticated client with the metadata the
//! manager and health monitor use to decide when to probe, retire, or
//! evict it. The pool passes sessions around by value; at any instant a
//! session is in exactly one place (idle shelf, lease, or probe task).

use std::time::{Duration, Instant};

use tracing::debug;

use crate::client::DeviceClient;

/// One pooled, authenticated session
pub(crate) struct Session {
    /// Stable identifier, unique for the lifetime of the pool
    pub(crate) id: u64,
    pub(crate) client: Box<dyn DeviceClient>,
    pub(crate) created_at: Instant,
    pub(crate) last_used_at: Instant,
    pub(crate) last_health_check: Instant,
    /// Failures since the last successful operation on this session
    pub(crate) consecutive_errors: u32,
    pub(crate) total_errors: u64,
    pub(crate) last_error: Option<String>,
    /// Commands executed over this session
    pub(crate) requests: u64,
    /// Sum of command round-trip times, for a per-session average
    pub(crate) total_response_time: Duration,
}

impl Session {
    pub(crate) fn new(id: u64, client: Box<dyn DeviceClient>) -> Self {
        let now = Instant::now();
        Self {
            id,
            client,
            created_at: now,
            last_used_at: now,
            last_health_check: now,
            consecutive_errors: 0,
            total_errors: 0,
            last_error: None,
            requests: 0,
            total_response_time: Duration::ZERO,
        }
    }

    /// How long this session has sat unused
    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    /// Whether the health monitor should probe this session this cycle
    pub(crate) fn due_for_check(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(self.last_health_check) >= interval
    }

    /// Record the outcome of one command executed over this session
    pub(crate) fn record_outcome(&mut self, success: bool, elapsed: Duration, error: Option<String>) {
        self.last_used_at = Instant::now();
        self.requests += 1;
        self.total_response_time += elapsed;
        if success {
            self.consecutive_errors = 0;
        } else {
            self.consecutive_errors += 1;
            self.total_errors += 1;
            self.last_error = error;
        }
    }

    pub(crate) fn record_probe_success(&mut self) {
        self.last_health_check = Instant::now();
        self.consecutive_errors = 0;
    }

    pub(crate) fn record_probe_failure(&mut self, error: String) {
        self.last_health_check = Instant::now();
        self.consecutive_errors += 1;
        self.total_errors += 1;
        self.last_error = Some(error);
    }

    /// Average command round-trip time over this session's lifetime
    pub(crate) fn avg_response_time(&self) -> Duration {
        if self.requests == 0 {
            Duration::ZERO
        } else {
            self.total_response_time / self.requests as u32
        }
    }

    /// Close the underlying client, logging but not surfacing failures.
    /// The session is being discarded either way.
    pub(crate) async fn close(mut self) {
        if let Err(e) = self.client.close().await {
            debug!(session_id = self.id, error = %e, "error closing session");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("age", &self.created_at.elapsed())
            .field("requests", &self.requests)
            .field("consecutive_errors", &self.consecutive_errors)
            .field("total_errors", &self.total_errors)
            .field("avg_response_time", &self.avg_response_time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::client::Rows;
    use crate::error::Result;

    struct NullClient;

    #[async_trait]
    impl DeviceClient for NullClient {
        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        async fn login(&mut self, _username: &str, _password: &str) -> Result<()> {
            Ok(())
        }
        async fn run_query(&mut self, _command: &str, _params: &[(String, String)]) -> Result<Rows> {
            Ok(Vec::new())
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_outcome_bookkeeping() {
        let mut s = Session::new(1, Box::new(NullClient));

        s.record_outcome(true, Duration::from_millis(10), None);
        s.record_outcome(false, Duration::from_millis(30), Some("reset".to_string()));
        assert_eq!(s.requests, 2);
        assert_eq!(s.consecutive_errors, 1);
        assert_eq!(s.total_errors, 1);
        assert_eq!(s.last_error.as_deref(), Some("reset"));
        assert_eq!(s.avg_response_time(), Duration::from_millis(20));

        // Success clears the streak but not the lifetime count
        s.record_outcome(true, Duration::from_millis(20), None);
        assert_eq!(s.consecutive_errors, 0);
        assert_eq!(s.total_errors, 1);
    }

    #[test]
    fn test_probe_bookkeeping() {
        let mut s = Session::new(2, Box::new(NullClient));
        s.record_probe_failure("timed out".to_string());
        s.record_probe_failure("timed out".to_string());
        assert_eq!(s.consecutive_errors, 2);

        s.record_probe_success();
        assert_eq!(s.consecutive_errors, 0);
        assert_eq!(s.total_errors, 2);
    }

    #[test]
    fn test_due_for_check() {
        let s = Session::new(3, Box::new(NullClient));
        let interval = Duration::from_millis(100);
        assert!(!s.due_for_check(Instant::now(), interval));
        assert!(s.due_for_check(Instant::now() + Duration::from_millis(150), interval));
    }
}

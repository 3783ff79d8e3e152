//! Session pool manager
//!
//! Owns the idle shelf, the waiting queue, the circuit breaker, and all
//! counters behind one mutex. The lock is never held across an await;
//! anything that blocks (connecting, probing, closing) happens in a
//! task that re-locks when it has a result to deposit.
//!
//! Sessions move by value: out of the idle shelf into a
//! [`SessionLease`], and back through [`Shared::offer`] on release. A
//! lease that is dropped without an explicit release returns its
//! session as successful unless a query marked it dirty.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ClientFactory, Rows};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::pool::circuit::{CircuitBreaker, CircuitTransition};
use crate::pool::events::{DestroyReason, PoolEvent, EVENT_CHANNEL_CAPACITY};
use crate::pool::health;
use crate::pool::queue::{Priority, WaitQueue};
use crate::pool::session::Session;
use crate::pool::stats::{PoolMetrics, PoolStats};

/// Mutable pool state, guarded by the `Shared` mutex
pub(crate) struct PoolInner {
    pub(crate) idle: Vec<Session>,
    pub(crate) in_use: usize,
    /// Sessions being established right now
    pub(crate) connecting: usize,
    /// Idle sessions temporarily taken out for a health probe
    pub(crate) probing: usize,
    pub(crate) queue: WaitQueue,
    pub(crate) breaker: CircuitBreaker,
    rr_cursor: usize,
    next_session_id: u64,
    monitor: Option<JoinHandle<()>>,
    pub(crate) shutting_down: bool,
}

impl PoolInner {
    /// Every session the pool currently accounts for
    pub(crate) fn total(&self) -> usize {
        self.idle.len() + self.in_use + self.connecting + self.probing
    }
}

/// State shared between pool handles and background tasks
pub(crate) struct Shared {
    pub(crate) config: PoolConfig,
    pub(crate) factory: ClientFactory,
    pub(crate) inner: Mutex<PoolInner>,
    pub(crate) metrics: PoolMetrics,
    pub(crate) events: broadcast::Sender<PoolEvent>,
}

impl Shared {
    /// Lock the pool state, recovering from a poisoned mutex. Panics in
    /// another task must not take the whole pool down with them.
    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    /// Record a breaker transition: bump counters and queue the event.
    /// Call with the lock held; events are flushed after it drops.
    pub(crate) fn note_transition(
        &self,
        inner: &PoolInner,
        transition: CircuitTransition,
        events: &mut Vec<PoolEvent>,
    ) {
        match transition {
            CircuitTransition::Opened => {
                self.metrics.breaker_opens.fetch_add(1, Ordering::Relaxed);
                warn!(
                    failures = inner.breaker.failure_count(),
                    "circuit breaker opened"
                );
                events.push(PoolEvent::CircuitOpened {
                    failures: inner.breaker.failure_count(),
                });
            }
            CircuitTransition::HalfOpened => {
                info!("circuit breaker half-open, admitting trials");
                events.push(PoolEvent::CircuitHalfOpened);
            }
            CircuitTransition::Closed => {
                info!("circuit breaker closed");
                events.push(PoolEvent::CircuitClosed);
            }
        }
    }

    /// Hand a session to the oldest eligible waiter, or shelve it.
    ///
    /// The grant travels as a ready [`SessionLease`], so a waiter that
    /// is cancelled after the grant was sent but before polling it
    /// still returns the session through the lease's drop. A waiter
    /// whose receiver is already gone (timed out between grant and
    /// delivery) hands the session back, and the next waiter is tried.
    pub(crate) fn offer(self: &Arc<Self>, inner: &mut PoolInner, mut session: Session) {
        while let Some(waiter) = inner.queue.pop_front() {
            let waited = waiter.enqueued_at.elapsed();
            let session_id = session.id;
            inner.in_use += 1;
            let lease = SessionLease {
                session: Some(session),
                shared: Arc::clone(self),
                dirty: false,
            };
            match waiter.tx.send(Ok(lease)) {
                Ok(()) => {
                    self.metrics.acquires.fetch_add(1, Ordering::Relaxed);
                    self.emit(PoolEvent::LeaseGranted { session_id });
                    debug!(
                        waited_ms = waited.as_millis() as u64,
                        "session granted to waiter"
                    );
                    return;
                }
                Err(returned) => {
                    inner.in_use -= 1;
                    // Deconstruct by hand; dropping the lease here would
                    // re-enter the pool lock.
                    session = match returned {
                        Ok(mut lease) => match lease.session.take() {
                            Some(s) => s,
                            None => return,
                        },
                        // A waiter only ever receives what we sent it
                        Err(_) => return,
                    };
                }
            }
        }
        inner.idle.push(session);
    }

    /// Discard a session: count it, announce it, close it in the
    /// background. Must not be called with the lock held.
    pub(crate) fn retire(self: &Arc<Self>, session: Session, reason: DestroyReason) {
        self.metrics.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = session.id, ?reason, "retiring session");
        self.emit(PoolEvent::SessionDestroyed {
            session_id: session.id,
            reason,
        });
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { session.close().await });
        }
    }

    /// Build one fresh session: connect, authenticate, verify.
    ///
    /// Each step gets its own time budget so a black-holed TCP connect
    /// cannot eat the whole establishment window.
    pub(crate) async fn establish(self: &Arc<Self>) -> Result<Session> {
        let endpoint = self.config.endpoint();
        let connect_budget = self.config.connection_timeout();
        let mut client = (self.factory)();

        match tokio::time::timeout(connect_budget, client.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::connection(&endpoint, "connect timed out")),
        }

        match tokio::time::timeout(
            connect_budget,
            client.login(&self.config.username, &self.config.password),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::connection(&endpoint, "login timed out")),
        }

        // Verification probe; a session that cannot answer the health
        // command is not worth pooling.
        match tokio::time::timeout(
            self.config.command_timeout(),
            client.run_query(&self.config.health_check_command, &[]),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::connection(&endpoint, "verification probe timed out")),
        }

        let id = {
            let mut inner = self.lock();
            let id = inner.next_session_id;
            inner.next_session_id += 1;
            id
        };
        self.metrics.sessions_created.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = id, endpoint = %endpoint, "session established");
        self.emit(PoolEvent::SessionCreated { session_id: id });
        Ok(Session::new(id, client))
    }

    /// Establish a session and deposit it in the pool.
    ///
    /// The caller must have incremented `connecting` under the lock
    /// before spawning this, so capacity accounting never overshoots.
    pub(crate) async fn establish_and_add(self: Arc<Self>) {
        let result = self.establish().await;
        let mut events = Vec::new();
        let mut failed_waiter = None;

        let mut inner = self.lock();
        inner.connecting -= 1;
        match result {
            Ok(session) => {
                if inner.shutting_down {
                    drop(inner);
                    self.retire(session, DestroyReason::Shutdown);
                    return;
                }
                self.offer(&mut inner, session);
            }
            Err(e) => {
                warn!(error = %e, "session establishment failed");
                if let Some(t) = inner.breaker.record_failure(Instant::now()) {
                    self.note_transition(&inner, t, &mut events);
                }
                // Fail the front waiter immediately instead of letting
                // it sit out its full acquire timeout.
                if let Some(waiter) = inner.queue.pop_front() {
                    failed_waiter = Some((waiter, e));
                }
            }
        }
        drop(inner);

        if let Some((waiter, e)) = failed_waiter {
            let _ = waiter.tx.send(Err(e));
        }
        for event in events {
            self.emit(event);
        }
    }

    /// Return a leased session to the pool.
    ///
    /// Synchronous so it can run from a lease Drop. `success` drives
    /// both the breaker and the per-session error streak; a session
    /// over its error threshold is retired and, if that leaves the pool
    /// under `min_size`, a replacement is started.
    pub(crate) fn give_back(self: &Arc<Self>, mut session: Session, success: bool) {
        self.metrics.releases.fetch_add(1, Ordering::Relaxed);
        let session_id = session.id;
        let mut events = vec![PoolEvent::LeaseReleased {
            session_id,
            success,
        }];
        let mut to_retire = None;
        let mut heal = 0usize;

        let mut inner = self.lock();
        inner.in_use -= 1;

        let transition = if success {
            inner.breaker.record_success()
        } else {
            inner.breaker.record_failure(Instant::now())
        };
        if let Some(t) = transition {
            self.note_transition(&inner, t, &mut events);
        }

        if inner.shutting_down {
            to_retire = Some((session, DestroyReason::Shutdown));
        } else if !success
            && session.consecutive_errors >= self.config.session_error_threshold
        {
            to_retire = Some((session, DestroyReason::Unhealthy));
            // total() no longer counts this session; replace it if the
            // retirement drops the pool under min_size or leaves parked
            // waiters with nothing incoming
            if inner.total() < self.config.min_size
                || (!inner.queue.is_empty() && inner.total() < self.config.max_size)
            {
                inner.connecting += 1;
                heal = 1;
            }
        } else {
            session.last_used_at = Instant::now();
            self.offer(&mut inner, session);
        }
        drop(inner);

        if let Some((session, reason)) = to_retire {
            self.retire(session, reason);
        }
        for _ in 0..heal {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(Arc::clone(self).establish_and_add());
            } else {
                let mut inner = self.lock();
                inner.connecting -= 1;
            }
        }
        for event in events {
            self.emit(event);
        }
    }
}

/// Options for a single command execution. Unset fields fall back to
/// the pool configuration.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Queue priority used when a session must be waited for
    pub priority: Priority,
    /// Override the configured total attempt count
    pub retry_attempts: Option<u32>,
    /// Override the per-attempt command timeout
    pub command_timeout: Option<Duration>,
    /// Override the first backoff gap
    pub retry_base_delay: Option<Duration>,
    /// Override the backoff cap
    pub retry_max_delay: Option<Duration>,
}

/// One command in a batch
#[derive(Debug, Clone)]
pub struct BatchCommand {
    pub command: String,
    pub params: Vec<(String, String)>,
    pub priority: Priority,
}

impl BatchCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: Vec::new(),
            priority: Priority::Normal,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Resilient session pool over one device management endpoint.
///
/// Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct SessionPool {
    shared: Arc<Shared>,
}

impl SessionPool {
    /// Create a pool. Validates the configuration; no sessions are
    /// opened until [`start`](Self::start).
    pub fn new(config: PoolConfig, factory: ClientFactory) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let breaker = CircuitBreaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_cooldown(),
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                factory,
                inner: Mutex::new(PoolInner {
                    idle: Vec::new(),
                    in_use: 0,
                    connecting: 0,
                    probing: 0,
                    queue: WaitQueue::new(),
                    breaker,
                    rr_cursor: 0,
                    next_session_id: 0,
                    monitor: None,
                    shutting_down: false,
                }),
                metrics: PoolMetrics::new(),
                events,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Pre-warm the pool to `min_size` and start the health monitor.
    ///
    /// If any session fails to establish, `start` reports the shortfall
    /// as an error but leaves the pool running: sessions that did come
    /// up stay pooled and the monitor keeps healing toward `min_size`.
    /// Calling `start` on an already started pool is a no-op.
    pub async fn start(&self) -> Result<()> {
        let target = {
            let mut inner = self.shared.lock();
            if inner.shutting_down {
                return Err(Error::ShuttingDown);
            }
            if inner.monitor.is_some() {
                return Ok(());
            }
            let target = self.shared.config.min_size.min(self.shared.config.max_size);
            inner.connecting += target;
            target
        };

        let mut handles = Vec::with_capacity(target);
        for _ in 0..target {
            handles.push(tokio::spawn(Arc::clone(&self.shared).establish_and_add()));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let started = {
            let mut inner = self.shared.lock();
            inner.monitor = Some(health::spawn_monitor(Arc::clone(&self.shared)));
            inner.idle.len()
        };
        if started < target {
            warn!(
                started,
                target, "pool started short; monitor will keep healing"
            );
            return Err(Error::connection(
                self.shared.config.endpoint(),
                format!("only {started} of {target} sessions established"),
            ));
        }
        info!(
            endpoint = %self.shared.config.endpoint(),
            sessions = started,
            min = self.shared.config.min_size,
            max = self.shared.config.max_size,
            "session pool started"
        );
        self.shared.emit(PoolEvent::PoolStarted { sessions: started });
        Ok(())
    }

    /// Acquire a session with the configured default timeout
    pub async fn acquire(&self, priority: Priority) -> Result<SessionLease> {
        self.acquire_within(priority, self.shared.config.acquire_timeout())
            .await
    }

    /// Acquire a session, waiting at most `budget`.
    ///
    /// Idle sessions are handed out round-robin so load spreads across
    /// the pool. When none is idle the caller parks in the priority
    /// queue; if there is headroom below `max_size`, a new session is
    /// started opportunistically.
    pub async fn acquire_within(
        &self,
        priority: Priority,
        budget: Duration,
    ) -> Result<SessionLease> {
        let shared = &self.shared;
        let mut events = Vec::new();

        let wait = {
            let mut inner = shared.lock();
            if inner.shutting_down {
                return Err(Error::ShuttingDown);
            }
            if shared.config.max_size == 0 {
                return Err(Error::PoolExhausted);
            }
            match inner.breaker.check_acquire(Instant::now()) {
                Ok(Some(t)) => shared.note_transition(&inner, t, &mut events),
                Ok(None) => {}
                Err(retry_in) => {
                    drop(inner);
                    for event in events {
                        shared.emit(event);
                    }
                    return Err(Error::CircuitOpen { retry_in });
                }
            }

            if let Some(session) = Self::take_idle(&mut inner) {
                inner.in_use += 1;
                drop(inner);
                for event in events {
                    shared.emit(event);
                }
                return Ok(self.grant(session));
            }

            let (waiter_id, rx) = inner.queue.push(priority);
            if inner.total() < shared.config.max_size {
                inner.connecting += 1;
                tokio::spawn(Arc::clone(shared).establish_and_add());
            }
            (waiter_id, rx)
        };
        for event in events {
            shared.emit(event);
        }

        let (waiter_id, mut rx) = wait;
        match tokio::time::timeout(budget, &mut rx).await {
            Ok(granted) => self.finish_wait(granted),
            Err(_) => {
                let removed = {
                    let mut inner = shared.lock();
                    inner.queue.remove(waiter_id)
                };
                if removed {
                    self.shared
                        .metrics
                        .acquire_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(?priority, ?budget, "acquire timed out");
                    Err(Error::AcquireTimeout(budget))
                } else {
                    // A grant raced the timer; it is already in flight
                    self.finish_wait(rx.await)
                }
            }
        }
    }

    fn finish_wait(
        &self,
        granted: std::result::Result<Result<SessionLease>, tokio::sync::oneshot::error::RecvError>,
    ) -> Result<SessionLease> {
        match granted {
            Ok(Ok(lease)) => Ok(lease),
            Ok(Err(e)) => Err(e),
            // Sender dropped without a grant; only happens at teardown
            Err(_) => Err(Error::ShuttingDown),
        }
    }

    fn grant(&self, session: Session) -> SessionLease {
        self.shared.metrics.acquires.fetch_add(1, Ordering::Relaxed);
        self.shared.emit(PoolEvent::LeaseGranted {
            session_id: session.id,
        });
        SessionLease {
            session: Some(session),
            shared: Arc::clone(&self.shared),
            dirty: false,
        }
    }

    /// Round-robin pick from the idle shelf
    fn take_idle(inner: &mut PoolInner) -> Option<Session> {
        let len = inner.idle.len();
        if len == 0 {
            return None;
        }
        let at = inner.rr_cursor % len;
        inner.rr_cursor = inner.rr_cursor.wrapping_add(1);
        Some(inner.idle.remove(at))
    }

    /// Execute one command with default options
    pub async fn execute(&self, command: &str, params: &[(String, String)]) -> Result<Rows> {
        self.execute_with(command, params, ExecuteOptions::default())
            .await
    }

    /// Execute one command, retrying retryable failures with
    /// exponentially backed-off, jittered delays.
    ///
    /// Acquisition failures (breaker open, timeout, shutdown) and
    /// device-reported command errors surface immediately; only
    /// connection-class failures and command timeouts are retried.
    pub async fn execute_with(
        &self,
        command: &str,
        params: &[(String, String)],
        opts: ExecuteOptions,
    ) -> Result<Rows> {
        let config = &self.shared.config;
        let attempts = opts.retry_attempts.unwrap_or(config.retry_attempts).max(1);
        let budget = opts.command_timeout.unwrap_or(config.command_timeout());
        let base_delay = opts.retry_base_delay.unwrap_or(config.retry_base_delay());
        let max_delay = opts.retry_max_delay.unwrap_or(config.retry_max_delay());

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match self.acquire(opts.priority).await {
                Ok(mut lease) => lease.query_within(command, params, budget).await,
                Err(e) => Err(e),
            };
            let e = match result {
                Ok(rows) => return Ok(rows),
                Err(e) => e,
            };
            if !e.is_retryable() || attempt >= attempts {
                return Err(e);
            }
            let delay = backoff_delay(base_delay, max_delay, attempt);
            debug!(
                command,
                attempt,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "retrying command"
            );
            self.shared
                .metrics
                .command_retries
                .fetch_add(1, Ordering::Relaxed);
            self.shared.emit(PoolEvent::CommandRetried {
                command: command.to_string(),
                attempt,
            });
            tokio::time::sleep(delay).await;
        }
    }

    /// Execute a batch of commands, high priority first, in chunks of
    /// `batch_size` with `batch_delay` between chunks.
    ///
    /// Results come back in the order the commands were given,
    /// regardless of priority scheduling.
    pub async fn execute_batch(&self, commands: Vec<BatchCommand>) -> Vec<Result<Rows>> {
        let mut order: Vec<usize> = Vec::with_capacity(commands.len());
        for wanted in [Priority::High, Priority::Normal, Priority::Low] {
            for (idx, cmd) in commands.iter().enumerate() {
                if cmd.priority == wanted {
                    order.push(idx);
                }
            }
        }

        let mut slots: Vec<Option<Result<Rows>>> = (0..commands.len()).map(|_| None).collect();
        let mut commands: Vec<Option<BatchCommand>> = commands.into_iter().map(Some).collect();

        let mut first = true;
        for chunk in order.chunks(self.shared.config.batch_size) {
            if !first {
                tokio::time::sleep(self.shared.config.batch_delay()).await;
            }
            first = false;

            let mut handles = Vec::with_capacity(chunk.len());
            for &idx in chunk {
                if let Some(cmd) = commands[idx].take() {
                    let pool = self.clone();
                    handles.push((
                        idx,
                        tokio::spawn(async move {
                            pool.execute_with(
                                &cmd.command,
                                &cmd.params,
                                ExecuteOptions {
                                    priority: cmd.priority,
                                    ..ExecuteOptions::default()
                                },
                            )
                            .await
                        }),
                    ));
                }
            }
            for (idx, handle) in handles {
                slots[idx] = Some(match handle.await {
                    Ok(result) => result,
                    Err(e) => Err(Error::Command(format!("batch task failed: {e}"))),
                });
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(Error::ShuttingDown)))
            .collect()
    }

    /// Point-in-time stats snapshot
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let inner = shared.lock();
        PoolStats {
            idle_sessions: inner.idle.len(),
            in_use_sessions: inner.in_use,
            pending_sessions: inner.connecting + inner.probing,
            total_sessions: inner.total(),
            waiting: inner.queue.len(),
            circuit_state: inner.breaker.state(),
            circuit_failures: inner.breaker.failure_count(),
            acquires: shared.metrics.acquires.load(Ordering::Relaxed),
            releases: shared.metrics.releases.load(Ordering::Relaxed),
            acquire_timeouts: shared.metrics.acquire_timeouts.load(Ordering::Relaxed),
            sessions_created: shared.metrics.sessions_created.load(Ordering::Relaxed),
            sessions_destroyed: shared.metrics.sessions_destroyed.load(Ordering::Relaxed),
            commands_executed: shared.metrics.commands_executed.load(Ordering::Relaxed),
            commands_failed: shared.metrics.commands_failed.load(Ordering::Relaxed),
            command_retries: shared.metrics.command_retries.load(Ordering::Relaxed),
            probes_passed: shared.metrics.probes_passed.load(Ordering::Relaxed),
            probes_failed: shared.metrics.probes_failed.load(Ordering::Relaxed),
            breaker_opens: shared.metrics.breaker_opens.load(Ordering::Relaxed),
            avg_command_latency: shared.metrics.avg_latency(),
            p50_command_latency: shared.metrics.latency_percentile(50.0),
            p95_command_latency: shared.metrics.latency_percentile(95.0),
            p99_command_latency: shared.metrics.latency_percentile(99.0),
        }
    }

    /// Subscribe to pool lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }

    /// Shut the pool down: reject parked waiters, stop the monitor,
    /// close idle sessions. Leases still out are closed on release.
    /// Idempotent.
    pub async fn stop(&self) {
        let (monitor, idle) = {
            let mut inner = self.shared.lock();
            if inner.shutting_down {
                return;
            }
            inner.shutting_down = true;
            inner.queue.reject_all();
            (inner.monitor.take(), std::mem::take(&mut inner.idle))
        };

        if let Some(handle) = monitor {
            handle.abort();
        }

        for session in idle {
            self.shared
                .metrics
                .sessions_destroyed
                .fetch_add(1, Ordering::Relaxed);
            self.shared.emit(PoolEvent::SessionDestroyed {
                session_id: session.id,
                reason: DestroyReason::Shutdown,
            });
            let _ = tokio::time::timeout(Duration::from_secs(5), session.close()).await;
        }

        info!(endpoint = %self.shared.config.endpoint(), "session pool stopped");
        self.shared.emit(PoolEvent::PoolStopped);
    }
}

/// A session on loan from the pool.
///
/// Dropping the lease returns the session; queries that fail with
/// connection-class errors mark it dirty so the drop release counts as
/// a failure.
pub struct SessionLease {
    session: Option<Session>,
    shared: Arc<Shared>,
    dirty: bool,
}

impl SessionLease {
    pub fn session_id(&self) -> u64 {
        match &self.session {
            Some(s) => s.id,
            None => 0,
        }
    }

    /// Run one command over the leased session, time-boxed by the
    /// configured command timeout.
    pub async fn query(&mut self, command: &str, params: &[(String, String)]) -> Result<Rows> {
        let budget = self.shared.config.command_timeout();
        self.query_within(command, params, budget).await
    }

    /// Run one command with an explicit time budget
    pub async fn query_within(
        &mut self,
        command: &str,
        params: &[(String, String)],
        budget: Duration,
    ) -> Result<Rows> {
        let session = match self.session.as_mut() {
            Some(s) => s,
            None => return Err(Error::ShuttingDown),
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(budget, session.client.run_query(command, params)).await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(Ok(rows)) => {
                session.record_outcome(true, elapsed, None);
                self.shared
                    .metrics
                    .commands_executed
                    .fetch_add(1, Ordering::Relaxed);
                self.shared.metrics.record_latency(elapsed);
                Ok(rows)
            }
            Ok(Err(e)) => {
                session.record_outcome(false, elapsed, Some(e.to_string()));
                self.shared
                    .metrics
                    .commands_failed
                    .fetch_add(1, Ordering::Relaxed);
                if e.is_retryable() {
                    self.dirty = true;
                }
                Err(e)
            }
            Err(_) => {
                let e = Error::CommandTimeout {
                    command: command.to_string(),
                    timeout: budget,
                };
                session.record_outcome(false, elapsed, Some(e.to_string()));
                self.shared
                    .metrics
                    .commands_failed
                    .fetch_add(1, Ordering::Relaxed);
                // A timed-out command may still answer later and desync
                // the wire; the session cannot be trusted.
                self.dirty = true;
                Err(e)
            }
        }
    }

    /// Return the session with an explicit verdict instead of relying
    /// on the drop heuristic.
    pub fn release(mut self, success: bool) {
        let verdict = success && !self.dirty;
        if let Some(mut session) = self.session.take() {
            if !verdict && !self.dirty {
                // Failure verdict without a recorded failed query still
                // counts toward the session's error streak
                session.consecutive_errors += 1;
                session.total_errors += 1;
            }
            let shared = Arc::clone(&self.shared);
            shared.give_back(session, verdict);
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session", &self.session)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let shared = Arc::clone(&self.shared);
            shared.give_back(session, !self.dirty);
        }
    }
}

/// Exponential backoff with additive jitter.
///
/// The nth failure waits min(base * 2^(n-1), max) plus up to 25% extra,
/// so the configured delay is a floor rather than an average.
fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let base = base.as_millis() as u64;
    let max = max.as_millis() as u64;
    let shift = failures.saturating_sub(1).min(20);
    let capped = base.saturating_mul(1u64 << shift).min(max);
    let jitter = if capped == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=capped / 4)
    };
    Duration::from_millis(capped + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::client::DeviceClient;
    use crate::pool::circuit::CircuitState;

    fn test_config() -> PoolConfig {
        let mut config = PoolConfig::new("router.test", "admin", "pw");
        config.min_size = 1;
        config.max_size = 3;
        config.acquire_timeout_ms = 200;
        config.connection_timeout_ms = 200;
        config.command_timeout_ms = 200;
        config.retry_base_delay_ms = 1;
        config.retry_max_delay_ms = 5;
        config.health_check_interval_ms = 60_000;
        config
    }

    struct OkClient;

    #[async_trait]
    impl DeviceClient for OkClient {
        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        async fn login(&mut self, _u: &str, _p: &str) -> Result<()> {
            Ok(())
        }
        async fn run_query(&mut self, command: &str, _p: &[(String, String)]) -> Result<Rows> {
            let mut row = std::collections::HashMap::new();
            row.insert("command".to_string(), command.to_string());
            Ok(vec![row])
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingClient;

    #[async_trait]
    impl DeviceClient for FailingClient {
        async fn connect(&mut self) -> Result<()> {
            Err(Error::connection("router.test:8728", "connection refused"))
        }
        async fn login(&mut self, _u: &str, _p: &str) -> Result<()> {
            Err(Error::connection("router.test:8728", "not connected"))
        }
        async fn run_query(&mut self, _c: &str, _p: &[(String, String)]) -> Result<Rows> {
            Err(Error::connection("router.test:8728", "not connected"))
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn ok_factory() -> ClientFactory {
        Arc::new(|| Box::new(OkClient))
    }

    fn failing_factory() -> ClientFactory {
        Arc::new(|| Box::new(FailingClient))
    }

    #[tokio::test]
    async fn test_acquire_release_round_trip() {
        let pool = SessionPool::new(test_config(), ok_factory()).unwrap();
        pool.start().await.unwrap();

        let lease = pool.acquire(Priority::Normal).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.in_use_sessions, 1);
        assert!(format!("{lease:?}").contains("SessionLease"));
        drop(lease);

        let stats = pool.stats();
        assert_eq!(stats.in_use_sessions, 0);
        assert_eq!(stats.idle_sessions, 1);
        assert_eq!(stats.acquires, 1);
        assert_eq!(stats.releases, 1);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_execute_returns_rows() {
        let pool = SessionPool::new(test_config(), ok_factory()).unwrap();
        pool.start().await.unwrap();

        let rows = pool.execute("/ppp/active/print", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("command").map(String::as_str),
            Some("/ppp/active/print")
        );
        assert_eq!(pool.stats().commands_executed, 1);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_breaker_opens_after_establishment_failures() {
        let mut config = test_config();
        config.min_size = 0;
        config.circuit_breaker_threshold = 2;
        let pool = SessionPool::new(config, failing_factory()).unwrap();
        pool.start().await.unwrap();

        for _ in 0..2 {
            let err = pool.acquire(Priority::Normal).await.unwrap_err();
            assert!(matches!(err, Error::Connection { .. }));
        }

        let stats = pool.stats();
        assert_eq!(stats.circuit_state, CircuitState::Open);
        assert!(matches!(
            pool.acquire(Priority::Normal).await.unwrap_err(),
            Error::CircuitOpen { .. }
        ));

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_zero_capacity_pool_is_exhausted() {
        let mut config = test_config();
        config.min_size = 0;
        config.max_size = 0;
        let pool = SessionPool::new(config, ok_factory()).unwrap();
        pool.start().await.unwrap();

        assert!(matches!(
            pool.acquire(Priority::Normal).await.unwrap_err(),
            Error::PoolExhausted
        ));
    }

    #[tokio::test]
    async fn test_acquire_timeout_when_pool_saturated() {
        let mut config = test_config();
        config.min_size = 1;
        config.max_size = 1;
        config.acquire_timeout_ms = 50;
        let pool = SessionPool::new(config, ok_factory()).unwrap();
        pool.start().await.unwrap();

        let _held = pool.acquire(Priority::Normal).await.unwrap();
        let err = pool.acquire(Priority::Normal).await.unwrap_err();
        assert!(matches!(err, Error::AcquireTimeout(_)));
        let stats = pool.stats();
        assert_eq!(stats.acquire_timeouts, 1);
        // The timed-out waiter unparked itself
        assert_eq!(stats.waiting, 0);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_waiter_granted_on_release() {
        let mut config = test_config();
        config.min_size = 1;
        config.max_size = 1;
        let pool = SessionPool::new(config, ok_factory()).unwrap();
        pool.start().await.unwrap();

        let held = pool.acquire(Priority::Normal).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Priority::Normal).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(pool.stats().in_use_sessions, 1);
        drop(lease);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_retry_surfaces_non_retryable_immediately() {
        struct TrapClient;
        #[async_trait]
        impl DeviceClient for TrapClient {
            async fn connect(&mut self) -> Result<()> {
                Ok(())
            }
            async fn login(&mut self, _u: &str, _p: &str) -> Result<()> {
                Ok(())
            }
            async fn run_query(&mut self, command: &str, _p: &[(String, String)]) -> Result<Rows> {
                if command == "/system/identity/print" {
                    return Ok(Vec::new());
                }
                Err(Error::Command("no such item".to_string()))
            }
            async fn close(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let pool = SessionPool::new(test_config(), Arc::new(|| Box::new(TrapClient) as Box<dyn DeviceClient>)).unwrap();
        pool.start().await.unwrap();

        let err = pool.execute("/ppp/secret/remove", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Command(_)));
        // No retries were attempted
        assert_eq!(pool.stats().command_retries, 0);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failures() {
        struct FlakyClient {
            failures_left: Arc<AtomicU64>,
        }
        #[async_trait]
        impl DeviceClient for FlakyClient {
            async fn connect(&mut self) -> Result<()> {
                Ok(())
            }
            async fn login(&mut self, _u: &str, _p: &str) -> Result<()> {
                Ok(())
            }
            async fn run_query(&mut self, command: &str, _p: &[(String, String)]) -> Result<Rows> {
                if command == "/system/identity/print" {
                    return Ok(Vec::new());
                }
                if self.failures_left.load(Ordering::SeqCst) > 0 {
                    self.failures_left.fetch_sub(1, Ordering::SeqCst);
                    return Err(Error::connection("router.test:8728", "reset"));
                }
                Ok(Vec::new())
            }
            async fn close(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let failures = Arc::new(AtomicU64::new(2));
        let factory: ClientFactory = {
            let failures = Arc::clone(&failures);
            Arc::new(move || {
                Box::new(FlakyClient {
                    failures_left: Arc::clone(&failures),
                }) as Box<dyn DeviceClient>
            })
        };

        let mut config = test_config();
        config.retry_attempts = 3;
        let pool = SessionPool::new(config, factory).unwrap();
        pool.start().await.unwrap();

        pool.execute("/ppp/active/print", &[]).await.unwrap();
        assert_eq!(pool.stats().command_retries, 2);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_stop_rejects_new_acquires() {
        let pool = SessionPool::new(test_config(), ok_factory()).unwrap();
        pool.start().await.unwrap();
        pool.stop().await;

        assert!(matches!(
            pool.acquire(Priority::Normal).await.unwrap_err(),
            Error::ShuttingDown
        ));
        // Idempotent
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_batch_preserves_input_order() {
        let pool = SessionPool::new(test_config(), ok_factory()).unwrap();
        pool.start().await.unwrap();

        let commands = vec![
            BatchCommand::new("/queue/simple/print").priority(Priority::Low),
            BatchCommand::new("/ppp/active/print").priority(Priority::High),
            BatchCommand::new("/interface/print"),
        ];
        let results = pool.execute_batch(commands).await;
        assert_eq!(results.len(), 3);
        let first = results[0].as_ref().unwrap();
        assert_eq!(
            first[0].get("command").map(String::as_str),
            Some("/queue/simple/print")
        );

        pool.stop().await;
    }

    #[test]
    fn test_backoff_schedule_is_floored_and_capped() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(500);

        for (failures, floor) in [(1u32, 100u64), (2, 200), (3, 400), (4, 500), (10, 500)] {
            let delay = backoff_delay(base, max, failures).as_millis() as u64;
            assert!(delay >= floor, "failure {failures}: {delay} < {floor}");
            assert!(delay <= floor + floor / 4);
        }
    }

    #[tokio::test]
    async fn test_retirement_with_waiters_spawns_replacement() {
        let mut config = test_config();
        config.min_size = 0;
        config.max_size = 1;
        config.session_error_threshold = 1;
        config.acquire_timeout_ms = 2_000;
        let pool = SessionPool::new(config, ok_factory()).unwrap();
        pool.start().await.unwrap();

        let held = pool.acquire(Priority::Normal).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Priority::Normal).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The failed release retires the only session; with min_size at
        // zero the parked waiter must still get a replacement.
        held.release(false);

        let lease = waiter.await.unwrap().unwrap();
        drop(lease);
        let stats = pool.stats();
        assert_eq!(stats.sessions_destroyed, 1);
        assert_eq!(stats.sessions_created, 2);

        pool.stop().await;
    }

    #[tokio::test]
    async fn test_explicit_failed_releases_trip_breaker() {
        let mut config = test_config();
        config.max_size = 1;
        config.circuit_breaker_threshold = 3;
        config.session_error_threshold = 100;
        let pool = SessionPool::new(config, ok_factory()).unwrap();
        pool.start().await.unwrap();

        for _ in 0..3 {
            let lease = pool.acquire(Priority::Normal).await.unwrap();
            lease.release(false);
        }
        assert_eq!(pool.stats().circuit_state, CircuitState::Open);
        assert!(matches!(
            pool.acquire(Priority::Normal).await.unwrap_err(),
            Error::CircuitOpen { .. }
        ));

        pool.stop().await;
    }
}

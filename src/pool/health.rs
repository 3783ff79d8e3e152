//! Background health monitor
//!
//! Runs one cycle per configured interval:
//! 1. evict idle sessions past the idle timeout, never shrinking the
//!    pool below `min_size`
//! 2. probe idle sessions that are due a check, retiring any that pass
//!    the per-session error threshold
//! 3. reconcile: start replacement sessions until the pool accounts for
//!    `min_size` again
//!
//! Probes run off the pool lock; a probed session is moved into a
//! `probing` slot so capacity accounting stays exact while it is away
//! from the idle shelf.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::pool::events::{DestroyReason, PoolEvent};
use crate::pool::manager::Shared;
use crate::pool::session::Session;

pub(crate) fn spawn_monitor(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(shared.config.health_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; the pool was just started,
        // so skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_cycle(&shared).await;
        }
    })
}

async fn run_cycle(shared: &Arc<Shared>) {
    let now = Instant::now();
    let idle_timeout = shared.config.idle_timeout();
    let check_interval = shared.config.health_check_interval();
    let min_size = shared.config.min_size;

    // Partition the idle shelf under the lock, act on it after.
    let (evicted, to_probe) = {
        let mut inner = shared.lock();
        if inner.shutting_down {
            return;
        }
        let mut total = inner.total();
        let idle = std::mem::take(&mut inner.idle);
        let mut keep = Vec::with_capacity(idle.len());
        let mut evicted = Vec::new();
        let mut to_probe = Vec::new();

        for session in idle {
            if session.idle_for(now) >= idle_timeout && total > min_size {
                total -= 1;
                evicted.push(session);
            } else if session.due_for_check(now, check_interval) {
                to_probe.push(session);
            } else {
                keep.push(session);
            }
        }
        inner.idle = keep;
        inner.probing += to_probe.len();
        (evicted, to_probe)
    };

    for session in evicted {
        debug!(session_id = session.id, "evicting idle session");
        shared.retire(session, DestroyReason::IdleTimeout);
    }

    let mut probes = Vec::with_capacity(to_probe.len());
    for session in to_probe {
        probes.push(tokio::spawn(probe_session(Arc::clone(shared), session)));
    }
    for probe in probes {
        let _ = probe.await;
    }

    // Reconcile toward min_size after evictions and probe retirements
    let deficit = {
        let mut inner = shared.lock();
        if inner.shutting_down {
            0
        } else {
            let deficit = min_size.saturating_sub(inner.total());
            inner.connecting += deficit;
            deficit
        }
    };
    if deficit > 0 {
        debug!(deficit, "healing pool toward min_size");
    }
    for _ in 0..deficit {
        tokio::spawn(Arc::clone(shared).establish_and_add());
    }
}

async fn probe_session(shared: Arc<Shared>, mut session: Session) {
    let budget = shared.config.command_timeout();
    let command = shared.config.health_check_command.clone();
    let session_id = session.id;

    let outcome = tokio::time::timeout(budget, session.client.run_query(&command, &[])).await;

    // Probe outcomes stay per-session: they drive eviction and the
    // stats, not the pool-wide breaker.
    match outcome {
        Ok(Ok(_)) => {
            session.record_probe_success();
            shared.metrics.probes_passed.fetch_add(1, Ordering::Relaxed);
            shared.emit(PoolEvent::HealthCheckPassed { session_id });

            let mut inner = shared.lock();
            inner.probing -= 1;
            if inner.shutting_down {
                drop(inner);
                shared.retire(session, DestroyReason::Shutdown);
            } else {
                shared.offer(&mut inner, session);
            }
        }
        probe_err => {
            let reason = match probe_err {
                Ok(Err(e)) => e.to_string(),
                _ => format!("probe timed out after {budget:?}"),
            };
            warn!(session_id, %reason, "health probe failed");
            session.record_probe_failure(reason);
            shared.metrics.probes_failed.fetch_add(1, Ordering::Relaxed);
            shared.emit(PoolEvent::HealthCheckFailed { session_id });

            let retire_now =
                session.consecutive_errors >= shared.config.session_error_threshold;
            let mut inner = shared.lock();
            inner.probing -= 1;
            if retire_now || inner.shutting_down {
                let reason = if inner.shutting_down {
                    DestroyReason::Shutdown
                } else {
                    DestroyReason::Unhealthy
                };
                drop(inner);
                shared.retire(session, reason);
            } else {
                shared.offer(&mut inner, session);
            }
        }
    }
}

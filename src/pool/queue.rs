//! Priority waiting queue for session acquisition
//!
//! When no idle session is available, acquirers park here. Waiters are
//! ordered by priority (high first) and FIFO within a priority level,
//! so a steady stream of high-priority work cannot reorder peers.
//!
//! Each waiter holds the sending half of a oneshot channel; a grant
//! moves a ready [`SessionLease`] through that channel, so a grant the
//! waiter never polls still returns its session on drop. A waiter that
//! timed out removes itself by id, and a grant that finds the receiver
//! gone (send fails) recovers the session for the next waiter.

use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::pool::manager::SessionLease;

/// Acquisition priority. Higher values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// One parked acquirer
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) priority: Priority,
    pub(crate) enqueued_at: Instant,
    pub(crate) tx: oneshot::Sender<Result<SessionLease>>,
}

/// Priority queue of parked acquirers.
///
/// Backed by a Vec kept sorted (high priority first, FIFO within a
/// level). Queue depths are bounded by concurrent callers, so linear
/// insertion is fine.
#[derive(Default)]
pub(crate) struct WaitQueue {
    waiters: Vec<Waiter>,
    next_id: u64,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            waiters: Vec::new(),
            next_id: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Park a new waiter, returning its id and the grant receiver
    pub(crate) fn push(
        &mut self,
        priority: Priority,
    ) -> (u64, oneshot::Receiver<Result<SessionLease>>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();

        // First slot whose priority is strictly lower: insertion there
        // keeps equal-priority waiters in arrival order.
        let at = self
            .waiters
            .partition_point(|w| w.priority >= priority);
        self.waiters.insert(
            at,
            Waiter {
                id,
                priority,
                enqueued_at: Instant::now(),
                tx,
            },
        );
        (id, rx)
    }

    /// Remove and return the highest-priority, oldest waiter
    pub(crate) fn pop_front(&mut self) -> Option<Waiter> {
        if self.waiters.is_empty() {
            None
        } else {
            Some(self.waiters.remove(0))
        }
    }

    /// Remove a waiter by id (timeout or cancellation). Returns false if
    /// the waiter was already granted.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(at) => {
                self.waiters.remove(at);
                true
            }
            None => false,
        }
    }

    /// Reject every parked waiter with [`Error::ShuttingDown`]
    pub(crate) fn reject_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(Err(Error::ShuttingDown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_pop_order_priority_then_fifo() {
        let mut q = WaitQueue::new();
        let (low, _rx1) = q.push(Priority::Low);
        let (norm1, _rx2) = q.push(Priority::Normal);
        let (high, _rx3) = q.push(Priority::High);
        let (norm2, _rx4) = q.push(Priority::Normal);

        assert_eq!(q.pop_front().map(|w| w.id), Some(high));
        assert_eq!(q.pop_front().map(|w| w.id), Some(norm1));
        assert_eq!(q.pop_front().map(|w| w.id), Some(norm2));
        assert_eq!(q.pop_front().map(|w| w.id), Some(low));
        assert!(q.pop_front().is_none());
    }

    #[test]
    fn test_remove_by_id() {
        let mut q = WaitQueue::new();
        let (a, _rxa) = q.push(Priority::Normal);
        let (b, _rxb) = q.push(Priority::Normal);

        assert!(q.remove(a));
        assert!(!q.remove(a));
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop_front().map(|w| w.id), Some(b));
    }

    #[tokio::test]
    async fn test_reject_all_delivers_shutdown() {
        let mut q = WaitQueue::new();
        let (_a, rxa) = q.push(Priority::High);
        let (_b, rxb) = q.push(Priority::Low);

        q.reject_all();
        assert!(q.is_empty());
        assert!(matches!(rxa.await, Ok(Err(Error::ShuttingDown))));
        assert!(matches!(rxb.await, Ok(Err(Error::ShuttingDown))));
    }
}

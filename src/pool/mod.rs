//! Session pooling: lifecycle, health, circuit breaking, retry

pub mod circuit;
pub mod events;
mod health;
pub mod manager;
pub mod queue;
mod session;
pub mod stats;

pub use circuit::CircuitState;
pub use events::{DestroyReason, PoolEvent};
pub use manager::{BatchCommand, ExecuteOptions, SessionLease, SessionPool};
pub use queue::Priority;
pub use stats::PoolStats;

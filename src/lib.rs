//! rospool - resilient session pool for RouterOS-style device APIs
//!
//! Multi-tenant provisioning systems hammer a single device management
//! endpoint with short commands. This crate keeps a bounded pool of
//! authenticated sessions in front of that endpoint and wraps every
//! command in the failure handling such a device needs in practice:
//!
//! - bounded pooling with round-robin handout and idle eviction
//! - a pool-wide circuit breaker with lazy half-open recovery
//! - a priority waiting queue for acquisition under saturation
//! - exponential-backoff retry for connection-class failures
//! - a background monitor that probes, evicts, and heals to `min_size`
//!
//! The wire protocol is not this crate's business: callers provide a
//! [`ClientFactory`] producing [`DeviceClient`] implementations, and
//! get back rows from [`SessionPool::execute`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use rospool::{PoolConfig, SessionPool};
//!
//! # async fn run(factory: rospool::ClientFactory) -> anyhow::Result<()> {
//! let config = PoolConfig::new("192.168.88.1", "admin", "secret");
//! let pool = SessionPool::new(config, factory)?;
//! pool.start().await?;
//!
//! let active = pool.execute("/ppp/active/print", &[]).await?;
//! println!("{} active sessions", active.len());
//!
//! pool.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod pool;

pub use client::{ClientFactory, DeviceClient, Rows};
pub use config::{load_config, PoolConfig};
pub use error::{Error, Result};
pub use pool::{
    BatchCommand, CircuitState, DestroyReason, ExecuteOptions, PoolEvent, PoolStats, Priority,
    SessionLease, SessionPool,
};

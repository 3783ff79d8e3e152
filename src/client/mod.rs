//! Outbound boundary to the device management API
//!
//! The pool treats the device protocol as an opaque RPC capability:
//! `connect`, `login`, `run_query`, `close`. Implementations own the wire
//! format; the pool only sequences calls and classifies failures through
//! the crate [`Error`](crate::error::Error) taxonomy.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// Reply rows from a device query. Each row is a flat attribute map
/// (e.g. `.id` -> `*1A`, `name` -> `pppoe-user1`).
pub type Rows = Vec<HashMap<String, String>>;

/// One connection to the remote device management endpoint.
///
/// Implementations must classify their failures before returning:
/// transport-level problems (refused, reset, unreachable, protocol
/// desync) as [`Error::Connection`](crate::error::Error::Connection),
/// device-reported command failures as
/// [`Error::Command`](crate::error::Error::Command).
#[async_trait]
pub trait DeviceClient: Send {
    /// Establish the underlying transport connection
    async fn connect(&mut self) -> Result<()>;

    /// Authenticate against the device
    async fn login(&mut self, username: &str, password: &str) -> Result<()>;

    /// Run one command with its parameters and return the reply rows
    async fn run_query(&mut self, command: &str, params: &[(String, String)]) -> Result<Rows>;

    /// Close the connection. Best-effort; the pool swallows close errors.
    async fn close(&mut self) -> Result<()>;
}

/// Factory creating fresh, unconnected device clients on demand.
///
/// The pool drives the connect/login/probe sequence itself so that each
/// step can be independently time-boxed.
pub type ClientFactory = Arc<dyn Fn() -> Box<dyn DeviceClient> + Send + Sync>;

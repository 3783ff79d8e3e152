use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Error;

/// Pool and device endpoint configuration
///
/// All durations are expressed in milliseconds in the serialized form to
/// keep YAML and environment overrides uniform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Device management endpoint hostname or IP
    pub host: String,

    /// Device management API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// API username
    pub username: String,

    /// API password
    pub password: String,

    /// Sessions kept open at all times
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    /// Hard ceiling on concurrently open sessions
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Default budget for a single acquire call
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Idle sessions older than this are evicted while above `min_size`
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Interval of the background health monitor
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Budget for each step of session establishment (connect, login)
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// Default budget for a single command attempt
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Consecutive failures before the circuit breaker opens
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// How long the breaker stays open before admitting a trial
    #[serde(default = "default_circuit_breaker_cooldown_ms")]
    pub circuit_breaker_cooldown_ms: u64,

    /// Total attempts for a retryable command (1 = no retry)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// First backoff gap between attempts
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Backoff cap
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Commands dispatched concurrently per batch chunk
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between batch chunks
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Lightweight probe command issued against idle sessions
    #[serde(default = "default_health_check_command")]
    pub health_check_command: String,

    /// Consecutive probe/command failures before a session is retired
    #[serde(default = "default_session_error_threshold")]
    pub session_error_threshold: u32,
}

fn default_port() -> u16 {
    8728
}

fn default_min_size() -> usize {
    2
}

fn default_max_size() -> usize {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_health_check_interval_ms() -> u64 {
    60_000
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_cooldown_ms() -> u64 {
    30_000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_delay_ms() -> u64 {
    50
}

fn default_health_check_command() -> String {
    "/system/identity/print".to_string()
}

fn default_session_error_threshold() -> u32 {
    3
}

impl PoolConfig {
    /// Create a configuration with defaults for everything but the endpoint
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: password.into(),
            min_size: default_min_size(),
            max_size: default_max_size(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_cooldown_ms: default_circuit_breaker_cooldown_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            health_check_command: default_health_check_command(),
            session_error_threshold: default_session_error_threshold(),
        }
    }

    /// "host:port" form used in connection errors and logs
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn circuit_breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_cooldown_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    /// Reject inconsistent values before the pool starts
    pub fn validate(&self) -> std::result::Result<(), Error> {
        let invalid = |field: &'static str, reason: &str| Error::Config {
            field,
            reason: reason.to_string(),
        };

        if self.min_size > self.max_size {
            return Err(invalid("min_size", "must be <= max_size"));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(invalid("acquire_timeout_ms", "must be > 0"));
        }
        if self.connection_timeout_ms == 0 {
            return Err(invalid("connection_timeout_ms", "must be > 0"));
        }
        if self.command_timeout_ms == 0 {
            return Err(invalid("command_timeout_ms", "must be > 0"));
        }
        if self.health_check_interval_ms == 0 {
            return Err(invalid("health_check_interval_ms", "must be > 0"));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(invalid("circuit_breaker_threshold", "must be > 0"));
        }
        if self.retry_attempts == 0 {
            return Err(invalid("retry_attempts", "must be >= 1"));
        }
        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be > 0"));
        }
        if self.session_error_threshold == 0 {
            return Err(invalid("session_error_threshold", "must be > 0"));
        }
        Ok(())
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<PoolConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: PoolConfig =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// Recognized variables:
/// - ROS_HOST, ROS_PORT, ROS_USERNAME, ROS_PASSWORD
/// - POOL_MIN_SIZE, POOL_MAX_SIZE
/// - POOL_ACQUIRE_TIMEOUT_MS, POOL_IDLE_TIMEOUT_MS
/// - POOL_HEALTH_CHECK_INTERVAL_MS, POOL_CONNECTION_TIMEOUT_MS
/// - POOL_COMMAND_TIMEOUT_MS
/// - POOL_CIRCUIT_THRESHOLD, POOL_CIRCUIT_COOLDOWN_MS
/// - POOL_RETRY_ATTEMPTS, POOL_RETRY_BASE_DELAY_MS, POOL_RETRY_MAX_DELAY_MS
/// - POOL_BATCH_SIZE, POOL_BATCH_DELAY_MS
pub fn load_from_env() -> Result<PoolConfig> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    let host = std::env::var("ROS_HOST").context("ROS_HOST environment variable not set")?;
    let username =
        std::env::var("ROS_USERNAME").context("ROS_USERNAME environment variable not set")?;
    let password =
        std::env::var("ROS_PASSWORD").context("ROS_PASSWORD environment variable not set")?;

    let mut config = PoolConfig::new(host, username, password);

    if let Ok(port) = std::env::var("ROS_PORT") {
        config.port = port.parse().context("ROS_PORT is not a valid port")?;
    }

    override_usize(&mut config.min_size, "POOL_MIN_SIZE");
    override_usize(&mut config.max_size, "POOL_MAX_SIZE");
    override_u64(&mut config.acquire_timeout_ms, "POOL_ACQUIRE_TIMEOUT_MS");
    override_u64(&mut config.idle_timeout_ms, "POOL_IDLE_TIMEOUT_MS");
    override_u64(
        &mut config.health_check_interval_ms,
        "POOL_HEALTH_CHECK_INTERVAL_MS",
    );
    override_u64(
        &mut config.connection_timeout_ms,
        "POOL_CONNECTION_TIMEOUT_MS",
    );
    override_u64(&mut config.command_timeout_ms, "POOL_COMMAND_TIMEOUT_MS");
    override_u32(
        &mut config.circuit_breaker_threshold,
        "POOL_CIRCUIT_THRESHOLD",
    );
    override_u64(
        &mut config.circuit_breaker_cooldown_ms,
        "POOL_CIRCUIT_COOLDOWN_MS",
    );
    override_u32(&mut config.retry_attempts, "POOL_RETRY_ATTEMPTS");
    override_u64(&mut config.retry_base_delay_ms, "POOL_RETRY_BASE_DELAY_MS");
    override_u64(&mut config.retry_max_delay_ms, "POOL_RETRY_MAX_DELAY_MS");
    override_usize(&mut config.batch_size, "POOL_BATCH_SIZE");
    override_u64(&mut config.batch_delay_ms, "POOL_BATCH_DELAY_MS");

    Ok(config)
}

fn override_u64(target: &mut u64, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(val) = raw.parse() {
            *target = val;
        }
    }
}

fn override_u32(target: &mut u32, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(val) = raw.parse() {
            *target = val;
        }
    }
}

fn override_usize(target: &mut usize, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(val) = raw.parse() {
            *target = val;
        }
    }
}

/// Load configuration from file or environment
///
/// Tries the YAML file when a path is given, otherwise falls back to
/// environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<PoolConfig> {
    let config = if let Some(path) = config_path {
        load_from_yaml(path)?
    } else {
        load_from_env()?
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_from_yaml() {
        let yaml = r#"
host: 192.168.88.1
port: 8728
username: admin
password: secret
min_size: 3
max_size: 8
circuit_breaker_threshold: 4
"#;

        let config: PoolConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.host, "192.168.88.1");
        assert_eq!(config.port, 8728);
        assert_eq!(config.min_size, 3);
        assert_eq!(config.max_size, 8);
        assert_eq!(config.circuit_breaker_threshold, 4);
        // Untouched fields keep their defaults
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.health_check_command, "/system/identity/print");
    }

    #[test]
    fn test_default_values() {
        let config = PoolConfig::new("router.lan", "admin", "pw");

        assert_eq!(config.port, 8728);
        assert_eq!(config.min_size, 2);
        assert_eq!(config.max_size, 10);
        assert_eq!(config.acquire_timeout_ms, 5_000);
        assert_eq!(config.circuit_breaker_threshold, 5);
        assert_eq!(config.session_error_threshold, 3);
        assert_eq!(config.endpoint(), "router.lan:8728");
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let mut config = PoolConfig::new("router.lan", "admin", "pw");
        config.min_size = 11;
        config.max_size = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = PoolConfig::new("router.lan", "admin", "pw");
        config.command_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = PoolConfig::new("router.lan", "admin", "pw");
        config.acquire_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_allows_zero_capacity_pool() {
        // max_size == 0 is structurally useless but not invalid; acquire
        // reports PoolExhausted instead.
        let mut config = PoolConfig::new("router.lan", "admin", "pw");
        config.min_size = 0;
        config.max_size = 0;
        assert!(config.validate().is_ok());
    }
}

//! Pool configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::PoolError;

/// Environment variable holding the number of worker slots.
pub const ENV_SIZE: &str = "RTTP_POOL_SIZE";
/// Environment variable holding the [`RespawnPolicy`] (`replace` or `retire`).
pub const ENV_RESPAWN: &str = "RTTP_POOL_RESPAWN";
/// Environment variable holding the event broadcast buffer length.
pub const ENV_EVENT_CAPACITY: &str = "RTTP_POOL_EVENT_CAPACITY";
/// Environment variable holding the default drain bound in milliseconds.
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "RTTP_POOL_SHUTDOWN_TIMEOUT_MS";

const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// What happens to a worker slot whose execution unit crashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RespawnPolicy {
    /// Spawn a new execution unit right away; capacity stays at the pool size.
    #[default]
    Replace,
    /// Retire the slot; the pool runs at reduced capacity from then on.
    Retire,
}

impl FromStr for RespawnPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "retire" => Ok(Self::Retire),
            other => Err(format!("expected `replace` or `retire`, got `{other}`")),
        }
    }
}

/// Worker pool configuration.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use rttp_pool::{PoolConfig, RespawnPolicy};
///
/// let config = PoolConfig::default()
///     .with_size(4)
///     .with_respawn(RespawnPolicy::Retire)
///     .with_shutdown_timeout(Duration::from_secs(5));
///
/// assert_eq!(config.size, 4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker slots (the concurrency bound).
    pub size: usize,

    /// Crash replacement policy.
    pub respawn: RespawnPolicy,

    /// Buffer length of the [`PoolEvent`](super::PoolEvent) broadcast channel.
    pub event_capacity: usize,

    /// Drain bound used by [`Pool::close`](super::Pool::close).
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: std::thread::available_parallelism().map_or(1, |n| n.get()),
            respawn: RespawnPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl PoolConfig {
    /// Set the number of worker slots
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the crash replacement policy
    pub fn with_respawn(mut self, respawn: RespawnPolicy) -> Self {
        self.respawn = respawn;
        self
    }

    /// Set the event broadcast buffer length
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the drain bound used by `close`
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Loads overrides from the process environment on top of the defaults.
    ///
    /// Reads [`ENV_SIZE`], [`ENV_RESPAWN`], [`ENV_EVENT_CAPACITY`] and
    /// [`ENV_SHUTDOWN_TIMEOUT_MS`]; unset variables keep their default.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if a variable cannot be parsed or
    /// the resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, PoolError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PoolError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_SIZE) {
            config.size = parse(ENV_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RESPAWN) {
            config.respawn = parse(ENV_RESPAWN, &raw)?;
        }
        if let Some(raw) = lookup(ENV_EVENT_CAPACITY) {
            config.event_capacity = parse(ENV_EVENT_CAPACITY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SHUTDOWN_TIMEOUT_MS) {
            config.shutdown_timeout = Duration::from_millis(parse(ENV_SHUTDOWN_TIMEOUT_MS, &raw)?);
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration can back a pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] for a zero `size` or a zero
    /// `event_capacity`.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.size == 0 {
            return Err(PoolError::InvalidConfig {
                key: "size",
                message: "a pool needs at least one worker".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(PoolError::InvalidConfig {
                key: "event_capacity",
                message: "the event buffer must hold at least one event".to_string(),
            });
        }
        Ok(())
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, PoolError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| PoolError::InvalidConfig {
        key,
        message: format!("`{raw}`: {e}"),
    })
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    use super::saturating_millis;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        saturating_millis(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

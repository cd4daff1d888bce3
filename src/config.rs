//! Configuration for suspend timeouts, id capacity and fatal handling.
//!
//! Settings resolve in this order, highest priority first:
//!
//! 1. values set through the `with_*` builder methods
//! 2. `THREADLIST_*` environment variables, applied by [`SuspendConfig::from_env`]
//! 3. the defaults from [`SuspendConfig::default`]
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `THREADLIST_SUSPEND_TIMEOUT_MS` | `u64` | `suspend_timeout` |
//! | `THREADLIST_THREAD_SUSPEND_TIMEOUT_MS` | `u64` | `thread_suspend_timeout` |
//! | `THREADLIST_DAEMON_SUSPEND_TIMEOUT_MS` | `u64` | `daemon_suspend_timeout` |
//! | `THREADLIST_MAX_THREAD_ID` | `u16` (non-zero) | `max_thread_id` |
//! | `THREADLIST_DUMP_NATIVE_STACKS` | `bool` | `dump_native_stacks` |
//! | `THREADLIST_FATAL_ACTION` | `abort` \| `panic` | `fatal_action` |

use std::time::Duration;

use crate::error::ConfigError;

/// Largest thread id; ids live in `1..=MAX_THREAD_ID`.
pub const MAX_THREAD_ID: u16 = 0xFFFF;
/// Never handed out.
pub const INVALID_THREAD_ID: u16 = 0;
/// Id of the first thread to register.
pub const MAIN_THREAD_ID: u16 = 1;

pub const ENV_SUSPEND_TIMEOUT_MS: &str = "THREADLIST_SUSPEND_TIMEOUT_MS";
pub const ENV_THREAD_SUSPEND_TIMEOUT_MS: &str = "THREADLIST_THREAD_SUSPEND_TIMEOUT_MS";
pub const ENV_DAEMON_SUSPEND_TIMEOUT_MS: &str = "THREADLIST_DAEMON_SUSPEND_TIMEOUT_MS";
pub const ENV_MAX_THREAD_ID: &str = "THREADLIST_MAX_THREAD_ID";
pub const ENV_DUMP_NATIVE_STACKS: &str = "THREADLIST_DUMP_NATIVE_STACKS";
pub const ENV_FATAL_ACTION: &str = "THREADLIST_FATAL_ACTION";

/// What to do once a fatal invariant violation has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalAction {
    /// Abort the process. The production setting.
    #[default]
    Abort,
    /// Panic on the detecting thread.
    Panic,
}

/// Tunables for a [`ThreadList`](crate::ThreadList).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use threadlist::{FatalAction, SuspendConfig};
///
/// let config = SuspendConfig::default()
///     .with_suspend_timeout(Duration::from_secs(5))
///     .with_fatal_action(FatalAction::Panic);
///
/// assert_eq!(config.suspend_timeout, Duration::from_secs(5));
/// assert_eq!(config.max_thread_id, threadlist::MAX_THREAD_ID);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendConfig {
    /// Bound on a stop-the-world, both for acknowledgements and for the
    /// exclusive world lock. Expiry is fatal.
    pub suspend_timeout: Duration,
    /// Bound on a single-thread suspend. Expiry is reported to the caller.
    pub thread_suspend_timeout: Duration,
    /// How long shutdown waits for daemon threads to park.
    pub daemon_suspend_timeout: Duration,
    /// Highest id the allocator hands out.
    pub max_thread_id: u16,
    /// Include per-thread native stacks in diagnostic dumps.
    pub dump_native_stacks: bool,
    pub fatal_action: FatalAction,
}

impl Default for SuspendConfig {
    fn default() -> Self {
        Self {
            suspend_timeout: Duration::from_secs(30),
            thread_suspend_timeout: Duration::from_secs(30),
            daemon_suspend_timeout: Duration::from_secs(2),
            max_thread_id: MAX_THREAD_ID,
            dump_native_stacks: true,
            fatal_action: FatalAction::Abort,
        }
    }
}

impl SuspendConfig {
    /// Defaults with `THREADLIST_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from an arbitrary variable source.
    ///
    /// Only variables the source knows are applied. A known variable with an
    /// unparseable value is an error and leaves the remaining fields untouched.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_SUSPEND_TIMEOUT_MS) {
            self.suspend_timeout = parse_millis(ENV_SUSPEND_TIMEOUT_MS, &val)?;
        }
        if let Some(val) = lookup(ENV_THREAD_SUSPEND_TIMEOUT_MS) {
            self.thread_suspend_timeout = parse_millis(ENV_THREAD_SUSPEND_TIMEOUT_MS, &val)?;
        }
        if let Some(val) = lookup(ENV_DAEMON_SUSPEND_TIMEOUT_MS) {
            self.daemon_suspend_timeout = parse_millis(ENV_DAEMON_SUSPEND_TIMEOUT_MS, &val)?;
        }
        if let Some(val) = lookup(ENV_MAX_THREAD_ID) {
            self.max_thread_id = parse_thread_id(ENV_MAX_THREAD_ID, &val)?;
        }
        if let Some(val) = lookup(ENV_DUMP_NATIVE_STACKS) {
            self.dump_native_stacks = parse_bool(ENV_DUMP_NATIVE_STACKS, &val)?;
        }
        if let Some(val) = lookup(ENV_FATAL_ACTION) {
            self.fatal_action = parse_fatal_action(ENV_FATAL_ACTION, &val)?;
        }
        Ok(())
    }

    pub fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = timeout;
        self
    }

    pub fn with_thread_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.thread_suspend_timeout = timeout;
        self
    }

    pub fn with_daemon_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.daemon_suspend_timeout = timeout;
        self
    }

    /// Clamp the id space to `1..=max`. Zero is treated as one.
    pub fn with_max_thread_id(mut self, max: u16) -> Self {
        self.max_thread_id = max.max(MAIN_THREAD_ID);
        self
    }

    pub fn with_dump_native_stacks(mut self, enabled: bool) -> Self {
        self.dump_native_stacks = enabled;
        self
    }

    pub fn with_fatal_action(mut self, action: FatalAction) -> Self {
        self.fatal_action = action;
        self
    }
}

fn parse_millis(var: &'static str, val: &str) -> Result<Duration, ConfigError> {
    val.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid(var, "milliseconds as unsigned integer", val))
}

fn parse_thread_id(var: &'static str, val: &str) -> Result<u16, ConfigError> {
    match val.trim().parse::<u16>() {
        Ok(id) if id != INVALID_THREAD_ID => Ok(id),
        _ => Err(invalid(var, "integer in 1..=65535", val)),
    }
}

fn parse_bool(var: &'static str, val: &str) -> Result<bool, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, "bool (true/false/1/0/yes/no)", val)),
    }
}

fn parse_fatal_action(var: &'static str, val: &str) -> Result<FatalAction, ConfigError> {
    match val.trim().to_lowercase().as_str() {
        "abort" => Ok(FatalAction::Abort),
        "panic" => Ok(FatalAction::Panic),
        _ => Err(invalid(var, "abort or panic", val)),
    }
}

fn invalid(var: &'static str, expected: &'static str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        expected,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn source(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_runtime_constants() {
        let config = SuspendConfig::default();
        assert_eq!(config.suspend_timeout, Duration::from_secs(30));
        assert_eq!(config.thread_suspend_timeout, Duration::from_secs(30));
        assert_eq!(config.daemon_suspend_timeout, Duration::from_secs(2));
        assert_eq!(config.max_thread_id, 0xFFFF);
        assert!(config.dump_native_stacks);
        assert_eq!(config.fatal_action, FatalAction::Abort);
    }

    #[test]
    fn overrides_apply_only_known_variables() {
        let mut config = SuspendConfig::default();
        config
            .apply_overrides(source(&[
                (ENV_SUSPEND_TIMEOUT_MS, "1500"),
                (ENV_MAX_THREAD_ID, " 128 "),
                (ENV_DUMP_NATIVE_STACKS, "off"),
                (ENV_FATAL_ACTION, "PANIC"),
            ]))
            .unwrap();

        assert_eq!(config.suspend_timeout, Duration::from_millis(1500));
        assert_eq!(config.thread_suspend_timeout, Duration::from_secs(30));
        assert_eq!(config.max_thread_id, 128);
        assert!(!config.dump_native_stacks);
        assert_eq!(config.fatal_action, FatalAction::Panic);
    }

    #[test]
    fn zero_thread_id_capacity_is_rejected() {
        let mut config = SuspendConfig::default();
        let err = config
            .apply_overrides(source(&[(ENV_MAX_THREAD_ID, "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: ENV_MAX_THREAD_ID,
                ..
            }
        ));
        assert_eq!(config.max_thread_id, MAX_THREAD_ID);
    }

    #[test]
    fn malformed_values_report_the_variable() {
        let mut config = SuspendConfig::default();
        let err = config
            .apply_overrides(source(&[(ENV_FATAL_ACTION, "explode")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_FATAL_ACTION));

        let err = config
            .apply_overrides(source(&[(ENV_DAEMON_SUSPEND_TIMEOUT_MS, "-5")]))
            .unwrap_err();
        assert!(err.to_string().contains("-5"));
    }

    #[test]
    fn builder_clamps_zero_capacity() {
        let config = SuspendConfig::default().with_max_thread_id(0);
        assert_eq!(config.max_thread_id, MAIN_THREAD_ID);
    }
}

//! Runtime configuration.
//!
//! Settings are read once, the first time the runtime needs them. Call
//! [`crate::runtime::configure`] before touching any class to override the
//! defaults; otherwise the environment is consulted:
//!
//! | Variable                  | Default | Meaning                                  |
//! |---------------------------|---------|------------------------------------------|
//! | `OBJRT_REGISTRY_CAPACITY` | `256`   | Bucket count of the global class registry |
//! | `OBJRT_NOTIFY_HOST`       | `true`  | Tell the host about derived classes       |
//!
//! Unparseable or out-of-range environment values are logged and ignored.

use crate::error::{Error, Result};
use log::warn;

/// Default bucket count of the global class registry.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 256;

/// Environment variable overriding [`RuntimeConfig::registry_capacity`].
pub const ENV_REGISTRY_CAPACITY: &str = "OBJRT_REGISTRY_CAPACITY";

/// Environment variable overriding [`RuntimeConfig::notify_host`].
pub const ENV_NOTIFY_HOST: &str = "OBJRT_NOTIFY_HOST";

/// Process-wide runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of buckets in the global registry. The registry never resizes.
    pub registry_capacity: usize,
    /// Whether singleton derivation reports new classes to the host.
    pub notify_host: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            registry_capacity: DEFAULT_REGISTRY_CAPACITY,
            notify_host: true,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().merge_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    #[must_use]
    pub fn merge_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup(ENV_REGISTRY_CAPACITY) {
            match raw.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => self.registry_capacity = capacity,
                _ => warn!("ignoring {ENV_REGISTRY_CAPACITY}={raw:?}: expected a positive integer"),
            }
        }

        if let Some(raw) = lookup(ENV_NOTIFY_HOST) {
            match parse_flag(&raw) {
                Some(flag) => self.notify_host = flag,
                None => warn!("ignoring {ENV_NOTIFY_HOST}={raw:?}: expected a boolean"),
            }
        }

        self
    }

    /// Sets the registry bucket count.
    #[must_use]
    pub fn with_registry_capacity(mut self, capacity: usize) -> Self {
        self.registry_capacity = capacity;
        self
    }

    /// Enables or disables host notification.
    #[must_use]
    pub fn with_notify_host(mut self, notify: bool) -> Self {
        self.notify_host = notify;
        self
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `registry_capacity` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.registry_capacity == 0 {
            return Err(Error::InvalidConfig {
                reason: "registry_capacity must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

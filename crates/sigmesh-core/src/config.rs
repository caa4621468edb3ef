//! Process-level runtime configuration.
//!
//! [`RuntimeConfig`] is a plain value type: no interior mutability, no
//! environment reads, no lazy state. Validate before handing it to a
//! context; an invalid configuration is rejected up front rather than
//! surfacing as stalls later.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A capacity field was zero.
    #[error("{field} must be non-zero")]
    ZeroCapacity {
        /// The offending field.
        field: &'static str,
    },

    /// The ACL delegation window was zero.
    #[error("acl_timeout must be non-zero")]
    ZeroAclTimeout,
}

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// Keep node records in process memory (tests, demos).
    Memory,
    /// Persist node records as files under the given directory.
    Dir(PathBuf),
}

/// Runtime options shared by every node in a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Subsystems to emit at debug level. Consumed by binaries when they
    /// build their log filter; library code only attaches the component
    /// name to its events.
    pub log_components: Vec<String>,
    /// Window for delegated ACL evaluation before `acl_timeout` fires.
    pub acl_timeout: Duration,
    /// Default buffer capacity for listener extensions.
    pub listener_capacity: usize,
    /// Mailbox capacity for every node.
    pub mailbox_capacity: usize,
    /// Node record storage backend.
    pub storage: StorageConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_components: Vec::new(),
            acl_timeout: Duration::from_millis(100),
            listener_capacity: 128,
            mailbox_capacity: 128,
            storage: StorageConfig::Memory,
        }
    }
}

impl RuntimeConfig {
    /// Checks the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.acl_timeout.is_zero() {
            return Err(ConfigError::ZeroAclTimeout);
        }
        if self.listener_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                field: "listener_capacity",
            });
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::ZeroCapacity {
                field: "mailbox_capacity",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        RuntimeConfig::default().validate().expect("default config");
    }

    #[test]
    fn zero_acl_window_rejected() {
        let mut config = RuntimeConfig::default();
        config.acl_timeout = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroAclTimeout));
    }

    #[test]
    fn zero_capacities_rejected() {
        let mut config = RuntimeConfig::default();
        config.mailbox_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroCapacity {
                field: "mailbox_capacity"
            })
        ));

        let mut config = RuntimeConfig::default();
        config.listener_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroCapacity {
                field: "listener_capacity"
            })
        ));
    }
}

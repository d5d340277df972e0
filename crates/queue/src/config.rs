//! Queue configuration

use mockbus_shared::{LogLevel, MockBusError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`DBusQueue`](crate::DBusQueue)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// Name given to the server thread
    pub server_thread_name: String,
    /// Log every message seen by the server connection at debug level
    pub install_debug_filter: bool,
    /// Indent used when the debug filter prints messages
    pub message_print_indent: usize,
    /// Timeout for blocking client calls that don't set their own, in milliseconds
    pub default_call_timeout_ms: u64,
    /// Install a fixed-level subscriber when the queue is created
    ///
    /// Accepts error, warn, info, debug or trace. Ignored if the process
    /// already has a subscriber.
    pub log_level: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            server_thread_name: "mockbus-queue-server".to_string(),
            install_debug_filter: true,
            message_print_indent: 2,
            default_call_timeout_ms: 25_000,
            log_level: None,
        }
    }
}

impl QueueConfig {
    /// Parses a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            MockBusError::invalid_argument(format!("invalid queue configuration: {}", e))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_thread_name.trim().is_empty() {
            return Err(MockBusError::invalid_argument(
                "server_thread_name must not be empty",
            ));
        }
        if self.default_call_timeout_ms == 0 {
            return Err(MockBusError::invalid_argument(
                "default_call_timeout_ms must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn default_call_timeout(&self) -> Duration {
        Duration::from_millis(self.default_call_timeout_ms)
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level.as_deref().map(LogLevel::parse)
    }
}

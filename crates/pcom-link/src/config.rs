//! Link configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one device link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Name used in logs and metric labels (usually the transport address).
    pub name: String,

    /// How long to wait for an ACK before retransmitting (milliseconds).
    pub ack_timeout_ms: u64,

    /// Retransmissions after the first attempt before a send fails.
    pub max_retries: u32,

    /// Whether outbound data frames request an ACK.
    pub ack_required: bool,

    /// How long each discovery query may wait for its reply (milliseconds).
    /// Should cover the full retry budget of the link.
    pub discovery_timeout_ms: u64,

    /// Size of the read buffer used by the async driver.
    pub read_buffer_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            name: "pcom".to_string(),
            ack_timeout_ms: 500,
            max_retries: 3,
            ack_required: true,
            discovery_timeout_ms: 3000,
            read_buffer_size: 1024,
        }
    }
}

impl LinkConfig {
    /// ACK timeout as a duration.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Discovery query timeout as a duration.
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    /// Set the link name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the ACK timeout.
    pub fn with_ack_timeout_ms(mut self, ack_timeout_ms: u64) -> Self {
        self.ack_timeout_ms = ack_timeout_ms;
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set whether data frames request an ACK.
    pub fn with_ack_required(mut self, ack_required: bool) -> Self {
        self.ack_required = ack_required;
        self
    }

    /// Set the discovery query timeout.
    pub fn with_discovery_timeout_ms(mut self, discovery_timeout_ms: u64) -> Self {
        self.discovery_timeout_ms = discovery_timeout_ms;
        self
    }
}

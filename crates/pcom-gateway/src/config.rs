//! Gateway configuration file.
//!
//! ```yaml
//! address: 192.168.1.40:4001
//! discover_on_connect: true
//! request_timeout_ms: 2000
//! link:
//!   ack_timeout_ms: 500
//!   max_retries: 3
//! names:
//!   motor1: 0x0101
//! error_codes:
//!   32: limit switch tripped
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use pcom_link::{Connection, LinkConfig};
use pcom_protocol::ErrorCodeTable;
use serde::{Deserialize, Serialize};

fn default_address() -> String {
    "127.0.0.1:4001".to_string()
}

fn default_request_timeout_ms() -> u64 {
    2000
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// TCP address of the serial bridge.
    #[serde(default = "default_address")]
    pub address: String,

    /// Link transport settings.
    #[serde(default)]
    pub link: LinkConfig,

    /// Run discovery as soon as the link is up.
    #[serde(default)]
    pub discover_on_connect: bool,

    /// How long `discover` waits overall.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Endpoint names known ahead of discovery.
    #[serde(default)]
    pub names: BTreeMap<String, u16>,

    /// Extra device status code descriptions.
    #[serde(default)]
    pub error_codes: BTreeMap<u16, String>,

    /// Address for the Prometheus exporter, if enabled.
    #[serde(default)]
    pub metrics_address: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            address: default_address(),
            link: LinkConfig::default(),
            discover_on_connect: false,
            request_timeout_ms: default_request_timeout_ms(),
            names: BTreeMap::new(),
            error_codes: BTreeMap::new(),
            metrics_address: None,
        }
    }
}

impl GatewayConfig {
    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parse YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Overall timeout for request-style operations.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Build a connection with the configured names and error codes.
    pub fn connection(&self) -> Connection {
        let mut errors = ErrorCodeTable::new();
        for (code, description) in &self.error_codes {
            errors.insert(*code, description.clone());
        }

        let link = self.link.clone().with_name(self.address.clone());
        let mut connection = Connection::new(link).with_error_codes(errors);
        for (name, id) in &self.names {
            connection.registry_mut().bind(name, *id);
        }
        connection
    }
}

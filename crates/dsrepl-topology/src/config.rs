//! Controller configuration file.

use crate::error::{Result, TopologyError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for one managed directory instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Server id (`localhost`) or a full LDAP URL.
    pub instance: String,
    /// Path of the administration tool.
    pub dsconf_path: PathBuf,
    /// Interval between initialization status checks.
    pub poll_interval_ms: u64,
    /// Give up polling after this many non-terminal checks. `None` polls
    /// until a terminal status is seen.
    pub max_poll_attempts: Option<u32>,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            instance: String::from("localhost"),
            dsconf_path: PathBuf::from("dsconf"),
            poll_interval_ms: 2000,
            max_poll_attempts: None,
            event_capacity: 256,
        }
    }
}

impl ControllerConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ControllerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(TopologyError::Config {
                    msg: format!("unsupported config file extension: {:?}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the controller cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(TopologyError::Config {
                msg: "poll_interval_ms must be greater than zero".to_string(),
            });
        }
        if self.max_poll_attempts == Some(0) {
            return Err(TopologyError::Config {
                msg: "max_poll_attempts must be greater than zero when set".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(TopologyError::Config {
                msg: "event_capacity must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// URL handed to the administration tool. A bare server id maps to the
    /// instance's LDAPI socket.
    pub fn instance_url(&self) -> String {
        if self.instance.contains("://") {
            self.instance.clone()
        } else {
            let id = self.instance.trim_start_matches("slapd-");
            format!("ldapi://%2fvar%2frun%2fslapd-{}.socket", id)
        }
    }
}

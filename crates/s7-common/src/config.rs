//! Configuration structures for the S7 adapter.
//!
//! Supports TOML deserialization with defaults matching the usual S7-300/400
//! setup (port 102, rack 0, slot 2) and the link timings the connection
//! manager runs with.

use crate::tag::TagDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level adapter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// PLC connection and link timings.
    pub connection: ConnectionConfig,

    /// Tag endpoints registered at startup.
    pub endpoints: Vec<EndpointConfig>,
}

/// Identifies one physical PLC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionTarget {
    /// Host name or IP address.
    pub host: String,
    /// ISO-on-TCP port.
    pub port: u16,
    /// Rack number.
    pub rack: u16,
    /// Slot number.
    pub slot: u16,
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (rack {}, slot {})", self.host, self.port, self.rack, self.slot)
    }
}

/// Connection configuration for one PLC link.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// PLC host name or IP address.
    pub host: String,

    /// ISO-on-TCP port.
    pub port: u16,

    /// Rack number.
    pub rack: u16,

    /// Slot number (2 for S7-300/400, 1 for S7-1200/1500).
    pub slot: u16,

    /// Time allowed for one connect attempt.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Delay between a link failure and the next connect attempt.
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// How often the transport's connection state is sampled.
    #[serde(with = "humantime_serde")]
    pub state_poll_interval: Duration,

    /// Watchdog for a single in-flight read or write.
    #[serde(with = "humantime_serde")]
    pub io_timeout: Duration,

    /// Floor for the cyclic read interval.
    #[serde(with = "humantime_serde")]
    pub min_cycle_interval: Duration,

    /// Cyclic read interval when no endpoint requests a period.
    #[serde(with = "humantime_serde")]
    pub default_cycle_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 102,
            rack: 0,
            slot: 2,
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(3),
            state_poll_interval: Duration::from_secs(1),
            io_timeout: Duration::from_secs(5),
            min_cycle_interval: Duration::from_millis(200),
            default_cycle_interval: Duration::from_secs(1),
        }
    }
}

impl ConnectionConfig {
    /// The PLC this configuration points at.
    #[must_use]
    pub fn target(&self) -> ConnectionTarget {
        ConnectionTarget {
            host: self.host.clone(),
            port: self.port,
            rack: self.rack,
            slot: self.slot,
        }
    }

    /// Cyclic read interval for the given endpoint periods.
    ///
    /// Half the shortest period, floored at `min_cycle_interval`; the
    /// default interval when no period is given.
    #[must_use]
    pub fn cycle_interval<I>(&self, periods: I) -> Duration
    where
        I: IntoIterator<Item = Duration>,
    {
        periods
            .into_iter()
            .filter(|p| !p.is_zero())
            .min()
            .map_or(self.default_cycle_interval, |p| {
                (p / 2).max(self.min_cycle_interval)
            })
    }
}

/// Direction of a tag endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// Reads the tag.
    #[default]
    Read,
    /// Writes the tag.
    Write,
}

/// One tag endpoint to register at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Read or write.
    #[serde(default)]
    pub kind: EndpointKind,

    /// Topic attached to every delivered result.
    #[serde(default)]
    pub topic: String,

    /// Period for periodic read endpoints.
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub period: Option<Duration>,

    /// Fire one read shortly after registration.
    #[serde(default)]
    pub trigger_once: bool,

    /// Values to write when the daemon triggers a write endpoint.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<crate::tag::TagValue>,

    /// The addressed tag.
    pub tag: TagDescriptor,
}

impl AdapterConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check values that deserialize fine but cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;
        if conn.host.trim().is_empty() {
            return Err(ConfigError::Invalid("connection.host is empty".into()));
        }
        if conn.port == 0 {
            return Err(ConfigError::Invalid("connection.port must be non-zero".into()));
        }
        let durations = [
            ("connect_timeout", conn.connect_timeout),
            ("reconnect_delay", conn.reconnect_delay),
            ("io_timeout", conn.io_timeout),
            ("min_cycle_interval", conn.min_cycle_interval),
            ("state_poll_interval", conn.state_poll_interval),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!(
                "connection.{name} must be non-zero"
            )));
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = Option::<String>::deserialize(deserializer)?;
            s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

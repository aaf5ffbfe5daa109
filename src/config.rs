//! Connection settings.
//!
//! [`Settings`] describes one peer: device role, session id, the SEMI timeouts
//! and the transport. Settings load from TOML; unknown keys are rejected so a
//! misspelled timeout never silently falls back to its default.
//!
//! Example `peer.toml`:
//!
//! ```toml
//! role = "equipment"
//! session_id = 1
//! linktest_interval = 30
//!
//! [timeouts]
//! t3 = 45
//! t5 = 10
//! t6 = 5
//! t7 = 10
//!
//! [transport]
//! type = "hsms"
//! address = "0.0.0.0"
//! port = 5000
//! mode = "passive"
//! ```
//!
//! Durations are given in seconds and may be fractional (`t1 = 0.5`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Result, SecsError};

/// Which end of the link this side plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    #[default]
    Host,
    Equipment,
}

/// Who opens the TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectMode {
    /// Connect out to the peer.
    #[default]
    #[serde(alias = "client")]
    Active,
    /// Listen for the peer.
    #[serde(alias = "server")]
    Passive,
}

/// SEMI E4 / E37 timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Timeouts {
    /// SECS-I inter-character timeout.
    #[serde(deserialize_with = "seconds")]
    pub t1: Duration,
    /// SECS-I protocol (ENQ/EOT, block/ACK) timeout.
    #[serde(deserialize_with = "seconds")]
    pub t2: Duration,
    /// Reply timeout.
    #[serde(deserialize_with = "seconds")]
    pub t3: Duration,
    /// SECS-I inter-block timeout.
    #[serde(deserialize_with = "seconds")]
    pub t4: Duration,
    /// Connect separation timeout.
    #[serde(deserialize_with = "seconds")]
    pub t5: Duration,
    /// Control transaction timeout.
    #[serde(deserialize_with = "seconds")]
    pub t6: Duration,
    /// Not-selected timeout.
    #[serde(deserialize_with = "seconds")]
    pub t7: Duration,
    /// Network inter-character timeout, bounds a single socket write.
    #[serde(deserialize_with = "seconds")]
    pub t8: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(10),
            t3: Duration::from_secs(45),
            t4: Duration::from_secs(45),
            t5: Duration::from_secs(10),
            t6: Duration::from_secs(5),
            t7: Duration::from_secs(10),
            t8: Duration::from_secs(5),
        }
    }
}

/// Where and how to reach the peer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum TransportSettings {
    /// HSMS over TCP.
    Hsms {
        /// Remote host for active mode; bind address (or the expected peer
        /// address when the listener is shared) for passive mode.
        address: String,
        port: u16,
        #[serde(default)]
        mode: ConnectMode,
        /// Close the listener once a peer is accepted.
        #[serde(default)]
        close_listener_after_accept: bool,
    },
    /// SECS-I blocks carried over a TCP stream (terminal servers).
    SecsiTcp {
        address: String,
        port: u16,
        #[serde(default)]
        mode: ConnectMode,
        #[serde(default)]
        close_listener_after_accept: bool,
    },
    /// SECS-I over a serial line.
    SecsiSerial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

impl TransportSettings {
    /// Whether this transport runs the HSMS engine.
    pub fn is_hsms(&self) -> bool {
        matches!(self, TransportSettings::Hsms { .. })
    }

    /// TCP port and mode, `None` for serial.
    pub fn tcp(&self) -> Option<(&str, u16, ConnectMode)> {
        match self {
            TransportSettings::Hsms {
                address, port, mode, ..
            }
            | TransportSettings::SecsiTcp {
                address, port, mode, ..
            } => Some((address.as_str(), *port, *mode)),
            TransportSettings::SecsiSerial { .. } => None,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings::Hsms {
            address: "127.0.0.1".to_string(),
            port: 5000,
            mode: ConnectMode::Active,
            close_listener_after_accept: false,
        }
    }
}

fn default_baud_rate() -> u32 {
    9600
}

/// Complete settings for one peer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    pub role: DeviceRole,
    /// HSMS session id / SECS-I device id.
    pub session_id: u16,
    /// Retry interval for establishing communication (S1F13), used by the
    /// equipment layer on top of this transport.
    #[serde(deserialize_with = "seconds")]
    pub establish_communication_timeout: Duration,
    /// Period of Linktest.req while connected.
    #[serde(deserialize_with = "seconds")]
    pub linktest_interval: Duration,
    /// SECS-I retry limit (RTY).
    pub retry_limit: u8,
    pub timeouts: Timeouts,
    pub transport: TransportSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            role: DeviceRole::Host,
            session_id: 0,
            establish_communication_timeout: Duration::from_secs(10),
            linktest_interval: Duration::from_secs(30),
            retry_limit: 3,
            timeouts: Timeouts::default(),
            transport: TransportSettings::default(),
        }
    }
}

impl Settings {
    /// Parse settings from a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let settings: Self = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SecsError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.session_id > 0x7FFF && !self.transport.is_hsms() {
            return Err(SecsError::Config(format!(
                "SECS-I device id {} does not fit in 15 bits",
                self.session_id
            )));
        }
        if self.session_id == crate::protocol::CONTROL_SESSION_ID {
            return Err(SecsError::Config(
                "session id 0xFFFF is reserved for control messages".to_string(),
            ));
        }
        if self.linktest_interval.is_zero() {
            return Err(SecsError::Config(
                "linktest_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Deserialize a duration given in (possibly fractional) seconds.
fn seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(value).map_err(serde::de::Error::custom)
}

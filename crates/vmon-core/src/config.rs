//! Timing constants and boot-time configuration

use embassy_time::Duration;
use thiserror_no_std::Error;

/// TCP port served on the device
pub const HTTP_PORT: u16 = 80;

/// Bytes of an inbound request kept for parsing
pub const MAX_REQUEST_SIZE: usize = 1024;

/// Chunk size used when streaming the log file
pub const LOG_CHUNK_SIZE: usize = 512;

/// Appends stop once the log medium has less than this many bytes free
pub const MIN_FREE_SPACE: u64 = 512 * 1024;

/// Task periods and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Pause between samples
    pub sample_interval: Duration,
    /// Pause between liveness pulses
    pub watchdog_interval: Duration,
    /// Pause before retrying accept when nothing is pending
    pub accept_retry: Duration,
    /// Upper bound on receiving one request
    pub read_timeout: Duration,
    /// Upper bound on sending one response, log downloads included
    pub response_timeout: Duration,
}

impl Timing {
    pub const DEFAULT: Self = Self {
        sample_interval: Duration::from_secs(5),
        watchdog_interval: Duration::from_secs(1),
        accept_retry: Duration::from_millis(100),
        read_timeout: Duration::from_secs(60),
        response_timeout: Duration::from_secs(120),
    };
}

impl Default for Timing {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("access point SSID is missing")]
    MissingSsid,
    #[error("access point SSID must be at most 32 bytes")]
    SsidTooLong,
    #[error("access point password must be 8 to 63 bytes")]
    BadPassword,
}

/// Credentials for the access point the device hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessPointConfig<'a> {
    pub ssid: &'a str,
    pub password: &'a str,
}

impl<'a> AccessPointConfig<'a> {
    pub fn new(ssid: &'a str, password: &'a str) -> Result<Self, ConfigError> {
        if ssid.is_empty() {
            return Err(ConfigError::MissingSsid);
        }
        if ssid.len() > 32 {
            return Err(ConfigError::SsidTooLong);
        }
        if !(8..=63).contains(&password.len()) {
            return Err(ConfigError::BadPassword);
        }
        Ok(Self { ssid, password })
    }

    /// Parse `WIFI.TXT`: SSID on the first line, password on the second.
    pub fn parse(text: &'a str) -> Result<Self, ConfigError> {
        let mut lines = text.lines().map(str::trim);
        let ssid = lines.next().unwrap_or("");
        let password = lines.next().unwrap_or("");
        Self::new(ssid, password)
    }
}

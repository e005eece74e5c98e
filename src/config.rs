//! Runtime configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::accessory::AccessoryInfo;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 3551;
const DEFAULT_INTERVAL: u64 = 1;
const DEFAULT_TIMEOUT: u64 = 5;
const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_NAME: &str = "APC UPS";
const DEFAULT_MANUFACTURER: &str = "American Power Conversion";
const DEFAULT_MODEL: &str = "APCAccess UPS";
const DEFAULT_SERIAL: &str = "unknown";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub interval: Duration,
    pub timeout: Duration,
    pub http_port: u16,
    pub accessory: AccessoryInfo,
    pub temperature_sensor: bool,
    pub error_logs_only: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let interval: u64 = parsed(&lookup, "INTERVAL", DEFAULT_INTERVAL)?;
        if interval == 0 {
            return Err(ConfigError::Invalid {
                key: "INTERVAL",
                value: "0".to_string(),
            });
        }

        Ok(Config {
            host: lookup("APCUPSD_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parsed(&lookup, "APCUPSD_PORT", DEFAULT_PORT)?,
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(parsed(&lookup, "TIMEOUT", DEFAULT_TIMEOUT)?),
            http_port: parsed(&lookup, "HTTP_PORT", DEFAULT_HTTP_PORT)?,
            accessory: AccessoryInfo {
                name: lookup("UPS_NAME").unwrap_or_else(|| DEFAULT_NAME.to_string()),
                manufacturer: lookup("UPS_MANUFACTURER")
                    .unwrap_or_else(|| DEFAULT_MANUFACTURER.to_string()),
                model: lookup("UPS_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                serial: lookup("UPS_SERIAL").unwrap_or_else(|| DEFAULT_SERIAL.to_string()),
            },
            temperature_sensor: flag(&lookup, "TEMPERATURE_SENSOR")?,
            error_logs_only: flag(&lookup, "ERROR_LOGS_ONLY")?,
        })
    }

    /// Default log filter; `RUST_LOG` still wins when set.
    pub fn log_level(&self) -> &'static str {
        if self.error_logs_only { "error" } else { "info" }
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<bool, ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { key, value }),
    }
}

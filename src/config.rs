//! Configuration system for the coop monitor
//!
//! The on-disk format is TOML ([`CoopConfig`]). Secrets never live in the file:
//! it names the environment variables that hold them, and those are resolved
//! once at startup into the immutable [`ConnectionConfig`] consumed by the link
//! and session layers.

use crate::session::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// MQTT 3.1.1 brokers are only required to accept client ids up to 23 bytes
const MAX_CLIENT_ID_LEN: usize = 23;

/// Top-level configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoopConfig {
    pub device: DeviceSection,
    pub link: LinkSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// MQTT client identifier (must match [a-zA-Z0-9._-]+)
    pub client_id: String,
    /// Period of the supervisor loop
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    100
}

/// Physical link medium
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Wired,
    Wireless,
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkType::Wired => write!(f, "wired"),
            LinkType::Wireless => write!(f, "wireless"),
        }
    }
}

/// Link section
///
/// `mac` is required for wired links, `ssid` and `password_env` for wireless.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkSection {
    #[serde(rename = "type")]
    pub link_type: LinkType,
    pub mac: Option<String>,
    pub ssid: Option<String>,
    /// Environment variable containing the WiFi passphrase
    pub password_env: Option<String>,
    /// Dynamic address attempts before falling back to the static address
    #[serde(default = "default_dhcp_attempts")]
    pub dhcp_attempts: u32,
    /// Used only when dynamic address acquisition fails
    pub fallback: Option<StaticAddress>,
}

fn default_dhcp_attempts() -> u32 {
    3
}

/// Static IPv4 settings applied when DHCP is unavailable
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticAddress {
    pub address: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Option<Ipv4Addr>,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    pub host: String,
    /// Defaults to 1883, or 8883 when `tls` is set
    pub port: Option<u16>,
    #[serde(default)]
    pub tls: bool,
    pub username: Option<String>,
    /// Environment variable containing the password or API token
    pub auth_token_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_keep_alive() -> u64 {
    15
}

fn default_handshake_timeout() -> u64 {
    10
}

/// Retry backoff settings shared by link and session retries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffSection {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_ms() -> u64 {
    1000
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Telemetry sampling and publishing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    /// Prefix for sample topics; `{client_id}` and `{username}` are expanded
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_qos")]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
    /// Directory scanned for 1-Wire temperature probes
    #[serde(default = "default_w1_path")]
    pub w1_devices_path: String,
}

fn default_topic_prefix() -> String {
    "coop/{client_id}".to_string()
}

fn default_sample_interval() -> u64 {
    60
}

fn default_buffer_capacity() -> usize {
    64
}

fn default_qos() -> QoS {
    QoS::AtLeastOnce
}

fn default_w1_path() -> String {
    "/sys/bus/w1/devices".to_string()
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            sample_interval_secs: default_sample_interval(),
            buffer_capacity: default_buffer_capacity(),
            qos: default_qos(),
            retain: false,
            w1_devices_path: default_w1_path(),
        }
    }
}

/// Health endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Hardware MAC address for wired links
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl FromStr for MacAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidConfig(format!("Invalid MAC address '{s}'"));
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(MacAddress(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Resolved link-layer credentials
#[derive(Clone, PartialEq)]
pub enum LinkCredentials {
    Wired { mac: MacAddress },
    Wireless { ssid: String, passphrase: String },
}

impl fmt::Debug for LinkCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkCredentials::Wired { mac } => f.debug_struct("Wired").field("mac", mac).finish(),
            LinkCredentials::Wireless { ssid, .. } => f
                .debug_struct("Wireless")
                .field("ssid", ssid)
                .field("passphrase", &"***")
                .finish(),
        }
    }
}

/// Immutable connection settings resolved at startup
///
/// Shared by the link and the session; never mutated after construction.
#[derive(Clone, PartialEq)]
pub struct ConnectionConfig {
    pub link_type: LinkType,
    pub credentials: LinkCredentials,
    pub dhcp_attempts: u32,
    pub fallback_static_address: Option<StaticAddress>,
    pub broker_address: String,
    pub broker_port: u16,
    pub tls: bool,
    pub client_id: String,
    pub username: Option<String>,
    pub auth_token: Option<String>,
    pub keep_alive: Duration,
    pub handshake_timeout: Duration,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("link_type", &self.link_type)
            .field("credentials", &self.credentials)
            .field("dhcp_attempts", &self.dhcp_attempts)
            .field("fallback_static_address", &self.fallback_static_address)
            .field("broker_address", &self.broker_address)
            .field("broker_port", &self.broker_port)
            .field("tls", &self.tls)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "***"))
            .field("keep_alive", &self.keep_alive)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl CoopConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: CoopConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.device.client_id)?;
        if self.device.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        match self.link.link_type {
            LinkType::Wired => {
                let mac = self.link.mac.as_deref().ok_or_else(|| {
                    ConfigError::InvalidConfig("wired link requires [link] mac".to_string())
                })?;
                mac.parse::<MacAddress>()?;
            }
            LinkType::Wireless => {
                if self.link.ssid.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::InvalidConfig(
                        "wireless link requires [link] ssid".to_string(),
                    ));
                }
                if self.link.password_env.is_none() {
                    return Err(ConfigError::InvalidConfig(
                        "wireless link requires [link] password_env".to_string(),
                    ));
                }
            }
        }

        if self.link.dhcp_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "dhcp_attempts must be at least 1".to_string(),
            ));
        }

        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker host must not be empty".to_string(),
            ));
        }
        if self.broker.port == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "broker port must be non-zero".to_string(),
            ));
        }
        if self.broker.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be at least 5".to_string(),
            ));
        }
        if self.broker.handshake_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "handshake_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let backoff = &self.backoff;
        if backoff.initial_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "backoff initial_ms must be greater than 0".to_string(),
            ));
        }
        if backoff.initial_ms > backoff.max_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "backoff initial_ms ({}) exceeds max_ms ({})",
                backoff.initial_ms, backoff.max_ms
            )));
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "backoff multiplier must be a finite value >= 1.0".to_string(),
            ));
        }

        if self.telemetry.buffer_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.telemetry.sample_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "sample_interval_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Broker port, defaulting by transport security
    pub fn broker_port(&self) -> u16 {
        self.broker
            .port
            .unwrap_or(if self.broker.tls { 8883 } else { 1883 })
    }

    /// Resolve secrets and produce the immutable connection record
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        self.validate()?;

        let credentials = match self.link.link_type {
            LinkType::Wired => {
                let mac = self.link.mac.as_deref().unwrap_or_default().parse()?;
                LinkCredentials::Wired { mac }
            }
            LinkType::Wireless => {
                let password_env = self.link.password_env.as_deref().unwrap_or_default();
                LinkCredentials::Wireless {
                    ssid: self.link.ssid.clone().unwrap_or_default(),
                    passphrase: Self::get_env_var_required(password_env)?,
                }
            }
        };

        // A named but unset token variable is a deployment error, not "no auth"
        let auth_token = match &self.broker.auth_token_env {
            Some(name) => Some(Self::get_env_var_required(name)?),
            None => None,
        };

        Ok(ConnectionConfig {
            link_type: self.link.link_type,
            credentials,
            dhcp_attempts: self.link.dhcp_attempts,
            fallback_static_address: self.link.fallback,
            broker_address: self.broker.host.clone(),
            broker_port: self.broker_port(),
            tls: self.broker.tls,
            client_id: self.device.client_id.clone(),
            username: self.broker.username.clone(),
            auth_token,
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            handshake_timeout: Duration::from_secs(self.broker.handshake_timeout_secs),
        })
    }

    /// Expand placeholders in the telemetry topic prefix
    pub fn topic_prefix(&self) -> String {
        self.telemetry
            .topic_prefix
            .replace("{client_id}", &self.device.client_id)
            .replace("{username}", self.broker.username.as_deref().unwrap_or(""))
            .trim_end_matches('/')
            .to_string()
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
client_id = "coop-test"

[link]
type = "wired"
mac = "90:A2:DA:0D:51:C8"

[broker]
host = "192.168.1.12"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate client ID characters and length
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' exceeds {MAX_CLIENT_ID_LEN} characters"
        )));
    }

    Ok(())
}

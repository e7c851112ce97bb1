use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Durations are written as integer milliseconds in configuration files
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration of one stream transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub ssl_enabled: bool,
    pub authentication_enabled: bool,
    pub certificate_path: Option<String>,
    pub key_path: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            id: "tcp".to_string(),
            address: "0.0.0.0".to_string(),
            port: 2222,
            ssl_enabled: false,
            authentication_enabled: true,
            certificate_path: None,
            key_path: None,
        }
    }
}

impl TransportConfig {
    pub fn new<S: Into<String>>(id: S, address: S, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_tls<S: Into<String>>(mut self, certificate_path: S, key_path: S) -> Self {
        self.ssl_enabled = true;
        self.certificate_path = Some(certificate_path.into());
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_authentication(mut self, enabled: bool) -> Self {
        self.authentication_enabled = enabled;
        self
    }
}

/// Server-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Name reported by `Hello`
    pub server_name: String,
    pub server_uuid: Uuid,
    pub default_locale: String,

    /// Time a new connection has to call `JSONRPC.Hello` (default 10s)
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Length of the window opened by an authentication failure (default 3s)
    #[serde(with = "duration_ms")]
    pub lockdown_duration: Duration,

    /// Time an asynchronous handler may take before "Command timed out" (default 30s)
    #[serde(with = "duration_ms")]
    pub async_reply_timeout: Duration,

    /// Unparsed bytes a connection may buffer before it is dropped (default 1 MiB)
    pub max_buffer_size: usize,

    pub max_pending_calls: usize,
    pub push_button_auth_available: bool,
    pub transports: Vec<TransportConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "hub".to_string(),
            server_uuid: Uuid::new_v4(),
            default_locale: "en_US".to_string(),
            handshake_timeout: Duration::from_secs(10),
            lockdown_duration: Duration::from_secs(3),
            async_reply_timeout: Duration::from_secs(30),
            max_buffer_size: 1024 * 1024,
            max_pending_calls: 1000,
            push_button_auth_available: false,
            transports: vec![TransportConfig::default()],
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check values for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue("serverName".to_string(), "must not be empty".to_string()));
        }
        if self.server_uuid.is_nil() {
            return Err(ConfigError::InvalidValue("serverUuid".to_string(), "must not be nil".to_string()));
        }
        for (field, duration) in [
            ("handshakeTimeout", self.handshake_timeout),
            ("lockdownDuration", self.lockdown_duration),
            ("asyncReplyTimeout", self.async_reply_timeout),
        ] {
            if duration.is_zero() {
                return Err(ConfigError::InvalidValue(field.to_string(), "must be greater than zero".to_string()));
            }
        }
        if self.max_buffer_size == 0 {
            return Err(ConfigError::InvalidValue("maxBufferSize".to_string(), "must be greater than zero".to_string()));
        }
        if self.max_pending_calls == 0 {
            return Err(ConfigError::InvalidValue("maxPendingCalls".to_string(), "must be greater than zero".to_string()));
        }

        let mut ids = std::collections::HashSet::new();
        for transport in &self.transports {
            if !ids.insert(transport.id.as_str()) {
                return Err(ConfigError::InvalidValue("transports".to_string(), format!("duplicate id '{}'", transport.id)));
            }
            if transport.address.parse::<std::net::IpAddr>().is_err() {
                return Err(ConfigError::InvalidValue(
                    format!("transports.{}.address", transport.id),
                    format!("'{}' is not an IP address", transport.address),
                ));
            }
            if transport.ssl_enabled && (transport.certificate_path.is_none() || transport.key_path.is_none()) {
                return Err(ConfigError::InvalidValue(
                    format!("transports.{}", transport.id),
                    "TLS requires certificatePath and keyPath".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    #[cfg(feature = "yaml-support")]
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&std::fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }
}

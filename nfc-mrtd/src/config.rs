//! Engine configuration, stored as TOML.


use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapter::AdapterKind;
use crate::passport::AuthMethod;


pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 40_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUD_RATE: u32 = 115_200;


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, #[source] source: io::Error },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid MIFARE key {key:?}: expected 12 hexadecimal digits")]
    InvalidKey { key: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}


#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialConfig {
    /// Device path of the serial port.
    pub port: String,
    pub baud_rate: u32,
}
impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERIAL_PORT.to_owned(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}


#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PcscConfig {
    /// Name of the reader to watch; every reader if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reader: Option<String>,
}


#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MifareConfig {
    /// Key A tried on every MIFARE Classic sector, in hex.
    pub key_a: String,
}
impl Default for MifareConfig {
    fn default() -> Self {
        Self {
            key_a: hex::encode_upper(crate::tag::DEFAULT_KEY),
        }
    }
}


#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub adapter: AdapterKind,
    pub auth_method: AuthMethod,

    /// Whether discovered cards are read without being asked to.
    pub auto_read: bool,

    pub command_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub serial: SerialConfig,
    pub pcsc: PcscConfig,
    pub mifare: MifareConfig,
}
impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::default(),
            auth_method: AuthMethod::default(),
            auto_read: true,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            serial: SerialConfig::default(),
            pcsc: PcscConfig::default(),
            mifare: MifareConfig::default(),
        }
    }
}
impl EngineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Zero { field: "command_timeout_ms" });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero { field: "poll_interval_ms" });
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Zero { field: "serial.baud_rate" });
        }
        self.mifare_key_a()?;
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn mifare_key_a(&self) -> Result<[u8; 6], ConfigError> {
        let invalid = || ConfigError::InvalidKey { key: self.mifare.key_a.clone() };
        let bytes = hex::decode(&self.mifare.key_a)
            .map_err(|_| invalid())?;
        bytes.try_into()
            .map_err(|_| invalid())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.command_timeout(), Duration::from_secs(40));
        assert_eq!(config.mifare_key_a().unwrap(), [0xFF; 6]);
        assert!(config.auto_read);
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
    }

    #[test]
    fn test_parse() {
        let config = EngineConfig::from_toml_str(r#"
            adapter = "serial"
            auth_method = "pace"
            auto_read = false
            command_timeout_ms = 5000

            [serial]
            port = "/dev/ttyACM0"

            [mifare]
            key_a = "a0a1a2a3a4a5"
        "#).unwrap();
        assert_eq!(config.adapter, AdapterKind::Serial);
        assert_eq!(config.auth_method, AuthMethod::Pace);
        assert!(!config.auto_read);
        assert_eq!(config.command_timeout_ms, 5000);
        assert_eq!(config.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.mifare_key_a().unwrap(), [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]);
    }

    #[test]
    fn test_rejects() {
        assert!(matches!(
            EngineConfig::from_toml_str("adapter = \"bluetooth\""),
            Err(ConfigError::Parse(_)),
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[mifare]\nkey_a = \"FFFF\""),
            Err(ConfigError::InvalidKey { .. }),
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("command_timeout_ms = 0"),
            Err(ConfigError::Zero { field: "command_timeout_ms" }),
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("colour = \"blue\""),
            Err(ConfigError::Parse(_)),
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = EngineConfig::default();
        config.adapter = AdapterKind::Mock;
        config.pcsc.reader = Some("ACS ACR122U".to_owned());
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("adapter = \"mock\""));
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}

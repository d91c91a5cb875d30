//! Configuration for listeners, master connections and serial ports
//!
//! All structs deserialize from JSON or YAML with every field optional;
//! missing fields take the defaults below. Durations are written as integer
//! milliseconds.
//!
//! ```rust
//! use modbus_stack::config::{LoadableConfig, TcpListenerConfig};
//!
//! let config = TcpListenerConfig::from_yaml_str("bind_address: 127.0.0.1:1502\nheadless: true\n").unwrap();
//! assert!(config.headless);
//! assert_eq!(config.max_connections, 50);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};
use crate::transport::SerialEncoding;

/// Serde helpers writing a `Duration` as milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    /// Same for `Option<Duration>`
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

/// Loading and validation shared by every configuration struct
pub trait LoadableConfig: DeserializeOwned {
    /// Check value ranges
    fn validate(&self) -> ModbusResult<()>;

    fn from_json_str(json: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    fn from_yaml_str(yaml: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }
}

fn default_timeout() -> Duration {
    Duration::from_millis(crate::DEFAULT_TIMEOUT_MS)
}

fn default_retries() -> u32 {
    crate::DEFAULT_RETRIES
}

fn default_bind_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT))
}

fn default_master_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], crate::DEFAULT_PORT))
}

fn default_max_connections() -> usize {
    50
}

fn check_timeout(timeout: Duration) -> ModbusResult<()> {
    if timeout.is_zero() {
        return Err(ModbusError::configuration("Timeout must be greater than zero"));
    }
    Ok(())
}

/// TCP listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpListenerConfig {
    pub bind_address: SocketAddr,
    /// Maximum concurrently served connections; further accepts wait
    pub max_connections: usize,
    /// Read timeout of each connection
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub headless: bool,
    pub packet_logging: bool,
}

impl Default for TcpListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
            timeout: default_timeout(),
            headless: false,
            packet_logging: false,
        }
    }
}

impl LoadableConfig for TcpListenerConfig {
    fn validate(&self) -> ModbusResult<()> {
        if self.max_connections == 0 {
            return Err(ModbusError::configuration("max_connections must be at least 1"));
        }
        check_timeout(self.timeout)
    }
}

/// UDP listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpListenerConfig {
    pub bind_address: SocketAddr,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub packet_logging: bool,
}

impl Default for UdpListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            timeout: default_timeout(),
            packet_logging: false,
        }
    }
}

impl LoadableConfig for UdpListenerConfig {
    fn validate(&self) -> ModbusResult<()> {
        check_timeout(self.timeout)
    }
}

/// TCP master configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpMasterConfig {
    pub address: SocketAddr,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub headless: bool,
    /// Additional attempts after the first one
    pub retries: u32,
    pub packet_logging: bool,
}

impl Default for TcpMasterConfig {
    fn default() -> Self {
        Self {
            address: default_master_address(),
            timeout: default_timeout(),
            headless: false,
            retries: default_retries(),
            packet_logging: false,
        }
    }
}

impl LoadableConfig for TcpMasterConfig {
    fn validate(&self) -> ModbusResult<()> {
        check_timeout(self.timeout)
    }
}

/// UDP master configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpMasterConfig {
    pub address: SocketAddr,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub retries: u32,
    pub packet_logging: bool,
}

impl Default for UdpMasterConfig {
    fn default() -> Self {
        Self {
            address: default_master_address(),
            timeout: default_timeout(),
            retries: default_retries(),
            packet_logging: false,
        }
    }
}

impl LoadableConfig for UdpMasterConfig {
    fn validate(&self) -> ModbusResult<()> {
        check_timeout(self.timeout)
    }
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Serial port parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialParameters {
    pub port_name: String,
    pub baud_rate: u32,
    /// 5 to 8
    pub data_bits: u8,
    /// 1 or 2
    pub stop_bits: u8,
    pub parity: Parity,
    pub encoding: SerialEncoding,
    /// Grace period after opening the port
    #[serde(with = "duration_ms")]
    pub open_delay: Duration,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Silence ending an RTU frame of unknown length; derived from the baud rate when unset
    #[serde(with = "duration_ms::option")]
    pub inter_char_timeout: Option<Duration>,
    pub retries: u32,
    pub packet_logging: bool,
}

impl Default for SerialParameters {
    fn default() -> Self {
        Self {
            port_name: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            encoding: SerialEncoding::Rtu,
            open_delay: Duration::ZERO,
            timeout: default_timeout(),
            inter_char_timeout: None,
            retries: default_retries(),
            packet_logging: false,
        }
    }
}

impl SerialParameters {
    pub fn tokio_data_bits(&self) -> ModbusResult<tokio_serial::DataBits> {
        match self.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(ModbusError::configuration(format!("Invalid data bits: {}", other))),
        }
    }

    pub fn tokio_stop_bits(&self) -> ModbusResult<tokio_serial::StopBits> {
        match self.stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(ModbusError::configuration(format!("Invalid stop bits: {}", other))),
        }
    }

    pub fn tokio_parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        }
    }
}

impl LoadableConfig for SerialParameters {
    fn validate(&self) -> ModbusResult<()> {
        if self.port_name.is_empty() {
            return Err(ModbusError::configuration("port_name must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::configuration("baud_rate must be greater than zero"));
        }
        self.tokio_data_bits()?;
        self.tokio_stop_bits()?;
        if self.encoding == SerialEncoding::Rtu && self.data_bits != 8 {
            return Err(ModbusError::configuration("RTU encoding requires 8 data bits"));
        }
        check_timeout(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TcpListenerConfig::default();
        assert_eq!(config.bind_address.port(), 502);
        assert_eq!(config.timeout, Duration::from_millis(3000));
        assert!(config.validate().is_ok());

        let params = SerialParameters::default();
        assert_eq!(params.encoding, SerialEncoding::Rtu);
        assert_eq!(params.retries, 5);
    }

    #[test]
    fn test_json_durations_are_milliseconds() {
        let config = TcpMasterConfig::from_json_str(r#"{"address": "10.0.0.2:1502", "timeout": 250}"#).unwrap();
        assert_eq!(config.address.port(), 1502);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.retries, 5);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeout"], 250);
    }

    #[test]
    fn test_serial_yaml() {
        let yaml = "port_name: /dev/ttyS1\nbaud_rate: 19200\nencoding: ascii\ndata_bits: 7\nparity: even\nopen_delay: 500\ninter_char_timeout: 20\n";
        let params = SerialParameters::from_yaml_str(yaml).unwrap();
        assert_eq!(params.encoding, SerialEncoding::Ascii);
        assert_eq!(params.parity, Parity::Even);
        assert_eq!(params.open_delay, Duration::from_millis(500));
        assert_eq!(params.inter_char_timeout, Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_validation_failures() {
        assert!(matches!(
            TcpListenerConfig::from_json_str(r#"{"max_connections": 0}"#),
            Err(ModbusError::Configuration { .. })
        ));
        assert!(SerialParameters::from_yaml_str("data_bits: 9\n").is_err());
        assert!(SerialParameters::from_yaml_str("encoding: rtu\ndata_bits: 7\n").is_err());
        assert!(UdpMasterConfig::from_json_str(r#"{"timeout": 0}"#).is_err());
        assert!(UdpListenerConfig::from_json_str("not json").is_err());
    }
}

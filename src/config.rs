//! Configuration loading
//!
//! Everything is optional: an empty YAML document yields the reference
//! setup (slave 1 on `/dev/ttyUSB0` at 115200 8N1, the EPSolar register
//! profile, 500 ms / 3 attempts / 50 ms polling and the 30 s / 60 s / 120 s
//! power cycle). Durations are given in milliseconds.
//!
//! ```yaml
//! serial:
//!   port: /dev/ttyAMA0
//!   read_strategy: full_frame
//! poller:
//!   attempt_timeout_ms: 800
//! power:
//!   sleep_interval_ms: 300000
//! debug: true
//! ```

use std::collections::HashSet;
use std::path::Path;
use serde::{Deserialize, Serialize};

use crate::error::{ModbusError, ModbusResult};
use crate::poller::PollerConfig;
use crate::power::PowerConfig;
use crate::register::{epsolar_profile, RegisterDescriptor};
use crate::transport::ReadStrategy;

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    #[default]
    None,
    Odd,
    Even,
}

impl From<SerialParity> for tokio_serial::Parity {
    fn from(parity: SerialParity) -> Self {
        match parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Odd => tokio_serial::Parity::Odd,
            SerialParity::Even => tokio_serial::Parity::Even,
        }
    }
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: SerialParity,
    pub stop_bits: u8,
    pub read_strategy: ReadStrategy,
    /// Hex dump every frame at INFO level
    pub log_packets: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
            read_strategy: ReadStrategy::StagedPrefix,
            log_packets: false,
        }
    }
}

impl SerialConfig {
    pub fn data_bits(&self) -> ModbusResult<tokio_serial::DataBits> {
        match self.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(ModbusError::configuration(format!("Unsupported data bits: {}", other))),
        }
    }

    pub fn stop_bits(&self) -> ModbusResult<tokio_serial::StopBits> {
        match self.stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(ModbusError::configuration(format!("Unsupported stop bits: {}", other))),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> ModbusResult<()> {
        if self.port.is_empty() {
            return Err(ModbusError::configuration("Serial port path is empty"));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::configuration("Baud rate must be non-zero"));
        }
        self.data_bits()?;
        self.stop_bits()?;
        Ok(())
    }
}

/// Complete poller configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub serial: SerialConfig,
    pub poller: PollerConfig,
    pub power: PowerConfig,
    /// Register table, EPSolar profile when omitted
    pub registers: Vec<RegisterDescriptor>,
    /// Topic prefix for published properties
    pub base_topic: String,
    /// Log per-attempt failures
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            poller: PollerConfig::default(),
            power: PowerConfig::default(),
            registers: epsolar_profile(),
            base_topic: "homie/epsolar/epsolarsensor".to_string(),
            debug: false,
        }
    }
}

impl Config {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> ModbusResult<Self> {
        let blank = yaml
            .lines()
            .map(str::trim)
            .all(|line| line.is_empty() || line.starts_with('#'));
        let config = if blank {
            Config::default()
        } else {
            serde_yaml::from_str::<Option<Config>>(yaml)?.unwrap_or_default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ModbusResult<()> {
        self.serial.validate()?;
        self.poller.validate()?;
        self.power.validate()?;

        if self.registers.is_empty() {
            return Err(ModbusError::configuration("Register table is empty"));
        }
        let mut ids = HashSet::new();
        for register in &self.registers {
            if !ids.insert(register.id.as_str()) {
                return Err(ModbusError::configuration(format!(
                    "Duplicate register id: {}",
                    register.id
                )));
            }
            if u32::from(register.address) + u32::from(register.word_count()) > 0x1_0000 {
                return Err(ModbusError::configuration(format!(
                    "Register {} at 0x{:04X} runs past the address space",
                    register.id, register.address
                )));
            }
        }
        Ok(())
    }
}

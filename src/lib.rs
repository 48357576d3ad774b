//! # EPSolar Modbus - RTU Poller and Power-Cycle Coordinator
//!
//! A Modbus RTU master for polling EPSolar Tracer charge controllers over an
//! async serial port, together with the power-cycle logic of a battery-powered
//! telemetry node: wake up, sweep the controller's input registers, publish,
//! disconnect and go back to deep sleep.
//!
//! ## Features
//!
//! - **Read Input Registers (0x04)** with CRC16, address and byte-count validation
//! - **Tolerant framing**: exception replies and short frames are classified, never panics
//! - **Bounded retries**: per-attempt deadline, attempt cap and inter-request delay
//! - **Word-swapped 32-bit values** decoded from the register description
//! - **Power coordination**: wait budget by wake cause, orderly link shutdown, RTC wake timer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use epsolar_modbus::{epsolar_profile, Poller, PollerConfig, RtuTransport, StreamChannel};
//! use epsolar_modbus::config::SerialConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let channel = StreamChannel::open_serial(&SerialConfig::default())?;
//!     let transport = RtuTransport::new(channel);
//!     let mut poller = Poller::new(transport, PollerConfig::default(), epsolar_profile());
//!
//!     let cycle = poller.run_sweep().await?;
//!     for reading in &cycle.readings {
//!         println!("{}: {:?}", reading.id, reading.outcome);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   data ready   ┌──────────────────┐
//! │     Poller      │───────────────►│ PowerCoordinator │
//! └─────────────────┘                └──────────────────┘
//!    │          │                        │           │
//!    │   ┌──────────────┐        ┌──────────────┐ ┌──────────────┐
//!    │   │PropertyStore │───────►│MessagingLink │ │ PowerControl │
//!    │   └──────────────┘        └──────────────┘ └──────────────┘
//! ┌─────────────────┐
//! │  RtuTransport   │  codec: encode / CRC16 / decode
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  SerialChannel  │
//! └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus protocol definitions
pub mod protocol;

/// RTU frame encoding, decoding and CRC16
pub mod codec;

/// Serial channel and RTU request/response exchange
pub mod transport;

/// Register descriptions and value decoding
pub mod register;

/// One-shot data-ready signal
pub mod signal;

/// Sweep and retry logic
pub mod poller;

/// Latest values and publication
pub mod properties;

/// Wake cause, link shutdown and deep sleep
pub mod power;

/// YAML configuration
pub mod config;

/// Tracing setup and packet formatting
pub mod logging;

// Re-export main types for convenience
pub use error::{ModbusError, ModbusResult};
pub use protocol::{ModbusFunction, ModbusResponse, ReadInputRegistersRequest};
pub use transport::{
    ModbusTransport, ReadOutcome, ReadStrategy, RtuTransport, SerialChannel, StreamChannel,
    TransportStats,
};
pub use register::{epsolar_profile, ChargingPhase, RegisterDescriptor, RegisterValue, ValueKind};
pub use signal::{DataReadyHandle, DataReadySignal};
pub use poller::{PollCycle, PollOutcome, Poller, PollerConfig};
pub use properties::{publish_properties, Property, PropertyStore, PublicationGate};
pub use power::{
    DisconnectOutcome, MessagingLink, PowerConfig, PowerControl, PowerCoordinator, SleepReport,
    WakeCause,
};
pub use config::Config;
pub use logging::{LoggingMode, PacketLogger};

/// Slave address of a factory-configured EPSolar controller
pub const DEFAULT_SLAVE_ID: u8 = 1;

/// Maximum number of registers that can be read in a single request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("EPSolar Modbus v{} - RTU poller and power-cycle coordinator", VERSION)
}

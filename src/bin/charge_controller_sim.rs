/// EPSolar Charge Controller Simulator
///
/// Acts as a Modbus RTU slave answering read input registers (0x04) for the
/// EPSolar register map. It can be used to exercise the poller without
/// hardware:
///
/// 1. Create a virtual serial port pair:
///    `socat -d -d pty,raw,echo=0,link=/tmp/ttyV0 pty,raw,echo=0,link=/tmp/ttyV1`
/// 2. Run the simulator on one end:
///    `charge_controller_sim --port /tmp/ttyV0`
/// 3. Point the poller at the other end:
///    `solar_poller --port /tmp/ttyV1`
///
/// The simulator supports a response delay and random exception injection.

use std::collections::HashMap;
use std::time::Duration;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use epsolar_modbus::codec::{decode_request, encode_exception, encode_response};
use epsolar_modbus::config::SerialConfig;
use epsolar_modbus::logging::{format_hex_packet, init_tracing};
use epsolar_modbus::protocol::{ModbusException, ModbusFunction, SlaveId};
use epsolar_modbus::{ModbusError, ModbusResult, ReadInputRegistersRequest, MAX_RTU_FRAME_SIZE};

/// Length of a read input registers request frame
const REQUEST_LENGTH: usize = 8;

/// Silence after which a partial frame is dropped
const FRAME_GAP: Duration = Duration::from_millis(100);

/// Simulate an EPSolar charge controller on a serial port
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Serial port to listen on
    #[arg(short, long)]
    port: String,

    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    /// Slave address to answer as
    #[arg(short, long, default_value_t = 1)]
    slave: u8,

    /// Delay before each response, in milliseconds
    #[arg(long, default_value_t = 20)]
    delay_ms: u64,

    /// Probability (0.0-1.0) of answering with a device failure exception
    #[arg(long, default_value_t = 0.0)]
    error_rate: f32,

    #[arg(short, long)]
    debug: bool,
}

/// Virtual EPSolar controller
pub struct ChargeControllerSimulator {
    slave_id: SlaveId,
    input_registers: HashMap<u16, u16>,
    response_delay: Duration,
    error_rate: f32,
}

impl ChargeControllerSimulator {
    pub fn new(slave_id: SlaveId) -> Self {
        let mut simulator = Self {
            slave_id,
            input_registers: HashMap::new(),
            response_delay: Duration::from_millis(20),
            error_rate: 0.0,
        };
        simulator.initialize_default_data();
        simulator
    }

    /// Plausible daytime readings, x100 where EPSolar scales
    fn initialize_default_data(&mut self) {
        self.set_u16(0x3100, 1832); // PV 18.32 V
        self.set_u16(0x3101, 215); // PV 2.15 A
        self.set_u32_word_swapped(0x3102, 3938); // PV 39.38 W
        self.set_u16(0x310C, 1310); // load 13.10 V
        self.set_u16(0x310D, 42); // load 0.42 A
        self.set_u32_word_swapped(0x310E, 550); // load 5.50 W
        self.set_u16(0x3110, (-350i16) as u16); // air -3.50 °C
        self.set_u16(0x3111, 2175); // device 21.75 °C
        self.set_u16(0x311A, 87); // battery 87 %
        self.set_u16(0x331A, 1312); // battery 13.12 V
        self.set_u32_word_swapped(0x331B, (-125i32) as u32); // battery -1.25 A
        self.set_u16(0x3201, 0b0000_1000); // boost charging

        info!("Initialized simulator with {} input registers", self.input_registers.len());
    }

    fn set_u16(&mut self, address: u16, value: u16) {
        self.input_registers.insert(address, value);
    }

    /// Store a 32-bit value low word first
    fn set_u32_word_swapped(&mut self, address: u16, value: u32) {
        self.input_registers.insert(address, value as u16);
        self.input_registers.insert(address + 1, (value >> 16) as u16);
    }

    pub fn set_error_rate(&mut self, rate: f32) {
        self.error_rate = rate.clamp(0.0, 1.0);
        info!("Set error rate to {:.1}%", self.error_rate * 100.0);
    }

    pub fn set_response_delay(&mut self, delay: Duration) {
        self.response_delay = delay;
        info!("Set response delay to {:?}", self.response_delay);
    }

    /// Build the reply for a request frame, `None` when the frame is ignored
    pub fn process_frame(&self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.first() != Some(&self.slave_id) {
            return None;
        }

        match decode_request(frame) {
            Ok(request) => Some(self.process_request(&request)),
            Err(ModbusError::InvalidAddress { .. }) => Some(encode_exception(
                self.slave_id,
                ModbusFunction::ReadInputRegisters,
                ModbusException::IllegalDataValue.to_u8(),
            )),
            Err(e) => {
                debug!("Ignoring frame {}: {}", format_hex_packet(frame), e);
                None
            }
        }
    }

    fn process_request(&self, request: &ReadInputRegistersRequest) -> Vec<u8> {
        if self.error_rate > 0.0 && rand::random::<f32>() < self.error_rate {
            warn!("Injecting device failure for 0x{:04X}", request.address);
            return encode_exception(
                self.slave_id,
                request.function(),
                ModbusException::ServerDeviceFailure.to_u8(),
            );
        }

        let registers: Option<Vec<u16>> = (0..request.quantity)
            .map(|i| self.input_registers.get(&request.address.wrapping_add(i)).copied())
            .collect();

        match registers {
            Some(registers) => {
                debug!(
                    "Read {} input registers from address 0x{:04X}",
                    request.quantity, request.address
                );
                encode_response(self.slave_id, &registers)
            }
            None => encode_exception(
                self.slave_id,
                request.function(),
                ModbusException::IllegalDataAddress.to_u8(),
            ),
        }
    }

    /// Serve requests on `config.port` until the port fails
    pub async fn serve(&self, config: &SerialConfig) -> ModbusResult<()> {
        let builder = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(config.data_bits()?)
            .stop_bits(config.stop_bits()?)
            .parity(config.parity.into());
        let mut port = tokio_serial::SerialStream::open(&builder)?;
        info!("Listening on {} as slave {}", config.port, self.slave_id);

        let mut buffer: Vec<u8> = Vec::with_capacity(MAX_RTU_FRAME_SIZE);
        let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];

        loop {
            let n = match timeout(FRAME_GAP, port.read(&mut chunk)).await {
                Ok(result) => result?,
                Err(_) => {
                    if !buffer.is_empty() {
                        debug!("Dropping partial frame {}", format_hex_packet(&buffer));
                        buffer.clear();
                    }
                    continue;
                }
            };
            if n == 0 {
                return Err(ModbusError::connection("Serial port closed"));
            }
            buffer.extend_from_slice(&chunk[..n]);

            while buffer.len() >= REQUEST_LENGTH {
                let frame: Vec<u8> = buffer.drain(..REQUEST_LENGTH).collect();
                if let Some(reply) = self.process_frame(&frame) {
                    sleep(self.response_delay).await;
                    port.write_all(&reply).await?;
                    port.flush().await?;
                }
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let serial = SerialConfig {
        port: args.port,
        baud_rate: args.baud,
        ..SerialConfig::default()
    };
    serial.validate()?;

    let mut simulator = ChargeControllerSimulator::new(args.slave);
    simulator.set_response_delay(Duration::from_millis(args.delay_ms));
    simulator.set_error_rate(args.error_rate);

    simulator.serve(&serial).await?;
    Ok(())
}

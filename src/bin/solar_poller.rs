/// EPSolar Solar Poller
///
/// Runs the wake -> poll -> publish -> sleep cycle of the telemetry node on a
/// host machine. Deep sleep is simulated by sleeping for the programmed wake
/// interval and starting the next cycle with wake cause `DeepSleep`, the way
/// the node would restart from its entry point.
///
/// Published properties are written to the log as JSON payloads.
///
/// Usage:
///   solar_poller --config epsolar.yaml
///   solar_poller --port /dev/ttyUSB0 --once --debug

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use tokio::time::sleep;
use tracing::{error, info, warn};

use epsolar_modbus::logging::init_tracing;
use epsolar_modbus::{
    publish_properties, Config, LoggingMode, MessagingLink, ModbusResult, PacketLogger, Poller,
    PowerControl, PowerCoordinator, RtuTransport, SleepReport, StreamChannel, WakeCause,
};

/// Poll an EPSolar charge controller and publish its telemetry
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "EPSOLAR_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port, overrides the configuration file
    #[arg(short, long)]
    port: Option<String>,

    /// Wake cause assumed for the first cycle
    #[arg(long, value_enum, default_value_t = BootCause::PowerOn)]
    boot: BootCause,

    /// Exit after the first cycle instead of simulating deep sleep
    #[arg(long)]
    once: bool,

    /// Log per-attempt failures
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BootCause {
    PowerOn,
    DeepSleep,
}

impl From<BootCause> for WakeCause {
    fn from(cause: BootCause) -> Self {
        match cause {
            BootCause::PowerOn => WakeCause::PowerOn,
            BootCause::DeepSleep => WakeCause::DeepSleep,
        }
    }
}

/// Power facilities of the host: deep sleep is a plain sleep
struct HostPower {
    cause: WakeCause,
    wake_after: Duration,
    simulate_sleep: bool,
}

#[async_trait]
impl PowerControl for HostPower {
    fn wake_cause(&self) -> WakeCause {
        self.cause
    }

    async fn program_wake_timer(&mut self, after: Duration) -> ModbusResult<()> {
        self.wake_after = after;
        Ok(())
    }

    async fn enter_deep_sleep(&mut self) -> ModbusResult<()> {
        if self.simulate_sleep {
            info!("Simulated deep sleep for {}s", self.wake_after.as_secs());
            sleep(self.wake_after).await;
        }
        self.cause = WakeCause::DeepSleep;
        Ok(())
    }
}

/// Messaging link that logs instead of talking to a broker
#[derive(Default)]
struct LogLink {
    connected: AtomicBool,
}

impl LogLink {
    fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        info!("Messaging link connected");
    }
}

#[async_trait]
impl MessagingLink for LogLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> ModbusResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("Messaging link disconnected");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> ModbusResult<()> {
        info!("PUBLISH {} {}", topic, payload);
        Ok(())
    }
}

/// One wake-to-sleep cycle
async fn run_cycle(
    config: &Config,
    power: HostPower,
    link: Arc<LogLink>,
) -> anyhow::Result<(HostPower, SleepReport)> {
    link.connect();

    let channel = StreamChannel::open_serial(&config.serial)
        .with_context(|| format!("opening {}", config.serial.port))?;
    let mut transport = RtuTransport::with_strategy(channel, config.serial.read_strategy);
    if config.serial.log_packets {
        transport.set_packet_logger(PacketLogger::new(true, LoggingMode::Both));
    }

    let mut poller = Poller::new(transport, config.poller.clone(), config.registers.clone());
    let data_ready = poller.data_ready();
    let store = poller.properties();

    let mut coordinator = PowerCoordinator::new(power, link.clone(), config.power.clone());
    let gate = coordinator.publication_gate();
    let budget = config.power.budget_for(coordinator.wake_cause());

    let sweeps = tokio::spawn(async move {
        if let Err(e) = poller.run(None).await {
            error!("Poller stopped: {}", e);
        }
    });

    let publisher = {
        let link = link.clone();
        let data_ready = data_ready.clone();
        let topic = config.base_topic.clone();
        tokio::spawn(async move {
            if !data_ready.wait(budget).await {
                return;
            }
            match publish_properties(&store, link.as_ref(), gate, &topic).await {
                Ok(0) => info!("Nothing published (gate closed or no values)"),
                Ok(count) => info!("Published {} properties", count),
                Err(e) => warn!("Publishing failed: {}", e),
            }
        })
    };

    // the poller owns the serial port; it is closed before the simulated sleep
    let report = coordinator
        .run_stopping(&data_ready, vec![sweeps, publisher])
        .await?;
    Ok((coordinator.into_power(), report))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.serial.port = port;
    }
    config.debug |= args.debug;
    config.validate()?;

    init_tracing(config.debug);
    info!("{}", epsolar_modbus::info());
    info!(
        "Polling slave {} on {} at {} baud",
        config.poller.slave_id, config.serial.port, config.serial.baud_rate
    );

    let link = Arc::new(LogLink::default());
    let mut power = HostPower {
        cause: args.boot.into(),
        wake_after: config.power.sleep_interval(),
        simulate_sleep: !args.once,
    };

    loop {
        let (next_power, report) = match run_cycle(&config, power, link.clone()).await {
            Ok(result) => result,
            Err(e) => {
                error!("Cycle failed: {:#}", e);
                return Err(e);
            }
        };
        info!("Cycle report: {}", serde_json::to_string(&report)?);

        if args.once {
            break;
        }
        power = next_power;
    }

    Ok(())
}

//! # Power-State Coordinator
//!
//! Decides when the device may cut power. After boot it waits for the poller's
//! first complete sweep, bounded by a budget that depends on why the device
//! woke up, then shuts the messaging link down in order, programs the RTC wake
//! timer and enters deep sleep.
//!
//! ```text
//! wait(data ready, 30 s | 60 s) -> settle 5 s -> disconnect (1 s) -> settle 1 s
//!     -> wake timer 120 s -> deep sleep
//! ```
//!
//! None of the waits escalate: a missing first sweep or a hung disconnect is
//! logged and the sequence carries on.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{ModbusError, ModbusResult};
use crate::properties::PublicationGate;
use crate::signal::DataReadyHandle;

/// Reason the processor started executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeCause {
    /// Power applied or hard reset
    PowerOn,
    /// RTC alarm after a deep sleep
    DeepSleep,
}

/// Hardware power facilities
#[async_trait]
pub trait PowerControl: Send {
    /// Why the device is running; read once at startup
    fn wake_cause(&self) -> WakeCause;

    /// Arm the RTC alarm to fire `after` from now
    async fn program_wake_timer(&mut self, after: Duration) -> ModbusResult<()>;

    /// Suspend execution until the wake timer fires
    ///
    /// On hardware this does not return; host implementations return once the
    /// simulated sleep is over.
    async fn enter_deep_sleep(&mut self) -> ModbusResult<()>;
}

/// Outward message-bus connection
#[async_trait]
pub trait MessagingLink: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> ModbusResult<()>;

    async fn publish(&self, topic: &str, payload: &str) -> ModbusResult<()>;
}

/// Power coordinator timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// First-sweep wait after a cold boot
    pub cold_boot_budget_ms: u64,
    /// First-sweep wait when resuming from deep sleep
    pub deep_sleep_budget_ms: u64,
    /// Pause after the wait, before touching the link
    pub settle_ms: u64,
    pub disconnect_timeout_ms: u64,
    /// Pause between disconnect and sleep
    pub final_settle_ms: u64,
    /// RTC wake timer
    pub sleep_interval_ms: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            cold_boot_budget_ms: 60_000,
            deep_sleep_budget_ms: 30_000,
            settle_ms: 5_000,
            disconnect_timeout_ms: 1_000,
            final_settle_ms: 1_000,
            sleep_interval_ms: 120_000,
        }
    }
}

impl PowerConfig {
    /// How long to wait for the first sweep given the wake cause
    pub fn budget_for(&self, cause: WakeCause) -> Duration {
        match cause {
            WakeCause::PowerOn => Duration::from_millis(self.cold_boot_budget_ms),
            WakeCause::DeepSleep => Duration::from_millis(self.deep_sleep_budget_ms),
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn final_settle(&self) -> Duration {
        Duration::from_millis(self.final_settle_ms)
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_millis(self.sleep_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ModbusResult<()> {
        if self.cold_boot_budget_ms == 0 || self.deep_sleep_budget_ms == 0 {
            return Err(ModbusError::configuration("First-sweep wait budgets must be non-zero"));
        }
        if self.disconnect_timeout_ms == 0 {
            return Err(ModbusError::configuration("Disconnect timeout must be non-zero"));
        }
        if self.sleep_interval_ms == 0 {
            return Err(ModbusError::configuration("Sleep interval must be non-zero"));
        }
        Ok(())
    }
}

/// What happened to the messaging link during shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectOutcome {
    /// Link was already down
    NotConnected,
    Disconnected,
    TimedOut,
    Failed(String),
}

/// Record of one wake-to-sleep transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SleepReport {
    pub wake_cause: WakeCause,
    /// Whether the first sweep finished within the budget
    pub data_ready: bool,
    /// Time spent waiting for the first sweep
    pub waited: Duration,
    pub disconnect: DisconnectOutcome,
    /// Wake timer programmed before sleeping
    pub wake_after: Duration,
}

/// Orchestrates the wait, link shutdown and deep sleep
pub struct PowerCoordinator<P, L: ?Sized> {
    power: P,
    link: Arc<L>,
    config: PowerConfig,
    wake_cause: WakeCause,
}

impl<P, L> PowerCoordinator<P, L>
where
    P: PowerControl,
    L: MessagingLink + ?Sized,
{
    /// Create a coordinator, reading the wake cause once
    pub fn new(power: P, link: Arc<L>, config: PowerConfig) -> Self {
        let wake_cause = power.wake_cause();
        debug!("Wake cause: {:?}", wake_cause);
        Self {
            power,
            link,
            config,
            wake_cause,
        }
    }

    pub fn wake_cause(&self) -> WakeCause {
        self.wake_cause
    }

    pub fn config(&self) -> &PowerConfig {
        &self.config
    }

    /// Gate for the property layer's periodic publication pass
    pub fn publication_gate(&self) -> PublicationGate {
        PublicationGate::new(self.wake_cause)
    }

    pub fn power(&self) -> &P {
        &self.power
    }

    pub fn power_mut(&mut self) -> &mut P {
        &mut self.power
    }

    /// Give back the power facilities, e.g. to build the next cycle's coordinator
    pub fn into_power(self) -> P {
        self.power
    }

    /// Run the shutdown sequence once
    ///
    /// Returns after `enter_deep_sleep` returns, which on hardware never
    /// happens. Only failures of the power facilities are reported as errors.
    pub async fn run(&mut self, data_ready: &DataReadyHandle) -> ModbusResult<SleepReport> {
        self.run_stopping(data_ready, Vec::new()).await
    }

    /// Run the shutdown sequence, stopping `workers` before deep sleep
    ///
    /// Every worker is aborted and awaited once the wake timer is armed, so
    /// none of them runs during the sleep and whatever they own (the serial
    /// port, in practice) is released before `enter_deep_sleep` is called.
    pub async fn run_stopping(
        &mut self,
        data_ready: &DataReadyHandle,
        workers: Vec<JoinHandle<()>>,
    ) -> ModbusResult<SleepReport> {
        let prepared = self.prepare_for_sleep(data_ready).await;
        stop_workers(workers).await;
        let report = prepared?;

        info!("Entering deep sleep for {}s", report.wake_after.as_secs());
        self.power.enter_deep_sleep().await?;
        Ok(report)
    }

    /// Everything up to and including arming the wake timer
    async fn prepare_for_sleep(&mut self, data_ready: &DataReadyHandle) -> ModbusResult<SleepReport> {
        let budget = self.config.budget_for(self.wake_cause);
        info!(
            "Waiting up to {}s for the first sweep (wake cause: {:?})",
            budget.as_secs(),
            self.wake_cause
        );

        let started = Instant::now();
        let ready = data_ready.wait(budget).await;
        let waited = started.elapsed();
        if ready {
            info!("Data ready after {}ms", waited.as_millis());
        } else {
            warn!("Timed out after {}s waiting for the first sweep", budget.as_secs());
        }

        sleep(self.config.settle()).await;
        let disconnect = self.disconnect_link().await;
        sleep(self.config.final_settle()).await;

        let wake_after = self.config.sleep_interval();
        self.power.program_wake_timer(wake_after).await?;

        Ok(SleepReport {
            wake_cause: self.wake_cause,
            data_ready: ready,
            waited,
            disconnect,
            wake_after,
        })
    }

    async fn disconnect_link(&self) -> DisconnectOutcome {
        if !self.link.is_connected() {
            debug!("Messaging link not connected, skipping disconnect");
            return DisconnectOutcome::NotConnected;
        }

        match timeout(self.config.disconnect_timeout(), self.link.disconnect()).await {
            Ok(Ok(())) => {
                debug!("Messaging link disconnected");
                DisconnectOutcome::Disconnected
            }
            Ok(Err(e)) => {
                warn!("Messaging link disconnect failed: {}", e);
                DisconnectOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(
                    "Messaging link disconnect timed out after {}ms",
                    self.config.disconnect_timeout_ms
                );
                DisconnectOutcome::TimedOut
            }
        }
    }
}

async fn stop_workers(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        worker.abort();
        match worker.await {
            Err(e) if e.is_panic() => warn!("Worker panicked before sleep: {}", e),
            _ => {}
        }
    }
    debug!("Workers stopped");
}

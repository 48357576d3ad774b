//! # Poll Cycle Controller
//!
//! Drives sweeps over the register table. Each register is read with its own
//! retry budget; a register that exhausts it is recorded as failed and the
//! sweep moves on, so a sweep always finishes. The end of the first sweep
//! raises the [`DataReadySignal`].
//!
//! ## Timing
//!
//! Every attempt is preceded by the inter-request delay (50 ms by default),
//! which gives the controller bus turnaround time, and bounded by the
//! per-attempt timeout (500 ms by default).

use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{ModbusError, ModbusResult};
use crate::properties::PropertyStore;
use crate::protocol::{ReadInputRegistersRequest, SlaveId};
use crate::register::{RegisterDescriptor, RegisterValue};
use crate::signal::{DataReadyHandle, DataReadySignal};
use crate::transport::ModbusTransport;

/// Poller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub slave_id: SlaveId,
    pub attempt_timeout_ms: u64,
    /// Total attempts per register, first one included
    pub max_attempts: u32,
    pub inter_request_delay_ms: u64,
    /// Pause between consecutive sweeps
    pub sweep_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            slave_id: crate::DEFAULT_SLAVE_ID,
            attempt_timeout_ms: 500,
            max_attempts: 3,
            inter_request_delay_ms: 50,
            sweep_interval_ms: 10_000,
        }
    }
}

impl PollerConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ModbusResult<()> {
        if self.slave_id == 0 || self.slave_id > 247 {
            return Err(ModbusError::configuration(format!(
                "Slave ID must be within 1-247, got {}",
                self.slave_id
            )));
        }
        if self.max_attempts == 0 {
            return Err(ModbusError::configuration("At least one attempt per register is required"));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(ModbusError::configuration("Attempt timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Result of polling one register
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    Value(RegisterValue),
    Failed {
        attempts: u32,
        #[serde(serialize_with = "serialize_error")]
        error: ModbusError,
    },
}

fn serialize_error<S: Serializer>(error: &ModbusError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

impl PollOutcome {
    pub fn is_value(&self) -> bool {
        matches!(self, PollOutcome::Value(_))
    }

    pub fn value(&self) -> Option<RegisterValue> {
        match self {
            PollOutcome::Value(value) => Some(*value),
            PollOutcome::Failed { .. } => None,
        }
    }
}

/// One register's entry in a sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub id: String,
    pub outcome: PollOutcome,
}

/// Ordered results of one sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollCycle {
    /// 1-based sweep number
    pub sweep: u64,
    pub started_at: DateTime<Utc>,
    pub readings: Vec<Reading>,
}

impl PollCycle {
    pub fn success_count(&self) -> usize {
        self.readings.iter().filter(|r| r.outcome.is_value()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.readings.len() - self.success_count()
    }

    pub fn get(&self, id: &str) -> Option<&PollOutcome> {
        self.readings.iter().find(|r| r.id == id).map(|r| &r.outcome)
    }
}

/// Sweeps the register table over a transport
pub struct Poller<T> {
    transport: T,
    config: PollerConfig,
    registers: Vec<RegisterDescriptor>,
    properties: PropertyStore,
    signal: DataReadySignal,
    sweeps: u64,
}

impl<T: ModbusTransport> Poller<T> {
    /// Create a poller for `registers`
    pub fn new(transport: T, config: PollerConfig, registers: Vec<RegisterDescriptor>) -> Self {
        let properties = PropertyStore::new(&registers);
        Self {
            transport,
            config,
            registers,
            properties,
            signal: DataReadySignal::new(),
            sweeps: 0,
        }
    }

    /// Observer for the end of the first sweep
    pub fn data_ready(&self) -> DataReadyHandle {
        self.signal.handle()
    }

    /// Shared view of the latest values
    pub fn properties(&self) -> PropertyStore {
        self.properties.clone()
    }

    pub fn registers(&self) -> &[RegisterDescriptor] {
        &self.registers
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Completed sweeps so far
    pub fn sweep_count(&self) -> u64 {
        self.sweeps
    }

    /// Read one register, retrying up to the attempt cap
    pub async fn poll_register(&mut self, index: usize) -> PollOutcome {
        let descriptor = match self.registers.get(index) {
            Some(descriptor) => descriptor,
            None => {
                return PollOutcome::Failed {
                    attempts: 0,
                    error: ModbusError::internal(format!("No register at index {}", index)),
                }
            }
        };

        let request = match ReadInputRegistersRequest::new(
            self.config.slave_id,
            descriptor.address,
            descriptor.word_count(),
        ) {
            Ok(request) => request,
            Err(error) => {
                warn!("{}: invalid request: {}", descriptor.id, error);
                return PollOutcome::Failed { attempts: 0, error };
            }
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            sleep(self.config.inter_request_delay()).await;

            let result = self
                .transport
                .request(&request, self.config.attempt_timeout())
                .await
                .and_then(|response| descriptor.decode(&response.payload));

            match result {
                Ok(value) => {
                    debug!("{}: {:?} after {} attempt(s)", descriptor.id, value, attempts);
                    return PollOutcome::Value(value);
                }
                Err(error) if error.is_retryable() && attempts < self.config.max_attempts => {
                    debug!("{}: attempt {} failed: {}", descriptor.id, attempts, error);
                }
                Err(error) => {
                    warn!("{}: giving up after {} attempt(s): {}", descriptor.id, attempts, error);
                    return PollOutcome::Failed { attempts, error };
                }
            }
        }
    }

    /// Poll every register once, in table order
    ///
    /// Raises the data-ready signal when the sweep completes.
    pub async fn run_sweep(&mut self) -> ModbusResult<PollCycle> {
        let started_at = Utc::now();
        let mut readings = Vec::with_capacity(self.registers.len());

        for index in 0..self.registers.len() {
            let outcome = self.poll_register(index).await;
            self.properties.record(index, &outcome)?;
            readings.push(Reading {
                id: self.registers[index].id.clone(),
                outcome,
            });
        }

        self.sweeps += 1;
        let cycle = PollCycle {
            sweep: self.sweeps,
            started_at,
            readings,
        };
        info!(
            "Sweep {} finished: {} ok, {} failed",
            cycle.sweep,
            cycle.success_count(),
            cycle.failure_count()
        );

        if self.signal.raise() {
            info!("First sweep complete, data ready");
        }
        Ok(cycle)
    }

    /// Run `sweeps` consecutive sweeps, or forever when `None`
    ///
    /// Returns the last completed cycle.
    pub async fn run(&mut self, sweeps: Option<u64>) -> ModbusResult<Option<PollCycle>> {
        let mut last = None;
        let mut done = 0;

        while sweeps.map_or(true, |n| done < n) {
            if done > 0 {
                sleep(self.config.sweep_interval()).await;
            }
            last = Some(self.run_sweep().await?);
            done += 1;
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use async_trait::async_trait;
    use crate::protocol::{ModbusFunction, ModbusResponse};
    use crate::register::{epsolar_profile, ValueKind};
    use crate::transport::TransportStats;

    /// Transport answering from a register map, failing scripted addresses
    #[derive(Default)]
    struct MockTransport {
        registers: HashMap<u16, u16>,
        failures: HashMap<u16, Vec<ModbusError>>,
        requests: Vec<ReadInputRegistersRequest>,
    }

    impl MockTransport {
        fn fail(mut self, address: u16, errors: Vec<ModbusError>) -> Self {
            self.failures.insert(address, errors);
            self
        }

        fn attempts_at(&self, address: u16) -> usize {
            self.requests.iter().filter(|r| r.address == address).count()
        }
    }

    #[async_trait]
    impl ModbusTransport for MockTransport {
        async fn request(
            &mut self,
            request: &ReadInputRegistersRequest,
            _timeout: Duration,
        ) -> ModbusResult<ModbusResponse> {
            self.requests.push(*request);
            if let Some(errors) = self.failures.get_mut(&request.address) {
                if !errors.is_empty() {
                    return Err(errors.remove(0));
                }
            }
            let payload = (0..request.quantity)
                .flat_map(|i| {
                    let value = self.registers.get(&(request.address + i)).copied().unwrap_or(0);
                    value.to_be_bytes()
                })
                .collect();
            Ok(ModbusResponse::new(request.slave_id, ModbusFunction::ReadInputRegisters, payload))
        }

        fn get_stats(&self) -> TransportStats {
            TransportStats::default()
        }
    }

    fn timeouts(n: usize) -> Vec<ModbusError> {
        (0..n).map(|_| ModbusError::timeout("read response", 500)).collect()
    }

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.slave_id, 1);
        assert_eq!(config.attempt_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.inter_request_delay(), Duration::from_millis(50));
        assert!(config.validate().is_ok());

        assert!(PollerConfig { max_attempts: 0, ..config.clone() }.validate().is_err());
        assert!(PollerConfig { slave_id: 0, ..config.clone() }.validate().is_err());
        assert!(PollerConfig { attempt_timeout_ms: 0, ..config }.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let mut transport = MockTransport::default().fail(0x3100, timeouts(2));
        transport.registers.insert(0x3100, 1234);
        let registers = vec![RegisterDescriptor::new("v", "V", "V", 0x3100, ValueKind::Unsigned16, 100)];
        let mut poller = Poller::new(transport, PollerConfig::default(), registers);

        let outcome = poller.poll_register(0).await;
        assert_eq!(outcome, PollOutcome::Value(RegisterValue::Unsigned(1234)));
        assert_eq!(poller.transport().attempts_at(0x3100), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_after_attempt_cap() {
        let transport = MockTransport::default().fail(0x3100, timeouts(10));
        let registers = vec![RegisterDescriptor::new("v", "V", "V", 0x3100, ValueKind::Unsigned16, 100)];
        let mut poller = Poller::new(transport, PollerConfig::default(), registers);

        let start = tokio::time::Instant::now();
        let outcome = poller.poll_register(0).await;
        assert_eq!(
            outcome,
            PollOutcome::Failed {
                attempts: 3,
                error: ModbusError::timeout("read response", 500)
            }
        );
        assert_eq!(poller.transport().attempts_at(0x3100), 3);
        // one inter-request delay before every attempt
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_exception_is_retried() {
        let transport = MockTransport::default()
            .fail(0x3100, vec![ModbusError::exception(0x04, 0x06)]);
        let registers = vec![RegisterDescriptor::new("v", "V", "V", 0x3100, ValueKind::Unsigned16, 100)];
        let mut poller = Poller::new(transport, PollerConfig::default(), registers);

        assert!(poller.poll_register(0).await.is_value());
        assert_eq!(poller.transport().attempts_at(0x3100), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_request_fails_without_attempts() {
        let registers = vec![RegisterDescriptor::new("v", "V", "V", 0x3100, ValueKind::Unsigned16, 100)];
        let config = PollerConfig { slave_id: 0, ..PollerConfig::default() };
        let mut poller = Poller::new(MockTransport::default(), config, registers);

        match poller.poll_register(0).await {
            PollOutcome::Failed { attempts, .. } => assert_eq!(attempts, 0),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(poller.transport().requests.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_continues_past_failure() {
        let transport = MockTransport::default().fail(0x3102, timeouts(3));
        let mut poller = Poller::new(transport, PollerConfig::default(), epsolar_profile());

        let cycle = poller.run_sweep().await.unwrap();
        assert_eq!(cycle.sweep, 1);
        assert_eq!(cycle.readings.len(), 12);
        assert_eq!(cycle.success_count(), 11);
        assert_eq!(cycle.failure_count(), 1);
        assert!(!cycle.get("solar-power").unwrap().is_value());
        assert!(cycle.get("battery-status").unwrap().is_value());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_raised_once_across_sweeps() {
        let mut poller = Poller::new(MockTransport::default(), PollerConfig::default(), epsolar_profile());
        let handle = poller.data_ready();
        assert!(!handle.is_set());

        poller.run_sweep().await.unwrap();
        assert!(handle.is_set());

        let last = poller.run(Some(2)).await.unwrap().unwrap();
        assert_eq!(last.sweep, 3);
        assert_eq!(poller.sweep_count(), 3);
        assert!(handle.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_updates_properties() {
        let mut transport = MockTransport::default();
        transport.registers.insert(0x3100, 1250);
        let mut poller = Poller::new(transport, PollerConfig::default(), epsolar_profile());
        let store = poller.properties();

        poller.run_sweep().await.unwrap();
        let property = store.get("solar-voltage").unwrap().unwrap();
        assert_eq!(property.value, Some(RegisterValue::Unsigned(1250)));
        assert_eq!(property.display_value().as_deref(), Some("12.50"));
    }

    #[test]
    fn test_outcome_serialization() {
        let failed = PollOutcome::Failed {
            attempts: 3,
            error: ModbusError::timeout("read response", 500),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["failed"]["attempts"], 3);
        assert!(json["failed"]["error"].as_str().unwrap().contains("500"));
    }
}

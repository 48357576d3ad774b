//! Property store and publication gate
//!
//! The store holds the latest value of every telemetry channel, in register
//! table order. The poller writes into it after each register; the publishing
//! side takes snapshots. A channel whose last poll failed keeps its previous
//! value and is flagged stale.

use std::sync::{Arc, RwLock};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::{ModbusError, ModbusResult};
use crate::poller::PollOutcome;
use crate::power::{MessagingLink, WakeCause};
use crate::register::{RegisterDescriptor, RegisterValue};

/// Latest state of one telemetry channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Property {
    pub id: String,
    pub name: String,
    pub unit: String,
    pub scale: u16,
    pub value: Option<RegisterValue>,
    /// Last poll failed; `value` is from an earlier sweep
    pub stale: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Property {
    fn from_descriptor(descriptor: &RegisterDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            unit: descriptor.unit.clone(),
            scale: descriptor.scale,
            value: None,
            stale: false,
            updated_at: None,
            last_error: None,
        }
    }

    /// Value formatted for publication
    ///
    /// Status values publish the raw phase number; everything else is scaled
    /// and printed with two decimals when the scale is fractional.
    pub fn display_value(&self) -> Option<String> {
        let value = self.value?;
        let text = match value {
            RegisterValue::Status(bits) => bits.to_string(),
            _ if self.scale > 1 => format!("{:.2}", value.scaled(self.scale)),
            _ => value.raw().to_string(),
        };
        Some(text)
    }
}

/// Message body published for one property
#[derive(Debug, Serialize)]
struct PropertyPayload<'a> {
    value: String,
    unit: &'a str,
    stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

/// Shared, ordered set of properties
#[derive(Debug, Clone)]
pub struct PropertyStore {
    properties: Arc<RwLock<Vec<Property>>>,
}

impl PropertyStore {
    pub fn new(registers: &[RegisterDescriptor]) -> Self {
        let properties = registers.iter().map(Property::from_descriptor).collect();
        Self {
            properties: Arc::new(RwLock::new(properties)),
        }
    }

    pub fn len(&self) -> ModbusResult<usize> {
        self.properties
            .read()
            .map(|p| p.len())
            .map_err(|_| ModbusError::internal("Failed to lock properties"))
    }

    pub fn is_empty(&self) -> ModbusResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Apply a poll outcome to the property at `index`
    pub fn record(&self, index: usize, outcome: &PollOutcome) -> ModbusResult<()> {
        let mut properties = self
            .properties
            .write()
            .map_err(|_| ModbusError::internal("Failed to lock properties"))?;
        let property = properties
            .get_mut(index)
            .ok_or_else(|| ModbusError::internal(format!("No property at index {}", index)))?;

        match outcome {
            PollOutcome::Value(value) => {
                property.value = Some(*value);
                property.stale = false;
                property.updated_at = Some(Utc::now());
                property.last_error = None;
            }
            PollOutcome::Failed { error, .. } => {
                property.stale = true;
                property.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    /// Look up a property by id
    pub fn get(&self, id: &str) -> ModbusResult<Option<Property>> {
        let properties = self
            .properties
            .read()
            .map_err(|_| ModbusError::internal("Failed to lock properties"))?;
        Ok(properties.iter().find(|p| p.id == id).cloned())
    }

    /// Copy of every property, in table order
    pub fn snapshot(&self) -> ModbusResult<Vec<Property>> {
        let properties = self
            .properties
            .read()
            .map_err(|_| ModbusError::internal("Failed to lock properties"))?;
        Ok(properties.clone())
    }
}

/// Decides whether the periodic publication pass may run
///
/// Values are only published after a wake from deep sleep, never on the cold
/// boot that follows power-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicationGate {
    wake_cause: WakeCause,
}

impl PublicationGate {
    pub fn new(wake_cause: WakeCause) -> Self {
        Self { wake_cause }
    }

    pub fn allows(&self) -> bool {
        self.wake_cause == WakeCause::DeepSleep
    }
}

/// Publish every property that has a value under `base_topic/<id>`
///
/// Returns the number of messages sent; zero when the gate is closed.
pub async fn publish_properties<L>(
    store: &PropertyStore,
    link: &L,
    gate: PublicationGate,
    base_topic: &str,
) -> ModbusResult<usize>
where
    L: MessagingLink + ?Sized,
{
    if !gate.allows() {
        debug!("Publication gate closed, skipping publish pass");
        return Ok(0);
    }

    let mut published = 0;
    for property in store.snapshot()? {
        let value = match property.display_value() {
            Some(value) => value,
            None => continue,
        };
        let payload = PropertyPayload {
            value,
            unit: &property.unit,
            stale: property.stale,
            phase: property
                .value
                .and_then(|v| v.charging_phase())
                .map(|phase| phase.to_string()),
            updated_at: property.updated_at,
        };
        let topic = format!("{}/{}", base_topic.trim_end_matches('/'), property.id);
        link.publish(&topic, &serde_json::to_string(&payload)?).await?;
        published += 1;
    }
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use async_trait::async_trait;
    use crate::register::epsolar_profile;

    #[derive(Default)]
    struct RecordingLink {
        messages: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MessagingLink for RecordingLink {
        fn is_connected(&self) -> bool {
            true
        }

        async fn disconnect(&self) -> ModbusResult<()> {
            Ok(())
        }

        async fn publish(&self, topic: &str, payload: &str) -> ModbusResult<()> {
            self.messages.lock().unwrap().push((topic.to_string(), payload.to_string()));
            Ok(())
        }
    }

    fn failed() -> PollOutcome {
        PollOutcome::Failed {
            attempts: 3,
            error: ModbusError::timeout("read response", 500),
        }
    }

    #[test]
    fn test_store_follows_table_order() {
        let store = PropertyStore::new(&epsolar_profile());
        assert_eq!(store.len().unwrap(), 12);
        assert!(!store.is_empty().unwrap());
        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot[0].id, "solar-voltage");
        assert_eq!(snapshot[11].id, "battery-status");
        assert!(snapshot.iter().all(|p| p.value.is_none()));
    }

    #[test]
    fn test_failure_keeps_last_value_and_marks_stale() {
        let store = PropertyStore::new(&epsolar_profile());
        store.record(0, &PollOutcome::Value(RegisterValue::Unsigned(1320))).unwrap();
        store.record(0, &failed()).unwrap();

        let property = store.get("solar-voltage").unwrap().unwrap();
        assert_eq!(property.value, Some(RegisterValue::Unsigned(1320)));
        assert!(property.stale);
        assert!(property.last_error.unwrap().contains("Timeout"));

        store.record(0, &PollOutcome::Value(RegisterValue::Unsigned(1321))).unwrap();
        let property = store.get("solar-voltage").unwrap().unwrap();
        assert!(!property.stale);
        assert!(property.last_error.is_none());
    }

    #[test]
    fn test_poisoned_lock_is_reported() {
        let store = PropertyStore::new(&epsolar_profile());
        let poisoner = store.clone();
        let result = std::thread::spawn(move || {
            let _guard = poisoner.properties.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();
        assert!(result.is_err());

        assert!(matches!(store.len(), Err(ModbusError::Internal { .. })));
        assert!(matches!(store.is_empty(), Err(ModbusError::Internal { .. })));
        assert!(matches!(store.snapshot(), Err(ModbusError::Internal { .. })));
        assert!(matches!(store.get("solar-voltage"), Err(ModbusError::Internal { .. })));
    }

    #[test]
    fn test_record_out_of_range() {
        let store = PropertyStore::new(&epsolar_profile());
        assert!(store.record(12, &failed()).is_err());
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_display_values() {
        let store = PropertyStore::new(&epsolar_profile());
        store.record(8, &PollOutcome::Value(RegisterValue::Unsigned(87))).unwrap();
        store.record(10, &PollOutcome::Value(RegisterValue::Signed(-250))).unwrap();
        store.record(11, &PollOutcome::Value(RegisterValue::Status(2))).unwrap();

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot[8].display_value().as_deref(), Some("87"));
        assert_eq!(snapshot[10].display_value().as_deref(), Some("-2.50"));
        assert_eq!(snapshot[11].display_value().as_deref(), Some("2"));
        assert_eq!(snapshot[0].display_value(), None);
    }

    #[tokio::test]
    async fn test_gate_closed_on_cold_boot() {
        let store = PropertyStore::new(&epsolar_profile());
        store.record(0, &PollOutcome::Value(RegisterValue::Unsigned(1320))).unwrap();
        let link = RecordingLink::default();

        let gate = PublicationGate::new(WakeCause::PowerOn);
        assert!(!gate.allows());
        assert_eq!(publish_properties(&store, &link, gate, "homie/solar").await.unwrap(), 0);
        assert!(link.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_after_deep_sleep() {
        let store = PropertyStore::new(&epsolar_profile());
        store.record(0, &PollOutcome::Value(RegisterValue::Unsigned(1320))).unwrap();
        store.record(11, &PollOutcome::Value(RegisterValue::Status(1))).unwrap();
        let link = RecordingLink::default();

        let gate = PublicationGate::new(WakeCause::DeepSleep);
        let sent = publish_properties(&store, &link, gate, "homie/solar/").await.unwrap();
        assert_eq!(sent, 2);

        let messages = link.messages.lock().unwrap();
        assert_eq!(messages[0].0, "homie/solar/solar-voltage");
        let payload: serde_json::Value = serde_json::from_str(&messages[0].1).unwrap();
        assert_eq!(payload["value"], "13.20");
        assert_eq!(payload["unit"], "V");
        assert_eq!(payload["stale"], false);

        let payload: serde_json::Value = serde_json::from_str(&messages[1].1).unwrap();
        assert_eq!(payload["phase"], "float");
    }
}

//! The UPS as a home-automation accessory.
//!
//! Reads are answered from the last committed [`Snapshot`](crate::poller::Snapshot)
//! and never wait on a poll in flight. Transitions found by the
//! [`StateTracker`](crate::tracker::StateTracker) are pushed into a
//! [`CharacteristicSink`] supplied at construction.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::decoder::ChargingState;
use crate::poller::{Snapshot, SnapshotStore};
use crate::tracker::{ChangeEvent, TrackedField};

// HAP characteristic values
const CONTACT_DETECTED: i32 = 0;
const CONTACT_NOT_DETECTED: i32 = 1;
const BATTERY_LEVEL_NORMAL: i32 = 0;
const BATTERY_LEVEL_LOW: i32 = 1;
const NOT_CHARGING: i32 = 0;
const CHARGING: i32 = 1;
const NOT_CHARGEABLE: i32 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessoryInfo {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceKind {
    AccessoryInformation,
    ContactSensor,
    BatteryService,
    TemperatureSensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Characteristic {
    BatteryLevel,
    ChargingState,
    StatusLowBattery,
    ContactSensorState,
    CurrentTemperature,
}

impl Characteristic {
    pub const ALL: [Characteristic; 5] = [
        Characteristic::BatteryLevel,
        Characteristic::ChargingState,
        Characteristic::StatusLowBattery,
        Characteristic::ContactSensorState,
        Characteristic::CurrentTemperature,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Characteristic::BatteryLevel => "battery-level",
            Characteristic::ChargingState => "charging-state",
            Characteristic::StatusLowBattery => "status-low-battery",
            Characteristic::ContactSensorState => "contact-sensor-state",
            Characteristic::CurrentTemperature => "current-temperature",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// A typed characteristic reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicValue {
    BatteryLevel(u8),
    Charging(ChargingState),
    LowBattery(bool),
    Contact(bool),
    Temperature(i32),
}

impl CharacteristicValue {
    /// Numeric value as a HomeKit controller expects it.
    pub fn hap_value(self) -> i32 {
        match self {
            CharacteristicValue::BatteryLevel(percent) => i32::from(percent),
            CharacteristicValue::Charging(ChargingState::NotCharging) => NOT_CHARGING,
            CharacteristicValue::Charging(ChargingState::Charging) => CHARGING,
            CharacteristicValue::Charging(ChargingState::NotChargeable) => NOT_CHARGEABLE,
            CharacteristicValue::LowBattery(true) => BATTERY_LEVEL_LOW,
            CharacteristicValue::LowBattery(false) => BATTERY_LEVEL_NORMAL,
            CharacteristicValue::Contact(true) => CONTACT_DETECTED,
            CharacteristicValue::Contact(false) => CONTACT_NOT_DETECTED,
            CharacteristicValue::Temperature(celsius) => celsius,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("no status report has been received yet")]
    NotReady,
    #[error("{} is not available", .0.name())]
    Unavailable(Characteristic),
}

/// A pushed value change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CharacteristicUpdate {
    pub characteristic: Characteristic,
    pub value: i32,
}

/// Receives pushed characteristic updates.
pub trait CharacteristicSink: Send + Sync {
    fn update(&self, update: CharacteristicUpdate);
}

/// Fans updates out to every current subscriber. Updates sent while nobody
/// is subscribed are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<CharacteristicUpdate>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        BroadcastSink { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CharacteristicUpdate> {
        self.tx.subscribe()
    }
}

impl CharacteristicSink for BroadcastSink {
    fn update(&self, update: CharacteristicUpdate) {
        if self.tx.send(update).is_err() {
            debug!("No subscribers for {} update", update.characteristic.name());
        }
    }
}

/// Logs a line only when it differs from the previous one for the same key.
#[derive(Debug, Default)]
struct LogUpdate {
    last: Mutex<HashMap<Characteristic, String>>,
}

impl LogUpdate {
    fn info(&self, key: Characteristic, message: String) {
        let mut last = self.last.lock();
        if last.get(&key) != Some(&message) {
            info!("{}", message);
            last.insert(key, message);
        }
    }
}

pub struct UpsAccessory {
    info: AccessoryInfo,
    store: Arc<SnapshotStore>,
    sink: Arc<dyn CharacteristicSink>,
    temperature_sensor: bool,
    updates: LogUpdate,
}

impl UpsAccessory {
    pub fn new(
        info: AccessoryInfo,
        store: Arc<SnapshotStore>,
        sink: Arc<dyn CharacteristicSink>,
        temperature_sensor: bool,
    ) -> Self {
        UpsAccessory {
            info,
            store,
            sink,
            temperature_sensor,
            updates: LogUpdate::default(),
        }
    }

    pub fn info(&self) -> &AccessoryInfo {
        &self.info
    }

    pub fn has_temperature_sensor(&self) -> bool {
        self.temperature_sensor
    }

    /// The committed snapshot, ready or not.
    pub fn latest(&self) -> Arc<Snapshot> {
        self.store.load()
    }

    pub fn services(&self) -> Vec<ServiceKind> {
        let mut services = vec![
            ServiceKind::AccessoryInformation,
            ServiceKind::ContactSensor,
            ServiceKind::BatteryService,
        ];
        if self.temperature_sensor {
            services.push(ServiceKind::TemperatureSensor);
        }
        services
    }

    pub fn characteristics(&self) -> Vec<Characteristic> {
        Characteristic::ALL
            .into_iter()
            .filter(|c| self.temperature_sensor || *c != Characteristic::CurrentTemperature)
            .collect()
    }

    fn snapshot(&self) -> Result<Arc<Snapshot>, ReadError> {
        let snapshot = self.store.load();
        if snapshot.ready {
            Ok(snapshot)
        } else {
            Err(ReadError::NotReady)
        }
    }

    pub fn battery_level(&self) -> Result<u8, ReadError> {
        let snapshot = self.snapshot()?;
        let percent = snapshot.state.battery_percent;
        let time_left = snapshot.state.time_left.as_deref().unwrap_or("unknown");
        self.updates.info(
            Characteristic::BatteryLevel,
            format!("Battery Level: {percent}% ({time_left})"),
        );
        Ok(percent)
    }

    pub fn charging_state(&self) -> Result<ChargingState, ReadError> {
        let state = self.snapshot()?.state.charging_state;
        self.updates
            .info(Characteristic::ChargingState, format!("Charging state: {state}"));
        Ok(state)
    }

    pub fn status_low_battery(&self) -> Result<bool, ReadError> {
        Ok(self.snapshot()?.state.low_battery)
    }

    pub fn contact_state(&self) -> Result<bool, ReadError> {
        Ok(self.snapshot()?.state.contact_detected)
    }

    pub fn temperature(&self) -> Result<i32, ReadError> {
        if !self.temperature_sensor {
            return Err(ReadError::Unavailable(Characteristic::CurrentTemperature));
        }
        let celsius = self
            .snapshot()?
            .state
            .temperature_celsius
            .ok_or(ReadError::Unavailable(Characteristic::CurrentTemperature))?;
        self.updates
            .info(Characteristic::CurrentTemperature, format!("Temperature: {celsius}"));
        Ok(celsius)
    }

    pub fn read(&self, characteristic: Characteristic) -> Result<CharacteristicValue, ReadError> {
        Ok(match characteristic {
            Characteristic::BatteryLevel => CharacteristicValue::BatteryLevel(self.battery_level()?),
            Characteristic::ChargingState => CharacteristicValue::Charging(self.charging_state()?),
            Characteristic::StatusLowBattery => {
                CharacteristicValue::LowBattery(self.status_low_battery()?)
            }
            Characteristic::ContactSensorState => {
                CharacteristicValue::Contact(self.contact_state()?)
            }
            Characteristic::CurrentTemperature => {
                CharacteristicValue::Temperature(self.temperature()?)
            }
        })
    }

    /// Push tracked transitions to the sink, in the order given.
    pub fn publish(&self, events: &[ChangeEvent]) {
        for event in events {
            let value = match event.field {
                TrackedField::Contact => {
                    debug!("Pushing contact state change; {} -> {}", event.old, event.new);
                    // Contact tracks the online bit, so losing it means mains power is gone
                    warn!("Power: {}", if event.new { "Connected" } else { "Disconnected" });
                    CharacteristicValue::Contact(event.new)
                }
                TrackedField::LowBattery => {
                    debug!("Pushing low battery state change; {} -> {}", event.old, event.new);
                    if event.new {
                        warn!("Battery state: Low");
                    } else {
                        info!("Battery state: Normal");
                    }
                    CharacteristicValue::LowBattery(event.new)
                }
            };
            self.sink.update(CharacteristicUpdate {
                characteristic: characteristic_for(event.field),
                value: value.hap_value(),
            });
        }
    }
}

fn characteristic_for(field: TrackedField) -> Characteristic {
    match field {
        TrackedField::Contact => Characteristic::ContactSensorState,
        TrackedField::LowBattery => Characteristic::StatusLowBattery,
    }
}

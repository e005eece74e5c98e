//! Prometheus exposition of the latest status report.

use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::apcaccess::RawStatus;
use crate::decoder::{ChargingState, DecodedState};

/// Descriptive fields, exported as labels on `apcupsd_info` instead of gauges.
const INFO_KEYS: [&str; 9] = [
    "APC", "HOSTNAME", "UPSNAME", "VERSION", "CABLE", "MODEL", "UPSMODE", "DRIVER", "APCMODEL",
];

const INFO_LABELS: [&str; 9] = [
    "apc", "hostname", "upsname", "version", "cable", "model", "upsmode", "driver", "apcmodel",
];

pub struct Metrics {
    registry: Registry,
    ready: IntGauge,
    battery_percent: IntGauge,
    contact: IntGauge,
    low_battery: IntGauge,
    charging_state: IntGauge,
    temperature: Gauge,
    info: IntGaugeVec,
    fields: GaugeVec,
    poll_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ready = IntGauge::new("apcupsd_ready", "1 once a status report has been received")?;
        let battery_percent = IntGauge::new("apcupsd_battery_percent", "Battery charge in percent")?;
        let contact = IntGauge::new("apcupsd_contact", "1 while the UPS reports an active load")?;
        let low_battery = IntGauge::new("apcupsd_low_battery", "1 while the battery is low")?;
        let charging_state = IntGauge::new(
            "apcupsd_charging_state",
            "0 = not charging, 1 = charging, 2 = not chargeable",
        )?;
        let temperature = Gauge::new(
            "apcupsd_temperature_celsius",
            "Internal temperature in whole degrees, NaN when not reported",
        )?;
        let info = IntGaugeVec::new(
            Opts::new("apcupsd_info", "APC UPS daemon information"),
            &INFO_LABELS,
        )?;
        let fields = GaugeVec::new(
            Opts::new("apcupsd_field", "Numeric fields of the latest status report"),
            &["field"],
        )?;
        let poll_failures = IntCounterVec::new(
            Opts::new("apcupsd_poll_failures_total", "Failed connects and fetches"),
            &["kind"],
        )?;

        registry.register(Box::new(ready.clone()))?;
        registry.register(Box::new(battery_percent.clone()))?;
        registry.register(Box::new(contact.clone()))?;
        registry.register(Box::new(low_battery.clone()))?;
        registry.register(Box::new(charging_state.clone()))?;
        registry.register(Box::new(temperature.clone()))?;
        registry.register(Box::new(info.clone()))?;
        registry.register(Box::new(fields.clone()))?;
        registry.register(Box::new(poll_failures.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        temperature.set(f64::NAN);

        Ok(Metrics {
            registry,
            ready,
            battery_percent,
            contact,
            low_battery,
            charging_state,
            temperature,
            info,
            fields,
            poll_failures,
        })
    }

    pub fn observe(&self, state: &DecodedState, raw: &RawStatus) {
        self.ready.set(1);
        self.battery_percent.set(i64::from(state.battery_percent));
        self.contact.set(i64::from(state.contact_detected));
        self.low_battery.set(i64::from(state.low_battery));
        self.charging_state.set(match state.charging_state {
            ChargingState::NotCharging => 0,
            ChargingState::Charging => 1,
            ChargingState::NotChargeable => 2,
        });
        self.temperature
            .set(state.temperature_celsius.map_or(f64::NAN, f64::from));

        self.info.reset();
        let labels: Vec<&str> = INFO_KEYS
            .iter()
            .map(|key| raw.get(key).unwrap_or_default())
            .collect();
        self.info.with_label_values(&labels).set(1);

        // Fields can vanish between reports, drop the stale ones
        self.fields.reset();
        for (key, value) in raw.iter() {
            if INFO_KEYS.contains(&key) {
                continue;
            }
            let numeric = value.split_whitespace().next().and_then(|v| v.parse::<f64>().ok());
            if let Some(numeric) = numeric {
                self.fields
                    .with_label_values(&[key.to_lowercase().as_str()])
                    .set(numeric);
            }
        }
    }

    pub fn record_failure(&self, kind: &str) {
        self.poll_failures.with_label_values(&[kind]).inc();
    }

    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

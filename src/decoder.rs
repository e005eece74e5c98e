//! Turns a [`RawStatus`] into the semantic UPS state the accessory exposes.
//!
//! Decoding never fails. Fields that are missing or do not parse fall back to
//! their zero value and are reported alongside the result as
//! [`DecodeSoftError`]s.

use std::fmt;

use thiserror::Error;

use crate::apcaccess::RawStatus;

pub const FIELD_STATFLAG: &str = "STATFLAG";
pub const FIELD_BCHARGE: &str = "BCHARGE";
pub const FIELD_TIMELEFT: &str = "TIMELEFT";
pub const FIELD_ITEMP: &str = "ITEMP";

const FULLY_CHARGED: u8 = 100;

/// The apcupsd `STATFLAG` bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags(pub u32);

impl StatusFlags {
    /// UPS is active / load present
    pub const ACTIVE: u32 = 0x08;
    pub const NOT_CHARGING: u32 = 0x10;
    pub const BATTERY_LOW: u32 = 0x40;
    /// No chargeable battery (e.g. none installed)
    pub const NOT_CHARGEABLE: u32 = 0x80;

    /// Parse the first token of a `STATFLAG` value, e.g. `0x05000008 Status Flag`.
    /// `0x`-prefixed tokens are hex, anything else decimal.
    pub fn parse(value: &str) -> Option<Self> {
        let token = value.split_whitespace().next()?;
        let bits = match token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
        {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => token.parse().ok()?,
        };
        Some(StatusFlags(bits))
    }

    fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn contact_detected(self) -> bool {
        self.has(Self::ACTIVE)
    }

    pub fn battery_low(self) -> bool {
        self.has(Self::BATTERY_LOW)
    }

    pub fn not_charging(self) -> bool {
        self.has(Self::NOT_CHARGING)
    }

    pub fn not_chargeable(self) -> bool {
        self.has(Self::NOT_CHARGEABLE)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChargingState {
    #[default]
    NotCharging,
    Charging,
    NotChargeable,
}

impl ChargingState {
    /// Precedence: not chargeable, then not charging or full, then charging.
    pub fn from_flags(flags: StatusFlags, battery_percent: u8) -> Self {
        if flags.not_chargeable() {
            ChargingState::NotChargeable
        } else if flags.not_charging() || battery_percent == FULLY_CHARGED {
            ChargingState::NotCharging
        } else {
            ChargingState::Charging
        }
    }
}

impl fmt::Display for ChargingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChargingState::NotCharging => "NOT_CHARGING",
            ChargingState::Charging => "CHARGING",
            ChargingState::NotChargeable => "NOT_CHARGEABLE",
        };
        f.write_str(name)
    }
}

/// Semantic view of one status report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedState {
    pub contact_detected: bool,
    pub low_battery: bool,
    pub charging_state: ChargingState,
    pub battery_percent: u8,
    pub temperature_celsius: Option<i32>,
    pub time_left: Option<String>,
}

/// A field that could not be decoded. The value degraded to its zero value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeSoftError {
    #[error("{0} is missing from the status report")]
    Missing(&'static str),
    #[error("{field} has unparseable value {value:?}")]
    Malformed { field: &'static str, value: String },
}

impl DecodeSoftError {
    pub fn field(&self) -> &'static str {
        match self {
            DecodeSoftError::Missing(field) => field,
            DecodeSoftError::Malformed { field, .. } => field,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub state: DecodedState,
    pub soft_errors: Vec<DecodeSoftError>,
}

pub fn decode(raw: &RawStatus) -> Decoded {
    let mut soft_errors = Vec::new();

    let flags = field(raw, FIELD_STATFLAG, StatusFlags::parse, &mut soft_errors).unwrap_or_default();
    let battery_percent = field(raw, FIELD_BCHARGE, parse_percent, &mut soft_errors).unwrap_or(0);
    let temperature_celsius = field(raw, FIELD_ITEMP, parse_whole_degrees, &mut soft_errors);

    let state = DecodedState {
        contact_detected: flags.contact_detected(),
        low_battery: flags.battery_low(),
        charging_state: ChargingState::from_flags(flags, battery_percent),
        battery_percent,
        temperature_celsius,
        time_left: raw.get(FIELD_TIMELEFT).map(str::to_string),
    };

    Decoded { state, soft_errors }
}

fn field<T>(
    raw: &RawStatus,
    name: &'static str,
    parse: impl Fn(&str) -> Option<T>,
    soft_errors: &mut Vec<DecodeSoftError>,
) -> Option<T> {
    let Some(value) = raw.get(name) else {
        soft_errors.push(DecodeSoftError::Missing(name));
        return None;
    };
    let parsed = parse(value);
    if parsed.is_none() {
        soft_errors.push(DecodeSoftError::Malformed {
            field: name,
            value: value.to_string(),
        });
    }
    parsed
}

/// Integer portion of the first token, `"95.0 Percent"` -> 95, clamped to 0..=100.
fn parse_percent(value: &str) -> Option<u8> {
    let whole = integer_part(value)?;
    Some(whole.clamp(0, i64::from(FULLY_CHARGED)) as u8)
}

/// `"21.9 C"` -> 21, `"-3.7"` -> -3.
fn parse_whole_degrees(value: &str) -> Option<i32> {
    i32::try_from(integer_part(value)?).ok()
}

/// Integer portion of the first whitespace token, rounded toward zero.
fn integer_part(value: &str) -> Option<i64> {
    let token = value.split_whitespace().next()?;
    let (whole, frac) = token.split_once('.').unwrap_or((token, ""));
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match whole {
        "" | "-" | "+" if !frac.is_empty() => Some(0),
        _ => whole.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, &str)]) -> RawStatus {
        pairs.iter().map(|&(k, v)| (k, v)).collect()
    }

    fn charging(bits: u32, percent: u8) -> ChargingState {
        ChargingState::from_flags(StatusFlags(bits), percent)
    }

    #[test]
    fn test_statflag_parse() {
        assert_eq!(StatusFlags::parse("0x05000008 Status Flag"), Some(StatusFlags(0x0500_0008)));
        assert_eq!(StatusFlags::parse("0X48"), Some(StatusFlags(0x48)));
        assert_eq!(StatusFlags::parse("8"), Some(StatusFlags(8)));
        assert_eq!(StatusFlags::parse("0xZZ"), None);
        assert_eq!(StatusFlags::parse(""), None);
    }

    #[test]
    fn test_not_chargeable_wins() {
        for extra in [0, StatusFlags::NOT_CHARGING, StatusFlags::ACTIVE | StatusFlags::BATTERY_LOW] {
            for percent in [0, 50, 99, 100] {
                assert_eq!(
                    charging(StatusFlags::NOT_CHARGEABLE | extra, percent),
                    ChargingState::NotChargeable
                );
            }
        }
    }

    #[test]
    fn test_not_charging_bit() {
        for percent in [0, 42, 100] {
            assert_eq!(charging(StatusFlags::NOT_CHARGING, percent), ChargingState::NotCharging);
            assert_eq!(
                charging(StatusFlags::NOT_CHARGING | StatusFlags::ACTIVE, percent),
                ChargingState::NotCharging
            );
        }
    }

    #[test]
    fn test_full_battery_counts_as_not_charging() {
        assert_eq!(charging(StatusFlags::ACTIVE, 100), ChargingState::NotCharging);
        assert_eq!(charging(StatusFlags::ACTIVE, 99), ChargingState::Charging);
        assert_eq!(charging(0, 0), ChargingState::Charging);
    }

    #[test]
    fn test_contact_and_low_battery_bits() {
        for bits in 0u32..=0x1ff {
            let flags = StatusFlags(bits);
            assert_eq!(flags.contact_detected(), bits & 0x08 != 0);
            assert_eq!(flags.battery_low(), bits & 0x40 != 0);
        }
    }

    #[test]
    fn test_temperature_whole_degrees() {
        assert_eq!(parse_whole_degrees("21.9"), Some(21));
        assert_eq!(parse_whole_degrees("29.2 C"), Some(29));
        assert_eq!(parse_whole_degrees("-3.7"), Some(-3));
        assert_eq!(parse_whole_degrees("-0.5"), Some(0));
        assert_eq!(parse_whole_degrees("N/A"), None);
    }

    #[test]
    fn test_percent() {
        assert_eq!(parse_percent("95.0 Percent"), Some(95));
        assert_eq!(parse_percent("100"), Some(100));
        assert_eq!(parse_percent("104.0"), Some(100));
        assert_eq!(parse_percent("-1"), Some(0));
        assert_eq!(parse_percent("full"), None);
    }

    #[test]
    fn test_decode_scenario() {
        let decoded = decode(&raw(&[
            ("STATFLAG", "8"),
            ("BCHARGE", "100"),
            ("TIMELEFT", "60.0 Minutes"),
            ("ITEMP", "22.0"),
        ]));
        assert!(decoded.soft_errors.is_empty());
        assert_eq!(
            decoded.state,
            DecodedState {
                contact_detected: true,
                low_battery: false,
                charging_state: ChargingState::NotCharging,
                battery_percent: 100,
                temperature_celsius: Some(22),
                time_left: Some("60.0 Minutes".to_string()),
            }
        );
    }

    #[test]
    fn test_decode_missing_temperature_is_soft() {
        let decoded = decode(&raw(&[("STATFLAG", "0x05000048 Status Flag"), ("BCHARGE", "12.0 Percent")]));
        assert_eq!(decoded.state.temperature_celsius, None);
        assert!(decoded.state.low_battery);
        assert_eq!(decoded.state.charging_state, ChargingState::Charging);
        assert_eq!(decoded.soft_errors, vec![DecodeSoftError::Missing(FIELD_ITEMP)]);
    }

    #[test]
    fn test_decode_degrades_to_zero_values() {
        let decoded = decode(&raw(&[("STATFLAG", "garbage"), ("ITEMP", "hot")]));
        assert_eq!(decoded.state.battery_percent, 0);
        assert!(!decoded.state.contact_detected);
        assert_eq!(decoded.state.temperature_celsius, None);
        let fields: Vec<_> = decoded.soft_errors.iter().map(DecodeSoftError::field).collect();
        assert_eq!(fields, vec![FIELD_STATFLAG, FIELD_BCHARGE, FIELD_ITEMP]);
    }
}

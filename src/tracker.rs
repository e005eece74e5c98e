//! Change detection for the push-worthy UPS signals.

use crate::decoder::DecodedState;

/// Fields whose transitions are pushed downstream. Everything else is pull-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedField {
    Contact,
    LowBattery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub field: TrackedField,
    pub old: bool,
    pub new: bool,
}

/// Last published value of each tracked field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackedState {
    pub contact: bool,
    pub low_battery: bool,
}

#[derive(Debug, Default)]
pub struct StateTracker {
    held: TrackedState,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn held(&self) -> TrackedState {
        self.held
    }

    /// Compare against the held values, contact first, and return one event
    /// per field that flipped.
    pub fn observe(&mut self, decoded: &DecodedState) -> Vec<ChangeEvent> {
        let mut events = Vec::with_capacity(2);
        if let Some(event) = flip(TrackedField::Contact, &mut self.held.contact, decoded.contact_detected) {
            events.push(event);
        }
        if let Some(event) = flip(TrackedField::LowBattery, &mut self.held.low_battery, decoded.low_battery) {
            events.push(event);
        }
        events
    }
}

fn flip(field: TrackedField, held: &mut bool, new: bool) -> Option<ChangeEvent> {
    if *held == new {
        return None;
    }
    let old = std::mem::replace(held, new);
    Some(ChangeEvent { field, old, new })
}

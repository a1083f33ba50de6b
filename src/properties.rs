//! Per-device property bag with change notification: a strongly-typed enum
//! of property names backing an `observer_map<PropertyName, Vec<Callback>>`,
//! rather than a dynamic attribute lookup.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::device::Device;

/// The auto-polled metadata properties, plus the synthesized `init_done`
/// gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyName {
    Name,
    FwVersion,
    BootloaderVersion,
    HardwareVersion,
    BatteryVoltage,
    ProgramState,
    InitDone,
}

impl fmt::Display for PropertyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PropertyName::Name => "name",
            PropertyName::FwVersion => "fw_version",
            PropertyName::BootloaderVersion => "bootloader_version",
            PropertyName::HardwareVersion => "hardware_version",
            PropertyName::BatteryVoltage => "battery_voltage",
            PropertyName::ProgramState => "program_state",
            PropertyName::InitDone => "init_done",
        };
        f.write_str(s)
    }
}

/// Every auto-polled property is a string by default; `init_done` is the
/// one synthesized boolean.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Text(String),
    Flag(bool),
}

impl PropertyValue {
    pub fn as_text(&self) -> &str {
        match self {
            PropertyValue::Text(s) => s.as_str(),
            PropertyValue::Flag(_) => "",
        }
    }

    pub fn as_flag(&self) -> bool {
        match self {
            PropertyValue::Flag(b) => *b,
            PropertyValue::Text(_) => false,
        }
    }
}

pub type ChangeCallback = Arc<dyn Fn(&Device, PropertyName, &PropertyValue) + Send + Sync>;

/// Property store plus change subscribers. Writers dispatch `on_change`
/// subscribers only on value transitions.
pub struct PropertyStore {
    values: HashMap<PropertyName, PropertyValue>,
    subscribers: HashMap<PropertyName, Vec<ChangeCallback>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        let mut values = HashMap::new();
        for name in [
            PropertyName::Name,
            PropertyName::FwVersion,
            PropertyName::BootloaderVersion,
            PropertyName::HardwareVersion,
            PropertyName::BatteryVoltage,
            PropertyName::ProgramState,
        ] {
            values.insert(name, PropertyValue::Text(String::new()));
        }
        values.insert(PropertyName::InitDone, PropertyValue::Flag(false));

        Self {
            values,
            subscribers: HashMap::new(),
        }
    }

    pub fn get(&self, name: PropertyName) -> PropertyValue {
        self.values
            .get(&name)
            .cloned()
            .unwrap_or(PropertyValue::Text(String::new()))
    }

    pub fn subscribe(&mut self, name: PropertyName, cb: ChangeCallback) {
        self.subscribers.entry(name).or_default().push(cb);
    }

    /// Writes `name` to `value`, returning the fired subscribers (as
    /// `(device, name, value)` thunks) iff the value actually changed.
    /// The caller invokes the returned thunks *after* releasing any lock on
    /// this store, to avoid reentrant-lock deadlocks from callbacks that
    /// touch the same device.
    #[must_use]
    pub fn set(&mut self, name: PropertyName, value: PropertyValue) -> Vec<ChangeCallback> {
        let prev = self.values.insert(name, value.clone());
        if prev.as_ref() == Some(&value) {
            return Vec::new();
        }
        self.subscribers.get(&name).cloned().unwrap_or_default()
    }
}

impl Default for PropertyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_with_no_subscribers_returns_empty() {
        let mut store = PropertyStore::new();
        let fired = store.set(
            PropertyName::BatteryVoltage,
            PropertyValue::Text("5000".into()),
        );
        assert!(fired.is_empty());
    }

    #[test]
    fn reassigning_same_value_is_not_a_change() {
        let mut store = PropertyStore::new();
        store.set(PropertyName::Name, PropertyValue::Text("foo".into()));
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();
        store.subscribe(
            PropertyName::Name,
            Arc::new(move |_dev, _name, _val| {
                *count2.lock().unwrap() += 1;
            }),
        );
        // same value again: store.set alone won't call back (caller invokes
        // thunks), but the returned list should be empty since value is
        // unchanged.
        let fired = store.set(PropertyName::Name, PropertyValue::Text("foo".into()));
        assert!(fired.is_empty());
        assert_eq!(*count.lock().unwrap(), 0);
    }
}

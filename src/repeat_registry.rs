//! Repeat Registry: the set of `(device, endpoint)` pairs whose
//! completed Read tasks should be re-armed.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::device::Device;

#[derive(Clone, PartialEq, Eq, Hash)]
struct Key {
    serial: String,
    endpoint: u8,
}

/// Worker-owned; mutated via the thread-safe `add`/`cancel`/`contains`
/// entry points.
pub struct RepeatRegistry {
    keys: Mutex<HashSet<Key>>,
}

impl RepeatRegistry {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn add(&self, device: &Device, endpoint: u8) {
        self.keys.lock().unwrap().insert(Key {
            serial: device.serial().to_string(),
            endpoint,
        });
    }

    /// Removes the key; an in-flight transfer on it completes naturally but
    /// is not re-queued.
    pub fn cancel(&self, device: &Device, endpoint: u8) {
        self.keys.lock().unwrap().remove(&Key {
            serial: device.serial().to_string(),
            endpoint,
        });
    }

    pub fn contains(&self, device: &Device, endpoint: u8) -> bool {
        self.keys.lock().unwrap().contains(&Key {
            serial: device.serial().to_string(),
            endpoint,
        })
    }
}

impl Default for RepeatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Device Registry: reconciles the attached-device set against
//! the previous snapshot, builds/tears down `Device`s, and hands the
//! Supervisor the (removed, added) delta each tick.

use std::time::Duration;

use crate::device::{Device, DeviceIdentity};
use crate::enumerator::{AttachedDevice, UsbEnumerator};
use crate::worker::TransferWorker;

fn identity_matches(a: &AttachedDevice, b: &DeviceIdentity) -> bool {
    a.bus == b.bus && a.address == b.address && a.vendor_id == b.vendor_id && a.product_id == b.product_id
}

pub struct DeviceRegistry {
    enumerator: Box<dyn UsbEnumerator>,
    worker: TransferWorker,
    protocol_ep: u8,
    read_timeout: Duration,
    max_retries: u32,
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new(
        enumerator: Box<dyn UsbEnumerator>,
        worker: TransferWorker,
        protocol_ep: u8,
        read_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            enumerator,
            worker,
            protocol_ep,
            read_timeout,
            max_retries,
            devices: Vec::new(),
        }
    }

    /// All currently tracked devices. Call `update()` first to refresh.
    pub fn all(&self) -> &[Device] {
        &self.devices
    }

    /// Reconciles against the bus, short-circuiting when no hotplug/poll
    /// event has been observed. Returns `(removed, added)`.
    pub fn update(&mut self) -> (Vec<Device>, Vec<Device>) {
        if !self.enumerator.poll_changed() {
            return (Vec::new(), Vec::new());
        }

        let attached = match self.enumerator.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!(error = %e, "device enumeration failed");
                return (Vec::new(), Vec::new());
            }
        };

        let mut removed = Vec::new();
        let mut kept = Vec::new();
        for device in self.devices.drain(..) {
            if attached.iter().any(|a| identity_matches(a, &device.identity())) {
                kept.push(device);
            } else {
                tracing::info!(serial = %device.serial(), "device removed");
                device.remove();
                removed.push(device);
            }
        }
        self.devices = kept;

        let mut added = Vec::new();
        for candidate in &attached {
            if self.devices.iter().any(|d| identity_matches(candidate, &d.identity())) {
                continue;
            }
            let (serial, transport) = match self.enumerator.open(candidate) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open newly attached device");
                    continue;
                }
            };
            let identity = DeviceIdentity {
                bus: candidate.bus,
                address: candidate.address,
                vendor_id: candidate.vendor_id,
                product_id: candidate.product_id,
            };
            let device = Device::new(
                identity,
                serial,
                transport,
                self.worker.clone(),
                self.protocol_ep,
                self.read_timeout,
                self.max_retries,
            );
            tracing::info!(serial = %device.serial(), "device added");
            device.set_configuration();
            self.devices.push(device.clone());
            added.push(device);
        }

        (removed, added)
    }
}

/// Order-insensitive multiset comparison between two device snapshots:
/// `true` if `current` differs from `previous` by membership, regardless
/// of order.
pub fn snapshot_differs(previous: &[Device], current: &[Device]) -> bool {
    let mut remaining: Vec<&Device> = current.iter().collect();
    for dev in previous {
        match remaining.iter().position(|d| *d == dev) {
            Some(idx) => {
                remaining.remove(idx);
            }
            None => return true,
        }
    }
    !remaining.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerator::FakeEnumerator;
    use std::sync::Arc;

    fn worker() -> TransferWorker {
        TransferWorker::start(3)
    }

    #[test]
    fn update_adds_and_configures_new_devices() {
        let fake = FakeEnumerator::new();
        let attached = AttachedDevice {
            bus: 1,
            address: 2,
            vendor_id: 0x1234,
            product_id: 0x5678,
        };
        let transport: Arc<dyn crate::transport::UsbTransport> = Arc::new(crate::transport::FakeTransport::new());
        fake.set_devices(vec![(attached, "AB".into(), transport)]);

        let w = worker();
        let mut registry = DeviceRegistry::new(Box::new(fake), w.clone(), 5, Duration::from_secs(1), 3);
        let (removed, added) = registry.update();
        assert!(removed.is_empty());
        assert_eq!(added.len(), 1);
        assert_eq!(registry.all().len(), 1);
        w.quit();
    }

    #[test]
    fn update_is_a_no_op_without_a_change_event() {
        let fake = FakeEnumerator::new();
        let w = worker();
        let mut registry = DeviceRegistry::new(Box::new(fake), w.clone(), 5, Duration::from_secs(1), 3);
        registry.update();
        let (removed, added) = registry.update();
        assert!(removed.is_empty() && added.is_empty());
        w.quit();
    }
}

//! Device enumeration and hotplug arrival/departure tracking.
//!
//! Mirrors `device_list.py`'s split: a real hotplug callback when the
//! libusb backend supports it, degrading to a 2-second polling timer that
//! emits synthetic change events otherwise. Grounded on `a1ien-rusb`'s
//! `HotplugBuilder`/`Hotplug` API, which is the same surface the published
//! `rusb` crate exposes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use rusb::UsbContext;

use crate::context;
use crate::error::TransportError;
use crate::transport::{RusbTransport, UsbTransport};

/// The libusb-level identity of a device found on the bus, prior to any
/// `Device` wrapper being built for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachedDevice {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Enumerates matching devices and reports when the bus topology may have
/// changed. Kept behind a trait so registry reconciliation logic can
/// be exercised without a physical bus.
pub trait UsbEnumerator: Send + Sync {
    /// True the first time it's called, or whenever a hotplug/poll event has
    /// been observed since the last call. Mirrors `DeviceList._has_changed`.
    fn poll_changed(&self) -> bool;

    fn enumerate(&self) -> Result<Vec<AttachedDevice>, TransportError>;

    fn open(&self, attached: &AttachedDevice) -> Result<(String, Arc<dyn UsbTransport>), TransportError>;
}

struct HotplugBridge {
    tx: Sender<()>,
}

impl rusb::Hotplug<rusb::Context> for HotplugBridge {
    fn device_arrived(&mut self, _device: rusb::Device<rusb::Context>) {
        let _ = self.tx.try_send(());
    }

    fn device_left(&mut self, _device: rusb::Device<rusb::Context>) {
        let _ = self.tx.try_send(());
    }
}

pub struct RusbEnumerator {
    context: rusb::Context,
    vendor_id: u16,
    product_id: u16,
    event_rx: Receiver<()>,
    first_time: AtomicBool,
    // Kept alive only to hold the registration/fallback thread open; never
    // read directly.
    _registration: Option<rusb::Registration<rusb::Context>>,
}

impl RusbEnumerator {
    pub fn new(vendor_id: u16, product_id: u16) -> rusb::Result<RusbEnumerator> {
        let context = context::global_context()?;
        let (tx, rx) = async_channel::unbounded();

        let registration = if context::has_hotplug() {
            let bridge = Box::new(HotplugBridge { tx });
            match rusb::HotplugBuilder::new()
                .vendor_id(vendor_id)
                .product_id(product_id)
                .enumerate(true)
                .register(context.clone(), bridge)
            {
                Ok(reg) => Some(reg),
                Err(e) => {
                    tracing::warn!(error = %e, "hotplug registration failed; falling back to polling");
                    None
                }
            }
        } else {
            None
        };

        if registration.is_none() {
            tracing::warn!("no libusb hotplug support; emulating with a 2s poll timer");
            let fallback_tx = tx.clone();
            std::thread::Builder::new()
                .name("usb-fleet-hotplug-poll".into())
                .spawn(move || loop {
                    std::thread::sleep(Duration::from_secs(2));
                    if fallback_tx.send_blocking(()).is_err() {
                        return;
                    }
                })
                .expect("failed to spawn hotplug poll fallback thread");
        }

        Ok(RusbEnumerator {
            context,
            vendor_id,
            product_id,
            event_rx: rx,
            first_time: AtomicBool::new(true),
            _registration: registration,
        })
    }
}

impl UsbEnumerator for RusbEnumerator {
    fn poll_changed(&self) -> bool {
        let mut changed = self.first_time.swap(false, Ordering::SeqCst);
        while self.event_rx.try_recv().is_ok() {
            changed = true;
        }
        changed
    }

    fn enumerate(&self) -> Result<Vec<AttachedDevice>, TransportError> {
        let devices = self.context.devices().map_err(TransportError::from)?;
        let mut found = Vec::new();
        for device in devices.iter() {
            let desc = match device.device_descriptor() {
                Ok(d) => d,
                Err(_) => continue,
            };
            if desc.vendor_id() != self.vendor_id || desc.product_id() != self.product_id {
                continue;
            }
            found.push(AttachedDevice {
                bus: device.bus_number(),
                address: device.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            });
        }
        Ok(found)
    }

    fn open(&self, attached: &AttachedDevice) -> Result<(String, Arc<dyn UsbTransport>), TransportError> {
        let devices = self.context.devices().map_err(TransportError::from)?;
        for device in devices.iter() {
            if device.bus_number() != attached.bus || device.address() != attached.address {
                continue;
            }
            let desc = device.device_descriptor().map_err(TransportError::from)?;
            let handle = device.open().map_err(TransportError::from)?;
            let serial = handle
                .read_serial_number_string_ascii(&desc)
                .unwrap_or_else(|_| format!("{:04x}:{:04x}:{}:{}", attached.vendor_id, attached.product_id, attached.bus, attached.address));
            let transport: Arc<dyn UsbTransport> = Arc::new(RusbTransport::new(handle));
            return Ok((serial, transport));
        }
        Err(TransportError::NoDevice)
    }
}

/// Scripted test double: `set_devices` defines what the next `enumerate()`
/// returns, and `signal_change` marks the registry dirty the way a hotplug
/// event or poll tick would.
pub struct FakeEnumerator {
    devices: std::sync::Mutex<Vec<(AttachedDevice, String, Arc<dyn UsbTransport>)>>,
    changed: AtomicBool,
}

impl FakeEnumerator {
    pub fn new() -> Self {
        Self {
            devices: std::sync::Mutex::new(Vec::new()),
            changed: AtomicBool::new(true),
        }
    }

    pub fn set_devices(&self, devices: Vec<(AttachedDevice, String, Arc<dyn UsbTransport>)>) {
        *self.devices.lock().unwrap() = devices;
        self.changed.store(true, Ordering::SeqCst);
    }

    pub fn signal_change(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }
}

impl Default for FakeEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbEnumerator for FakeEnumerator {
    fn poll_changed(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }

    fn enumerate(&self) -> Result<Vec<AttachedDevice>, TransportError> {
        Ok(self.devices.lock().unwrap().iter().map(|(a, _, _)| *a).collect())
    }

    fn open(&self, attached: &AttachedDevice) -> Result<(String, Arc<dyn UsbTransport>), TransportError> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|(a, _, _)| a == attached)
            .map(|(_, serial, transport)| (serial.clone(), transport.clone()))
            .ok_or(TransportError::NoDevice)
    }
}

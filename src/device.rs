//! Per-device state machine: identity, property store, and auto-polled metadata.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha1::{Digest, Sha1};

use crate::error::{Result, UsbFleetError};
use crate::properties::{PropertyName, PropertyStore, PropertyValue};
use crate::task::{ControlTask, Direction, OnceCallback, ReadTask, RepeatCallback, WriteTask};
use crate::transport::UsbTransport;
use crate::vendor_requests::{
    default_table, parse_ascii, AutoVendorRequest, CMD_REBOOT, CMD_START, CMD_STOP, GENERAL_CMD,
    TERMINAL_CMD, UPLOAD_FILE, VENDOR_REQUEST_REPLY_LEN,
};
use crate::worker::TransferWorker;

/// Default timeout applied to control transfers whose public API does not
/// take an explicit timeout (general commands, vendor-request polling).
/// Deliberately short: a timed-out sync task is retried indefinitely
/// (interleaving reads) rather than waited out, so a short per-attempt
/// timeout just means more, cheaper attempts.
const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(10);

/// The libusb-level identity that backs device equality: two Devices are
/// equal iff their underlying libusb (bus, address, VID, PID) tuples match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Hashes a raw serial to the public `XXXX-XXXX-XXXX` form.
pub fn hash_serial(raw_serial: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(raw_serial.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    let hex = &hex[..12];
    format!("{}-{}-{}", &hex[0..4], &hex[4..8], &hex[8..12])
}

struct DeviceInner {
    identity: DeviceIdentity,
    full_serial: String,
    serial: String,
    transport: Arc<dyn UsbTransport>,
    worker: TransferWorker,
    protocol_ep: u8,
    read_timeout: Duration,
    max_retries: u32,
    configured: AtomicBool,
    removed: AtomicBool,
    properties: Mutex<PropertyStore>,
    auto_requests: Mutex<Vec<AutoVendorRequest>>,
    before_init: Mutex<HashSet<u8>>,
    on_text: Mutex<Option<Arc<dyn Fn(&Device, &str) + Send + Sync>>>,
    active_repeat_eps: Mutex<HashSet<u8>>,
}

/// A connected unit, identified by its USB serial string. Cheap to clone
/// (an `Arc` handle) so task closures and callbacks may hold their own
/// reference without fighting a borrow checker across threads.
#[derive(Clone)]
pub struct Device(Arc<DeviceInner>);

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device").field("serial", &self.serial()).finish()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.serial())
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.0.identity == other.0.identity
    }
}
impl Eq for Device {}

impl Device {
    /// Constructs a new Device for a freshly discovered `usb_device`:
    /// registers the standard Auto-Vendor-Request table and immediately
    /// kicks off one round of metadata polling.
    pub fn new(
        identity: DeviceIdentity,
        full_serial: String,
        transport: Arc<dyn UsbTransport>,
        worker: TransferWorker,
        protocol_ep: u8,
        read_timeout: Duration,
        max_retries: u32,
    ) -> Device {
        let serial = hash_serial(&full_serial);
        let table = default_table();
        let before_init = table
            .iter()
            .filter(|r| r.before_init)
            .map(|r| r.request)
            .collect();

        let device = Device(Arc::new(DeviceInner {
            identity,
            full_serial,
            serial,
            transport,
            worker,
            protocol_ep,
            read_timeout,
            max_retries,
            configured: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            properties: Mutex::new(PropertyStore::new()),
            auto_requests: Mutex::new(table),
            before_init: Mutex::new(before_init),
            on_text: Mutex::new(None),
            active_repeat_eps: Mutex::new(HashSet::new()),
        }));

        device.update_metadata();
        device
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.0.identity
    }

    pub fn full_serial(&self) -> &str {
        &self.0.full_serial
    }

    pub fn serial(&self) -> &str {
        &self.0.serial
    }

    pub fn configured(&self) -> bool {
        self.0.configured.load(Ordering::SeqCst)
    }

    pub fn is_removed(&self) -> bool {
        self.0.removed.load(Ordering::SeqCst)
    }

    pub fn protocol_endpoint(&self) -> u8 {
        self.0.protocol_ep
    }

    fn transport(&self) -> &Arc<dyn UsbTransport> {
        &self.0.transport
    }

    /// Exposes the underlying transport to the Transfer Worker. Not part of
    /// the public API surface.
    pub(crate) fn transport_for_worker(&self) -> Arc<dyn UsbTransport> {
        self.0.transport.clone()
    }

    // ---- property getters ----

    pub fn name(&self) -> String {
        self.text_property(PropertyName::Name)
    }
    pub fn fw_version(&self) -> String {
        self.text_property(PropertyName::FwVersion)
    }
    pub fn bootloader_version(&self) -> String {
        self.text_property(PropertyName::BootloaderVersion)
    }
    pub fn hardware_version(&self) -> String {
        self.text_property(PropertyName::HardwareVersion)
    }
    pub fn battery_voltage(&self) -> String {
        self.text_property(PropertyName::BatteryVoltage)
    }
    pub fn program_state(&self) -> String {
        self.text_property(PropertyName::ProgramState)
    }
    pub fn init_done(&self) -> bool {
        self.0.properties.lock().unwrap().get(PropertyName::InitDone).as_flag()
    }

    fn text_property(&self, name: PropertyName) -> String {
        self.0.properties.lock().unwrap().get(name).as_text().to_string()
    }

    /// `cb(Device, 'property', new_value)` is called whenever `property`
    /// transitions to a different value.
    pub fn on_change<F>(&self, property: PropertyName, cb: F)
    where
        F: Fn(&Device, PropertyName, &PropertyValue) + Send + Sync + 'static,
    {
        self.0.properties.lock().unwrap().subscribe(property, Arc::new(cb));
    }

    /// `cb(Device, line)` is called for each line of incoming text. Only one
    /// subscriber is kept; a later call replaces an earlier one.
    pub fn on_text<F>(&self, cb: F)
    where
        F: Fn(&Device, &str) + Send + Sync + 'static,
    {
        *self.0.on_text.lock().unwrap() = Some(Arc::new(cb));
    }

    fn set_property(&self, name: PropertyName, value: PropertyValue) {
        let fired = self.0.properties.lock().unwrap().set(name, value.clone());
        for cb in fired {
            cb(self, name, &value);
        }
    }

    // ---- configuration / removal ----

    /// Idempotent: marks the device configured and arms the protocol-endpoint
    /// repeating read exactly once.
    pub fn set_configuration(&self) {
        if self.0.configured.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.transport().set_configuration() {
            tracing::warn!(serial = %self.serial(), error = %e, "set_configuration failed");
            self.0.configured.store(false, Ordering::SeqCst);
            return;
        }
        let demuxer = text_demux_callback(self.clone());
        self.read_internal(self.protocol_endpoint(), 512, self.0.read_timeout, Some(demuxer), true);
    }

    /// Marks this Device removed: the Worker drops its in-flight and
    /// repeating reads and no further submissions are accepted.
    pub fn remove(&self) {
        if self.0.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.0.configured.store(false, Ordering::SeqCst);
        let eps: Vec<u8> = self.0.active_repeat_eps.lock().unwrap().drain().collect();
        if !eps.is_empty() {
            self.0.worker.cancel_autoreads(self, &eps);
        }
    }

    // ---- low-level API ----

    pub fn read(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
        on_complete: Option<RepeatCallback<Vec<u8>>>,
        repeat: bool,
    ) {
        self.read_internal(endpoint, length, timeout, on_complete, repeat)
    }

    fn read_internal(
        &self,
        endpoint: u8,
        length: usize,
        timeout: Duration,
        on_complete: Option<RepeatCallback<Vec<u8>>>,
        repeat: bool,
    ) {
        if self.is_removed() {
            return;
        }
        if repeat {
            self.0.active_repeat_eps.lock().unwrap().insert(endpoint);
        }
        let task = ReadTask {
            device: self.clone(),
            endpoint,
            length,
            timeout,
            repeat,
            on_complete,
            on_fail: None,
        };
        self.0.worker.submit_read(task);
    }

    pub fn cancel_autoreads(&self, endpoints: &[u8]) {
        for ep in endpoints {
            self.0.active_repeat_eps.lock().unwrap().remove(ep);
        }
        self.0.worker.cancel_autoreads(self, endpoints);
    }

    pub fn write(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
        on_complete: Option<OnceCallback<usize>>,
        on_fail: Option<OnceCallback<()>>,
    ) {
        self.write_impl(endpoint, data, timeout, on_complete, on_fail, false)
    }

    fn write_sync(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
        on_complete: Option<OnceCallback<usize>>,
    ) {
        self.write_impl(endpoint, data, timeout, on_complete, None, true)
    }

    fn write_impl(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        timeout: Duration,
        on_complete: Option<OnceCallback<usize>>,
        on_fail: Option<OnceCallback<()>>,
        sync: bool,
    ) {
        if self.is_removed() {
            return;
        }
        let task = WriteTask {
            device: self.clone(),
            endpoint,
            data,
            timeout,
            retries: self.0.max_retries,
            on_complete,
            on_fail,
        };
        self.0.worker.submit_write(task, sync);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn control_request(
        &self,
        request: u8,
        direction: Direction,
        value: u16,
        index: u16,
        data: Option<Vec<u8>>,
        length: u16,
        timeout: Duration,
        on_complete: Option<OnceCallback<Vec<u8>>>,
        on_fail: Option<OnceCallback<()>>,
        max_retries: u32,
        sync: bool,
    ) {
        if self.is_removed() {
            return;
        }
        let task = ControlTask {
            device: self.clone(),
            direction,
            request,
            value,
            index,
            data,
            length,
            timeout,
            retries: max_retries,
            on_complete,
            on_fail,
        };
        self.0.worker.submit_control(task, sync);
    }

    /// Issues one auto-polled vendor request, wiring up the init-done gate
    /// and blacklist-on-failure behavior.
    pub fn vendor_request(&self, request: AutoVendorRequest) {
        let device = self.clone();
        let property = request.property;
        let before_init = request.before_init;
        let req_code = request.request;

        let on_complete: OnceCallback<Vec<u8>> = Box::new(move |data| {
            let value = parse_ascii(&data);
            device.set_property(property, PropertyValue::Text(value));
            if before_init {
                device.resolve_before_init(req_code);
            }
        });

        let device_fail = self.clone();
        let on_fail: OnceCallback<()> = Box::new(move |_| {
            device_fail.blacklist_vendor_request(req_code);
        });

        self.control_request(
            request.request,
            Direction::In,
            0,
            0,
            None,
            VENDOR_REQUEST_REPLY_LEN,
            DEFAULT_CONTROL_TIMEOUT,
            Some(on_complete),
            Some(on_fail),
            2,
            true,
        );
    }

    fn resolve_before_init(&self, request: u8) {
        let mut before_init = self.0.before_init.lock().unwrap();
        before_init.remove(&request);
        let empty = before_init.is_empty();
        drop(before_init);
        if empty && !self.init_done() {
            self.set_property(PropertyName::InitDone, PropertyValue::Flag(true));
        }
    }

    fn blacklist_vendor_request(&self, request: u8) {
        self.0.auto_requests.lock().unwrap().retain(|r| r.request != request);
        self.resolve_before_init(request);
    }

    pub fn update_metadata(&self) {
        let requests: Vec<AutoVendorRequest> = self.0.auto_requests.lock().unwrap().clone();
        for request in requests {
            self.vendor_request(request);
        }
    }

    // ---- high-level API ----

    pub fn send_terminal_command(&self, cmd: &str) {
        let mut payload = cmd.as_bytes().to_vec();
        payload.push(0);
        self.control_request(
            TERMINAL_CMD,
            Direction::Out,
            0,
            0,
            Some(payload),
            0,
            DEFAULT_CONTROL_TIMEOUT,
            None,
            None,
            self.0.max_retries,
            false,
        );
    }

    pub fn start(&self, on_complete: Option<OnceCallback<()>>) {
        self.general_command(CMD_START, on_complete);
    }
    pub fn stop(&self, on_complete: Option<OnceCallback<()>>) {
        self.general_command(CMD_STOP, on_complete);
    }
    pub fn reboot(&self, on_complete: Option<OnceCallback<()>>) {
        self.general_command(CMD_REBOOT, on_complete);
    }

    fn general_command(&self, value: u16, on_complete: Option<OnceCallback<()>>) {
        self.control_request(
            GENERAL_CMD,
            Direction::Out,
            value,
            0,
            None,
            0,
            DEFAULT_CONTROL_TIMEOUT,
            noparams(on_complete),
            None,
            self.0.max_retries,
            true,
        );
    }

    /// Uploads `src` as `dst_filename` on the device: a sync control
    /// transfer announcing the file size, followed by a sync bulk write of
    /// its contents. `on_complete` always receives the destination filename,
    /// not the raw lower-level write callback.
    pub fn upload_file(
        &self,
        dst_filename: String,
        src_path: &str,
        on_complete: Option<OnceCallback<String>>,
    ) -> Result<()> {
        let data = std::fs::read(src_path).map_err(|source| UsbFleetError::FirmwareFileRead {
            path: src_path.to_string(),
            source,
        })?;
        self.upload_data(dst_filename, data, on_complete);
        Ok(())
    }

    fn upload_data(&self, dst_filename: String, data: Vec<u8>, on_complete: Option<OnceCallback<String>>) {
        let len = data.len();
        self.control_request(
            UPLOAD_FILE,
            Direction::Out,
            (len & 0xFFFF) as u16,
            ((len >> 16) & 0xFFFF) as u16,
            Some(dst_filename.clone().into_bytes()),
            0,
            Duration::from_millis(1000),
            None,
            None,
            self.0.max_retries,
            true,
        );

        let wrapped: Option<OnceCallback<usize>> = on_complete.map(|cb| -> OnceCallback<usize> {
            Box::new(move |_written| cb(dst_filename))
        });
        self.write_sync(self.protocol_endpoint(), data, Duration::from_millis(60_000), wrapped);
    }
}

fn noparams(cb: Option<OnceCallback<()>>) -> Option<OnceCallback<Vec<u8>>> {
    cb.map(|cb| -> OnceCallback<Vec<u8>> { Box::new(move |_data| cb(())) })
}

fn text_demux_callback(device: Device) -> RepeatCallback<Vec<u8>> {
    Arc::new(move |data: Vec<u8>| {
        if data.is_empty() {
            return;
        }
        let on_text = device.0.on_text.lock().unwrap().clone();
        let on_text = match on_text {
            Some(cb) => cb,
            None => return,
        };
        let text: String = data.iter().map(|&b| b as char).collect();
        for line in text.split('\n') {
            if !line.is_empty() {
                on_text(&device, line);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_hash_is_deterministic_and_formatted() {
        let a = hash_serial("AB");
        let b = hash_serial("AB");
        assert_eq!(a, b);
        assert_eq!(a.len(), 14);
        assert_eq!(a.as_bytes()[4], b'-');
        assert_eq!(a.as_bytes()[9], b'-');
        assert_ne!(hash_serial("AB"), hash_serial("CD"));
    }

    #[test]
    fn device_equality_is_identity_based() {
        let id1 = DeviceIdentity {
            bus: 1,
            address: 2,
            vendor_id: 0x1234,
            product_id: 0x5678,
        };
        let id2 = id1;
        let worker = TransferWorker::start(3);
        let t1: Arc<dyn UsbTransport> = Arc::new(crate::transport::FakeTransport::new());
        let t2: Arc<dyn UsbTransport> = Arc::new(crate::transport::FakeTransport::new());
        let d1 = Device::new(id1, "AB".into(), t1, worker.clone(), 5, Duration::from_secs(1), 3);
        let d2 = Device::new(id2, "AB".into(), t2, worker.clone(), 5, Duration::from_secs(1), 3);
        assert_eq!(d1, d2);
        worker.quit();
    }

    /// A vendor request that always stalls gets permanently blacklisted
    /// once its retry budget is exhausted, its property stays empty, and
    /// `init_done` still transitions to true with its subscribers firing
    /// exactly once.
    #[test]
    fn blacklists_vendor_request_that_always_stalls() {
        crate::init_test_tracing();
        let worker = TransferWorker::start(3);
        let transport = Arc::new(crate::transport::FakeTransport::new());

        // default_table() order: Name, FwVersion, BootloaderVersion,
        // HardwareVersion succeed; BatteryVoltage stalls through its whole
        // retry budget (vendor_request hardcodes max_retries=2, so 3
        // attempts); ProgramState succeeds.
        for _ in 0..4 {
            transport.push_control_in(crate::transport::ScriptedReply::Ok(b"v1".to_vec()));
        }
        for _ in 0..3 {
            transport.push_control_in(crate::transport::ScriptedReply::Fail(
                crate::error::TransportError::Stall,
            ));
        }
        transport.push_control_in(crate::transport::ScriptedReply::Ok(b"idle".to_vec()));

        let transport_dyn: Arc<dyn UsbTransport> = transport.clone();
        let identity = DeviceIdentity {
            bus: 1,
            address: 3,
            vendor_id: 0x1111,
            product_id: 0x2222,
        };
        let device = Device::new(identity, "BL".into(), transport_dyn, worker.clone(), 5, Duration::from_secs(1), 3);

        let init_done_fires = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fires = init_done_fires.clone();
        device.on_change(PropertyName::InitDone, move |_dev, _name, value| {
            if value.as_flag() {
                fires.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        });

        let start = std::time::Instant::now();
        let settled = loop {
            worker.complete_control_task();
            if device.init_done() {
                break true;
            }
            if start.elapsed() > Duration::from_secs(3) {
                break false;
            }
            std::thread::sleep(Duration::from_millis(2));
        };
        // init_done's own change callback is queued on control_complete too;
        // drain a little longer so it has a chance to run.
        for _ in 0..10 {
            worker.complete_control_task();
        }

        assert!(settled, "init_done should become true once every before_init request resolves or is blacklisted");
        assert_eq!(device.battery_voltage(), "");
        assert_eq!(device.program_state(), "idle");
        assert_eq!(init_done_fires.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!device
            .0
            .auto_requests
            .lock()
            .unwrap()
            .iter()
            .any(|r| r.request == crate::vendor_requests::GET_BATTERY_VOLTAGE));

        worker.quit();
    }
}

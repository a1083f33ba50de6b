//! Per-device USB transport abstraction.
//!
//! Ownership of libusb handles is pinned to the Transfer Worker but is
//! silent on how retry/blacklist/repeat logic should be exercised without a
//! physical bus. This mirrors `cameleon-device`'s split between its `real`
//! (rusb-backed) and `emulator` device backends: the worker drives any
//! `UsbTransport`, production code wires up `RusbTransport`, tests wire up
//! `FakeTransport`.

use std::sync::Mutex;
use std::time::Duration;

use crate::error::TransportError;

/// The blocking, single-endpoint-at-a-time operations the Transfer Worker
/// performs against one attached device.
pub trait UsbTransport: Send + Sync {
    fn set_configuration(&self) -> Result<(), TransportError>;

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// `endpoint` is the bare endpoint number; implementations address the
    /// bulk-in half (`endpoint | 0x80`) themselves.
    fn read_bulk(&self, endpoint: u8, length: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;
}

/// Production backend: a single `rusb::DeviceHandle` for one attached
/// device, opened by the Registry at construction time.
pub struct RusbTransport<T: rusb::UsbContext> {
    handle: rusb::DeviceHandle<T>,
}

impl<T: rusb::UsbContext> RusbTransport<T> {
    pub fn new(handle: rusb::DeviceHandle<T>) -> Self {
        Self { handle }
    }
}

impl<T: rusb::UsbContext> UsbTransport for RusbTransport<T> {
    fn set_configuration(&self) -> Result<(), TransportError> {
        // Many vendor devices ship a single configuration already active;
        // libusb treats re-setting the active configuration as a no-op on
        // most platforms, so we always issue it explicitly here and let the
        // caller (Device::set_configuration) guard idempotence.
        self.handle
            .set_active_configuration(1)
            .map_err(TransportError::from)
    }

    fn control_in(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; length as usize];
        let n = self
            .handle
            .read_control(request_type, request, value, index, &mut buf, timeout)
            .map_err(TransportError::from)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn control_out(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.handle
            .write_control(request_type, request, value, index, data, timeout)
            .map_err(TransportError::from)
    }

    fn read_bulk(&self, endpoint: u8, length: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; length];
        let n = self
            .handle
            .read_bulk(endpoint | 0x80, &mut buf, timeout)
            .map_err(TransportError::from)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.handle
            .write_bulk(endpoint, data, timeout)
            .map_err(TransportError::from)
    }
}

/// A single scripted response, consumed in FIFO order by `FakeTransport`.
#[derive(Clone)]
pub enum ScriptedReply {
    Ok(Vec<u8>),
    Fail(TransportError),
}

/// In-memory test double. Each call kind draws its next reply from its own
/// FIFO queue; an empty queue for a kind yields a `Stall`-classified
/// failure as the simplest "nothing scripted" default, which exercises the
/// blacklist/retry paths if the test leaves it unconfigured.
pub struct FakeTransport {
    control_in: Mutex<Vec<ScriptedReply>>,
    control_out: Mutex<Vec<ScriptedReply>>,
    read_bulk: Mutex<Vec<ScriptedReply>>,
    write_bulk: Mutex<Vec<ScriptedReply>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            control_in: Mutex::new(Vec::new()),
            control_out: Mutex::new(Vec::new()),
            read_bulk: Mutex::new(Vec::new()),
            write_bulk: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_control_in(&self, reply: ScriptedReply) {
        self.control_in.lock().unwrap().push(reply);
    }

    pub fn push_control_out(&self, reply: ScriptedReply) {
        self.control_out.lock().unwrap().push(reply);
    }

    pub fn push_read_bulk(&self, reply: ScriptedReply) {
        self.read_bulk.lock().unwrap().push(reply);
    }

    pub fn push_write_bulk(&self, reply: ScriptedReply) {
        self.write_bulk.lock().unwrap().push(reply);
    }

    fn take(queue: &Mutex<Vec<ScriptedReply>>) -> ScriptedReply {
        let mut guard = queue.lock().unwrap();
        if guard.is_empty() {
            ScriptedReply::Fail(TransportError::Stall)
        } else {
            guard.remove(0)
        }
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for FakeTransport {
    fn set_configuration(&self) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push("set_configuration".into());
        Ok(())
    }

    fn control_in(
        &self,
        _request_type: u8,
        request: u8,
        _value: u16,
        _index: u16,
        _length: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("control_in(req={})", request));
        match Self::take(&self.control_in) {
            ScriptedReply::Ok(data) => Ok(data),
            ScriptedReply::Fail(e) => Err(e),
        }
    }

    fn control_out(
        &self,
        _request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.calls.lock().unwrap().push(format!(
            "control_out(req={}, value={}, index={}, len={})",
            request,
            value,
            index,
            data.len()
        ));
        match Self::take(&self.control_out) {
            ScriptedReply::Ok(data) => Ok(data.len().max(1)),
            ScriptedReply::Fail(e) => Err(e),
        }
    }

    fn read_bulk(&self, endpoint: u8, _length: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("read_bulk(ep={})", endpoint));
        match Self::take(&self.read_bulk) {
            ScriptedReply::Ok(data) => Ok(data),
            ScriptedReply::Fail(e) => Err(e),
        }
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("write_bulk(ep={}, len={})", endpoint, data.len()));
        match Self::take(&self.write_bulk) {
            ScriptedReply::Ok(written) => Ok(written.len()),
            ScriptedReply::Fail(e) => Err(e),
        }
    }
}

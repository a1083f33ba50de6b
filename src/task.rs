//! Transfer Task data model.

use std::sync::Arc;
use std::time::Duration;

use crate::device::Device;

/// Direction of a control transfer's data stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host -> device (`CTRL_OUT`).
    Out,
    /// Device -> host (`CTRL_IN`).
    In,
}

/// A callback invoked exactly once, consuming its captured state.
pub type OnceCallback<T> = Box<dyn FnOnce(T) + Send>;

/// A callback that may be invoked many times (used for repeating reads,
/// where the same `on_complete` fires once per completed chunk).
pub type RepeatCallback<T> = Arc<dyn Fn(T) + Send + Sync>;

/// A control transfer: request-type built from `direction`/vendor/device
/// recipient, a single vendor request code, and either an outbound payload
/// or a requested inbound length.
pub struct ControlTask {
    pub device: Device,
    pub direction: Direction,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    /// Outbound payload (Direction::Out) or `None` for inbound transfers.
    pub data: Option<Vec<u8>>,
    /// Requested length for an inbound transfer.
    pub length: u16,
    pub timeout: Duration,
    /// Attempts remaining against PIPE/stall errors. Timeouts never consume
    /// this budget (timeouts are retried unconditionally).
    pub retries: u32,
    pub on_complete: Option<OnceCallback<Vec<u8>>>,
    pub on_fail: Option<OnceCallback<()>>,
}

impl ControlTask {
    pub fn request_type(&self) -> u8 {
        let direction = match self.direction {
            Direction::Out => rusb::Direction::Out,
            Direction::In => rusb::Direction::In,
        };
        rusb::request_type(direction, rusb::RequestType::Vendor, rusb::Recipient::Device)
    }
}

/// A bulk read, addressed against `endpoint | 0x80`.
pub struct ReadTask {
    pub device: Device,
    pub endpoint: u8,
    pub length: usize,
    pub timeout: Duration,
    /// When true, a successful/timed-out/IO-errored completion causes a
    /// *fresh* Read task (never the same buffer) to be re-enqueued, as long
    /// as `(device, endpoint)` is still present in the repeat registry.
    pub repeat: bool,
    pub on_complete: Option<RepeatCallback<Vec<u8>>>,
    pub on_fail: Option<OnceCallback<()>>,
}

impl ReadTask {
    /// Builds a fresh task with the same parameters, used when re-arming a
    /// repeating read. Never reuses the completed task's buffer.
    pub fn respawn(&self) -> ReadTask {
        ReadTask {
            device: self.device.clone(),
            endpoint: self.endpoint,
            length: self.length,
            timeout: self.timeout,
            repeat: self.repeat,
            on_complete: self.on_complete.clone(),
            on_fail: None,
        }
    }
}

/// A bulk write. Short writes advance `data` by the returned byte count and
/// the remainder is resubmitted on the priority-write queue.
pub struct WriteTask {
    pub device: Device,
    pub endpoint: u8,
    pub data: Vec<u8>,
    pub timeout: Duration,
    /// Attempts remaining against PIPE/stall errors (sync queue only).
    pub retries: u32,
    pub on_complete: Option<OnceCallback<usize>>,
    pub on_fail: Option<OnceCallback<()>>,
}


//! Supervisor configuration. VID/PID are required parameters; protocol
//! endpoint, read timeout, and retry budget are required too but carry
//! documented defaults the core never assumes silently.

use std::time::Duration;

/// Default bulk endpoint carrying the line-oriented text protocol.
pub const DEFAULT_PROTOCOL_EP: u8 = 5;
/// Default timeout for the protocol endpoint's repeating read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);
/// Default PIPE/stall retry budget for control and write tasks.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default firmware update server bind address (`update_server.py`'s demo).
pub const DEFAULT_UPDATE_SERVER_HOST: &str = "localhost";
pub const DEFAULT_UPDATE_SERVER_PORT: u16 = 3853;

/// Required identification plus the ambient knobs left
/// as bare function parameters elsewhere.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub protocol_ep: u8,
    pub read_timeout: Duration,
    pub max_retries: u32,
    pub update_server_enable: bool,
    pub update_server_host: String,
    pub update_server_port: u16,
}

impl SupervisorConfig {
    /// All required parameters with every ambient knob set to its default.
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            protocol_ep: DEFAULT_PROTOCOL_EP,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            update_server_enable: true,
            update_server_host: DEFAULT_UPDATE_SERVER_HOST.to_string(),
            update_server_port: DEFAULT_UPDATE_SERVER_PORT,
        }
    }
}

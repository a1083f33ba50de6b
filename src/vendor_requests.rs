//! Vendor/general request codes and the per-device Auto-Vendor-Request
//! table.

use crate::properties::PropertyName;

// Vendor requests (control-in, 64-byte reply, ASCII string).
pub const GET_PROGRAM_STATE: u8 = 5;
pub const GET_NAME: u8 = 6;
pub const GET_FIRMWARE_VERSION: u8 = 7;
pub const GET_BOOTLOADER_VERSION: u8 = 8;
pub const GET_HARDWARE_VERSION: u8 = 9;
pub const GET_BATTERY_VOLTAGE: u8 = 11;

// General commands (control-out on request code 1, subcommand in `value`).
pub const GENERAL_CMD: u8 = 1;
pub const CMD_START: u16 = 1;
pub const CMD_STOP: u16 = 2;
pub const CMD_REBOOT: u16 = 3;

// Other request codes.
pub const HELLO: u8 = 0;
pub const TERMINAL_CMD: u8 = 2;
pub const DOWNLOAD_FILE: u8 = 3;
pub const UPLOAD_FILE: u8 = 4;

/// Reply length used for every auto-polled vendor request.
pub const VENDOR_REQUEST_REPLY_LEN: u16 = 64;

/// A decoded vendor-request reply (bytes -> ASCII string by default).
pub fn parse_ascii(data: &[u8]) -> String {
    data.iter().map(|&b| b as char).collect()
}

/// One entry of the Auto-Vendor-Request table: a vendor request code, the
/// property it feeds, and whether it participates in the init-done gate.
#[derive(Clone)]
pub struct AutoVendorRequest {
    pub request: u8,
    pub property: PropertyName,
    pub before_init: bool,
}

/// The standard table of auto-polled metadata requests.
pub fn default_table() -> Vec<AutoVendorRequest> {
    vec![
        AutoVendorRequest {
            request: GET_NAME,
            property: PropertyName::Name,
            before_init: true,
        },
        AutoVendorRequest {
            request: GET_FIRMWARE_VERSION,
            property: PropertyName::FwVersion,
            before_init: true,
        },
        AutoVendorRequest {
            request: GET_BOOTLOADER_VERSION,
            property: PropertyName::BootloaderVersion,
            before_init: true,
        },
        AutoVendorRequest {
            request: GET_HARDWARE_VERSION,
            property: PropertyName::HardwareVersion,
            before_init: true,
        },
        AutoVendorRequest {
            request: GET_BATTERY_VOLTAGE,
            property: PropertyName::BatteryVoltage,
            before_init: true,
        },
        AutoVendorRequest {
            request: GET_PROGRAM_STATE,
            property: PropertyName::ProgramState,
            before_init: true,
        },
    ]
}

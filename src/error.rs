//! Error types for the transfer engine and its surrounding services.

use thiserror::Error;

/// Classification of a `rusb` transfer failure, used by the worker to decide
/// whether a task is retried, silently re-armed, or failed outright.
///
/// Grounded on `cameleon-device`'s `u3v::real` mapping of `rusb::Error` onto
/// its own protocol-level error kind (`impl From<rusb::Error> for Error`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The transfer did not complete within its timeout.
    Timeout,
    /// The endpoint stalled (`LIBUSB_ERROR_PIPE`).
    Stall,
    /// Low-level I/O error; never retried.
    Io,
    /// The device was disconnected.
    NoDevice,
    /// Any other `rusb::Error` variant.
    Other,
}

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Pipe => TransportError::Stall,
            rusb::Error::Io => TransportError::Io,
            rusb::Error::NoDevice => TransportError::NoDevice,
            _ => TransportError::Other,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportError::Timeout => "timeout",
            TransportError::Stall => "stall (pipe)",
            TransportError::Io => "I/O error",
            TransportError::NoDevice => "no such device",
            TransportError::Other => "other transport error",
        };
        f.write_str(s)
    }
}

/// Errors that can cross the public API boundary of this crate.
///
/// No panics or raw `rusb` errors
/// escape device/worker internals; failures are reported either through
/// this type (for calls that return `Result`, e.g. file I/O in
/// `upload_file`) or through `on_fail` callbacks (for queued transfers).
#[derive(Debug, Error)]
pub enum UsbFleetError {
    #[error("failed to read firmware file {path}: {source}")]
    FirmwareFileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("usb transport error: {0}")]
    Transport(TransportError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UsbFleetError>;

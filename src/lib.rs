//! usb-fleet: a host-side USB device management library.
//!
//! Keeps a live inventory of a vendor's attached devices over libusb,
//! multiplexes control/bulk transfers across them through a single worker
//! thread, auto-polls per-device metadata, streams line-oriented text, and
//! exposes a TCP side-channel for firmware rollout orchestration.
//!
//! The entry point is [`Supervisor`]: construct one with a
//! [`SupervisorConfig`] and poll [`Supervisor::list_devices`] (or register
//! callbacks on the [`Device`]s it hands back) to drive a fleet.

pub mod callback_queue;
pub mod config;
pub mod context;
pub mod device;
pub mod enumerator;
pub mod error;
pub mod properties;
pub mod registry;
pub mod repeat_registry;
pub mod supervisor;
pub mod task;
pub mod transport;
pub mod vendor_requests;
pub mod worker;

pub use callback_queue::CallbackQueue;
pub use config::SupervisorConfig;
pub use device::{Device, DeviceIdentity};
pub use error::{Result, TransportError, UsbFleetError};
pub use properties::{PropertyName, PropertyValue};
pub use supervisor::Supervisor;
pub use task::Direction;

/// Installs a `tracing` subscriber that writes to the test harness's
/// captured output, so a failing worker/registry/update-server test shows
/// its `tracing::warn!`/`error!` trail instead of swallowing it. Idempotent
/// and safe to call from every test module; only the first call wins.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

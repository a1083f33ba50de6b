//! Process-wide libusb context.
//!
//! libusb keeps global state per `libusb_context`; this is modeled as a
//! lazily initialized singleton guarded by a mutex, mirroring
//! `cameleon-device`'s use of `lazy_static` for shared backend state.

use std::sync::Mutex;

use lazy_static::lazy_static;
use rusb::{Context, UsbContext};

lazy_static! {
    static ref GLOBAL_CONTEXT: Mutex<Option<Context>> = Mutex::new(None);
}

/// Returns the process-wide libusb context, creating it on first use.
pub fn global_context() -> rusb::Result<Context> {
    let mut guard = GLOBAL_CONTEXT.lock().unwrap();
    if let Some(ctx) = guard.as_ref() {
        return Ok(ctx.clone());
    }
    let ctx = Context::new()?;
    *guard = Some(ctx.clone());
    Ok(ctx)
}

/// Drops the process-wide context, if any. Called from `Supervisor::quit`.
pub fn release_global_context() {
    let mut guard = GLOBAL_CONTEXT.lock().unwrap();
    *guard = None;
}

/// True if the active backend supports hotplug notifications.
pub fn has_hotplug() -> bool {
    rusb::has_hotplug()
}

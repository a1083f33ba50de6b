//! Supervisor: top-level orchestrator that owns the Transfer Worker,
//! the Device Registry, and an optional firmware Update Server, and ticks
//! them from one background thread at the fast/slow cadences of
//! a fast/slow tick split.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::SupervisorConfig;
use crate::device::Device;
use crate::enumerator::RusbEnumerator;
use crate::error::{Result, UsbFleetError};
use crate::registry::{snapshot_differs, DeviceRegistry};
use crate::update_server::UpdateServer;
use crate::worker::TransferWorker;

const POLL_INTERVAL_FAST: Duration = Duration::from_millis(100);
const POLL_INTERVAL_SLOW: Duration = Duration::from_millis(1500);
/// Upper bound the ticker thread waits to notice `quit()` before the
/// Supervisor gives up and force-quits anyway (`USB.py`'s `quit`).
const QUIT_FORCE_TIMEOUT: Duration = Duration::from_secs(4);

pub struct Supervisor {
    worker: TransferWorker,
    registry: Arc<Mutex<DeviceRegistry>>,
    update_server: Option<Arc<UpdateServer>>,
    running: Arc<AtomicBool>,
    ticker: Option<std::thread::JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Result<Supervisor> {
        let worker = TransferWorker::start(config.max_retries);

        let enumerator = RusbEnumerator::new(config.vendor_id, config.product_id)
            .map_err(|e| UsbFleetError::Transport(e.into()))?;
        let registry = Arc::new(Mutex::new(DeviceRegistry::new(
            Box::new(enumerator),
            worker.clone(),
            config.protocol_ep,
            config.read_timeout,
            config.max_retries,
        )));

        let update_server = if config.update_server_enable {
            Some(Arc::new(UpdateServer::start(
                &config.update_server_host,
                config.update_server_port,
            )?))
        } else {
            None
        };

        let running = Arc::new(AtomicBool::new(true));

        let tick_running = running.clone();
        let tick_registry = registry.clone();
        let tick_update_server = update_server.clone();
        let tick_worker = worker.clone();
        let ticker = std::thread::Builder::new()
            .name("usb-fleet-supervisor".into())
            .spawn(move || run_ticker(tick_running, tick_registry, tick_update_server, tick_worker))
            .expect("failed to spawn supervisor ticker thread");

        Ok(Supervisor {
            worker,
            registry,
            update_server,
            running,
            ticker: Some(ticker),
        })
    }

    /// Snapshot of tracked devices. With `initialized_only`, devices whose
    /// `init_done` gate has not yet fired are hidden.
    pub fn list_devices(&self, initialized_only: bool) -> Vec<Device> {
        let all = self.registry.lock().unwrap().all().to_vec();
        if initialized_only {
            all.into_iter().filter(|d| d.init_done()).collect()
        } else {
            all
        }
    }

    /// Returns the current device list plus whether it differs from
    /// `previous`.
    pub fn list_devices_changed(&self, previous: &[Device]) -> (Vec<Device>, bool) {
        let current = self.list_devices(false);
        let changed = snapshot_differs(previous, &current);
        (current, changed)
    }

    /// Stops the ticker thread, the update server, and the worker, then
    /// removes every tracked device. Idempotent.
    pub fn quit(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let start = Instant::now();
        if let Some(handle) = self.ticker.take() {
            while !handle.is_finished() && start.elapsed() < QUIT_FORCE_TIMEOUT {
                std::thread::sleep(Duration::from_millis(10));
            }
            if !handle.is_finished() {
                tracing::warn!("supervisor ticker thread did not stop in time; force quitting");
            }
            let _ = handle.join();
        }

        if let Some(server) = self.update_server.take() {
            match Arc::try_unwrap(server) {
                Ok(server) => server.stop(),
                Err(_) => tracing::warn!("update server still referenced at quit time"),
            }
        }

        self.worker.quit();
        crate::context::release_global_context();

        for device in self.registry.lock().unwrap().all() {
            device.remove();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.quit();
    }
}

fn run_ticker(
    running: Arc<AtomicBool>,
    registry: Arc<Mutex<DeviceRegistry>>,
    update_server: Option<Arc<UpdateServer>>,
    worker: TransferWorker,
) {
    let mut last_slow = Instant::now();
    while running.load(Ordering::SeqCst) {
        let (removed, added) = registry.lock().unwrap().update();
        if !removed.is_empty() || !added.is_empty() {
            if let Some(server) = &update_server {
                let snapshot = registry.lock().unwrap().all().to_vec();
                server.update_device_list(snapshot);
            }
        }

        if let Some(server) = &update_server {
            server.poll();
        }

        while worker.complete_control_task() {}
        while worker.complete_write_task() {}
        while worker.complete_read_task() {}

        std::thread::sleep(POLL_INTERVAL_FAST);

        if last_slow.elapsed() > POLL_INTERVAL_SLOW {
            last_slow = Instant::now();
            for device in registry.lock().unwrap().all() {
                device.update_metadata();
            }
        }
    }
}

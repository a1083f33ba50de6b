//! Firmware Update Server: a side-channel TCP service that lets
//! an external tool push firmware onto one or more attached devices.
//!
//! Grounded on `update_server.py`'s `ThreadedTCPRequestHandler` /
//! `FirmwareUpdateServer`: one accept thread, one handler thread per
//! connection, and a `poll()` entry point the Supervisor drains on its fast
//! tick so `FirmwareTask::execute` always runs from the polling thread
//! rather than a handler thread.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};

use crate::device::Device;

const CLIENT_READ_BUDGET: usize = 1024 * 1024;
const TASK_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// `{ dst_filename: src_path }`, in client-specified order.
type FirmwareFiles = Vec<(String, String)>;

struct TaskResult {
    lock: Mutex<Option<bool>>,
    cond: Condvar,
}

impl TaskResult {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            lock: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn set(&self, value: bool) {
        let mut guard = self.lock.lock().unwrap();
        *guard = Some(value);
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> Option<bool> {
        let guard = self.lock.lock().unwrap();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |r| r.is_none())
            .unwrap();
        *guard
    }
}

/// One firmware rollout: stop the device, upload each file in order, then
/// reboot. `execute()` only submits the chain to the device's own task
/// queues; it does not block (that is `wait`'s job).
pub struct FirmwareTask {
    device: Device,
    fw_files: FirmwareFiles,
    result: Arc<TaskResult>,
}

impl FirmwareTask {
    fn new(device: Device, fw_files: FirmwareFiles) -> Self {
        Self {
            device,
            fw_files,
            result: TaskResult::new(),
        }
    }

    pub fn execute(&self) {
        let serial = self.device.serial().to_string();
        tracing::info!(serial = %serial, "updating device: prepare for update");
        self.device.stop(None);

        for (dst_fname, src_fname) in &self.fw_files {
            let result = self.result.clone();
            let log_serial = serial.clone();
            let dst_log = dst_fname.clone();
            let on_complete: crate::task::OnceCallback<String> = Box::new(move |fname| {
                tracing::info!(serial = %log_serial, file = %fname, "updating device: file uploaded");
            });
            if let Err(e) = self.device.upload_file(dst_fname.clone(), src_fname, Some(on_complete)) {
                tracing::warn!(serial = %serial, file = %dst_log, error = %e, "updating device: upload failed");
                result.set(false);
                return;
            }
        }

        let result = self.result.clone();
        let log_serial = serial.clone();
        let on_reboot: crate::task::OnceCallback<()> = Box::new(move |_| {
            tracing::info!(serial = %log_serial, "updating device: reboot done");
            result.set(true);
        });
        self.device.reboot(Some(on_reboot));
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        self.result.wait(timeout).unwrap_or(false)
    }
}

fn list_to_csv(items: &[String]) -> String {
    items.join(",")
}

fn parse_commands(body: &str) -> (Vec<String>, FirmwareFiles) {
    const FILE_PREFIX: &str = "file:";
    let mut to_update = Vec::new();
    let mut fw_files = FirmwareFiles::new();

    for line in body.split('\n') {
        let mut parts = line.splitn(2, '=');
        let key = match parts.next() {
            Some(k) => k,
            None => continue,
        };
        let rest = match parts.next() {
            Some(r) => r,
            None => continue,
        };
        let value = rest.trim_matches('=').to_string();

        if let Some(name) = key.strip_prefix("fw_") {
            let mut dst_name = format!("fw_{}", name);
            if !dst_name.ends_with(".bin") {
                dst_name.push_str(".bin");
            }
            fw_files.push((dst_name, value));
        } else if let Some(dst_name) = key.strip_prefix(FILE_PREFIX) {
            fw_files.push((dst_name.to_string(), value));
        } else if key == "update_devices" {
            to_update = value.split(',').map(|v| v.trim().to_string()).collect();
        } else {
            tracing::warn!(key = %key, "update server: unknown key in client request");
        }
    }

    (to_update, fw_files)
}

fn handle_connection(mut stream: TcpStream, device_list: Arc<Mutex<Vec<Device>>>, task_tx: Sender<Arc<FirmwareTask>>) {
    tracing::info!("firmware update request received");
    let serials: Vec<String> = device_list.lock().unwrap().iter().map(|d| d.serial().to_string()).collect();
    let header = format!("devices={}", list_to_csv(&serials));
    if stream.write_all(header.as_bytes()).is_err() {
        return;
    }

    let mut buf = vec![0u8; CLIENT_READ_BUDGET];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return,
    };
    let body = String::from_utf8_lossy(&buf[..n]).to_string();
    let (to_update, fw_files) = parse_commands(&body);

    let mut updated = Vec::new();
    for dev_id in &to_update {
        let device = device_list.lock().unwrap().iter().find(|d| d.serial() == dev_id).cloned();
        let device = match device {
            Some(d) => d,
            None => continue,
        };
        tracing::info!(device = %dev_id, files = ?fw_files.iter().map(|(d, _)| d.clone()).collect::<Vec<_>>(), "update server: dispatching firmware task");
        let task = Arc::new(FirmwareTask::new(device, fw_files.clone()));
        if task_tx.send_blocking(task.clone()).is_err() {
            continue;
        }
        if task.wait(TASK_WAIT_TIMEOUT) {
            updated.push(dev_id.clone());
        } else {
            tracing::warn!(device = %dev_id, "update server: update failed or timed out");
        }
    }

    let response = format!("updated={}", list_to_csv(&updated));
    let _ = stream.write_all(response.as_bytes());
}

/// Owns the accept loop and the single-slot-per-tick task queue that the
/// Supervisor drains via `poll()`.
pub struct UpdateServer {
    running: Arc<AtomicBool>,
    device_list: Arc<Mutex<Vec<Device>>>,
    task_rx: Receiver<Arc<FirmwareTask>>,
    accept_thread: Option<std::thread::JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl UpdateServer {
    pub fn start(host: &str, port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind((host, port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(host, port, "firmware update server ready");

        let running = Arc::new(AtomicBool::new(true));
        let device_list = Arc::new(Mutex::new(Vec::new()));
        let (task_tx, task_rx) = async_channel::unbounded();

        let accept_running = running.clone();
        let accept_devices = device_list.clone();
        let accept_thread = std::thread::Builder::new()
            .name("usb-fleet-update-server".into())
            .spawn(move || {
                while accept_running.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _addr)) => {
                            let devices = accept_devices.clone();
                            let tx = task_tx.clone();
                            std::thread::spawn(move || handle_connection(stream, devices, tx));
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(Duration::from_millis(100));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "update server accept failed");
                            std::thread::sleep(Duration::from_millis(100));
                        }
                    }
                }
            })
            .expect("failed to spawn update server accept thread");

        Ok(Self {
            running,
            device_list,
            task_rx,
            accept_thread: Some(accept_thread),
            local_addr,
        })
    }

    /// The address actually bound, useful when `port` was 0 at `start()`.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn update_device_list(&self, devices: Vec<Device>) {
        tracing::debug!(count = devices.len(), "update server: device list refreshed");
        *self.device_list.lock().unwrap() = devices;
    }

    /// Runs at most one pending firmware task, on the calling thread.
    pub fn poll(&self) {
        if let Ok(task) = self.task_rx.try_recv() {
            task.execute();
        }
    }

    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        tracing::info!("firmware update server stopped");
    }
}

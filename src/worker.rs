//! Transfer Worker: the single OS thread that owns every attached
//! device's libusb handle and drains the five inbound task queues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use async_channel::{Receiver, Sender};

use crate::device::Device;
use crate::error::TransportError;
use crate::repeat_registry::RepeatRegistry;
use crate::task::{ControlTask, Direction, ReadTask, WriteTask};

/// Reads interleaved after every sync task (and between its own retry
/// attempts), so a long sync sequence or a stalled attempt doesn't starve
/// streaming reads.
const SYNC_READ_INTERLEAVE: usize = 10;
/// Reads serviced per main-loop iteration before yielding to other queues.
const MAIN_LOOP_READS: usize = 3;
/// Delay between retry attempts of a sync task, so a stalled/timing-out
/// device doesn't spin the worker thread.
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Idle sleep at the bottom of the main loop.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

type Thunk = Box<dyn FnOnce() + Send>;

enum SyncTask {
    Control(ControlTask),
    Write(WriteTask),
}

struct Queues {
    control: (Sender<ControlTask>, Receiver<ControlTask>),
    write: (Sender<WriteTask>, Receiver<WriteTask>),
    priority_write: (Sender<WriteTask>, Receiver<WriteTask>),
    read: (Sender<ReadTask>, Receiver<ReadTask>),
    sync: (Sender<SyncTask>, Receiver<SyncTask>),
    control_complete: (Sender<Thunk>, Receiver<Thunk>),
    write_complete: (Sender<Thunk>, Receiver<Thunk>),
    read_complete: (Sender<Thunk>, Receiver<Thunk>),
}

impl Queues {
    fn new() -> Self {
        Self {
            control: async_channel::unbounded(),
            write: async_channel::unbounded(),
            priority_write: async_channel::unbounded(),
            read: async_channel::unbounded(),
            sync: async_channel::unbounded(),
            control_complete: async_channel::unbounded(),
            write_complete: async_channel::unbounded(),
            read_complete: async_channel::unbounded(),
        }
    }

    fn drain_all(&self) {
        while self.control.1.try_recv().is_ok() {}
        while self.write.1.try_recv().is_ok() {}
        while self.priority_write.1.try_recv().is_ok() {}
        while self.read.1.try_recv().is_ok() {}
        while self.sync.1.try_recv().is_ok() {}
        while self.control_complete.1.try_recv().is_ok() {}
        while self.write_complete.1.try_recv().is_ok() {}
        while self.read_complete.1.try_recv().is_ok() {}
    }
}

struct Inner {
    queues: Queues,
    repeat_registry: RepeatRegistry,
    running: AtomicBool,
    max_retries: u32,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap-to-clone handle to the Transfer Worker. Devices hold a clone to
/// submit tasks; the Supervisor holds one to drain completions and to quit.
#[derive(Clone)]
pub struct TransferWorker(Arc<Inner>);

impl TransferWorker {
    /// Spawns the worker thread and returns a handle to it.
    pub fn start(max_retries: u32) -> TransferWorker {
        let inner = Arc::new(Inner {
            queues: Queues::new(),
            repeat_registry: RepeatRegistry::new(),
            running: AtomicBool::new(true),
            max_retries,
            thread: Mutex::new(None),
        });

        let worker_thread_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("usb-fleet-worker".into())
            .spawn(move || run_loop(worker_thread_inner))
            .expect("failed to spawn usb-fleet worker thread");

        *inner.thread.lock().unwrap() = Some(handle);
        TransferWorker(inner)
    }

    pub fn submit_control(&self, task: ControlTask, sync: bool) {
        if sync {
            let _ = self.0.queues.sync.0.send_blocking(SyncTask::Control(task));
        } else {
            let _ = self.0.queues.control.0.send_blocking(task);
        }
    }

    pub fn submit_write(&self, task: WriteTask, sync: bool) {
        if sync {
            let _ = self.0.queues.sync.0.send_blocking(SyncTask::Write(task));
        } else {
            let _ = self.0.queues.write.0.send_blocking(task);
        }
    }

    pub fn submit_read(&self, task: ReadTask) {
        if task.repeat {
            self.0.repeat_registry.add(&task.device, task.endpoint);
        }
        let _ = self.0.queues.read.0.send_blocking(task);
    }

    pub fn cancel_autoreads(&self, device: &Device, endpoints: &[u8]) {
        for ep in endpoints {
            self.0.repeat_registry.cancel(device, *ep);
        }
    }

    /// Pops and runs at most one completed control task's callback, on the
    /// calling thread. Returns whether a completion was available.
    pub fn complete_control_task(&self) -> bool {
        complete_one(&self.0.queues.control_complete.1)
    }

    pub fn complete_write_task(&self) -> bool {
        complete_one(&self.0.queues.write_complete.1)
    }

    pub fn complete_read_task(&self) -> bool {
        complete_one(&self.0.queues.read_complete.1)
    }

    /// Stops the main loop, clears every queue, and joins the worker thread.
    pub fn quit(&self) {
        self.0.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.0.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.0.queues.drain_all();
    }
}

fn complete_one(rx: &Receiver<Thunk>) -> bool {
    match rx.try_recv() {
        Ok(thunk) => {
            thunk();
            true
        }
        Err(_) => false,
    }
}

fn run_loop(inner: Arc<Inner>) {
    while inner.running.load(Ordering::SeqCst) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            handle_control_task(&inner);
            handle_write_task(&inner);
            for _ in 0..MAIN_LOOP_READS {
                handle_read_task(&inner);
            }
            handle_sync_tasks(&inner);
        }));
        if let Err(panic) = result {
            tracing::error!(?panic, "usb-fleet worker loop iteration panicked; continuing");
        }
        std::thread::sleep(IDLE_SLEEP);
    }
    inner.queues.drain_all();
}

fn handle_control_task(inner: &Arc<Inner>) {
    let task = match inner.queues.control.1.try_recv() {
        Ok(t) => t,
        Err(_) => return,
    };
    let device = task.device.clone();
    match execute_control(&task) {
        Ok(payload) => {
            if let Some(cb) = task.on_complete {
                let _ = inner.queues.control_complete.0.try_send(Box::new(move || cb(payload)));
            }
        }
        Err(TransportError::Timeout) => {
            let _ = inner.queues.control.0.try_send(task);
        }
        Err(TransportError::Stall) => {
            if task.retries == 0 {
                tracing::warn!(serial = %device.serial(), "control task exhausted retries on stall");
                fail_control(inner, task);
            } else {
                let mut retried = task;
                retried.retries -= 1;
                let _ = inner.queues.control.0.try_send(retried);
            }
        }
        Err(TransportError::NoDevice) => {
            tracing::error!(serial = %device.serial(), "control task failed: device no longer attached");
            fail_control(inner, task);
        }
        Err(e) => {
            tracing::warn!(serial = %device.serial(), error = %e, "control task failed");
            fail_control(inner, task);
        }
    }
}

/// Queues `task`'s `on_fail` callback onto `control_complete` so it runs on
/// the polling thread, like every other completion, and never inline on the
/// worker thread.
fn fail_control(inner: &Arc<Inner>, task: ControlTask) {
    if let Some(cb) = task.on_fail {
        let _ = inner.queues.control_complete.0.try_send(Box::new(move || cb(())));
    }
}

fn fail_write(inner: &Arc<Inner>, task: WriteTask) {
    if let Some(cb) = task.on_fail {
        let _ = inner.queues.write_complete.0.try_send(Box::new(move || cb(())));
    }
}

fn fail_read(inner: &Arc<Inner>, task: ReadTask) {
    if let Some(cb) = task.on_fail {
        let _ = inner.queues.read_complete.0.try_send(Box::new(move || cb(())));
    }
}

fn execute_control(task: &ControlTask) -> Result<Vec<u8>, TransportError> {
    let transport = task.device.transport_for_worker();
    let request_type = task.request_type();
    match task.direction {
        Direction::In => transport.control_in(request_type, task.request, task.value, task.index, task.length, task.timeout),
        Direction::Out => {
            let data = task.data.as_deref().unwrap_or(&[]);
            transport
                .control_out(request_type, task.request, task.value, task.index, data, task.timeout)
                .map(|_| Vec::new())
        }
    }
}

fn handle_write_task(inner: &Arc<Inner>) {
    let task = match inner.queues.priority_write.1.try_recv() {
        Ok(t) => t,
        Err(_) => match inner.queues.write.1.try_recv() {
            Ok(t) => t,
            Err(_) => return,
        },
    };
    let device = task.device.clone();
    let transport = device.transport_for_worker();
    match transport.write_bulk(task.endpoint, &task.data, task.timeout) {
        Ok(n) if n >= task.data.len() => {
            if let Some(cb) = task.on_complete {
                let total = task.data.len();
                let _ = inner.queues.write_complete.0.try_send(Box::new(move || cb(total)));
            }
        }
        Ok(n) => {
            let mut remaining = task;
            remaining.data.drain(0..n);
            let _ = inner.queues.priority_write.0.try_send(remaining);
        }
        Err(TransportError::Timeout) => {
            let _ = inner.queues.priority_write.0.try_send(task);
        }
        Err(e) => {
            tracing::warn!(serial = %device.serial(), error = %e, "write task failed");
            fail_write(inner, task);
        }
    }
}

fn handle_read_task(inner: &Arc<Inner>) {
    let task = match inner.queues.read.1.try_recv() {
        Ok(t) => t,
        Err(_) => return,
    };
    let device = task.device.clone();
    let transport = device.transport_for_worker();
    let repeating = inner.repeat_registry.contains(&device, task.endpoint);

    match transport.read_bulk(task.endpoint, task.length, task.timeout) {
        Ok(data) => {
            if let Some(cb) = task.on_complete.clone() {
                let payload = data.clone();
                let _ = inner.queues.read_complete.0.try_send(Box::new(move || cb(payload)));
            }
            if repeating {
                let _ = inner.queues.read.0.try_send(task.respawn());
            }
        }
        Err(TransportError::Timeout) => {
            if repeating {
                let _ = inner.queues.read.0.try_send(task.respawn());
            }
        }
        Err(TransportError::Io) => {
            if repeating {
                let _ = inner.queues.read.0.try_send(task.respawn());
            }
            tracing::warn!(serial = %device.serial(), "read task I/O error");
            fail_read(inner, task);
        }
        Err(TransportError::NoDevice) => {
            tracing::error!(serial = %device.serial(), "read task failed: device no longer attached");
            fail_read(inner, task);
        }
        Err(e) => {
            tracing::warn!(serial = %device.serial(), error = %e, "read task failed");
            fail_read(inner, task);
        }
    }
}

fn handle_sync_tasks(inner: &Arc<Inner>) {
    loop {
        let task = match inner.queues.sync.1.try_recv() {
            Ok(t) => t,
            Err(_) => return,
        };
        run_sync_task(inner, task);
        interleave_reads(inner);
    }
}

fn run_sync_task(inner: &Arc<Inner>, task: SyncTask) {
    match task {
        SyncTask::Control(task) => run_sync_control(inner, task),
        SyncTask::Write(task) => run_sync_write(inner, task),
    }
}

fn run_sync_control(inner: &Arc<Inner>, mut task: ControlTask) {
    loop {
        let device = task.device.clone();
        match execute_control(&task) {
            Ok(payload) => {
                if let Some(cb) = task.on_complete {
                    let _ = inner.queues.control_complete.0.try_send(Box::new(move || cb(payload)));
                }
                return;
            }
            Err(TransportError::Timeout) => {
                interleave_reads(inner);
                std::thread::sleep(SYNC_RETRY_DELAY);
                continue;
            }
            Err(TransportError::Stall) => {
                if task.retries == 0 {
                    tracing::warn!(serial = %device.serial(), "sync control task exhausted retries on stall");
                    fail_control(inner, task);
                    return;
                }
                task.retries -= 1;
                interleave_reads(inner);
                std::thread::sleep(SYNC_RETRY_DELAY);
                continue;
            }
            Err(e) => {
                tracing::warn!(serial = %device.serial(), error = %e, "sync control task failed");
                fail_control(inner, task);
                return;
            }
        }
    }
}

fn run_sync_write(inner: &Arc<Inner>, mut task: WriteTask) {
    let total_len = task.data.len();
    loop {
        let device = task.device.clone();
        let transport = device.transport_for_worker();
        match write_fully(&*transport, &mut task) {
            Ok(()) => {
                if let Some(cb) = task.on_complete {
                    let _ = inner.queues.write_complete.0.try_send(Box::new(move || cb(total_len)));
                }
                return;
            }
            Err(TransportError::Timeout) => {
                interleave_reads(inner);
                std::thread::sleep(SYNC_RETRY_DELAY);
                continue;
            }
            Err(TransportError::Stall) => {
                if task.retries == 0 {
                    tracing::warn!(serial = %device.serial(), "sync write task exhausted retries on stall");
                    fail_write(inner, task);
                    return;
                }
                task.retries -= 1;
                interleave_reads(inner);
                std::thread::sleep(SYNC_RETRY_DELAY);
                continue;
            }
            Err(e) => {
                tracing::warn!(serial = %device.serial(), error = %e, "sync write task failed");
                fail_write(inner, task);
                return;
            }
        }
    }
}

fn write_fully(transport: &dyn crate::transport::UsbTransport, task: &mut WriteTask) -> Result<(), TransportError> {
    while !task.data.is_empty() {
        let n = transport.write_bulk(task.endpoint, &task.data, task.timeout)?;
        if n == 0 {
            return Err(TransportError::Other);
        }
        task.data.drain(0..n);
    }
    Ok(())
}

fn interleave_reads(inner: &Arc<Inner>) {
    for _ in 0..SYNC_READ_INTERLEAVE {
        handle_read_task(inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceIdentity};
    use crate::task::Direction;
    use crate::transport::{FakeTransport, ScriptedReply};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn test_device(worker: TransferWorker, transport: Arc<FakeTransport>) -> Device {
        let identity = DeviceIdentity {
            bus: 1,
            address: 1,
            vendor_id: 0x1234,
            product_id: 0x5678,
        };
        Device::new(identity, "SN".into(), transport, worker, 5, Duration::from_millis(50), 3)
    }

    fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    /// `Device::new` kicks off one round of auto-metadata polling, which
    /// shares the fake transport's `control_in` queue with whatever a test
    /// scripts afterwards. Pre-seed six successful replies
    /// (one per `default_table()` entry) and drain them before a test
    /// scripts its own `control_in` sequence, so the two don't race.
    fn settle_auto_metadata(worker: &TransferWorker, transport: &FakeTransport, device: &Device) {
        for _ in 0..6 {
            transport.push_control_in(ScriptedReply::Ok(b"meta".to_vec()));
        }
        assert!(wait_until(
            || {
                worker.complete_control_task();
                device.init_done()
            },
            Duration::from_secs(3),
        ));
    }

    /// A control task that stalls exactly `max_retries` times before
    /// succeeding still completes successfully.
    #[test]
    fn control_task_retries_stall_then_succeeds() {
        crate::init_test_tracing();
        let worker = TransferWorker::start(3);
        let transport = Arc::new(FakeTransport::new());
        let device = test_device(worker.clone(), transport.clone());
        settle_auto_metadata(&worker, &transport, &device);

        transport.push_control_in(ScriptedReply::Fail(TransportError::Stall));
        transport.push_control_in(ScriptedReply::Fail(TransportError::Stall));
        transport.push_control_in(ScriptedReply::Ok(b"ok".to_vec()));

        let completed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let c1 = completed.clone();
        let f1 = failed.clone();
        device.control_request(
            99,
            Direction::In,
            0,
            0,
            None,
            2,
            Duration::from_millis(50),
            Some(Box::new(move |_data| {
                c1.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Box::new(move |_| {
                f1.fetch_add(1, Ordering::SeqCst);
            })),
            2,
            false,
        );

        wait_until(
            || {
                worker.complete_control_task();
                completed.load(Ordering::SeqCst) > 0
            },
            Duration::from_secs(2),
        );

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 0);
        worker.quit();
    }

    /// One stall beyond the retry budget invokes
    /// `on_fail` exactly once and never `on_complete`.
    #[test]
    fn control_task_exhausts_retry_budget_and_fails() {
        crate::init_test_tracing();
        let worker = TransferWorker::start(3);
        let transport = Arc::new(FakeTransport::new());
        let device = test_device(worker.clone(), transport.clone());
        settle_auto_metadata(&worker, &transport, &device);

        transport.push_control_in(ScriptedReply::Fail(TransportError::Stall));
        transport.push_control_in(ScriptedReply::Fail(TransportError::Stall));

        let completed = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));
        let c1 = completed.clone();
        let f1 = failed.clone();
        device.control_request(
            99,
            Direction::In,
            0,
            0,
            None,
            2,
            Duration::from_millis(50),
            Some(Box::new(move |_data| {
                c1.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Box::new(move |_| {
                f1.fetch_add(1, Ordering::SeqCst);
            })),
            1,
            false,
        );

        wait_until(
            || {
                worker.complete_control_task();
                failed.load(Ordering::SeqCst) > 0
            },
            Duration::from_secs(2),
        );

        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        worker.quit();
    }

    /// A repeating read survives repeated timeouts without ever firing
    /// `on_complete` or leaving the repeat registry.
    #[test]
    fn repeating_read_survives_timeouts_and_never_completes() {
        crate::init_test_tracing();
        let worker = TransferWorker::start(3);
        let transport = Arc::new(FakeTransport::new());
        for _ in 0..3 {
            transport.push_read_bulk(ScriptedReply::Fail(TransportError::Timeout));
        }
        let device = test_device(worker.clone(), transport.clone());

        let completions = Arc::new(AtomicUsize::new(0));
        let c1 = completions.clone();
        device.read(
            7,
            64,
            Duration::from_millis(20),
            Some(Arc::new(move |_data: Vec<u8>| {
                c1.fetch_add(1, Ordering::SeqCst);
            })),
            true,
        );

        wait_until(
            || transport.calls.lock().unwrap().iter().filter(|c| c.starts_with("read_bulk")).count() >= 4,
            Duration::from_secs(2),
        );

        while worker.complete_read_task() {}
        assert_eq!(completions.load(Ordering::SeqCst), 0);
        assert!(worker.0.repeat_registry.contains(&device, 7));

        device.cancel_autoreads(&[7]);
        assert!(!worker.0.repeat_registry.contains(&device, 7));
        worker.quit();
    }

    /// Successful completions of a repeating read are delivered once per
    /// chunk and the registry still holds the key until cancelled.
    #[test]
    fn repeating_read_delivers_each_successful_chunk() {
        crate::init_test_tracing();
        let worker = TransferWorker::start(3);
        let transport = Arc::new(FakeTransport::new());
        for payload in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            transport.push_read_bulk(ScriptedReply::Ok(payload));
        }
        let device = test_device(worker.clone(), transport.clone());

        let chunks = Arc::new(Mutex::new(Vec::new()));
        let chunks1 = chunks.clone();
        device.read(
            7,
            64,
            Duration::from_millis(20),
            Some(Arc::new(move |data: Vec<u8>| {
                chunks1.lock().unwrap().push(data);
            })),
            true,
        );

        wait_until(
            || {
                while worker.complete_read_task() {}
                chunks.lock().unwrap().len() >= 3
            },
            Duration::from_secs(2),
        );

        let got = chunks.lock().unwrap().clone();
        assert_eq!(got, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(worker.0.repeat_registry.contains(&device, 7));
        worker.quit();
    }

    /// A burst of back-to-back successful sync control tasks must not starve
    /// a repeating read: the worker interleaves `SYNC_READ_INTERLEAVE` reads
    /// after *every* sync task, not only on its retry paths.
    #[test]
    fn sync_task_burst_interleaves_reads_between_each_task() {
        crate::init_test_tracing();
        let worker = TransferWorker::start(3);
        let transport = Arc::new(FakeTransport::new());
        let device = test_device(worker.clone(), transport.clone());
        settle_auto_metadata(&worker, &transport, &device);

        const SYNC_TASKS: usize = 20;
        // Over-provision well beyond the exact SYNC_TASKS * SYNC_READ_INTERLEAVE
        // ceiling: the background main loop also services a few reads on its
        // own cadence, and an exhausted scripted queue would otherwise let a
        // stray Stall reply kill the repeating read before the burst finishes.
        for _ in 0..(SYNC_TASKS * SYNC_READ_INTERLEAVE * 4) {
            transport.push_read_bulk(ScriptedReply::Ok(b"x".to_vec()));
        }
        for _ in 0..SYNC_TASKS {
            transport.push_control_in(ScriptedReply::Ok(b"ok".to_vec()));
        }

        device.read(7, 64, Duration::from_millis(20), Some(Arc::new(|_data: Vec<u8>| {})), true);

        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..SYNC_TASKS {
            let c = completed.clone();
            device.control_request(
                99,
                Direction::In,
                0,
                0,
                None,
                0,
                Duration::from_millis(50),
                Some(Box::new(move |_data| {
                    c.fetch_add(1, Ordering::SeqCst);
                })),
                None,
                2,
                true,
            );
        }

        wait_until(
            || {
                worker.complete_control_task();
                completed.load(Ordering::SeqCst) >= SYNC_TASKS
            },
            Duration::from_secs(3),
        );
        assert_eq!(completed.load(Ordering::SeqCst), SYNC_TASKS);

        let read_calls = transport.calls.lock().unwrap().iter().filter(|c| c.starts_with("read_bulk")).count();
        // Before the fix, a burst of successful sync tasks drained without
        // ever calling interleave_reads, so this count stayed near whatever
        // the main loop's own MAIN_LOOP_READS serviced incidentally. Each
        // sync task now interleaves up to SYNC_READ_INTERLEAVE reads, so the
        // burst should have driven well beyond that incidental floor.
        assert!(
            read_calls >= SYNC_TASKS * SYNC_READ_INTERLEAVE / 2,
            "expected sync-task burst to interleave reads, only saw {} read_bulk calls",
            read_calls
        );

        device.cancel_autoreads(&[7]);
        worker.quit();
    }
}

//! Cross-thread callback hand-off: lets code running on the worker or
//! hotplug thread schedule a closure to run later on whichever thread
//! calls `poll()`.

use async_channel::{Receiver, Sender};

type Thunk = Box<dyn FnOnce() + Send>;

/// Up to this many queued closures run per `poll()` call, mirroring
/// `callback_queue.py`'s `count = 100` budget so one chatty producer can't
/// starve the polling thread indefinitely.
const POLL_BUDGET: usize = 100;

pub struct CallbackQueue {
    tx: Sender<Thunk>,
    rx: Receiver<Thunk>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    /// Wraps `func` so that calling the returned closure with `args` enqueues
    /// `(func, args)` to run as `func(args)` later, inside `poll()`, instead
    /// of running immediately.
    pub fn wrap<A, F>(&self, func: F) -> impl Fn(A) + Send + Sync + Clone
    where
        F: Fn(A) + Send + Sync + 'static,
        A: Send + 'static,
    {
        let tx = self.tx.clone();
        let func = std::sync::Arc::new(func);
        move |args: A| {
            let func = func.clone();
            let _ = tx.try_send(Box::new(move || func(args)));
        }
    }

    /// Runs up to `POLL_BUDGET` queued closures on the calling thread.
    /// Returns whether any ran.
    pub fn poll(&self) -> bool {
        let mut ran_any = false;
        for _ in 0..POLL_BUDGET {
            match self.rx.try_recv() {
                Ok(thunk) => {
                    thunk();
                    ran_any = true;
                }
                Err(_) => break,
            }
        }
        ran_any
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn wrap_defers_execution_until_poll() {
        let queue = CallbackQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let wrapped = queue.wrap(move |n: usize| {
            count2.fetch_add(n, Ordering::SeqCst);
        });

        wrapped(1);
        wrapped(1);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        assert!(queue.poll());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(!queue.poll());
    }

    /// A single wrapped callable, invoked with distinct arguments A, B, C
    /// (in that order) from one thread, is drained by `poll()` on another
    /// thread in the same order, each invocation receiving its own argument;
    /// a second `poll()` finds nothing left.
    #[test]
    fn poll_drains_in_fifo_order_across_threads() {
        let queue = Arc::new(CallbackQueue::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let order2 = order.clone();
        let wrapped = queue.wrap(move |label: &'static str| order2.lock().unwrap().push(label));

        let producer = std::thread::spawn(move || {
            wrapped("A");
            wrapped("B");
            wrapped("C");
        });
        producer.join().unwrap();

        let poll_queue = queue.clone();
        let ran = std::thread::spawn(move || poll_queue.poll()).join().unwrap();

        assert!(ran);
        assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
        assert!(!queue.poll());
    }

    /// `poll()` runs at most `POLL_BUDGET` callables per call, leaving the
    /// rest queued for the next call rather than running an unbounded batch.
    #[test]
    fn poll_stops_after_budget_and_resumes_on_next_call() {
        let queue = CallbackQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let wrapped = queue.wrap(move |_: ()| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..(POLL_BUDGET + 7) {
            wrapped(());
        }

        assert!(queue.poll());
        assert_eq!(count.load(Ordering::SeqCst), POLL_BUDGET);

        assert!(queue.poll());
        assert_eq!(count.load(Ordering::SeqCst), POLL_BUDGET + 7);

        assert!(!queue.poll());
    }
}

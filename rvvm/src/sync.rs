// SPDX-License-Identifier: Apache-2.0

//! Synchronization primitives for the hart scheduler.
//!
//! [`WaitCell`] is the condvar a WFI-parked hart blocks on: timeouts are
//! nanosecond-granular and waiters are counted so that wakes from interrupt
//! producers skip the syscall when nobody is parked. [`ThreadPool`] offloads
//! short device tasks (MMIO `update` callbacks) from the event loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use lazy_static::lazy_static;

/// A one-word condition variable with waiter tracking.
pub struct WaitCell {
    waiters: AtomicU32,
    lock: Mutex<u64>,
    cond: Condvar,
}

impl WaitCell {
    pub fn new() -> WaitCell {
        WaitCell { waiters: AtomicU32::new(0), lock: Mutex::new(0), cond: Condvar::new() }
    }

    /// Block until woken or until `timeout_ns` elapses. Spurious returns are
    /// fine: every caller re-checks its predicate in a loop.
    pub fn wait_ns(&self, timeout_ns: u64) {
        let guard = self.lock.lock().unwrap();
        let seq = *guard;
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let _unused = self
            .cond
            .wait_timeout_while(guard, Duration::from_nanos(timeout_ns), |s| *s == seq)
            .unwrap();
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake all waiters. Cheap when nobody waits: a single atomic load.
    pub fn wake(&self) {
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        let mut guard = self.lock.lock().unwrap();
        *guard = guard.wrapping_add(1);
        self.cond.notify_all();
    }
}

impl Default for WaitCell {
    fn default() -> WaitCell { WaitCell::new() }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of worker threads for short offloaded tasks.
pub struct ThreadPool {
    sender: Sender<Task>,
}

impl ThreadPool {
    pub fn new(workers: usize) -> ThreadPool {
        let (sender, receiver) = unbounded::<Task>();
        for n in 0..workers {
            let receiver = receiver.clone();
            std::thread::Builder::new()
                .name(format!("rvvm worker {}", n))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .expect("couldn't spawn pool worker");
        }
        ThreadPool { sender }
    }

    /// Queue a task. Tasks must be short; a blocked worker starves the rest
    /// of the queue, not the harts.
    pub fn spawn<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.sender.send(Box::new(task)).expect("worker pool is gone");
    }
}

lazy_static! {
    /// Process-wide pool shared by every machine's event loop.
    pub static ref POOL: ThreadPool = ThreadPool::new(4);
}

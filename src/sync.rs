/*
 * Blocking primitives: a counting completion, the in-flight gate used for
 * back-pressure and drain, and an on-demand single worker.
 */
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::error;

/// Counting completion signal.
#[derive(Default)]
pub struct Completion {
    done: Mutex<u32>,
    cond: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        *self.done.lock() += 1;
        self.cond.notify_one();
    }

    /// Consumes one completion. False if none arrived before `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while *done == 0 {
            if self.cond.wait_until(&mut done, deadline).timed_out() && *done == 0 {
                return false;
            }
        }
        *done -= 1;
        true
    }
}

/// Counts messages in flight for one engine and caps them at `limit`.
pub struct InflightGate {
    count: Mutex<usize>,
    cond: Condvar,
    limit: usize,
}

impl InflightGate {
    pub fn new(limit: usize) -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
            limit,
        }
    }

    /// Blocks while the engine is at its limit, then takes a slot.
    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count >= self.limit {
            self.cond.wait(&mut count);
        }
        *count += 1;
    }

    pub fn release(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        self.cond.notify_all();
    }

    pub fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count != 0 {
            self.cond.wait(&mut count);
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.count.lock()
    }
}

#[derive(Default)]
struct WorkState {
    pending: bool,
    running: bool,
    stop: bool,
}

struct WorkShared {
    state: Mutex<WorkState>,
    cond: Condvar,
}

/// A dedicated thread running `handler` each time work is queued.
/// Queuing while the handler runs schedules exactly one more run.
pub struct WorkQueue {
    shared: Arc<WorkShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    pub fn new(name: &str, handler: impl Fn() + Send + 'static) -> std::io::Result<Self> {
        let shared = Arc::new(WorkShared {
            state: Mutex::new(WorkState::default()),
            cond: Condvar::new(),
        });
        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || loop {
                {
                    let mut state = worker.state.lock();
                    while !state.pending && !state.stop {
                        worker.cond.wait(&mut state);
                    }
                    if state.stop {
                        return;
                    }
                    state.pending = false;
                    state.running = true;
                }
                handler();
                let mut state = worker.state.lock();
                state.running = false;
                worker.cond.notify_all();
            })?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn queue(&self) {
        let mut state = self.shared.state.lock();
        state.pending = true;
        self.shared.cond.notify_all();
    }

    /// Waits until no work is queued or running.
    pub fn flush(&self) {
        let mut state = self.shared.state.lock();
        while (state.pending || state.running) && !state.stop {
            self.shared.cond.wait(&mut state);
        }
    }

    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                error!("work queue thread panicked");
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

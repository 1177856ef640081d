//! One-shot delayed work on a dedicated thread.
//!
//! [`DelayedWork`] runs its callback once per [`schedule`](DelayedWork::schedule)
//! after the requested delay. Re-scheduling replaces the pending deadline.
//! The callback never runs concurrently with itself, and
//! [`cancel_sync`](DelayedWork::cancel_sync) waits for an in-flight run to
//! finish and drops whatever deadline that run may have re-armed.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Default)]
struct WorkState {
    deadline: Option<Instant>,
    running: bool,
    cancel_pending: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<WorkState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WorkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, WorkState>) -> MutexGuard<'a, WorkState> {
        self.wake.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct DelayedWork {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl DelayedWork {
    /// Spawns the worker thread. Nothing runs until the first `schedule`.
    pub fn spawn<F>(name: &str, work: F) -> std::io::Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkState::default()),
            wake: Condvar::new(),
        });
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(&worker_shared, work))?;
        let worker_id = handle.thread().id();

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            worker_id,
        })
    }

    /// Arms the work to run once after `delay`, replacing a pending deadline.
    pub fn schedule(&self, delay: Duration) {
        let mut state = self.shared.lock();
        if state.shutdown {
            return;
        }
        state.deadline = Some(Instant::now() + delay);
        self.shared.wake.notify_all();
    }

    pub fn is_pending(&self) -> bool {
        self.shared.lock().deadline.is_some()
    }

    /// Drops the pending deadline and waits for an in-flight run to finish.
    ///
    /// When called from the work itself the in-flight run is the caller, so
    /// only the deadline is dropped.
    pub fn cancel_sync(&self) {
        let mut state = self.shared.lock();
        state.deadline = None;
        if state.running && thread::current().id() != self.worker_id {
            state.cancel_pending = true;
            while state.running {
                state = self.shared.wait(state);
            }
        }
    }

    /// Cancels pending work and joins the worker thread.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.deadline = None;
            self.shared.wake.notify_all();
        }
        if thread::current().id() == self.worker_id {
            return;
        }
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            debug!("delayed work thread panicked");
        }
    }
}

impl Drop for DelayedWork {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<F: Fn()>(shared: &Shared, work: F) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => state = shared.wait(state),
            Some(deadline) => {
                let now = Instant::now();
                if now < deadline {
                    state = shared
                        .wake
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                    continue;
                }
                state.deadline = None;
                state.running = true;
                drop(state);

                work();

                state = shared.lock();
                // whatever the run re-armed is stale once cancelled
                if state.cancel_pending {
                    state.deadline = None;
                    state.cancel_pending = false;
                }
                state.running = false;
                shared.wake.notify_all();
            }
        }
    }
}

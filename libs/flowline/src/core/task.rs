// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Task: the worker thread behind a pull-scheduled or live source port.
//!
//! A task repeatedly invokes its function on a dedicated thread. Every
//! iteration runs under the bound port's stream lock, so the worker
//! serializes with any push or pull into that port. Stopping a blocked
//! worker is the port's job: set the port flushing first, then `stop()`.

use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::{debug, warn};

use super::port::Port;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Started,
    Paused,
}

struct Shared {
    state: TaskState,
    /// True while the worker is inside an iteration; `pause()` waits on it.
    iterating: bool,
}

type TaskFn = Box<dyn FnMut() + Send>;

struct TaskInner {
    port: Port,
    shared: Mutex<Shared>,
    cond: Condvar,
    /// Parked here between runs; the worker takes it while looping.
    func: Mutex<Option<TaskFn>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// A repeating worker bound to one port. Cheap to clone; clones control
/// the same task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new(port: &Port, f: impl FnMut() + Send + 'static) -> Self {
        Task {
            inner: Arc::new(TaskInner {
                port: port.clone(),
                shared: Mutex::new(Shared {
                    state: TaskState::Stopped,
                    iterating: false,
                }),
                cond: Condvar::new(),
                func: Mutex::new(Some(Box::new(f))),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> TaskState {
        self.inner.shared.lock().state
    }

    /// Start or resume the worker. Returns false when the thread could not
    /// be spawned.
    pub fn start(&self) -> bool {
        let spawn = {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                TaskState::Started => return true,
                TaskState::Paused => {
                    shared.state = TaskState::Started;
                    false
                }
                TaskState::Stopped => {
                    shared.state = TaskState::Started;
                    true
                }
            }
        };
        if !spawn {
            self.inner.cond.notify_all();
            debug!(port = %self.inner.port.name(), "task resumed");
            return true;
        }

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(format!("task-{}", self.inner.port.name()))
            .spawn(move || Self::run(&inner));
        match spawned {
            Ok(handle) => {
                *self.inner.thread.lock() = Some(handle);
                debug!(port = %self.inner.port.name(), "task started");
                true
            }
            Err(err) => {
                warn!(port = %self.inner.port.name(), %err, "task thread spawn failed");
                self.inner.shared.lock().state = TaskState::Stopped;
                false
            }
        }
    }

    /// Park the worker. Blocks until the iteration in progress finishes,
    /// so on return no task code is running. Must not be called from the
    /// task function itself.
    pub fn pause(&self) {
        let mut shared = self.inner.shared.lock();
        if shared.state == TaskState::Stopped {
            return;
        }
        shared.state = TaskState::Paused;
        self.inner.cond.notify_all();
        while shared.iterating {
            self.inner.cond.wait(&mut shared);
        }
        drop(shared);
        debug!(port = %self.inner.port.name(), "task paused");
    }

    /// Stop the worker and join its thread. The bound port should be set
    /// flushing first if an iteration may be blocked inside it. Must not
    /// be called from the task function itself.
    pub fn stop(&self) {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state == TaskState::Stopped && !shared.iterating {
                return;
            }
            shared.state = TaskState::Stopped;
        }
        self.inner.cond.notify_all();
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(port = %self.inner.port.name(), "task thread panicked");
            }
        }
        debug!(port = %self.inner.port.name(), "task stopped");
    }

    fn run(inner: &Arc<TaskInner>) {
        // The function lives here for the lifetime of the thread and is
        // parked again on exit so a later start() can reuse it.
        let Some(mut func) = inner.func.lock().take() else {
            return;
        };
        loop {
            {
                let mut shared = inner.shared.lock();
                loop {
                    match shared.state {
                        TaskState::Stopped => {
                            drop(shared);
                            *inner.func.lock() = Some(func);
                            return;
                        }
                        TaskState::Paused => {
                            inner.cond.wait(&mut shared);
                        }
                        TaskState::Started => {
                            shared.iterating = true;
                            break;
                        }
                    }
                }
            }
            {
                let _stream = inner.port.lock_stream();
                func();
            }
            {
                let mut shared = inner.shared.lock();
                shared.iterating = false;
            }
            inner.cond.notify_all();
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("port", &self.inner.port.name())
            .field("state", &self.state())
            .finish()
    }
}

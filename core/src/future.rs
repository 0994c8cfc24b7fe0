//! Single-assignment result cells for submitted tasks.
//!
//! A [`WorkFuture`] is handed out by `Master::submit` and resolved exactly
//! once by the master's receive loop. Any number of threads may block on
//! it; resolution wakes only the threads waiting on that future.

use crate::error::{Result, WorkManagerError};
use crate::protocol::{RemoteException, TaskId};
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

type DoneCallback = Box<dyn FnOnce(&WorkFuture) + Send>;

enum FutureState {
    Pending,
    /// `None` once the value has been discarded.
    Complete(Option<Value>),
    Error(RemoteException),
}

struct Slot {
    state: FutureState,
    callbacks: Vec<DoneCallback>,
}

struct Inner {
    task_id: TaskId,
    slot: Mutex<Slot>,
    ready: Condvar,
}

/// Handle to the eventual result of a task. Clones share the same cell.
#[derive(Clone)]
pub struct WorkFuture {
    inner: Arc<Inner>,
}

impl WorkFuture {
    /// Create a pending future with a fresh identifier.
    pub fn new() -> Self {
        Self::for_task(uuid::Uuid::new_v4())
    }

    /// Create a pending future bound to `task_id`.
    pub fn for_task(task_id: TaskId) -> Self {
        Self {
            inner: Arc::new(Inner {
                task_id,
                slot: Mutex::new(Slot {
                    state: FutureState::Pending,
                    callbacks: Vec::new(),
                }),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.inner.task_id
    }

    pub fn is_done(&self) -> bool {
        !matches!(self.inner.slot.lock().state, FutureState::Pending)
    }

    /// Block until the future is resolved, then return its value or the
    /// remote exception.
    ///
    /// With `discard` the value is moved out of the future; asking for it
    /// again fails with [`WorkManagerError::InvalidState`].
    pub fn get_result(&self, discard: bool) -> Result<Value> {
        let mut slot = self.inner.slot.lock();
        while matches!(slot.state, FutureState::Pending) {
            self.inner.ready.wait(&mut slot);
        }
        Self::take_outcome(&mut slot.state, &self.inner.task_id, discard)
    }

    /// Like [`get_result`](Self::get_result) but gives up after `timeout`.
    pub fn get_result_timeout(&self, timeout: Duration, discard: bool) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        while matches!(slot.state, FutureState::Pending) {
            if self.inner.ready.wait_until(&mut slot, deadline).timed_out()
                && matches!(slot.state, FutureState::Pending)
            {
                return Err(WorkManagerError::Timeout {
                    message: format!("task {} still pending", self.inner.task_id),
                });
            }
        }
        Self::take_outcome(&mut slot.state, &self.inner.task_id, discard)
    }

    /// Fetch the result and deserialize it into `T`.
    pub fn get_result_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self.get_result(false)?;
        serde_json::from_value(value).map_err(|e| {
            WorkManagerError::invalid_state(format!(
                "result of task {} has an unexpected shape: {}",
                self.inner.task_id, e
            ))
        })
    }

    fn take_outcome(state: &mut FutureState, task_id: &TaskId, discard: bool) -> Result<Value> {
        match state {
            FutureState::Pending => Err(WorkManagerError::invalid_state(format!(
                "task {} is still pending",
                task_id
            ))),
            FutureState::Complete(value) => {
                let value = if discard { value.take() } else { value.clone() };
                value.ok_or_else(|| {
                    WorkManagerError::invalid_state(format!(
                        "result of task {} was already discarded",
                        task_id
                    ))
                })
            }
            FutureState::Error(exception) => Err(WorkManagerError::Remote(exception.clone())),
        }
    }

    /// Block until resolved or until `timeout` elapses. Returns whether the
    /// future is resolved.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.slot.lock();
        while matches!(slot.state, FutureState::Pending) {
            if self.inner.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        !matches!(slot.state, FutureState::Pending)
    }

    /// The stored exception, if the future resolved with one.
    pub fn exception(&self) -> Option<RemoteException> {
        match &self.inner.slot.lock().state {
            FutureState::Error(exception) => Some(exception.clone()),
            _ => None,
        }
    }

    pub fn set_result(&self, value: Value) -> Result<()> {
        self.resolve(FutureState::Complete(Some(value)))
    }

    pub fn set_exception(&self, exception: RemoteException) -> Result<()> {
        self.resolve(FutureState::Error(exception))
    }

    fn resolve(&self, outcome: FutureState) -> Result<()> {
        let callbacks = {
            let mut slot = self.inner.slot.lock();
            if !matches!(slot.state, FutureState::Pending) {
                return Err(WorkManagerError::invalid_state(format!(
                    "task {} resolved twice",
                    self.inner.task_id
                )));
            }
            slot.state = outcome;
            std::mem::take(&mut slot.callbacks)
        };
        self.inner.ready.notify_all();
        for callback in callbacks {
            callback(self);
        }
        Ok(())
    }

    /// Run `callback` once the future is resolved; immediately if it
    /// already is. Callbacks run on the resolving thread.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&WorkFuture) + Send + 'static,
    {
        {
            let mut slot = self.inner.slot.lock();
            if matches!(slot.state, FutureState::Pending) {
                slot.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self);
    }
}

impl Default for WorkFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for WorkFuture {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WorkFuture {}

impl Hash for WorkFuture {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for WorkFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.slot.lock().state {
            FutureState::Pending => "pending",
            FutureState::Complete(_) => "complete",
            FutureState::Error(_) => "error",
        };
        f.debug_struct("WorkFuture")
            .field("task_id", &self.inner.task_id)
            .field("state", &state)
            .finish()
    }
}

/// Iterator over futures in the order they complete.
///
/// Produced by [`as_completed`]. It yields each distinct input future
/// exactly once and cannot be restarted.
pub struct AsCompleted {
    receiver: mpsc::Receiver<WorkFuture>,
    remaining: usize,
}

impl AsCompleted {
    /// Futures not yet yielded.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Iterator for AsCompleted {
    type Item = WorkFuture;

    fn next(&mut self) -> Option<WorkFuture> {
        if self.remaining == 0 {
            return None;
        }
        match self.receiver.recv() {
            Ok(future) => {
                self.remaining -= 1;
                Some(future)
            }
            // Every pending future was dropped without being resolved.
            Err(_) => {
                self.remaining = 0;
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

/// Yield `futures` as they complete, in completion order.
pub fn as_completed<I>(futures: I) -> AsCompleted
where
    I: IntoIterator<Item = WorkFuture>,
{
    let (sender, receiver) = mpsc::channel();
    let mut seen = HashSet::new();
    for future in futures {
        if !seen.insert(future.clone()) {
            continue;
        }
        let sender = sender.clone();
        future.add_done_callback(move |done| {
            let _ = sender.send(done.clone());
        });
    }
    AsCompleted {
        receiver,
        remaining: seen.len(),
    }
}

/// Block until at least one of `futures` is resolved and return every one
/// that is resolved at that point. An empty input returns immediately.
pub fn wait_any(futures: &[WorkFuture]) -> Vec<WorkFuture> {
    let done = |futures: &[WorkFuture]| -> Vec<WorkFuture> {
        futures.iter().filter(|f| f.is_done()).cloned().collect()
    };

    let resolved = done(futures);
    if !resolved.is_empty() || futures.is_empty() {
        return resolved;
    }

    let (sender, receiver) = mpsc::channel::<()>();
    for future in futures {
        let sender = sender.clone();
        future.add_done_callback(move |_| {
            let _ = sender.send(());
        });
    }
    drop(sender);
    let _ = receiver.recv();
    done(futures)
}

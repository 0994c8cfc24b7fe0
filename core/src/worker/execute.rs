//! Running handlers on the execution pool.

use crate::error::{Result, WorkManagerError};
use crate::protocol::{Outcome, RemoteException, Task, WorkerId};
use crate::task::TaskHandler;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

pub(crate) fn build_pool(n_workers: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(n_workers)
        .thread_name(|i| format!("weft-exec-{}", i))
        .build()
        .map_err(|e| WorkManagerError::startup_with_source("failed to build execution pool", e))
}

/// Call `handler` for `task`, turning errors and panics into exceptions.
pub(crate) fn run_task(handler: &dyn TaskHandler, task: &Task, worker_id: &WorkerId) -> Outcome {
    let frame = || format!("handler '{}' on worker {}", task.callable, worker_id);
    match panic::catch_unwind(AssertUnwindSafe(|| handler.call(&task.args, &task.kwargs))) {
        Ok(Ok(value)) => Outcome::Result(value),
        Ok(Err(error)) => Outcome::Exception(error.context(frame()).into_remote()),
        Err(payload) => Outcome::Exception(
            RemoteException::new("Panic", panic_message(payload.as_ref()))
                .with_traceback(vec![frame()]),
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

//! The master node.
//!
//! A master owns the task queue and three loops, each on its own OS thread
//! with its own single-threaded runtime and listener:
//!
//! - **dispatch** sends queued tasks to workers that have free credit,
//! - **receive** resolves futures from result frames and reaps silent workers,
//! - **announce** broadcasts periodic pings and the shutdown notice.
//!
//! The loops share the pending queue and the [`CoordinationTable`] through
//! short-held locks; everything else is message passing over the channels.

mod announce;
mod completion;
mod dispatch;
mod receive;
mod table;

pub use completion::SubmitAsCompleted;
pub use table::WorkerInfo;

use crate::config::{Endpoints, WorkManagerConfig};
use crate::error::{Result, WorkManagerError};
use crate::future::{self, AsCompleted, WorkFuture};
use crate::interrupt;
use crate::protocol::{Kwargs, MasterId, RemoteException, Task, TaskId};
use crate::report::ErrorReporter;
use crate::task::TaskRequest;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use table::CoordinationTable;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};
use weft_common::codec;
use weft_common::{Endpoint, EndpointKind, EndpointRegistry, Listener};

/// Lifecycle of a [`Master`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Created,
    Started,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MasterState::Created => "created",
            MasterState::Started => "started",
            MasterState::ShuttingDown => "shutting_down",
            MasterState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// State the loops share with the submitting side.
pub(crate) struct Shared {
    pub master_id: MasterId,
    pub config: WorkManagerConfig,
    /// Tasks waiting for a worker, oldest first.
    pending: Mutex<VecDeque<TaskId>>,
    /// Wakes the dispatch loop when work or capacity shows up.
    pub task_ready: Notify,
    pub table: Mutex<CoordinationTable>,
    pub reporter: ErrorReporter,
}

impl Shared {
    fn enqueue(&self, task_id: TaskId) {
        self.pending.lock().push_back(task_id);
        self.task_ready.notify_one();
    }

    /// Put tasks back at the head of the queue, keeping their order.
    pub fn requeue_front(&self, task_ids: Vec<TaskId>) {
        if task_ids.is_empty() {
            return;
        }
        {
            let mut pending = self.pending.lock();
            for task_id in task_ids.into_iter().rev() {
                pending.push_front(task_id);
            }
        }
        self.task_ready.notify_one();
    }

    pub fn next_pending(&self) -> Option<TaskId> {
        self.pending.lock().pop_front()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

struct LoopHandle {
    name: &'static str,
    thread: JoinHandle<()>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    endpoints: Endpoints,
}

struct MasterInner {
    shared: Arc<Shared>,
    registry: EndpointRegistry,
    /// Endpoints to bind; IPC endpoints allocated when none were configured.
    requested: Endpoints,
    state: Mutex<MasterState>,
    /// Serializes startup and shutdown.
    lifecycle: Mutex<()>,
    running: Mutex<Option<Running>>,
    loops: Mutex<Vec<LoopHandle>>,
    /// Flips to true when shutdown begins; watched by the interrupt handler.
    closed: watch::Sender<bool>,
    interrupt_installed: Arc<AtomicBool>,
}

impl Drop for MasterInner {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.send_replace(true);
        }
    }
}

/// Distributes tasks to workers and collects their results.
///
/// Cloning is cheap; clones control the same master.
#[derive(Clone)]
pub struct Master {
    inner: Arc<MasterInner>,
}

impl Master {
    /// Build a master. Endpoints missing from `config` are allocated as
    /// fresh IPC endpoints.
    pub fn new(config: WorkManagerConfig) -> Result<Self> {
        config.validate()?;
        let registry = EndpointRegistry::new();
        let pick = |endpoint: &Option<Endpoint>| {
            endpoint
                .clone()
                .unwrap_or_else(|| registry.make_endpoint(EndpointKind::Ipc))
        };
        let requested = Endpoints {
            task: pick(&config.task_endpoint),
            result: pick(&config.result_endpoint),
            announce: pick(&config.announce_endpoint),
        };
        let master_id = uuid::Uuid::new_v4();
        debug!("Created master {} ({})", master_id, requested);

        Ok(Self {
            inner: Arc::new(MasterInner {
                shared: Arc::new(Shared {
                    master_id,
                    config,
                    pending: Mutex::new(VecDeque::new()),
                    task_ready: Notify::new(),
                    table: Mutex::new(CoordinationTable::default()),
                    reporter: ErrorReporter::new(),
                }),
                registry,
                requested,
                state: Mutex::new(MasterState::Created),
                lifecycle: Mutex::new(()),
                running: Mutex::new(None),
                loops: Mutex::new(Vec::new()),
                closed: watch::Sender::new(false),
                interrupt_installed: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    pub fn master_id(&self) -> MasterId {
        self.inner.shared.master_id
    }

    pub fn config(&self) -> &WorkManagerConfig {
        &self.inner.shared.config
    }

    pub fn state(&self) -> MasterState {
        *self.inner.state.lock()
    }

    /// Bound endpoints while started, otherwise the endpoints that will be
    /// bound.
    pub fn endpoints(&self) -> Endpoints {
        match self.inner.running.lock().as_ref() {
            Some(running) => running.endpoints.clone(),
            None => self.inner.requested.clone(),
        }
    }

    /// Bind the three channels and start their loops.
    pub fn startup(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        let state = self.state();
        if matches!(state, MasterState::Started | MasterState::ShuttingDown) {
            return Err(WorkManagerError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::with_capacity(3);
        match self.start_loops(&shutdown_rx, &mut handles) {
            Ok(endpoints) => {
                info!("Master {} started ({})", self.master_id(), endpoints);
                *self.inner.running.lock() = Some(Running {
                    shutdown: shutdown_tx,
                    endpoints,
                });
                self.inner.loops.lock().extend(handles);
                self.inner.closed.send_replace(false);
                *self.inner.state.lock() = MasterState::Started;
                self.inner.shared.task_ready.notify_one();
                Ok(())
            }
            Err(e) => {
                shutdown_tx.send_replace(true);
                self.inner.loops.lock().extend(handles);
                self.join_loops();
                self.inner.registry.release();
                Err(e)
            }
        }
    }

    fn start_loops(
        &self,
        shutdown: &watch::Receiver<bool>,
        handles: &mut Vec<LoopHandle>,
    ) -> Result<Endpoints> {
        let requested = &self.inner.requested;

        let shared = self.inner.shared.clone();
        let rx = shutdown.clone();
        let task = self.spawn_loop("dispatch", &requested.task, move |listener| {
            dispatch::run(listener, shared, rx)
        })?;
        let task = self.push_handle(handles, task)?;

        let shared = self.inner.shared.clone();
        let rx = shutdown.clone();
        let result = self.spawn_loop("receive", &requested.result, move |listener| {
            receive::run(listener, shared, rx)
        })?;
        let result = self.push_handle(handles, result)?;

        let shared = self.inner.shared.clone();
        let rx = shutdown.clone();
        let announce = self.spawn_loop("announce", &requested.announce, move |listener| {
            announce::run(listener, shared, rx)
        })?;
        let announce = self.push_handle(handles, announce)?;

        Ok(Endpoints {
            task,
            result,
            announce,
        })
    }

    fn push_handle(
        &self,
        handles: &mut Vec<LoopHandle>,
        (handle, bound): (LoopHandle, Endpoint),
    ) -> Result<Endpoint> {
        handles.push(handle);
        // Fixed addresses were claimed before binding; ephemeral ones are
        // claimed once their port is known.
        if !EndpointRegistry::is_live(&bound) {
            self.inner.registry.claim(&bound)?;
        }
        Ok(bound)
    }

    /// Spawn one loop thread, returning once its listener is bound.
    fn spawn_loop<F, Fut>(
        &self,
        name: &'static str,
        endpoint: &Endpoint,
        body: F,
    ) -> Result<(LoopHandle, Endpoint)>
    where
        F: FnOnce(Listener) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        // Claim fixed addresses before binding so a second master in this
        // process cannot take over a live IPC socket file.
        if !endpoint.is_ephemeral() {
            self.inner.registry.claim(endpoint)?;
        }

        let endpoint = endpoint.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<Endpoint>>(1);
        let thread = thread::Builder::new()
            .name(format!("weft-{}", name))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(WorkManagerError::startup_with_source(
                            format!("failed to build {} runtime", name),
                            e,
                        )));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match Listener::bind(&endpoint).await {
                        Ok((listener, bound)) => {
                            if ready_tx.send(Ok(bound)).is_err() {
                                return;
                            }
                            listener
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.into()));
                            return;
                        }
                    };
                    body(listener).await;
                });
                debug!("{} loop thread exiting", name);
            })
            .map_err(|e| {
                WorkManagerError::startup_with_source(format!("failed to spawn {} loop", name), e)
            })?;

        match ready_rx.recv() {
            Ok(Ok(bound)) => Ok((LoopHandle { name, thread }, bound)),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(WorkManagerError::startup(format!(
                    "{} loop exited during startup",
                    name
                )))
            }
        }
    }

    /// Join loop threads, waiting at most `shutdown_grace` overall.
    fn join_loops(&self) {
        let deadline = Instant::now() + self.inner.shared.config.shutdown_grace;
        let handles = std::mem::take(&mut *self.inner.loops.lock());
        let mut stragglers = Vec::new();
        for handle in handles {
            while !handle.thread.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.thread.is_finished() {
                if handle.thread.join().is_err() {
                    warn!("{} loop panicked", handle.name);
                }
            } else {
                warn!("{} loop did not stop within the shutdown grace", handle.name);
                stragglers.push(handle);
            }
        }
        self.inner.loops.lock().extend(stragglers);
    }

    /// Names of loop threads that are still running.
    pub fn running_loops(&self) -> Vec<&'static str> {
        self.inner
            .loops
            .lock()
            .iter()
            .filter(|handle| !handle.thread.is_finished())
            .map(|handle| handle.name)
            .collect()
    }

    /// Submit `callable(*args, **kwargs)`; the returned future resolves when
    /// a worker reports back.
    pub fn submit<S: Into<String>>(
        &self,
        callable: S,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<WorkFuture> {
        let state = self.inner.state.lock();
        if matches!(*state, MasterState::ShuttingDown | MasterState::Stopped) {
            return Err(WorkManagerError::NotAccepting {
                state: state.to_string(),
            });
        }

        let shared = &self.inner.shared;
        let task = Task {
            master_id: shared.master_id,
            task_id: uuid::Uuid::new_v4(),
            callable: callable.into(),
            args,
            kwargs,
        };
        // A task too large for one frame is refused before it is queued.
        if let Err(e) = codec::encode_frame(&task) {
            return Err(WorkManagerError::invalid_task(format!(
                "{}() cannot be sent: {}",
                task.callable, e
            )));
        }
        let task_id = task.task_id;
        let future = WorkFuture::for_task(task_id);
        debug!("Submitting task {} ({})", task_id, task.callable);
        shared.table.lock().track(task, future.clone());
        shared.enqueue(task_id);
        Ok(future)
    }

    /// Submit a [`TaskRequest`], failing with `InvalidTask` if one of its
    /// arguments did not serialize.
    pub fn submit_request(&self, request: TaskRequest) -> Result<WorkFuture> {
        if let Some(error) = request.error() {
            return Err(WorkManagerError::invalid_task(error));
        }
        self.submit(request.callable, request.args, request.kwargs)
    }

    /// Submit requests pulled lazily from `requests`, keeping at most
    /// `queue_size` in flight, and yield futures as they complete.
    pub fn submit_as_completed<I>(
        &self,
        requests: I,
        queue_size: usize,
    ) -> SubmitAsCompleted<'_, I::IntoIter>
    where
        I: IntoIterator<Item = TaskRequest>,
    {
        SubmitAsCompleted::new(self, requests.into_iter(), queue_size)
    }

    pub fn as_completed<I>(&self, futures: I) -> AsCompleted
    where
        I: IntoIterator<Item = WorkFuture>,
    {
        future::as_completed(futures)
    }

    pub fn wait_any(&self, futures: &[WorkFuture]) -> Vec<WorkFuture> {
        future::wait_any(futures)
    }

    /// Stop accepting tasks, announce shutdown, and join the loops.
    ///
    /// Futures still unresolved afterwards fail with a `TaskAbandoned`
    /// exception. Safe to call any number of times.
    pub fn shutdown(&self) {
        let _lifecycle = self.inner.lifecycle.lock();
        {
            let mut state = self.inner.state.lock();
            match *state {
                MasterState::Started | MasterState::Created => {
                    *state = MasterState::ShuttingDown;
                }
                MasterState::ShuttingDown | MasterState::Stopped => return,
            }
        }
        self.inner.closed.send_replace(true);
        info!("Master {} shutting down", self.master_id());

        if let Some(running) = self.inner.running.lock().take() {
            running.shutdown.send_replace(true);
        }
        self.join_loops();

        let shared = &self.inner.shared;
        let abandoned = shared.table.lock().drain();
        shared.pending.lock().clear();
        if !abandoned.is_empty() {
            warn!("Abandoning {} unresolved tasks", abandoned.len());
        }
        for (task_id, future) in abandoned {
            if let Err(e) = future.set_exception(RemoteException::abandoned(&task_id)) {
                debug!("Task {} resolved during shutdown: {}", task_id, e);
            }
        }
        shared.table.lock().clear_workers();
        self.inner.registry.release();

        *self.inner.state.lock() = MasterState::Stopped;
        info!("Master {} stopped", self.master_id());
    }

    /// Make an interrupt (Ctrl-C) run [`shutdown`](Self::shutdown) once.
    ///
    /// A second interrupt exits the process with status 130. SIGINT stays
    /// captured for the life of the process, even after a shutdown that was
    /// not caused by an interrupt. Returns false if a handler is already
    /// installed.
    pub fn install_interrupt_handler(&self) -> Result<bool> {
        let weak = Arc::downgrade(&self.inner);
        interrupt::spawn_watcher(
            "weft-master-interrupt",
            self.inner.interrupt_installed.clone(),
            self.inner.closed.subscribe(),
            move || {
                if let Some(inner) = weak.upgrade() {
                    Master { inner }.shutdown();
                }
            },
        )
    }

    /// Delete the IPC socket files this master created or bound.
    pub fn remove_ipc_endpoints(&self) {
        self.inner.registry.remove_endpoints();
    }

    /// IPC socket files [`remove_ipc_endpoints`](Self::remove_ipc_endpoints)
    /// will delete.
    pub fn ipc_endpoints(&self) -> Vec<std::path::PathBuf> {
        self.inner.registry.ipc_paths()
    }

    /// Live workers, sorted by id.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.inner.shared.table.lock().workers(Instant::now())
    }

    /// Tasks submitted and not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.inner.shared.table.lock().in_flight_len()
    }

    /// Tasks waiting for a worker.
    pub fn pending(&self) -> usize {
        self.inner.shared.pending_len()
    }
}

impl fmt::Debug for Master {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Master")
            .field("master_id", &self.master_id())
            .field("state", &self.state())
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

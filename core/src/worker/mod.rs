//! The worker node.
//!
//! A worker connects to a master's three channels, runs tasks on a local
//! rayon pool, and reports each outcome on the result channel. Heartbeats
//! and announcement handling run on the worker loop independently of task
//! execution, so a long task never silences the worker.

mod execute;
mod session;

use crate::config::{Endpoints, WorkManagerConfig};
use crate::error::{Result, WorkManagerError};
use crate::interrupt;
use crate::protocol::WorkerId;
use crate::report::ErrorReporter;
use crate::task::HandlerRegistry;
use parking_lot::Mutex;
use session::{Channels, Session};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::{self, JoinHandle};
use tokio::sync::watch;
use tracing::{info, warn};

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// [`Worker::shutdown`] was called or an interrupt arrived.
    Shutdown,
    /// The master broadcast `shutdown`.
    Announced,
    /// The master closed the task channel.
    TaskChannelClosed,
    /// A channel to the master broke.
    MasterGone,
    /// The master stopped pinging.
    MasterSilent,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            WorkerExit::Shutdown => "shut down locally",
            WorkerExit::Announced => "master announced shutdown",
            WorkerExit::TaskChannelClosed => "task channel closed",
            WorkerExit::MasterGone => "master connection lost",
            WorkerExit::MasterSilent => "master stopped pinging",
        };
        f.write_str(reason)
    }
}

/// Executes tasks for a master.
pub struct Worker {
    worker_id: WorkerId,
    config: WorkManagerConfig,
    endpoints: Endpoints,
    handlers: HandlerRegistry,
    /// Flips to true to stop the loop; the loop sets it on exit too.
    shutdown: Arc<watch::Sender<bool>>,
    thread: Mutex<Option<JoinHandle<WorkerExit>>>,
    exit: Mutex<Option<WorkerExit>>,
    interrupt_installed: Arc<AtomicBool>,
}

impl Worker {
    /// Build a worker for the master at `endpoints`. Task callables are
    /// resolved through `handlers` only.
    pub fn new(config: WorkManagerConfig, endpoints: Endpoints, handlers: HandlerRegistry) -> Self {
        let worker_id = format!(
            "worker-{}-{}",
            std::process::id(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        Self {
            worker_id,
            config,
            endpoints,
            handlers,
            shutdown: Arc::new(watch::Sender::new(false)),
            thread: Mutex::new(None),
            exit: Mutex::new(None),
            interrupt_installed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_worker_id<S: Into<WorkerId>>(mut self, worker_id: S) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Connect to the master and start the worker loop.
    ///
    /// Connection failures after `connect_timeout` are returned here.
    pub fn startup(&self) -> Result<()> {
        let mut slot = self.thread.lock();
        if let Some(handle) = slot.take() {
            if !handle.is_finished() {
                *slot = Some(handle);
                return Err(WorkManagerError::AlreadyStarted);
            }
            if let Ok(exit) = handle.join() {
                *self.exit.lock() = Some(exit);
            }
        }
        self.config.validate()?;

        let pool = Arc::new(execute::build_pool(self.config.n_workers)?);
        let slots = u32::try_from(self.config.n_workers).map_err(|_| {
            WorkManagerError::configuration(format!(
                "n_workers {} does not fit a slot count",
                self.config.n_workers
            ))
        })?;
        self.shutdown.send_replace(false);
        *self.exit.lock() = None;

        let session = Session {
            worker_id: self.worker_id.clone(),
            config: self.config.clone(),
            handlers: self.handlers.clone(),
            pool,
            reporter: ErrorReporter::new(),
        };
        let endpoints = self.endpoints.clone();
        let shutdown = self.shutdown.clone();
        let shutdown_rx = self.shutdown.subscribe();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);

        let spawned = thread::Builder::new()
            .name("weft-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(WorkManagerError::startup_with_source(
                            "failed to build worker runtime",
                            e,
                        )));
                        return WorkerExit::Shutdown;
                    }
                };
                let exit = runtime.block_on(async {
                    let channels = match Channels::connect(
                        &endpoints,
                        &session.worker_id,
                        slots,
                        &session.config,
                    )
                    .await
                    {
                        Ok(channels) => channels,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return WorkerExit::MasterGone;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    session.run(channels, shutdown_rx).await
                });
                shutdown.send_replace(true);
                exit
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shutdown.send_replace(true);
                return Err(WorkManagerError::startup_with_source(
                    "failed to spawn worker thread",
                    e,
                ));
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    "Worker {} connected ({}) with {} slots",
                    self.worker_id, self.endpoints, slots
                );
                *slot = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(WorkManagerError::startup("worker thread exited during startup"))
            }
        }
    }

    /// True while the worker loop is running.
    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Block until the worker loop ends and return why it ended.
    pub fn wait(&self) -> Result<WorkerExit> {
        let handle = self.thread.lock().take();
        match handle {
            Some(handle) => {
                let exit = handle.join().map_err(|_| {
                    WorkManagerError::invalid_state(format!("worker {} panicked", self.worker_id))
                })?;
                *self.exit.lock() = Some(exit);
                Ok(exit)
            }
            None => (*self.exit.lock()).ok_or_else(|| {
                WorkManagerError::invalid_state(format!(
                    "worker {} was never started",
                    self.worker_id
                ))
            }),
        }
    }

    /// Stop the worker loop, draining in-flight tasks for up to
    /// `shutdown_grace`. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        if self.thread.lock().is_none() {
            return;
        }
        if let Err(e) = self.wait() {
            warn!("{}", e);
        }
    }

    /// Make an interrupt (Ctrl-C) stop this worker.
    ///
    /// Running tasks get `shutdown_grace` to finish; a second interrupt
    /// exits the process with status 130 instead. SIGINT stays captured for
    /// the life of the process. Returns false if a handler is already
    /// installed.
    pub fn install_interrupt_handler(&self) -> Result<bool> {
        let shutdown = Arc::downgrade(&self.shutdown);
        interrupt::spawn_watcher(
            "weft-worker-interrupt",
            self.interrupt_installed.clone(),
            self.shutdown.subscribe(),
            move || {
                if let Some(shutdown) = shutdown.upgrade() {
                    shutdown.send_replace(true);
                }
            },
        )
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.worker_id)
            .field("endpoints", &self.endpoints)
            .field("handlers", &self.handlers)
            .finish()
    }
}

//! The worker loop: one connection to each master channel.

use super::WorkerExit;
use super::execute;
use crate::client::{AnnouncementSubscriber, CreditSender, ResultSender, TaskInbox, TaskReceiver};
use crate::config::{Endpoints, WorkManagerConfig};
use crate::error::{Result, WorkManagerError};
use crate::protocol::{Announcement, Outcome, RemoteException, Task, TaskId, TaskResult, WorkerId};
use crate::report::{ErrorKey, ErrorReporter};
use crate::task::HandlerRegistry;
use rayon::ThreadPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval, timeout_at};
use tracing::{debug, error, info, warn};

/// Connections to the three master channels.
pub(crate) struct Channels {
    inbox: TaskInbox,
    credits: CreditSender,
    results: ResultSender,
    announcements: AnnouncementSubscriber,
}

impl Channels {
    /// Connect to every channel, the task channel last so no task arrives
    /// before results can be reported.
    pub async fn connect(
        endpoints: &Endpoints,
        worker_id: &WorkerId,
        slots: u32,
        config: &WorkManagerConfig,
    ) -> Result<Self> {
        let results = ResultSender::connect(&endpoints.result, config.connect_timeout).await?;
        let announcements =
            AnnouncementSubscriber::connect(&endpoints.announce, config.connect_timeout).await?;
        let receiver =
            TaskReceiver::connect(&endpoints.task, worker_id, slots, config.connect_timeout)
                .await?;
        let (inbox, credits) = receiver.into_split();
        Ok(Self {
            inbox,
            credits,
            results,
            announcements,
        })
    }
}

pub(crate) struct Session {
    pub worker_id: WorkerId,
    pub config: WorkManagerConfig,
    pub handlers: HandlerRegistry,
    pub pool: Arc<ThreadPool>,
    pub reporter: ErrorReporter,
}

impl Session {
    pub async fn run(&self, channels: Channels, mut shutdown: watch::Receiver<bool>) -> WorkerExit {
        let Channels {
            mut inbox,
            mut credits,
            mut results,
            mut announcements,
        } = channels;
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskResult>();
        let mut outstanding: HashSet<TaskId> = HashSet::new();

        let mut heartbeat = interval(self.config.worker_heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut silence_check = interval(self.config.heartbeat_interval);
        silence_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let master_timeout = self.config.master_timeout();
        let mut last_ping = Instant::now();

        info!("Worker {} running", self.worker_id);
        let exit = loop {
            tokio::select! {
                _ = shutdown.changed() => break WorkerExit::Shutdown,
                task = inbox.recv() => match task {
                    Ok(Some(task)) => self.start_task(task, &mut outstanding, &done_tx),
                    Ok(None) => break WorkerExit::TaskChannelClosed,
                    Err(e) => {
                        error!("Task channel failed: {}", e);
                        break WorkerExit::TaskChannelClosed;
                    }
                },
                Some(result) = done_rx.recv() => {
                    outstanding.remove(&result.task_id);
                    if let Err(e) = self.report(&mut results, result).await {
                        error!("Failed to report result: {}", e);
                        break WorkerExit::MasterGone;
                    }
                    if let Err(e) = credits.grant(1).await {
                        debug!("Could not return credit: {}", e);
                    }
                },
                announcement = announcements.recv() => match announcement {
                    Ok(Some(Announcement::Ping)) => last_ping = Instant::now(),
                    Ok(Some(Announcement::Shutdown)) => {
                        info!("Master announced shutdown");
                        break WorkerExit::Announced;
                    }
                    Ok(None) => break WorkerExit::MasterGone,
                    Err(e) => {
                        warn!("Announcement channel failed: {}", e);
                        break WorkerExit::MasterGone;
                    }
                },
                _ = heartbeat.tick() => {
                    let held: Vec<TaskId> = outstanding.iter().copied().collect();
                    if let Err(e) = results.heartbeat(&self.worker_id, held).await {
                        error!("Failed to send heartbeat: {}", e);
                        break WorkerExit::MasterGone;
                    }
                },
                _ = silence_check.tick() => {
                    let silence = last_ping.elapsed();
                    if silence > master_timeout {
                        warn!("No ping from master for {:.1?}, giving up", silence);
                        break WorkerExit::MasterSilent;
                    }
                },
            }
        };

        self.drain(&mut outstanding, &mut done_rx, &mut results).await;
        info!("Worker {} stopped ({:?})", self.worker_id, exit);
        exit
    }

    fn start_task(
        &self,
        task: Task,
        outstanding: &mut HashSet<TaskId>,
        done: &mpsc::UnboundedSender<TaskResult>,
    ) {
        outstanding.insert(task.task_id);
        let Some(handler) = self.handlers.get(&task.callable) else {
            self.reporter.report_once(
                ErrorKey::UnknownHandler(task.callable.clone()),
                &format!(
                    "Worker {} has no handler named '{}'",
                    self.worker_id, task.callable
                ),
            );
            let exception = RemoteException::new(
                "HandlerNotFound",
                format!("no handler named '{}'", task.callable),
            )
            .with_traceback(vec![format!("worker {}", self.worker_id)]);
            let _ = done.send(TaskResult {
                master_id: task.master_id,
                task_id: task.task_id,
                worker_id: self.worker_id.clone(),
                outcome: Outcome::Exception(exception),
            });
            return;
        };

        debug!("Running task {} ({})", task.task_id, task.callable);
        let done = done.clone();
        let worker_id = self.worker_id.clone();
        self.pool.spawn(move || {
            let outcome = execute::run_task(handler.as_ref(), &task, &worker_id);
            let _ = done.send(TaskResult {
                master_id: task.master_id,
                task_id: task.task_id,
                worker_id,
                outcome,
            });
        });
    }

    /// Send a result to the master. A result too large or otherwise unfit
    /// for the wire is replaced by an exception so the task still resolves.
    async fn report(&self, results: &mut ResultSender, result: TaskResult) -> Result<()> {
        let (master_id, task_id) = (result.master_id, result.task_id);
        let e = match results.send_result(result).await {
            Err(WorkManagerError::Transport(e)) if e.is_encoding() => e,
            other => return other,
        };
        warn!("Result of task {} cannot be sent: {}", task_id, e);
        let exception = RemoteException::new("SerializationError", e.to_string())
            .with_traceback(vec![format!("worker {}", self.worker_id)]);
        results
            .send_result(TaskResult {
                master_id,
                task_id,
                worker_id: self.worker_id.clone(),
                outcome: Outcome::Exception(exception),
            })
            .await
    }

    /// Wait up to `shutdown_grace` for running tasks and report them.
    async fn drain(
        &self,
        outstanding: &mut HashSet<TaskId>,
        done: &mut mpsc::UnboundedReceiver<TaskResult>,
        results: &mut ResultSender,
    ) {
        if outstanding.is_empty() {
            return;
        }
        info!("Draining {} in-flight tasks", outstanding.len());
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while !outstanding.is_empty() {
            let Ok(Some(result)) = timeout_at(deadline, done.recv()).await else {
                break;
            };
            outstanding.remove(&result.task_id);
            if let Err(e) = self.report(results, result).await {
                warn!("Could not report drained result: {}", e);
                break;
            }
        }
        if !outstanding.is_empty() {
            warn!(
                "Abandoning {} tasks still running after the shutdown grace",
                outstanding.len()
            );
        }
    }
}

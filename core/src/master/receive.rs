//! Receive loop: resolves futures from result frames and reaps workers
//! whose heartbeats stopped.

use super::Shared;
use super::table::Completion;
use crate::protocol::{Outcome, ResultChannelFrame, TaskResult};
use crate::report::ErrorKey;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, trace, warn};
use weft_common::codec::{self, read_message};
use weft_common::{FrameReader, FrameWriter, Listener};

pub(crate) async fn run(
    listener: Listener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let period = shared.config.worker_heartbeat_interval;
    let mut liveness = interval_at(tokio::time::Instant::now() + period, period);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Receive loop started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(connection) => {
                    let (reader, writer) = codec::split(connection);
                    tokio::spawn(forward_frames(reader, writer, frames_tx.clone()));
                }
                Err(e) => warn!("Failed to accept result channel peer: {}", e),
            },
            Some(frame) = frames_rx.recv() => handle_frame(&shared, frame),
            _ = liveness.tick() => check_liveness(&shared),
        }
    }

    // Results that already arrived still count.
    while let Ok(frame) = frames_rx.try_recv() {
        handle_frame(&shared, frame);
    }
    info!("Receive loop stopped");
}

async fn forward_frames(
    mut reader: FrameReader,
    // Held so the peer does not see the connection half-closed.
    _writer: FrameWriter,
    frames: mpsc::UnboundedSender<ResultChannelFrame>,
) {
    loop {
        match read_message::<_, ResultChannelFrame>(&mut reader).await {
            Ok(Some(frame)) => {
                if frames.send(frame).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("Dropping result channel peer: {}", e);
                return;
            }
        }
    }
}

fn handle_frame(shared: &Shared, frame: ResultChannelFrame) {
    match frame {
        ResultChannelFrame::Result(result) => handle_result(shared, result),
        ResultChannelFrame::Heartbeat {
            worker_id,
            outstanding,
        } => {
            trace!(
                "Heartbeat from {} holding {} tasks",
                worker_id,
                outstanding.len()
            );
            if shared.table.lock().heartbeat(&worker_id, Instant::now()) {
                info!("Worker {} is alive again", worker_id);
                shared.task_ready.notify_one();
            }
        }
    }
}

fn handle_result(shared: &Shared, result: TaskResult) {
    let TaskResult {
        master_id,
        task_id,
        worker_id,
        outcome,
    } = result;

    if master_id != shared.master_id {
        shared.reporter.report_once(
            ErrorKey::ForeignMaster(master_id.to_string()),
            &format!(
                "Discarding result for task {} addressed to master {}",
                task_id, master_id
            ),
        );
        return;
    }

    let completion = shared.table.lock().complete(&task_id, &worker_id, Instant::now());
    let future = match completion {
        Completion::Resolved(future) => future,
        Completion::Stale => {
            shared.reporter.report_once(
                ErrorKey::StaleResult(worker_id.clone()),
                &format!(
                    "Discarding stale result for task {} from worker {}",
                    task_id, worker_id
                ),
            );
            return;
        }
    };

    let resolved = match outcome {
        Outcome::Result(value) => {
            debug!("Task {} completed on worker {}", task_id, worker_id);
            future.set_result(value)
        }
        Outcome::Exception(exception) => {
            debug!(
                "Task {} raised on worker {}: {}",
                task_id, worker_id, exception
            );
            future.set_exception(exception)
        }
    };
    if let Err(e) = resolved {
        warn!("Task {} could not be resolved: {}", task_id, e);
    }
}

fn check_liveness(shared: &Shared) {
    let timeout = shared.config.worker_timeout();
    let reaped = shared.table.lock().reap(Instant::now(), timeout);
    for dead in reaped {
        warn!(
            "Worker {} silent for {:.1?}, presumed dead; requeueing {} tasks",
            dead.worker_id,
            dead.silence,
            dead.requeued.len()
        );
        shared.requeue_front(dead.requeued);
    }
}

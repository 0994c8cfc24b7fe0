//! Common test utilities and helpers for integration tests

#![allow(dead_code)] // Each test binary uses a different subset

use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use weft_core::client::{AnnouncementSubscriber, ResultSender, TaskReceiver};
use weft_core::protocol::{Announcement, Task, WorkerId};
use weft_core::{Endpoint, WorkManagerConfig};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime for driving raw clients from a synchronous test.
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("weft_core=debug,weft_common=debug")
        .with_test_writer()
        .try_init();
}

/// Fast master pings. Raw clients that never heartbeat stay alive for a few
/// seconds; see [`liveness_config`] for quick reaping.
pub fn fast_config() -> WorkManagerConfig {
    WorkManagerConfig::default()
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_worker_heartbeat_interval(Duration::from_secs(1))
        .with_timeout_factor(3)
        .with_shutdown_grace(Duration::from_secs(1))
        .with_connect_timeout(Duration::from_secs(2))
        .with_n_workers(2)
}

/// Config with IPC endpoints inside `dir`.
pub fn ipc_config(dir: &TempDir) -> WorkManagerConfig {
    fast_config()
        .with_task_endpoint(Endpoint::ipc(dir.path().join("task.ipc")))
        .with_result_endpoint(Endpoint::ipc(dir.path().join("result.ipc")))
        .with_announce_endpoint(Endpoint::ipc(dir.path().join("announce.ipc")))
}

/// Config with OS-assigned TCP ports on loopback.
pub fn tcp_config() -> WorkManagerConfig {
    fast_config()
        .with_task_endpoint(Endpoint::tcp("127.0.0.1", 0))
        .with_result_endpoint(Endpoint::tcp("127.0.0.1", 0))
        .with_announce_endpoint(Endpoint::tcp("127.0.0.1", 0))
}

/// TCP config that presumes a worker dead after 300ms of silence.
pub fn liveness_config() -> WorkManagerConfig {
    tcp_config().with_worker_heartbeat_interval(Duration::from_millis(100))
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn connect_puller(rt: &Runtime, endpoint: &Endpoint, worker_id: &str, slots: u32) -> TaskReceiver {
    rt.block_on(TaskReceiver::connect(
        endpoint,
        &worker_id.to_string(),
        slots,
        TIMEOUT,
    ))
    .unwrap()
}

pub fn connect_pusher(rt: &Runtime, endpoint: &Endpoint) -> ResultSender {
    rt.block_on(ResultSender::connect(endpoint, TIMEOUT)).unwrap()
}

pub fn subscribe(rt: &Runtime, endpoint: &Endpoint) -> AnnouncementSubscriber {
    rt.block_on(AnnouncementSubscriber::connect(endpoint, TIMEOUT)).unwrap()
}

pub fn recv_task(rt: &Runtime, puller: &mut TaskReceiver) -> Task {
    rt.block_on(async { tokio::time::timeout(TIMEOUT, puller.recv()).await })
        .expect("timed out waiting for a task")
        .unwrap()
        .expect("task channel closed")
}

/// Wait for a task while heartbeating as `worker_id`, like a live worker.
pub fn recv_task_heartbeating(
    rt: &Runtime,
    puller: &mut TaskReceiver,
    pusher: &mut ResultSender,
    worker_id: &str,
    period: Duration,
) -> Task {
    let worker_id: WorkerId = worker_id.to_string();
    rt.block_on(async {
        let mut ticker = tokio::time::interval(period);
        let wait = async {
            loop {
                tokio::select! {
                    task = puller.recv() => return task,
                    _ = ticker.tick() => {
                        pusher.heartbeat(&worker_id, Vec::new()).await.unwrap();
                    }
                }
            }
        };
        tokio::time::timeout(TIMEOUT, wait).await
    })
    .expect("timed out waiting for a task")
    .unwrap()
    .expect("task channel closed")
}

/// Read announcements until the channel closes or `timeout` elapses.
pub fn drain_announcements(
    rt: &Runtime,
    subscriber: &mut AnnouncementSubscriber,
    timeout: Duration,
) -> Vec<Announcement> {
    rt.block_on(async {
        let mut seen = Vec::new();
        let deadline = tokio::time::Instant::now() + timeout;
        while let Ok(Ok(Some(announcement))) =
            tokio::time::timeout_at(deadline, subscriber.recv()).await
        {
            seen.push(announcement);
        }
        seen
    })
}

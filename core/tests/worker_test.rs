//! End-to-end tests: a master and real workers in one process

mod common;

use common::*;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use weft_common::Listener;
use weft_common::codec::MAX_FRAME_SIZE;
use weft_core::{
    Endpoint, Endpoints, HandlerError, Kwargs, Master, Propagator, PropagatorHandler,
    TaskRequest, WorkManagerConfig, Worker, WorkerExit, builtin_handlers,
};

fn master_with_worker(config: WorkManagerConfig) -> (Master, Worker) {
    init_tracing();
    let master = Master::new(config.clone()).unwrap();
    master.startup().unwrap();
    let worker = Worker::new(config, master.endpoints(), builtin_handlers());
    worker.startup().unwrap();
    (master, worker)
}

#[test]
fn test_identity_round_trip_ipc() {
    let dir = TempDir::new().unwrap();
    let (master, worker) = master_with_worker(ipc_config(&dir));

    let future = master.submit("identity", vec![json!(1)], Kwargs::new()).unwrap();
    assert_eq!(future.get_result_timeout(TIMEOUT, false).unwrap(), json!(1));

    master.shutdown();
    worker.shutdown();
}

#[test]
fn test_identity_round_trip_tcp() {
    let (master, worker) = master_with_worker(tcp_config());

    let future = master
        .submit_request(TaskRequest::new("identity").kwarg("x", json!({"nested": [1, 2]})))
        .unwrap();
    assert_eq!(
        future.get_result_timeout(TIMEOUT, false).unwrap(),
        json!({"nested": [1, 2]})
    );
    assert_eq!(future.get_result(true).unwrap(), json!({"nested": [1, 2]}));

    master.shutdown();
    worker.shutdown();
}

#[test]
fn test_remote_exception_propagates() {
    let (master, worker) = master_with_worker(tcp_config());

    let future = master.submit("fail", vec![json!("boom")], Kwargs::new()).unwrap();
    let err = future.get_result_timeout(TIMEOUT, false).unwrap_err();

    let remote = err.remote().expect("remote failure");
    assert_eq!(remote.kind, "ValueError");
    assert!(remote.message.contains("boom"));
    assert!(remote.format_traceback().contains(worker.worker_id().as_str()));
    assert!(err.to_string().contains("boom"));

    master.shutdown();
    worker.shutdown();
}

#[test]
fn test_unknown_handler_reported() {
    let (master, worker) = master_with_worker(tcp_config());

    let first = master.submit("nope", Vec::new(), Kwargs::new()).unwrap();
    let second = master.submit("nope", Vec::new(), Kwargs::new()).unwrap();
    for future in [first, second] {
        let err = future.get_result_timeout(TIMEOUT, false).unwrap_err();
        let remote = err.remote().expect("remote failure");
        assert_eq!(remote.kind, "HandlerNotFound");
        assert!(remote.message.contains("nope"));
    }

    // The worker keeps serving after the failure.
    let future = master.submit("identity", vec![json!(2)], Kwargs::new()).unwrap();
    assert_eq!(future.get_result_timeout(TIMEOUT, false).unwrap(), json!(2));

    master.shutdown();
    worker.shutdown();
}

#[test]
fn test_as_completed_yields_in_completion_order() {
    let (master, worker) = master_with_worker(tcp_config().with_n_workers(3));

    let futures: Vec<_> = [(0.3, "slow"), (0.05, "fast"), (0.15, "mid")]
        .into_iter()
        .map(|(seconds, name)| {
            master
                .submit("sleep", vec![json!(seconds), json!(name)], Kwargs::new())
                .unwrap()
        })
        .collect();

    let order: Vec<Value> = master
        .as_completed(futures.clone())
        .map(|future| future.get_result(false).unwrap())
        .collect();
    assert_eq!(order, vec![json!("fast"), json!("mid"), json!("slow")]);
    assert!(futures.iter().all(|f| f.is_done()));

    master.shutdown();
    worker.shutdown();
}

#[test]
fn test_many_tasks_across_two_workers() {
    let config = tcp_config();
    let (master, first) = master_with_worker(config.clone());
    let second = Worker::new(config, master.endpoints(), builtin_handlers());
    second.startup().unwrap();

    let futures: Vec<_> = (0..50)
        .map(|i| master.submit("identity", vec![json!(i)], Kwargs::new()).unwrap())
        .collect();
    let results: HashSet<i64> = master
        .as_completed(futures)
        .map(|future| future.get_result_as::<i64>().unwrap())
        .collect();

    assert_eq!(results, (0..50).collect::<HashSet<_>>());
    assert_eq!(master.in_flight(), 0);

    master.shutdown();
    first.shutdown();
    second.shutdown();
}

#[test]
fn test_wait_any_returns_finished_futures() {
    let (master, worker) = master_with_worker(tcp_config());

    let quick = master.submit("identity", vec![json!(1)], Kwargs::new()).unwrap();
    let slow = master
        .submit("sleep", vec![json!(1.0)], Kwargs::new())
        .unwrap();

    let done = master.wait_any(&[quick.clone(), slow.clone()]);
    assert!(done.contains(&quick));
    assert!(!done.contains(&slow));

    master.shutdown();
    worker.shutdown();
}

#[test]
fn test_submit_as_completed_bounds_in_flight() {
    let (master, worker) = master_with_worker(tcp_config().with_n_workers(4));
    let pulled = Arc::new(AtomicUsize::new(0));

    let counter = pulled.clone();
    let requests = (0..8).map(move |i| {
        counter.fetch_add(1, Ordering::SeqCst);
        TaskRequest::new("sleep").arg(0.02).arg(i)
    });

    let mut stream = master.submit_as_completed(requests, 2);
    let mut yielded = 0;
    let mut values = HashSet::new();
    while let Some(next) = stream.next() {
        let future = next.unwrap();
        yielded += 1;
        assert!(stream.in_flight() <= 2);
        assert!(pulled.load(Ordering::SeqCst) <= yielded + 2);
        values.insert(future.get_result_as::<i64>().unwrap());
    }

    assert_eq!(yielded, 8);
    assert_eq!(values, (0..8).collect::<HashSet<_>>());

    master.shutdown();
    worker.shutdown();
}

#[test]
fn test_worker_exits_when_master_shuts_down() {
    let (master, worker) = master_with_worker(tcp_config());
    assert!(worker.is_running());

    master.shutdown();
    let exit = worker.wait().unwrap();

    assert!(
        matches!(exit, WorkerExit::Announced | WorkerExit::TaskChannelClosed),
        "unexpected exit: {:?}",
        exit
    );
    assert!(!worker.is_running());
    assert_eq!(worker.wait().unwrap(), exit);
}

#[test]
fn test_worker_exits_when_master_is_silent() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let rt = runtime();
    // Listeners that accept nothing and never ping.
    let endpoints = Endpoints {
        task: Endpoint::ipc(dir.path().join("task.ipc")),
        result: Endpoint::ipc(dir.path().join("result.ipc")),
        announce: Endpoint::ipc(dir.path().join("announce.ipc")),
    };
    let _listeners: Vec<Listener> = [&endpoints.task, &endpoints.result, &endpoints.announce]
        .into_iter()
        .map(|endpoint| rt.block_on(Listener::bind(endpoint)).unwrap().0)
        .collect();

    let worker = Worker::new(fast_config(), endpoints, builtin_handlers());
    worker.startup().unwrap();

    assert_eq!(worker.wait().unwrap(), WorkerExit::MasterSilent);
}

#[test]
fn test_worker_shutdown_is_idempotent() {
    let (master, worker) = master_with_worker(tcp_config());

    worker.shutdown();
    worker.shutdown();

    assert!(!worker.is_running());
    assert_eq!(worker.wait().unwrap(), WorkerExit::Shutdown);
    // A stopped worker can be started again.
    worker.startup().unwrap();
    assert!(worker.is_running());
    worker.shutdown();
    master.shutdown();
}

#[test]
fn test_worker_startup_fails_without_master() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let endpoints = Endpoints {
        task: Endpoint::ipc(dir.path().join("missing-task.ipc")),
        result: Endpoint::ipc(dir.path().join("missing-result.ipc")),
        announce: Endpoint::ipc(dir.path().join("missing-announce.ipc")),
    };
    let config = fast_config().with_connect_timeout(Duration::from_millis(200));
    let worker = Worker::new(config, endpoints, builtin_handlers());

    let start = Instant::now();
    assert!(worker.startup().is_err());
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(!worker.is_running());
    assert!(worker.wait().is_err());
}

#[test]
fn test_double_startup_rejected() {
    let (master, worker) = master_with_worker(tcp_config());

    assert!(worker.startup().is_err());
    assert!(worker.is_running());

    master.shutdown();
    worker.shutdown();
}

struct Reverse;

impl Propagator for Reverse {
    type Segment = i64;

    fn propagate(&self, mut segments: Vec<i64>) -> anyhow::Result<Vec<i64>> {
        anyhow::ensure!(!segments.is_empty(), "nothing to propagate");
        segments.reverse();
        Ok(segments)
    }
}

#[test]
fn test_propagator_handler_end_to_end() {
    init_tracing();
    let config = tcp_config();
    let master = Master::new(config.clone()).unwrap();
    master.startup().unwrap();
    let handlers = builtin_handlers()
        .with("propagate", PropagatorHandler::new(Reverse))
        .with("len", |args: &[Value], _: &Kwargs| {
            let list = args
                .first()
                .and_then(Value::as_array)
                .ok_or_else(|| HandlerError::type_error("len() expects a list"))?;
            Ok::<_, HandlerError>(json!(list.len()))
        });
    let worker = Worker::new(config, master.endpoints(), handlers);
    worker.startup().unwrap();

    let reversed = master
        .submit_request(TaskRequest::new("propagate").arg(vec![1, 2, 3]))
        .unwrap();
    let empty = master
        .submit_request(TaskRequest::new("propagate").kwarg("segments", Vec::<i64>::new()))
        .unwrap();
    let len = master
        .submit_request(TaskRequest::new("len").arg(vec!["a", "b"]))
        .unwrap();

    assert_eq!(reversed.get_result_as::<Vec<i64>>().unwrap(), vec![3, 2, 1]);
    let err = empty.get_result_timeout(TIMEOUT, false).unwrap_err();
    assert!(err.remote().unwrap().message.contains("nothing to propagate"));
    assert_eq!(len.get_result_timeout(TIMEOUT, false).unwrap(), json!(2));

    master.shutdown();
    worker.shutdown();
}

#[test]
fn test_oversized_result_reported_as_exception() {
    init_tracing();
    let config = tcp_config();
    let master = Master::new(config.clone()).unwrap();
    master.startup().unwrap();
    let handlers = builtin_handlers().with("huge", |_: &[Value], _: &Kwargs| {
        Ok::<_, HandlerError>(json!("x".repeat(MAX_FRAME_SIZE)))
    });
    let worker = Worker::new(config, master.endpoints(), handlers);
    worker.startup().unwrap();

    let future = master.submit("huge", Vec::new(), Kwargs::new()).unwrap();
    let err = future.get_result_timeout(TIMEOUT, false).unwrap_err();
    let remote = err.remote().expect("remote failure");
    assert_eq!(remote.kind, "SerializationError");
    assert!(remote.message.contains("exceeds"));
    assert!(remote.format_traceback().contains(worker.worker_id().as_str()));

    // The worker stays connected and its credit came back.
    assert!(worker.is_running());
    let future = master.submit("identity", vec![json!(1)], Kwargs::new()).unwrap();
    assert_eq!(future.get_result_timeout(TIMEOUT, false).unwrap(), json!(1));

    master.shutdown();
    worker.shutdown();
}

//! Bookkeeping shared by the master's loops: in-flight tasks, their
//! futures, and what each worker is holding.

use crate::future::WorkFuture;
use crate::protocol::{Task, TaskId, WorkerId};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// A submitted task that has not been resolved yet.
struct InFlight {
    task: Task,
    future: WorkFuture,
    /// Worker currently holding the task; `None` while queued.
    assigned: Option<WorkerId>,
}

/// Master-side view of one worker.
#[derive(Debug)]
struct WorkerRecord {
    last_heartbeat: Instant,
    outstanding: HashSet<TaskId>,
}

impl WorkerRecord {
    fn new(now: Instant) -> Self {
        Self {
            last_heartbeat: now,
            outstanding: HashSet::new(),
        }
    }
}

/// Snapshot of a live worker, as returned by `Master::workers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub heartbeat_age: Duration,
    pub outstanding: usize,
}

/// Tasks taken back from a worker presumed dead.
#[derive(Debug)]
pub(crate) struct Reaped {
    pub worker_id: WorkerId,
    pub silence: Duration,
    pub requeued: Vec<TaskId>,
}

/// How an incoming result relates to the task table.
pub(crate) enum Completion {
    /// First result for a tracked task; the future must be resolved.
    Resolved(WorkFuture),
    /// The task was already resolved or abandoned.
    Stale,
}

#[derive(Default)]
pub(crate) struct CoordinationTable {
    in_flight: HashMap<TaskId, InFlight>,
    workers: HashMap<WorkerId, WorkerRecord>,
    /// Workers presumed dead; skipped by dispatch until they heartbeat.
    dead: HashSet<WorkerId>,
}

impl CoordinationTable {
    pub fn track(&mut self, task: Task, future: WorkFuture) {
        self.in_flight.insert(
            task.task_id,
            InFlight {
                task,
                future,
                assigned: None,
            },
        );
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Record that `task_id` is about to be sent to `worker_id`.
    ///
    /// Returns the task to send, or `None` if it was resolved while queued.
    pub fn assign(&mut self, task_id: &TaskId, worker_id: &WorkerId) -> Option<Task> {
        let entry = self.in_flight.get_mut(task_id)?;
        entry.assigned = Some(worker_id.clone());
        let task = entry.task.clone();
        self.workers
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerRecord::new(Instant::now()))
            .outstanding
            .insert(*task_id);
        Some(task)
    }

    /// Undo [`assign`](Self::assign) after a failed send.
    pub fn unassign(&mut self, task_id: &TaskId, worker_id: &WorkerId) {
        if let Some(entry) = self.in_flight.get_mut(task_id)
            && entry.assigned.as_ref() == Some(worker_id)
        {
            entry.assigned = None;
        }
        if let Some(record) = self.workers.get_mut(worker_id) {
            record.outstanding.remove(task_id);
        }
    }

    /// Take the result for `task_id` out of the table.
    ///
    /// A result is proof of life, so it refreshes the sender's heartbeat
    /// unless that worker is presumed dead.
    pub fn complete(&mut self, task_id: &TaskId, worker_id: &WorkerId, now: Instant) -> Completion {
        if !self.dead.contains(worker_id)
            && let Some(record) = self.workers.get_mut(worker_id)
        {
            record.last_heartbeat = record.last_heartbeat.max(now);
        }
        let Some(entry) = self.in_flight.remove(task_id) else {
            if let Some(record) = self.workers.get_mut(worker_id) {
                record.outstanding.remove(task_id);
            }
            return Completion::Stale;
        };
        for holder in entry.assigned.iter().chain(std::iter::once(worker_id)) {
            if let Some(record) = self.workers.get_mut(holder) {
                record.outstanding.remove(task_id);
            }
        }
        Completion::Resolved(entry.future)
    }

    /// Drop a task that can never be sent, returning its future.
    pub fn reject(&mut self, task_id: &TaskId) -> Option<WorkFuture> {
        let entry = self.in_flight.remove(task_id)?;
        if let Some(holder) = &entry.assigned
            && let Some(record) = self.workers.get_mut(holder)
        {
            record.outstanding.remove(task_id);
        }
        Some(entry.future)
    }

    /// A worker introduced itself on the task channel.
    pub fn register_worker(&mut self, worker_id: &WorkerId, now: Instant) -> bool {
        let revived = self.dead.remove(worker_id);
        self.workers
            .entry(worker_id.clone())
            .or_insert_with(|| WorkerRecord::new(now))
            .last_heartbeat = now;
        revived
    }

    /// Refresh a worker's liveness. Returns true if it was presumed dead.
    pub fn heartbeat(&mut self, worker_id: &WorkerId, now: Instant) -> bool {
        self.register_worker(worker_id, now)
    }

    pub fn is_dead(&self, worker_id: &WorkerId) -> bool {
        self.dead.contains(worker_id)
    }

    /// Purge every worker silent for longer than `timeout`, returning the
    /// tasks it still held so they can be queued again.
    pub fn reap(&mut self, now: Instant, timeout: Duration) -> Vec<Reaped> {
        let expired: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.last_heartbeat) > timeout)
            .map(|(worker_id, _)| worker_id.clone())
            .collect();

        let mut reaped = Vec::with_capacity(expired.len());
        for worker_id in expired {
            let Some(record) = self.workers.remove(&worker_id) else {
                continue;
            };
            let mut requeued = Vec::new();
            for task_id in record.outstanding {
                if let Some(entry) = self.in_flight.get_mut(&task_id)
                    && entry.assigned.as_ref() == Some(&worker_id)
                {
                    entry.assigned = None;
                    requeued.push(task_id);
                }
            }
            self.dead.insert(worker_id.clone());
            reaped.push(Reaped {
                silence: now.saturating_duration_since(record.last_heartbeat),
                worker_id,
                requeued,
            });
        }
        reaped
    }

    /// Stop tracking a dead worker once its connection is gone. Returns
    /// false if the worker was not presumed dead.
    pub fn forget_dead(&mut self, worker_id: &WorkerId) -> bool {
        self.dead.remove(worker_id)
    }

    /// Remove every unresolved task, returning its future.
    pub fn drain(&mut self) -> Vec<(TaskId, WorkFuture)> {
        for record in self.workers.values_mut() {
            record.outstanding.clear();
        }
        self.in_flight
            .drain()
            .map(|(task_id, entry)| (task_id, entry.future))
            .collect()
    }

    /// Forget all workers, alive or dead.
    pub fn clear_workers(&mut self) {
        self.workers.clear();
        self.dead.clear();
    }

    pub fn workers(&self, now: Instant) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self
            .workers
            .iter()
            .map(|(worker_id, record)| WorkerInfo {
                worker_id: worker_id.clone(),
                heartbeat_age: now.saturating_duration_since(record.last_heartbeat),
                outstanding: record.outstanding.len(),
            })
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn task() -> Task {
        Task {
            master_id: Uuid::nil(),
            task_id: Uuid::new_v4(),
            callable: "identity".into(),
            args: vec![json!(1)],
            kwargs: Default::default(),
        }
    }

    fn tracked(table: &mut CoordinationTable) -> (TaskId, WorkFuture) {
        let task = task();
        let task_id = task.task_id;
        let future = WorkFuture::for_task(task_id);
        table.track(task, future.clone());
        (task_id, future)
    }

    #[test]
    fn test_complete_once_then_stale() {
        let mut table = CoordinationTable::default();
        let worker: WorkerId = "w-1".into();
        let (task_id, future) = tracked(&mut table);

        assert!(table.assign(&task_id, &worker).is_some());
        assert_eq!(table.workers(Instant::now())[0].outstanding, 1);

        let now = Instant::now();
        match table.complete(&task_id, &worker, now) {
            Completion::Resolved(f) => assert_eq!(f, future),
            Completion::Stale => panic!("first result must resolve"),
        }
        assert!(matches!(table.complete(&task_id, &worker, now), Completion::Stale));
        assert_eq!(table.workers(Instant::now())[0].outstanding, 0);
        assert!(table.assign(&task_id, &worker).is_none());
    }

    #[test]
    fn test_reap_requeues_outstanding_tasks() {
        let mut table = CoordinationTable::default();
        let start = Instant::now();
        let slow: WorkerId = "slow".into();
        let fresh: WorkerId = "fresh".into();
        table.register_worker(&slow, start);

        let (a, _) = tracked(&mut table);
        let (b, _) = tracked(&mut table);
        table.assign(&a, &slow);
        table.assign(&b, &slow);

        let later = start + Duration::from_secs(10);
        table.heartbeat(&fresh, later);
        let reaped = table.reap(later, Duration::from_secs(3));

        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].worker_id, slow);
        let mut requeued = reaped[0].requeued.clone();
        requeued.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(requeued, expected);
        assert!(table.is_dead(&slow));
        assert_eq!(table.workers(later).len(), 1);

        // A heartbeat brings the worker back.
        assert!(table.heartbeat(&slow, later));
        assert!(!table.is_dead(&slow));
    }

    #[test]
    fn test_reassigned_task_is_not_requeued_twice() {
        let mut table = CoordinationTable::default();
        let start = Instant::now();
        let first: WorkerId = "first".into();
        let second: WorkerId = "second".into();
        table.register_worker(&first, start);
        let (task_id, _) = tracked(&mut table);

        table.assign(&task_id, &first);
        table.unassign(&task_id, &first);
        table.assign(&task_id, &second);

        let reaped = table.reap(start + Duration::from_secs(10), Duration::from_secs(1));
        let first_reaped = reaped.iter().find(|r| r.worker_id == first).unwrap();
        assert!(first_reaped.requeued.is_empty());
    }

    #[test]
    fn test_result_counts_as_heartbeat() {
        let mut table = CoordinationTable::default();
        let start = Instant::now();
        let busy: WorkerId = "busy".into();
        table.register_worker(&busy, start);
        let (task_id, _) = tracked(&mut table);
        table.assign(&task_id, &busy);

        let later = start + Duration::from_secs(5);
        assert!(matches!(
            table.complete(&task_id, &busy, later),
            Completion::Resolved(_)
        ));
        assert!(table.reap(later, Duration::from_secs(3)).is_empty());
        assert_eq!(table.workers(later)[0].heartbeat_age, Duration::ZERO);
    }

    #[test]
    fn test_result_from_dead_worker_does_not_revive_it() {
        let mut table = CoordinationTable::default();
        let start = Instant::now();
        let gone: WorkerId = "gone".into();
        table.register_worker(&gone, start);
        let (task_id, _) = tracked(&mut table);
        table.assign(&task_id, &gone);

        let later = start + Duration::from_secs(10);
        assert_eq!(table.reap(later, Duration::from_secs(1)).len(), 1);
        assert!(matches!(
            table.complete(&task_id, &gone, later),
            Completion::Resolved(_)
        ));
        assert!(table.is_dead(&gone));
        assert!(table.workers(later).is_empty());
    }

    #[test]
    fn test_forget_dead_prunes_only_dead_workers() {
        let mut table = CoordinationTable::default();
        let start = Instant::now();
        let alive: WorkerId = "alive".into();
        let gone: WorkerId = "gone".into();
        table.register_worker(&alive, start + Duration::from_secs(10));
        table.register_worker(&gone, start);
        table.reap(start + Duration::from_secs(10), Duration::from_secs(1));

        assert!(!table.forget_dead(&alive));
        assert!(table.forget_dead(&gone));
        assert!(!table.is_dead(&gone));
        assert!(!table.forget_dead(&gone));
    }

    #[test]
    fn test_reject_releases_the_assignment() {
        let mut table = CoordinationTable::default();
        let worker: WorkerId = "w-1".into();
        let (task_id, future) = tracked(&mut table);
        table.assign(&task_id, &worker);

        assert_eq!(table.reject(&task_id), Some(future));
        assert_eq!(table.in_flight_len(), 0);
        assert_eq!(table.workers(Instant::now())[0].outstanding, 0);
        assert!(table.reject(&task_id).is_none());
    }

    #[test]
    fn test_drain_returns_unresolved_futures() {
        let mut table = CoordinationTable::default();
        let (_, f1) = tracked(&mut table);
        let (_, f2) = tracked(&mut table);

        let drained: HashSet<WorkFuture> = table.drain().into_iter().map(|(_, f)| f).collect();
        assert_eq!(drained, HashSet::from([f1, f2]));
        assert_eq!(table.in_flight_len(), 0);
    }
}

//! Bounded submission from a lazy request source.

use super::Master;
use crate::error::Result;
use crate::future::WorkFuture;
use crate::task::TaskRequest;
use std::collections::HashSet;
use std::sync::mpsc;

/// Iterator returned by [`Master::submit_as_completed`].
///
/// Keeps at most `queue_size` submitted futures unresolved. The request
/// source is only advanced when one of them completes, and futures are
/// yielded in completion order. A submission error is yielded once and
/// ends the iteration after the in-flight futures drain.
pub struct SubmitAsCompleted<'a, I> {
    master: &'a Master,
    requests: I,
    queue_size: usize,
    in_flight: HashSet<WorkFuture>,
    done_tx: mpsc::Sender<WorkFuture>,
    done_rx: mpsc::Receiver<WorkFuture>,
    exhausted: bool,
}

impl<'a, I> SubmitAsCompleted<'a, I>
where
    I: Iterator<Item = TaskRequest>,
{
    pub(super) fn new(master: &'a Master, requests: I, queue_size: usize) -> Self {
        let (done_tx, done_rx) = mpsc::channel();
        Self {
            master,
            requests,
            queue_size: queue_size.max(1),
            in_flight: HashSet::new(),
            done_tx,
            done_rx,
            exhausted: false,
        }
    }

    /// Futures submitted and not yet yielded.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn fill(&mut self) -> Result<()> {
        while !self.exhausted && self.in_flight.len() < self.queue_size {
            let Some(request) = self.requests.next() else {
                self.exhausted = true;
                break;
            };
            let future = self.master.submit_request(request).inspect_err(|_| {
                self.exhausted = true;
            })?;
            let done = self.done_tx.clone();
            future.add_done_callback(move |f| {
                let _ = done.send(f.clone());
            });
            self.in_flight.insert(future);
        }
        Ok(())
    }
}

impl<I> Iterator for SubmitAsCompleted<'_, I>
where
    I: Iterator<Item = TaskRequest>,
{
    type Item = Result<WorkFuture>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            return Some(Err(e));
        }
        while !self.in_flight.is_empty() {
            let future = self.done_rx.recv().ok()?;
            if self.in_flight.remove(&future) {
                return Some(Ok(future));
            }
        }
        None
    }
}

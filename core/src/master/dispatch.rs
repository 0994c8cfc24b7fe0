//! Dispatch loop: moves queued tasks to workers with free credit.

use super::Shared;
use crate::protocol::{RemoteException, TaskChannelFrame, WorkerId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use weft_common::codec::{self, read_message, write_message};
use weft_common::{FrameReader, FrameWriter, Listener};

type PeerId = u64;

enum PeerEvent {
    Frame(PeerId, TaskChannelFrame),
    Closed(PeerId),
}

/// A connection on the task channel.
struct Peer {
    /// Set by the peer's hello; no tasks are sent before it.
    worker_id: Option<WorkerId>,
    writer: FrameWriter,
    credits: u32,
    /// Reads the peer's frames; aborted when the peer is dropped so the
    /// connection closes on both halves.
    reader: JoinHandle<()>,
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub(crate) async fn run(
    listener: Listener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut peers: BTreeMap<PeerId, Peer> = BTreeMap::new();
    let mut next_peer: PeerId = 0;
    info!("Dispatch loop started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(connection) => {
                    let (reader, writer) = codec::split(connection);
                    let peer_id = next_peer;
                    next_peer += 1;
                    let reader = tokio::spawn(forward_frames(peer_id, reader, events_tx.clone()));
                    peers.insert(peer_id, Peer { worker_id: None, writer, credits: 0, reader });
                }
                Err(e) => warn!("Failed to accept task channel peer: {}", e),
            },
            Some(event) = events_rx.recv() => handle_event(&shared, &mut peers, event),
            _ = shared.task_ready.notified() => {}
        }
        pump(&shared, &mut peers).await;
    }

    info!(
        "Dispatch loop stopped with {} tasks still queued",
        shared.pending_len()
    );
}

async fn forward_frames(
    peer_id: PeerId,
    mut reader: FrameReader,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    loop {
        match read_message::<_, TaskChannelFrame>(&mut reader).await {
            Ok(Some(frame)) => {
                if events.send(PeerEvent::Frame(peer_id, frame)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping task channel peer {}: {}", peer_id, e);
                break;
            }
        }
    }
    let _ = events.send(PeerEvent::Closed(peer_id));
}

fn handle_event(shared: &Shared, peers: &mut BTreeMap<PeerId, Peer>, event: PeerEvent) {
    match event {
        PeerEvent::Frame(peer_id, TaskChannelFrame::Hello { worker_id, slots }) => {
            let Some(peer) = peers.get_mut(&peer_id) else {
                return;
            };
            if shared.table.lock().register_worker(&worker_id, Instant::now()) {
                info!("Worker {} reconnected", worker_id);
            }
            info!("Worker {} ready with {} slots", worker_id, slots);
            peer.worker_id = Some(worker_id);
            peer.credits = peer.credits.saturating_add(slots);
        }
        PeerEvent::Frame(peer_id, TaskChannelFrame::Credit { slots }) => {
            if let Some(peer) = peers.get_mut(&peer_id) {
                peer.credits = peer.credits.saturating_add(slots);
            }
        }
        PeerEvent::Closed(peer_id) => {
            if let Some(peer) = peers.remove(&peer_id) {
                match &peer.worker_id {
                    Some(worker_id) => {
                        info!("Worker {} left the task channel", worker_id);
                        if shared.table.lock().forget_dead(worker_id) {
                            debug!("Forgot dead worker {}", worker_id);
                        }
                    }
                    None => debug!("Task channel peer {} closed before hello", peer_id),
                }
            }
        }
    }
}

/// The peer with the most free credit among workers not presumed dead.
fn pick_peer(shared: &Shared, peers: &BTreeMap<PeerId, Peer>) -> Option<(PeerId, WorkerId)> {
    let table = shared.table.lock();
    peers
        .iter()
        .filter(|(_, peer)| peer.credits > 0)
        .filter_map(|(peer_id, peer)| {
            let worker_id = peer.worker_id.as_ref()?;
            (!table.is_dead(worker_id)).then_some((*peer_id, worker_id, peer.credits))
        })
        .max_by(|a, b| a.2.cmp(&b.2).then(b.0.cmp(&a.0)))
        .map(|(peer_id, worker_id, _)| (peer_id, worker_id.clone()))
}

/// Send queued tasks while some worker has free credit.
async fn pump(shared: &Shared, peers: &mut BTreeMap<PeerId, Peer>) {
    loop {
        let Some((peer_id, worker_id)) = pick_peer(shared, peers) else {
            return;
        };
        let Some(task_id) = shared.next_pending() else {
            return;
        };
        // Recorded before sending so a result can never beat the bookkeeping.
        let Some(task) = shared.table.lock().assign(&task_id, &worker_id) else {
            debug!("Skipping task {}, resolved while queued", task_id);
            continue;
        };
        let Some(peer) = peers.get_mut(&peer_id) else {
            return;
        };

        match write_message(&mut peer.writer, &task).await {
            Ok(()) => {
                peer.credits -= 1;
                debug!("Dispatched task {} to worker {}", task_id, worker_id);
            }
            Err(e) if e.is_encoding() => {
                // Nothing was written; the peer keeps its credit.
                warn!("Task {} cannot be encoded: {}", task_id, e);
                let rejected = shared.table.lock().reject(&task_id);
                if let Some(future) = rejected {
                    let exception = RemoteException::new("SerializationError", e.to_string())
                        .with_traceback(vec![format!("dispatch to worker {}", worker_id)]);
                    if let Err(e) = future.set_exception(exception) {
                        debug!("Task {} resolved concurrently: {}", task_id, e);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Failed to send task {} to worker {}: {}; requeueing",
                    task_id, worker_id, e
                );
                {
                    let mut table = shared.table.lock();
                    table.unassign(&task_id, &worker_id);
                    table.forget_dead(&worker_id);
                }
                shared.requeue_front(vec![task_id]);
                if peers.remove(&peer_id).is_some() {
                    info!("Dropped worker {} from the task channel", worker_id);
                }
            }
        }
    }
}

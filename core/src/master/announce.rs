//! Announce loop: periodic pings and the one shutdown notice.

use super::Shared;
use crate::protocol::Announcement;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, warn};
use weft_common::codec::{self, write_message};
use weft_common::{FrameWriter, Listener};

/// A subscriber that cannot take a frame within this long is dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// How long to keep accepting subscribers already queued at shutdown.
const LATE_ACCEPT_WINDOW: Duration = Duration::from_millis(10);

pub(crate) async fn run(
    listener: Listener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = shared.config.heartbeat_interval;
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut subscribers: Vec<FrameWriter> = Vec::new();
    info!("Announce loop started, pinging every {:?}", period);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(connection) => {
                    let (_, writer) = codec::split(connection);
                    subscribers.push(writer);
                    debug!("Announcement subscriber joined ({} total)", subscribers.len());
                }
                Err(e) => warn!("Failed to accept announcement subscriber: {}", e),
            },
            _ = ticker.tick() => broadcast(&mut subscribers, Announcement::Ping).await,
        }
    }

    while let Ok(Ok(connection)) = timeout(LATE_ACCEPT_WINDOW, listener.accept()).await {
        let (_, writer) = codec::split(connection);
        subscribers.push(writer);
    }
    broadcast(&mut subscribers, Announcement::Shutdown).await;
    info!("Announced shutdown to {} subscribers", subscribers.len());
}

/// Send `announcement` to every subscriber concurrently, dropping the ones
/// that fail or stall.
async fn broadcast(subscribers: &mut Vec<FrameWriter>, announcement: Announcement) {
    let sends = subscribers.drain(..).map(|mut writer| async move {
        match timeout(SEND_TIMEOUT, write_message(&mut writer, &announcement)).await {
            Ok(Ok(())) => Some(writer),
            Ok(Err(e)) => {
                debug!("Dropping announcement subscriber: {}", e);
                None
            }
            Err(_) => {
                debug!("Dropping announcement subscriber stalled on {}", announcement);
                None
            }
        }
    });
    let kept: Vec<FrameWriter> = join_all(sends).await.into_iter().flatten().collect();
    *subscribers = kept;
}

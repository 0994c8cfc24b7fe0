//! Ctrl-C handling for masters and workers.

use crate::error::{Result, WorkManagerError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Exit status after a second interrupt, as a shell reports death by SIGINT.
pub(crate) const FORCED_EXIT_CODE: i32 = 130;

/// Spawn a thread that runs `on_interrupt` once when SIGINT arrives.
///
/// After that first interrupt the thread stays for the life of the process
/// and a second SIGINT exits it with [`FORCED_EXIT_CODE`], even while the
/// node is still draining.
///
/// The thread exits without calling `on_interrupt` once `closed` turns true
/// or its sender goes away. SIGINT stays captured for the rest of the
/// process even then: the runtime cannot restore the default disposition,
/// so later interrupts are ignored until another watcher is installed.
///
/// `installed` guards against a second watcher for the same node;
/// `Ok(false)` means one is already running. The signal handler is
/// registered before this returns.
pub(crate) fn spawn_watcher<F>(
    name: &str,
    installed: Arc<AtomicBool>,
    mut closed: watch::Receiver<bool>,
    on_interrupt: F,
) -> Result<bool>
where
    F: FnOnce() + Send + 'static,
{
    if installed.swap(true, Ordering::SeqCst) {
        debug!("{} already installed", name);
        return Ok(false);
    }

    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
    let flag = installed.clone();
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let _ = ready_tx.send(Err(WorkManagerError::startup_with_source(
                    "failed to build interrupt runtime",
                    e,
                )));
                flag.store(false, Ordering::SeqCst);
                return;
            }
        };

        let interrupted = runtime.block_on(async move {
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(sigint) => sigint,
                Err(e) => {
                    let _ = ready_tx.send(Err(WorkManagerError::startup_with_source(
                        "failed to register SIGINT handler",
                        e,
                    )));
                    return false;
                }
            };
            let _ = ready_tx.send(Ok(()));
            let interrupted = tokio::select! {
                received = sigint.recv() => received.is_some(),
                _ = closed.wait_for(|closed| *closed) => false,
            };
            if !interrupted {
                return false;
            }

            info!("Interrupt received, shutting down (interrupt again to force)");
            let handled = tokio::task::spawn_blocking(on_interrupt);
            if sigint.recv().await.is_some() {
                warn!("Second interrupt received, exiting now");
                std::process::exit(FORCED_EXIT_CODE);
            }
            if let Err(e) = handled.await {
                warn!("Interrupt handler failed: {}", e);
            }
            true
        });

        if !interrupted {
            flag.store(false, Ordering::SeqCst);
        }
    });

    if let Err(e) = spawned {
        installed.store(false, Ordering::SeqCst);
        return Err(WorkManagerError::startup_with_source(
            "failed to spawn interrupt watcher",
            e,
        ));
    }

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(true),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(WorkManagerError::startup("interrupt watcher exited early")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_second_install_is_a_noop_until_closed() {
        let installed = Arc::new(AtomicBool::new(false));
        let (closed_tx, closed_rx) = watch::channel(false);

        assert!(spawn_watcher("test-interrupt", installed.clone(), closed_rx.clone(), || {}).unwrap());
        assert!(!spawn_watcher("test-interrupt", installed.clone(), closed_rx, || {}).unwrap());

        closed_tx.send_replace(true);
        let deadline = Instant::now() + Duration::from_secs(2);
        while installed.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!installed.load(Ordering::SeqCst));
    }
}

//! Stream sockets over TCP and Unix-domain transports.

use crate::endpoint::Endpoint;
use crate::error::{CommonError, Diagnose, Result};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

/// A connected byte stream on either transport.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// A bound listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Bind `endpoint` and return the listener together with the endpoint
    /// it actually bound (ephemeral TCP ports resolved).
    ///
    /// A stale IPC socket file left behind by a dead process is replaced.
    pub async fn bind(endpoint: &Endpoint) -> Result<(Self, Endpoint)> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(|e| {
                        CommonError::network_error_with_source(
                            format!("failed to bind {}", endpoint),
                            e,
                        )
                    })?;
                let local = listener.local_addr().map_err(|e| {
                    CommonError::io_error_with_source(
                        format!("failed to read local address of {}", endpoint),
                        e,
                    )
                })?;
                let bound = Endpoint::tcp(host.clone(), local.port());
                info!("Bound {}", bound);
                Ok((Listener::Tcp(listener), bound))
            }
            Endpoint::Ipc(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => debug!("Replaced stale ipc socket {}", path.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(CommonError::io_error_with_source(
                            format!("failed to clear stale socket {}", path.display()),
                            e,
                        ));
                    }
                }
                let listener = UnixListener::bind(path).map_err(|e| {
                    CommonError::network_error_with_source(
                        format!("failed to bind {}", endpoint),
                        e,
                    )
                })?;
                info!("Bound {}", endpoint);
                Ok((Listener::Unix(listener), endpoint.clone()))
            }
        }
    }

    /// Wait for the next peer.
    pub async fn accept(&self) -> Result<Connection> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await.map_err(|e| {
                    CommonError::network_error_with_source("failed to accept tcp peer", e)
                })?;
                stream.set_nodelay(true).map_err(|e| {
                    CommonError::io_error_with_source("failed to set TCP_NODELAY", e)
                })?;
                debug!("Accepted tcp peer {}", peer);
                Ok(Connection::Tcp(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await.map_err(|e| {
                    CommonError::network_error_with_source("failed to accept ipc peer", e)
                })?;
                debug!("Accepted ipc peer");
                Ok(Connection::Unix(stream))
            }
        }
    }
}

/// Open a connection to `endpoint` once.
pub async fn connect(endpoint: &Endpoint) -> Result<Connection> {
    let message = || format!("failed to connect to {}", endpoint);
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(|e| CommonError::from_connect_error(message(), e))?;
            stream
                .set_nodelay(true)
                .map_err(|e| CommonError::io_error_with_source("failed to set TCP_NODELAY", e))?;
            Ok(Connection::Tcp(stream))
        }
        Endpoint::Ipc(path) => {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|e| CommonError::from_connect_error(message(), e))?;
            Ok(Connection::Unix(stream))
        }
    }
}

/// Connect to `endpoint`, retrying while the peer is not yet listening.
///
/// Non-retryable errors are returned immediately; retryable ones are
/// retried until `timeout` elapses.
pub async fn connect_with_retry(endpoint: &Endpoint, timeout: Duration) -> Result<Connection> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match connect(endpoint).await {
            Ok(connection) => {
                if attempts > 1 {
                    info!("Connected to {} after {} attempts", endpoint, attempts);
                }
                return Ok(connection);
            }
            Err(e) if e.is_retryable() && Instant::now() < deadline => {
                let delay = Duration::from_millis(e.retry_delay_ms().unwrap_or(50));
                debug!("Connect to {} failed ({}), retrying", endpoint, e);
                sleep(delay).await;
            }
            Err(e) if e.is_retryable() => {
                return Err(CommonError::TimeoutError {
                    message: format!(
                        "gave up connecting to {} after {} attempts",
                        endpoint, attempts
                    ),
                    source: Some(e.into()),
                });
            }
            Err(e) => return Err(e),
        }
    }
}

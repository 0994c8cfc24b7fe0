//! Transport endpoint addressing and the per-node endpoint registry.
//!
//! Endpoints use ZeroMQ-style URLs: `ipc:///path/to/socket` for Unix-domain
//! sockets on the local machine and `tcp://host:port` for cross-host
//! traffic. A port of `0` asks the OS for an ephemeral port; the listener
//! reports the address it actually bound.

use crate::error::{CommonError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

const IPC_SCHEME: &str = "ipc://";
const TCP_SCHEME: &str = "tcp://";

/// Addresses currently bound by some node in this process.
static LIVE_ENDPOINTS: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Which transport an endpoint uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Unix-domain socket, reachable only on this machine.
    Ipc,
    /// TCP socket, reachable across hosts.
    Tcp,
}

/// A transport-addressable location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ipc(PathBuf),
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Build an IPC endpoint from a filesystem path.
    pub fn ipc<P: Into<PathBuf>>(path: P) -> Self {
        Endpoint::Ipc(path.into())
    }

    /// Build a TCP endpoint.
    pub fn tcp<S: Into<String>>(host: S, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::Ipc(_) => EndpointKind::Ipc,
            Endpoint::Tcp { .. } => EndpointKind::Tcp,
        }
    }

    /// The socket file backing an IPC endpoint.
    pub fn ipc_path(&self) -> Option<&Path> {
        match self {
            Endpoint::Ipc(path) => Some(path),
            Endpoint::Tcp { .. } => None,
        }
    }

    /// True for a TCP endpoint that still needs the OS to assign a port.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Endpoint::Tcp { port: 0, .. })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ipc(path) => write!(f, "{}{}", IPC_SCHEME, path.display()),
            Endpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "{}[{}]:{}", TCP_SCHEME, host, port)
            }
            Endpoint::Tcp { host, port } => write!(f, "{}{}:{}", TCP_SCHEME, host, port),
        }
    }
}

impl FromStr for Endpoint {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix(IPC_SCHEME) {
            if path.is_empty() {
                return Err(CommonError::endpoint_error(format!(
                    "ipc endpoint '{}' has no path",
                    s
                )));
            }
            return Ok(Endpoint::Ipc(PathBuf::from(path)));
        }

        if let Some(addr) = s.strip_prefix(TCP_SCHEME) {
            let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
                CommonError::endpoint_error(format!("tcp endpoint '{}' has no port", s))
            })?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            if host.is_empty() {
                return Err(CommonError::endpoint_error(format!(
                    "tcp endpoint '{}' has no host",
                    s
                )));
            }
            let port = port.parse::<u16>().map_err(|e| CommonError::EndpointError {
                message: format!("tcp endpoint '{}' has an invalid port", s),
                source: Some(e.into()),
            })?;
            return Ok(Endpoint::tcp(host, port));
        }

        Err(CommonError::endpoint_error(format!(
            "unsupported endpoint '{}' (expected ipc:// or tcp://)",
            s
        )))
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    /// Socket files created or bound through this registry.
    ipc_paths: BTreeSet<PathBuf>,
    /// Addresses this registry holds in the process-wide live set.
    claims: BTreeSet<String>,
}

/// Tracks the endpoints one node allocates and binds.
///
/// Cloning is cheap; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh endpoint of the given kind.
    ///
    /// IPC endpoints get a unique socket path in the system temp directory
    /// and are remembered for [`remove_endpoints`](Self::remove_endpoints).
    /// TCP endpoints come back as `tcp://127.0.0.1:0`; the bound port is
    /// known only after the listener is created.
    pub fn make_endpoint(&self, kind: EndpointKind) -> Endpoint {
        match kind {
            EndpointKind::Ipc => {
                let path = std::env::temp_dir()
                    .join(format!("weft-{}.ipc", uuid::Uuid::new_v4().simple()));
                self.state.lock().ipc_paths.insert(path.clone());
                debug!("Allocated ipc endpoint {}", path.display());
                Endpoint::Ipc(path)
            }
            EndpointKind::Tcp => Endpoint::tcp("127.0.0.1", 0),
        }
    }

    /// Record a bound endpoint as live in this process.
    ///
    /// Fails if another live node already holds the same address. Ephemeral
    /// TCP endpoints must be claimed with their resolved port.
    pub fn claim(&self, endpoint: &Endpoint) -> Result<()> {
        if endpoint.is_ephemeral() {
            return Err(CommonError::endpoint_error(format!(
                "cannot claim unresolved endpoint {}",
                endpoint
            )));
        }

        let address = endpoint.to_string();
        {
            let mut live = LIVE_ENDPOINTS.lock();
            if !live.insert(address.clone()) {
                return Err(CommonError::endpoint_error(format!(
                    "endpoint {} is already bound in this process",
                    address
                )));
            }
        }

        let mut state = self.state.lock();
        if let Some(path) = endpoint.ipc_path() {
            state.ipc_paths.insert(path.to_path_buf());
        }
        state.claims.insert(address);
        Ok(())
    }

    /// True if any node in this process currently holds `endpoint`.
    pub fn is_live(endpoint: &Endpoint) -> bool {
        LIVE_ENDPOINTS.lock().contains(&endpoint.to_string())
    }

    /// Drop every live claim held by this registry. Files are kept.
    pub fn release(&self) {
        let claims = std::mem::take(&mut self.state.lock().claims);
        if claims.is_empty() {
            return;
        }
        let mut live = LIVE_ENDPOINTS.lock();
        for address in claims {
            live.remove(&address);
        }
    }

    /// Delete every IPC socket file known to this registry and release its
    /// claims. Safe to call repeatedly.
    pub fn remove_endpoints(&self) {
        self.release();
        let paths = std::mem::take(&mut self.state.lock().ipc_paths);
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed ipc endpoint {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("ipc endpoint {} already gone", path.display());
                }
                Err(e) => warn!("Failed to remove ipc endpoint {}: {}", path.display(), e),
            }
        }
    }

    /// IPC socket paths this registry will delete on cleanup.
    pub fn ipc_paths(&self) -> Vec<PathBuf> {
        self.state.lock().ipc_paths.iter().cloned().collect()
    }
}

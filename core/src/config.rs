//! Configuration for masters and workers.

use crate::error::{Result, WorkManagerError};
use std::fmt;
use std::time::{Duration, Instant};
use weft_common::Endpoint;

pub const ENV_TASK_ENDPOINT: &str = "WEFT_TASK_ENDPOINT";
pub const ENV_RESULT_ENDPOINT: &str = "WEFT_RESULT_ENDPOINT";
pub const ENV_ANNOUNCE_ENDPOINT: &str = "WEFT_ANNOUNCE_ENDPOINT";
pub const ENV_HEARTBEAT_INTERVAL: &str = "WEFT_HEARTBEAT_INTERVAL";
pub const ENV_WORKER_HEARTBEAT_INTERVAL: &str = "WEFT_WORKER_HEARTBEAT_INTERVAL";
pub const ENV_TIMEOUT_FACTOR: &str = "WEFT_TIMEOUT_FACTOR";
pub const ENV_SHUTDOWN_GRACE: &str = "WEFT_SHUTDOWN_GRACE";
pub const ENV_CONNECT_TIMEOUT: &str = "WEFT_CONNECT_TIMEOUT";
pub const ENV_N_WORKERS: &str = "WEFT_N_WORKERS";

/// Work manager configuration shared by masters and workers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkManagerConfig {
    /// Task distribution endpoint. A master allocates an IPC endpoint when unset.
    pub task_endpoint: Option<Endpoint>,
    /// Result collection endpoint.
    pub result_endpoint: Option<Endpoint>,
    /// Announcement broadcast endpoint.
    pub announce_endpoint: Option<Endpoint>,
    /// Period of the master's `ping` announcements.
    pub heartbeat_interval: Duration,
    /// Period of worker heartbeats on the result channel.
    pub worker_heartbeat_interval: Duration,
    /// A peer silent for `timeout_factor` heartbeat periods is presumed dead.
    pub timeout_factor: u32,
    /// Bound on joining loop threads and draining in-flight tasks.
    pub shutdown_grace: Duration,
    /// How long a worker keeps retrying to reach the master.
    pub connect_timeout: Duration,
    /// Execution pool size of a worker.
    pub n_workers: usize,
}

impl Default for WorkManagerConfig {
    fn default() -> Self {
        Self {
            task_endpoint: None,
            result_endpoint: None,
            announce_endpoint: None,
            heartbeat_interval: Duration::from_secs(5),
            worker_heartbeat_interval: Duration::from_secs(5),
            timeout_factor: 3,
            shutdown_grace: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
            n_workers: num_cpus::get(),
        }
    }
}

impl WorkManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.task_endpoint = Some(endpoints.task);
        self.result_endpoint = Some(endpoints.result);
        self.announce_endpoint = Some(endpoints.announce);
        self
    }

    pub fn with_task_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.task_endpoint = Some(endpoint);
        self
    }

    pub fn with_result_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.result_endpoint = Some(endpoint);
        self
    }

    pub fn with_announce_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.announce_endpoint = Some(endpoint);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_worker_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.worker_heartbeat_interval = interval;
        self
    }

    pub fn with_timeout_factor(mut self, factor: u32) -> Self {
        self.timeout_factor = factor;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_n_workers(mut self, n_workers: usize) -> Self {
        self.n_workers = n_workers;
        self
    }

    /// Silence after which the master presumes a worker dead.
    ///
    /// Saturates for a config that [`validate`](Self::validate) rejects.
    pub fn worker_timeout(&self) -> Duration {
        self.worker_heartbeat_interval
            .checked_mul(self.timeout_factor)
            .unwrap_or(Duration::MAX)
    }

    /// Silence after which a worker presumes the master gone.
    pub fn master_timeout(&self) -> Duration {
        self.heartbeat_interval
            .checked_mul(self.timeout_factor)
            .unwrap_or(Duration::MAX)
    }

    /// All three endpoints, required by workers.
    pub fn endpoints(&self) -> Result<Endpoints> {
        let require = |endpoint: &Option<Endpoint>, name: &str| {
            endpoint.clone().ok_or_else(|| {
                WorkManagerError::configuration(format!("{} endpoint is not set", name))
            })
        };
        Ok(Endpoints {
            task: require(&self.task_endpoint, "task")?,
            result: require(&self.result_endpoint, "result")?,
            announce: require(&self.announce_endpoint, "announce")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(WorkManagerError::configuration(
                "heartbeat_interval must be positive",
            ));
        }
        if self.worker_heartbeat_interval.is_zero() {
            return Err(WorkManagerError::configuration(
                "worker_heartbeat_interval must be positive",
            ));
        }
        if self.timeout_factor == 0 {
            return Err(WorkManagerError::configuration(
                "timeout_factor must be at least 1",
            ));
        }
        if self.n_workers == 0 {
            return Err(WorkManagerError::configuration(
                "n_workers must be at least 1",
            ));
        }
        let timeouts = [
            (
                "worker_heartbeat_interval * timeout_factor",
                self.worker_heartbeat_interval.checked_mul(self.timeout_factor),
            ),
            (
                "heartbeat_interval * timeout_factor",
                self.heartbeat_interval.checked_mul(self.timeout_factor),
            ),
            ("shutdown_grace", Some(self.shutdown_grace)),
            ("connect_timeout", Some(self.connect_timeout)),
        ];
        // Every timeout is added to the clock somewhere.
        let now = Instant::now();
        for (name, timeout) in timeouts {
            if timeout.and_then(|t| now.checked_add(t)).is_none() {
                return Err(WorkManagerError::configuration(format!(
                    "{} is too large",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Defaults overridden by `WEFT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `WEFT_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_TASK_ENDPOINT) {
            config.task_endpoint = Some(parse_endpoint(ENV_TASK_ENDPOINT, &raw)?);
        }
        if let Some(raw) = lookup(ENV_RESULT_ENDPOINT) {
            config.result_endpoint = Some(parse_endpoint(ENV_RESULT_ENDPOINT, &raw)?);
        }
        if let Some(raw) = lookup(ENV_ANNOUNCE_ENDPOINT) {
            config.announce_endpoint = Some(parse_endpoint(ENV_ANNOUNCE_ENDPOINT, &raw)?);
        }
        if let Some(raw) = lookup(ENV_HEARTBEAT_INTERVAL) {
            config.heartbeat_interval = parse_seconds(ENV_HEARTBEAT_INTERVAL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_WORKER_HEARTBEAT_INTERVAL) {
            config.worker_heartbeat_interval =
                parse_seconds(ENV_WORKER_HEARTBEAT_INTERVAL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_FACTOR) {
            config.timeout_factor = parse_number(ENV_TIMEOUT_FACTOR, &raw)?;
        }
        if let Some(raw) = lookup(ENV_SHUTDOWN_GRACE) {
            config.shutdown_grace = parse_seconds(ENV_SHUTDOWN_GRACE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CONNECT_TIMEOUT) {
            config.connect_timeout = parse_seconds(ENV_CONNECT_TIMEOUT, &raw)?;
        }
        if let Some(raw) = lookup(ENV_N_WORKERS) {
            config.n_workers = parse_number(ENV_N_WORKERS, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }
}

fn parse_endpoint(key: &str, raw: &str) -> Result<Endpoint> {
    raw.trim()
        .parse()
        .map_err(|e| WorkManagerError::configuration(format!("{}: {}", key, e)))
}

/// Parse a duration given in (possibly fractional) seconds.
pub fn parse_seconds(key: &str, raw: &str) -> Result<Duration> {
    let secs: f64 = raw.trim().parse().map_err(|_| {
        WorkManagerError::configuration(format!("{}: '{}' is not a number of seconds", key, raw))
    })?;
    Duration::try_from_secs_f64(secs).map_err(|_| {
        WorkManagerError::configuration(format!("{}: '{}' is not a valid duration", key, raw))
    })
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        WorkManagerError::configuration(format!("{}: '{}' is not a valid number", key, raw))
    })
}

/// The three channel addresses of a master.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoints {
    pub task: Endpoint,
    pub result: Endpoint,
    pub announce: Endpoint,
}

impl fmt::Display for Endpoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task={} result={} announce={}",
            self.task, self.result, self.announce
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkManagerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.worker_timeout(), Duration::from_secs(15));
        assert!(config.n_workers >= 1);
        assert!(config.endpoints().is_err());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = WorkManagerConfig::from_lookup(lookup(&[
            (ENV_TASK_ENDPOINT, "tcp://127.0.0.1:23812"),
            (ENV_RESULT_ENDPOINT, "tcp://127.0.0.1:23813"),
            (ENV_ANNOUNCE_ENDPOINT, "tcp://127.0.0.1:23811"),
            (ENV_HEARTBEAT_INTERVAL, "0.1"),
            (ENV_TIMEOUT_FACTOR, "5"),
            (ENV_N_WORKERS, "2"),
        ]))
        .unwrap();

        assert_eq!(config.heartbeat_interval, Duration::from_millis(100));
        assert_eq!(config.master_timeout(), Duration::from_millis(500));
        assert_eq!(config.n_workers, 2);
        let endpoints = config.endpoints().unwrap();
        assert_eq!(endpoints.announce, Endpoint::tcp("127.0.0.1", 23811));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = WorkManagerConfig::from_lookup(lookup(&[(ENV_SHUTDOWN_GRACE, "soon")]))
            .unwrap_err();
        assert!(matches!(err, WorkManagerError::Configuration { .. }));
        assert!(err.to_string().contains(ENV_SHUTDOWN_GRACE));

        assert!(WorkManagerConfig::from_lookup(lookup(&[(ENV_HEARTBEAT_INTERVAL, "-1")])).is_err());
        assert!(WorkManagerConfig::from_lookup(lookup(&[(ENV_N_WORKERS, "0")])).is_err());
        assert!(WorkManagerConfig::from_lookup(lookup(&[(ENV_TASK_ENDPOINT, "udp://x:1")])).is_err());
    }

    #[test]
    fn test_overflowing_timeouts_rejected() {
        let err = WorkManagerConfig::from_lookup(lookup(&[
            (ENV_WORKER_HEARTBEAT_INTERVAL, "1e19"),
            (ENV_TIMEOUT_FACTOR, "3"),
        ]))
        .unwrap_err();
        assert!(matches!(err, WorkManagerError::Configuration { .. }));
        assert!(err.to_string().contains("worker_heartbeat_interval * timeout_factor"));

        let config = WorkManagerConfig::default()
            .with_heartbeat_interval(Duration::from_secs(u64::MAX / 2))
            .with_timeout_factor(u32::MAX);
        assert!(config.validate().is_err());
        assert_eq!(config.master_timeout(), Duration::MAX);

        let config = WorkManagerConfig::default().with_shutdown_grace(Duration::MAX);
        assert!(config.validate().unwrap_err().to_string().contains("shutdown_grace"));
    }
}

//! Node configuration.
//!
//! Read from `FRACTAL_*` environment variables with defaults suitable for a
//! single-machine cluster.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use fractal_protocol::{Job, NodeInfo};

use crate::error::{Error, Result};

/// `tracing` filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "fractal_node=info,fractal_logging=info";

/// Which service a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Bootstrap,
    Worker,
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bootstrap" => Ok(Role::Bootstrap),
            "worker" => Ok(Role::Worker),
            other => Err(Error::Config(format!("unknown role {other:?}"))),
        }
    }
}

/// Socket timeouts.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on connecting to a peer.
    pub dial_timeout: Duration,
    /// Accept deadline; re-armed whenever it expires.
    pub accept_timeout: Duration,
    /// Time allowed for a peer to deliver its envelope.
    pub read_timeout: Duration,
    /// Longest envelope line accepted, in bytes.
    pub max_frame: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(1),
            accept_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            max_frame: 8 * 1024 * 1024,
        }
    }
}

/// Join retry policy.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    /// How long one Hail attempt may take; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Hail attempts before giving up.
    pub attempts: u32,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(10)),
            attempts: 3,
        }
    }
}

/// Point generation pacing.
#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Points generated per tick.
    pub batch: usize,
    /// Tick interval.
    pub interval: Duration,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            batch: 64,
            interval: Duration::from_millis(200),
        }
    }
}

/// Configuration for a Fractal node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Role,

    /// Address this node binds and advertises (`host:port`)
    pub listen_addr: String,

    /// Bootstrap rendezvous address (`host:port`)
    pub bootstrap_addr: String,

    /// Directory for the activity and error logs; `None` disables file logs
    pub log_dir: Option<PathBuf>,

    /// JSON array of jobs known at startup
    pub jobs_file: Option<PathBuf>,

    pub transport: TransportConfig,
    pub join: JoinConfig,

    /// Remove a member from the table when it announces Quit
    pub evict_on_quit: bool,

    pub compute: ComputeConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            role: Role::Worker,
            listen_addr: "127.0.0.1:9000".to_string(),
            bootstrap_addr: "127.0.0.1:9000".to_string(),
            log_dir: Some(PathBuf::from("./fractal-logs")),
            jobs_file: None,
            transport: TransportConfig::default(),
            join: JoinConfig::default(),
            evict_on_quit: false,
            compute: ComputeConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let role = match get("FRACTAL_ROLE") {
            Some(v) => v.parse()?,
            None => defaults.role,
        };

        let listen_addr = get("FRACTAL_LISTEN_ADDR").unwrap_or(defaults.listen_addr);
        split_host_port(&listen_addr)?;

        let bootstrap_addr = get("FRACTAL_BOOTSTRAP_ADDR").unwrap_or(defaults.bootstrap_addr);
        split_host_port(&bootstrap_addr)?;

        let log_dir = match get("FRACTAL_LOG_DIR") {
            Some(v) if v == "-" => None,
            Some(v) => Some(PathBuf::from(v)),
            None => defaults.log_dir,
        };

        let millis = |key: &str, default: Duration| -> Result<Duration> {
            match get(key) {
                Some(v) => parse_positive::<u64>(key, &v).map(Duration::from_millis),
                None => Ok(default),
            }
        };

        let transport = TransportConfig {
            dial_timeout: millis("FRACTAL_DIAL_TIMEOUT_MS", defaults.transport.dial_timeout)?,
            accept_timeout: millis("FRACTAL_ACCEPT_TIMEOUT_MS", defaults.transport.accept_timeout)?,
            read_timeout: millis("FRACTAL_READ_TIMEOUT_MS", defaults.transport.read_timeout)?,
            max_frame: match get("FRACTAL_MAX_FRAME_BYTES") {
                Some(v) => parse_positive::<usize>("FRACTAL_MAX_FRAME_BYTES", &v)?,
                None => defaults.transport.max_frame,
            },
        };

        let join = JoinConfig {
            timeout: match get("FRACTAL_JOIN_TIMEOUT_MS") {
                Some(v) => match parse_number::<u64>("FRACTAL_JOIN_TIMEOUT_MS", &v)? {
                    0 => None,
                    ms => Some(Duration::from_millis(ms)),
                },
                None => defaults.join.timeout,
            },
            attempts: match get("FRACTAL_JOIN_ATTEMPTS") {
                Some(v) => parse_number::<u32>("FRACTAL_JOIN_ATTEMPTS", &v)?.max(1),
                None => defaults.join.attempts,
            },
        };

        let evict_on_quit = match get("FRACTAL_EVICT_ON_QUIT") {
            Some(v) => parse_bool("FRACTAL_EVICT_ON_QUIT", &v)?,
            None => defaults.evict_on_quit,
        };

        let compute = ComputeConfig {
            batch: match get("FRACTAL_COMPUTE_BATCH") {
                Some(v) => parse_positive::<usize>("FRACTAL_COMPUTE_BATCH", &v)?,
                None => defaults.compute.batch,
            },
            interval: millis("FRACTAL_COMPUTE_INTERVAL_MS", defaults.compute.interval)?,
        };

        Ok(Self {
            role,
            listen_addr,
            bootstrap_addr,
            log_dir,
            jobs_file: get("FRACTAL_JOBS_FILE").map(PathBuf::from),
            transport,
            join,
            evict_on_quit,
            compute,
        })
    }

    /// The bootstrap node as seen by workers.
    pub fn bootstrap_node(&self) -> Result<NodeInfo> {
        let (host, port) = split_host_port(&self.bootstrap_addr)?;
        Ok(NodeInfo::unassigned(host, port))
    }
}

/// Split `host:port`.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("address {addr:?} is missing a port")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("address {addr:?} has an invalid port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::Config(format!("address {addr:?} is missing a host")));
    }
    Ok((host.to_string(), port))
}

/// Read a JSON array of jobs.
pub fn load_jobs(path: &Path) -> Result<Vec<Job>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}={value:?} is not a valid number")))
}

/// Like [`parse_number`] but zero is refused.
fn parse_positive<T: FromStr + Default + PartialEq>(key: &str, value: &str) -> Result<T> {
    let n = parse_number::<T>(key, value)?;
    if n == T::default() {
        return Err(Error::Config(format!("{key} must be greater than zero")));
    }
    Ok(n)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key}={value:?} is not a boolean"))),
    }
}

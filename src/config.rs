//! Element configuration and protocol constants.
//!
//! Configuration is a constructor argument; nothing is read from files or
//! the environment. Exactly one server address form is used per element:
//! TCP host+port or a Unix domain socket.

use std::path::PathBuf;
use std::time::Duration;

use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};

/// Default TCP port of the backing server.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Default Unix socket path of the backing server.
pub const DEFAULT_REDIS_SOCKET: &str = "/shared/redis.sock";

/// Milliseconds a caller waits for an acknowledge by default.
pub const ACK_TIMEOUT_MS: u64 = 1000;

/// Default response deadline handed to callers in acknowledge frames.
pub const RESPONSE_TIMEOUT_MS: u64 = 1000;

/// Append-time length cap applied to every stream write.
pub const STREAM_LEN: usize = 1024;

/// Block duration for reads that should wait "forever".
pub const MAX_BLOCK_MS: u64 = 999_999_999_999;

/// Delay between health-probe rounds in `wait_for_elements_healthy`.
pub const HEALTHCHECK_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Number of pipeline handles in an element's pool.
pub const PIPELINE_POOL_SIZE: usize = 20;

/// Where the backing server lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

/// Per-element configuration.
#[derive(Debug, Clone)]
pub struct ElementConfig {
    pub addr: ServerAddr,
    pub pipeline_pool_size: usize,
}

impl ElementConfig {
    /// Connect over TCP.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ElementConfig {
            addr: ServerAddr::Tcp {
                host: host.into(),
                port,
            },
            pipeline_pool_size: PIPELINE_POOL_SIZE,
        }
    }

    /// Connect over a Unix domain socket.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        ElementConfig {
            addr: ServerAddr::Unix { path: path.into() },
            pipeline_pool_size: PIPELINE_POOL_SIZE,
        }
    }

    pub(crate) fn connection_info(&self) -> ConnectionInfo {
        let addr = match &self.addr {
            ServerAddr::Tcp { host, port } => ConnectionAddr::Tcp(host.clone(), *port),
            ServerAddr::Unix { path } => ConnectionAddr::Unix(path.clone()),
        };
        ConnectionInfo {
            addr,
            redis: RedisConnectionInfo::default(),
        }
    }
}

impl Default for ElementConfig {
    /// The default deployment shape: the shared Unix socket.
    fn default() -> Self {
        ElementConfig::unix(DEFAULT_REDIS_SOCKET)
    }
}

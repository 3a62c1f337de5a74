//! Server configuration
//!
//! Defaults, then `QUICKIM_*` environment overrides. Command-line flags are
//! applied on top by the binary.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;

/// Default TCP port
pub const DEFAULT_PORT: u16 = 9999;

/// Lowest bcrypt work factor the hasher accepts
pub const MIN_BCRYPT_COST: u32 = 4;

/// Highest bcrypt work factor the hasher accepts
pub const MAX_BCRYPT_COST: u32 = 31;

/// Frames a connection may have queued before it counts as stalled
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Largest accepted frame payload in bytes
    pub max_frame_size: usize,
    /// A read that waits longer than this closes the connection
    pub idle_timeout: Duration,
    /// Bound on flushing a closing connection's queued frames
    pub write_timeout: Duration,
    /// bcrypt work factor for new password hashes
    pub bcrypt_cost: u32,
    /// Per-connection send queue bound; a peer that lets it fill is dropped
    pub send_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_connections: 10000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            idle_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(5),
            bcrypt_cost: bcrypt::DEFAULT_COST,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup. Unparseable
    /// values are logged and the default is kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = parse_var(&lookup, "QUICKIM_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(max) = parse_var(&lookup, "QUICKIM_MAX_CONNECTIONS") {
            config.max_connections = max;
        }
        if let Some(size) = parse_var(&lookup, "QUICKIM_MAX_FRAME_SIZE") {
            config.max_frame_size = size;
        }
        if let Some(secs) = parse_var(&lookup, "QUICKIM_IDLE_TIMEOUT") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(cost) = parse_var::<u32, _>(&lookup, "QUICKIM_BCRYPT_COST") {
            if (MIN_BCRYPT_COST..=MAX_BCRYPT_COST).contains(&cost) {
                config.bcrypt_cost = cost;
            } else {
                warn!("Ignoring QUICKIM_BCRYPT_COST={}: out of range", cost);
            }
        }
        if let Some(capacity) = parse_var::<usize, _>(&lookup, "QUICKIM_SEND_QUEUE_CAPACITY") {
            if capacity > 0 {
                config.send_queue_capacity = capacity;
            } else {
                warn!("Ignoring QUICKIM_SEND_QUEUE_CAPACITY=0");
            }
        }

        config
    }

    /// Override the port while keeping the configured interface
    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: invalid value", key, raw);
            None
        }
    }
}

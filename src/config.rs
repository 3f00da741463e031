use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::ledger::genesis::NetworkKind;
use crate::network::peer::to_v6;

pub const DEFAULT_UDP_PORT: u16 = 7075;

/// Errors that can occur while building the node configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid peer address '{0}'")]
    InvalidPeer(String),

    #[error("Invalid HTTP bind address '{0}'")]
    InvalidHttpBind(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Block-lattice ledger node
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory holding the ledger database
    #[arg(long, default_value = "data/ledger")]
    pub data_dir: PathBuf,

    /// Run against the test network (cheap work, test genesis)
    #[arg(long)]
    pub testnet: bool,

    /// Peer to contact at startup, `host[:port]`; may be repeated
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// UDP port for the peer protocol
    #[arg(long, default_value_t = DEFAULT_UDP_PORT)]
    pub udp_port: u16,

    /// Address the HTTP API listens on
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub http_bind: String,

    /// Blocks buffered between the network and the ledger writer
    #[arg(long, default_value_t = 1024)]
    pub channel_capacity: usize,

    /// Blocks held while waiting for a missing parent
    #[arg(long, default_value_t = 4096)]
    pub max_orphans: usize,

    /// Seconds between keepalive rounds
    #[arg(long, default_value_t = 20)]
    pub keepalive_interval: u64,
}

/// Validated node settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub network: NetworkKind,
    pub data_dir: PathBuf,
    pub peers: Vec<SocketAddrV6>,
    pub udp_bind: SocketAddr,
    pub http_bind: SocketAddr,
    pub channel_capacity: usize,
    pub max_orphans: usize,
    pub keepalive_interval: Duration,
}

impl NodeConfig {
    /// Builds the configuration from parsed command-line arguments
    ///
    /// The database lives in a per-network subdirectory of `data_dir` so the
    /// live and test ledgers never share a store.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        if args.channel_capacity == 0 {
            return Err(ConfigError::Zero("channel-capacity"));
        }
        if args.keepalive_interval == 0 {
            return Err(ConfigError::Zero("keepalive-interval"));
        }
        if args.max_orphans == 0 {
            return Err(ConfigError::Zero("max-orphans"));
        }

        let network = if args.testnet {
            NetworkKind::Test
        } else {
            NetworkKind::Live
        };

        let peers = args
            .peers
            .iter()
            .map(|peer| parse_peer(peer))
            .collect::<Result<Vec<_>, _>>()?;

        let http_bind = args
            .http_bind
            .parse()
            .map_err(|_| ConfigError::InvalidHttpBind(args.http_bind.clone()))?;

        Ok(NodeConfig {
            network,
            data_dir: args.data_dir.join(network.to_string()),
            peers,
            udp_bind: SocketAddr::from((Ipv6Addr::UNSPECIFIED, args.udp_port)),
            http_bind,
            channel_capacity: args.channel_capacity,
            max_orphans: args.max_orphans,
            keepalive_interval: Duration::from_secs(args.keepalive_interval),
        })
    }

    /// The node's own loopback endpoint, never recorded as a peer
    pub fn local_endpoint(&self) -> SocketAddrV6 {
        SocketAddrV6::new(Ipv6Addr::LOCALHOST, self.udp_bind.port(), 0, 0)
    }
}

/// Parses `ip`, `ip:port`, `[v6]:port` or `host[:port]`, defaulting the port
pub fn parse_peer(peer: &str) -> Result<SocketAddrV6, ConfigError> {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(to_v6(addr));
    }
    if let Ok(ip) = peer.parse::<IpAddr>() {
        return Ok(to_v6(SocketAddr::new(ip, DEFAULT_UDP_PORT)));
    }

    let resolved = if peer.contains(':') {
        peer.to_socket_addrs()
    } else {
        (peer, DEFAULT_UDP_PORT).to_socket_addrs()
    };

    resolved
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(to_v6)
        .ok_or_else(|| ConfigError::InvalidPeer(peer.to_string()))
}

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FleetError, Result};

/// Address of a daemon's control channel.
///
/// Tor exposes its control interface either as a unix socket
/// (`ControlSocket`) or a loopback TCP port (`ControlPort`); both are
/// line-oriented and speak the same protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAddr {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for ControlAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            ControlAddr::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

/// A SOCKS5 endpoint (data plane of one daemon).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocksEndpoint {
    pub host: String,
    pub port: u16,
}

impl SocksEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string, handling bracketed IPv6 like `[::1]:9050`.
    pub fn parse(addr: &str) -> Result<Self> {
        let (host, port) = parse_host_port(addr)?;
        Ok(Self { host, port })
    }
}

impl fmt::Display for SocksEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Listen address for an HTTP bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAddr {
    /// Bind an ephemeral loopback port.
    Auto,
    /// Bind exactly this address.
    Explicit(SocketAddr),
}

impl BridgeAddr {
    /// Parse a bridge spec: `auto`/`random`, a bare port, or `ip:port`.
    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        match spec {
            "auto" | "random" => Ok(BridgeAddr::Auto),
            _ => {
                if let Ok(port) = spec.parse::<u16>() {
                    return Ok(BridgeAddr::Explicit(SocketAddr::from(([127, 0, 0, 1], port))));
                }
                spec.parse::<SocketAddr>()
                    .map(BridgeAddr::Explicit)
                    .map_err(|e| {
                        FleetError::InvalidAddress(format!("bridge address '{}': {}", spec, e))
                    })
            }
        }
    }
}

/// Timing parameters for one supervised instance.
#[derive(Debug, Clone)]
pub struct InstanceTiming {
    /// Pause between control connect / readiness retries
    pub retry_pause: Duration,
    /// Pause of the supervisor idle loop (shutdown-check interval)
    pub idle_pause: Duration,
    /// Per-read timeout on the control channel
    pub recv_timeout: Duration,
    /// How long to wait for graceful daemon termination before killing
    pub shutdown_grace: Duration,
}

impl Default for InstanceTiming {
    fn default() -> Self {
        Self {
            retry_pause: Duration::from_millis(500),
            idle_pause: Duration::from_secs(1),
            recv_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Immutable per-instance configuration.
///
/// Produced by the bootstrap layer ([`crate::bootstrap`]) and consumed
/// read-only by the supervisor, the control client and the bridges.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Unique instance name
    pub name: String,
    /// Control channel address
    pub control_addr: ControlAddr,
    /// Rendered daemon configuration file
    pub torrc: PathBuf,
    /// Daemon data directory
    pub data_dir: PathBuf,
    /// Daemon notice log
    pub log_file: PathBuf,
    /// Control-channel audit log
    pub control_log_file: PathBuf,
    /// Loopback SOCKS port, if the daemon listens locally
    pub local_socks: Option<u16>,
    /// Outbound SOCKS address, if the daemon listens on another interface
    pub out_socks: Option<SocksEndpoint>,
    /// Optional per-instance HTTP bridge
    pub bridge: Option<BridgeAddr>,
    /// Forward daemon log lines to the console
    pub print_log: bool,
    /// Daemon binary name or path
    pub daemon_binary: String,
    /// Timing parameters
    pub timing: InstanceTiming,
}

impl InstanceConfig {
    /// Local SOCKS endpoint, when the daemon listens on loopback.
    pub fn local_socks_endpoint(&self) -> Option<SocksEndpoint> {
        self.local_socks.map(|port| SocksEndpoint::new("127.0.0.1", port))
    }

    /// Endpoint the bridges and probe should dial: the local SOCKS port
    /// when present, otherwise the outbound address.
    pub fn socks_endpoint(&self) -> Option<SocksEndpoint> {
        self.local_socks_endpoint().or_else(|| self.out_socks.clone())
    }
}

/// Settings for the torfleet binary, loaded from environment variables
#[derive(Debug, Clone)]
pub struct FarmSettings {
    /// Root directory for instance state (default: ./onions)
    pub root_dir: PathBuf,
    /// Number of instances to plant
    pub count: usize,
    /// First local SOCKS port; subsequent instances step from it
    pub socks_start: u16,
    /// Optional fleet-wide rotating bridge address
    pub bridge: Option<BridgeAddr>,
    /// Forward daemon logs to the console
    pub print_log: bool,
    /// Daemon binary name or path
    pub daemon_binary: String,
}

impl FarmSettings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self> {
        let bridge = match env::var("TORFLEET_BRIDGE") {
            Ok(spec) if !spec.trim().is_empty() => Some(BridgeAddr::parse(&spec)?),
            _ => None,
        };

        Ok(Self {
            root_dir: PathBuf::from(get_env_or("TORFLEET_DIR", "onions")),
            count: get_env_or("TORFLEET_COUNT", "3").parse().map_err(|_| {
                FleetError::InvalidConfig("TORFLEET_COUNT must be a number".into())
            })?,
            socks_start: get_env_or("TORFLEET_SOCKS_START", "9060")
                .parse()
                .map_err(|_| {
                    FleetError::InvalidConfig(
                        "TORFLEET_SOCKS_START must be a valid port number".into(),
                    )
                })?,
            bridge,
            print_log: get_env_or("TORFLEET_PRINT_LOG", "false")
                .parse()
                .unwrap_or(false),
            daemon_binary: get_env_or("TORFLEET_TOR_BINARY", "tor"),
        })
    }
}

/// Parse `host:port`, using URL parsing to handle bracketed IPv6.
pub(crate) fn parse_host_port(addr: &str) -> Result<(String, u16)> {
    let url = url::Url::parse(&format!("http://{}", addr))
        .map_err(|e| FleetError::InvalidAddress(format!("invalid address '{}': {}", addr, e)))?;

    let host = url.host_str().ok_or_else(|| {
        FleetError::InvalidAddress(format!("invalid address '{}': missing host", addr))
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let port = url.port().ok_or_else(|| {
        FleetError::InvalidAddress(format!("invalid address '{}': missing port", addr))
    })?;

    Ok((host.to_string(), port))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks_endpoint_parse() {
        let ep = SocksEndpoint::parse("127.0.0.1:9050").unwrap();
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 9050);
        assert_eq!(ep.to_string(), "127.0.0.1:9050");
    }

    #[test]
    fn test_socks_endpoint_parse_ipv6() {
        let ep = SocksEndpoint::parse("[::1]:9050").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, 9050);
        assert_eq!(ep.to_string(), "[::1]:9050");
    }

    #[test]
    fn test_socks_endpoint_parse_rejects_missing_port() {
        let err = SocksEndpoint::parse("example.com").unwrap_err();
        assert!(matches!(err, FleetError::InvalidAddress(_)));
    }

    #[test]
    fn test_bridge_addr_parse() {
        assert_eq!(BridgeAddr::parse("auto").unwrap(), BridgeAddr::Auto);
        assert_eq!(BridgeAddr::parse("random").unwrap(), BridgeAddr::Auto);
        assert_eq!(
            BridgeAddr::parse("8118").unwrap(),
            BridgeAddr::Explicit(SocketAddr::from(([127, 0, 0, 1], 8118)))
        );
        assert_eq!(
            BridgeAddr::parse("0.0.0.0:8118").unwrap(),
            BridgeAddr::Explicit("0.0.0.0:8118".parse().unwrap())
        );
        assert!(BridgeAddr::parse("not an addr").is_err());
    }

    #[test]
    fn test_socks_endpoint_preference() {
        let mut config = InstanceConfig {
            name: "tor1".to_string(),
            control_addr: ControlAddr::Unix(PathBuf::from("/tmp/ctrl")),
            torrc: PathBuf::from("/tmp/torrc"),
            data_dir: PathBuf::from("/tmp/lib"),
            log_file: PathBuf::from("/tmp/log"),
            control_log_file: PathBuf::from("/tmp/ctrl_log"),
            local_socks: Some(9050),
            out_socks: Some(SocksEndpoint::new("10.0.0.5", 9051)),
            bridge: None,
            print_log: false,
            daemon_binary: "tor".to_string(),
            timing: InstanceTiming::default(),
        };

        // Local SOCKS wins when both are configured.
        assert_eq!(
            config.socks_endpoint(),
            Some(SocksEndpoint::new("127.0.0.1", 9050))
        );

        config.local_socks = None;
        assert_eq!(
            config.socks_endpoint(),
            Some(SocksEndpoint::new("10.0.0.5", 9051))
        );

        config.out_socks = None;
        assert_eq!(config.socks_endpoint(), None);
    }
}

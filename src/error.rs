use thiserror::Error;

/// Unified error type for the torfleet crate
#[derive(Error, Debug)]
pub enum FleetError {
    // Control channel errors
    #[error("control channel not connected: {name}")]
    NotConnected { name: String },

    #[error("control transport error: {0}")]
    ControlTransport(String),

    #[error("no reply from control channel")]
    NoReply,

    // Egress probing
    #[error("egress address unavailable")]
    EgressUnavailable,

    // SOCKS relay errors
    #[error("SOCKS connect failed: {0}")]
    SocksConnectFailed(String),

    #[error("relay error: {0}")]
    Relay(String),

    // Bridge request errors
    #[error("request target is not an absolute http:// URI")]
    UnknownProtocol,

    #[error("no SOCKS backends available")]
    NoBackendsAvailable,

    // Process errors
    #[error("daemon launch failed: {0}")]
    SpawnFailed(String),

    #[error("daemon not found: {0}")]
    DaemonMissing(String),

    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("duplicate instance name: {0}")]
    DuplicateInstance(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for torfleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    /// True for failures that callers are expected to absorb and retry
    /// or report, rather than treat as fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FleetError::NotConnected { .. }
                | FleetError::ControlTransport(_)
                | FleetError::NoReply
                | FleetError::EgressUnavailable
                | FleetError::SocksConnectFailed(_)
                | FleetError::Relay(_)
        )
    }
}

impl From<tokio_socks::Error> for FleetError {
    fn from(err: tokio_socks::Error) -> Self {
        FleetError::SocksConnectFailed(err.to_string())
    }
}

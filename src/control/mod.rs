//! Control-channel client for one supervised daemon.
//!
//! Authenticates to the daemon's control interface and runs line-oriented
//! command round-trips over it. Every command and every reply is appended
//! to the instance's control audit log.

pub mod reply;

pub use reply::{ControlReply, BOOTSTRAP_COMPLETE};

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::config::{ControlAddr, InstanceConfig, InstanceTiming};
use crate::error::{FleetError, Result};
use crate::recv::read_until_short;

/// Read size for control replies; a shorter chunk ends the reply.
const CONTROL_CHUNK: usize = 2048;

/// Connectivity state of a control client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Trait object bound for the underlying control connection
pub trait ControlConnection: AsyncRead + AsyncWrite + Unpin + Send {}

impl ControlConnection for TcpStream {}
impl ControlConnection for UnixStream {}

/// Client for one daemon's control channel.
///
/// Command round-trips serialize behind an internal mutex, so replies
/// can never interleave even when several tasks share the client.
pub struct ControlClient {
    name: String,
    addr: ControlAddr,
    audit_log: PathBuf,
    timing: InstanceTiming,
    shutdown: watch::Receiver<bool>,
    conn: Mutex<Option<Box<dyn ControlConnection>>>,
}

impl ControlClient {
    /// Create a disconnected client for the given instance.
    pub fn new(config: &InstanceConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            name: config.name.clone(),
            addr: config.control_addr.clone(),
            audit_log: config.control_log_file.clone(),
            timing: config.timing.clone(),
            shutdown,
            conn: Mutex::new(None),
        }
    }

    /// Current connectivity state.
    pub async fn state(&self) -> ConnectionState {
        if self.conn.lock().await.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Open the control channel and authenticate.
    ///
    /// The authenticate reply is logged but not validated; a missing
    /// reply still counts as an attempted authentication. Transport
    /// failures leave the client disconnected for the caller to retry.
    #[instrument(skip(self), fields(instance = %self.name))]
    pub async fn connect(&self) -> Result<()> {
        let stream: Box<dyn ControlConnection> = match &self.addr {
            ControlAddr::Unix(path) => Box::new(UnixStream::connect(path).await.map_err(|e| {
                FleetError::ControlTransport(format!("connect {}: {}", path.display(), e))
            })?),
            ControlAddr::Tcp(addr) => Box::new(TcpStream::connect(addr).await.map_err(|e| {
                FleetError::ControlTransport(format!("connect {}: {}", addr, e))
            })?),
        };

        *self.conn.lock().await = Some(stream);
        info!(instance = %self.name, addr = %self.addr, "connected to control channel");
        self.audit("connected to control channel").await;

        match self.send_command("AUTHENTICATE \"\"").await {
            Ok(reply) => {
                debug!(instance = %self.name, reply = %reply.lines.join(" "), "authenticate reply")
            }
            Err(FleetError::NoReply) => {
                debug!(instance = %self.name, "no authenticate reply")
            }
            Err(e) => {
                *self.conn.lock().await = None;
                return Err(e);
            }
        }

        Ok(())
    }

    /// Drop the control connection, if any.
    pub async fn disconnect(&self) {
        *self.conn.lock().await = None;
    }

    /// Send one command and read its reply.
    ///
    /// Appends CRLF when missing. Requires a connected client; a
    /// disconnected one is rejected with [`FleetError::NotConnected`]
    /// rather than reported as a protocol failure. A reply that never
    /// arrives surfaces as [`FleetError::NoReply`] and does not tear
    /// down the connection.
    pub async fn send_command(&self, command: &str) -> Result<ControlReply> {
        let mut guard = self.conn.lock().await;
        let stream = guard.as_mut().ok_or_else(|| FleetError::NotConnected {
            name: self.name.clone(),
        })?;

        let mut line = command.to_string();
        if !line.ends_with("\r\n") {
            line.push_str("\r\n");
        }

        if let Err(e) = stream.write_all(line.as_bytes()).await {
            self.audit(&format!("ERROR send command: {}", e)).await;
            return Err(FleetError::ControlTransport(format!("send failed: {}", e)));
        }
        self.audit(&format!("send command: {}", command)).await;

        let raw = match read_until_short(
            stream,
            CONTROL_CHUNK,
            self.timing.recv_timeout,
            Some(&self.shutdown),
        )
        .await
        {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.audit("no reply").await;
                return Err(FleetError::NoReply);
            }
            Err(e) => {
                self.audit(&format!("ERROR receive reply: {}", e)).await;
                return Err(FleetError::ControlTransport(format!("receive failed: {}", e)));
            }
        };

        let text = String::from_utf8_lossy(&raw);
        self.audit(&format!("receive: {}", text.trim_end())).await;
        Ok(ControlReply::parse(&text))
    }

    /// Query bootstrap progress; true iff the daemon reports PROGRESS=100.
    ///
    /// Safe to call at any frequency. Any transport or protocol failure
    /// reads as not-ready.
    pub async fn check_readiness(&self) -> bool {
        match self.send_command("GETINFO status/bootstrap-phase").await {
            Ok(reply) => reply.is_bootstrapped(),
            Err(FleetError::NotConnected { .. }) => false,
            Err(e) => {
                debug!(instance = %self.name, error = %e, "readiness query failed");
                false
            }
        }
    }

    /// Request a fresh circuit.
    ///
    /// A missing reply is tolerated; the readiness poll that follows
    /// decides whether the rotation took effect.
    pub async fn signal_newnym(&self) -> Result<()> {
        match self.send_command("SIGNAL NEWNYM").await {
            Ok(_) | Err(FleetError::NoReply) => Ok(()),
            Err(e) => {
                warn!(instance = %self.name, error = %e, "circuit renewal signal failed");
                Err(e)
            }
        }
    }

    /// Poll readiness at the retry pause until the daemon first reports
    /// bootstrap complete or cancellation flips. Returns the final
    /// readiness observation. Blocks its task; run it in the background.
    pub async fn wait_ready(&self) -> bool {
        loop {
            if *self.shutdown.borrow() {
                return false;
            }
            if self.check_readiness().await {
                return true;
            }
            sleep(self.timing.retry_pause).await;
        }
    }

    /// Append one timestamped line to the control audit log.
    async fn audit(&self, text: &str) {
        let line = format!(
            "{} -- {}\n",
            chrono::Local::now().format("%d:%m:%Y %H:%M:%S"),
            text
        );
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.audit_log)
                .await?;
            file.write_all(line.as_bytes()).await
        }
        .await;
        if let Err(e) = result {
            debug!(instance = %self.name, error = %e, "audit log write failed");
        }
    }
}

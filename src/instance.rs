//! Per-instance lifecycle supervisor.
//!
//! Owns one daemon process end to end: launches it, keeps its log files
//! positioned, drives the control-channel connection retry loop, and
//! tears the process down on cancellation.

use std::fmt;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::bridge::BridgeProxy;
use crate::config::InstanceConfig;
use crate::control::ControlClient;
use crate::error::{FleetError, Result};
use crate::probe::EgressProbe;

/// Pause between reads when tailing the daemon log.
const TAIL_PAUSE: Duration = Duration::from_millis(100);

/// Lifecycle state of one supervised instance.
///
/// `Working` reflects supervisor activity, not daemon bootstrap
/// completion; readiness is a separate fact obtained from the control
/// channel. There is no way back from `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    NotStarted,
    Working,
    Terminated,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::NotStarted => "not started",
            InstanceStatus::Working => "working",
            InstanceStatus::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Supervisor for one daemon process and its control channel.
pub struct InstanceSupervisor {
    config: InstanceConfig,
    control: ControlClient,
    probe: Arc<dyn EgressProbe>,
    status: RwLock<InstanceStatus>,
    cached_ip: RwLock<Option<String>>,
    bridge_addr: RwLock<Option<SocketAddr>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl InstanceSupervisor {
    /// Create a supervisor; the daemon is not launched until [`start`].
    ///
    /// [`start`]: InstanceSupervisor::start
    pub fn new(config: InstanceConfig, probe: Arc<dyn EgressProbe>) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let control = ControlClient::new(&config, stop_rx.clone());
        Arc::new(Self {
            config,
            control,
            probe,
            status: RwLock::new(InstanceStatus::NotStarted),
            cached_ip: RwLock::new(None),
            bridge_addr: RwLock::new(None),
            stop_tx,
            stop_rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub(crate) fn control(&self) -> &ControlClient {
        &self.control
    }

    /// Current lifecycle status.
    pub fn status(&self) -> InstanceStatus {
        *self.status.read()
    }

    /// Live bootstrap readiness, queried over the control channel.
    pub async fn is_ready(&self) -> bool {
        self.control.check_readiness().await
    }

    /// Listen address of the instance's HTTP bridge, once bound.
    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        *self.bridge_addr.read()
    }

    pub(crate) fn set_bridge_addr(&self, addr: SocketAddr) {
        *self.bridge_addr.write() = Some(addr);
    }

    /// Cached egress address, without probing.
    pub fn cached_ip(&self) -> Option<String> {
        self.cached_ip.read().clone()
    }

    /// True once this instance has been signaled to stop.
    pub fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Launch the daemon and the supervision loop.
    ///
    /// A supervisor runs at most once; starting anything but a
    /// `NotStarted` instance is a logged no-op.
    pub fn start(self: &Arc<Self>) {
        {
            let mut status = self.status.write();
            if *status != InstanceStatus::NotStarted {
                warn!(instance = %self.config.name, status = %status, "start ignored");
                return;
            }
            *status = InstanceStatus::Working;
        }
        let this = self.clone();
        tokio::spawn(async move { this.run().await });
    }

    /// Signal the supervisor to shut the instance down.
    ///
    /// Returns immediately; teardown completes asynchronously and is
    /// bounded by the idle-pause and shutdown-grace intervals.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    #[instrument(skip(self), fields(instance = %self.config.name))]
    async fn run(self: Arc<Self>) {
        if let Err(e) = self.init_log_files().await {
            warn!(error = %e, "log file initialization failed");
        }

        let mut child = match self.launch_daemon() {
            Ok(child) => child,
            Err(e) => {
                // This instance never properly started; siblings are
                // unaffected.
                error!(error = %e, "daemon launch failed");
                *self.status.write() = InstanceStatus::Terminated;
                return;
            }
        };
        info!(
            pid = ?child.id(),
            torrc = %self.config.torrc.display(),
            log = %self.config.log_file.display(),
            "daemon started"
        );

        // Control connect retry, then a single readiness observation.
        let this = self.clone();
        tokio::spawn(async move { this.connect_and_watch().await });

        if self.config.print_log {
            let this = self.clone();
            tokio::spawn(async move { this.tail_log().await });
        }

        if self.config.bridge.is_some() {
            match BridgeProxy::bind(&self.config, self.stop_rx.clone()).await {
                Ok(bridge) => {
                    self.set_bridge_addr(bridge.local_addr());
                    bridge.spawn();
                }
                Err(e) => error!(error = %e, "bridge construction failed"),
            }
        }

        // Idle until the stop signal.
        let mut stop_rx = self.stop_rx.clone();
        while !*stop_rx.borrow() {
            tokio::select! {
                _ = sleep(self.config.timing.idle_pause) => {}
                _ = stop_rx.changed() => {}
            }
        }

        self.teardown(&mut child).await;
        *self.status.write() = InstanceStatus::Terminated;
        info!("instance terminated");
    }

    fn launch_daemon(&self) -> Result<Child> {
        Command::new(&self.config.daemon_binary)
            .arg("-f")
            .arg(&self.config.torrc)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FleetError::SpawnFailed(format!("{}: {}", self.config.daemon_binary, e))
            })
    }

    /// Truncate both log files and stamp a session header.
    async fn init_log_files(&self) -> Result<()> {
        let header = format!(
            "{} - log session start\n",
            chrono::Local::now().format("%d:%m:%Y %H:%M")
        );
        tokio::fs::write(&self.config.log_file, &header).await?;
        tokio::fs::write(&self.config.control_log_file, &header).await?;
        Ok(())
    }

    /// Retry the control connection until it opens, then watch for the
    /// first bootstrap-complete report and stop.
    async fn connect_and_watch(&self) {
        loop {
            if self.stop_requested() {
                return;
            }
            match self.control.connect().await {
                Ok(()) => break,
                Err(e) => {
                    debug!(instance = %self.config.name, error = %e, "control connect attempt failed")
                }
            }
            sleep(self.config.timing.retry_pause).await;
        }

        if self.control.wait_ready().await {
            info!(instance = %self.config.name, "daemon bootstrap complete");
        }
    }

    /// Follow the daemon log and forward appended lines.
    async fn tail_log(&self) {
        let file = match tokio::fs::File::open(&self.config.log_file).await {
            Ok(file) => file,
            Err(e) => {
                warn!(instance = %self.config.name, error = %e, "cannot tail daemon log");
                return;
            }
        };
        let mut reader = BufReader::new(file);
        if let Err(e) = reader.seek(SeekFrom::End(0)).await {
            warn!(instance = %self.config.name, error = %e, "cannot tail daemon log");
            return;
        }

        let mut line = String::new();
        loop {
            if self.stop_requested() {
                return;
            }
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => sleep(TAIL_PAUSE).await,
                Ok(_) => info!(instance = %self.config.name, "{}", line.trim_end()),
                Err(e) => {
                    warn!(instance = %self.config.name, error = %e, "daemon log read failed");
                    return;
                }
            }
        }
    }

    /// Graceful daemon stop over the control channel with a bounded
    /// wait, then a forced kill.
    ///
    /// Teardown runs with the stop signal already set, which cancels
    /// the reply read; a written command with no reply still counts as
    /// a delivered shutdown signal.
    async fn teardown(&self, child: &mut Child) {
        let signaled = match self.control.send_command("SIGNAL SHUTDOWN").await {
            Ok(_) | Err(FleetError::NoReply) => true,
            Err(e) => {
                debug!(instance = %self.config.name, error = %e, "shutdown signal not delivered");
                false
            }
        };
        if signaled {
            match timeout(self.config.timing.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(instance = %self.config.name, %status, "daemon exited");
                    return;
                }
                Ok(Err(e)) => {
                    warn!(instance = %self.config.name, error = %e, "daemon wait failed")
                }
                Err(_) => {
                    warn!(instance = %self.config.name, "graceful shutdown timed out")
                }
            }
        }

        match child.kill().await {
            Ok(()) => info!(instance = %self.config.name, "daemon killed"),
            Err(e) => error!(instance = %self.config.name, error = %e, "daemon kill failed"),
        }
    }

    /// Egress address of this instance.
    ///
    /// The cached value is only trusted while the daemon reports
    /// bootstrap complete; otherwise the cache is cleared and the
    /// address is unavailable. A missing cache triggers one probe
    /// through the instance's SOCKS endpoint.
    pub async fn egress_ip(&self) -> Result<String> {
        if !self.control.check_readiness().await {
            *self.cached_ip.write() = None;
            return Err(FleetError::EgressUnavailable);
        }

        if let Some(ip) = self.cached_ip.read().clone() {
            return Ok(ip);
        }

        let endpoint = self.config.socks_endpoint().ok_or_else(|| {
            FleetError::InvalidConfig(format!(
                "instance {} has no SOCKS endpoint to probe",
                self.config.name
            ))
        })?;
        let ip = self.probe.probe(&endpoint).await?;
        *self.cached_ip.write() = Some(ip.clone());
        Ok(ip)
    }

    /// Request a fresh circuit and wait until the daemon is ready again.
    ///
    /// Blocks its task for the whole rotation; callers on a live path
    /// should use [`request_new_circuit`] instead.
    ///
    /// [`request_new_circuit`]: InstanceSupervisor::request_new_circuit
    pub async fn renew_circuit(&self, obtain_ip: bool) -> Result<()> {
        self.control.signal_newnym().await?;
        *self.cached_ip.write() = None;

        if !self.control.wait_ready().await {
            // Cancelled mid-rotation.
            return Ok(());
        }
        info!(instance = %self.config.name, "new circuit complete");

        if obtain_ip {
            match self.egress_ip().await {
                Ok(ip) => info!(instance = %self.config.name, ip = %ip, "new egress address"),
                Err(e) => warn!(instance = %self.config.name, error = %e, "egress address unavailable after rotation"),
            }
        }
        Ok(())
    }

    /// Fire-and-forget circuit rotation on a background task.
    pub fn request_new_circuit(self: &Arc<Self>, obtain_ip: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.renew_circuit(obtain_ip).await {
                warn!(instance = %this.config.name, error = %e, "circuit renewal failed");
            }
        });
    }

    /// One table row for the fleet snapshot.
    pub async fn describe_row(&self) -> String {
        let local = self
            .config
            .local_socks_endpoint()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".to_string());
        let out = self
            .config
            .out_socks
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "-".to_string());
        let ip = self.cached_ip().unwrap_or_else(|| "-".to_string());
        let bridge = self
            .bridge_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        let ready = self.is_ready().await;

        format!(
            "{:<20}{:<25}{:<25}{:<20}{:<15}{:<10}{:<22}",
            self.config.name,
            local,
            out,
            ip,
            self.status().to_string(),
            ready,
            bridge
        )
    }
}

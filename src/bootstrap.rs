//! Farm directory layout and daemon configuration rendering.
//!
//! Prepares the on-disk state one fleet root needs: a control-socket
//! directory, log and config directories, per-instance data directories,
//! and the rendered daemon configuration files.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::config::{BridgeAddr, ControlAddr, InstanceConfig, InstanceTiming, SocksEndpoint};
use crate::error::{FleetError, Result};

/// System-wide daemon configuration used as a template base when the
/// caller asks for the `default` template.
const SYSTEM_TORRC: &str = "/etc/tor/torrc";

/// Header used when no template file contributes content.
const TORRC_HEADER: &str = "## CUSTOM TORRC FILE\n\n";

/// Torrc template selection for one instance.
#[derive(Debug, Clone, Default)]
pub enum TorrcTemplate {
    /// Start from the bare header only.
    #[default]
    Bare,
    /// Start from the system-wide configuration file.
    System,
    /// Start from a caller-supplied file.
    File(PathBuf),
}

/// The prepared directory tree under one farm root.
#[derive(Debug, Clone)]
pub struct FarmLayout {
    root: PathBuf,
    controls: PathBuf,
    logs: PathBuf,
    config: PathBuf,
    lib: PathBuf,
}

impl FarmLayout {
    /// Create the farm directories under `root`, tightening the
    /// control-socket directory to 0o750 as the daemon requires.
    pub fn prepare(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let layout = Self {
            controls: root.join("_controls"),
            logs: root.join("logs"),
            config: root.join("config"),
            lib: root.join("lib"),
            root,
        };

        for dir in [
            &layout.root,
            &layout.controls,
            &layout.logs,
            &layout.config,
            &layout.lib,
        ] {
            fs::create_dir_all(dir)?;
        }
        fs::set_permissions(&layout.controls, fs::Permissions::from_mode(0o750))?;
        info!(root = %layout.root.display(), "farm directories prepared");
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Control socket path for a named instance.
    pub fn control_socket(&self, name: &str) -> PathBuf {
        self.controls.join(name)
    }

    /// Build a complete [`InstanceConfig`] for a named instance: create
    /// its data directory, render its torrc, and wire up the log paths.
    pub fn materialize(
        &self,
        name: &str,
        local_socks: Option<u16>,
        out_socks: Option<SocksEndpoint>,
        template: &TorrcTemplate,
        bridge: Option<BridgeAddr>,
        print_log: bool,
        daemon_binary: &str,
    ) -> Result<InstanceConfig> {
        let data_dir = self.lib.join(name);
        fs::create_dir_all(&data_dir)?;
        fs::set_permissions(&data_dir, fs::Permissions::from_mode(0o700))?;

        let config = InstanceConfig {
            name: name.to_string(),
            control_addr: ControlAddr::Unix(self.control_socket(name)),
            torrc: self.config.join(name),
            data_dir,
            log_file: self.logs.join(format!("{}_logs.txt", name)),
            control_log_file: self.logs.join(format!("{}_control_log.txt", name)),
            local_socks,
            out_socks,
            bridge,
            print_log,
            daemon_binary: daemon_binary.to_string(),
            timing: InstanceTiming::default(),
        };

        let rendered = render_torrc(&config, template)?;
        fs::write(&config.torrc, rendered)?;
        debug!(instance = name, torrc = %config.torrc.display(), "torrc rendered");
        Ok(config)
    }
}

/// Check that the daemon binary exists and runs, via `--version`.
pub fn daemon_available(binary: &str) -> Result<()> {
    match Command::new(binary).arg("--version").output() {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout);
            info!(binary, version = %version.lines().next().unwrap_or(""), "daemon binary found");
            Ok(())
        }
        Ok(out) => Err(FleetError::DaemonMissing(format!(
            "{} --version failed: {}",
            binary,
            String::from_utf8_lossy(&out.stderr).trim()
        ))),
        Err(e) => Err(FleetError::DaemonMissing(format!("{}: {}", binary, e))),
    }
}

/// Render the daemon configuration file: chosen template content, then
/// the per-instance control-socket, log, data-directory and SOCKS stanzas.
fn render_torrc(config: &InstanceConfig, template: &TorrcTemplate) -> Result<String> {
    let mut out = template_base(template);

    out.push_str(&format!("\n## Custom Config: {}\n", config.name));
    if let ControlAddr::Unix(path) = &config.control_addr {
        out.push_str(&format!(
            "\n##Control Socket:\nControlSocket {} GroupWritable RelaxDirModeCheck\nControlSocketsGroupWritable 1\n",
            path.display()
        ));
    }
    out.push_str(&format!(
        "\n## Send all messages of level 'notice' or higher\nLog notice file {}\n",
        config.log_file.display()
    ));
    out.push_str(&format!(
        "\n##TOR data in 'lib' directory\nDataDirectory {}\n",
        config.data_dir.display()
    ));
    if let Some(port) = config.local_socks {
        out.push_str(&format!(
            "\n## Local Proxy addr: 127.0.0.1:{port}\nSocksPort {port}\n"
        ));
    }
    if let Some(socks) = &config.out_socks {
        out.push_str(&format!(
            "\n## Outside Proxy addr: {socks}\nSocksPort {socks}\n"
        ));
    }
    Ok(out)
}

/// Template content, falling back to the bare header when the chosen
/// file cannot be read.
fn template_base(template: &TorrcTemplate) -> String {
    let path = match template {
        TorrcTemplate::Bare => return TORRC_HEADER.to_string(),
        TorrcTemplate::System => Path::new(SYSTEM_TORRC),
        TorrcTemplate::File(path) => path.as_path(),
    };
    match fs::read_to_string(path) {
        Ok(mut data) => {
            data.push('\n');
            data
        }
        Err(_) => TORRC_HEADER.to_string(),
    }
}

//! High-level planting API.
//!
//! A [`Farm`] owns the prepared directory layout and a probe, and turns
//! plant requests into ready-to-start [`InstanceSupervisor`]s, singly or
//! as a whole [`Fleet`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::bootstrap::{daemon_available, FarmLayout, TorrcTemplate};
use crate::config::{BridgeAddr, SocksEndpoint};
use crate::error::{FleetError, Result};
use crate::fleet::Fleet;
use crate::instance::InstanceSupervisor;
use crate::probe::{EgressProbe, SocksIpProbe};

/// Default local SOCKS port when a plant request names neither a local
/// port nor an outbound endpoint.
const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Port stride between fleet members.
const FLEET_PORT_STEP: u16 = 20;

/// Parameters for planting one instance. Unset fields get defaults.
#[derive(Debug, Clone, Default)]
pub struct PlantSpec {
    /// Instance name; auto-generated when empty.
    pub name: Option<String>,
    /// Loopback SOCKS port for the daemon.
    pub local_socks: Option<u16>,
    /// Outbound SOCKS endpoint, when the daemon listens on another
    /// interface.
    pub out_socks: Option<SocksEndpoint>,
    /// Torrc template selection.
    pub torrc_template: TorrcTemplate,
    /// Optional per-instance HTTP bridge.
    pub bridge: Option<BridgeAddr>,
    /// Forward daemon log lines to the console.
    pub print_log: bool,
}

/// Parameters for planting a whole fleet. Unset fields get defaults.
#[derive(Debug, Clone)]
pub struct FleetSpec {
    /// Number of members to plant.
    pub count: usize,
    /// Name prefix; members are numbered from it.
    pub base_name: String,
    /// First SOCKS port; members step from it in increments of 20.
    pub socks_start: u16,
    /// Outbound interface IP; each member also listens there on its
    /// stepped port.
    pub out_proxy_ip: Option<String>,
    /// Torrc template applied to every member.
    pub torrc_template: TorrcTemplate,
    /// Per-member HTTP bridge.
    pub bridge: Option<BridgeAddr>,
    /// Forward daemon log lines to the console.
    pub print_log: bool,
}

impl Default for FleetSpec {
    fn default() -> Self {
        Self {
            count: 1,
            base_name: "onion".to_string(),
            socks_start: 8000,
            out_proxy_ip: None,
            torrc_template: TorrcTemplate::default(),
            bridge: None,
            print_log: false,
        }
    }
}

/// Factory for supervised daemon instances under one farm root.
pub struct Farm {
    layout: FarmLayout,
    probe: Arc<dyn EgressProbe>,
    daemon_binary: String,
    planted: HashSet<String>,
}

impl Farm {
    /// Open a farm rooted at `root` using the system `tor` binary.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_binary(root, "tor")
    }

    /// Open a farm with a specific daemon binary, verifying it runs.
    pub fn open_with_binary(root: impl Into<PathBuf>, binary: &str) -> Result<Self> {
        daemon_available(binary)?;
        Self::open_unchecked(root, binary, Arc::new(SocksIpProbe))
    }

    /// Open a farm without the daemon check, with an injected probe.
    pub fn open_unchecked(
        root: impl Into<PathBuf>,
        binary: &str,
        probe: Arc<dyn EgressProbe>,
    ) -> Result<Self> {
        Ok(Self {
            layout: FarmLayout::prepare(root)?,
            probe,
            daemon_binary: binary.to_string(),
            planted: HashSet::new(),
        })
    }

    pub fn layout(&self) -> &FarmLayout {
        &self.layout
    }

    /// Plant one instance.
    ///
    /// A nameless request gets `onion<n>`; a request with neither a
    /// local port nor an outbound endpoint gets the default local port.
    pub fn plant(&mut self, spec: PlantSpec) -> Result<Arc<InstanceSupervisor>> {
        let name = match spec.name {
            Some(name) => name,
            None => format!("onion{}", self.planted.len() + 1),
        };
        if self.planted.contains(&name) {
            return Err(FleetError::DuplicateInstance(name));
        }

        let local_socks = match (spec.local_socks, &spec.out_socks) {
            (None, None) => Some(DEFAULT_SOCKS_PORT),
            (local, _) => local,
        };

        let config = self.layout.materialize(
            &name,
            local_socks,
            spec.out_socks,
            &spec.torrc_template,
            spec.bridge,
            spec.print_log,
            &self.daemon_binary,
        )?;
        self.planted.insert(name.clone());
        info!(instance = %name, "instance planted");
        Ok(InstanceSupervisor::new(config, self.probe.clone()))
    }

    /// Plant a whole fleet with stepped SOCKS ports and bundle it into a
    /// [`Fleet`] that retrieves egress addresses on start.
    ///
    /// Each member gets its own stepped port; with an outbound proxy IP
    /// the member additionally listens there on the same port. Template,
    /// bridge and log settings apply to every member.
    pub fn plant_fleet(&mut self, spec: FleetSpec) -> Result<Arc<Fleet>> {
        let mut members = Vec::with_capacity(spec.count);
        for _ in 0..spec.count {
            let id = self.planted.len() as u16 + 1;
            let port = spec.socks_start + id * FLEET_PORT_STEP;
            let member = PlantSpec {
                name: Some(format!("{}{}", spec.base_name, id)),
                local_socks: Some(port),
                out_socks: spec
                    .out_proxy_ip
                    .as_ref()
                    .map(|ip| SocksEndpoint::new(ip.clone(), port)),
                torrc_template: spec.torrc_template.clone(),
                bridge: spec.bridge.clone(),
                print_log: spec.print_log,
            };
            members.push(self.plant(member)?);
        }
        Ok(Arc::new(Fleet::new(members, true)?))
    }
}

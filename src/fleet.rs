//! Fleet aggregation over instance supervisors.
//!
//! Bulk operations fan out across every member and, where a completion
//! signal matters, join before reporting. One member failing never
//! aborts the rest.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{FleetError, Result};
use crate::instance::{InstanceStatus, InstanceSupervisor};

/// Pause between polls while waiting for fleet-wide bootstrap.
const READY_POLL_PAUSE: Duration = Duration::from_millis(300);

/// Header of the [`Fleet::describe`] table.
const DESCRIBE_HEADER: &str = "Name                Local Proxy              Out Proxy                Egress IP           Status         Ready     Bridge                ";

/// An ordered, name-unique collection of instance supervisors.
///
/// The fleet is the sole lifecycle owner of its members once built.
pub struct Fleet {
    members: Vec<Arc<InstanceSupervisor>>,
    auto_get_ip: bool,
}

impl Fleet {
    /// Build a fleet, rejecting duplicate member names.
    ///
    /// With `auto_get_ip`, [`start`] also kicks off a background task
    /// that waits for every member to bootstrap and then retrieves all
    /// egress addresses.
    ///
    /// [`start`]: Fleet::start
    pub fn new(members: Vec<Arc<InstanceSupervisor>>, auto_get_ip: bool) -> Result<Self> {
        let mut seen = HashSet::new();
        for member in &members {
            if !seen.insert(member.name().to_string()) {
                return Err(FleetError::DuplicateInstance(member.name().to_string()));
            }
        }
        Ok(Self {
            members,
            auto_get_ip,
        })
    }

    pub fn members(&self) -> &[Arc<InstanceSupervisor>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Start every member.
    pub fn start(self: &Arc<Self>) {
        for member in &self.members {
            member.start();
        }
        info!(members = self.members.len(), "fleet started");

        if self.auto_get_ip {
            let fleet = self.clone();
            tokio::spawn(async move {
                while !fleet.all_ready().await {
                    if fleet.stop_requested() {
                        return;
                    }
                    sleep(READY_POLL_PAUSE).await;
                }
                fleet.get_ip().await;
            });
        }
    }

    /// Signal every member to stop. Does not wait; members tear down
    /// asynchronously.
    pub fn stop(&self) {
        for member in &self.members {
            member.stop();
        }
        info!(members = self.members.len(), "fleet stop signaled");
    }

    /// True when every member reports bootstrap complete.
    pub async fn all_ready(&self) -> bool {
        for member in &self.members {
            if !member.is_ready().await {
                return false;
            }
        }
        true
    }

    /// True when every member's supervisor is in `Working` state.
    pub fn all_working(&self) -> bool {
        self.members
            .iter()
            .all(|m| m.status() == InstanceStatus::Working)
    }

    /// True when every member has terminated.
    pub fn all_terminated(&self) -> bool {
        self.members
            .iter()
            .all(|m| m.status() == InstanceStatus::Terminated)
    }

    /// True when any member has been signaled to stop.
    pub fn stop_requested(&self) -> bool {
        self.members.iter().any(|m| m.stop_requested())
    }

    /// Retrieve every member's egress address concurrently.
    ///
    /// One task per member; returns only after all of them have joined,
    /// so every member's cache reflects a query attempt. Individual
    /// failures are logged and absorbed.
    pub async fn get_ip(&self) {
        let tasks: Vec<_> = self
            .members
            .iter()
            .cloned()
            .map(|member| {
                tokio::spawn(async move {
                    match member.egress_ip().await {
                        Ok(ip) => {
                            debug!(instance = %member.name(), ip = %ip, "egress address obtained")
                        }
                        Err(e) => {
                            warn!(instance = %member.name(), error = %e, "egress address unavailable")
                        }
                    }
                })
            })
            .collect();

        join_all(tasks).await;
        info!(members = self.members.len(), "all egress addresses obtained");
    }

    /// Trigger a circuit rotation on every member.
    ///
    /// Fire-and-forget: each rotation proceeds at its own pace.
    pub fn request_new_circuit(&self) {
        for member in &self.members {
            member.request_new_circuit(false);
        }
    }

    /// Record a fleet-wide bridge address on every member.
    pub(crate) fn record_bridge_addr(&self, addr: SocketAddr) {
        for member in &self.members {
            member.set_bridge_addr(addr);
        }
    }

    /// Tabular snapshot of every member. Each row is read at the moment
    /// of the call; no cross-member atomicity.
    pub async fn describe(&self) -> String {
        let mut table = String::from(DESCRIBE_HEADER);
        table.push('\n');
        for member in &self.members {
            table.push_str(&member.describe_row().await);
            table.push('\n');
        }
        table
    }
}

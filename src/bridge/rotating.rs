//! Fleet-wide rotating HTTP bridge.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, instrument};

use crate::config::{BridgeAddr, SocksEndpoint};
use crate::error::{FleetError, Result};
use crate::fleet::Fleet;

use super::{bind_listener, handle_connection};

/// A SOCKS endpoint pool drawn from with last-used avoidance.
struct BackendPool {
    backends: Vec<SocksEndpoint>,
    last_used: Mutex<Option<usize>>,
}

impl BackendPool {
    fn new(backends: Vec<SocksEndpoint>) -> Result<Self> {
        if backends.is_empty() {
            return Err(FleetError::NoBackendsAvailable);
        }
        Ok(Self {
            backends,
            last_used: Mutex::new(None),
        })
    }

    /// Draw a backend distinct from the previous draw.
    ///
    /// A pool of one has no alternative; the sole backend is reused.
    fn next(&self) -> SocksEndpoint {
        let mut last = self.last_used.lock();
        if self.backends.len() == 1 {
            *last = Some(0);
            return self.backends[0].clone();
        }
        let mut rng = rand::thread_rng();
        let index = loop {
            let candidate = rng.gen_range(0..self.backends.len());
            if Some(candidate) != *last {
                break candidate;
            }
        };
        *last = Some(index);
        self.backends[index].clone()
    }
}

/// HTTP listener rotating each request across the fleet's SOCKS ports.
pub struct RotatingBridgeProxy {
    fleet: Arc<Fleet>,
    pool: Arc<BackendPool>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RotatingBridgeProxy {
    /// Bind the listener and collect every member's SOCKS endpoint.
    ///
    /// Members without a SOCKS endpoint are skipped; an entirely
    /// endpoint-less fleet fails with [`FleetError::NoBackendsAvailable`].
    /// The bound address is recorded on every member for `describe`.
    pub async fn bind(fleet: Arc<Fleet>, addr: Option<BridgeAddr>) -> Result<Self> {
        let backends: Vec<SocksEndpoint> = fleet
            .members()
            .iter()
            .filter_map(|m| m.config().socks_endpoint())
            .collect();
        let pool = Arc::new(BackendPool::new(backends)?);

        let (listener, local_addr) = bind_listener(addr.as_ref()).await?;
        fleet.record_bridge_addr(local_addr);

        Ok(Self {
            fleet,
            pool,
            listener,
            local_addr,
        })
    }

    /// The bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the accept loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    #[instrument(skip(self), fields(addr = %self.local_addr))]
    async fn run(self) {
        // Hold accepts until every member is up; the bridge is useless
        // while any backend daemon is still launching.
        let pause = self
            .fleet
            .members()
            .iter()
            .map(|m| m.config().timing.idle_pause)
            .min()
            .unwrap_or(Duration::from_secs(1));
        while !self.fleet.all_working() {
            if self.fleet.stop_requested() {
                return;
            }
            sleep(pause).await;
        }

        info!(backends = self.pool.backends.len(), "rotating bridge listening");

        let mut stop_check = interval(pause);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let socks = self.pool.next();
                            debug!(backend = %socks, "request routed");
                            tokio::spawn(async move {
                                handle_connection(stream, socks, "http-rotating").await;
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = stop_check.tick() => {
                    if self.fleet.stop_requested() {
                        break;
                    }
                }
            }
        }

        info!("rotating bridge stopped");
    }
}

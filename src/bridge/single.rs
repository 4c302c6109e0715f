//! Per-instance HTTP bridge.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::config::{InstanceConfig, SocksEndpoint};
use crate::error::{FleetError, Result};

use super::{bind_listener, handle_connection};

/// HTTP listener bound to one instance's SOCKS5 port.
pub struct BridgeProxy {
    name: String,
    listener: TcpListener,
    local_addr: SocketAddr,
    socks: SocksEndpoint,
    shutdown: watch::Receiver<bool>,
}

impl BridgeProxy {
    /// Resolve addresses and bind the listener.
    ///
    /// Fails fast when the instance exposes no SOCKS endpoint or the
    /// bind is refused; there is no retry.
    pub async fn bind(config: &InstanceConfig, shutdown: watch::Receiver<bool>) -> Result<Self> {
        let socks = config.socks_endpoint().ok_or_else(|| {
            FleetError::InvalidConfig(format!(
                "instance {} has no SOCKS endpoint for its bridge",
                config.name
            ))
        })?;

        let (listener, local_addr) = bind_listener(config.bridge.as_ref()).await?;

        Ok(Self {
            name: format!("http-{}", config.name),
            listener,
            local_addr,
            socks,
            shutdown,
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

    #[instrument(skip(self), fields(bridge = %self.name, addr = %self.local_addr))]
    async fn run(mut self) {
        info!("bridge listening");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let socks = self.socks.clone();
                            let name = self.name.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, socks, &name).await;
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("bridge stopped");
    }
}

//! The external tunnel daemon, seen only through its edges.
//!
//! | Edge | Trait | Production implementation |
//! |------|-------|---------------------------|
//! | restart after (re)provisioning | [`TunnelDaemon`] | [`SystemdDaemon`] |
//! | connected peers | [`StatusFeed`] | [`status::StatusFile`] |
//! | configuration files | - | [`config`] renderers |

pub mod config;
pub mod status;

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::exec;
use crate::{Error, Result};

pub use status::StatusFile;

/// One live tunnel peer. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedClient {
    /// Certificate common name
    pub identity: String,
    /// Address inside the tunnel
    pub tunnel_ip: Ipv4Addr,
    /// Public source address, when the daemon reports one
    pub real_ip: Option<IpAddr>,
}

/// Source of the connected-peer list.
#[async_trait]
pub trait StatusFeed: Send + Sync {
    /// Peers connected right now.
    async fn connected_clients(&self) -> Result<Vec<ConnectedClient>>;
}

/// Lifecycle control of the daemon process.
#[async_trait]
pub trait TunnelDaemon: Send + Sync {
    /// Full restart; re-reads every configuration file.
    async fn restart(&self) -> Result<()>;
}

/// Daemon managed as a systemd unit.
pub struct SystemdDaemon {
    service: String,
}

impl SystemdDaemon {
    /// Control `service` through `systemctl`.
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl TunnelDaemon for SystemdDaemon {
    async fn restart(&self) -> Result<()> {
        let out = exec::run("systemctl", &["restart", &self.service], None).await?;
        if !out.success {
            return Err(Error::Internal(format!(
                "systemctl restart {} failed: {}",
                self.service, out.stderr
            )));
        }
        info!(service = %self.service, "Tunnel daemon restarted");
        Ok(())
    }
}

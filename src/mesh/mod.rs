//! Hub-side spoke reachability distribution.
//!
//! For each spoke with an assigned tunnel address the hub keeps a
//! client-config file (`ifconfig-push` plus one `iroute` per network) and a
//! kernel route per network via the spoke's tunnel address. The daemon reads
//! client-config files only when a spoke connects, so any file change means
//! a full daemon restart.
//!
//! Kernel routes installed by this process are remembered; a route whose
//! network or spoke is gone from the feed is deleted on the next sync.

use std::collections::{BTreeSet, HashSet};
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use ztgate_proto::SpokeInfo;

use crate::exec;
use crate::pki::keys::write_atomic;
use crate::tunnel::config::render_spoke_directives;
use crate::{Error, Result};

/// Source of the hub's spokes.
#[async_trait]
pub trait SpokeSource: Send + Sync {
    /// Spokes owned by this hub.
    async fn fetch_spokes(&self) -> Result<Vec<SpokeInfo>>;
}

/// Kernel routing table.
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Install or replace the route to `network` via `gateway`.
    async fn replace(&self, network: Ipv4Net, gateway: Ipv4Addr) -> Result<()>;

    /// Delete the route to `network` via `gateway`.
    async fn remove(&self, network: Ipv4Net, gateway: Ipv4Addr) -> Result<()>;
}

/// Routes via `ip route replace` and `ip route del`.
#[derive(Debug, Clone)]
pub struct IpRouteTable {
    binary: String,
}

impl Default for IpRouteTable {
    fn default() -> Self {
        Self {
            binary: "ip".to_string(),
        }
    }
}

impl IpRouteTable {
    async fn route(&self, verb: &str, network: Ipv4Net, gateway: Ipv4Addr) -> Result<()> {
        let net = network.to_string();
        let via = gateway.to_string();
        let out = exec::run(&self.binary, &["route", verb, &net, "via", &via], None).await?;
        if out.success {
            Ok(())
        } else {
            Err(Error::Firewall(format!("ip route {verb} {net} via {via}: {}", out.stderr)))
        }
    }
}

#[async_trait]
impl RouteTable for IpRouteTable {
    async fn replace(&self, network: Ipv4Net, gateway: Ipv4Addr) -> Result<()> {
        self.route("replace", network, gateway).await
    }

    async fn remove(&self, network: Ipv4Net, gateway: Ipv4Addr) -> Result<()> {
        self.route("del", network, gateway).await
    }
}

/// Outcome of one sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshReport {
    /// Directive files written or rewritten
    pub written: usize,
    /// Directive files of departed spokes deleted
    pub deleted: usize,
    /// Spokes skipped (no tunnel address or unusable id)
    pub skipped: usize,
    /// Kernel routes installed
    pub routes: usize,
    /// Kernel routes of withdrawn networks deleted
    pub routes_removed: usize,
    /// The daemon must restart to pick up directive changes
    pub restart_needed: bool,
}

/// The mesh route distributor.
pub struct MeshDistributor {
    spokes: Arc<dyn SpokeSource>,
    routes: Arc<dyn RouteTable>,
    ccd_dir: PathBuf,
    installed: Mutex<BTreeSet<(Ipv4Net, Ipv4Addr)>>,
}

impl MeshDistributor {
    /// Distributor writing into `ccd_dir`.
    #[must_use]
    pub fn new(spokes: Arc<dyn SpokeSource>, routes: Arc<dyn RouteTable>, ccd_dir: PathBuf) -> Self {
        Self {
            spokes,
            routes,
            ccd_dir,
            installed: Mutex::new(BTreeSet::new()),
        }
    }

    /// Client-config directory.
    #[must_use]
    pub fn ccd_dir(&self) -> &Path {
        &self.ccd_dir
    }

    /// Fetch spokes and bring directive files and routes up to date.
    ///
    /// # Errors
    ///
    /// Fails if the spoke feed cannot be fetched or the directory cannot be
    /// written. Individual route failures are logged and skipped.
    pub async fn sync(&self) -> Result<MeshReport> {
        let spokes = self.spokes.fetch_spokes().await?;
        tokio::fs::create_dir_all(&self.ccd_dir).await?;

        let mut report = MeshReport::default();
        let mut keep = HashSet::new();
        let mut desired = BTreeSet::new();

        for spoke in &spokes {
            let Some(tunnel_ip) = spoke.tunnel_ip else {
                debug!(spoke = %spoke.id, "Spoke has no tunnel address; skipped");
                report.skipped += 1;
                continue;
            };
            if !is_safe_file_name(&spoke.id) {
                warn!(spoke = %spoke.id, "Spoke id unusable as a file name; skipped");
                report.skipped += 1;
                continue;
            }
            let networks: Vec<Ipv4Net> = spoke
                .local_networks
                .iter()
                .filter_map(|n| match n.parse::<Ipv4Net>() {
                    Ok(net) => Some(net.trunc()),
                    Err(_) => {
                        warn!(spoke = %spoke.id, network = %n, "Invalid spoke network ignored");
                        None
                    }
                })
                .collect();

            keep.insert(spoke.id.clone());
            let path = self.ccd_dir.join(&spoke.id);
            let content = render_spoke_directives(tunnel_ip, spoke.netmask, &networks);
            if read_existing(&path).await?.as_deref() != Some(content.as_str()) {
                write_atomic(&path, content.as_bytes(), 0o644)?;
                report.written += 1;
                info!(spoke = %spoke.id, tunnel_ip = %tunnel_ip, "Spoke directives written");
            }

            for net in networks {
                match self.routes.replace(net, tunnel_ip).await {
                    Ok(()) => {
                        report.routes += 1;
                        desired.insert((net, tunnel_ip));
                    }
                    Err(e) => {
                        warn!(spoke = %spoke.id, network = %net, error = %e, "Route install failed");
                    }
                }
            }
        }

        report.routes_removed = self.withdraw_routes(desired).await;
        report.deleted = self.delete_departed(&keep).await?;
        report.restart_needed = report.written > 0 || report.deleted > 0;
        if report.restart_needed {
            info!(written = report.written, deleted = report.deleted, "Spoke directives changed; daemon restart required");
        } else {
            debug!(spokes = spokes.len(), "Spoke directives unchanged");
        }
        Ok(report)
    }

    /// Delete installed routes missing from `desired`. A failed delete stays
    /// remembered and is retried on the next sync.
    async fn withdraw_routes(&self, desired: BTreeSet<(Ipv4Net, Ipv4Addr)>) -> usize {
        let stale: Vec<_> = self.installed.lock().difference(&desired).copied().collect();
        let mut next = desired;
        let mut removed = 0;
        for (net, via) in stale {
            match self.routes.remove(net, via).await {
                Ok(()) => {
                    info!(network = %net, via = %via, "Withdrawn spoke route deleted");
                    removed += 1;
                }
                Err(e) => {
                    warn!(network = %net, via = %via, error = %e, "Route delete failed; retrying next sync");
                    next.insert((net, via));
                }
            }
        }
        *self.installed.lock() = next;
        removed
    }

    async fn delete_departed(&self, keep: &HashSet<String>) -> Result<usize> {
        let mut deleted = 0;
        let mut dir = tokio::fs::read_dir(&self.ccd_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || keep.contains(&name) {
                continue;
            }
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
                info!(spoke = %name, "Removed directives of departed spoke");
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn is_safe_file_name(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

async fn read_existing(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

//! Enforcement agent: runs beside the tunnel daemon on a gateway or hub.
//!
//! # Loops
//!
//! | Loop | Interval | Work |
//! |------|----------|------|
//! | heartbeat | 30s | liveness, drift detection, reprovisioning |
//! | firewall | 10s | [`Reconciler::tick`] |
//! | mesh (hubs) | 30s | [`MeshDistributor::sync`], restart on change |
//!
//! The loops share no mutable state apart from the daemon they may restart.
//! A hub runs one mesh sync before anything else so spoke directives exist
//! before the daemon first accepts a spoke.

pub mod client;
pub mod heartbeat;
pub mod provision;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use ztgate_proto::{HeartbeatResponse, LiveCounts, ProvisionResponse};

use crate::config::AgentConfig;
use crate::enforcement::PointKind;
use crate::firewall::{
    FirewallBackend, NftBackend, Reconciler, RuleCompiler, SystemResolver, spawn_reconciler,
};
use crate::mesh::{IpRouteTable, MeshDistributor};
use crate::tunnel::config::BundleLayout;
use crate::tunnel::{StatusFile, SystemdDaemon, TunnelDaemon};
use crate::{Error, Result, shutdown_signal};

pub use client::ControlPlaneClient;
pub use heartbeat::ReprovisionGuard;
pub use provision::Provisioner;

/// Agent-side view of the control plane's heartbeat and provision calls.
#[async_trait]
pub trait ControlPlaneApi: Send + Sync {
    /// Report liveness and the last applied version.
    async fn heartbeat(
        &self,
        status: &str,
        live_counts: LiveCounts,
        config_version: &str,
    ) -> Result<HeartbeatResponse>;

    /// Fetch a fresh bundle.
    async fn provision(&self) -> Result<ProvisionResponse>;
}

/// What one heartbeat tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Local version matches the canonical one
    InSync,
    /// A bundle was applied and the daemon restarted
    Reprovisioned {
        /// Version now on disk
        version: String,
    },
    /// Drift persists but the reprovision guard held off
    Suppressed,
    /// The control plane could not be reached; retried next tick
    Unreachable,
}

/// The enforcement agent.
pub struct Agent {
    config: AgentConfig,
    api: Arc<dyn ControlPlaneApi>,
    daemon: Arc<dyn TunnelDaemon>,
    provisioner: Provisioner,
    reconciler: Option<Arc<Reconciler>>,
    mesh: Option<Arc<MeshDistributor>>,
    guard: Mutex<ReprovisionGuard>,
}

impl Agent {
    /// Assemble an agent from its collaborators.
    #[must_use]
    pub fn new(
        config: AgentConfig,
        api: Arc<dyn ControlPlaneApi>,
        daemon: Arc<dyn TunnelDaemon>,
        reconciler: Option<Arc<Reconciler>>,
        mesh: Option<Arc<MeshDistributor>>,
    ) -> Self {
        let provisioner = Provisioner::new(
            BundleLayout::new(&config.state_dir),
            &config.daemon.config_file,
            config.status_file.clone(),
            config.role,
        );
        Self {
            guard: Mutex::new(ReprovisionGuard::new(config.reprovision)),
            config,
            api,
            daemon,
            provisioner,
            reconciler,
            mesh,
        }
    }

    /// Production agent: HTTP client, nftables, systemd, `ip route`.
    ///
    /// Installs the base firewall table when the firewall is enabled.
    ///
    /// # Errors
    ///
    /// Fails on a missing token, an unbuildable HTTP client or a failed
    /// firewall initialization.
    pub async fn from_config(config: AgentConfig) -> Result<Self> {
        let token = config
            .resolved_token()
            .ok_or_else(|| Error::Config("agent token must be set".to_string()))?;
        let client = Arc::new(ControlPlaneClient::new(
            &config.control_url,
            token,
            config.http_timeout,
        )?);

        let reconciler = if config.firewall.enabled {
            let backend = Arc::new(NftBackend::new(
                config.firewall.nft_binary.clone(),
                config.firewall.table.clone(),
            ));
            backend.init().await?;
            Some(Arc::new(Reconciler::new(
                Arc::new(StatusFile::new(&config.status_file)),
                client.clone(),
                RuleCompiler::new(Arc::new(SystemResolver), config.resolve_timeout),
                backend,
            )))
        } else {
            warn!("Firewall reconciliation disabled; tunnel traffic is not filtered by ztgate");
            None
        };

        let mesh = (config.role == PointKind::Hub).then(|| {
            Arc::new(MeshDistributor::new(
                client.clone(),
                Arc::new(IpRouteTable::default()),
                BundleLayout::new(&config.state_dir).ccd_dir(),
            ))
        });

        let daemon = Arc::new(SystemdDaemon::new(config.daemon.service.clone()));
        Ok(Self::new(config, client, daemon, reconciler, mesh))
    }

    /// Bundle writer.
    #[must_use]
    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    fn live_counts(&self) -> LiveCounts {
        self.reconciler
            .as_ref()
            .map(|r| LiveCounts {
                clients: r.connected_count(),
                applied_identities: r.applied_count(),
            })
            .unwrap_or_default()
    }

    /// One heartbeat: report, compare, reprovision if needed.
    ///
    /// A missing local version always provisions, whatever the heartbeat
    /// said, and bypasses the reprovision guard.
    ///
    /// # Errors
    ///
    /// Fails when a required provision cannot be fetched or applied, or the
    /// local version file cannot be read.
    pub async fn heartbeat_tick(&self) -> Result<HeartbeatOutcome> {
        let local = self.provisioner.read_version()?;
        let reported = local.as_deref().unwrap_or_default();

        let response = match self.api.heartbeat("running", self.live_counts(), reported).await {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(error = %e, "Heartbeat failed; retrying next tick");
                None
            }
        };

        if local.is_none() {
            info!("No local config version; provisioning");
            return self.reprovision().await;
        }
        let Some(response) = response else {
            return Ok(HeartbeatOutcome::Unreachable);
        };

        if !response.needs_reprovision {
            self.guard.lock().on_in_sync();
            debug!(version = %reported, "Config in sync");
            return Ok(HeartbeatOutcome::InSync);
        }

        info!(local = %reported, canonical = %response.config_version, "Config drift detected");
        if !self.guard.lock().on_drift() {
            return Ok(HeartbeatOutcome::Suppressed);
        }
        self.reprovision().await
    }

    async fn reprovision(&self) -> Result<HeartbeatOutcome> {
        let bundle = self.api.provision().await?;
        self.provisioner.apply(&bundle)?;
        if let Err(e) = self.daemon.restart().await {
            error!(error = %e, version = %bundle.config_version, "Tunnel daemon restart failed after provisioning");
        }
        Ok(HeartbeatOutcome::Reprovisioned {
            version: bundle.config_version,
        })
    }

    /// One mesh pass; restarts the daemon when a directive file changed and
    /// the point has been provisioned.
    ///
    /// # Errors
    ///
    /// Fails if the sync itself fails.
    pub async fn mesh_tick(&self) -> Result<()> {
        let Some(ref mesh) = self.mesh else {
            return Ok(());
        };
        let report = mesh.sync().await?;
        if report.restart_needed && self.provisioner.read_version()?.is_some() {
            info!(written = report.written, deleted = report.deleted, "Spoke directives changed; restarting tunnel daemon");
            self.daemon.restart().await?;
        }
        Ok(())
    }

    /// Run every loop until Ctrl-C or SIGTERM, then clean up firewall rules.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            role = ?self.config.role,
            control = %self.config.control_url,
            state_dir = %self.config.state_dir.display(),
            "Starting ztgate agent"
        );

        if let Some(ref mesh) = self.mesh {
            match mesh.sync().await {
                Ok(report) => info!(written = report.written, routes = report.routes, "Initial mesh sync"),
                Err(e) => warn!(error = %e, "Initial mesh sync failed; spokes may get pool addresses until the next pass"),
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        tasks.push(spawn_loop(
            "heartbeat",
            self.config.heartbeat_interval,
            shutdown_tx.subscribe(),
            {
                let agent = Arc::clone(&self);
                move || {
                    let agent = Arc::clone(&agent);
                    async move { agent.heartbeat_tick().await.map(|_| ()) }
                }
            },
        ));

        if let Some(ref reconciler) = self.reconciler {
            tasks.push(spawn_reconciler(
                Arc::clone(reconciler),
                self.config.reconcile_interval,
                shutdown_tx.subscribe(),
            ));
        }

        if self.mesh.is_some() {
            tasks.push(spawn_loop(
                "mesh",
                self.config.mesh_interval,
                shutdown_tx.subscribe(),
                {
                    let agent = Arc::clone(&self);
                    move || {
                        let agent = Arc::clone(&agent);
                        async move { agent.mesh_tick().await }
                    }
                },
            ));
        }

        shutdown_signal(shutdown_tx).await;
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Agent task ended abnormally");
            }
        }
        info!("Agent stopped");
        Ok(())
    }
}

/// Run `tick` every `interval` until shutdown. Errors are logged and the loop
/// carries on.
fn spawn_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = tick().await {
                        warn!(task = name, error = %e, "Tick failed; retrying next interval");
                    }
                }
                _ = shutdown.recv() => {
                    debug!(task = name, "Loop shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReprovisionGuardConfig;
    use crate::mesh::{RouteTable, SpokeSource};
    use ipnet::Ipv4Net;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use ztgate_proto::{CryptoProfile, SpokeInfo, VpnProtocol};

    // ── Fakes ───────────────────────────────────────────────────────────

    /// Control plane whose canonical version can be changed between ticks.
    struct FakeApi {
        canonical: Mutex<String>,
        /// Version stamped on provisioned bundles; diverges to simulate a
        /// serialization mismatch
        served: Mutex<String>,
        reachable: Mutex<bool>,
        heartbeat_down: Mutex<bool>,
        provisions: AtomicUsize,
    }

    impl FakeApi {
        fn new(version: &str) -> Self {
            Self {
                canonical: Mutex::new(version.into()),
                served: Mutex::new(version.into()),
                reachable: Mutex::new(true),
                heartbeat_down: Mutex::new(false),
                provisions: AtomicUsize::new(0),
            }
        }

        fn set_version(&self, v: &str) {
            *self.canonical.lock() = v.into();
            *self.served.lock() = v.into();
        }
    }

    #[async_trait]
    impl ControlPlaneApi for FakeApi {
        async fn heartbeat(&self, _: &str, _: LiveCounts, version: &str) -> Result<HeartbeatResponse> {
            if !*self.reachable.lock() || *self.heartbeat_down.lock() {
                return Err(Error::ControlPlane("unreachable".into()));
            }
            let canonical = self.canonical.lock().clone();
            Ok(HeartbeatResponse {
                ok: true,
                needs_reprovision: version != canonical,
                config_version: canonical,
            })
        }

        async fn provision(&self) -> Result<ProvisionResponse> {
            if !*self.reachable.lock() {
                return Err(Error::ControlPlane("unreachable".into()));
            }
            self.provisions.fetch_add(1, Ordering::SeqCst);
            Ok(ProvisionResponse {
                ca_cert: "CA".into(),
                server_cert: "CERT".into(),
                server_key: "KEY".into(),
                dh_params: None,
                tls_auth_enabled: false,
                tls_auth_key: None,
                vpn_port: 1194,
                vpn_protocol: VpnProtocol::Udp,
                vpn_subnet: "10.8.0.0/24".into(),
                crypto_profile: CryptoProfile::Modern,
                config_version: self.served.lock().clone(),
            })
        }
    }

    #[derive(Default)]
    struct CountingDaemon {
        restarts: AtomicUsize,
    }

    #[async_trait]
    impl TunnelDaemon for CountingDaemon {
        async fn restart(&self) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct OneSpoke;

    #[async_trait]
    impl SpokeSource for OneSpoke {
        async fn fetch_spokes(&self) -> Result<Vec<SpokeInfo>> {
            Ok(vec![SpokeInfo {
                id: "branch-1".into(),
                tunnel_ip: Some(Ipv4Addr::new(10, 8, 0, 50)),
                local_networks: vec!["192.168.10.0/24".into()],
                netmask: Ipv4Addr::new(255, 255, 255, 0),
            }])
        }
    }

    struct NoRoutes;

    #[async_trait]
    impl RouteTable for NoRoutes {
        async fn replace(&self, _: Ipv4Net, _: Ipv4Addr) -> Result<()> {
            Ok(())
        }

        async fn remove(&self, _: Ipv4Net, _: Ipv4Addr) -> Result<()> {
            Ok(())
        }
    }

    fn agent(
        dir: &std::path::Path,
        api: Arc<FakeApi>,
        daemon: Arc<CountingDaemon>,
        role: PointKind,
    ) -> Agent {
        let config = AgentConfig {
            state_dir: dir.to_path_buf(),
            status_file: dir.join("status.log"),
            role,
            reprovision: ReprovisionGuardConfig {
                max_consecutive: 2,
                max_backoff_ticks: 4,
            },
            ..AgentConfig::default()
        };
        let mesh = (role == PointKind::Hub).then(|| {
            Arc::new(MeshDistributor::new(
                Arc::new(OneSpoke),
                Arc::new(NoRoutes),
                dir.join("ccd"),
            ))
        });
        Agent::new(config, api, daemon, None, mesh)
    }

    // ── Tests ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_boot_provisions_even_if_heartbeat_fails() {
        // GIVEN: empty state dir, heartbeat endpoint down but provision up
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::new("v1"));
        *api.heartbeat_down.lock() = true;
        let daemon = Arc::new(CountingDaemon::default());
        let a = agent(dir.path(), Arc::clone(&api), Arc::clone(&daemon), PointKind::Gateway);

        // WHEN
        let outcome = a.heartbeat_tick().await.unwrap();

        // THEN
        assert_eq!(outcome, HeartbeatOutcome::Reprovisioned { version: "v1".into() });
        assert_eq!(a.provisioner().read_version().unwrap().as_deref(), Some("v1"));
        assert_eq!(daemon.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drift_reprovisions_then_settles() {
        // GIVEN: agent at v1
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::new("v1"));
        let daemon = Arc::new(CountingDaemon::default());
        let a = agent(dir.path(), Arc::clone(&api), Arc::clone(&daemon), PointKind::Gateway);
        a.heartbeat_tick().await.unwrap();
        assert_eq!(a.heartbeat_tick().await.unwrap(), HeartbeatOutcome::InSync);

        // WHEN: the canonical version moves to v2
        api.set_version("v2");

        // THEN
        assert_eq!(
            a.heartbeat_tick().await.unwrap(),
            HeartbeatOutcome::Reprovisioned { version: "v2".into() }
        );
        assert_eq!(a.heartbeat_tick().await.unwrap(), HeartbeatOutcome::InSync);
        assert_eq!(api.provisions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_drift_is_guarded() {
        // GIVEN: bundles that never carry the canonical version
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::new("v1"));
        let daemon = Arc::new(CountingDaemon::default());
        let a = agent(dir.path(), Arc::clone(&api), Arc::clone(&daemon), PointKind::Gateway);
        a.heartbeat_tick().await.unwrap();
        *api.canonical.lock() = "v2".into();

        // WHEN
        let mut outcomes = Vec::new();
        for _ in 0..4 {
            outcomes.push(a.heartbeat_tick().await.unwrap());
        }

        // THEN: two reprovisions, then suppression, then one more attempt
        assert!(matches!(outcomes[0], HeartbeatOutcome::Reprovisioned { .. }));
        assert!(matches!(outcomes[1], HeartbeatOutcome::Reprovisioned { .. }));
        assert_eq!(outcomes[2], HeartbeatOutcome::Suppressed);
        assert!(matches!(outcomes[3], HeartbeatOutcome::Reprovisioned { .. }));
    }

    #[tokio::test]
    async fn unreachable_control_plane_keeps_local_version() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::new("v1"));
        let daemon = Arc::new(CountingDaemon::default());
        let a = agent(dir.path(), Arc::clone(&api), Arc::clone(&daemon), PointKind::Gateway);
        a.heartbeat_tick().await.unwrap();

        *api.reachable.lock() = false;
        assert_eq!(a.heartbeat_tick().await.unwrap(), HeartbeatOutcome::Unreachable);
        assert_eq!(a.provisioner().read_version().unwrap().as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn failed_bootstrap_provision_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::new("v1"));
        *api.reachable.lock() = false;
        let a = agent(dir.path(), api, Arc::new(CountingDaemon::default()), PointKind::Gateway);
        assert!(a.heartbeat_tick().await.is_err());
        assert_eq!(a.provisioner().read_version().unwrap(), None);
    }

    #[tokio::test]
    async fn mesh_change_restarts_only_after_provisioning() {
        // GIVEN: a hub not yet provisioned
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeApi::new("v1"));
        let daemon = Arc::new(CountingDaemon::default());
        let a = agent(dir.path(), Arc::clone(&api), Arc::clone(&daemon), PointKind::Hub);

        // WHEN: the first sync writes directives before provisioning
        a.mesh_tick().await.unwrap();

        // THEN: no restart yet, file in place
        assert_eq!(daemon.restarts.load(Ordering::SeqCst), 0);
        assert!(dir.path().join("ccd").join("branch-1").exists());

        // AND: once provisioned, unchanged directives cause no restart
        a.heartbeat_tick().await.unwrap();
        a.mesh_tick().await.unwrap();
        assert_eq!(daemon.restarts.load(Ordering::SeqCst), 1);
    }
}

//! Firewall reconciliation fed by the control plane's policy, rendering real
//! nftables batches into a recorder instead of running `nft`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ztgate::config::{ControlConfig, DirectoryConfig, PointConfig};
use ztgate::control::ControlPlane;
use ztgate::enforcement::{PointKind, PointSettings};
use ztgate::firewall::{
    CompiledRuleSet, FirewallBackend, HostResolver, NftBackend, Reconciler, RuleCompiler,
    RuleSource, TrackingKey,
};
use ztgate::policy::{NetworkRecord, UserRecord};
use ztgate::tunnel::{ConnectedClient, StatusFeed};
use ztgate::{Error, Result};
use ztgate_proto::{AccessRule, PortRange, Protocol, RuleFetchRequest, RuleType};

struct PlaneRules(Arc<ControlPlane>);

#[async_trait]
impl RuleSource for PlaneRules {
    async fn fetch_rules(&self, identities: &[String]) -> Result<BTreeMap<String, Vec<AccessRule>>> {
        let resp = self.0.fetch_rules(&RuleFetchRequest {
            token: "gw-token".into(),
            identities: identities.to_vec(),
        })?;
        Ok(resp.rules)
    }
}

#[derive(Default)]
struct Feed(Mutex<Vec<ConnectedClient>>);

impl Feed {
    fn set(&self, clients: &[(&str, Ipv4Addr)]) {
        *self.0.lock() = clients
            .iter()
            .map(|(id, ip)| ConnectedClient {
                identity: (*id).to_string(),
                tunnel_ip: *ip,
                real_ip: None,
            })
            .collect();
    }
}

#[async_trait]
impl StatusFeed for Feed {
    async fn connected_clients(&self) -> Result<Vec<ConnectedClient>> {
        Ok(self.0.lock().clone())
    }
}

struct NoDns;

#[async_trait]
impl HostResolver for NoDns {
    async fn resolve_v4(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        Err(Error::NotFound(host.to_string()))
    }
}

/// Renders batches with the nftables script builder and records them.
struct ScriptRecorder {
    nft: NftBackend,
    scripts: Mutex<Vec<String>>,
}

impl ScriptRecorder {
    fn new() -> Self {
        Self {
            nft: NftBackend::new("nft", "ztgate"),
            scripts: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.scripts.lock())
    }
}

#[async_trait]
impl FirewallBackend for ScriptRecorder {
    async fn init(&self) -> Result<()> {
        self.scripts.lock().push(self.nft.init_script());
        Ok(())
    }

    async fn apply(
        &self,
        key: &TrackingKey,
        previous: Option<&CompiledRuleSet>,
        desired: &CompiledRuleSet,
    ) -> Result<()> {
        self.scripts
            .lock()
            .push(self.nft.apply_script(key, previous, desired));
        Ok(())
    }

    async fn remove(&self, key: &TrackingKey, applied: &CompiledRuleSet) -> Result<()> {
        self.scripts.lock().push(self.nft.remove_script(key, applied));
        Ok(())
    }
}

fn control_plane() -> Arc<ControlPlane> {
    let config = ControlConfig {
        directory: DirectoryConfig {
            networks: vec![NetworkRecord {
                id: "office".into(),
                cidr: "10.0.0.0/16".parse().unwrap(),
            }],
            rules: vec![
                AccessRule {
                    id: "r-office".into(),
                    rule_type: RuleType::Cidr,
                    value: "10.0.0.0/24".into(),
                    port_range: PortRange::Any,
                    protocol: Protocol::Any,
                    network: Some("office".into()),
                    active: true,
                },
                AccessRule {
                    id: "r-intranet".into(),
                    rule_type: RuleType::Hostname,
                    value: "intranet.invalid".into(),
                    port_range: PortRange::single(443),
                    protocol: Protocol::Tcp,
                    network: None,
                    active: true,
                },
            ],
            users: vec![UserRecord {
                id: "alice".into(),
                groups: vec![],
                rules: vec!["r-office".into(), "r-intranet".into()],
            }],
            groups: vec![],
        },
        points: vec![PointConfig {
            id: "gw-1".into(),
            kind: PointKind::Gateway,
            token: "gw-token".into(),
            endpoint: None,
            networks: vec!["office".into()],
            settings: PointSettings::default(),
            spokes: vec![],
        }],
        ..ControlConfig::default()
    };
    Arc::new(ControlPlane::from_config(&config).unwrap())
}

fn reconciler(feed: &Arc<Feed>, backend: &Arc<ScriptRecorder>) -> Reconciler {
    Reconciler::new(
        Arc::clone(feed) as Arc<dyn StatusFeed>,
        Arc::new(PlaneRules(control_plane())),
        RuleCompiler::new(Arc::new(NoDns), Duration::from_millis(100)),
        Arc::clone(backend) as Arc<dyn FirewallBackend>,
    )
}

/// alice connects, gets her CIDR rule, disconnects, and her chain is removed
/// on the next tick.
#[tokio::test]
async fn test_disconnect_cleanup_scenario() {
    // GIVEN: alice connected
    let feed = Arc::new(Feed::default());
    let backend = Arc::new(ScriptRecorder::new());
    let r = reconciler(&feed, &backend);
    let alice_ip = Ipv4Addr::new(10, 8, 0, 6);
    feed.set(&[("alice", alice_ip)]);
    let chain = TrackingKey::for_identity("alice").chain_name();

    // WHEN
    let report = r.tick().await;

    // THEN: one batch installs only the CIDR rule; the unresolvable host adds nothing
    assert_eq!(report.applied, 1);
    let scripts = backend.take();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains(&format!("add rule inet ztgate {chain} ip daddr 10.0.0.0/24 accept")));
    assert!(!scripts[0].contains("dport 443"));
    assert!(scripts[0].contains(&format!("add element inet ztgate sources {{ 10.8.0.6 : jump {chain} }}")));
    assert_eq!(r.applied_count(), 1);

    // WHEN: alice disappears from the status feed
    feed.set(&[]);
    let report = r.tick().await;

    // THEN: her chain is torn down within that tick
    assert_eq!(report.removed, 1);
    let scripts = backend.take();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains(&format!("delete chain inet ztgate {chain}")));
    assert_eq!(r.applied_count(), 0);
}

/// Unchanged inputs produce zero backend calls.
#[tokio::test]
async fn test_steady_state_is_idempotent() {
    let feed = Arc::new(Feed::default());
    let backend = Arc::new(ScriptRecorder::new());
    let r = reconciler(&feed, &backend);
    feed.set(&[("alice", Ipv4Addr::new(10, 8, 0, 6))]);

    r.tick().await;
    backend.take();

    for _ in 0..3 {
        let report = r.tick().await;
        assert_eq!(report.unchanged, 1);
    }
    assert!(backend.take().is_empty());
}

/// An identity the directory does not know is installed with an empty chain.
#[tokio::test]
async fn test_unknown_identity_is_default_deny() {
    let feed = Arc::new(Feed::default());
    let backend = Arc::new(ScriptRecorder::new());
    let r = reconciler(&feed, &backend);
    feed.set(&[("mallory", Ipv4Addr::new(10, 8, 0, 9))]);

    r.tick().await;

    let scripts = backend.take();
    assert_eq!(scripts.len(), 1);
    assert!(!scripts[0].contains("add rule"));
    assert!(scripts[0].contains("add element"));
}

/// Shutdown removes every installed chain.
#[tokio::test]
async fn test_shutdown_cleanup_removes_everything() {
    let feed = Arc::new(Feed::default());
    let backend = Arc::new(ScriptRecorder::new());
    let r = reconciler(&feed, &backend);
    feed.set(&[
        ("alice", Ipv4Addr::new(10, 8, 0, 6)),
        ("mallory", Ipv4Addr::new(10, 8, 0, 9)),
    ]);
    r.tick().await;
    backend.take();

    assert_eq!(r.shutdown_cleanup().await, 2);
    let scripts = backend.take();
    assert!(scripts.iter().all(|s| s.contains("delete chain")));
}

//! Per-identity packet-filter reconciliation.
//!
//! # State machine
//!
//! ```text
//!   absent ──connected──► pending-apply ──backend ok──► applied
//!     ▲                        │  ▲                        │
//!     │                        └──┘ backend error          │ disconnected
//!     │                         (retry next tick)          ▼
//!     └────────────backend ok──────────────────── pending-removal
//!                                                   (retry on error)
//! ```
//!
//! # One tick
//!
//! 1. Read connected peers from the status feed.
//! 2. Remove the rule group of every identity that is gone.
//! 3. Fetch rules for all connected identities in one request.
//! 4. Identities missing from the answer get an empty rule set.
//! 5. Compile, resolving host names with a per-rule timeout.
//! 6. Swap the identity's rule group only when the compiled set changed.
//!
//! The state map is owned by the [`Reconciler`] and only the tick (or the
//! shutdown cleanup) touches it, under one async mutex.

pub mod backend;
pub mod compile;
pub mod resolve;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use ztgate_proto::AccessRule;

use crate::Result;
use crate::tunnel::StatusFeed;

pub use backend::{FirewallBackend, NftBackend};
pub use compile::{CompiledRuleSet, FilterEntry, RuleCompiler};
pub use resolve::{HostResolver, SystemResolver};

/// Namespace for identity tracking keys. Changing it renames every chain.
const TRACKING_NAMESPACE: Uuid = Uuid::from_u128(0x7a74_6761_7465_4f00_8e1d_5a3c_2b19_04f6);

/// Stable per-identity key, a pure function of the identity string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackingKey(Uuid);

impl TrackingKey {
    /// Derive the key for `identity`.
    #[must_use]
    pub fn for_identity(identity: &str) -> Self {
        Self(Uuid::new_v5(&TRACKING_NAMESPACE, identity.as_bytes()))
    }

    /// Underlying UUID.
    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Packet-filter chain name for the identity.
    #[must_use]
    pub fn chain_name(&self) -> String {
        let simple = self.0.simple().to_string();
        format!("zt_{}", &simple[..12])
    }
}

/// Source of effective rules for connected identities.
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Rules for every identity in one round trip. Identities the control
    /// plane does not know are absent from the map.
    async fn fetch_rules(&self, identities: &[String]) -> Result<BTreeMap<String, Vec<AccessRule>>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    PendingApply,
    Applied,
    PendingRemoval,
}

#[derive(Debug)]
struct IdentityState {
    key: TrackingKey,
    phase: Phase,
    /// What the backend currently holds for this identity
    applied: Option<CompiledRuleSet>,
}

/// Outcome of one tick, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Identities whose rule group was (re)applied
    pub applied: usize,
    /// Identities whose rule group was removed
    pub removed: usize,
    /// Identities left unchanged
    pub unchanged: usize,
    /// Backend calls that failed and will be retried
    pub failed: usize,
    /// The batched rule fetch failed; no applies were attempted
    pub fetch_failed: bool,
}

/// The firewall reconciler.
pub struct Reconciler {
    feed: Arc<dyn StatusFeed>,
    rules: Arc<dyn RuleSource>,
    compiler: RuleCompiler,
    backend: Arc<dyn FirewallBackend>,
    state: Mutex<HashMap<String, IdentityState>>,
    connected: AtomicU32,
    applied: AtomicU32,
}

impl Reconciler {
    /// Assemble a reconciler from its collaborators.
    #[must_use]
    pub fn new(
        feed: Arc<dyn StatusFeed>,
        rules: Arc<dyn RuleSource>,
        compiler: RuleCompiler,
        backend: Arc<dyn FirewallBackend>,
    ) -> Self {
        Self {
            feed,
            rules,
            compiler,
            backend,
            state: Mutex::new(HashMap::new()),
            connected: AtomicU32::new(0),
            applied: AtomicU32::new(0),
        }
    }

    /// Connected clients seen by the last successful status read.
    #[must_use]
    pub fn connected_count(&self) -> u32 {
        self.connected.load(Ordering::Relaxed)
    }

    /// Identities whose rule group is currently installed.
    #[must_use]
    pub fn applied_count(&self) -> u32 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Run one reconciliation pass.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let clients = match self.feed.connected_clients().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Status feed unreadable; skipping tick");
                return report;
            }
        };
        self.connected
            .store(u32::try_from(clients.len()).unwrap_or(u32::MAX), Ordering::Relaxed);

        let mut sources: BTreeMap<String, BTreeSet<Ipv4Addr>> = BTreeMap::new();
        for c in clients {
            sources.entry(c.identity).or_default().insert(c.tunnel_ip);
        }

        let mut state = self.state.lock().await;

        // Disconnects first, so they proceed even if the rule fetch fails.
        // An identity back before its removal went through is converged in
        // place instead.
        for (identity, entry) in state.iter_mut() {
            let connected = sources.contains_key(identity);
            match entry.phase {
                Phase::PendingRemoval if connected => {
                    debug!(identity = %identity, "Reconnected before removal; keeping its rule group");
                    entry.phase = Phase::PendingApply;
                }
                Phase::PendingRemoval => {}
                _ if !connected => entry.phase = Phase::PendingRemoval,
                _ => {}
            }
        }
        let leaving: Vec<String> = state
            .iter()
            .filter(|(_, e)| e.phase == Phase::PendingRemoval)
            .map(|(id, _)| id.clone())
            .collect();
        for identity in leaving {
            let Some(entry) = state.get(&identity) else {
                continue;
            };
            let result = match entry.applied {
                Some(ref applied) => self.backend.remove(&entry.key, applied).await,
                None => Ok(()),
            };
            match result {
                Ok(()) => {
                    state.remove(&identity);
                    report.removed += 1;
                    info!(identity = %identity, "Removed firewall rules for disconnected identity");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(identity = %identity, error = %e, "Rule removal failed; retrying next tick");
                }
            }
        }

        if !sources.is_empty() {
            let identities: Vec<String> = sources.keys().cloned().collect();
            match self.rules.fetch_rules(&identities).await {
                Ok(mut fetched) => {
                    for (identity, ips) in sources {
                        let rules = fetched.remove(&identity).unwrap_or_default();
                        let desired = self.compiler.compile(ips, &rules).await;
                        self.converge(&mut state, identity, desired, &mut report).await;
                    }
                }
                Err(e) => {
                    report.fetch_failed = true;
                    warn!(error = %e, identities = identities.len(), "Rule fetch failed; retrying next tick");
                }
            }
        }

        let applied = state.values().filter(|e| e.applied.is_some()).count();
        self.applied
            .store(u32::try_from(applied).unwrap_or(u32::MAX), Ordering::Relaxed);

        if report.applied == 0 && report.removed == 0 && report.failed == 0 {
            debug!(unchanged = report.unchanged, "Firewall reconcile: no changes");
        }
        report
    }

    async fn converge(
        &self,
        state: &mut HashMap<String, IdentityState>,
        identity: String,
        desired: CompiledRuleSet,
        report: &mut TickReport,
    ) {
        let entry = state.entry(identity.clone()).or_insert_with(|| IdentityState {
            key: TrackingKey::for_identity(&identity),
            phase: Phase::PendingApply,
            applied: None,
        });

        if entry.applied.as_ref() == Some(&desired) {
            entry.phase = Phase::Applied;
            report.unchanged += 1;
            return;
        }

        entry.phase = Phase::PendingApply;
        match self
            .backend
            .apply(&entry.key, entry.applied.as_ref(), &desired)
            .await
        {
            Ok(()) => {
                info!(
                    identity = %identity,
                    chain = %entry.key.chain_name(),
                    entries = desired.entries.len(),
                    "Applied firewall rules"
                );
                entry.applied = Some(desired);
                entry.phase = Phase::Applied;
                report.applied += 1;
            }
            Err(e) => {
                report.failed += 1;
                warn!(identity = %identity, error = %e, "Rule apply failed; retrying next tick");
            }
        }
    }

    /// Best-effort removal of every installed rule group. Failures are logged.
    pub async fn shutdown_cleanup(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        for (identity, entry) in state.drain() {
            let Some(applied) = entry.applied else {
                continue;
            };
            match self.backend.remove(&entry.key, &applied).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(identity = %identity, error = %e, "Rule removal at shutdown failed");
                }
            }
        }
        self.applied.store(0, Ordering::Relaxed);
        info!(removed, "Firewall rules removed at shutdown");
        removed
    }
}

/// Run the reconciler every `interval` until shutdown, then clean up.
pub fn spawn_reconciler(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    reconciler.tick().await;
                }
                _ = shutdown.recv() => {
                    debug!("Firewall reconciler shutting down");
                    break;
                }
            }
        }
        reconciler.shutdown_cleanup().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::tunnel::ConnectedClient;
    use pretty_assertions::assert_eq;
    use ztgate_proto::{PortRange, Protocol, RuleType};

    // ── Fakes ───────────────────────────────────────────────────────────

    #[derive(Default)]
    struct FakeFeed {
        clients: parking_lot::Mutex<Vec<ConnectedClient>>,
    }

    impl FakeFeed {
        fn set(&self, ids: &[(&str, [u8; 4])]) {
            *self.clients.lock() = ids
                .iter()
                .map(|(id, ip)| ConnectedClient {
                    identity: (*id).to_string(),
                    tunnel_ip: Ipv4Addr::from(*ip),
                    real_ip: None,
                })
                .collect();
        }
    }

    #[async_trait]
    impl StatusFeed for FakeFeed {
        async fn connected_clients(&self) -> Result<Vec<ConnectedClient>> {
            Ok(self.clients.lock().clone())
        }
    }

    #[derive(Default)]
    struct FakeRules {
        rules: parking_lot::Mutex<BTreeMap<String, Vec<AccessRule>>>,
        fail: parking_lot::Mutex<bool>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RuleSource for FakeRules {
        async fn fetch_rules(&self, identities: &[String]) -> Result<BTreeMap<String, Vec<AccessRule>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock() {
                return Err(Error::ControlPlane("unreachable".into()));
            }
            let all = self.rules.lock();
            Ok(identities
                .iter()
                .filter_map(|id| all.get(id).map(|r| (id.clone(), r.clone())))
                .collect())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Apply(String, usize),
        Remove(String),
    }

    #[derive(Default)]
    struct RecordingBackend {
        calls: parking_lot::Mutex<Vec<Call>>,
        failing_chains: parking_lot::Mutex<BTreeSet<String>>,
    }

    impl RecordingBackend {
        fn take(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    #[async_trait]
    impl FirewallBackend for RecordingBackend {
        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn apply(
            &self,
            key: &TrackingKey,
            _previous: Option<&CompiledRuleSet>,
            desired: &CompiledRuleSet,
        ) -> Result<()> {
            let chain = key.chain_name();
            self.calls.lock().push(Call::Apply(chain.clone(), desired.entries.len()));
            if self.failing_chains.lock().contains(&chain) {
                return Err(Error::Firewall("nft exploded".into()));
            }
            Ok(())
        }

        async fn remove(&self, key: &TrackingKey, _applied: &CompiledRuleSet) -> Result<()> {
            let chain = key.chain_name();
            self.calls.lock().push(Call::Remove(chain.clone()));
            if self.failing_chains.lock().contains(&chain) {
                return Err(Error::Firewall("nft exploded".into()));
            }
            Ok(())
        }
    }

    struct NoDns;

    #[async_trait]
    impl HostResolver for NoDns {
        async fn resolve_v4(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
            Err(Error::NotFound(host.to_string()))
        }
    }

    struct Harness {
        feed: Arc<FakeFeed>,
        rules: Arc<FakeRules>,
        backend: Arc<RecordingBackend>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let feed = Arc::new(FakeFeed::default());
        let rules = Arc::new(FakeRules::default());
        let backend = Arc::new(RecordingBackend::default());
        let reconciler = Reconciler::new(
            Arc::clone(&feed) as Arc<dyn StatusFeed>,
            Arc::clone(&rules) as Arc<dyn RuleSource>,
            RuleCompiler::new(Arc::new(NoDns), Duration::from_millis(20)),
            Arc::clone(&backend) as Arc<dyn FirewallBackend>,
        );
        Harness { feed, rules, backend, reconciler }
    }

    fn cidr(value: &str) -> AccessRule {
        AccessRule {
            id: format!("r-{value}"),
            rule_type: RuleType::Cidr,
            value: value.to_string(),
            port_range: PortRange::Any,
            protocol: Protocol::Any,
            network: None,
            active: true,
        }
    }

    fn chain(identity: &str) -> String {
        TrackingKey::for_identity(identity).chain_name()
    }

    // ── Tracking key ────────────────────────────────────────────────────

    #[test]
    fn tracking_key_is_deterministic_and_distinct() {
        assert_eq!(TrackingKey::for_identity("alice"), TrackingKey::for_identity("alice"));
        assert_ne!(TrackingKey::for_identity("alice"), TrackingKey::for_identity("bob"));
        assert_eq!(TrackingKey::for_identity("alice").uuid().get_version_num(), 5);
        let name = chain("alice");
        assert!(name.starts_with("zt_"));
        assert_eq!(name.len(), 15);
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    #[tokio::test]
    async fn unchanged_tick_makes_zero_backend_calls() {
        // GIVEN: alice connected with one rule, applied once
        let h = harness();
        h.feed.set(&[("alice", [10, 8, 0, 6])]);
        h.rules.rules.lock().insert("alice".into(), vec![cidr("10.0.0.0/24")]);
        let first = h.reconciler.tick().await;
        assert_eq!(first.applied, 1);
        assert_eq!(h.backend.take(), vec![Call::Apply(chain("alice"), 1)]);

        // WHEN: ticking again with nothing changed
        let second = h.reconciler.tick().await;

        // THEN: no backend mutation at all
        assert_eq!(second.unchanged, 1);
        assert!(h.backend.take().is_empty());
        assert_eq!(h.reconciler.applied_count(), 1);
    }

    #[tokio::test]
    async fn rule_change_swaps_chain() {
        let h = harness();
        h.feed.set(&[("alice", [10, 8, 0, 6])]);
        h.rules.rules.lock().insert("alice".into(), vec![cidr("10.0.0.0/24")]);
        h.reconciler.tick().await;
        h.backend.take();

        h.rules
            .rules
            .lock()
            .insert("alice".into(), vec![cidr("10.0.0.0/24"), cidr("10.0.9.0/24")]);
        h.reconciler.tick().await;

        assert_eq!(h.backend.take(), vec![Call::Apply(chain("alice"), 2)]);
    }

    #[tokio::test]
    async fn tunnel_ip_change_reapplies() {
        let h = harness();
        h.rules.rules.lock().insert("alice".into(), vec![cidr("10.0.0.0/24")]);
        h.feed.set(&[("alice", [10, 8, 0, 6])]);
        h.reconciler.tick().await;
        h.backend.take();

        h.feed.set(&[("alice", [10, 8, 0, 7])]);
        let report = h.reconciler.tick().await;

        assert_eq!(report.applied, 1);
    }

    #[tokio::test]
    async fn disconnect_removes_rule_group_within_one_tick() {
        // GIVEN: alice applied
        let h = harness();
        h.feed.set(&[("alice", [10, 8, 0, 6])]);
        h.rules.rules.lock().insert("alice".into(), vec![cidr("10.0.0.0/24")]);
        h.reconciler.tick().await;
        h.backend.take();

        // WHEN: she is absent from the next status poll
        h.feed.set(&[]);
        let report = h.reconciler.tick().await;

        // THEN: her group is removed and no rule fetch was needed
        assert_eq!(report.removed, 1);
        assert_eq!(h.backend.take(), vec![Call::Remove(chain("alice"))]);
        assert_eq!(h.reconciler.applied_count(), 0);
        assert_eq!(h.rules.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_rule_data_is_default_deny() {
        let h = harness();
        h.feed.set(&[("mallory", [10, 8, 0, 66])]);

        let report = h.reconciler.tick().await;

        assert_eq!(report.applied, 1);
        assert_eq!(h.backend.take(), vec![Call::Apply(chain("mallory"), 0)]);
    }

    #[tokio::test]
    async fn fetch_failure_skips_applies_but_not_removals() {
        let h = harness();
        h.feed.set(&[("alice", [10, 8, 0, 6])]);
        h.rules.rules.lock().insert("alice".into(), vec![cidr("10.0.0.0/24")]);
        h.reconciler.tick().await;
        h.backend.take();

        *h.rules.fail.lock() = true;
        h.feed.set(&[("bob", [10, 8, 0, 7])]);
        let report = h.reconciler.tick().await;

        assert!(report.fetch_failed);
        assert_eq!(h.backend.take(), vec![Call::Remove(chain("alice"))]);

        *h.rules.fail.lock() = false;
        let report = h.reconciler.tick().await;
        assert_eq!(report.applied, 1);
    }

    #[tokio::test]
    async fn one_identity_failing_does_not_block_others() {
        // GIVEN: the backend rejects alice's chain
        let h = harness();
        h.backend.failing_chains.lock().insert(chain("alice"));
        h.feed.set(&[("alice", [10, 8, 0, 6]), ("bob", [10, 8, 0, 7])]);

        // WHEN
        let report = h.reconciler.tick().await;

        // THEN: bob applied, alice retried on the next tick
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        h.backend.take();

        h.backend.failing_chains.lock().clear();
        let retry = h.reconciler.tick().await;
        assert_eq!(retry.applied, 1);
        assert_eq!(retry.unchanged, 1);
        assert_eq!(h.backend.take(), vec![Call::Apply(chain("alice"), 0)]);
    }

    #[tokio::test]
    async fn failed_removal_is_retried() {
        let h = harness();
        h.feed.set(&[("alice", [10, 8, 0, 6])]);
        h.reconciler.tick().await;
        h.backend.failing_chains.lock().insert(chain("alice"));
        h.feed.set(&[]);

        assert_eq!(h.reconciler.tick().await.failed, 1);

        h.backend.failing_chains.lock().clear();
        h.backend.take();
        assert_eq!(h.reconciler.tick().await.removed, 1);
        assert_eq!(h.backend.take(), vec![Call::Remove(chain("alice"))]);
    }

    #[tokio::test]
    async fn reconnect_before_failed_removal_keeps_rule_group() {
        // GIVEN: alice applied, then her removal fails after a disconnect
        let h = harness();
        h.rules.rules.lock().insert("alice".into(), vec![cidr("10.1.0.0/16")]);
        h.feed.set(&[("alice", [10, 8, 0, 6])]);
        h.reconciler.tick().await;
        h.backend.failing_chains.lock().insert(chain("alice"));
        h.feed.set(&[]);
        assert_eq!(h.reconciler.tick().await.failed, 1);
        h.backend.failing_chains.lock().clear();
        h.backend.take();

        // WHEN: she is back on the same address before the retry
        h.feed.set(&[("alice", [10, 8, 0, 6])]);
        let report = h.reconciler.tick().await;

        // THEN: nothing is torn down or reinstalled
        assert_eq!(report.removed, 0);
        assert_eq!(report.unchanged, 1);
        assert!(h.backend.take().is_empty());
        assert_eq!(h.reconciler.applied_count(), 1);

        // AND: after another failed removal, coming back on a new address is
        // one in-place apply
        h.backend.failing_chains.lock().insert(chain("alice"));
        h.feed.set(&[]);
        assert_eq!(h.reconciler.tick().await.failed, 1);
        h.backend.failing_chains.lock().clear();
        h.backend.take();

        h.feed.set(&[("alice", [10, 8, 0, 7])]);
        let report = h.reconciler.tick().await;
        assert_eq!(report.applied, 1);
        assert_eq!(h.backend.take(), vec![Call::Apply(chain("alice"), 1)]);
    }

    #[tokio::test]
    async fn never_applied_identity_leaves_without_backend_call() {
        let h = harness();
        h.backend.failing_chains.lock().insert(chain("alice"));
        h.feed.set(&[("alice", [10, 8, 0, 6])]);
        h.reconciler.tick().await;
        h.backend.take();

        h.feed.set(&[]);
        let report = h.reconciler.tick().await;

        assert_eq!(report.removed, 1);
        assert!(h.backend.take().is_empty());
    }

    #[tokio::test]
    async fn shutdown_cleanup_removes_everything_applied() {
        let h = harness();
        h.feed.set(&[("alice", [10, 8, 0, 6]), ("bob", [10, 8, 0, 7])]);
        h.reconciler.tick().await;
        h.backend.take();

        let removed = h.reconciler.shutdown_cleanup().await;

        assert_eq!(removed, 2);
        assert_eq!(h.backend.take().len(), 2);
        assert_eq!(h.reconciler.applied_count(), 0);
    }

    #[tokio::test]
    async fn spawned_loop_cleans_up_on_shutdown() {
        let h = harness();
        h.feed.set(&[("alice", [10, 8, 0, 6])]);
        let backend = Arc::clone(&h.backend);
        let reconciler = Arc::new(h.reconciler);
        let (tx, rx) = broadcast::channel(1);

        let handle = spawn_reconciler(Arc::clone(&reconciler), Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        let calls = backend.take();
        assert!(calls.contains(&Call::Apply(chain("alice"), 0)));
        assert_eq!(calls.last(), Some(&Call::Remove(chain("alice"))));
    }
}

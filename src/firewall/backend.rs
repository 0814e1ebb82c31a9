//! Packet-filter backends.
//!
//! # nftables layout
//!
//! ```text
//! table inet ztgate {
//!     map sources { type ipv4_addr : verdict }     # tunnel ip -> jump zt_<key>
//!     chain forward {
//!         type filter hook forward priority 0; policy accept;
//!         ct state established,related accept
//!         iifname "tun*" ip saddr vmap @sources
//!         iifname "tun*" drop
//!     }
//!     chain zt_3f2a9c01d4e7 { ip daddr 10.0.1.0/24 tcp dport 443 accept }
//! }
//! ```
//!
//! Traffic from a tunnel address with no map element, or that falls off the
//! end of its identity chain, hits the final drop. Every mutation is one
//! `nft -f` transaction, so an identity never passes through a state with its
//! chain half written.

use std::fmt::Write as _;

use async_trait::async_trait;
use tracing::{debug, info};

use super::TrackingKey;
use super::compile::CompiledRuleSet;
use crate::exec;
use crate::{Error, Result};

/// Where compiled rule sets end up.
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Create the base table and chains from scratch, dropping anything a
    /// previous run left behind.
    async fn init(&self) -> Result<()>;

    /// Atomically replace the identity's chain contents and source mapping.
    /// `previous` is what the last successful apply installed.
    async fn apply(
        &self,
        key: &TrackingKey,
        previous: Option<&CompiledRuleSet>,
        desired: &CompiledRuleSet,
    ) -> Result<()>;

    /// Remove the identity's chain and source mapping.
    async fn remove(&self, key: &TrackingKey, applied: &CompiledRuleSet) -> Result<()>;
}

/// nftables backend driving the `nft` binary.
pub struct NftBackend {
    binary: String,
    table: String,
    interface_glob: String,
}

impl NftBackend {
    /// Backend owning `inet <table>`, filtering traffic from `tun*`.
    #[must_use]
    pub fn new(binary: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            table: table.into(),
            interface_glob: "tun*".to_string(),
        }
    }

    /// Base table script.
    #[must_use]
    pub fn init_script(&self) -> String {
        let t = &self.table;
        let i = &self.interface_glob;
        let mut s = String::new();
        // add-then-delete succeeds whether or not the table exists
        let _ = writeln!(s, "add table inet {t}");
        let _ = writeln!(s, "delete table inet {t}");
        let _ = writeln!(s, "add table inet {t}");
        let _ = writeln!(s, "add map inet {t} sources {{ type ipv4_addr : verdict; }}");
        let _ = writeln!(
            s,
            "add chain inet {t} forward {{ type filter hook forward priority 0; policy accept; }}"
        );
        let _ = writeln!(s, "add rule inet {t} forward ct state established,related accept");
        let _ = writeln!(s, "add rule inet {t} forward iifname \"{i}\" ip saddr vmap @sources");
        let _ = writeln!(s, "add rule inet {t} forward iifname \"{i}\" drop");
        s
    }

    /// Apply script for one identity.
    #[must_use]
    pub fn apply_script(
        &self,
        key: &TrackingKey,
        previous: Option<&CompiledRuleSet>,
        desired: &CompiledRuleSet,
    ) -> String {
        let t = &self.table;
        let chain = key.chain_name();
        let mut s = String::new();
        let _ = writeln!(s, "add chain inet {t} {chain}");
        let _ = writeln!(s, "flush chain inet {t} {chain}");
        for entry in &desired.entries {
            let _ = writeln!(s, "add rule inet {t} {chain} {entry}");
        }
        if let Some(prev) = previous {
            for ip in &prev.sources {
                let _ = writeln!(s, "delete element inet {t} sources {{ {ip} : jump {chain} }}");
            }
        }
        for ip in &desired.sources {
            let _ = writeln!(s, "add element inet {t} sources {{ {ip} : jump {chain} }}");
        }
        s
    }

    /// Removal script for one identity.
    #[must_use]
    pub fn remove_script(&self, key: &TrackingKey, applied: &CompiledRuleSet) -> String {
        let t = &self.table;
        let chain = key.chain_name();
        let mut s = String::new();
        for ip in &applied.sources {
            let _ = writeln!(s, "delete element inet {t} sources {{ {ip} : jump {chain} }}");
        }
        let _ = writeln!(s, "flush chain inet {t} {chain}");
        let _ = writeln!(s, "delete chain inet {t} {chain}");
        s
    }

    async fn run_batch(&self, script: &str) -> Result<()> {
        debug!(table = %self.table, script = %script, "nft batch");
        let out = exec::run(&self.binary, &["-f", "-"], Some(script)).await?;
        if out.success {
            Ok(())
        } else {
            Err(Error::Firewall(format!("nft -f failed: {}", out.stderr)))
        }
    }
}

#[async_trait]
impl FirewallBackend for NftBackend {
    async fn init(&self) -> Result<()> {
        self.run_batch(&self.init_script()).await?;
        info!(table = %self.table, "Firewall base table installed");
        Ok(())
    }

    async fn apply(
        &self,
        key: &TrackingKey,
        previous: Option<&CompiledRuleSet>,
        desired: &CompiledRuleSet,
    ) -> Result<()> {
        self.run_batch(&self.apply_script(key, previous, desired)).await
    }

    async fn remove(&self, key: &TrackingKey, applied: &CompiledRuleSet) -> Result<()> {
        self.run_batch(&self.remove_script(key, applied)).await
    }
}

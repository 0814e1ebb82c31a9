//! Access rules → low-level filter entries.
//!
//! Compilation happens on the enforcement point at apply time, so host names
//! track their current addresses. Every failure path yields fewer entries,
//! never more.
//!
//! A `hostname_wildcard` rule such as `*.corp.example` resolves its apex
//! (`corp.example`) only. DNS cannot enumerate subdomains, so hosts under the
//! apex with addresses of their own are not covered and need rules of their
//! own.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use tracing::warn;
use ztgate_proto::{AccessRule, PortRange, Protocol, RuleType};

use super::resolve::HostResolver;

/// One permit entry: destination, protocol, ports.
///
/// `protocol == Any` always carries `ports == Any`; port-restricted rules on
/// any protocol compile into one TCP and one UDP entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FilterEntry {
    /// Destination network (`/32` for single hosts)
    pub destination: Ipv4Net,
    /// Transport protocol
    pub protocol: Protocol,
    /// Destination ports
    pub ports: PortRange,
}

impl fmt::Display for FilterEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ip daddr {}", self.destination)?;
        match (self.protocol, self.ports) {
            (Protocol::Any, _) => {}
            (proto, PortRange::Any) => write!(f, " meta l4proto {}", l4(proto))?,
            (proto, PortRange::Range { start, end }) if start == end => {
                write!(f, " {} dport {start}", l4(proto))?;
            }
            (proto, PortRange::Range { start, end }) => {
                write!(f, " {} dport {start}-{end}", l4(proto))?;
            }
        }
        f.write_str(" accept")
    }
}

fn l4(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
        Protocol::Any => "",
    }
}

/// Compiled state of one identity: where its traffic comes from and what it
/// may reach. Structural equality decides whether a re-apply is needed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledRuleSet {
    /// Tunnel addresses of the identity's sessions
    pub sources: BTreeSet<Ipv4Addr>,
    /// Permit entries; empty means default deny
    pub entries: BTreeSet<FilterEntry>,
}

/// Compiles rules, resolving host names with a per-rule timeout.
#[derive(Clone)]
pub struct RuleCompiler {
    resolver: Arc<dyn HostResolver>,
    timeout: Duration,
}

impl RuleCompiler {
    /// Compiler resolving through `resolver`, giving each lookup `timeout`.
    #[must_use]
    pub fn new(resolver: Arc<dyn HostResolver>, timeout: Duration) -> Self {
        Self { resolver, timeout }
    }

    /// Compile `rules` for traffic from `sources`.
    pub async fn compile(
        &self,
        sources: BTreeSet<Ipv4Addr>,
        rules: &[AccessRule],
    ) -> CompiledRuleSet {
        let mut entries = BTreeSet::new();
        for rule in rules.iter().filter(|r| r.active) {
            for destination in self.destinations(rule).await {
                push_entries(&mut entries, destination, rule.protocol, rule.port_range);
            }
        }
        CompiledRuleSet { sources, entries }
    }

    async fn destinations(&self, rule: &AccessRule) -> Vec<Ipv4Net> {
        match rule.rule_type {
            RuleType::Ip => match rule.value.parse::<Ipv4Addr>() {
                Ok(ip) => vec![Ipv4Net::from(ip)],
                Err(_) => {
                    warn!(rule = %rule.id, value = %rule.value, "Invalid IP rule ignored");
                    Vec::new()
                }
            },
            RuleType::Cidr => match rule.value.parse::<Ipv4Net>() {
                Ok(net) => vec![net.trunc()],
                Err(_) => {
                    warn!(rule = %rule.id, value = %rule.value, "Invalid CIDR rule ignored");
                    Vec::new()
                }
            },
            RuleType::Hostname => self.resolve(rule, &rule.value).await,
            RuleType::HostnameWildcard => {
                // apex only; see the module docs
                let apex = rule.value.trim_start_matches("*.");
                self.resolve(rule, apex).await
            }
        }
    }

    async fn resolve(&self, rule: &AccessRule, host: &str) -> Vec<Ipv4Net> {
        match tokio::time::timeout(self.timeout, self.resolver.resolve_v4(host)).await {
            Ok(Ok(addrs)) => addrs.into_iter().map(Ipv4Net::from).collect(),
            Ok(Err(e)) => {
                warn!(rule = %rule.id, host = %host, error = %e, "Host resolution failed; rule grants nothing");
                Vec::new()
            }
            Err(_) => {
                warn!(rule = %rule.id, host = %host, timeout = ?self.timeout, "Host resolution timed out; rule grants nothing");
                Vec::new()
            }
        }
    }
}

fn push_entries(
    entries: &mut BTreeSet<FilterEntry>,
    destination: Ipv4Net,
    protocol: Protocol,
    ports: PortRange,
) {
    match (protocol, ports) {
        (Protocol::Any, PortRange::Range { .. }) => {
            for proto in [Protocol::Tcp, Protocol::Udp] {
                entries.insert(FilterEntry { destination, protocol: proto, ports });
            }
        }
        _ => {
            entries.insert(FilterEntry { destination, protocol, ports });
        }
    }
}

//! Access rules → tunnel push directives.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::warn;
use ztgate_proto::{AccessRule, RuleType};

use crate::enforcement::DEFAULT_DNS;

/// One client-side routing or DNS directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RouteDirective {
    /// Send all client traffic through the tunnel
    RedirectGateway,
    /// Route one network through the tunnel
    Route {
        /// Network address
        network: Ipv4Addr,
        /// Netmask
        mask: Ipv4Addr,
    },
    /// DNS server for the client
    Dns {
        /// Server address
        server: Ipv4Addr,
    },
}

impl RouteDirective {
    /// Client configuration line (`route ...`, `dhcp-option DNS ...`).
    #[must_use]
    pub fn client_line(&self) -> String {
        self.to_string()
    }

    /// Server-side `push "..."` line.
    #[must_use]
    pub fn push_line(&self) -> String {
        format!("push \"{self}\"")
    }
}

impl fmt::Display for RouteDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RedirectGateway => f.write_str("redirect-gateway def1 bypass-dhcp"),
            Self::Route { network, mask } => write!(f, "route {network} {mask}"),
            Self::Dns { server } => write!(f, "dhcp-option DNS {server}"),
        }
    }
}

/// Compile effective rules into route and DNS directives.
///
/// Full tunnel emits one redirect and no per-rule routes. Split tunnel emits a
/// network route per CIDR rule and a host route per IP rule. Host name rules
/// never become routes. Values that do not parse are skipped with a warning.
#[must_use]
pub fn compile_routes(
    rules: &[AccessRule],
    full_tunnel: bool,
    push_dns: bool,
    dns_servers: &[Ipv4Addr],
) -> Vec<RouteDirective> {
    let mut out = Vec::new();

    if full_tunnel {
        out.push(RouteDirective::RedirectGateway);
    } else {
        let mut seen = std::collections::BTreeSet::new();
        for rule in rules {
            let net = match rule.rule_type {
                RuleType::Cidr => rule.value.parse::<Ipv4Net>().map(|n| n.trunc()).ok(),
                RuleType::Ip => rule
                    .value
                    .parse::<Ipv4Addr>()
                    .ok()
                    .and_then(|ip| Ipv4Net::new(ip, 32).ok()),
                RuleType::Hostname | RuleType::HostnameWildcard => continue,
            };
            let Some(net) = net else {
                warn!(rule = %rule.id, value = %rule.value, "Skipping rule with unparsable address");
                continue;
            };
            if seen.insert(net) {
                out.push(RouteDirective::Route {
                    network: net.network(),
                    mask: net.netmask(),
                });
            }
        }
    }

    if push_dns {
        let servers = if dns_servers.is_empty() {
            &DEFAULT_DNS[..]
        } else {
            dns_servers
        };
        out.extend(servers.iter().map(|&server| RouteDirective::Dns { server }));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ztgate_proto::{PortRange, Protocol};

    fn rule(rule_type: RuleType, value: &str) -> AccessRule {
        AccessRule {
            id: format!("r-{value}"),
            rule_type,
            value: value.to_string(),
            port_range: PortRange::Any,
            protocol: Protocol::Any,
            network: None,
            active: true,
        }
    }

    fn rules() -> Vec<AccessRule> {
        vec![
            rule(RuleType::Cidr, "10.0.1.0/24"),
            rule(RuleType::Ip, "10.0.2.15"),
            rule(RuleType::Hostname, "wiki.corp.example"),
            rule(RuleType::HostnameWildcard, "*.corp.example"),
        ]
    }

    #[test]
    fn split_tunnel_routes_cidr_and_host_but_not_names() {
        let out = compile_routes(&rules(), false, false, &[]);
        assert_eq!(
            out,
            vec![
                RouteDirective::Route {
                    network: Ipv4Addr::new(10, 0, 1, 0),
                    mask: Ipv4Addr::new(255, 255, 255, 0),
                },
                RouteDirective::Route {
                    network: Ipv4Addr::new(10, 0, 2, 15),
                    mask: Ipv4Addr::new(255, 255, 255, 255),
                },
            ]
        );
    }

    #[test]
    fn full_tunnel_emits_single_redirect() {
        let out = compile_routes(&rules(), true, false, &[]);
        assert_eq!(out, vec![RouteDirective::RedirectGateway]);
    }

    #[test]
    fn push_dns_without_servers_uses_default_pair() {
        let out = compile_routes(&[], false, true, &[]);
        assert_eq!(
            out,
            vec![
                RouteDirective::Dns { server: Ipv4Addr::new(1, 1, 1, 1) },
                RouteDirective::Dns { server: Ipv4Addr::new(8, 8, 8, 8) },
            ]
        );
    }

    #[test]
    fn configured_dns_is_pushed_as_is() {
        let dns = [Ipv4Addr::new(10, 0, 0, 53)];
        let out = compile_routes(&[], true, true, &dns);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].push_line(), "push \"dhcp-option DNS 10.0.0.53\"");
    }

    #[test]
    fn host_bits_truncated_and_duplicates_collapsed() {
        let rules = vec![
            rule(RuleType::Cidr, "10.0.1.7/24"),
            rule(RuleType::Cidr, "10.0.1.0/24"),
            rule(RuleType::Cidr, "not-a-cidr"),
        ];
        let out = compile_routes(&rules, false, false, &[]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].push_line(), "push \"route 10.0.1.0 255.255.255.0\"");
    }
}

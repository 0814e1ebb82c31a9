//! Wire types exchanged between the ztgate control plane and its enforcement
//! agents.
//!
//! Every request carries the agent token in its body; the control plane maps
//! the token to exactly one enforcement point.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Access rules
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of destination an [`AccessRule`] grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// A single IPv4 address.
    Ip,
    /// An IPv4 network in CIDR notation.
    Cidr,
    /// A fully-qualified host name, resolved by the enforcement point.
    Hostname,
    /// `*.example.com`; the enforcement point resolves the apex name.
    HostnameWildcard,
}

/// Transport protocol matched by a rule. `*` matches any protocol.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Protocol {
    /// TCP only
    #[serde(rename = "tcp")]
    Tcp,
    /// UDP only
    #[serde(rename = "udp")]
    Udp,
    /// Any protocol
    #[default]
    #[serde(rename = "*")]
    Any,
}

/// Destination port constraint, serialized as `"*"`, `"443"` or `"8000-8100"`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(try_from = "String", into = "String")]
pub enum PortRange {
    /// Every port
    #[default]
    Any,
    /// Inclusive range; `start == end` for a single port.
    Range {
        /// First port
        start: u16,
        /// Last port (inclusive)
        end: u16,
    },
}

impl PortRange {
    /// A single port.
    #[must_use]
    pub fn single(port: u16) -> Self {
        Self::Range {
            start: port,
            end: port,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Range { start, end } if start == end => write!(f, "{start}"),
            Self::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

impl TryFrom<String> for PortRange {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value.is_empty() || value == "*" {
            return Ok(Self::Any);
        }
        let parse = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid port '{s}': {e}"))
        };
        let (start, end) = match value.split_once('-') {
            Some((a, b)) => (parse(a)?, parse(b)?),
            None => {
                let p = parse(value)?;
                (p, p)
            }
        };
        if start == 0 || start > end {
            return Err(format!("invalid port range '{value}'"));
        }
        Ok(Self::Range { start, end })
    }
}

impl From<PortRange> for String {
    fn from(value: PortRange) -> Self {
        value.to_string()
    }
}

/// A permit rule. Rules are immutable values; there is no deny rule type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessRule {
    /// Rule identifier
    pub id: String,
    /// Destination kind
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    /// Address, CIDR or host name depending on `rule_type`
    pub value: String,
    /// Destination ports
    #[serde(default)]
    pub port_range: PortRange,
    /// Transport protocol
    #[serde(default)]
    pub protocol: Protocol,
    /// Network the rule is scoped to; `None` means unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Inactive rules stay assigned but grant nothing.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl AccessRule {
    /// Identity of the rule for set semantics: `(type, value, ports, protocol)`.
    ///
    /// Two rules with different ids but the same key grant the same access.
    #[must_use]
    pub fn dedup_key(&self) -> (RuleType, &str, PortRange, Protocol) {
        (self.rule_type, self.value.as_str(), self.port_range, self.protocol)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Enforcement point settings
// ─────────────────────────────────────────────────────────────────────────────

/// Named cipher bundle selectable per enforcement point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CryptoProfile {
    /// AEAD ciphers, TLS 1.2+ ECDHE suites
    #[default]
    Modern,
    /// FIPS 140 approved subset
    Fips,
    /// Modern plus legacy CBC ciphers for old clients
    Compatible,
}

impl CryptoProfile {
    /// Stable string form, used for hashing and rendering.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Modern => "modern",
            Self::Fips => "fips",
            Self::Compatible => "compatible",
        }
    }
}

/// Tunnel transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VpnProtocol {
    /// UDP
    #[default]
    Udp,
    /// TCP
    Tcp,
}

impl VpnProtocol {
    /// Stable string form, used for hashing and rendering.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Heartbeat
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness counters reported by an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveCounts {
    /// Connected tunnel clients
    pub clients: u32,
    /// Identities with an applied firewall chain
    pub applied_identities: u32,
}

/// Agent → control plane heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Agent token
    pub token: String,
    /// Free-form status (`"running"`, `"provisioning"`, ...)
    pub status: String,
    /// Liveness counters
    #[serde(default)]
    pub live_counts: LiveCounts,
    /// Last persisted config version; empty when never provisioned.
    #[serde(default)]
    pub config_version: String,
}

/// Control plane → agent heartbeat answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// Heartbeat accepted
    pub ok: bool,
    /// The agent's version differs from the canonical one
    pub needs_reprovision: bool,
    /// Canonical version for this enforcement point
    pub config_version: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Provisioning
// ─────────────────────────────────────────────────────────────────────────────

/// Agent → control plane provision request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// Agent token
    pub token: String,
}

/// Everything an agent needs to (re)build its tunnel daemon configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProvisionResponse {
    /// PEM trust bundle: every CA that still verifies, active first
    pub ca_cert: String,
    /// PEM server certificate
    pub server_cert: String,
    /// PEM server private key
    pub server_key: String,
    /// PEM DH parameters; `None` selects ECDH-only (`dh none`)
    #[serde(default)]
    pub dh_params: Option<String>,
    /// TLS-auth HMAC firewall enabled
    pub tls_auth_enabled: bool,
    /// Static TLS-auth key, present when enabled
    #[serde(default)]
    pub tls_auth_key: Option<String>,
    /// Listening port
    pub vpn_port: u16,
    /// Listening protocol
    pub vpn_protocol: VpnProtocol,
    /// Client address pool, CIDR
    pub vpn_subnet: String,
    /// Cipher bundle
    pub crypto_profile: CryptoProfile,
    /// Version these settings hash to
    pub config_version: String,
}

impl fmt::Debug for ProvisionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionResponse")
            .field("vpn_port", &self.vpn_port)
            .field("vpn_protocol", &self.vpn_protocol)
            .field("vpn_subnet", &self.vpn_subnet)
            .field("crypto_profile", &self.crypto_profile)
            .field("tls_auth_enabled", &self.tls_auth_enabled)
            .field("config_version", &self.config_version)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rule fetch
// ─────────────────────────────────────────────────────────────────────────────

/// Batched rule fetch for every identity connected to an enforcement point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFetchRequest {
    /// Agent token
    pub token: String,
    /// Connected identities
    pub identities: Vec<String>,
}

/// Effective rules per identity. Identities unknown to the control plane are
/// absent, which agents treat as an empty rule set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFetchResponse {
    /// identity → effective rules
    pub rules: BTreeMap<String, Vec<AccessRule>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Mesh
// ─────────────────────────────────────────────────────────────────────────────

/// Hub → control plane spoke feed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpokeFeedRequest {
    /// Hub agent token
    pub token: String,
}

/// Reachability of one spoke behind a hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpokeInfo {
    /// Spoke identity (certificate common name)
    pub id: String,
    /// Static tunnel address; spokes without one are skipped by the hub.
    #[serde(default)]
    pub tunnel_ip: Option<Ipv4Addr>,
    /// Networks the spoke advertises, CIDR
    #[serde(default)]
    pub local_networks: Vec<String>,
    /// Netmask of the hub's tunnel subnet
    pub netmask: Ipv4Addr,
}

/// Spokes of one hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpokeFeedResponse {
    /// Spokes owned by the hub
    pub spokes: Vec<SpokeInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_parses_forms() {
        assert_eq!(PortRange::try_from("*".to_string()), Ok(PortRange::Any));
        assert_eq!(PortRange::try_from(String::new()), Ok(PortRange::Any));
        assert_eq!(
            PortRange::try_from("443".to_string()),
            Ok(PortRange::single(443))
        );
        assert_eq!(
            PortRange::try_from("8000-8100".to_string()),
            Ok(PortRange::Range {
                start: 8000,
                end: 8100
            })
        );
    }

    #[test]
    fn port_range_rejects_inverted_and_zero() {
        assert!(PortRange::try_from("9000-80".to_string()).is_err());
        assert!(PortRange::try_from("0".to_string()).is_err());
        assert!(PortRange::try_from("http".to_string()).is_err());
    }

    #[test]
    fn access_rule_json_shape() {
        let json = r#"{"id":"r1","type":"hostname_wildcard","value":"*.corp.example","port_range":"443","protocol":"tcp"}"#;
        let rule: AccessRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.rule_type, RuleType::HostnameWildcard);
        assert_eq!(rule.port_range, PortRange::single(443));
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert!(rule.network.is_none());

        let back = serde_json::to_value(&rule).unwrap();
        assert_eq!(back["type"], "hostname_wildcard");
        assert_eq!(back["port_range"], "443");
    }

    #[test]
    fn protocol_defaults_to_any() {
        let json = r#"{"id":"r1","type":"cidr","value":"10.0.0.0/24"}"#;
        let rule: AccessRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.protocol, Protocol::Any);
        assert_eq!(rule.port_range, PortRange::Any);
        assert!(rule.active);
    }

    #[test]
    fn provision_debug_hides_key_material() {
        let resp = ProvisionResponse {
            ca_cert: "CA".into(),
            server_cert: "CERT".into(),
            server_key: "SECRET-KEY".into(),
            dh_params: None,
            tls_auth_enabled: true,
            tls_auth_key: Some("SECRET-TA".into()),
            vpn_port: 1194,
            vpn_protocol: VpnProtocol::Udp,
            vpn_subnet: "10.8.0.0/24".into(),
            crypto_profile: CryptoProfile::Modern,
            config_version: "v1".into(),
        };
        let dbg = format!("{resp:?}");
        assert!(!dbg.contains("SECRET"));
        assert!(dbg.contains("10.8.0.0/24"));
    }
}

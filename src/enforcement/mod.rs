//! Enforcement points (gateways and mesh hubs) and their config version.
//!
//! The config version is a pure function of [`PointSettings`]: the control
//! plane and every agent compute it independently and compare strings in the
//! heartbeat exchange.

pub mod profile;

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ztgate_proto::{CryptoProfile, VpnProtocol};

/// DNS servers pushed when `push_dns` is on and none are configured.
pub const DEFAULT_DNS: [Ipv4Addr; 2] = [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)];

/// Role of an enforcement point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PointKind {
    /// Serves clients only
    #[default]
    Gateway,
    /// Serves clients and spokes, redistributes spoke reachability
    Hub,
}

/// Config-affecting fields of an enforcement point.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PointSettings {
    /// Cipher bundle
    pub crypto_profile: CryptoProfile,
    /// Listening port
    pub vpn_port: u16,
    /// Listening protocol
    pub vpn_protocol: VpnProtocol,
    /// Client address pool
    pub vpn_subnet: Ipv4Net,
    /// TLS-auth HMAC firewall
    pub tls_auth_enabled: bool,
    /// Static TLS-auth key (supports `env:VAR`); generated at startup when
    /// enabled and unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_auth_key: Option<String>,
    /// Route all client traffic through the tunnel
    pub full_tunnel: bool,
    /// Push DNS servers to clients
    pub push_dns: bool,
    /// DNS servers to push; empty selects [`DEFAULT_DNS`]
    pub dns_servers: Vec<Ipv4Addr>,
}

impl Default for PointSettings {
    fn default() -> Self {
        Self {
            crypto_profile: CryptoProfile::default(),
            vpn_port: 1194,
            vpn_protocol: VpnProtocol::default(),
            vpn_subnet: Ipv4Net::new_assert(Ipv4Addr::new(10, 8, 0, 0), 24),
            tls_auth_enabled: true,
            tls_auth_key: None,
            full_tunnel: false,
            push_dns: false,
            dns_servers: Vec::new(),
        }
    }
}

impl fmt::Debug for PointSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PointSettings")
            .field("crypto_profile", &self.crypto_profile)
            .field("vpn_port", &self.vpn_port)
            .field("vpn_protocol", &self.vpn_protocol)
            .field("vpn_subnet", &self.vpn_subnet)
            .field("tls_auth_enabled", &self.tls_auth_enabled)
            .field("tls_auth_key", &self.tls_auth_key.as_ref().map(|_| "<redacted>"))
            .field("full_tunnel", &self.full_tunnel)
            .field("push_dns", &self.push_dns)
            .field("dns_servers", &self.dns_servers)
            .finish()
    }
}

impl PointSettings {
    /// Deterministic version over every config-affecting field.
    ///
    /// Fields are hashed as ordered `name=value` lines; the TLS-auth key is
    /// folded in through its own digest so multi-line key text cannot shift
    /// field boundaries.
    #[must_use]
    pub fn config_version(&self) -> String {
        let key_digest = self
            .tls_auth_key
            .as_deref()
            .map(|k| hex::encode(Sha256::digest(k.trim().as_bytes())))
            .unwrap_or_default();
        let dns = self
            .dns_servers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let canonical = format!(
            "crypto_profile={}\nvpn_port={}\nvpn_protocol={}\nvpn_subnet={}\n\
             tls_auth_enabled={}\ntls_auth_key={}\nfull_tunnel={}\npush_dns={}\n\
             dns_servers={}\n",
            self.crypto_profile.as_str(),
            self.vpn_port,
            self.vpn_protocol.as_str(),
            self.vpn_subnet,
            self.tls_auth_enabled,
            key_digest,
            self.full_tunnel,
            self.push_dns,
            dns,
        );
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// DNS servers actually pushed to clients; empty when `push_dns` is off.
    #[must_use]
    pub fn effective_dns(&self) -> Vec<Ipv4Addr> {
        if !self.push_dns {
            Vec::new()
        } else if self.dns_servers.is_empty() {
            DEFAULT_DNS.to_vec()
        } else {
            self.dns_servers.clone()
        }
    }
}

/// A spoke behind a hub. Spokes live inside their hub and go with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spoke {
    /// Spoke identity (certificate common name)
    pub id: String,
    /// Owning hub
    pub hub_id: String,
    /// Networks reachable behind the spoke
    pub local_networks: Vec<Ipv4Net>,
    /// Static tunnel address; unassigned spokes get no directives
    pub tunnel_ip: Option<Ipv4Addr>,
}

/// A gateway or hub as the control plane tracks it.
#[derive(Debug, Clone)]
pub struct EnforcementPoint {
    /// Point id; also the server certificate common name
    pub id: String,
    /// Gateway or hub
    pub kind: PointKind,
    /// Host name clients dial
    pub endpoint: String,
    /// Network ids this point serves
    pub networks: Vec<String>,
    /// Config-affecting settings
    pub settings: PointSettings,
    /// Spokes (hubs only)
    pub spokes: Vec<Spoke>,
}

impl EnforcementPoint {
    /// Current config version.
    #[must_use]
    pub fn config_version(&self) -> String {
        self.settings.config_version()
    }
}

/// Generate a 2048-bit static TLS-auth key in the tunnel daemon's text format.
#[must_use]
pub fn generate_tls_auth_key() -> String {
    let mut out = String::from(
        "#\n# 2048 bit OpenVPN static key\n#\n-----BEGIN OpenVPN Static key V1-----\n",
    );
    for _ in 0..8 {
        let chunk: [u8; 32] = rand::random();
        let hex = hex::encode(chunk);
        out.push_str(&hex[..32]);
        out.push('\n');
        out.push_str(&hex[32..]);
        out.push('\n');
    }
    out.push_str("-----END OpenVPN Static key V1-----\n");
    out
}

//! Configuration management
//!
//! Two documents share the same loader: [`ControlConfig`] for the control
//! plane and [`AgentConfig`] for an enforcement agent. Both come from a YAML
//! file merged with `ZTGATE_`-prefixed environment variables (`__` separates
//! nested keys, e.g. `ZTGATE_SERVER__PORT=9443`).

use std::{env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::enforcement::{PointKind, PointSettings};
use crate::pki::KeyAlgorithm;
use crate::policy::{GroupRecord, NetworkRecord, UserRecord};
use crate::{Error, Result};
use ztgate_proto::AccessRule;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "ZTGATE_";

/// Load any config document from an optional YAML file plus environment.
///
/// # Errors
///
/// Returns an error if the file does not exist or the merged document does
/// not deserialize into `T`.
pub fn load<T: DeserializeOwned>(path: Option<&Path>) -> Result<T> {
    let mut figment = Figment::new();

    if let Some(p) = path {
        if !p.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                p.display()
            )));
        }
        figment = figment.merge(Yaml::file(p));
    }

    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    figment
        .extract()
        .map_err(|e| Error::Config(e.to_string()))
}

/// Resolve a secret value: `env:VAR_NAME` reads the variable, anything else
/// is taken literally. An unset variable resolves to `None`.
#[must_use]
pub fn resolve_secret(value: &str) -> Option<String> {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).ok()
    } else {
        Some(value.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Control plane
// ─────────────────────────────────────────────────────────────────────────────

/// Control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ControlConfig {
    /// HTTP server
    pub server: ServerConfig,
    /// Admin and session-issuer credentials
    pub admin: AdminConfig,
    /// Certificate authority settings
    pub pki: PkiConfig,
    /// Users, groups, networks and rules
    pub directory: DirectoryConfig,
    /// Gateways and hubs
    pub points: Vec<PointConfig>,
}

impl ControlConfig {
    /// Load from file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be loaded or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-reference checks that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first dangling reference.
    pub fn validate(&self) -> Result<()> {
        let network_known = |id: &str| self.directory.networks.iter().any(|n| n.id == id);
        let rule_known = |id: &str| self.directory.rules.iter().any(|r| r.id == id);

        for rule in &self.directory.rules {
            if let Some(ref net) = rule.network {
                if !network_known(net) {
                    return Err(Error::Config(format!(
                        "rule '{}' references unknown network '{net}'",
                        rule.id
                    )));
                }
            }
        }
        for user in &self.directory.users {
            if let Some(r) = user.rules.iter().find(|r| !rule_known(r)) {
                return Err(Error::Config(format!(
                    "user '{}' references unknown rule '{r}'",
                    user.id
                )));
            }
        }
        for group in &self.directory.groups {
            if let Some(r) = group.rules.iter().find(|r| !rule_known(r)) {
                return Err(Error::Config(format!(
                    "group '{}' references unknown rule '{r}'",
                    group.id
                )));
            }
        }
        for point in &self.points {
            if let Some(n) = point.networks.iter().find(|n| !network_known(n)) {
                return Err(Error::Config(format!(
                    "point '{}' references unknown network '{n}'",
                    point.id
                )));
            }
            if !point.spokes.is_empty() && point.kind != PointKind::Hub {
                return Err(Error::Config(format!(
                    "point '{}' declares spokes but is not a hub",
                    point.id
                )));
            }
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9443,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Admin API credentials
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AdminConfig {
    /// Bearer token for `/api/v1/admin/*` (supports `env:VAR`).
    /// Admin endpoints answer 503 when unset.
    pub bearer_token: Option<String>,
    /// Bearer token presented by the identity frontend when it requests a
    /// client session bundle (supports `env:VAR`).
    pub issuer_token: Option<String>,
}

/// Certificate authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiConfig {
    /// Key algorithm for CA and leaf keys
    pub key_algorithm: KeyAlgorithm,
    /// Common-name prefix for generated CAs
    pub ca_common_name: String,
    /// CA validity in days
    pub ca_validity_days: u32,
    /// Default client certificate validity
    #[serde(with = "humantime_serde")]
    pub client_validity: Duration,
    /// Enforcement point server certificate validity
    #[serde(with = "humantime_serde")]
    pub server_validity: Duration,
    /// PEM file holding the initial active CA certificate
    pub ca_cert_file: Option<PathBuf>,
    /// PEM file holding the initial active CA key
    pub ca_key_file: Option<PathBuf>,
    /// PEM DH parameters handed to enforcement points; `None` means ECDH only
    pub dh_params_file: Option<PathBuf>,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            key_algorithm: KeyAlgorithm::default(),
            ca_common_name: "ztgate Root CA".to_string(),
            ca_validity_days: 3650,
            client_validity: Duration::from_secs(12 * 3600),
            server_validity: Duration::from_secs(365 * 86_400),
            ca_cert_file: None,
            ca_key_file: None,
            dh_params_file: None,
        }
    }
}

/// Directory data the policy resolver works on
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Named address blocks
    pub networks: Vec<NetworkRecord>,
    /// Permit rules
    pub rules: Vec<AccessRule>,
    /// Users with their group memberships and direct rule assignments
    pub users: Vec<UserRecord>,
    /// Groups with their rule assignments
    pub groups: Vec<GroupRecord>,
}

/// One enforcement point as declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointConfig {
    /// Enforcement point id; also the server certificate common name
    pub id: String,
    /// Gateway or hub
    #[serde(default)]
    pub kind: PointKind,
    /// Agent token (supports `env:VAR`)
    pub token: String,
    /// Host name clients dial; defaults to the point id
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Networks this point serves
    #[serde(default)]
    pub networks: Vec<String>,
    /// Config-affecting settings
    #[serde(flatten)]
    pub settings: PointSettings,
    /// Spokes (hubs only)
    #[serde(default)]
    pub spokes: Vec<SpokeConfig>,
}

/// A spoke declared under its hub
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpokeConfig {
    /// Spoke identity (certificate common name)
    pub id: String,
    /// Static tunnel address
    #[serde(default)]
    pub tunnel_ip: Option<std::net::Ipv4Addr>,
    /// Networks behind the spoke
    #[serde(default)]
    pub local_networks: Vec<Ipv4Net>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent
// ─────────────────────────────────────────────────────────────────────────────

/// Enforcement agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Control plane base URL
    pub control_url: String,
    /// Agent token (supports `env:VAR`)
    pub token: String,
    /// Gateway or hub
    pub role: PointKind,
    /// Directory for the provisioned bundle and the version file
    pub state_dir: PathBuf,
    /// Tunnel daemon status file (version 2 format)
    pub status_file: PathBuf,
    /// HTTP timeout for control-plane calls
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    /// Heartbeat interval
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Firewall reconciliation interval
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,
    /// Mesh route distribution interval (hubs)
    #[serde(with = "humantime_serde")]
    pub mesh_interval: Duration,
    /// Per-rule hostname resolution timeout
    #[serde(with = "humantime_serde")]
    pub resolve_timeout: Duration,
    /// Reprovision loop guard
    pub reprovision: ReprovisionGuardConfig,
    /// Packet filter settings
    pub firewall: FirewallConfig,
    /// Tunnel daemon control
    pub daemon: DaemonConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_url: "http://127.0.0.1:9443".to_string(),
            token: String::new(),
            role: PointKind::Gateway,
            state_dir: PathBuf::from("/var/lib/ztgate"),
            status_file: PathBuf::from("/run/ztgate/status.log"),
            http_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(10),
            mesh_interval: Duration::from_secs(30),
            resolve_timeout: Duration::from_secs(2),
            reprovision: ReprovisionGuardConfig::default(),
            firewall: FirewallConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load from file and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be loaded, the token is missing,
    /// or the control URL is empty.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = load(path)?;
        if config.control_url.is_empty() {
            return Err(Error::Config("control_url must be set".to_string()));
        }
        if config.resolved_token().is_none() {
            return Err(Error::Config("agent token must be set".to_string()));
        }
        Ok(config)
    }

    /// Token after `env:` expansion; `None` if empty or unresolvable.
    #[must_use]
    pub fn resolved_token(&self) -> Option<String> {
        resolve_secret(&self.token).filter(|t| !t.is_empty())
    }
}

/// Reprovision loop guard limits
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ReprovisionGuardConfig {
    /// Reprovisions tolerated while drift persists before backing off
    pub max_consecutive: u32,
    /// Upper bound on heartbeat ticks skipped between attempts
    pub max_backoff_ticks: u32,
}

impl Default for ReprovisionGuardConfig {
    fn default() -> Self {
        Self {
            max_consecutive: 3,
            max_backoff_ticks: 32,
        }
    }
}

/// Packet filter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Run the reconciler at all
    pub enabled: bool,
    /// nftables table (family `inet`) owned by the agent
    pub table: String,
    /// `nft` binary
    pub nft_binary: String,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            table: "ztgate".to_string(),
            nft_binary: "nft".to_string(),
        }
    }
}

/// Tunnel daemon control
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// systemd unit running the tunnel daemon
    pub service: String,
    /// Name of the rendered server configuration file inside `state_dir`
    pub config_file: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            service: "openvpn-server@ztgate".to_string(),
            config_file: "server.conf".to_string(),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "2h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"`, `"2h"`, `"7d"` or a bare number of seconds.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else if let Some(days) = s.strip_suffix('d') {
            days.parse::<u64>().map(|d| Duration::from_secs(d * 86_400))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}

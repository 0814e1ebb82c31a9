//! Control plane: CA administration, session issuance and the agent protocol.
//!
//! | Operation | Caller | Purpose |
//! |-----------|--------|---------|
//! | [`heartbeat`](ControlPlane::heartbeat) | agent | liveness plus drift detection |
//! | [`provision`](ControlPlane::provision) | agent | server credentials and settings |
//! | [`fetch_rules`](ControlPlane::fetch_rules) | agent | batched effective rules |
//! | [`spokes`](ControlPlane::spokes) | hub agent | spoke reachability |
//! | [`issue_session`](ControlPlane::issue_session) | identity frontend | client bundle |
//! | [`update_point`](ControlPlane::update_point) | admin | edit config-affecting fields |

pub mod handler;
pub mod server;

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use ztgate_proto::{
    CryptoProfile, HeartbeatRequest, HeartbeatResponse, LiveCounts, ProvisionRequest,
    ProvisionResponse, RuleFetchRequest, RuleFetchResponse, SpokeFeedRequest, SpokeFeedResponse,
    SpokeInfo, VpnProtocol,
};

use crate::config::{ControlConfig, PkiConfig, resolve_secret};
use crate::enforcement::{EnforcementPoint, PointKind, Spoke, generate_tls_auth_key};
use crate::pki::audit::{self, AuditEvent};
use crate::pki::keys::{read_pem, write_atomic};
use crate::pki::{CaEngine, CertificateIssuer};
use crate::policy::{Identity, PolicyResolver, RouteDirective, compile_routes};
use crate::tunnel::config::{ClientConfig, render_client_config};
use crate::{Error, Result};

/// Client session request from the identity frontend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionRequest {
    /// Authenticated identity
    pub identity: String,
    /// Group memberships from the identity provider
    #[serde(default)]
    pub groups: Vec<String>,
    /// Enforcement point the session is for
    pub point_id: String,
}

/// Everything a client needs to connect, returned exactly once.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionBundle {
    /// Certificate serial (lowercase hex)
    pub serial: String,
    /// PEM client certificate
    pub cert: String,
    /// PEM client key
    pub key: String,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// Compiled route and DNS directives
    pub routes: Vec<RouteDirective>,
    /// Self-contained client configuration
    pub client_config: String,
}

impl std::fmt::Debug for SessionBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBundle")
            .field("serial", &self.serial)
            .field("not_after", &self.not_after)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

/// Partial update of an enforcement point's config-affecting fields.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PointUpdate {
    /// Cipher bundle
    pub crypto_profile: Option<CryptoProfile>,
    /// Listening port
    pub vpn_port: Option<u16>,
    /// Listening protocol
    pub vpn_protocol: Option<VpnProtocol>,
    /// Client address pool
    pub vpn_subnet: Option<ipnet::Ipv4Net>,
    /// TLS-auth on/off
    pub tls_auth_enabled: Option<bool>,
    /// Full tunnel on/off
    pub full_tunnel: Option<bool>,
    /// Push DNS on/off
    pub push_dns: Option<bool>,
    /// DNS servers
    pub dns_servers: Option<Vec<Ipv4Addr>>,
    /// Replace the TLS-auth key with a freshly generated one
    #[serde(default)]
    pub rotate_tls_auth_key: bool,
}

/// Last heartbeat of an enforcement point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liveness {
    /// When the heartbeat arrived
    pub last_seen: DateTime<Utc>,
    /// Reported free-form status
    pub status: String,
    /// Reported counters
    pub live_counts: LiveCounts,
    /// Version the agent reported
    pub reported_version: String,
}

/// Admin view of one enforcement point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointStatus {
    /// Point id
    pub id: String,
    /// Gateway or hub
    pub kind: PointKind,
    /// Canonical config version
    pub config_version: String,
    /// Last heartbeat, if any
    pub liveness: Option<Liveness>,
    /// Last reported version equals the canonical one
    pub in_sync: bool,
}

/// Control plane state.
pub struct ControlPlane {
    engine: Arc<CaEngine>,
    issuer: CertificateIssuer,
    resolver: PolicyResolver,
    points: RwLock<BTreeMap<String, EnforcementPoint>>,
    /// (token, point id)
    tokens: Vec<(String, String)>,
    liveness: DashMap<String, Liveness>,
    /// Identity-provider groups from the latest session of each identity
    claimed_groups: DashMap<String, Vec<String>>,
    client_validity: Duration,
    server_validity: Duration,
    dh_params: Option<String>,
}

impl ControlPlane {
    /// Build the control plane from configuration, bootstrapping the PKI.
    ///
    /// # Errors
    ///
    /// Fails on unresolved secrets, duplicate tokens, unreadable PKI files or
    /// key generation errors.
    pub fn from_config(config: &ControlConfig) -> Result<Self> {
        let engine = Arc::new(CaEngine::new(
            config.pki.key_algorithm,
            config.pki.ca_common_name.clone(),
            config.pki.ca_validity_days,
        ));
        bootstrap_pki(&engine, &config.pki)?;

        let dh_params = config
            .pki
            .dh_params_file
            .as_deref()
            .map(read_pem)
            .transpose()?;

        let mut points = BTreeMap::new();
        let mut tokens = Vec::new();
        let mut seen_tokens = HashSet::new();
        for pc in &config.points {
            let token = resolve_secret(&pc.token)
                .filter(|t| !t.is_empty())
                .ok_or_else(|| Error::Config(format!("point '{}': token unresolved", pc.id)))?;
            if !seen_tokens.insert(token.clone()) {
                return Err(Error::Config(format!("point '{}': token reused", pc.id)));
            }
            tokens.push((token, pc.id.clone()));

            let mut settings = pc.settings.clone();
            settings.tls_auth_key = match settings.tls_auth_key.as_deref() {
                Some(v) => Some(resolve_secret(v).ok_or_else(|| {
                    Error::Config(format!("point '{}': tls_auth_key unresolved", pc.id))
                })?),
                None if settings.tls_auth_enabled => {
                    warn!(point = %pc.id, "No tls_auth_key configured; generated one for this run");
                    Some(generate_tls_auth_key())
                }
                None => None,
            };

            let spokes = pc
                .spokes
                .iter()
                .map(|s| Spoke {
                    id: s.id.clone(),
                    hub_id: pc.id.clone(),
                    local_networks: s.local_networks.clone(),
                    tunnel_ip: s.tunnel_ip,
                })
                .collect();

            points.insert(
                pc.id.clone(),
                EnforcementPoint {
                    id: pc.id.clone(),
                    kind: pc.kind,
                    endpoint: pc.endpoint.clone().unwrap_or_else(|| pc.id.clone()),
                    networks: pc.networks.clone(),
                    settings,
                    spokes,
                },
            );
        }

        info!(
            points = points.len(),
            rules = config.directory.rules.len(),
            users = config.directory.users.len(),
            "Control plane initialized"
        );

        Ok(Self {
            issuer: CertificateIssuer::new(Arc::clone(&engine), config.pki.key_algorithm),
            engine,
            resolver: PolicyResolver::new(&config.directory),
            points: RwLock::new(points),
            tokens,
            liveness: DashMap::new(),
            claimed_groups: DashMap::new(),
            client_validity: config.pki.client_validity,
            server_validity: config.pki.server_validity,
            dh_params,
        })
    }

    /// CA engine.
    #[must_use]
    pub fn engine(&self) -> &Arc<CaEngine> {
        &self.engine
    }

    /// Certificate issuer.
    #[must_use]
    pub fn issuer(&self) -> &CertificateIssuer {
        &self.issuer
    }

    /// Snapshot of one enforcement point.
    #[must_use]
    pub fn point(&self, id: &str) -> Option<EnforcementPoint> {
        self.points.read().get(id).cloned()
    }

    fn point_for_token(&self, token: &str) -> Result<EnforcementPoint> {
        // Visit every entry so the comparison time does not depend on which
        // token matched.
        let mut found: Option<&str> = None;
        for (candidate, id) in &self.tokens {
            if bool::from(candidate.as_bytes().ct_eq(token.as_bytes())) {
                found = Some(id.as_str());
            }
        }
        let id = found.ok_or(Error::UnknownToken)?;
        self.point(id).ok_or_else(|| Error::NotFound(format!("point '{id}'")))
    }

    /// Record liveness and compare the agent's version with the canonical one.
    pub fn heartbeat(&self, req: &HeartbeatRequest) -> Result<HeartbeatResponse> {
        let point = self.point_for_token(&req.token)?;
        let canonical = point.config_version();
        let needs_reprovision = req.config_version != canonical;

        self.liveness.insert(
            point.id.clone(),
            Liveness {
                last_seen: Utc::now(),
                status: req.status.clone(),
                live_counts: req.live_counts,
                reported_version: req.config_version.clone(),
            },
        );

        if needs_reprovision {
            info!(point = %point.id, reported = %req.config_version, canonical = %canonical, "Config drift detected");
        } else {
            debug!(point = %point.id, clients = req.live_counts.clients, "Heartbeat");
        }

        Ok(HeartbeatResponse {
            ok: true,
            needs_reprovision,
            config_version: canonical,
        })
    }

    /// Issue a server certificate and return the point's full bundle.
    ///
    /// # Errors
    ///
    /// `UnknownToken` for a bad token; `NoActiveCa` when nothing can sign.
    pub fn provision(&self, req: &ProvisionRequest) -> Result<ProvisionResponse> {
        let point = self.point_for_token(&req.token)?;
        let credential = self.issuer.issue_server(&point.id, self.server_validity)?;
        let s = &point.settings;

        info!(point = %point.id, serial = %credential.record.serial, "Provisioned enforcement point");
        Ok(ProvisionResponse {
            ca_cert: self.engine.trust_bundle(),
            server_cert: credential.cert_pem,
            server_key: credential.key_pem.expose().to_string(),
            dh_params: self.dh_params.clone(),
            tls_auth_enabled: s.tls_auth_enabled,
            tls_auth_key: if s.tls_auth_enabled {
                s.tls_auth_key.clone()
            } else {
                None
            },
            vpn_port: s.vpn_port,
            vpn_protocol: s.vpn_protocol,
            vpn_subnet: s.vpn_subnet.to_string(),
            crypto_profile: s.crypto_profile,
            config_version: point.config_version(),
        })
    }

    /// Effective rules for every requested identity at the caller's point.
    ///
    /// Groups claimed when the identity's session was issued count alongside
    /// directory groups, so the firewall sees the same rule set the session's
    /// routes were compiled from.
    pub fn fetch_rules(&self, req: &RuleFetchRequest) -> Result<RuleFetchResponse> {
        let point = self.point_for_token(&req.token)?;
        let rules = req
            .identities
            .iter()
            .map(|id| {
                let identity = Identity {
                    id: id.clone(),
                    groups: self
                        .claimed_groups
                        .get(id)
                        .map(|g| g.value().clone())
                        .unwrap_or_default(),
                };
                (id.clone(), self.resolver.resolve(&identity, &point))
            })
            .collect();
        Ok(RuleFetchResponse { rules })
    }

    /// Revoke every certificate of `identity` and forget its claimed groups.
    pub fn revoke_identity(&self, identity: &str, reason: &str) -> usize {
        self.claimed_groups.remove(identity);
        self.issuer.revoke_identity(identity, reason)
    }

    /// Spokes of the calling hub.
    pub fn spokes(&self, req: &SpokeFeedRequest) -> Result<SpokeFeedResponse> {
        let point = self.point_for_token(&req.token)?;
        if point.kind != PointKind::Hub {
            return Err(Error::NotFound(format!("'{}' is not a hub", point.id)));
        }
        let netmask = point.settings.vpn_subnet.netmask();
        Ok(SpokeFeedResponse {
            spokes: point
                .spokes
                .iter()
                .map(|s| SpokeInfo {
                    id: s.id.clone(),
                    tunnel_ip: s.tunnel_ip,
                    local_networks: s.local_networks.iter().map(ToString::to_string).collect(),
                    netmask,
                })
                .collect(),
        })
    }

    /// Mint a client certificate and render the client configuration.
    pub fn issue_session(&self, req: &SessionRequest) -> Result<SessionBundle> {
        let Some(point) = self.point(&req.point_id) else {
            audit::emit(&AuditEvent::denied(
                &req.identity,
                &req.point_id,
                "unknown enforcement point",
            ));
            return Err(Error::NotFound(format!("point '{}'", req.point_id)));
        };

        let identity = Identity {
            id: req.identity.clone(),
            groups: req.groups.clone(),
        };
        let rules = self.resolver.resolve(&identity, &point);
        let s = &point.settings;
        let routes = compile_routes(&rules, s.full_tunnel, s.push_dns, &s.dns_servers);

        let credential = self
            .issuer
            .issue(&req.identity, &point.id, self.client_validity)?;
        self.claimed_groups
            .insert(req.identity.clone(), req.groups.clone());
        let ca_pem = self.engine.trust_bundle();
        let client_config = render_client_config(&ClientConfig {
            point_id: &point.id,
            remote_host: &point.endpoint,
            port: s.vpn_port,
            protocol: s.vpn_protocol,
            crypto_profile: s.crypto_profile,
            ca_pem: &ca_pem,
            cert_pem: &credential.cert_pem,
            key_pem: credential.key_pem.expose(),
            tls_auth_key: if s.tls_auth_enabled {
                s.tls_auth_key.as_deref()
            } else {
                None
            },
            routes: &routes,
        });

        info!(
            identity = %req.identity,
            point = %point.id,
            serial = %credential.record.serial,
            rules = rules.len(),
            "Client session issued"
        );
        Ok(SessionBundle {
            serial: credential.record.serial.clone(),
            cert: credential.cert_pem,
            key: credential.key_pem.expose().to_string(),
            not_after: credential.record.not_after,
            routes,
            client_config,
        })
    }

    /// Apply an admin edit and return the point's new config version.
    pub fn update_point(&self, id: &str, update: &PointUpdate) -> Result<String> {
        let mut points = self.points.write();
        let point = points
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("point '{id}'")))?;
        let before = point.config_version();

        let s = &mut point.settings;
        if let Some(v) = update.crypto_profile {
            s.crypto_profile = v;
        }
        if let Some(v) = update.vpn_port {
            s.vpn_port = v;
        }
        if let Some(v) = update.vpn_protocol {
            s.vpn_protocol = v;
        }
        if let Some(v) = update.vpn_subnet {
            s.vpn_subnet = v.trunc();
        }
        if let Some(v) = update.tls_auth_enabled {
            s.tls_auth_enabled = v;
        }
        if let Some(v) = update.full_tunnel {
            s.full_tunnel = v;
        }
        if let Some(v) = update.push_dns {
            s.push_dns = v;
        }
        if let Some(v) = &update.dns_servers {
            s.dns_servers.clone_from(v);
        }
        if update.rotate_tls_auth_key || (s.tls_auth_enabled && s.tls_auth_key.is_none()) {
            s.tls_auth_key = Some(generate_tls_auth_key());
        }

        let after = point.config_version();
        if before == after {
            debug!(point = %id, "Point update changed nothing");
        } else {
            info!(point = %id, from = %before, to = %after, "Point settings updated");
        }
        Ok(after)
    }

    /// Liveness of every enforcement point.
    #[must_use]
    pub fn point_statuses(&self) -> Vec<PointStatus> {
        self.points
            .read()
            .values()
            .map(|p| {
                let config_version = p.config_version();
                let liveness = self.liveness.get(&p.id).map(|l| l.value().clone());
                let in_sync = liveness
                    .as_ref()
                    .is_some_and(|l| l.reported_version == config_version);
                PointStatus {
                    id: p.id.clone(),
                    kind: p.kind,
                    config_version,
                    liveness,
                    in_sync,
                }
            })
            .collect()
    }
}

/// Import the configured CA pair, or generate one and export it if paths are
/// configured.
fn bootstrap_pki(engine: &CaEngine, pki: &PkiConfig) -> Result<()> {
    match (pki.ca_cert_file.as_deref(), pki.ca_key_file.as_deref()) {
        (Some(cert), Some(key)) if cert.exists() && key.exists() => {
            engine.import_active(&read_pem(cert)?, &read_pem(key)?)?;
        }
        (Some(cert), Some(key)) if cert.exists() != key.exists() => {
            return Err(Error::Config(format!(
                "CA pair incomplete: '{}' and '{}' must both exist or both be absent",
                cert.display(),
                key.display()
            )));
        }
        (cert, key) => {
            engine.bootstrap()?;
            if let (Some(cert), Some(key)) = (cert, key) {
                let (cert_pem, key_pem) = engine.active_pem_pair()?;
                write_atomic(cert, cert_pem.as_bytes(), 0o644)?;
                write_atomic(key, key_pem.expose().as_bytes(), 0o600)?;
                info!(cert = %cert.display(), "Exported generated CA");
            }
        }
    }
    Ok(())
}

//! Tunnel daemon configuration rendering.
//!
//! The server configuration is rendered by the agent from a provision bundle.
//! The client configuration is rendered by the control plane when it mints a
//! session and embeds every credential inline.

use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;
use ztgate_proto::{CryptoProfile, ProvisionResponse, VpnProtocol};

use crate::enforcement::profile;
use crate::policy::RouteDirective;
use crate::{Error, Result};

/// Seconds between status file rewrites by the daemon.
pub const STATUS_REFRESH_SECS: u32 = 10;

/// File names of a provisioned bundle inside the agent state directory.
#[derive(Debug, Clone)]
pub struct BundleLayout {
    dir: PathBuf,
}

impl BundleLayout {
    /// Bundle rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// State directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// CA trust bundle.
    #[must_use]
    pub fn ca_cert(&self) -> PathBuf {
        self.dir.join("ca.crt")
    }

    /// Server certificate.
    #[must_use]
    pub fn server_cert(&self) -> PathBuf {
        self.dir.join("server.crt")
    }

    /// Server private key.
    #[must_use]
    pub fn server_key(&self) -> PathBuf {
        self.dir.join("server.key")
    }

    /// DH parameters.
    #[must_use]
    pub fn dh_params(&self) -> PathBuf {
        self.dir.join("dh.pem")
    }

    /// Static TLS-auth key.
    #[must_use]
    pub fn tls_auth_key(&self) -> PathBuf {
        self.dir.join("ta.key")
    }

    /// Last applied config version.
    #[must_use]
    pub fn version_file(&self) -> PathBuf {
        self.dir.join("config_version")
    }

    /// Client-config directory for spoke directives.
    #[must_use]
    pub fn ccd_dir(&self) -> PathBuf {
        self.dir.join("ccd")
    }
}

/// Agent-local inputs to the server configuration.
#[derive(Debug, Clone)]
pub struct ServerRenderOptions<'a> {
    /// Status file the daemon writes and the reconciler reads
    pub status_file: &'a Path,
    /// Client-config directory (hubs only)
    pub client_config_dir: Option<&'a Path>,
}

/// Render the server configuration for a provision bundle.
///
/// # Errors
///
/// Returns `Error::Config` if the bundle's subnet is not a valid IPv4 CIDR.
pub fn render_server_config(
    bundle: &ProvisionResponse,
    layout: &BundleLayout,
    options: &ServerRenderOptions<'_>,
) -> Result<String> {
    let subnet: Ipv4Net = bundle
        .vpn_subnet
        .parse()
        .map_err(|e| Error::Config(format!("invalid vpn_subnet '{}': {e}", bundle.vpn_subnet)))?;

    let mut out = String::new();
    let _ = writeln!(out, "# Managed by ztgate; config version {}", bundle.config_version);
    let _ = writeln!(out, "port {}", bundle.vpn_port);
    let _ = writeln!(out, "proto {}", bundle.vpn_protocol.as_str());
    out.push_str("dev tun\ntopology subnet\n");
    let _ = writeln!(out, "server {} {}", subnet.network(), subnet.netmask());
    let _ = writeln!(out, "ca {}", layout.ca_cert().display());
    let _ = writeln!(out, "cert {}", layout.server_cert().display());
    let _ = writeln!(out, "key {}", layout.server_key().display());
    if bundle.dh_params.is_some() {
        let _ = writeln!(out, "dh {}", layout.dh_params().display());
    } else {
        out.push_str("dh none\n");
    }
    if bundle.tls_auth_enabled {
        let _ = writeln!(out, "tls-auth {} 0", layout.tls_auth_key().display());
    }
    push_profile(&mut out, bundle.crypto_profile);
    let _ = writeln!(
        out,
        "status {} {STATUS_REFRESH_SECS}",
        options.status_file.display()
    );
    out.push_str("status-version 2\n");
    if let Some(ccd) = options.client_config_dir {
        let _ = writeln!(out, "client-config-dir {}", ccd.display());
    }
    out.push_str("keepalive 10 120\npersist-key\npersist-tun\nverb 3\n");
    Ok(out)
}

/// Inputs to a client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig<'a> {
    /// Enforcement point id; pinned as the server certificate name
    pub point_id: &'a str,
    /// Host clients dial
    pub remote_host: &'a str,
    /// Port clients dial
    pub port: u16,
    /// Transport
    pub protocol: VpnProtocol,
    /// Cipher bundle
    pub crypto_profile: CryptoProfile,
    /// PEM trust bundle
    pub ca_pem: &'a str,
    /// PEM client certificate
    pub cert_pem: &'a str,
    /// PEM client key
    pub key_pem: &'a str,
    /// Static TLS-auth key, when enabled
    pub tls_auth_key: Option<&'a str>,
    /// Compiled route and DNS directives
    pub routes: &'a [RouteDirective],
}

/// Render a self-contained client configuration.
#[must_use]
pub fn render_client_config(c: &ClientConfig<'_>) -> String {
    let proto = match c.protocol {
        VpnProtocol::Udp => "udp",
        VpnProtocol::Tcp => "tcp-client",
    };

    let mut out = String::from("client\ndev tun\nnobind\npersist-key\npersist-tun\n");
    let _ = writeln!(out, "proto {proto}");
    let _ = writeln!(out, "remote {} {}", c.remote_host, c.port);
    out.push_str("remote-cert-tls server\n");
    let _ = writeln!(out, "verify-x509-name {} name", c.point_id);
    push_profile(&mut out, c.crypto_profile);
    // routes come from this file, not from the server
    out.push_str("route-nopull\n");
    for route in c.routes {
        let _ = writeln!(out, "{}", route.client_line());
    }
    push_inline(&mut out, "ca", c.ca_pem);
    push_inline(&mut out, "cert", c.cert_pem);
    push_inline(&mut out, "key", c.key_pem);
    if let Some(ta) = c.tls_auth_key {
        out.push_str("key-direction 1\n");
        push_inline(&mut out, "tls-auth", ta);
    }
    out
}

/// Spoke directives for the hub's client-config directory.
#[must_use]
pub fn render_spoke_directives(
    tunnel_ip: Ipv4Addr,
    netmask: Ipv4Addr,
    networks: &[Ipv4Net],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "ifconfig-push {tunnel_ip} {netmask}");
    for net in networks {
        let _ = writeln!(out, "iroute {} {}", net.network(), net.netmask());
    }
    out
}

fn push_profile(out: &mut String, crypto_profile: CryptoProfile) {
    for line in profile::directives(crypto_profile) {
        out.push_str(line);
        out.push('\n');
    }
}

fn push_inline(out: &mut String, tag: &str, body: &str) {
    let _ = writeln!(out, "<{tag}>\n{}\n</{tag}>", body.trim_end());
}

//! Status file parser (daemon status format version 2).
//!
//! ```text
//! HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address,...
//! CLIENT_LIST,alice,203.0.113.5:51234,10.8.0.6,,1843,2011,...
//! ```
//!
//! Column positions come from the `HEADER,CLIENT_LIST` row when present.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use super::{ConnectedClient, StatusFeed};
use crate::Result;

const DEFAULT_COLUMNS: Columns = Columns {
    common_name: 1,
    real_address: 2,
    virtual_address: 3,
};

#[derive(Debug, Clone, Copy)]
struct Columns {
    common_name: usize,
    real_address: usize,
    virtual_address: usize,
}

impl Columns {
    fn from_header(fields: &[&str]) -> Self {
        let find = |name: &str, fallback: usize| {
            fields.iter().position(|f| *f == name).unwrap_or(fallback)
        };
        // field 0 is "HEADER"; data rows have no such prefix
        let shift = |i: usize| i.saturating_sub(1);
        Self {
            common_name: shift(find("Common Name", DEFAULT_COLUMNS.common_name + 1)),
            real_address: shift(find("Real Address", DEFAULT_COLUMNS.real_address + 1)),
            virtual_address: shift(find("Virtual Address", DEFAULT_COLUMNS.virtual_address + 1)),
        }
    }
}

/// Parse status file text into connected clients.
///
/// Rows with common name `UNDEF` (handshake not finished) and rows whose
/// virtual address is not IPv4 are skipped.
#[must_use]
pub fn parse_status(text: &str) -> Vec<ConnectedClient> {
    let mut columns = DEFAULT_COLUMNS;
    let mut clients = Vec::new();

    for line in text.lines() {
        let fields: Vec<&str> = line.trim_end().split(',').collect();
        match fields.first().copied() {
            Some("HEADER") if fields.get(1) == Some(&"CLIENT_LIST") => {
                columns = Columns::from_header(&fields);
            }
            Some("CLIENT_LIST") => {
                if let Some(client) = parse_row(&fields, columns) {
                    clients.push(client);
                }
            }
            _ => {}
        }
    }
    clients
}

fn parse_row(fields: &[&str], columns: Columns) -> Option<ConnectedClient> {
    let identity = fields.get(columns.common_name)?.trim();
    if identity.is_empty() || identity == "UNDEF" {
        return None;
    }
    let tunnel_ip: Ipv4Addr = fields.get(columns.virtual_address)?.trim().parse().ok()?;
    let real_ip = fields
        .get(columns.real_address)
        .and_then(|raw| parse_real_address(raw.trim()));

    Some(ConnectedClient {
        identity: identity.to_string(),
        tunnel_ip,
        real_ip,
    })
}

fn parse_real_address(raw: &str) -> Option<IpAddr> {
    let raw = raw.strip_prefix("udp4:").or_else(|| raw.strip_prefix("tcp4-server:")).unwrap_or(raw);
    raw.parse::<SocketAddr>()
        .map(|s| s.ip())
        .ok()
        .or_else(|| raw.parse::<IpAddr>().ok())
}

/// Status file written by the daemon.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    /// Read from `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StatusFeed for StatusFile {
    async fn connected_clients(&self) -> Result<Vec<ConnectedClient>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(parse_status(&text)),
            // daemon not started yet: nobody is connected
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Status file absent");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

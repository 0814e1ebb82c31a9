//! Host name resolution at apply time.

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;

use crate::Result;

/// Resolves host names to IPv4 addresses.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Current IPv4 addresses of `host`; IPv6 results are dropped.
    async fn resolve_v4(&self, host: &str) -> Result<Vec<Ipv4Addr>>;
}

/// System resolver via `getaddrinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve_v4(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        let mut out: Vec<Ipv4Addr> = addrs
            .filter_map(|a| match a.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect();
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }
}

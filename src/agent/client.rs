//! HTTP client for the control plane's agent API.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use ztgate_proto::{
    AccessRule, HeartbeatRequest, HeartbeatResponse, LiveCounts, ProvisionRequest,
    ProvisionResponse, RuleFetchRequest, RuleFetchResponse, SpokeFeedRequest, SpokeFeedResponse,
    SpokeInfo,
};

use super::ControlPlaneApi;
use crate::firewall::RuleSource;
use crate::mesh::SpokeSource;
use crate::{Error, Result};

/// Agent-side client. Every call is a single attempt bounded by the client
/// timeout; the caller retries on its next tick.
#[derive(Clone)]
pub struct ControlPlaneClient {
    http: Client,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for ControlPlaneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ControlPlaneClient {
    /// Client for `base_url`, authenticating with `token`.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "Control plane request");

        let response = self.http.post(&url).json(body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ControlPlane(format!("{path}: HTTP {status} - {body}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ControlPlaneApi for ControlPlaneClient {
    async fn heartbeat(
        &self,
        status: &str,
        live_counts: LiveCounts,
        config_version: &str,
    ) -> Result<HeartbeatResponse> {
        let req = HeartbeatRequest {
            token: self.token.clone(),
            status: status.to_string(),
            live_counts,
            config_version: config_version.to_string(),
        };
        self.post("/api/v1/agent/heartbeat", &req).await
    }

    async fn provision(&self) -> Result<ProvisionResponse> {
        let req = ProvisionRequest {
            token: self.token.clone(),
        };
        self.post("/api/v1/agent/provision", &req).await
    }
}

#[async_trait]
impl RuleSource for ControlPlaneClient {
    async fn fetch_rules(&self, identities: &[String]) -> Result<BTreeMap<String, Vec<AccessRule>>> {
        let req = RuleFetchRequest {
            token: self.token.clone(),
            identities: identities.to_vec(),
        };
        let resp: RuleFetchResponse = self.post("/api/v1/agent/rules", &req).await?;
        Ok(resp.rules)
    }
}

#[async_trait]
impl SpokeSource for ControlPlaneClient {
    async fn fetch_spokes(&self) -> Result<Vec<SpokeInfo>> {
        let req = SpokeFeedRequest {
            token: self.token.clone(),
        };
        let resp: SpokeFeedResponse = self.post("/api/v1/mesh/spokes", &req).await?;
        Ok(resp.spokes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let c = ControlPlaneClient::new("https://cp.example/", "t".into(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(c.base_url, "https://cp.example");
    }

    #[test]
    fn debug_hides_token() {
        let c = ControlPlaneClient::new("https://cp.example", "s3cret".into(), Duration::from_secs(1))
            .unwrap();
        assert!(!format!("{c:?}").contains("s3cret"));
    }

    #[tokio::test]
    async fn unreachable_control_plane_is_an_error() {
        // GIVEN: nothing listens on this port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let c = ControlPlaneClient::new(
            &format!("http://127.0.0.1:{port}"),
            "t".into(),
            Duration::from_millis(500),
        )
        .unwrap();

        // WHEN / THEN
        assert!(c.provision().await.is_err());
    }
}

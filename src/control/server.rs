//! Control plane server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use tokio::net::TcpListener;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::ControlPlane;
use super::handler::{ControlState, control_routes};
use crate::config::ControlConfig;
use crate::{Error, Result, shutdown_signal};

/// Control plane HTTP server
pub struct ControlServer {
    config: ControlConfig,
    state: Arc<ControlState>,
}

impl ControlServer {
    /// Bootstrap the PKI and index the directory.
    ///
    /// # Errors
    ///
    /// Fails if the control plane cannot be built from `config`.
    pub fn new(config: ControlConfig) -> Result<Self> {
        let plane = ControlPlane::from_config(&config)?;
        let state = Arc::new(ControlState::new(plane, &config.admin));
        Ok(Self { config, state })
    }

    /// Router with the standard layers applied.
    pub fn router(&self) -> Router {
        control_routes(Arc::clone(&self.state))
            .layer(CatchPanicLayer::new())
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.config.server.request_timeout,
            ))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("ztgate control plane listening on http://{addr}");
        info!(
            points = self.config.points.len(),
            active_cas = self.state.plane.engine().active_count(),
            "Serving agent, session and admin APIs"
        );
        if self.config.admin.bearer_token.is_none() {
            warn!("No admin token configured - CA administration endpoints disabled");
        }
        if self.config.admin.issuer_token.is_none() {
            warn!("No issuer token configured - session endpoint disabled");
        }
        info!("============================================================");

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Control plane stopped");
        Ok(())
    }
}

//! ztgate
//!
//! Zero-trust network access for tunnel-based gateways and mesh hubs.
//!
//! # Components
//!
//! - **Control plane**: certificate authority with dual-trust rotation,
//!   per-session client certificates, policy resolution and the agent API
//! - **Enforcement agent**: heartbeat-driven provisioning, per-identity
//!   packet-filter reconciliation and, on hubs, spoke route distribution
//!
//! Every agent loop is a fixed-interval poll; staleness is bounded by one
//! interval and a failed call is retried on the next tick.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod agent;
pub mod cli;
pub mod config;
pub mod control;
pub mod enforcement;
pub mod error;
pub mod exec;
pub mod firewall;
pub mod mesh;
pub mod pki;
pub mod policy;
pub mod tunnel;

pub use error::{Error, Result};

use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    result.map_err(|e| Error::Config(format!("tracing: {e}")))
}

/// Wait for Ctrl-C or SIGTERM, then broadcast shutdown.
pub async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

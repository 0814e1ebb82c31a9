//! ztgate - zero-trust network access control plane and enforcement agent

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use serde_json::Value;
use tracing::{error, info};

use ztgate::{
    agent::Agent,
    cli::{CaArgs, CaCommand, Cli, Command},
    config::{AgentConfig, ControlConfig},
    control::server::ControlServer,
    pki::CaSummary,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Command::Control { port, ref host } => run_control(&cli, port, host.clone()).await,
        Command::Agent => run_agent(&cli).await,
        Command::Ca(ref args) => match run_ca(args).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("❌ {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Run the control plane
async fn run_control(cli: &Cli, port: Option<u16>, host: Option<String>) -> ExitCode {
    let config = match ControlConfig::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        points = config.points.len(),
        "Starting ztgate control plane"
    );

    let server = match ControlServer::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize control plane: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Control plane error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Run an enforcement agent
async fn run_agent(cli: &Cli) -> ExitCode {
    let config = match AgentConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let agent = match Agent::from_config(config).await {
        Ok(a) => Arc::new(a),
        Err(e) => {
            error!("Failed to initialize agent: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = agent.run().await {
        error!("Agent error: {e}");
        return ExitCode::FAILURE;
    }
    info!("Agent shutdown complete");
    ExitCode::SUCCESS
}

/// CA administration over the admin API
async fn run_ca(args: &CaArgs) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let base = args.url.trim_end_matches('/');

    let (method, path) = match args.action {
        CaCommand::List => (reqwest::Method::GET, "/api/v1/admin/cas".to_string()),
        CaCommand::Prepare => (reqwest::Method::POST, "/api/v1/admin/cas/rotation".to_string()),
        CaCommand::Activate { ref id } => {
            (reqwest::Method::POST, format!("/api/v1/admin/cas/{id}/activate"))
        }
        CaCommand::Revoke { ref id } => {
            (reqwest::Method::POST, format!("/api/v1/admin/cas/{id}/revoke"))
        }
        CaCommand::Fingerprint => (reqwest::Method::GET, "/api/v1/admin/cas/fingerprint".to_string()),
    };

    let response = http
        .request(method, format!("{base}{path}"))
        .bearer_auth(&args.token)
        .send()
        .await
        .with_context(|| format!("request to {base}{path} failed"))?;

    let status = response.status();
    let body: Value = response.json().await.context("invalid response body")?;
    if !status.is_success() {
        bail!(
            "HTTP {status}: {}",
            body.get("message").and_then(Value::as_str).unwrap_or("request failed")
        );
    }

    match args.action {
        CaCommand::List => {
            let cas: Vec<CaSummary> = serde_json::from_value(body).context("unexpected CA list")?;
            println!("{:<38} {:<8} {:<25} FINGERPRINT", "ID", "STATUS", "NOT AFTER");
            for ca in cas {
                println!(
                    "{:<38} {:<8} {:<25} {}",
                    ca.id,
                    ca.status.as_str(),
                    ca.not_after.to_rfc3339(),
                    ca.fingerprint
                );
            }
        }
        CaCommand::Fingerprint => {
            let fp = body
                .get("fingerprint")
                .and_then(Value::as_str)
                .context("response carries no fingerprint")?;
            println!("{fp}");
        }
        CaCommand::Prepare | CaCommand::Activate { .. } | CaCommand::Revoke { .. } => {
            let ca: CaSummary = serde_json::from_value(body).context("unexpected CA summary")?;
            println!("✅ {} is now {}", ca.id, ca.status.as_str());
        }
    }
    Ok(())
}

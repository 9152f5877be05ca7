//! Stagehand staging controller

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stagehand_common::config::Config;
use stagehand_common::crd::{Queue, QueueHistory, StableComponent};
use stagehand_common::telemetry::init_tracing;
use stagehand_common::{SharedConfig, DEFAULT_HTTP_PORT, FIELD_MANAGER};
use stagehand_rpc::{HttpPeerClient, ServerState};
use stagehand_staging::{Context, Controller, Timings};

/// Stagehand - runs component upgrades of one team through a staging environment
#[derive(Parser, Debug)]
#[command(name = "stagehand", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Apply the CRD manifests to the cluster on startup
    #[arg(long, env = "STAGEHAND_INSTALL_CRDS")]
    install_crds: bool,

    /// Tenant namespace holding queues, history and stable components
    #[arg(long, env = "STAGEHAND_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Team this controller serves
    #[arg(long, env = "STAGEHAND_TEAM", default_value = "")]
    team: String,

    /// Base URL of the peer service
    #[arg(long, env = "STAGEHAND_PEER_ENDPOINT", default_value = "http://stagehand:8080")]
    peer_endpoint: String,

    /// Shared secret for peer calls in both directions
    #[arg(long, env = "STAGEHAND_AUTH_TOKEN", default_value = "", hide_env_values = true)]
    auth_token: String,

    /// Address of the health and RPC endpoint
    #[arg(long, env = "STAGEHAND_LISTEN")]
    listen: Option<SocketAddr>,

    /// Team configuration loaded before the first update arrives
    #[arg(long, env = "STAGEHAND_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Seconds to sleep when no queue is eligible
    #[arg(long, env = "STAGEHAND_IDLE_SECONDS", default_value_t = 2)]
    idle_seconds: u64,

    /// Seconds to sleep while a phase waits on the cluster
    #[arg(long, env = "STAGEHAND_WAIT_SECONDS", default_value_t = 2)]
    wait_seconds: u64,

    /// Emit logs as JSON
    #[arg(long, env = "STAGEHAND_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn timings(&self) -> Timings {
        Timings {
            idle: Duration::from_secs(self.idle_seconds),
            wait: Duration::from_secs(self.wait_seconds),
            ..Timings::default()
        }
    }

    fn listen_addr(&self) -> SocketAddr {
        self.listen
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    init_tracing(cli.log_json)?;
    run(cli).await
}

fn crd_manifests() -> anyhow::Result<String> {
    let docs = [Queue::crd(), QueueHistory::crd(), StableComponent::crd()]
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to serialize CRD")?;
    Ok(docs.join("---\n"))
}

/// Apply the Stagehand CRDs with server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [Queue::crd(), QueueHistory::crd(), StableComponent::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .with_context(|| format!("failed to install CRD {}", name))?;
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Config::from_slice(&bytes).with_context(|| format!("failed to parse {}", path.display()))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("failed to create kube client")?;

    if cli.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let shared = Arc::new(match &cli.config_file {
        Some(path) => SharedConfig::with_config(&cli.team, load_config(path)?),
        None => SharedConfig::new(&cli.team),
    });
    let peer = Arc::new(HttpPeerClient::new(&cli.peer_endpoint, &cli.auth_token)?);

    let ctx = Context::builder(client, &cli.namespace, &cli.team, shared.clone(), peer)
        .timings(cli.timings())
        .build()?;
    let controller = Arc::new(Controller::new(Arc::new(ctx)));

    let cancel = CancellationToken::new();
    let state = Arc::new(ServerState::new(
        cli.auth_token.clone(),
        shared,
        controller.clone(),
    ));

    let mut server = tokio::spawn(stagehand_rpc::serve(cli.listen_addr(), state, cancel.clone()));
    let dispatch = {
        let controller = controller.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.run(cancel).await })
    };

    info!(namespace = %cli.namespace, team = %cli.team, "Stagehand started");

    let server_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("Shutdown requested");
            cancel.cancel();
            server.await
        }
        result = &mut server => result,
    };
    cancel.cancel();

    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
        Err(e) => error!(error = %e, "HTTP server task panicked"),
    }
    if let Err(e) = dispatch.await {
        error!(error = %e, "Controller task panicked");
    }

    info!("Stagehand stopped");
    Ok(())
}

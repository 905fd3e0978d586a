//! k0smotron controller entry point

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use k0smotron::controller::{error_policy, reconcile, Context};
use k0smotron::crd::{K0sControlPlane, K0sControllerConfig, Machine};

/// k0smotron - Cluster API controller for k0s-based hosted control planes
#[derive(Parser, Debug)]
#[command(name = "k0smotron", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kube=warn")),
        )
        .init();

    if cli.crd {
        print!("{}", serde_yaml::to_string(&K0sControlPlane::crd())?);
        println!("---");
        print!("{}", serde_yaml::to_string(&K0sControllerConfig::crd())?);
        return Ok(());
    }

    let client = Client::try_default().await?;
    let context = Arc::new(Context::new(client.clone()));

    let control_planes: Api<K0sControlPlane> = Api::all(client.clone());
    let machines: Api<Machine> = Api::all(client.clone());

    info!("starting k0smotron control plane controller");

    Controller::new(control_planes, WatcherConfig::default())
        .owns(machines, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => info!(controlplane = %object.name, "reconciled"),
                Err(error) => warn!(%error, "reconciliation error"),
            }
        })
        .await;

    info!("controller terminated");
    Ok(())
}

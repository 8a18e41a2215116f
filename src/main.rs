//! Fly.io tunnel operator
//!
//! ## Usage
//!
//! ```bash
//! FLY_API_TOKEN=... fly-tunnel-operator --fly-org personal --fly-region ord
//!
//! # Run with custom log level
//! RUST_LOG=fly_tunnel_operator=debug fly-tunnel-operator
//! ```

use std::sync::Arc;

use clap::Parser;
use fly_tunnel_operator::config::{Args, OperatorConfig};
use fly_tunnel_operator::health::{self, HealthState};
use fly_tunnel_operator::leader_election::{self, LeaderElector};
use fly_tunnel_operator::tunnel::workload::KubeWorkloads;
use fly_tunnel_operator::{FlyClient, ServiceController, TunnelManager};
use kube::Client;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = OperatorConfig::from_args(Args::parse())?;

    info!(
        fly_org = %config.tunnel.fly_org,
        fly_region = %config.tunnel.fly_region,
        load_balancer_class = %config.load_balancer_class,
        namespace = %config.tunnel.operator_namespace,
        leader_election = config.leader_election,
        "Starting fly-tunnel-operator"
    );

    let health_state = Arc::new(HealthState::default());
    let health_handle = {
        let state = health_state.clone();
        let addr = config.health_probe_addr;
        tokio::spawn(async move {
            if let Err(e) = health::serve(addr, state).await {
                error!(error = %e, "Health probe server failed");
            }
        })
    };

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");
    health_state.set_ready(true);

    let elector = if config.leader_election {
        let ns = leader_election::detect_namespace(
            &config.leader_election_namespace,
            &config.tunnel.operator_namespace,
        );
        let elector = LeaderElector::new(client.clone(), &ns);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let provider = FlyClient::new(config.fly_api_token.clone())?
        .with_api_url(config.fly_api_url.clone())
        .with_graphql_url(config.fly_graphql_url.clone());
    let manager = Arc::new(TunnelManager::new(
        Arc::new(provider),
        Arc::new(KubeWorkloads::new(client.clone())),
        config.tunnel.clone(),
    ));
    let controller = Arc::new(ServiceController::new(
        client,
        manager,
        config.load_balancer_class.clone(),
    ));

    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!(error = %e, "Service controller error");
        }
    });

    // Pending forever when leader election is disabled
    let lease_handle = {
        let elector = elector.clone();
        tokio::spawn(async move {
            match elector {
                Some(e) => e.hold().await,
                None => std::future::pending::<()>().await,
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Service controller task failed");
            }
        }
        _ = lease_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    health_handle.abort();
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("fly-tunnel-operator shutting down");
    Ok(())
}

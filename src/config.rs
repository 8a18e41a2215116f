//! Command line and environment configuration.

use std::net::SocketAddr;

use clap::{ArgAction, Parser};

use crate::controllers::DEFAULT_LOAD_BALANCER_CLASS;
use crate::error::{OperatorError, Result};
use crate::provider::{DEFAULT_API_URL, DEFAULT_GRAPHQL_URL};
use crate::tunnel::machine::DEFAULT_MACHINE_SIZE;
use crate::tunnel::TunnelConfig;

pub const DEFAULT_NAMESPACE: &str = "fly-tunnel-operator-system";

/// Exposes LoadBalancer Services through frp tunnels on Fly.io Machines
#[derive(Parser, Debug, Clone)]
#[command(name = "fly-tunnel-operator")]
#[command(version, about = "Kubernetes operator exposing LoadBalancer Services through Fly.io")]
pub struct Args {
    /// Fly.io API token
    #[arg(long, env = "FLY_API_TOKEN", hide_env_values = true)]
    pub fly_api_token: Option<String>,

    /// Fly.io organization slug
    #[arg(long, env = "FLY_ORG")]
    pub fly_org: Option<String>,

    /// Fly.io region for new machines
    #[arg(long, env = "FLY_REGION")]
    pub fly_region: Option<String>,

    /// Fly.io machine size preset
    #[arg(long, default_value = DEFAULT_MACHINE_SIZE)]
    pub fly_machine_size: String,

    /// loadBalancerClass handled by this operator
    #[arg(long, default_value = DEFAULT_LOAD_BALANCER_CLASS)]
    pub load_balancer_class: String,

    /// Container image for frps
    #[arg(long, default_value = "snowdreamtech/frps:latest")]
    pub frps_image: String,

    /// Container image for frpc
    #[arg(long, default_value = "snowdreamtech/frpc:latest")]
    pub frpc_image: String,

    /// Namespace for frpc deployments
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Enable leader election for HA deployments
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    pub leader_election_namespace: String,

    /// Health probe bind address
    #[arg(long, default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: String,

    /// Fly.io Machines REST endpoint
    #[arg(long, default_value = DEFAULT_API_URL)]
    pub fly_api_url: String,

    /// Fly.io GraphQL endpoint
    #[arg(long, default_value = DEFAULT_GRAPHQL_URL)]
    pub fly_graphql_url: String,
}

/// Validated operator settings.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub fly_api_token: String,
    pub fly_api_url: String,
    pub fly_graphql_url: String,
    pub load_balancer_class: String,
    pub leader_election: bool,
    pub leader_election_namespace: String,
    pub health_probe_addr: SocketAddr,
    pub tunnel: TunnelConfig,
}

fn required(value: Option<String>, flag: &str, env: &str) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OperatorError::Configuration(format!("--{} or {} is required", flag, env)))
}

impl OperatorConfig {
    pub fn from_args(args: Args) -> Result<Self> {
        let fly_api_token = required(args.fly_api_token, "fly-api-token", "FLY_API_TOKEN")?;
        let fly_org = required(args.fly_org, "fly-org", "FLY_ORG")?;
        let fly_region = required(args.fly_region, "fly-region", "FLY_REGION")?;

        let health_probe_addr = args
            .health_probe_bind_address
            .parse::<SocketAddr>()
            .map_err(|e| {
                OperatorError::Configuration(format!(
                    "invalid --health-probe-bind-address {:?}: {}",
                    args.health_probe_bind_address, e
                ))
            })?;

        let namespace = if args.namespace.trim().is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            args.namespace
        };

        Ok(Self {
            fly_api_token,
            fly_api_url: args.fly_api_url,
            fly_graphql_url: args.fly_graphql_url,
            load_balancer_class: args.load_balancer_class,
            leader_election: args.leader_election,
            leader_election_namespace: args.leader_election_namespace,
            health_probe_addr,
            tunnel: TunnelConfig {
                fly_org,
                fly_region,
                fly_machine_size: args.fly_machine_size,
                frps_image: args.frps_image,
                frpc_image: args.frpc_image,
                operator_namespace: namespace,
            },
        })
    }
}

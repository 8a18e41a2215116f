//! Tunnel lifecycle: provision, update and teardown of everything backing
//! one Service.
//!
//! The manager keeps no state between calls. Identifiers of remote resources
//! travel back to the caller in [`TunnelResult`] and are persisted as Service
//! annotations by the reconciler.

pub mod machine;
pub mod saga;
pub mod workload;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::annotations::{self, TunnelState};
use crate::error::{OperatorError, Result};
use crate::naming::{self, NameKind};
use crate::provider::{Machine, MachineInput, ProviderError, TunnelProvider, STATE_STARTED};
use crate::resources;

use saga::Saga;
use workload::{FrpcSpec, FrpcWorkload, WorkloadClient};

/// How long the provider may take to start a new machine.
pub const MACHINE_START_TIMEOUT: Duration = Duration::from_secs(60);

/// Slack on top of [`MACHINE_START_TIMEOUT`] before the local guard fires.
const WAIT_GUARD_SLACK: Duration = Duration::from_secs(5);

/// Operator-wide settings used when building tunnel resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub fly_org: String,
    pub fly_region: String,
    pub fly_machine_size: String,
    pub frps_image: String,
    pub frpc_image: String,
    /// Namespace the frpc workloads live in
    pub operator_namespace: String,
}

/// Identifiers of a freshly provisioned tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelResult {
    pub app_name: String,
    pub machine_id: String,
    pub public_ip: String,
    pub ip_id: String,
    pub deployment_name: String,
}

impl From<&TunnelResult> for TunnelState {
    fn from(result: &TunnelResult) -> Self {
        TunnelState {
            fly_app: Some(result.app_name.clone()),
            machine_id: Some(result.machine_id.clone()),
            frpc_deployment: Some(result.deployment_name.clone()),
            ip_id: Some(result.ip_id.clone()),
            public_ip: Some(result.public_ip.clone()),
        }
    }
}

pub struct TunnelManager {
    provider: Arc<dyn TunnelProvider>,
    workloads: Arc<dyn WorkloadClient>,
    config: TunnelConfig,
}

impl TunnelManager {
    pub fn new(
        provider: Arc<dyn TunnelProvider>,
        workloads: Arc<dyn WorkloadClient>,
        config: TunnelConfig,
    ) -> Self {
        Self {
            provider,
            workloads,
            config,
        }
    }

    /// Create the app, machine, IPv4 and frpc workload for `service`.
    ///
    /// Any failure rolls back what was already created, in reverse order,
    /// before the error is returned.
    #[instrument(skip(self, service), fields(service = %key(service)))]
    pub async fn provision(&self, service: &Service) -> Result<TunnelResult> {
        let app = naming::for_service(NameKind::App, service);
        let deployment_name = naming::for_service(NameKind::Deployment, service);
        // Reject bad overrides before anything remote exists
        let requirements = resources::resolve(&annotations::of(service))?;

        let mut saga = Saga::new(format!("provision {}", key(service)));

        saga.step("creating Fly.io app", async {
            self.provider
                .ensure_app(&app, &self.config.fly_org)
                .await
                .map_err(OperatorError::from)
        })
        .await?;
        {
            let provider = self.provider.clone();
            let app = app.clone();
            saga.compensate("delete Fly.io app", move || async move {
                provider
                    .delete_app(&app)
                    .await
                    .map_err(OperatorError::from)
            });
        }

        let input = machine::build_machine_input(service, &self.config);
        let created = saga
            .step("creating machine", async {
                self.provider
                    .create_machine(&app, &input)
                    .await
                    .map_err(OperatorError::from)
            })
            .await?;
        {
            let provider = self.provider.clone();
            let app = app.clone();
            let machine_id = created.id.clone();
            saga.compensate("delete machine", move || async move {
                provider
                    .delete_machine(&app, &machine_id)
                    .await
                    .map_err(OperatorError::from)
            });
        }
        info!(app = %app, machine_id = %created.id, "Created machine");

        saga.step("waiting for machine to start", self.wait_started(&app, &created))
            .await?;

        let ip = saga
            .step("allocating IPv4", async {
                self.provider
                    .allocate_ipv4(&app)
                    .await
                    .map_err(OperatorError::from)
            })
            .await?;
        {
            let provider = self.provider.clone();
            let app = app.clone();
            let ip_id = ip.id.clone();
            saga.compensate("release IPv4", move || async move {
                provider
                    .release_ip(&app, &ip_id)
                    .await
                    .map_err(OperatorError::from)
            });
        }
        info!(app = %app, address = %ip.address, "Allocated IPv4");

        let frpc = workload::build(
            service,
            FrpcSpec {
                deployment_name: &deployment_name,
                namespace: &self.config.operator_namespace,
                image: &self.config.frpc_image,
                server_addr: &ip.address,
                resources: requirements,
            },
        );
        saga.step("deploying frpc", self.apply_workload(&frpc)).await?;
        saga.finish();

        Ok(TunnelResult {
            app_name: app,
            machine_id: created.id,
            public_ip: ip.address,
            ip_id: ip.id,
            deployment_name,
        })
    }

    /// Bring an already provisioned tunnel in line with the current Service.
    ///
    /// Re-applies the frpc workload and, when a machine is recorded, pushes
    /// a new machine config if region, services, guest or image drifted.
    #[instrument(skip(self, service), fields(service = %key(service)))]
    pub async fn update(&self, service: &Service) -> Result<()> {
        let state = TunnelState::from_service(service);

        let missing: Vec<&str> = [
            (annotations::PUBLIC_IP, state.public_ip.is_none()),
            (annotations::FRPC_DEPLOYMENT, state.frpc_deployment.is_none()),
            (annotations::FLY_APP, state.fly_app.is_none()),
        ]
        .into_iter()
        .filter_map(|(k, absent)| absent.then_some(k))
        .collect();
        let (Some(public_ip), Some(deployment_name), Some(app)) =
            (&state.public_ip, &state.frpc_deployment, &state.fly_app)
        else {
            return Err(OperatorError::Validation(format!(
                "missing annotations: {}",
                missing.join(", ")
            )));
        };

        let requirements = resources::resolve(&annotations::of(service))?;
        let frpc = workload::build(
            service,
            FrpcSpec {
                deployment_name,
                namespace: &self.config.operator_namespace,
                image: &self.config.frpc_image,
                server_addr: public_ip,
                resources: requirements,
            },
        );
        self.apply_workload(&frpc).await?;

        if let Some(machine_id) = &state.machine_id {
            let input = machine::build_machine_input(service, &self.config);
            let current = self.provider.get_machine(app, machine_id).await?;
            if machine_matches(&current, &input) {
                debug!(machine_id = %machine_id, "Machine config unchanged");
            } else {
                self.provider
                    .update_machine(app, machine_id, &input)
                    .await?;
                info!(machine_id = %machine_id, "Updated machine config");
            }
        }

        Ok(())
    }

    /// Remove everything belonging to `service`. Never fails; every step is
    /// attempted and failures are logged.
    #[instrument(skip(self, service), fields(service = %key(service)))]
    pub async fn teardown(&self, service: &Service) {
        let state = TunnelState::from_service(service);
        let app = state
            .fly_app
            .clone()
            .unwrap_or_else(|| naming::for_service(NameKind::App, service));
        let deployment_name = state
            .frpc_deployment
            .clone()
            .unwrap_or_else(|| naming::for_service(NameKind::Deployment, service));
        let namespace = &self.config.operator_namespace;

        if let Err(e) = self
            .workloads
            .delete_deployment(namespace, &deployment_name)
            .await
        {
            warn!(deployment = %deployment_name, error = %e, "Failed to delete frpc deployment");
        }
        let cm_name = workload::config_map_name(&deployment_name);
        if let Err(e) = self.workloads.delete_config_map(namespace, &cm_name).await {
            warn!(config_map = %cm_name, error = %e, "Failed to delete frpc config map");
        }

        match &state.ip_id {
            Some(ip_id) => self.release_ip(&app, ip_id).await,
            None => match self.provider.list_ips(&app).await {
                Ok(ips) => {
                    for ip in ips {
                        self.release_ip(&app, &ip.id).await;
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(app = %app, error = %e, "Failed to list IPs"),
            },
        }

        if let Some(machine_id) = &state.machine_id {
            if let Err(e) = self.provider.delete_machine(&app, machine_id).await {
                warn!(machine_id = %machine_id, error = %e, "Failed to delete machine");
            }
        }

        match self.provider.delete_app(&app).await {
            Ok(()) => info!(app = %app, "Tunnel torn down"),
            Err(e) => warn!(app = %app, error = %e, "Failed to delete Fly.io app"),
        }
    }

    async fn release_ip(&self, app: &str, ip_id: &str) {
        if let Err(e) = self.provider.release_ip(app, ip_id).await {
            warn!(ip_id = %ip_id, error = %e, "Failed to release IP");
        }
    }

    async fn wait_started(&self, app: &str, machine: &Machine) -> Result<()> {
        let wait = self.provider.wait_for_machine(
            app,
            &machine.id,
            &machine.instance_id,
            STATE_STARTED,
            MACHINE_START_TIMEOUT,
        );
        match tokio::time::timeout(MACHINE_START_TIMEOUT + WAIT_GUARD_SLACK, wait).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProviderError::Timeout(format!(
                "machine {} did not reach {}",
                machine.id, STATE_STARTED
            ))
            .into()),
        }
    }

    async fn apply_workload(&self, frpc: &FrpcWorkload) -> Result<()> {
        self.workloads.apply_config_map(&frpc.config_map).await?;
        self.workloads.apply_deployment(&frpc.deployment).await
    }
}

fn machine_matches(current: &Machine, desired: &MachineInput) -> bool {
    current.region == desired.region
        && current.config.image == desired.config.image
        && current.config.services == desired.config.services
        && current.config.guest == desired.config.guest
}

fn key(service: &Service) -> String {
    format!(
        "{}/{}",
        service.namespace().unwrap_or_default(),
        service.name_any()
    )
}

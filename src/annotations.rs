//! Typed access to the Service annotations the operator reads and writes.
//!
//! Annotations are the only place tunnel state is persisted. Everything the
//! operator derives (Fly.io app, machine, IP, frpc deployment) is recorded
//! here after a successful provision, and per-Service overrides are read from
//! here on every pass.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Service;

/// Prefix shared by every annotation and label this operator owns.
pub const PREFIX: &str = "fly-tunnel-operator.dev/";

// Derived state, written by the operator
pub const FLY_APP: &str = "fly-tunnel-operator.dev/fly-app";
pub const MACHINE_ID: &str = "fly-tunnel-operator.dev/machine-id";
pub const FRPC_DEPLOYMENT: &str = "fly-tunnel-operator.dev/frpc-deployment";
pub const IP_ID: &str = "fly-tunnel-operator.dev/ip-id";
pub const PUBLIC_IP: &str = "fly-tunnel-operator.dev/public-ip";

// Per-Service overrides, written by users
pub const FLY_REGION: &str = "fly-tunnel-operator.dev/fly-region";
pub const FLY_MACHINE_SIZE: &str = "fly-tunnel-operator.dev/fly-machine-size";
pub const FRPC_CPU_REQUEST: &str = "fly-tunnel-operator.dev/frpc-cpu-request";
pub const FRPC_CPU_LIMIT: &str = "fly-tunnel-operator.dev/frpc-cpu-limit";
pub const FRPC_MEMORY_REQUEST: &str = "fly-tunnel-operator.dev/frpc-memory-request";
pub const FRPC_MEMORY_LIMIT: &str = "fly-tunnel-operator.dev/frpc-memory-limit";

/// Pod template annotation carrying the hash of the frpc config.
pub const CONFIG_HASH: &str = "fly-tunnel-operator.dev/config-hash";

/// Label on frpc resources pointing back at the owning Service.
pub const SERVICE_LABEL: &str = "fly-tunnel-operator.dev/service";

/// Finalizer holding a managed Service until its tunnel is torn down.
pub const FINALIZER: &str = "fly-tunnel-operator.dev/finalizer";

/// Returns the Service annotations, or an empty map.
pub fn of(service: &Service) -> BTreeMap<String, String> {
    service.metadata.annotations.clone().unwrap_or_default()
}

fn non_empty(annotations: &BTreeMap<String, String>, key: &str) -> Option<String> {
    annotations.get(key).filter(|v| !v.is_empty()).cloned()
}

/// Tunnel identifiers recorded on a Service.
///
/// Any field may be missing: a Service that was never provisioned has none,
/// and a partially failed annotation write can leave some behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelState {
    pub fly_app: Option<String>,
    pub machine_id: Option<String>,
    pub frpc_deployment: Option<String>,
    pub ip_id: Option<String>,
    pub public_ip: Option<String>,
}

impl TunnelState {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        Self {
            fly_app: non_empty(annotations, FLY_APP),
            machine_id: non_empty(annotations, MACHINE_ID),
            frpc_deployment: non_empty(annotations, FRPC_DEPLOYMENT),
            ip_id: non_empty(annotations, IP_ID),
            public_ip: non_empty(annotations, PUBLIC_IP),
        }
    }

    pub fn from_service(service: &Service) -> Self {
        service
            .metadata
            .annotations
            .as_ref()
            .map(Self::from_annotations)
            .unwrap_or_default()
    }

    /// A recorded Fly.io app is taken to mean the tunnel was provisioned.
    pub fn is_provisioned(&self) -> bool {
        self.fly_app.is_some()
    }

    /// Annotation entries for every recorded field.
    pub fn to_annotations(&self) -> BTreeMap<String, String> {
        [
            (FLY_APP, &self.fly_app),
            (MACHINE_ID, &self.machine_id),
            (FRPC_DEPLOYMENT, &self.frpc_deployment),
            (IP_ID, &self.ip_id),
            (PUBLIC_IP, &self.public_ip),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
        .collect()
    }
}

/// Per-Service placement overrides for the Fly.io machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineOverrides {
    pub region: Option<String>,
    pub size: Option<String>,
}

impl MachineOverrides {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        Self {
            region: non_empty(annotations, FLY_REGION),
            size: non_empty(annotations, FLY_MACHINE_SIZE),
        }
    }
}

//! In-memory stand-ins for the provider, the workload store and the Service
//! store, plus fixture builders.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, LoadBalancerIngress, LoadBalancerStatus, Service, ServicePort, ServiceSpec,
    ServiceStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use crate::controllers::{ServiceClient, DEFAULT_LOAD_BALANCER_CLASS};
use crate::error::{OperatorError, Result};
use crate::provider::{IpAddress, Machine, MachineInput, ProviderError, TunnelProvider};
use crate::tunnel::workload::WorkloadClient;
use crate::tunnel::TunnelConfig;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn tunnel_config() -> TunnelConfig {
    TunnelConfig {
        fly_org: "personal".to_string(),
        fly_region: "ord".to_string(),
        fly_machine_size: "shared-cpu-1x".to_string(),
        frps_image: "snowdreamtech/frps:latest".to_string(),
        frpc_image: "snowdreamtech/frpc:latest".to_string(),
        operator_namespace: "fly-tunnel-operator-system".to_string(),
    }
}

/// A LoadBalancer Service of the default class with `(name, port, protocol)`
/// ports. An empty name leaves the port unnamed.
pub fn managed_service(namespace: &str, name: &str, ports: &[(&str, i32, &str)]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            load_balancer_class: Some(DEFAULT_LOAD_BALANCER_CLASS.to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port, protocol)| ServicePort {
                        name: (!port_name.is_empty()).then(|| port_name.to_string()),
                        port: *port,
                        protocol: Some(protocol.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn injected(op: &str) -> ProviderError {
    ProviderError::Api {
        status: 500,
        body: format!("injected failure in {}", op),
    }
}

fn missing(what: &str) -> ProviderError {
    ProviderError::Api {
        status: 404,
        body: format!("{} not found", what),
    }
}

#[derive(Debug, Default)]
struct FlyState {
    apps: BTreeSet<String>,
    /// machine id -> (app, machine)
    machines: BTreeMap<String, (String, Machine)>,
    /// ip id -> (app, address)
    ips: BTreeMap<String, (String, IpAddress)>,
    calls: Vec<String>,
    failing: BTreeSet<String>,
    wait_delay: Option<Duration>,
    next_id: u32,
}

impl FlyState {
    fn enter(&mut self, op: &str, target: &str) -> std::result::Result<(), ProviderError> {
        self.calls.push(format!("{} {}", op, target));
        if self.failing.contains(op) {
            return Err(injected(op));
        }
        Ok(())
    }

    fn next(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// Fly.io stand-in. Deleting an app removes its machines and IPs.
#[derive(Debug, Default)]
pub struct FakeProvider {
    state: Mutex<FlyState>,
}

impl FakeProvider {
    /// Make every future call to `op` fail.
    pub fn fail_on(&self, op: &str) {
        lock(&self.state).failing.insert(op.to_string());
    }

    /// Delay `wait_for_machine` by `delay` before it answers.
    pub fn delay_wait(&self, delay: Duration) {
        lock(&self.state).wait_delay = Some(delay);
    }

    pub fn seed_app(&self, app: &str) {
        lock(&self.state).apps.insert(app.to_string());
    }

    pub fn app_count(&self) -> usize {
        lock(&self.state).apps.len()
    }

    pub fn machine_count(&self) -> usize {
        lock(&self.state).machines.len()
    }

    pub fn ip_count(&self) -> usize {
        lock(&self.state).ips.len()
    }

    pub fn machine(&self, id: &str) -> Option<Machine> {
        lock(&self.state).machines.get(id).map(|(_, m)| m.clone())
    }

    /// Every call as `"<op> <target>"`, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn calls_to(&self, op: &str) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }
}

#[async_trait]
impl TunnelProvider for FakeProvider {
    async fn ensure_app(&self, app: &str, _org: &str) -> std::result::Result<(), ProviderError> {
        let mut s = lock(&self.state);
        s.enter("ensure_app", app)?;
        s.apps.insert(app.to_string());
        Ok(())
    }

    async fn delete_app(&self, app: &str) -> std::result::Result<(), ProviderError> {
        let mut s = lock(&self.state);
        s.enter("delete_app", app)?;
        s.apps.remove(app);
        s.machines.retain(|_, (owner, _)| owner != app);
        s.ips.retain(|_, (owner, _)| owner != app);
        Ok(())
    }

    async fn create_machine(
        &self,
        app: &str,
        input: &MachineInput,
    ) -> std::result::Result<Machine, ProviderError> {
        let mut s = lock(&self.state);
        s.enter("create_machine", app)?;
        if !s.apps.contains(app) {
            return Err(missing("app"));
        }
        let n = s.next();
        let machine = Machine {
            id: format!("m{}", n),
            name: input.name.clone(),
            state: "created".to_string(),
            region: input.region.clone(),
            instance_id: format!("inst{}", n),
            private_ip: format!("fdaa::{}", n),
            config: input.config.clone(),
        };
        s.machines
            .insert(machine.id.clone(), (app.to_string(), machine.clone()));
        Ok(machine)
    }

    async fn get_machine(
        &self,
        app: &str,
        machine_id: &str,
    ) -> std::result::Result<Machine, ProviderError> {
        let mut s = lock(&self.state);
        s.enter("get_machine", machine_id)?;
        match s.machines.get(machine_id) {
            Some((owner, m)) if owner == app => Ok(m.clone()),
            _ => Err(missing("machine")),
        }
    }

    async fn update_machine(
        &self,
        app: &str,
        machine_id: &str,
        input: &MachineInput,
    ) -> std::result::Result<Machine, ProviderError> {
        let mut s = lock(&self.state);
        s.enter("update_machine", machine_id)?;
        match s.machines.get_mut(machine_id) {
            Some((owner, m)) if owner == app => {
                m.config = input.config.clone();
                m.region = input.region.clone();
                Ok(m.clone())
            }
            _ => Err(missing("machine")),
        }
    }

    async fn delete_machine(
        &self,
        _app: &str,
        machine_id: &str,
    ) -> std::result::Result<(), ProviderError> {
        let mut s = lock(&self.state);
        s.enter("delete_machine", machine_id)?;
        s.machines.remove(machine_id);
        Ok(())
    }

    async fn wait_for_machine(
        &self,
        _app: &str,
        machine_id: &str,
        _instance_id: &str,
        state: &str,
        _timeout: Duration,
    ) -> std::result::Result<(), ProviderError> {
        let delay = {
            let mut s = lock(&self.state);
            s.enter("wait_for_machine", machine_id)?;
            s.wait_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut s = lock(&self.state);
        match s.machines.get_mut(machine_id) {
            Some((_, m)) => {
                m.state = state.to_string();
                Ok(())
            }
            None => Err(missing("machine")),
        }
    }

    async fn allocate_ipv4(&self, app: &str) -> std::result::Result<IpAddress, ProviderError> {
        let mut s = lock(&self.state);
        s.enter("allocate_ipv4", app)?;
        if !s.apps.contains(app) {
            return Err(ProviderError::GraphQl("Could not find App".to_string()));
        }
        let n = s.next();
        let ip = IpAddress {
            id: format!("ip{}", n),
            address: format!("137.66.0.{}", n),
            kind: "v4".to_string(),
            region: "global".to_string(),
            created_at: String::new(),
        };
        s.ips.insert(ip.id.clone(), (app.to_string(), ip.clone()));
        Ok(ip)
    }

    async fn release_ip(&self, _app: &str, ip_id: &str) -> std::result::Result<(), ProviderError> {
        let mut s = lock(&self.state);
        s.enter("release_ip", ip_id)?;
        s.ips.remove(ip_id);
        Ok(())
    }

    async fn list_ips(&self, app: &str) -> std::result::Result<Vec<IpAddress>, ProviderError> {
        let mut s = lock(&self.state);
        s.enter("list_ips", app)?;
        if !s.apps.contains(app) {
            return Err(ProviderError::GraphQl("Could not find App".to_string()));
        }
        Ok(s
            .ips
            .values()
            .filter(|(owner, _)| owner == app)
            .map(|(_, ip)| ip.clone())
            .collect())
    }
}

#[derive(Debug, Default)]
struct WorkloadState {
    config_maps: BTreeMap<(String, String), ConfigMap>,
    deployments: BTreeMap<(String, String), Deployment>,
    failing: BTreeSet<String>,
    calls: Vec<String>,
}

impl WorkloadState {
    fn enter(&mut self, op: &str) -> Result<()> {
        self.calls.push(op.to_string());
        if self.failing.contains(op) {
            return Err(OperatorError::KubeApi(format!("injected failure in {}", op)));
        }
        Ok(())
    }
}

fn object_key(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

/// In-cluster workload stand-in.
#[derive(Debug, Default)]
pub struct FakeWorkloads {
    state: Mutex<WorkloadState>,
}

impl FakeWorkloads {
    pub fn fail_on(&self, op: &str) {
        lock(&self.state).failing.insert(op.to_string());
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        lock(&self.state)
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        lock(&self.state)
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn calls_to(&self, op: &str) -> usize {
        lock(&self.state).calls.iter().filter(|c| *c == op).count()
    }
}

#[async_trait]
impl WorkloadClient for FakeWorkloads {
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let mut s = lock(&self.state);
        s.enter("apply_config_map")?;
        s.config_maps
            .insert(object_key(&config_map.metadata), config_map.clone());
        Ok(())
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<()> {
        let mut s = lock(&self.state);
        s.enter("apply_deployment")?;
        s.deployments
            .insert(object_key(&deployment.metadata), deployment.clone());
        Ok(())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let mut s = lock(&self.state);
        s.enter("delete_deployment")?;
        s.deployments
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let mut s = lock(&self.state);
        s.enter("delete_config_map")?;
        s.config_maps
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ServiceStore {
    objects: BTreeMap<(String, String), Service>,
    version: u64,
    /// Gets remaining before a simulated concurrent write, per key
    write_after_get: BTreeMap<(String, String), u32>,
}

impl ServiceStore {
    fn bump(&mut self, key: &(String, String)) {
        self.version += 1;
        let version = self.version.to_string();
        if let Some(svc) = self.objects.get_mut(key) {
            svc.metadata.resource_version = Some(version);
        }
    }

    fn object(&mut self, namespace: &str, name: &str) -> Result<&mut Service> {
        self.objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| OperatorError::NotFound(format!("services \"{}\"", name)))
    }

    /// A terminating object without finalizers is gone.
    fn collect(&mut self, key: &(String, String)) {
        let gone = self.objects.get(key).is_some_and(|svc| {
            svc.metadata.deletion_timestamp.is_some()
                && svc.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty())
        });
        if gone {
            self.objects.remove(key);
        }
    }
}

fn check_version(name: &str, resource_version: &Option<String>, svc: &Service) -> Result<()> {
    if resource_version.is_some() && *resource_version != svc.metadata.resource_version {
        return Err(OperatorError::Conflict(format!(
            "Operation cannot be fulfilled on services \"{}\": the object has been modified",
            name
        )));
    }
    Ok(())
}

/// Service store with resource versions, finalizer-gated deletion and
/// optimistic concurrency on annotation writes.
#[derive(Debug, Default)]
pub struct FakeServices {
    store: Mutex<ServiceStore>,
}

impl FakeServices {
    pub fn with(services: Vec<Service>) -> Self {
        let fake = Self::default();
        {
            let mut store = lock(&fake.store);
            for svc in services {
                let key = object_key(&svc.metadata);
                store.objects.insert(key.clone(), svc);
                store.bump(&key);
            }
        }
        fake
    }

    pub fn current(&self, namespace: &str, name: &str) -> Option<Service> {
        lock(&self.store)
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Request deletion the way the API server does.
    pub fn mark_deleted(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        let mut store = lock(&self.store);
        if let Some(svc) = store.objects.get_mut(&key) {
            svc.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        store.bump(&key);
        store.collect(&key);
    }

    pub fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str) {
        let key = (namespace.to_string(), name.to_string());
        let mut store = lock(&self.store);
        if let Some(svc) = store.objects.get_mut(&key) {
            svc.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(finalizer.to_string());
        }
        store.bump(&key);
    }

    pub fn clear_ingress(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        let mut store = lock(&self.store);
        if let Some(svc) = store.objects.get_mut(&key) {
            svc.status = None;
        }
        store.bump(&key);
    }

    /// Change the object right after the `nth` following get, as another
    /// writer would.
    pub fn concurrent_write_after_get(&self, namespace: &str, name: &str, nth: u32) {
        lock(&self.store)
            .write_after_get
            .insert((namespace.to_string(), name.to_string()), nth);
    }
}

#[async_trait]
impl ServiceClient for FakeServices {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let key = (namespace.to_string(), name.to_string());
        let mut store = lock(&self.store);
        let found = store.objects.get(&key).cloned();

        if let Some(remaining) = store.write_after_get.get_mut(&key) {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                store.write_after_get.remove(&key);
                store.bump(&key);
            }
        }
        Ok(found)
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut store = lock(&self.store);
        let svc = store.object(namespace, name)?;
        check_version(name, &resource_version, svc)?;
        svc.metadata.finalizers = Some(finalizers);
        store.bump(&key);
        store.collect(&key);
        Ok(())
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut store = lock(&self.store);
        let svc = store.object(namespace, name)?;
        check_version(name, &resource_version, svc)?;
        svc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations);
        store.bump(&key);
        Ok(())
    }

    async fn patch_ingress(&self, namespace: &str, name: &str, ip: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let mut store = lock(&self.store);
        store.object(namespace, name)?.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    ip: Some(ip.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
        store.bump(&key);
        Ok(())
    }
}

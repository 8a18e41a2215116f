//! Service Controller
//!
//! Drives each managed LoadBalancer Service through provision, update and
//! teardown of its tunnel, recording the result on the Service itself.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::annotations::{TunnelState, FINALIZER};
use crate::controllers::admission::{is_managed, AdmissionFilter};
use crate::controllers::{error_policy_backoff, RequeueBackoff};
use crate::error::{OperatorError, Result};
use crate::tunnel::TunnelManager;

/// Reads and writes on Services needed by the reconciler.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Fetch a Service, `None` if it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// Replace the finalizer list. With a resource version the write fails
    /// with a conflict if the Service changed since.
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<()>;

    /// Merge `annotations` into the Service. With a resource version the
    /// write fails with a conflict if the Service changed since.
    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        annotations: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Set `status.loadBalancer.ingress` to the single address `ip`.
    async fn patch_ingress(&self, namespace: &str, name: &str, ip: &str) -> Result<()>;
}

/// [`ServiceClient`] backed by the Kubernetes API.
pub struct KubeServiceClient {
    client: Client,
}

impl KubeServiceClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ServiceClient for KubeServiceClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let mut metadata = json!({ "finalizers": finalizers });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = json!(rv);
        }
        let patch = json!({ "metadata": metadata });
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_annotations(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        annotations: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut metadata = json!({ "annotations": annotations });
        if let Some(rv) = resource_version {
            metadata["resourceVersion"] = json!(rv);
        }
        let patch = json!({ "metadata": metadata });
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_ingress(&self, namespace: &str, name: &str, ip: &str) -> Result<()> {
        let patch = json!({
            "status": { "loadBalancer": { "ingress": [{ "ip": ip }] } }
        });
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn has_finalizer(service: &Service) -> bool {
    service.finalizers().iter().any(|f| f == FINALIZER)
}

fn ingress_ip(service: &Service) -> Option<&str> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .and_then(|i| i.ip.as_deref())
}

/// One reconcile pass for one Service.
pub struct ServiceReconciler {
    services: Arc<dyn ServiceClient>,
    manager: Arc<TunnelManager>,
    class: String,
}

impl ServiceReconciler {
    pub fn new(
        services: Arc<dyn ServiceClient>,
        manager: Arc<TunnelManager>,
        class: impl Into<String>,
    ) -> Self {
        Self {
            services,
            manager,
            class: class.into(),
        }
    }

    /// Reconcile the Service `namespace/name` as currently stored in the API.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let Some(service) = self.services.get(namespace, name).await? else {
            debug!("Service no longer exists");
            return Ok(Action::await_change());
        };

        // A Service that leaves our class keeps its finalizer and tunnel;
        // deleting it afterwards stays Terminating until the finalizer is
        // removed by hand.
        if !is_managed(&service, &self.class) {
            return Ok(Action::await_change());
        }

        if service.metadata.deletion_timestamp.is_some() {
            self.handle_deletion(&service, namespace, name).await?;
            return Ok(Action::await_change());
        }

        let service = if has_finalizer(&service) {
            service
        } else {
            let mut finalizers = service.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            self.services
                .set_finalizers(
                    namespace,
                    name,
                    service.metadata.resource_version.clone(),
                    finalizers,
                )
                .await?;
            match self.services.get(namespace, name).await? {
                Some(service) => service,
                None => return Ok(Action::await_change()),
            }
        };

        let state = TunnelState::from_service(&service);
        if state.is_provisioned() {
            self.reconcile_existing(&service, &state, namespace, name)
                .await?;
        } else {
            self.reconcile_new(&service, namespace, name).await?;
        }

        Ok(Action::await_change())
    }

    async fn handle_deletion(&self, service: &Service, namespace: &str, name: &str) -> Result<()> {
        info!("Tearing down tunnel for deleted Service");
        self.manager.teardown(service).await;

        if has_finalizer(service) {
            let remaining: Vec<String> = service
                .finalizers()
                .iter()
                .filter(|f| *f != FINALIZER)
                .cloned()
                .collect();
            self.services
                .set_finalizers(
                    namespace,
                    name,
                    service.metadata.resource_version.clone(),
                    remaining,
                )
                .await?;
        }
        info!("Tunnel teardown complete");
        Ok(())
    }

    async fn reconcile_new(&self, service: &Service, namespace: &str, name: &str) -> Result<()> {
        info!("Provisioning tunnel for Service");
        let result = self.manager.provision(service).await?;
        let annotations = TunnelState::from(&result).to_annotations();

        // Provisioning takes a while; write against the latest version
        let Some(current) = self.services.get(namespace, name).await? else {
            warn!("Service vanished during provisioning, releasing tunnel");
            let mut orphan = service.clone();
            orphan.metadata.annotations = Some(annotations);
            self.manager.teardown(&orphan).await;
            return Ok(());
        };

        self.services
            .patch_annotations(
                namespace,
                name,
                current.metadata.resource_version.clone(),
                annotations,
            )
            .await?;
        self.services
            .patch_ingress(namespace, name, &result.public_ip)
            .await?;

        info!(
            public_ip = %result.public_ip,
            machine_id = %result.machine_id,
            "Tunnel provisioned"
        );
        Ok(())
    }

    async fn reconcile_existing(
        &self,
        service: &Service,
        state: &TunnelState,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        if let Some(public_ip) = &state.public_ip {
            if ingress_ip(service) != Some(public_ip.as_str()) {
                self.services
                    .patch_ingress(namespace, name, public_ip)
                    .await?;
                info!(public_ip = %public_ip, "Updated Service status with public IP");
            }
        }

        if let Err(e) = self.manager.update(service).await {
            error!(error = %e, "Failed to update tunnel");
        }
        Ok(())
    }
}

/// Runs the [`ServiceReconciler`] under the kube-runtime controller.
pub struct ServiceController {
    client: Client,
    reconciler: ServiceReconciler,
    backoff: RequeueBackoff,
}

impl ServiceController {
    pub fn new(client: Client, manager: Arc<TunnelManager>, class: impl Into<String>) -> Self {
        let services = Arc::new(KubeServiceClient::new(client.clone()));
        Self {
            client,
            reconciler: ServiceReconciler::new(services, manager, class),
            backoff: RequeueBackoff::default(),
        }
    }

    /// Run the controller until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let services: Api<Service> = Api::all(self.client.clone());
        let (reader, writer) = reflector::store();
        let mut admission = AdmissionFilter::new(self.reconciler.class.clone());

        let events = watcher(services, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .filter_map(move |event| {
                future::ready(match event {
                    Ok(event) => admission.admit(event).map(Ok),
                    Err(e) => Some(Err(e)),
                })
            });

        info!(class = %self.reconciler.class, "Starting Service controller");

        Controller::for_stream(events, reader)
            .shutdown_on_signal()
            .run(
                |service, ctx| async move { ctx.reconcile(service).await },
                |service, error, ctx| {
                    error_policy_backoff(&ctx.backoff, &key(&service), error)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled Service: {}", obj.name);
                    }
                    Err(kube::runtime::controller::Error::ObjectNotFound(obj)) => {
                        debug!("Service no longer exists: {:?}", obj);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {:?}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    async fn reconcile(&self, service: Arc<Service>) -> std::result::Result<Action, OperatorError> {
        let namespace = service.namespace().unwrap_or_default();
        let name = service.name_any();
        let span = info_span!("reconcile", namespace = %namespace, name = %name);

        let action = self
            .reconciler
            .reconcile(&namespace, &name)
            .instrument(span)
            .await?;
        self.backoff.reset(&key(&service));
        Ok(action)
    }
}

fn key(service: &Service) -> String {
    format!(
        "{}/{}",
        service.namespace().unwrap_or_default(),
        service.name_any()
    )
}

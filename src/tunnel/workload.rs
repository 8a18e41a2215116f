//! In-cluster frpc workload: a ConfigMap holding the client config and a
//! single-replica Deployment mounting it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec,
    ResourceRequirements, Service, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::Client;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::annotations::{CONFIG_HASH, SERVICE_LABEL};
use crate::error::{OperatorError, Result};
use crate::frp;
use crate::naming::{self, NameKind};

/// Field manager for server-side apply.
pub const FIELD_MANAGER: &str = "fly-tunnel-operator";

/// ConfigMap key holding the frpc config.
pub const CONFIG_KEY: &str = "frpc.toml";

const CONFIG_DIR: &str = "/etc/frp";
const CONFIG_VOLUME: &str = "config";

/// Name of the ConfigMap belonging to a frpc Deployment.
pub fn config_map_name(deployment: &str) -> String {
    format!("{}-config", deployment)
}

/// Hex SHA-256 of the rendered client config.
pub fn config_hash(config: &str) -> String {
    hex::encode(Sha256::digest(config.as_bytes()))
}

/// Inputs shared by the ConfigMap and the Deployment.
pub struct FrpcSpec<'a> {
    pub deployment_name: &'a str,
    pub namespace: &'a str,
    pub image: &'a str,
    pub server_addr: &'a str,
    pub resources: ResourceRequirements,
}

/// The rendered pair, ready to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct FrpcWorkload {
    pub config_map: ConfigMap,
    pub deployment: Deployment,
}

fn selector_labels(service: &Service) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "frpc".to_string()),
        (
            SERVICE_LABEL.to_string(),
            naming::for_service(NameKind::Label, service),
        ),
    ])
}

fn common_labels(service: &Service) -> BTreeMap<String, String> {
    let mut labels = selector_labels(service);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        FIELD_MANAGER.to_string(),
    );
    labels
}

/// Render the ConfigMap and Deployment tunnelling `service` through the frps
/// at `spec.server_addr`.
pub fn build(service: &Service, spec: FrpcSpec<'_>) -> FrpcWorkload {
    let client_config = frp::client_config(service, spec.server_addr, frp::DEFAULT_SERVER_PORT);
    let hash = config_hash(&client_config);
    let cm_name = config_map_name(spec.deployment_name);
    let labels = common_labels(service);

    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(cm_name.clone()),
            namespace: Some(spec.namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CONFIG_KEY.to_string(), client_config)])),
        ..Default::default()
    };

    let container = Container {
        name: "frpc".to_string(),
        image: Some(spec.image.to_string()),
        command: Some(vec!["frpc".to_string()]),
        args: Some(vec![
            "-c".to_string(),
            format!("{}/{}", CONFIG_DIR, CONFIG_KEY),
        ]),
        resources: Some(spec.resources),
        volume_mounts: Some(vec![VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: CONFIG_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(spec.deployment_name.to_string()),
            namespace: Some(spec.namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector_labels(service)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(CONFIG_HASH.to_string(), hash)])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: CONFIG_VOLUME.to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: cm_name,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    FrpcWorkload {
        config_map,
        deployment,
    }
}

/// Writes to the frpc ConfigMap and Deployment.
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Create the ConfigMap, or update it when it already exists.
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()>;

    /// Create the Deployment, or update it when it already exists.
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<()>;

    /// Delete a Deployment. A missing Deployment is not an error.
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    /// Delete a ConfigMap. A missing ConfigMap is not an error.
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()>;
}

/// [`WorkloadClient`] backed by the Kubernetes API.
pub struct KubeWorkloads {
    client: Client,
}

impl KubeWorkloads {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

/// Server-side apply `object`, creating it when missing. Every field is
/// owned by [`FIELD_MANAGER`] from the first write, so fields dropped from
/// the desired object are pruned on the next apply.
async fn apply<K>(api: Api<K>, object: &K) -> Result<()>
where
    K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let name = object
        .meta()
        .name
        .clone()
        .ok_or_else(|| OperatorError::InvalidState("object has no name".to_string()))?;

    api.patch(&name, &apply_params(), &Patch::Apply(object)).await?;
    Ok(())
}

async fn delete<K>(api: Api<K>, name: &str) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!(name = %name, "Already deleted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloads {
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<()> {
        let namespace = config_map.metadata.namespace.as_deref().unwrap_or("default");
        apply(Api::namespaced(self.client.clone(), namespace), config_map).await
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> Result<()> {
        let namespace = deployment.metadata.namespace.as_deref().unwrap_or("default");
        apply(Api::namespaced(self.client.clone(), namespace), deployment).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        delete::<Deployment>(Api::namespaced(self.client.clone(), namespace), name).await
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        delete::<ConfigMap>(Api::namespaced(self.client.clone(), namespace), name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources;
    use crate::testing::managed_service;

    fn render(addr: &str) -> FrpcWorkload {
        let svc = managed_service("default", "web", &[("http", 80, "TCP")]);
        build(
            &svc,
            FrpcSpec {
                deployment_name: "frpc-default-web",
                namespace: "fly-tunnel-operator-system",
                image: "snowdreamtech/frpc:latest",
                server_addr: addr,
                resources: resources::default_requirements(),
            },
        )
    }

    fn pod_hash(workload: &FrpcWorkload) -> String {
        workload
            .deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(CONFIG_HASH))
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_config_map_contents() {
        let workload = render("137.66.1.1");
        let cm = &workload.config_map;
        assert_eq!(cm.metadata.name.as_deref(), Some("frpc-default-web-config"));
        assert_eq!(
            cm.metadata.namespace.as_deref(),
            Some("fly-tunnel-operator-system")
        );
        let config = cm.data.as_ref().unwrap().get(CONFIG_KEY).unwrap();
        assert!(config.starts_with("serverAddr = \"137.66.1.1\""));
    }

    #[test]
    fn test_deployment_shape() {
        let workload = render("137.66.1.1");
        let spec = workload.deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));

        let selector = spec.selector.match_labels.as_ref().unwrap();
        assert_eq!(selector.get(SERVICE_LABEL).map(String::as_str), Some("default-web"));
        let pod_labels = spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        for (k, v) in selector {
            assert_eq!(pod_labels.get(k), Some(v));
        }

        let pod = spec.template.spec.as_ref().unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("snowdreamtech/frpc:latest"));
        assert_eq!(container.command, Some(vec!["frpc".to_string()]));
        assert_eq!(
            container.args,
            Some(vec!["-c".to_string(), "/etc/frp/frpc.toml".to_string()])
        );
        let mount = &container.volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/etc/frp");
        assert_eq!(mount.read_only, Some(true));

        let volume = &pod.volumes.as_ref().unwrap()[0];
        assert_eq!(
            volume.config_map.as_ref().map(|c| c.name.as_str()),
            Some("frpc-default-web-config")
        );
    }

    #[test]
    fn test_writes_are_forced_applies_under_one_manager() {
        let params = apply_params();
        assert_eq!(params.field_manager.as_deref(), Some(FIELD_MANAGER));
        assert!(params.force);
        assert!(!params.dry_run);
    }

    #[test]
    fn test_config_hash_tracks_content() {
        let a = render("137.66.1.1");
        let b = render("137.66.1.1");
        let c = render("137.66.2.2");
        assert_eq!(pod_hash(&a), pod_hash(&b));
        assert_ne!(pod_hash(&a), pod_hash(&c));

        let config = a.config_map.data.as_ref().unwrap().get(CONFIG_KEY).unwrap();
        assert_eq!(pod_hash(&a), config_hash(config));
        assert_eq!(pod_hash(&a).len(), 64);
    }
}

//! Lease-based leader election.
//!
//! Only the replica holding the `fly-tunnel-operator` Lease runs the Service
//! controller, so exactly one writer touches provider resources and
//! annotations at a time. Standby replicas block in
//! [`LeaderElector::acquire`] until the holder stops renewing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, error, info, warn};

pub const LEASE_NAME: &str = "fly-tunnel-operator";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Namespace for the Lease: the explicit value, else the pod's own
/// namespace, else `fallback`.
pub fn detect_namespace(explicit: &str, fallback: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// What to do with an existing Lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    /// We hold it; refresh renewTime
    Renew,
    /// Expired or unheld; take it over
    TakeOver,
    /// Someone else holds a live lease
    Wait,
}

fn claim(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> Claim {
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(identity) {
        return Claim::Renew;
    }
    if holder.map_or(true, str::is_empty) || is_expired(spec, now) {
        Claim::TakeOver
    } else {
        Claim::Wait
    }
}

fn is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS) as i64;
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(t)) => now.signed_duration_since(*t).num_seconds() > duration_secs,
        None => true,
    }
}

/// Next spec for a Lease we are claiming.
fn claimed_spec(prev: Option<&LeaseSpec>, identity: &str, now: &MicroTime, takeover: bool) -> LeaseSpec {
    let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);
    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(LEASE_DURATION_SECS),
        acquire_time: if takeover {
            Some(now.clone())
        } else {
            prev.and_then(|s| s.acquire_time.clone())
        },
        renew_time: Some(now.clone()),
        lease_transitions: Some(match prev {
            Some(_) if takeover => transitions + 1,
            _ => transitions,
        }),
        ..Default::default()
    }
}

pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("fly-tunnel-operator-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, "Initialized leader elector");
        Self { lease_api, identity }
    }

    /// Blocks until the lease is ours.
    pub async fn acquire(&self) -> anyhow::Result<()> {
        info!(identity = %self.identity, lease = LEASE_NAME, "Waiting for leader lease");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => debug!(retry_in = ?RETRY_INTERVAL, "Lease held by another replica"),
                Err(e) => warn!(error = %e, retry_in = ?RETRY_INTERVAL, "Lease acquisition failed"),
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Keep renewing until leadership is lost. Only returns on loss.
    pub async fn hold(&self) {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.renew().await {
                Ok(true) => {}
                Ok(false) => {
                    error!(identity = %self.identity, "Lost leader lease");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew leader lease");
                    return;
                }
            }
        }
    }

    /// Returns `Ok(true)` while still leader, `Ok(false)` once lost.
    pub async fn renew(&self) -> anyhow::Result<bool> {
        let lease = self.lease_api.get(LEASE_NAME).await?;
        let now = MicroTime(Utc::now());
        if claim(lease.spec.as_ref(), &self.identity, now.0) != Claim::Renew {
            return Ok(false);
        }
        let renewed = self.replace(&lease, &now, false).await?;
        if !renewed {
            warn!("Lease conflict during renewal");
        }
        Ok(renewed)
    }

    /// Clear the holder so a standby can take over without waiting for expiry.
    pub async fn release(&self) {
        let lease = match self.lease_api.get(LEASE_NAME).await {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "Failed to read lease for release");
                return;
            }
        };
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!("Lease not held by us, skipping release");
            return;
        }

        let mut released = lease.clone();
        if let Some(spec) = released.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &released)
            .await
        {
            Ok(_) => info!(identity = %self.identity, "Released leader lease"),
            Err(e) => warn!(error = %e, "Failed to release leader lease"),
        }
    }

    async fn try_acquire(&self) -> anyhow::Result<bool> {
        let now = MicroTime(Utc::now());
        match self.lease_api.get_opt(LEASE_NAME).await? {
            Some(existing) => match claim(existing.spec.as_ref(), &self.identity, now.0) {
                Claim::Renew => self.replace(&existing, &now, false).await,
                Claim::TakeOver => self.replace(&existing, &now, true).await,
                Claim::Wait => Ok(false),
            },
            None => self.create(&now).await,
        }
    }

    async fn create(&self, now: &MicroTime) -> anyhow::Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(claimed_spec(None, &self.identity, now, true)),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a claimed spec over `existing`. The carried resourceVersion
    /// makes a concurrent writer lose with 409.
    async fn replace(&self, existing: &Lease, now: &MicroTime, takeover: bool) -> anyhow::Result<bool> {
        let mut updated = existing.clone();
        updated.spec = Some(claimed_spec(existing.spec.as_ref(), &self.identity, now, takeover));
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

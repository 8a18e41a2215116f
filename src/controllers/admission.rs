//! Watch event admission for Services.
//!
//! Every Service in the cluster flows through the watch, but only managed
//! Services with a meaningful change reach the controller queue. Status
//! echoes from the operator's own writes are dropped here.

use std::collections::{HashMap, HashSet};

use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Event;
use tracing::trace;

use crate::annotations::PUBLIC_IP;

/// loadBalancerClass claimed when none is configured.
pub const DEFAULT_LOAD_BALANCER_CLASS: &str = "fly-tunnel-operator.dev/lb";

/// A Service is managed when it is a LoadBalancer of our class.
pub fn is_managed(service: &Service, class: &str) -> bool {
    service.spec.as_ref().is_some_and(|spec| {
        spec.type_.as_deref() == Some("LoadBalancer")
            && spec.load_balancer_class.as_deref() == Some(class)
    })
}

fn ingress_ip(service: &Service) -> Option<&str> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|ingress| ingress.first())
        .map(|i| i.ip.as_deref().unwrap_or_default())
}

/// Decide whether the transition `old -> new` needs a reconcile. `old` is
/// `None` for a Service seen for the first time.
pub fn should_reconcile(old: Option<&Service>, new: &Service, class: &str) -> bool {
    if !is_managed(new, class) {
        return false;
    }
    let Some(old) = old else {
        return true;
    };

    let ports = |s: &Service| s.spec.as_ref().and_then(|spec| spec.ports.clone());
    if ports(old) != ports(new) {
        return true;
    }
    if old.metadata.annotations != new.metadata.annotations {
        return true;
    }
    if new.metadata.deletion_timestamp.is_some() {
        return true;
    }

    let Some(ip) = ingress_ip(new) else {
        return true;
    };
    let expected = new
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PUBLIC_IP))
        .filter(|v| !v.is_empty());
    matches!(expected, Some(expected) if expected != ip)
}

/// Stateful filter over watch events, remembering the last version of every
/// Service so updates can be compared against it.
pub struct AdmissionFilter {
    class: String,
    last_seen: HashMap<ObjectRef<Service>, Service>,
    relisted: Option<HashSet<ObjectRef<Service>>>,
}

impl AdmissionFilter {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            last_seen: HashMap::new(),
            relisted: None,
        }
    }

    /// Returns the Service to enqueue, if the event warrants a reconcile.
    pub fn admit(&mut self, event: Event<Service>) -> Option<Service> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                None
            }
            Event::InitApply(service) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(ObjectRef::from_obj(&service));
                }
                self.observe(service)
            }
            Event::InitDone => {
                // Forget Services deleted while the watch was down
                if let Some(seen) = self.relisted.take() {
                    self.last_seen.retain(|key, _| seen.contains(key));
                }
                None
            }
            Event::Apply(service) => self.observe(service),
            Event::Delete(service) => {
                self.last_seen.remove(&ObjectRef::from_obj(&service));
                is_managed(&service, &self.class).then_some(service)
            }
        }
    }

    /// Only managed Services are remembered; one leaving the class is
    /// forgotten and counts as new if it comes back.
    fn observe(&mut self, service: Service) -> Option<Service> {
        let key = ObjectRef::from_obj(&service);
        if !is_managed(&service, &self.class) {
            self.last_seen.remove(&key);
            trace!(service = %key, "Ignoring unmanaged Service");
            return None;
        }
        let admit = should_reconcile(self.last_seen.get(&key), &service, &self.class);
        if !admit {
            trace!(service = %key, "Ignoring event");
        }
        self.last_seen.insert(key, service.clone());
        admit.then_some(service)
    }
}

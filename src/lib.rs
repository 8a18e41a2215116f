//! Fly.io tunnel operator
//!
//! Gives `LoadBalancer` Services of a dedicated `loadBalancerClass` a public
//! IPv4 address. Each Service gets a Fly.io App running an frps Machine with
//! a dedicated address, and an in-cluster frpc Deployment that forwards the
//! Service's ports through it.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: v1
//! kind: Service
//! metadata:
//!   name: web
//!   annotations:
//!     fly-tunnel-operator.dev/fly-region: ams
//! spec:
//!   type: LoadBalancer
//!   loadBalancerClass: fly-tunnel-operator.dev/lb
//!   ports:
//!     - name: http
//!       port: 80
//! ```
//!
//! All state lives in annotations on the Service itself; there is no CRD.

pub mod annotations;
pub mod config;
pub mod controllers;
pub mod error;
pub mod frp;
pub mod health;
pub mod leader_election;
pub mod naming;
pub mod provider;
pub mod resources;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use controllers::{ServiceController, ServiceReconciler};
pub use error::{OperatorError, Result};
pub use provider::{FlyClient, TunnelProvider};
pub use tunnel::{TunnelConfig, TunnelManager, TunnelResult};

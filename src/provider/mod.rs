//! Remote tunnel-server provider (Fly.io).
//!
//! The lifecycle manager talks to the provider only through
//! [`TunnelProvider`]; [`FlyClient`] is the production implementation over the
//! Machines REST API and the platform GraphQL API.

mod client;
mod types;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

pub use client::{FlyClient, DEFAULT_API_URL, DEFAULT_GRAPHQL_URL};
pub use types::{
    GuestConfig, InitConfig, IpAddress, Machine, MachineConfig, MachineInput, MachinePort,
    MachineService,
};

/// Machine state the provisioner waits for.
pub const STATE_STARTED: &str = "started";

/// Errors returned by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The request never produced a response
    Http(String),
    /// The API answered with a non-success status
    Api { status: u16, body: String },
    /// The GraphQL endpoint reported an error
    GraphQl(String),
    /// The response body could not be decoded
    Decode(String),
    /// A wait did not complete in time
    Timeout(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        match self {
            ProviderError::Api { status, .. } => *status == 404,
            ProviderError::GraphQl(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("not found") || msg.contains("could not find")
            }
            _ => false,
        }
    }

    /// True when the target already exists.
    pub fn is_conflict(&self) -> bool {
        match self {
            ProviderError::Api { status: 409, .. } => true,
            ProviderError::Api { status: 422, body } => body.to_lowercase().contains("already"),
            _ => false,
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Http(msg) => write!(f, "request failed: {}", msg),
            ProviderError::Api { status, body } => write!(f, "status {}, body: {}", status, body),
            ProviderError::GraphQl(msg) => write!(f, "graphql error: {}", msg),
            ProviderError::Decode(msg) => write!(f, "decoding response: {}", msg),
            ProviderError::Timeout(msg) => write!(f, "timed out: {}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else {
            ProviderError::Http(err.to_string())
        }
    }
}

/// Operations the lifecycle manager needs from the remote provider.
///
/// Deletes and releases treat a missing target as success so teardown can be
/// repeated safely.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Create the app in `org`. An app that already exists is not an error.
    async fn ensure_app(&self, app: &str, org: &str) -> Result<(), ProviderError>;

    async fn delete_app(&self, app: &str) -> Result<(), ProviderError>;

    async fn create_machine(&self, app: &str, input: &MachineInput)
        -> Result<Machine, ProviderError>;

    async fn get_machine(&self, app: &str, machine_id: &str) -> Result<Machine, ProviderError>;

    async fn update_machine(
        &self,
        app: &str,
        machine_id: &str,
        input: &MachineInput,
    ) -> Result<Machine, ProviderError>;

    async fn delete_machine(&self, app: &str, machine_id: &str) -> Result<(), ProviderError>;

    /// Block until the machine instance reaches `state` or `timeout` passes.
    async fn wait_for_machine(
        &self,
        app: &str,
        machine_id: &str,
        instance_id: &str,
        state: &str,
        timeout: Duration,
    ) -> Result<(), ProviderError>;

    async fn allocate_ipv4(&self, app: &str) -> Result<IpAddress, ProviderError>;

    async fn release_ip(&self, app: &str, ip_id: &str) -> Result<(), ProviderError>;

    async fn list_ips(&self, app: &str) -> Result<Vec<IpAddress>, ProviderError>;
}

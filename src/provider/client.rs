//! HTTP client for the Fly.io Machines REST API and platform GraphQL API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use super::types::{
    AllocateIpData, AppIpsData, CreateAppRequest, GraphQlRequest, GraphQlResponse,
};
use super::{IpAddress, Machine, MachineInput, ProviderError, TunnelProvider};

pub const DEFAULT_API_URL: &str = "https://api.machines.dev";
pub const DEFAULT_GRAPHQL_URL: &str = "https://api.fly.io/graphql";

const API_VERSION: &str = "v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const ALLOCATE_IP_MUTATION: &str = r#"
mutation($input: AllocateIPAddressInput!) {
  allocateIpAddress(input: $input) {
    ipAddress { id address type region createdAt }
  }
}"#;

const RELEASE_IP_MUTATION: &str = r#"
mutation($input: ReleaseIPAddressInput!) {
  releaseIpAddress(input: $input) {
    app { name }
  }
}"#;

const LIST_IPS_QUERY: &str = r#"
query($appName: String!) {
  app(name: $appName) {
    ipAddresses { nodes { id address type region createdAt } }
  }
}"#;

/// Fly.io API client authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct FlyClient {
    http: reqwest::Client,
    api_url: String,
    graphql_url: String,
    token: String,
}

impl FlyClient {
    pub fn new(token: impl Into<String>) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            api_url: DEFAULT_API_URL.to_string(),
            graphql_url: DEFAULT_GRAPHQL_URL.to_string(),
            token: token.into(),
        })
    }

    /// Point the REST calls at a different host.
    #[must_use]
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    #[must_use]
    pub fn with_graphql_url(mut self, url: impl Into<String>) -> Self {
        self.graphql_url = url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.api_url.trim_end_matches('/'),
            API_VERSION,
            path.trim_start_matches('/')
        )
    }

    fn with_auth(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.token)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ProviderError> {
        Ok(self.with_auth(builder).send().await?)
    }

    /// Turn a non-success response into [`ProviderError::Api`].
    async fn check(response: Response) -> Result<Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
        let response = Self::check(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, ProviderError> {
        let request = GraphQlRequest { query, variables };
        let response = self
            .send(self.http.post(&self.graphql_url).json(&request))
            .await?;
        let body: GraphQlResponse<T> = Self::json(response).await?;

        if let Some(err) = body.errors.into_iter().next() {
            return Err(ProviderError::GraphQl(err.message));
        }
        body.data
            .ok_or_else(|| ProviderError::Decode("graphql response has no data".to_string()))
    }
}

#[async_trait]
impl TunnelProvider for FlyClient {
    async fn ensure_app(&self, app: &str, org: &str) -> Result<(), ProviderError> {
        let body = CreateAppRequest {
            app_name: app,
            org_slug: org,
        };
        let response = self.send(self.http.post(self.url("apps")).json(&body)).await?;
        match Self::check(response).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(app = %app, "Fly.io app already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_app(&self, app: &str) -> Result<(), ProviderError> {
        let url = self.url(&format!("apps/{}", app));
        let response = self
            .send(self.http.delete(url).query(&[("force", "true")]))
            .await?;
        match Self::check(response).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    async fn create_machine(
        &self,
        app: &str,
        input: &MachineInput,
    ) -> Result<Machine, ProviderError> {
        let url = self.url(&format!("apps/{}/machines", app));
        let response = self.send(self.http.post(url).json(input)).await?;
        Self::json(response).await
    }

    async fn get_machine(&self, app: &str, machine_id: &str) -> Result<Machine, ProviderError> {
        let url = self.url(&format!("apps/{}/machines/{}", app, machine_id));
        let response = self.send(self.http.get(url)).await?;
        Self::json(response).await
    }

    async fn update_machine(
        &self,
        app: &str,
        machine_id: &str,
        input: &MachineInput,
    ) -> Result<Machine, ProviderError> {
        let url = self.url(&format!("apps/{}/machines/{}", app, machine_id));
        let response = self.send(self.http.post(url).json(input)).await?;
        Self::json(response).await
    }

    async fn delete_machine(&self, app: &str, machine_id: &str) -> Result<(), ProviderError> {
        let url = self.url(&format!("apps/{}/machines/{}", app, machine_id));
        let response = self
            .send(self.http.delete(url).query(&[("force", "true")]))
            .await?;
        match Self::check(response).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    async fn wait_for_machine(
        &self,
        app: &str,
        machine_id: &str,
        instance_id: &str,
        state: &str,
        timeout: Duration,
    ) -> Result<(), ProviderError> {
        let url = self.url(&format!("apps/{}/machines/{}/wait", app, machine_id));
        let timeout_secs = timeout.as_secs().to_string();
        let request = self.http.get(url).query(&[
            ("instance_id", instance_id),
            ("state", state),
            ("timeout", timeout_secs.as_str()),
        ]);
        let response = self.send(request).await?;

        if response.status() == StatusCode::REQUEST_TIMEOUT {
            return Err(ProviderError::Timeout(format!(
                "machine {} did not reach {} within {}s",
                machine_id, state, timeout_secs
            )));
        }
        Self::check(response).await.map(|_| ())
    }

    async fn allocate_ipv4(&self, app: &str) -> Result<IpAddress, ProviderError> {
        let variables = json!({ "input": { "appId": app, "type": "v4" } });
        let data: AllocateIpData = self.graphql(ALLOCATE_IP_MUTATION, variables).await?;
        Ok(data.allocate_ip_address.ip_address)
    }

    async fn release_ip(&self, app: &str, ip_id: &str) -> Result<(), ProviderError> {
        let variables = json!({ "input": { "appId": app, "ipAddressId": ip_id } });
        match self
            .graphql::<serde_json::Value>(RELEASE_IP_MUTATION, variables)
            .await
        {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    async fn list_ips(&self, app: &str) -> Result<Vec<IpAddress>, ProviderError> {
        let variables = json!({ "appName": app });
        let data: AppIpsData = self.graphql(LIST_IPS_QUERY, variables).await?;
        Ok(data.app.ip_addresses.nodes)
    }
}

//! [`ExtensionApiClient`]: the engine's view of every registered domain service.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use pipeline::extension::HEALTH_CHECK_TIMEOUT;
use pipeline::{
    DomainServiceClient, DomainServiceError, DomainServiceName, ExtensionRequest, ExtensionResponse,
    HealthStatus, RepositoryContext,
};

use crate::registry::{Endpoint, ServiceEntry, ServiceRegistry};
use crate::transport::{http_exchange, unix_exchange, TransportError};

/// Implements [`DomainServiceClient`] over the transports in a [`ServiceRegistry`].
#[derive(Debug, Clone)]
pub struct ExtensionApiClient {
    registry: ServiceRegistry,
    http: reqwest::Client,
}

impl ExtensionApiClient {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
        }
    }

    fn entry(&self, domain: &DomainServiceName) -> Result<&ServiceEntry, DomainServiceError> {
        self.registry
            .get(domain)
            .ok_or_else(|| DomainServiceError::UnknownDomain(domain.clone()))
    }

    /// One exchange, bounded by `timeout`, with the reply validated.
    async fn call(
        &self,
        entry: &ServiceEntry,
        request: &ExtensionRequest,
        timeout: Duration,
    ) -> Result<ExtensionResponse, DomainServiceError> {
        let timeout = entry.timeout.map_or(timeout, |limit| limit.min(timeout));
        let exchange = async {
            match &entry.endpoint {
                Endpoint::Unix(path) => unix_exchange(path, request).await,
                Endpoint::Http(url) => http_exchange(&self.http, url, request).await,
            }
        };
        let bytes = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| DomainServiceError::Timeout {
                domain: entry.name.clone(),
                after: timeout,
            })?
            .map_err(|e| transport_error(&entry.name, e))?;

        ExtensionResponse::from_slice(&bytes).map_err(|source| DomainServiceError::Fault {
            domain: entry.name.clone(),
            source,
        })
    }
}

fn transport_error(domain: &DomainServiceName, error: TransportError) -> DomainServiceError {
    match error {
        TransportError::Connect(reason) => DomainServiceError::Unavailable {
            domain: domain.clone(),
            reason,
        },
        other => DomainServiceError::Transport {
            domain: domain.clone(),
            message: other.to_string(),
        },
    }
}

#[async_trait]
impl DomainServiceClient for ExtensionApiClient {
    #[instrument(skip(self, repository), fields(domain = %domain))]
    async fn health_check(&self, domain: &DomainServiceName, repository: &RepositoryContext) -> HealthStatus {
        let entry = match self.entry(domain) {
            Ok(entry) => entry,
            Err(e) => {
                return HealthStatus::Unhealthy { reason: e.to_string() };
            }
        };
        let request = ExtensionRequest::health_check(
            repository.clone(),
            domain.clone(),
            format!("health:{domain}"),
        );
        match self.call(entry, &request, HEALTH_CHECK_TIMEOUT).await {
            Ok(response) => {
                let status = HealthStatus::from_response(&response);
                debug!(healthy = status.is_healthy(), "Health check answered");
                status
            }
            Err(e) => {
                warn!(error = %e, "Health check failed");
                HealthStatus::Unhealthy { reason: e.to_string() }
            }
        }
    }

    #[instrument(
        skip(self, request),
        fields(domain = %request.domain, operation = %request.operation, trace_id = %request.trace_id)
    )]
    async fn invoke(
        &self,
        request: &ExtensionRequest,
        timeout: Duration,
    ) -> Result<ExtensionResponse, DomainServiceError> {
        let entry = self.entry(&request.domain)?;
        let response = self.call(entry, request, timeout).await?;
        debug!(
            status = ?response.status,
            diagnostics = response.diagnostics.len(),
            artifacts = response.artifacts.len(),
            "Domain service answered"
        );
        Ok(response)
    }
}

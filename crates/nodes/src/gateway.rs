//! Domain-service access with per-invocation health checks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, warn};

use pipeline::{
    DomainServiceClient, DomainServiceError, DomainServiceName, ExtensionRequest,
    ExtensionResponse, HealthStatus, RepositoryContext,
};

type HealthCell = Arc<OnceCell<HealthStatus>>;

/// Wraps a [`DomainServiceClient`] so that every domain is health-checked
/// once before its first operation in an invocation.
///
/// The health result is cached for the lifetime of the gateway. An unhealthy
/// domain fails every dependent node of the invocation with
/// [`DomainServiceError::Unavailable`]; it is not re-probed until the next
/// trigger.
pub struct DomainGateway {
    client: Arc<dyn DomainServiceClient>,
    checked: Mutex<HashMap<DomainServiceName, HealthCell>>,
}

impl DomainGateway {
    pub fn new(client: Arc<dyn DomainServiceClient>) -> Self {
        Self {
            client,
            checked: Mutex::new(HashMap::new()),
        }
    }

    /// Health-checks `domain` unless it was already checked.
    ///
    /// Each domain has its own cell: parallel nodes on one domain share a
    /// single probe, probes of different domains run concurrently.
    pub async fn ensure_healthy(
        &self,
        domain: &DomainServiceName,
        repository: &RepositoryContext,
    ) -> Result<(), DomainServiceError> {
        let cell = self
            .checked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(domain.clone())
            .or_default()
            .clone();
        let status = cell
            .get_or_init(|| async {
                let status = self.client.health_check(domain, repository).await;
                match &status {
                    HealthStatus::Healthy { api_version } => {
                        debug!(domain = %domain, api_version = %api_version, "Domain service healthy");
                    }
                    HealthStatus::Unhealthy { reason } => {
                        warn!(domain = %domain, reason = %reason, "Domain service unhealthy");
                    }
                }
                status
            })
            .await;
        match status {
            HealthStatus::Healthy { .. } => Ok(()),
            HealthStatus::Unhealthy { reason } => Err(DomainServiceError::Unavailable {
                domain: domain.clone(),
                reason: reason.clone(),
            }),
        }
    }

    /// Health-checks the target domain, then invokes the operation.
    pub async fn invoke(
        &self,
        request: &ExtensionRequest,
        timeout: Duration,
    ) -> Result<ExtensionResponse, DomainServiceError> {
        self.ensure_healthy(&request.domain, &request.repository).await?;
        debug!(
            domain = %request.domain,
            operation = %request.operation,
            trace_id = %request.trace_id,
            "Invoking domain service"
        );
        self.client.invoke(request, timeout).await
    }
}

impl std::fmt::Debug for DomainGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainGateway").finish_non_exhaustive()
    }
}

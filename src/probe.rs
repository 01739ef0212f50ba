use std::time::Duration;

use tracing::{info, warn};

use crate::error::FetchError;
use crate::normalize;
use crate::registry::{BackendDescriptor, Operation};
use crate::request::{Params, build_request};
use crate::session::SessionHandle;

pub const DEFAULT_CANARY: &str = "naruto";

/// Canary search against one backend.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    canary: String,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(canary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            canary: canary.into(),
            timeout,
        }
    }

    /// Single attempt. Healthy means a success status and at least one
    /// element under the backend's search result keys.
    pub async fn probe(&self, session: &SessionHandle, backend: &BackendDescriptor) -> bool {
        match self.check(session, backend).await {
            Ok(results) => {
                info!(backend = backend.name(), results, "backend is healthy");
                true
            }
            Err(err) => {
                warn!(
                    backend = backend.name(),
                    kind = err.kind(),
                    error = %err,
                    "backend probe failed"
                );
                false
            }
        }
    }

    async fn check(
        &self,
        session: &SessionHandle,
        backend: &BackendDescriptor,
    ) -> Result<usize, FetchError> {
        let params = Params::new()
            .with("query", self.canary.as_str())
            .with("page", "1");
        let spec = build_request(backend, Operation::Search, &params)?;
        let payload = session.execute(&spec, Some(self.timeout)).await?;
        match normalize::result_count(backend.shape(), Operation::Search, &payload)? {
            0 => Err(FetchError::EmptyResult),
            results => Ok(results),
        }
    }
}

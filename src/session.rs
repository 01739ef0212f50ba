use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use crate::error::FetchError;
use crate::request::{Method, RequestSpec};

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub timeout: Duration,
    pub max_connections: usize,
    pub max_connections_per_host: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_connections: 10,
            max_connections_per_host: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unopened,
    Open,
    Closed,
}

enum SessionState {
    Unopened,
    Open(Client),
    Closed,
}

/// The pooled upstream HTTP client. Opened on first use, closed once, never
/// reopened.
pub struct SessionHandle {
    settings: SessionSettings,
    state: Mutex<SessionState>,
    total: Arc<Semaphore>,
    per_host: StdMutex<HashMap<String, Arc<Semaphore>>>,
}

impl SessionHandle {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            total: Arc::new(Semaphore::new(settings.max_connections)),
            settings,
            state: Mutex::new(SessionState::Unopened),
            per_host: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        match *self.state.lock().await {
            SessionState::Unopened => SessionPhase::Unopened,
            SessionState::Open(_) => SessionPhase::Open,
            SessionState::Closed => SessionPhase::Closed,
        }
    }

    /// Shared client, created on the first call. Concurrent first calls are
    /// serialized on the state lock so only one client is ever built.
    pub async fn client(&self) -> Result<Client, FetchError> {
        let mut state = self.state.lock().await;
        match &*state {
            SessionState::Open(client) => Ok(client.clone()),
            SessionState::Closed => Err(FetchError::SessionClosed),
            SessionState::Unopened => {
                let client = Client::builder()
                    .timeout(self.settings.timeout)
                    .pool_max_idle_per_host(self.settings.max_connections_per_host)
                    .build()?;
                info!(
                    max_connections = self.settings.max_connections,
                    max_per_host = self.settings.max_connections_per_host,
                    "opened upstream http session"
                );
                *state = SessionState::Open(client.clone());
                Ok(client)
            }
        }
    }

    /// Returns true only for the call that performed the transition.
    pub async fn close(&self) -> bool {
        let mut state = self.state.lock().await;
        let previous = std::mem::replace(&mut *state, SessionState::Closed);
        match previous {
            SessionState::Closed => {
                debug!("upstream http session already closed");
                false
            }
            SessionState::Open(client) => {
                drop(client);
                self.close_limits();
                info!("closed upstream http session");
                true
            }
            SessionState::Unopened => {
                self.close_limits();
                info!("closed upstream http session before first use");
                true
            }
        }
    }

    /// Send `spec` and parse the body as JSON. `timeout` overrides the
    /// session-wide total timeout for this request only. The limit covers
    /// waiting for a connection slot as well as the exchange itself.
    pub async fn execute(
        &self,
        spec: &RequestSpec,
        timeout: Option<Duration>,
    ) -> Result<Value, FetchError> {
        let client = self.client().await?;
        let limit = timeout.unwrap_or(self.settings.timeout);
        tokio::time::timeout(limit, self.send(&client, spec, limit))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    async fn send(
        &self,
        client: &Client,
        spec: &RequestSpec,
        limit: Duration,
    ) -> Result<Value, FetchError> {
        let host = spec.url.host_str().unwrap_or_default().to_string();
        let _permits = self.acquire(&host).await?;

        let request = match spec.method {
            Method::Get => client.get(spec.url.clone()),
            Method::Post => {
                let request = client.post(spec.url.clone());
                match &spec.body {
                    Some(body) => request.json(body),
                    None => request,
                }
            }
        };

        let response = request.timeout(limit).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn acquire(
        &self,
        host: &str,
    ) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), FetchError> {
        let total = Arc::clone(&self.total)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::SessionClosed)?;
        let host_limit = {
            let mut hosts = self
                .per_host
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(hosts.entry(host.to_string()).or_insert_with(|| {
                Arc::new(Semaphore::new(self.settings.max_connections_per_host))
            }))
        };
        let per_host = host_limit
            .acquire_owned()
            .await
            .map_err(|_| FetchError::SessionClosed)?;
        Ok((total, per_host))
    }

    fn close_limits(&self) {
        self.total.close();
        let hosts = self
            .per_host
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for semaphore in hosts.values() {
            semaphore.close();
        }
    }
}

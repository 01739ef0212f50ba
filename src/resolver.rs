use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::probe::HealthProbe;
use crate::registry::{BackendDescriptor, Registry};
use crate::session::SessionHandle;

/// Binds the first healthy backend and keeps it until [`Resolver::clear`].
///
/// The bind lock is held for a whole probing pass, so concurrent callers
/// wait for that pass and observe its result instead of probing again.
pub struct Resolver {
    registry: Registry,
    probe: HealthProbe,
    bound: Mutex<Option<Arc<BackendDescriptor>>>,
}

impl Resolver {
    pub fn new(registry: Registry, probe: HealthProbe) -> Self {
        Self {
            registry,
            probe,
            bound: Mutex::new(None),
        }
    }

    pub async fn resolve(&self, session: &SessionHandle) -> Option<Arc<BackendDescriptor>> {
        let mut bound = self.bound.lock().await;
        if let Some(backend) = bound.as_ref() {
            return Some(Arc::clone(backend));
        }
        if self.registry.is_empty() {
            error!("no upstream backends configured");
            return None;
        }

        info!(candidates = self.registry.len(), "probing upstream backends");
        for backend in self.registry.iter() {
            let healthy = self.probe.probe(session, backend).await;
            backend.mark_live(healthy);
            if healthy {
                info!(backend = backend.name(), "bound active backend");
                *bound = Some(Arc::clone(backend));
                return Some(Arc::clone(backend));
            }
        }

        error!(
            candidates = self.registry.len(),
            "no upstream backend available"
        );
        None
    }

    /// Currently bound backend, without probing.
    pub async fn active(&self) -> Option<Arc<BackendDescriptor>> {
        self.bound.lock().await.clone()
    }

    pub async fn clear(&self) {
        if let Some(backend) = self.bound.lock().await.take() {
            info!(backend = backend.name(), "released active backend");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Endpoint, Operation, ResponseShape};
    use crate::session::SessionSettings;
    use serde_json::json;
    use std::time::Duration;

    fn backend(name: &str, base_url: &str, path: &'static str) -> BackendDescriptor {
        BackendDescriptor::new(name, base_url, ResponseShape::Consumet)
            .with_endpoint(Operation::Search, Endpoint::Get(path))
    }

    fn resolver(backends: Vec<BackendDescriptor>) -> Resolver {
        Resolver::new(
            Registry::new(backends),
            HealthProbe::new("naruto", Duration::from_secs(5)),
        )
    }

    fn healthy_body() -> String {
        json!({ "results": [{ "id": "naruto", "title": "Naruto" }] }).to_string()
    }

    #[tokio::test]
    async fn test_skips_failing_backend() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/a/search?q=naruto")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;
        let healthy = server
            .mock("GET", "/b/search?q=naruto")
            .with_status(200)
            .with_body(healthy_body())
            .expect(1)
            .create_async()
            .await;

        let resolver = resolver(vec![
            backend("A", &format!("{}/a", server.url()), "/search?q={query}"),
            backend("B", &format!("{}/b", server.url()), "/search?q={query}"),
        ]);
        let session = SessionHandle::new(SessionSettings::default());

        let bound = resolver.resolve(&session).await.expect("B binds");
        assert_eq!(bound.name(), "B");
        assert!(bound.is_live());
        failing.assert_async().await;
        healthy.assert_async().await;
    }

    #[tokio::test]
    async fn test_prefers_earlier_healthy_backend() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("GET", "/a/search?q=naruto")
            .with_status(200)
            .with_body(healthy_body())
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/b/search?q=naruto")
            .with_status(200)
            .with_body(healthy_body())
            .expect(0)
            .create_async()
            .await;

        let resolver = resolver(vec![
            backend("A", &format!("{}/a", server.url()), "/search?q={query}"),
            backend("B", &format!("{}/b", server.url()), "/search?q={query}"),
        ]);
        let session = SessionHandle::new(SessionSettings::default());

        assert_eq!(resolver.resolve(&session).await.unwrap().name(), "A");
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_binding_is_sticky() {
        let mut server = mockito::Server::new_async().await;
        let healthy = server
            .mock("GET", "/a/search?q=naruto")
            .with_status(200)
            .with_body(healthy_body())
            .expect(1)
            .create_async()
            .await;

        let resolver = resolver(vec![backend(
            "A",
            &format!("{}/a", server.url()),
            "/search?q={query}",
        )]);
        let session = SessionHandle::new(SessionSettings::default());
        let first = resolver.resolve(&session).await.unwrap();
        healthy.assert_async().await;

        healthy.remove_async().await;
        let _down = server
            .mock("GET", "/a/search?q=naruto")
            .with_status(503)
            .expect(0)
            .create_async()
            .await;

        let second = resolver.resolve(&session).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_all_failing_returns_none_and_retries_later() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/a/search?q=naruto")
            .with_status(502)
            .expect(2)
            .create_async()
            .await;

        let resolver = resolver(vec![backend(
            "A",
            &format!("{}/a", server.url()),
            "/search?q={query}",
        )]);
        let session = SessionHandle::new(SessionSettings::default());

        assert!(resolver.resolve(&session).await.is_none());
        assert!(resolver.resolve(&session).await.is_none());
        assert!(resolver.active().await.is_none());
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_resolve_probes_once() {
        let mut server = mockito::Server::new_async().await;
        let healthy = server
            .mock("GET", "/a/search?q=naruto")
            .with_status(200)
            .with_body(healthy_body())
            .expect(1)
            .create_async()
            .await;

        let resolver = Arc::new(resolver(vec![backend(
            "A",
            &format!("{}/a", server.url()),
            "/search?q={query}",
        )]));
        let session = Arc::new(SessionHandle::new(SessionSettings::default()));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                let session = Arc::clone(&session);
                tokio::spawn(async move { resolver.resolve(&session).await })
            })
            .collect();
        let mut bound = Vec::new();
        for task in tasks {
            bound.push(task.await.unwrap().expect("bound"));
        }
        assert!(bound.iter().all(|b| Arc::ptr_eq(b, &bound[0])));
        healthy.assert_async().await;
    }

    #[tokio::test]
    async fn test_clear_releases_binding() {
        let mut server = mockito::Server::new_async().await;
        let _healthy = server
            .mock("GET", "/a/search?q=naruto")
            .with_status(200)
            .with_body(healthy_body())
            .create_async()
            .await;

        let resolver = resolver(vec![backend(
            "A",
            &format!("{}/a", server.url()),
            "/search?q={query}",
        )]);
        let session = SessionHandle::new(SessionSettings::default());
        resolver.resolve(&session).await.unwrap();
        assert!(resolver.active().await.is_some());

        resolver.clear().await;
        assert!(resolver.active().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_registry_resolves_to_none() {
        let resolver = resolver(Vec::new());
        let session = SessionHandle::new(SessionSettings::default());

        assert!(resolver.resolve(&session).await.is_none());
        assert!(resolver.active().await.is_none());
    }
}

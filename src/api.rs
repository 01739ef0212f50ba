use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::normalize::{normalize_anime, normalize_episodes, normalize_streams};
use crate::probe::{DEFAULT_CANARY, HealthProbe};
use crate::records::{AnimeRecord, EpisodeRecord, StreamSource};
use crate::registry::{BackendDescriptor, Operation, Registry};
use crate::request::{Params, build_request};
use crate::resolver::Resolver;
use crate::session::{SessionHandle, SessionPhase, SessionSettings};

const CACHE_CAPACITY: u64 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Category {
    #[default]
    Sub,
    Dub,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Sub => "sub",
            Category::Dub => "dub",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub session: SessionSettings,
    pub probe_timeout: Duration,
    pub canary: String,
    /// Zero disables the result cache.
    pub cache_ttl: Duration,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            probe_timeout: Duration::from_secs(8),
            canary: DEFAULT_CANARY.to_string(),
            cache_ttl: Duration::from_secs(600),
        }
    }
}

/// The four fetch operations over whichever backend is bound.
///
/// Nothing here returns an error: every failure becomes an empty result and
/// a log event naming the backend, operation and failure kind.
pub struct AnimeApi {
    resolver: Resolver,
    session: SessionHandle,
    search_cache: Option<Cache<String, Vec<AnimeRecord>>>,
    episode_cache: Option<Cache<String, Vec<EpisodeRecord>>>,
}

impl AnimeApi {
    pub fn new(registry: Registry, settings: ApiSettings) -> Self {
        let probe = HealthProbe::new(settings.canary, settings.probe_timeout);
        Self {
            resolver: Resolver::new(registry, probe),
            session: SessionHandle::new(settings.session),
            search_cache: build_cache(settings.cache_ttl),
            episode_cache: build_cache(settings.cache_ttl),
        }
    }

    pub async fn resolve(&self) -> Option<Arc<BackendDescriptor>> {
        if self.session.phase().await == SessionPhase::Closed {
            return None;
        }
        self.resolver.resolve(&self.session).await
    }

    pub async fn active_backend(&self) -> Option<Arc<BackendDescriptor>> {
        self.resolver.active().await
    }

    /// Blank queries are rejected before any network activity.
    pub async fn search(&self, query: &str) -> Vec<AnimeRecord> {
        if query.trim().is_empty() {
            debug!("rejecting blank search query");
            return Vec::new();
        }
        let params = Params::new().with("query", query).with("page", "1");
        self.run(
            Operation::Search,
            params,
            self.search_cache.as_ref(),
            query,
            |backend, payload| normalize_anime(backend.shape(), Operation::Search, payload),
        )
        .await
    }

    pub async fn recent(&self, page: u32) -> Vec<EpisodeRecord> {
        let params = Params::new().with("page", page.max(1).to_string());
        self.run(Operation::Recent, params, None, "", |backend, payload| {
            normalize_episodes(backend.shape(), Operation::Recent, payload)
        })
        .await
    }

    pub async fn list_episodes(&self, anime_id: &str) -> Vec<EpisodeRecord> {
        if anime_id.trim().is_empty() {
            debug!("rejecting blank anime id");
            return Vec::new();
        }
        let params = Params::new().with("id", anime_id);
        self.run(
            Operation::Episodes,
            params,
            self.episode_cache.as_ref(),
            anime_id,
            |backend, payload| normalize_episodes(backend.shape(), Operation::Episodes, payload),
        )
        .await
    }

    /// `server` falls back to the bound backend's default server and
    /// `category` to [`Category::Sub`]. Backends without those hints ignore
    /// them.
    pub async fn stream_sources(
        &self,
        episode_id: &str,
        server: Option<&str>,
        category: Option<Category>,
    ) -> Vec<StreamSource> {
        if episode_id.trim().is_empty() {
            debug!("rejecting blank episode id");
            return Vec::new();
        }
        let backend = match self.bind().await {
            Ok(backend) => backend,
            Err(err) => {
                report(Operation::Stream, None, &err);
                return Vec::new();
            }
        };

        let params = Params::new()
            .with("id", episode_id)
            .with("server", server.unwrap_or(backend.default_server()))
            .with("category", category.unwrap_or_default().as_str());
        let result = self
            .fetch(&backend, Operation::Stream, &params)
            .await
            .and_then(|payload| normalize_streams(backend.shape(), &payload));
        result.unwrap_or_else(|err| {
            report(Operation::Stream, Some(backend.name()), &err);
            Vec::new()
        })
    }

    /// Close the session, release the bound backend and drop cached results.
    /// Only the first call does anything; later calls return false.
    pub async fn shutdown(&self) -> bool {
        if !self.session.close().await {
            return false;
        }
        self.resolver.clear().await;
        if let Some(cache) = &self.search_cache {
            cache.invalidate_all();
        }
        if let Some(cache) = &self.episode_cache {
            cache.invalidate_all();
        }
        info!("anime api shut down");
        true
    }

    async fn bind(&self) -> Result<Arc<BackendDescriptor>, FetchError> {
        if self.session.phase().await == SessionPhase::Closed {
            return Err(FetchError::SessionClosed);
        }
        self.resolver
            .resolve(&self.session)
            .await
            .ok_or(FetchError::NoBackend)
    }

    async fn fetch(
        &self,
        backend: &BackendDescriptor,
        operation: Operation,
        params: &Params,
    ) -> Result<Value, FetchError> {
        let spec = build_request(backend, operation, params)?;
        debug!(backend = backend.name(), operation = %operation, url = %spec.url, "fetching");
        self.session.execute(&spec, None).await
    }

    async fn run<T, F>(
        &self,
        operation: Operation,
        params: Params,
        cache: Option<&Cache<String, Vec<T>>>,
        cache_key: &str,
        extract: F,
    ) -> Vec<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&BackendDescriptor, &Value) -> Result<Vec<T>, FetchError>,
    {
        let backend = match self.bind().await {
            Ok(backend) => backend,
            Err(err) => {
                report(operation, None, &err);
                return Vec::new();
            }
        };

        let key = format!("{}:{}:{}", backend.name(), operation, cache_key);
        if let Some(cache) = cache
            && let Some(hit) = cache.get(&key).await
        {
            debug!(backend = backend.name(), operation = %operation, "cache hit");
            return hit;
        }

        let result = self
            .fetch(&backend, operation, &params)
            .await
            .and_then(|payload| extract(&backend, &payload));

        match result {
            Ok(records) => {
                if !records.is_empty()
                    && let Some(cache) = cache
                {
                    cache.insert(key, records.clone()).await;
                }
                records
            }
            Err(err) => {
                report(operation, Some(backend.name()), &err);
                Vec::new()
            }
        }
    }
}

fn build_cache<T>(ttl: Duration) -> Option<Cache<String, Vec<T>>>
where
    T: Clone + Send + Sync + 'static,
{
    if ttl.is_zero() {
        return None;
    }
    Some(
        Cache::builder()
            .max_capacity(CACHE_CAPACITY)
            .time_to_live(ttl)
            .build(),
    )
}

fn report(operation: Operation, backend: Option<&str>, err: &FetchError) {
    let backend = backend.unwrap_or("none");
    match err {
        FetchError::Unsupported { .. } => debug!(
            backend,
            operation = %operation,
            kind = err.kind(),
            "operation not supported; returning empty result"
        ),
        _ => warn!(
            backend,
            operation = %operation,
            kind = err.kind(),
            upstream_down = err.is_upstream_unavailable(),
            error = %err,
            "fetch failed; returning empty result"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{EpisodeCount, EpisodeNumber, StreamFormat};
    use crate::registry::{Endpoint, ResponseShape};
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn settings(cache_ttl: Duration) -> ApiSettings {
        ApiSettings {
            cache_ttl,
            ..ApiSettings::default()
        }
    }

    fn consumet_like(name: &str, base_url: String) -> BackendDescriptor {
        BackendDescriptor::new(name, base_url, ResponseShape::Consumet)
            .with_endpoint(Operation::Search, Endpoint::Get("/search?q={query}"))
            .with_endpoint(Operation::Recent, Endpoint::Get("/recent?page={page}"))
            .with_endpoint(Operation::Episodes, Endpoint::Get("/info/{id}"))
            .with_endpoint(
                Operation::Stream,
                Endpoint::Get("/watch/{id}?server={server}&category={category}"),
            )
            .with_default_server("gogocdn")
    }

    async fn mock_probe(server: &mut Server, prefix: &str, status: usize) -> mockito::Mock {
        server
            .mock("GET", format!("{prefix}/search?q=naruto").as_str())
            .with_status(status)
            .with_body(json!({ "results": [{ "id": "naruto", "title": "Naruto" }] }).to_string())
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_search_scenario_falls_through_to_second_backend() {
        let mut server = Server::new_async().await;
        let _a = mock_probe(&mut server, "/a", 500).await;
        let _b = mock_probe(&mut server, "/b", 200).await;
        let _search = server
            .mock("GET", "/b/search?q=naruto%20shippuden")
            .with_status(200)
            .with_body(
                json!({ "results": [{ "title": "Naruto", "totalEpisodes": 220, "id": "naruto-1" }] })
                    .to_string(),
            )
            .create_async()
            .await;

        let api = AnimeApi::new(
            Registry::new(vec![
                consumet_like("A", format!("{}/a", server.url())),
                consumet_like("B", format!("{}/b", server.url())),
            ]),
            settings(Duration::ZERO),
        );

        assert_eq!(api.resolve().await.unwrap().name(), "B");
        let records = api.search("naruto shippuden").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "Naruto");
        assert_eq!(records[0].episodes, EpisodeCount::Known(220));
        assert_eq!(records[0].id, "naruto-1");
    }

    #[tokio::test]
    async fn test_empty_query_never_reaches_network() {
        let mut server = Server::new_async().await;
        let any = server
            .mock("GET", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let api = AnimeApi::new(
            Registry::new(vec![consumet_like("A", server.url())]),
            settings(Duration::ZERO),
        );
        assert!(api.search("").await.is_empty());
        assert!(api.search("   ").await.is_empty());
        any.assert_async().await;
    }

    #[tokio::test]
    async fn test_no_backend_yields_empty_results() {
        let mut server = Server::new_async().await;
        let _a = mock_probe(&mut server, "/a", 503).await;
        let _b = mock_probe(&mut server, "/b", 404).await;

        let api = AnimeApi::new(
            Registry::new(vec![
                consumet_like("A", format!("{}/a", server.url())),
                consumet_like("B", format!("{}/b", server.url())),
            ]),
            settings(Duration::ZERO),
        );
        assert!(api.resolve().await.is_none());
        assert!(api.search("naruto").await.is_empty());
        assert!(api.recent(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failures_are_absorbed() {
        let mut server = Server::new_async().await;
        let _probe = mock_probe(&mut server, "", 200).await;
        let _recent = server
            .mock("GET", "/recent?page=1")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;
        let _episodes = server
            .mock("GET", "/info/naruto")
            .with_status(500)
            .create_async()
            .await;

        let api = AnimeApi::new(
            Registry::new(vec![consumet_like("A", server.url())]),
            settings(Duration::ZERO),
        );
        assert!(api.recent(0).await.is_empty());
        assert!(api.list_episodes("naruto").await.is_empty());
        assert!(api.list_episodes("").await.is_empty());
    }

    #[tokio::test]
    async fn test_recent_and_episodes() {
        let mut server = Server::new_async().await;
        let _probe = mock_probe(&mut server, "", 200).await;
        let _recent = server
            .mock("GET", "/recent?page=2")
            .with_status(200)
            .with_body(
                json!({ "results": [
                    { "id": "frieren", "title": "Frieren", "episodeNumber": 28 },
                    { "title": "no id" }
                ]})
                .to_string(),
            )
            .create_async()
            .await;
        let _episodes = server
            .mock("GET", "/info/frieren")
            .with_status(200)
            .with_body(
                json!({ "episodes": [{ "id": "frieren-episode-1", "number": 1, "title": "The Journey's End" }] })
                    .to_string(),
            )
            .create_async()
            .await;

        let api = AnimeApi::new(
            Registry::new(vec![consumet_like("A", server.url())]),
            settings(Duration::ZERO),
        );

        let recent = api.recent(2).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].number, EpisodeNumber::Number(28));

        let episodes = api.list_episodes("frieren").await;
        assert_eq!(episodes[0].id, "frieren-episode-1");
    }

    #[tokio::test]
    async fn test_stream_sources_use_default_hints() {
        let mut server = Server::new_async().await;
        let _probe = mock_probe(&mut server, "", 200).await;
        let watch = server
            .mock("GET", "/watch/frieren-episode-1?server=gogocdn&category=sub")
            .with_status(200)
            .with_body(
                json!({ "sources": [
                    { "url": "https://cdn.example/a.m3u8", "quality": "1080p", "isM3U8": true },
                    { "url": "https://cdn.example/b.mp4", "quality": "360p", "isM3U8": false }
                ]})
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let api = AnimeApi::new(
            Registry::new(vec![consumet_like("A", server.url())]),
            settings(Duration::ZERO),
        );
        let sources = api.stream_sources("frieren-episode-1", None, None).await;
        let qualities: Vec<&str> = sources.iter().map(|s| s.quality.as_str()).collect();
        assert_eq!(qualities, vec!["1080p", "360p"]);
        assert_eq!(sources[0].format, StreamFormat::Hls);
        watch.assert_async().await;
    }

    #[tokio::test]
    async fn test_stream_sources_honor_hints() {
        let mut server = Server::new_async().await;
        let _probe = mock_probe(&mut server, "", 200).await;
        let watch = server
            .mock("GET", "/watch/ep-1?server=vidstreaming&category=dub")
            .with_status(200)
            .with_body(json!({ "sources": [] }).to_string())
            .expect(1)
            .create_async()
            .await;

        let api = AnimeApi::new(
            Registry::new(vec![consumet_like("A", server.url())]),
            settings(Duration::ZERO),
        );
        let sources = api
            .stream_sources("ep-1", Some("vidstreaming"), Some(Category::Dub))
            .await;
        assert!(sources.is_empty());
        watch.assert_async().await;
    }

    #[tokio::test]
    async fn test_unsupported_operation_is_empty() {
        let mut server = Server::new_async().await;
        let _probe = mock_probe(&mut server, "", 200).await;
        let backend = BackendDescriptor::new("Meta", server.url(), ResponseShape::Consumet)
            .with_endpoint(Operation::Search, Endpoint::Get("/search?q={query}"));

        let api = AnimeApi::new(Registry::new(vec![backend]), settings(Duration::ZERO));
        assert!(api.stream_sources("ep-1", None, None).await.is_empty());
        assert!(api.recent(1).await.is_empty());
    }

    #[tokio::test]
    async fn test_search_results_are_cached() {
        let mut server = Server::new_async().await;
        let _probe = mock_probe(&mut server, "", 200).await;
        let search = server
            .mock("GET", "/search?q=frieren")
            .with_status(200)
            .with_body(json!({ "results": [{ "id": "frieren", "title": "Frieren" }] }).to_string())
            .expect(1)
            .create_async()
            .await;

        let api = AnimeApi::new(
            Registry::new(vec![consumet_like("A", server.url())]),
            settings(Duration::from_secs(60)),
        );
        assert_eq!(api.search("frieren").await.len(), 1);
        assert_eq!(api.search("frieren").await.len(), 1);
        search.assert_async().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_final() {
        let mut server = Server::new_async().await;
        let _probe = mock_probe(&mut server, "", 200).await;

        let api = AnimeApi::new(
            Registry::new(vec![consumet_like("A", server.url())]),
            settings(Duration::ZERO),
        );
        assert!(api.resolve().await.is_some());

        assert!(api.shutdown().await);
        assert!(!api.shutdown().await);
        assert!(api.active_backend().await.is_none());
        assert!(api.resolve().await.is_none());
        assert!(api.search("naruto").await.is_empty());
    }

    #[tokio::test]
    async fn test_graphql_backend_search() {
        let mut server = Server::new_async().await;
        let body = json!({ "data": { "Page": { "media": [{
            "id": 20,
            "title": { "english": "Naruto", "romaji": "Naruto" },
            "episodes": 220,
            "averageScore": 79
        }]}}})
        .to_string();
        let graphql = server
            .mock("POST", "/")
            .with_status(200)
            .with_body(body)
            .expect(2)
            .create_async()
            .await;

        let backend = BackendDescriptor::new("AniList", server.url(), ResponseShape::AniList)
            .with_endpoint(
                Operation::Search,
                Endpoint::GraphQl {
                    document: "query ($search: String) { Page { media(search: $search) { id } } }",
                    variables: &[crate::registry::GraphQlVar {
                        name: "search",
                        param: "query",
                        ty: crate::registry::VarType::Str,
                    }],
                },
            );

        let api = AnimeApi::new(Registry::new(vec![backend]), settings(Duration::ZERO));
        let records = api.search("naruto").await;
        assert_eq!(records[0].id, "20");
        assert_eq!(records[0].score, Some(79.0));
        graphql.assert_async().await;
    }
}

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

/// JSON layout a backend answers with. Drives the extraction table used by
/// the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseShape {
    HiAnime,
    Consumet,
    Zen,
    AniList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Search,
    Recent,
    Episodes,
    Stream,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Search => "search",
            Operation::Recent => "recent",
            Operation::Episodes => "episodes",
            Operation::Stream => "stream",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Str,
    Int,
}

/// Binds a GraphQL variable to a request parameter.
#[derive(Debug, Clone, Copy)]
pub struct GraphQlVar {
    pub name: &'static str,
    pub param: &'static str,
    pub ty: VarType,
}

#[derive(Debug, Clone, Copy)]
pub enum Endpoint {
    /// Path template appended to the base URL, with `{param}` placeholders.
    Get(&'static str),
    /// GraphQL document POSTed to the base URL.
    GraphQl {
        document: &'static str,
        variables: &'static [GraphQlVar],
    },
}

#[derive(Debug)]
pub struct BackendDescriptor {
    name: String,
    base_url: String,
    shape: ResponseShape,
    default_server: String,
    search: Option<Endpoint>,
    recent: Option<Endpoint>,
    episodes: Option<Endpoint>,
    stream: Option<Endpoint>,
    live: AtomicBool,
}

impl BackendDescriptor {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        shape: ResponseShape,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            shape,
            default_server: String::new(),
            search: None,
            recent: None,
            episodes: None,
            stream: None,
            live: AtomicBool::new(false),
        }
    }

    pub fn with_endpoint(mut self, operation: Operation, endpoint: Endpoint) -> Self {
        match operation {
            Operation::Search => self.search = Some(endpoint),
            Operation::Recent => self.recent = Some(endpoint),
            Operation::Episodes => self.episodes = Some(endpoint),
            Operation::Stream => self.stream = Some(endpoint),
        }
        self
    }

    pub fn with_default_server(mut self, server: impl Into<String>) -> Self {
        self.default_server = server.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn shape(&self) -> ResponseShape {
        self.shape
    }

    pub fn default_server(&self) -> &str {
        &self.default_server
    }

    pub fn endpoint(&self, operation: Operation) -> Option<&Endpoint> {
        match operation {
            Operation::Search => self.search.as_ref(),
            Operation::Recent => self.recent.as_ref(),
            Operation::Episodes => self.episodes.as_ref(),
            Operation::Stream => self.stream.as_ref(),
        }
    }

    /// Outcome of the most recent probe of this backend.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn mark_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }
}

/// Ordered list of candidate backends. Position is trial priority.
#[derive(Debug, Clone)]
pub struct Registry {
    backends: Vec<Arc<BackendDescriptor>>,
}

impl Registry {
    pub fn new(backends: Vec<BackendDescriptor>) -> Self {
        Self {
            backends: backends.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(vec![hianime(), consumet(), zen(), anilist()])
    }

    /// Restrict and reorder by backend name. Unknown names are skipped; if
    /// nothing matches, the registry is returned unchanged.
    pub fn select(self, names: &[String]) -> Self {
        if names.is_empty() {
            return self;
        }

        let mut selected = Vec::new();
        for name in names {
            match self
                .backends
                .iter()
                .find(|backend| backend.name().eq_ignore_ascii_case(name.trim()))
            {
                Some(backend) if !selected.iter().any(|b| Arc::ptr_eq(b, backend)) => {
                    selected.push(Arc::clone(backend));
                }
                Some(_) => {}
                None => warn!(backend = %name, "ignoring unknown backend name"),
            }
        }

        if selected.is_empty() {
            warn!("no configured backend matched; using the built-in order");
            return self;
        }
        Self { backends: selected }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BackendDescriptor>> {
        self.backends.iter()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

const ANILIST_SEARCH: &str = r#"
query ($search: String, $page: Int) {
  Page(page: $page, perPage: 10) {
    media(search: $search, type: ANIME) {
      id
      title { romaji english native }
      episodes
      seasonYear
      startDate { year }
      averageScore
    }
  }
}
"#;

const ANILIST_RECENT: &str = r#"
query ($page: Int) {
  Page(page: $page, perPage: 10) {
    airingSchedules(notYetAired: false, sort: TIME_DESC) {
      episode
      media { id title { romaji english } }
    }
  }
}
"#;

const ANILIST_EPISODES: &str = r#"
query ($id: Int) {
  Media(id: $id, type: ANIME) {
    streamingEpisodes { title url site }
  }
}
"#;

fn hianime() -> BackendDescriptor {
    BackendDescriptor::new(
        "HiAnime",
        "https://hianime-api-theta.vercel.app/api/v1",
        ResponseShape::HiAnime,
    )
    .with_endpoint(Operation::Search, Endpoint::Get("/search?q={query}&page={page}"))
    .with_endpoint(Operation::Recent, Endpoint::Get("/home"))
    .with_endpoint(Operation::Episodes, Endpoint::Get("/episodes/{id}"))
    .with_endpoint(
        Operation::Stream,
        Endpoint::Get("/stream?id={id}&server={server}&type={category}"),
    )
    .with_default_server("hd-1")
}

fn consumet() -> BackendDescriptor {
    BackendDescriptor::new(
        "Consumet",
        "https://consumet-api-clone.vercel.app/anime/gogoanime",
        ResponseShape::Consumet,
    )
    .with_endpoint(Operation::Search, Endpoint::Get("/{query}?page={page}"))
    .with_endpoint(Operation::Recent, Endpoint::Get("/recent-episodes?page={page}"))
    .with_endpoint(Operation::Episodes, Endpoint::Get("/info/{id}"))
    .with_endpoint(Operation::Stream, Endpoint::Get("/watch/{id}?server={server}"))
    .with_default_server("gogocdn")
}

fn zen() -> BackendDescriptor {
    BackendDescriptor::new(
        "Zen API",
        "https://zen-api-rouge.vercel.app/api",
        ResponseShape::Zen,
    )
    .with_endpoint(Operation::Search, Endpoint::Get("/search/{query}"))
    .with_endpoint(Operation::Recent, Endpoint::Get("/recent-release?page={page}"))
    .with_endpoint(Operation::Episodes, Endpoint::Get("/info/{id}"))
    .with_endpoint(Operation::Stream, Endpoint::Get("/watch/{id}"))
    .with_default_server("gogocdn")
}

fn anilist() -> BackendDescriptor {
    BackendDescriptor::new("AniList", "https://graphql.anilist.co", ResponseShape::AniList)
        .with_endpoint(
            Operation::Search,
            Endpoint::GraphQl {
                document: ANILIST_SEARCH,
                variables: &[
                    GraphQlVar {
                        name: "search",
                        param: "query",
                        ty: VarType::Str,
                    },
                    GraphQlVar {
                        name: "page",
                        param: "page",
                        ty: VarType::Int,
                    },
                ],
            },
        )
        .with_endpoint(
            Operation::Recent,
            Endpoint::GraphQl {
                document: ANILIST_RECENT,
                variables: &[GraphQlVar {
                    name: "page",
                    param: "page",
                    ty: VarType::Int,
                }],
            },
        )
        .with_endpoint(
            Operation::Episodes,
            Endpoint::GraphQl {
                document: ANILIST_EPISODES,
                variables: &[GraphQlVar {
                    name: "id",
                    param: "id",
                    ty: VarType::Int,
                }],
            },
        )
}

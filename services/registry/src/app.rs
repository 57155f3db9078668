//! Application value and router.
//!
//! [`AppBuilder`] turns a [`Config`] into an [`App`]: every backend the
//! registry talks to, built once in dependency order and shared by the HTTP
//! handlers and the background consumers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use cacher::{CacheBackend, EmbeddedCache, MemoryCache, RedisCache};
use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use locker::{EmbeddedLockBackend, Locker, RedisLockBackend};
use redb::Database;
use storage::Storage;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, Authenticator};
use crate::config::{CacheType, Config, LockerType};
use crate::dal::Dal;
use crate::error::RegistryError;
use crate::workq::{Producer, WorkQueue};
use crate::{daemon, distribution};

/// Everything a request or a job needs. Cheap to clone.
#[derive(Debug, Clone)]
pub struct App {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: Config,
    dal: Dal,
    storage: Storage,
    locker: Locker,
    queue: WorkQueue,
    producer: Producer,
    cache: Arc<dyn CacheBackend>,
    auth: Option<Authenticator>,
    http: reqwest::Client,
    http_insecure: reqwest::Client,
    upload_permits: Arc<Semaphore>,
}

impl App {
    /// Validated configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Metadata database.
    pub fn dal(&self) -> &Dal {
        &self.inner.dal
    }

    /// Blob storage.
    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Distributed locks.
    pub fn locker(&self) -> &Locker {
        &self.inner.locker
    }

    /// The job queue.
    pub fn queue(&self) -> &WorkQueue {
        &self.inner.queue
    }

    /// Publishes jobs to [`App::queue`].
    pub fn producer(&self) -> &Producer {
        &self.inner.producer
    }

    /// Shared cache backend.
    pub fn cache(&self) -> Arc<dyn CacheBackend> {
        Arc::clone(&self.inner.cache)
    }

    /// `None` when `auth.enabled` is off.
    pub fn auth(&self) -> Option<&Authenticator> {
        self.inner.auth.as_ref()
    }

    /// Outbound HTTP client, optionally skipping certificate checks.
    pub fn http_client(&self, verify_tls: bool) -> &reqwest::Client {
        if verify_tls {
            &self.inner.http
        } else {
            &self.inner.http_insecure
        }
    }

    /// Permits bounding concurrent blob upload requests.
    pub fn upload_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.inner.upload_permits)
    }

    /// The HTTP surface: the distribution API, the token endpoint and
    /// `/healthz`.
    pub fn router(&self) -> Router {
        let v2 = distribution::router()
            .route("/v2/token", get(auth::token).delete(auth::logout))
            .layer(middleware::from_fn_with_state(self.clone(), auth::authenticate));

        Router::new()
            .merge(v2)
            .route("/healthz", get(healthz))
            .layer(DefaultBodyLimit::disable())
            .layer(SetResponseHeaderLayer::overriding(
                HeaderName::from_static("docker-distribution-api-version"),
                HeaderValue::from_static("registry/2.0"),
            ))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        user = tracing::field::Empty,
                    )
                }),
            )
            .with_state(self.clone())
    }

    /// Start the job consumers and the GC scheduler. Tasks end once
    /// `shutdown` fires and their in-flight work finishes.
    pub fn start_daemons(&self, shutdown: CancellationToken) -> JoinSet<()> {
        daemon::start(self, shutdown)
    }
}

async fn healthz(State(app): State<App>) -> Response {
    match app.dal().ping().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(err) => {
            RegistryError::Unavailable(format!("database: {err}")).into_plain_response()
        }
    }
}

/// Builds an [`App`] from configuration. Any backend can be supplied
/// directly instead, which is how tests run without external services.
#[derive(Debug)]
pub struct AppBuilder {
    config: Config,
    storage: Option<Storage>,
    dal: Option<Dal>,
    locker: Option<Locker>,
    queue: Option<WorkQueue>,
    cache: Option<Arc<dyn CacheBackend>>,
}

impl AppBuilder {
    /// Start from `config`.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            storage: None,
            dal: None,
            locker: None,
            queue: None,
            cache: None,
        }
    }

    /// Use this storage instead of `storage.*`.
    pub fn storage(mut self, storage: impl Into<Storage>) -> Self {
        self.storage = Some(storage.into());
        self
    }

    /// Use this database instead of `database.*`.
    pub fn dal(mut self, dal: Dal) -> Self {
        self.dal = Some(dal);
        self
    }

    /// Use this locker instead of `locker.*`.
    pub fn locker(mut self, locker: Locker) -> Self {
        self.locker = Some(locker);
        self
    }

    /// Use this queue instead of `workqueue.*`.
    pub fn workqueue(mut self, queue: WorkQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Use this cache backend instead of `cache.*`.
    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate the configuration and build every missing backend.
    #[tracing::instrument(skip_all)]
    pub async fn build(self) -> eyre::Result<App> {
        let config = self.config;
        config.validate()?;

        // the locker and the cache may point at the same redb file, which
        // can only be opened once per process
        let mut embedded = EmbeddedFiles::default();

        let locker = match self.locker {
            Some(locker) => locker,
            None => match config.locker.kind {
                LockerType::Redis => Locker::new(
                    RedisLockBackend::connect(&config.redis.url).await?,
                    &config.locker.prefix,
                ),
                LockerType::Badger => Locker::new(
                    EmbeddedLockBackend::new(embedded.open(&config.locker.badger.path)?),
                    &config.locker.prefix,
                ),
            },
        };

        let dal = match self.dal {
            Some(dal) => dal,
            None => Dal::connect(&config.database)
                .await
                .wrap_err("connect to the database")?,
        };
        dal.migrate(&locker).await.wrap_err("migrate the database")?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => config.storage.backend.clone().build().await?,
        };

        let cache: Arc<dyn CacheBackend> = match self.cache {
            Some(cache) => cache,
            None => match config.cache.kind {
                CacheType::Redis => Arc::new(RedisCache::connect(&config.redis.url).await?),
                CacheType::Inmemory => Arc::new(MemoryCache::new(config.cache.inmemory.size)),
                CacheType::Badger => Arc::new(EmbeddedCache::new(
                    embedded.open(&config.cache.badger.path)?,
                )),
            },
        };

        let queue = match self.queue {
            Some(queue) => queue,
            None => WorkQueue::from_config(&config, &dal, &locker).await?,
        };

        let auth = if config.auth.enabled {
            Some(Authenticator::from_config(&config, &dal, &locker, Arc::clone(&cache)).await?)
        } else {
            tracing::warn!("authentication is disabled");
            None
        };

        let http = reqwest::Client::builder()
            .user_agent(concat!("registry/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let http_insecure = reqwest::Client::builder()
            .user_agent(concat!("registry/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(true)
            .build()?;

        tracing::info!(
            storage = storage.name(),
            database = ?dal.dialect(),
            "registry ready"
        );

        Ok(App {
            inner: Arc::new(Inner {
                upload_permits: Arc::new(Semaphore::new(config.http.upload_concurrency)),
                producer: queue.producer(),
                config,
                dal,
                storage,
                locker,
                queue,
                cache,
                auth,
                http,
                http_insecure,
            }),
        })
    }
}

#[derive(Default)]
struct EmbeddedFiles {
    open: HashMap<Utf8PathBuf, Arc<Database>>,
}

impl EmbeddedFiles {
    fn open(&mut self, path: &Utf8Path) -> eyre::Result<Arc<Database>> {
        if let Some(db) = self.open.get(path) {
            return Ok(Arc::clone(db));
        }
        let db = Arc::new(
            Database::create(path).wrap_err_with(|| format!("open embedded store {path}"))?,
        );
        self.open.insert(path.to_owned(), Arc::clone(&db));
        Ok(db)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::workq::MemoryQueue;

    /// An app on in-process backends with authentication off. The temp
    /// directory holds the lock file and must outlive the app.
    pub async fn app() -> (App, tempfile::TempDir) {
        app_with(Config {
            auth: crate::config::AuthConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        })
        .await
    }

    /// Like [`app`] with a custom configuration.
    pub async fn app_with(config: Config) -> (App, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let locks = EmbeddedLockBackend::open(dir.path().join("locks.redb")).unwrap();
        let app = AppBuilder::new(config)
            .storage(storage::MemoryStorage::new())
            .dal(Dal::memory().await.unwrap())
            .locker(Locker::new(locks, "test"))
            .workqueue(WorkQueue::new(MemoryQueue::new(16)))
            .cache(Arc::new(MemoryCache::new(64)))
            .build()
            .await
            .unwrap();
        (app, dir)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::header;
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn healthz_and_version_header() {
        let (app, _dir) = testing::app().await;
        let response = app
            .router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["docker-distribution-api-version"],
            "registry/2.0"
        );
    }

    #[tokio::test]
    async fn token_endpoint_needs_auth_enabled() {
        let (app, _dir) = testing::app().await;
        let response = app
            .router()
            .oneshot(Request::get("/v2/token").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(!response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[test]
    fn embedded_files_are_opened_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("kv.redb")).unwrap();
        let mut files = EmbeddedFiles::default();
        let a = files.open(&path).unwrap();
        let b = files.open(&path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}

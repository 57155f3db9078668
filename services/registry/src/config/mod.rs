//! Process configuration.
//!
//! One [`Config`] value is loaded at startup, validated with
//! [`Config::validate`] and handed to [`crate::App`]. Every section has
//! defaults, so an empty document is a working single-node setup (sqlite,
//! filesystem storage, in-process cache, queue and locks).

use std::time::Duration;

use camino::Utf8PathBuf;
use secret::Secret;
use serde::Deserialize;

pub mod duration;

/// Configuration could not be understood.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A duration string did not parse.
    #[error("invalid duration {0:?}: expected digits followed by ms, s, m, h or d")]
    Duration(String),

    /// Options are individually valid but don't work together.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root of the configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Logging.
    pub log: LogConfig,
    /// HTTP listener.
    pub http: HttpConfig,
    /// Metadata database.
    pub database: DatabaseConfig,
    /// Shared Redis server.
    pub redis: RedisConfig,
    /// Read-through caches.
    pub cache: CacheConfig,
    /// Distributed locks.
    pub locker: LockerConfig,
    /// Background job queue.
    pub workqueue: WorkQueueConfig,
    /// Blob storage.
    pub storage: StorageSection,
    /// Background daemons.
    pub daemon: DaemonConfig,
    /// Authentication.
    pub auth: AuthConfig,
    /// Namespace policy.
    pub namespace: NamespaceConfig,
}

impl Config {
    /// Check combinations that serde alone can't.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));

        if self.database.kind == DatabaseType::Mysql {
            return invalid("database.type mysql is not supported; use sqlite3 or postgresql");
        }
        if self.http.tls.enabled {
            return invalid(
                "http.tls is not terminated by the registry; put a TLS terminating proxy in front",
            );
        }
        let needs_redis = self.cache.kind == CacheType::Redis
            || self.locker.kind == LockerType::Redis
            || self.workqueue.kind == WorkQueueType::Redis;
        if needs_redis && (self.redis.kind != RedisType::External || self.redis.url.is_empty()) {
            return invalid("redis backed cache, locker or workqueue needs redis.type external and redis.url");
        }
        if self.workqueue.kind == WorkQueueType::Kafka {
            if !cfg!(feature = "kafka") {
                return invalid("workqueue.type kafka needs the kafka feature");
            }
            if self.workqueue.kafka.brokers.is_empty() {
                return invalid("workqueue.kafka.brokers is empty");
            }
        }
        if self.http.upload_concurrency == 0 {
            return invalid("http.uploadConcurrency must be at least 1");
        }
        if self.workqueue.concurrency == 0 {
            return invalid("workqueue.concurrency must be at least 1");
        }
        if self.daemon.gc.workers == 0 {
            return invalid("daemon.gc.workers must be at least 1");
        }
        if self.daemon.gc.interval.is_some_and(|interval| interval < Duration::from_secs(1)) {
            return invalid("daemon.gc.interval must be at least 1s");
        }
        if self.auth.jwt.ttl.is_zero() || self.auth.jwt.refresh_ttl.is_zero() {
            return invalid("auth.jwt.ttl and auth.jwt.refreshTtl must be positive");
        }
        if self.auth.enabled && self.auth.admin.username.is_empty() {
            return invalid("auth.admin.username is required when auth is enabled");
        }
        url::Url::parse(&self.http.endpoint)
            .map_err(|err| ConfigError::Invalid(format!("http.endpoint: {err}")))?;
        self.http.bind_address()?;
        Ok(())
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// `log.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

/// `http.tls.*`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsConfig {
    /// Must stay false; TLS is terminated in front of the registry.
    pub enabled: bool,
    /// Certificate path.
    pub certificate: Option<Utf8PathBuf>,
    /// Key path.
    pub key: Option<Utf8PathBuf>,
}

/// `http.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    /// Public URL clients reach the registry at. Used for the token realm.
    pub endpoint: String,
    /// URL the listener binds to.
    pub internal_endpoint: String,
    /// TLS settings.
    pub tls: TlsConfig,
    /// How long in-flight requests may drain on shutdown.
    #[serde(deserialize_with = "duration::deserialize")]
    pub shutdown_timeout: Duration,
    /// Blob upload requests handled at once; more wait their turn.
    pub upload_concurrency: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3000".into(),
            internal_endpoint: "http://0.0.0.0:3000".into(),
            tls: TlsConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
            upload_concurrency: 64,
        }
    }
}

impl HttpConfig {
    /// `host:port` the server binds to.
    pub fn bind_address(&self) -> Result<String, ConfigError> {
        let url = url::Url::parse(&self.internal_endpoint)
            .map_err(|err| ConfigError::Invalid(format!("http.internalEndpoint: {err}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::Invalid("http.internalEndpoint has no host".into()))?;
        let port = url.port_or_known_default().unwrap_or(3000);
        Ok(format!("{host}:{port}"))
    }

    /// The public endpoint without a trailing slash.
    pub fn public_url(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }
}

/// `database.type`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// A local sqlite file.
    #[default]
    Sqlite3,
    /// PostgreSQL.
    Postgresql,
    /// Accepted by the parser, rejected by validation.
    Mysql,
}

/// `database.sqlite3.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SqliteConfig {
    /// Database file. `:memory:` keeps everything in process.
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "./registry.db".into(),
        }
    }
}

/// `database.postgresql.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostgresConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login role.
    pub user: String,
    /// Login password.
    pub password: Secret,
    /// Database name.
    pub dbname: String,
    /// `disable`, `prefer`, `require`, ...
    pub sslmode: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            user: "registry".into(),
            password: Secret::from(""),
            dbname: "registry".into(),
            sslmode: "disable".into(),
        }
    }
}

/// `database.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    /// Which database to use.
    #[serde(rename = "type")]
    pub kind: DatabaseType,
    /// Sqlite settings.
    pub sqlite3: SqliteConfig,
    /// PostgreSQL settings.
    pub postgresql: PostgresConfig,
    /// Pool size for PostgreSQL. Sqlite always uses one connection.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseType::Sqlite3,
            sqlite3: SqliteConfig::default(),
            postgresql: PostgresConfig::default(),
            max_connections: 10,
        }
    }
}

impl DatabaseConfig {
    /// Connection URL for the selected database.
    pub fn url(&self) -> String {
        match self.kind {
            DatabaseType::Sqlite3 if self.sqlite3.path == ":memory:" => "sqlite::memory:".into(),
            DatabaseType::Sqlite3 => format!("sqlite://{}?mode=rwc", self.sqlite3.path),
            DatabaseType::Postgresql | DatabaseType::Mysql => {
                let pg = &self.postgresql;
                let encode = |s: &str| {
                    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC)
                        .to_string()
                };
                format!(
                    "postgres://{}:{}@{}:{}/{}?sslmode={}",
                    encode(&pg.user),
                    encode(pg.password.revealed()),
                    pg.host,
                    pg.port,
                    pg.dbname,
                    pg.sslmode
                )
            }
        }
    }
}

/// `redis.type`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedisType {
    /// No Redis available.
    #[default]
    None,
    /// An external server at `redis.url`.
    External,
}

/// `redis.*`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisConfig {
    /// Whether Redis is available.
    #[serde(rename = "type")]
    pub kind: RedisType,
    /// `redis://` URL.
    pub url: String,
}

/// `cache.type`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// Shared Redis.
    Redis,
    /// Bounded in-process LRU.
    #[default]
    Inmemory,
    /// Embedded key-value file.
    Badger,
}

/// `cache.inmemory.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InMemoryCacheConfig {
    /// Maximum entries.
    pub size: usize,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            size: cacher::DEFAULT_MEMORY_ENTRIES,
        }
    }
}

/// Location of an embedded key-value file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmbeddedKvConfig {
    /// File path.
    pub path: Utf8PathBuf,
}

impl Default for EmbeddedKvConfig {
    fn default() -> Self {
        Self {
            path: Utf8PathBuf::from("./registry.redb"),
        }
    }
}

/// `cache.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Backend.
    #[serde(rename = "type")]
    pub kind: CacheType,
    /// Default entry lifetime.
    #[serde(deserialize_with = "duration::deserialize")]
    pub ttl: Duration,
    /// Key prefix shared by every cache.
    pub prefix: String,
    /// In-memory backend settings.
    pub inmemory: InMemoryCacheConfig,
    /// Embedded backend settings.
    pub badger: EmbeddedKvConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheType::Inmemory,
            ttl: Duration::from_secs(72 * 3600),
            prefix: "registry-cache".into(),
            inmemory: InMemoryCacheConfig::default(),
            badger: EmbeddedKvConfig::default(),
        }
    }
}

/// `locker.type`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockerType {
    /// Shared Redis.
    Redis,
    /// Embedded key-value file; single node only.
    #[default]
    Badger,
}

/// `locker.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockerConfig {
    /// Backend.
    #[serde(rename = "type")]
    pub kind: LockerType,
    /// Key prefix.
    pub prefix: String,
    /// Embedded backend settings.
    pub badger: EmbeddedKvConfig,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            kind: LockerType::Badger,
            prefix: "registry-locker".into(),
            badger: EmbeddedKvConfig::default(),
        }
    }
}

/// `workqueue.type`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkQueueType {
    /// Rows in the metadata database.
    #[default]
    Database,
    /// Redis streams.
    Redis,
    /// Kafka topics.
    Kafka,
    /// In-process channels; jobs are lost on restart.
    Inmemory,
}

/// `workqueue.kafka.*`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaConfig {
    /// Bootstrap brokers, `host:port`.
    pub brokers: Vec<String>,
}

/// `workqueue.redis.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisQueueConfig {
    /// Stream name prefix.
    pub prefix: String,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            prefix: "registry-workq".into(),
        }
    }
}

/// `workqueue.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkQueueConfig {
    /// Backend.
    #[serde(rename = "type")]
    pub kind: WorkQueueType,
    /// Default consumer concurrency.
    pub concurrency: usize,
    /// Database backend tick.
    #[serde(deserialize_with = "duration::deserialize")]
    pub poll_interval: Duration,
    /// Kafka settings.
    pub kafka: KafkaConfig,
    /// Redis settings.
    pub redis: RedisQueueConfig,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            kind: WorkQueueType::Database,
            concurrency: 10,
            poll_interval: Duration::from_secs(5),
            kafka: KafkaConfig::default(),
            redis: RedisQueueConfig::default(),
        }
    }
}

/// `storage.redirect.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedirectConfig {
    /// Answer blob GETs with a presigned URL when the driver supports it.
    pub enabled: bool,
    /// Lifetime of presigned URLs.
    #[serde(deserialize_with = "duration::deserialize")]
    pub ttl: Duration,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: Duration::from_secs(15 * 60),
        }
    }
}

/// `storage.*`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSection {
    /// Driver selection and root directory.
    #[serde(flatten)]
    pub backend: storage::StorageConfig,
    /// Presigned redirects.
    pub redirect: RedirectConfig,
}

/// `daemon.gc.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcConfig {
    /// Minimum time since last pull before anything is collected.
    #[serde(deserialize_with = "duration::deserialize")]
    pub retention: Duration,
    /// Run a cascading collection this often.
    #[serde(deserialize_with = "duration::deserialize_option")]
    pub interval: Option<Duration>,
    /// Open uploads idle for longer than this are aborted.
    #[serde(deserialize_with = "duration::deserialize")]
    pub upload_staleness: Duration,
    /// Delete workers per phase.
    pub workers: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(72 * 3600),
            interval: None,
            upload_staleness: Duration::from_secs(24 * 3600),
            workers: 10,
        }
    }
}

/// `daemon.*`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DaemonConfig {
    /// Garbage collection.
    pub gc: GcConfig,
}

/// `auth.admin.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminConfig {
    /// Seeded administrator login.
    pub username: String,
    /// Seeded administrator password.
    pub password: Secret,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: "admin".into(),
            password: Secret::from("Admin@123"),
        }
    }
}

/// `auth.jwt.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JwtConfig {
    /// Access token lifetime.
    #[serde(deserialize_with = "duration::deserialize")]
    pub ttl: Duration,
    /// Refresh lifetime; revoked token ids are remembered this long.
    #[serde(deserialize_with = "duration::deserialize")]
    pub refresh_ttl: Duration,
    /// Base64 encoded PEM RSA key. Generated and shared through the database
    /// when absent.
    pub private_key: Option<Secret>,
    /// `service` in the bearer challenge.
    pub service: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            refresh_ttl: Duration::from_secs(24 * 3600),
            private_key: None,
            service: "registry".into(),
        }
    }
}

/// `auth.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthConfig {
    /// Require credentials on `/v2/`.
    pub enabled: bool,
    /// Seeded administrator.
    pub admin: AdminConfig,
    /// Bearer tokens.
    pub jwt: JwtConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            admin: AdminConfig::default(),
            jwt: JwtConfig::default(),
        }
    }
}

/// Repository and namespace visibility.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Anyone may pull.
    Public,
    /// Only members may pull.
    #[default]
    Private,
}

impl Visibility {
    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }

    /// Parse a stored column value; anything unknown is private.
    pub fn from_column(value: &str) -> Self {
        match value {
            "public" => Visibility::Public,
            _ => Visibility::Private,
        }
    }
}

/// `namespace.*`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamespaceConfig {
    /// Create the namespace on first push instead of failing `NAME_UNKNOWN`.
    pub auto_create: bool,
    /// Visibility of auto-created namespaces and repositories.
    pub visibility: Visibility,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            auto_create: true,
            visibility: Visibility::Private,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        config.validate().unwrap();
        assert_eq!(config.workqueue.poll_interval, Duration::from_secs(5));
        assert_eq!(config.http.bind_address().unwrap(), "0.0.0.0:3000");
        assert!(config.database.url().starts_with("sqlite://"));
    }

    #[test]
    fn nested_sections_parse() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "storage": {
                "type": "filesystem",
                "path": "/var/lib/registry",
                "rootDirectory": "oci",
                "redirect": { "enabled": true, "ttl": "5m" }
            },
            "daemon": { "gc": { "retention": "1h", "interval": "6h" } },
            "auth": { "jwt": { "ttl": "30m", "refreshTtl": "7d" } },
            "workqueue": { "type": "inmemory", "concurrency": 4 }
        }))
        .unwrap();
        config.validate().unwrap();
        assert!(config.storage.redirect.enabled);
        assert_eq!(config.storage.redirect.ttl, Duration::from_secs(300));
        assert_eq!(config.daemon.gc.retention, Duration::from_secs(3600));
        assert_eq!(config.daemon.gc.interval, Some(Duration::from_secs(6 * 3600)));
        assert_eq!(config.auth.jwt.refresh_ttl, Duration::from_secs(7 * 86_400));
        assert_eq!(config.workqueue.kind, WorkQueueType::Inmemory);
        assert_eq!(
            config.storage.backend.root_directory,
            Utf8PathBuf::from("oci")
        );
    }

    #[test]
    fn rejects_unsupported_combinations() {
        let mysql: Config =
            serde_json::from_value(serde_json::json!({"database": {"type": "mysql"}})).unwrap();
        assert!(mysql.validate().is_err());

        let tls: Config =
            serde_json::from_value(serde_json::json!({"http": {"tls": {"enabled": true}}}))
                .unwrap();
        assert!(tls.validate().is_err());

        let redis_locker: Config =
            serde_json::from_value(serde_json::json!({"locker": {"type": "redis"}})).unwrap();
        assert!(redis_locker.validate().is_err());
    }
}

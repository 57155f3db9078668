//! Background job fabric.
//!
//! Producers put JSON payloads on a [`Topic`]; a [`TopicRegistry`] maps each
//! topic to one [`Consumer`] with its [`ConsumerOption`]. The same contract
//! runs on four backends:
//!
//! - [`DatabaseQueue`]: rows in `work_queues`, claimed with a version token.
//! - [`MemoryQueue`]: a bounded channel per topic, for single-process setups.
//! - [`RedisQueue`]: a Redis stream per topic with one consumer group.
//! - `KafkaQueue` (feature `kafka`): one single-partition Kafka topic per
//!   topic, offsets kept in settings.
//!
//! Delivery is at-least-once on every backend, so consumers must be
//! idempotent. Timeouts, retries and logging are applied by [`Handler`]
//! regardless of the backend.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{Config, WorkQueueType};
use crate::dal::{Dal, DalError, Tx, work_queue};

mod database;
#[cfg(feature = "kafka")]
mod kafka;
mod memory;
mod redis_streams;

pub use database::DatabaseQueue;
#[cfg(feature = "kafka")]
pub use kafka::KafkaQueue;
pub use memory::MemoryQueue;
pub use redis_streams::RedisQueue;

/// A named stream of jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Tag retention sweep.
    GcTag,
    /// Unreferenced artifact sweep.
    GcArtifact,
    /// Unreferenced blob sweep.
    GcBlob,
    /// Empty repository sweep.
    GcRepository,
    /// Webhook delivery.
    Webhook,
    /// A manifest was pushed.
    ArtifactPushed,
    /// A tag was pushed.
    TagPushed,
}

impl Topic {
    /// Every topic.
    pub const ALL: [Topic; 7] = [
        Topic::GcTag,
        Topic::GcArtifact,
        Topic::GcBlob,
        Topic::GcRepository,
        Topic::Webhook,
        Topic::ArtifactPushed,
        Topic::TagPushed,
    ];

    /// Wire and column name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::GcTag => "gc_tag",
            Topic::GcArtifact => "gc_artifact",
            Topic::GcBlob => "gc_blob",
            Topic::GcRepository => "gc_repository",
            Topic::Webhook => "webhook",
            Topic::ArtifactPushed => "artifact_pushed",
            Topic::TagPushed => "tag_pushed",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work queue failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkQueueError {
    /// The payload could not be serialized.
    #[error("encode job payload: {0}")]
    Codec(#[from] serde_json::Error),

    /// The database backend failed.
    #[error(transparent)]
    Dal(#[from] DalError),

    /// The Redis backend failed.
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    /// The Kafka backend failed.
    #[cfg(feature = "kafka")]
    #[error("kafka: {0}")]
    Kafka(#[from] rskafka::client::error::Error),

    /// A lock guarding a consumer could not be taken.
    #[error(transparent)]
    Lock(#[from] locker::LockError),

    /// Nobody can receive on this topic any more.
    #[error("topic {0} is closed")]
    Closed(Topic),

    /// The backend was not compiled into this build.
    #[error("work queue backend {0} is not enabled in this build")]
    BackendDisabled(&'static str),

    /// The topic already has a running consumer in this process.
    #[error("topic {0} is already being consumed")]
    AlreadyConsuming(Topic),
}

/// Handles the jobs of one topic.
#[async_trait::async_trait]
pub trait Consumer: fmt::Debug + Send + Sync {
    /// Process one payload. `ctx` is cancelled when the job times out or the
    /// process shuts down; long I/O should stop when it fires.
    async fn handle(&self, ctx: CancellationToken, payload: Bytes) -> eyre::Result<()>;
}

/// How a topic is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOption {
    /// Jobs handled at the same time.
    pub concurrency: usize,
    /// Attempts before a job is marked failed.
    pub max_retry: u32,
    /// Per attempt deadline.
    pub timeout: Duration,
}

impl Default for ConsumerOption {
    fn default() -> Self {
        Self {
            concurrency: 10,
            max_retry: 3,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Topic to consumer map handed to [`WorkQueue::start`].
#[derive(Debug, Default)]
pub struct TopicRegistry {
    handlers: HashMap<Topic, Handler>,
}

impl TopicRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `topic` to `consumer`, replacing any earlier registration.
    pub fn register(
        &mut self,
        topic: Topic,
        consumer: Arc<dyn Consumer>,
        option: ConsumerOption,
    ) -> &mut Self {
        let option = ConsumerOption {
            concurrency: option.concurrency.max(1),
            max_retry: option.max_retry.max(1),
            ..option
        };
        self.handlers.insert(
            topic,
            Handler {
                topic,
                consumer,
                option,
            },
        );
        self
    }

    /// Registered topics.
    pub fn topics(&self) -> impl Iterator<Item = Topic> + '_ {
        self.handlers.keys().copied()
    }
}

/// What the backend should do with a job after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled; acknowledge it.
    Done,
    /// Failed with attempts left; publish it again.
    Retry,
    /// Out of attempts; drop it.
    Failed,
    /// Shutdown interrupted the attempt; hand the job back untouched.
    Interrupted,
}

/// A consumer with its options, wrapped with the timeout, retry and logging
/// policy shared by every backend.
#[derive(Debug, Clone)]
pub struct Handler {
    topic: Topic,
    consumer: Arc<dyn Consumer>,
    option: ConsumerOption,
}

impl Handler {
    /// The topic this handler consumes.
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Registered options.
    pub fn option(&self) -> ConsumerOption {
        self.option
    }

    /// Run one attempt. `times` is the number of attempts made before this one.
    pub async fn run(&self, payload: Bytes, times: u32, shutdown: &CancellationToken) -> Outcome {
        let ctx = shutdown.child_token();
        let span = tracing::info_span!("job", topic = %self.topic, attempt = times + 1);
        let result = tokio::time::timeout(
            self.option.timeout,
            self.consumer.handle(ctx.clone(), payload),
        )
        .instrument(span.clone())
        .await;
        ctx.cancel();

        let _enter = span.enter();
        let error = match result {
            Ok(Ok(())) => {
                tracing::debug!("job done");
                return Outcome::Done;
            }
            Ok(Err(error)) => format!("{error:#}"),
            Err(_) => format!("timed out after {:?}", self.option.timeout),
        };

        if shutdown.is_cancelled() {
            tracing::info!(%error, "job interrupted by shutdown");
            Outcome::Interrupted
        } else if times + 1 < self.option.max_retry {
            tracing::warn!(%error, "job failed, will retry");
            Outcome::Retry
        } else {
            tracing::error!(%error, max_retry = self.option.max_retry, "job failed permanently");
            Outcome::Failed
        }
    }
}

/// Storage and transport for jobs.
#[async_trait::async_trait]
pub trait QueueBackend: fmt::Debug + Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Whether jobs are rows in the metadata database, so they can be
    /// written inside the caller's transaction.
    fn in_database(&self) -> bool {
        false
    }

    /// Publish a job that has already been attempted `times` times.
    async fn produce(&self, topic: Topic, payload: Bytes, times: u32) -> Result<(), WorkQueueError>;

    /// Deliver `handler`'s topic until `shutdown` fires, then wait for
    /// in-flight jobs.
    async fn consume(
        self: Arc<Self>,
        handler: Handler,
        shutdown: CancellationToken,
    ) -> Result<(), WorkQueueError>;
}

/// Publishes jobs.
#[derive(Debug, Clone)]
pub struct Producer {
    backend: Arc<dyn QueueBackend>,
}

impl Producer {
    /// Publish `payload` as JSON on `topic`.
    ///
    /// With a transaction the job becomes visible exactly when the
    /// transaction commits: the database backend inserts the row inside it,
    /// the others publish from an after-commit hook.
    pub async fn produce<T>(
        &self,
        topic: Topic,
        payload: &T,
        tx: Option<&mut Tx>,
    ) -> Result<(), WorkQueueError>
    where
        T: Serialize + ?Sized,
    {
        let payload = Bytes::from(serde_json::to_vec(payload)?);
        match tx {
            Some(tx) if self.backend.in_database() => {
                work_queue::insert(tx.conn(), topic.as_str(), &payload, 0).await?;
            }
            Some(tx) => {
                let backend = Arc::clone(&self.backend);
                tx.after_commit(async move {
                    if let Err(error) = backend.produce(topic, payload, 0).await {
                        tracing::error!(%topic, %error, "could not publish job after commit");
                    }
                });
            }
            None => self.backend.produce(topic, payload, 0).await?,
        }
        tracing::trace!(%topic, backend = self.backend.name(), "job produced");
        Ok(())
    }
}

/// The configured backend plus its producer handle.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    backend: Arc<dyn QueueBackend>,
}

impl WorkQueue {
    /// Wrap a backend.
    pub fn new<B: QueueBackend>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Build the backend selected by `workqueue.type`.
    #[tracing::instrument(skip_all, fields(kind = ?config.workqueue.kind))]
    pub async fn from_config(
        config: &Config,
        dal: &Dal,
        #[allow(unused_variables)] locker: &locker::Locker,
    ) -> Result<Self, WorkQueueError> {
        let section = &config.workqueue;
        let queue = match section.kind {
            WorkQueueType::Database => {
                Self::new(DatabaseQueue::new(dal.clone(), section.poll_interval))
            }
            WorkQueueType::Inmemory => Self::new(MemoryQueue::new(section.concurrency)),
            WorkQueueType::Redis => Self::new(
                RedisQueue::connect(&config.redis.url, &section.redis.prefix).await?,
            ),
            #[cfg(feature = "kafka")]
            WorkQueueType::Kafka => Self::new(
                KafkaQueue::connect(&section.kafka.brokers, dal.clone(), locker.clone()).await?,
            ),
            #[cfg(not(feature = "kafka"))]
            WorkQueueType::Kafka => return Err(WorkQueueError::BackendDisabled("kafka")),
        };
        Ok(queue)
    }

    /// A producer publishing to this queue.
    pub fn producer(&self) -> Producer {
        Producer {
            backend: Arc::clone(&self.backend),
        }
    }

    /// Spawn one consumer task per registered topic. The tasks end after
    /// `shutdown` fires and their in-flight jobs finish.
    pub fn start(&self, registry: TopicRegistry, shutdown: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        for (topic, handler) in registry.handlers {
            let backend = Arc::clone(&self.backend);
            let shutdown = shutdown.clone();
            let span = tracing::info_span!("consumer", %topic, backend = backend.name());
            tasks.spawn(
                async move {
                    tracing::debug!("consumer started");
                    if let Err(error) = backend.consume(handler, shutdown).await {
                        tracing::error!(%error, "consumer stopped");
                    }
                }
                .instrument(span),
            );
        }
        tasks
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Records payloads and fails the first `failures` attempts.
    #[derive(Debug, Default)]
    pub struct Recorder {
        pub seen: Mutex<Vec<Bytes>>,
        pub attempts: AtomicUsize,
        pub failures: usize,
    }

    impl Recorder {
        pub fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                ..Default::default()
            })
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Consumer for Recorder {
        async fn handle(&self, _ctx: CancellationToken, payload: Bytes) -> eyre::Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                eyre::bail!("attempt {attempt} fails");
            }
            self.seen.lock().push(payload);
            Ok(())
        }
    }

    /// Poll `check` until it holds or a few seconds pass.
    pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_obj_safe;

    use super::testing::*;
    use super::*;

    assert_obj_safe!(Consumer);

    fn option(max_retry: u32) -> ConsumerOption {
        ConsumerOption {
            concurrency: 2,
            max_retry,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn handler_decides_retry_from_attempts() {
        let recorder = Recorder::failing(usize::MAX);
        let mut registry = TopicRegistry::new();
        registry.register(Topic::Webhook, recorder.clone(), option(2));
        let handler = registry.handlers.remove(&Topic::Webhook).unwrap();
        let shutdown = CancellationToken::new();

        assert_eq!(handler.run(Bytes::new(), 0, &shutdown).await, Outcome::Retry);
        assert_eq!(handler.run(Bytes::new(), 1, &shutdown).await, Outcome::Failed);
        shutdown.cancel();
        assert_eq!(handler.run(Bytes::new(), 0, &shutdown).await, Outcome::Interrupted);
    }

    #[derive(Debug)]
    struct Sleeper;

    #[async_trait::async_trait]
    impl Consumer for Sleeper {
        async fn handle(&self, ctx: CancellationToken, _payload: Bytes) -> eyre::Result<()> {
            ctx.cancelled().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_jobs_time_out() {
        let mut registry = TopicRegistry::new();
        registry.register(
            Topic::GcBlob,
            Arc::new(Sleeper),
            ConsumerOption {
                timeout: Duration::from_millis(50),
                max_retry: 1,
                concurrency: 1,
            },
        );
        let handler = registry.handlers.remove(&Topic::GcBlob).unwrap();
        let outcome = handler.run(Bytes::new(), 0, &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Failed);
    }

    #[tokio::test]
    async fn transactional_produce_waits_for_commit() {
        let dal = crate::dal::testing::dal().await;
        let queue = WorkQueue::new(MemoryQueue::new(4));
        let recorder = Recorder::failing(0);
        let mut registry = TopicRegistry::new();
        registry.register(Topic::TagPushed, recorder.clone(), option(1));
        let shutdown = CancellationToken::new();
        let mut tasks = queue.start(registry, shutdown.clone());

        let producer = queue.producer();
        let mut tx = dal.begin().await.unwrap();
        producer
            .produce(Topic::TagPushed, &"dropped", Some(&mut tx))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let mut tx = dal.begin().await.unwrap();
        producer
            .produce(Topic::TagPushed, &"kept", Some(&mut tx))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(eventually(|| recorder.seen.lock().len() == 1).await);
        assert_eq!(&recorder.seen.lock()[0][..], b"\"kept\"");

        shutdown.cancel();
        while tasks.join_next().await.is_some() {}
    }
}

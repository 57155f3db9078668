use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use locker::Locker;
use rskafka::client::error::{Error as KafkaError, ProtocolError};
use rskafka::client::partition::{Compression, OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use rskafka::record::Record;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{Handler, Outcome, QueueBackend, Topic, WorkQueueError};
use crate::dal::{Dal, settings};

const FETCH_MAX_BYTES: i32 = 4 * 1024 * 1024;
const FETCH_MAX_WAIT_MS: i32 = 1000;

/// One single-partition Kafka topic per queue topic.
///
/// The committed offset of each topic lives in settings, and only the
/// replica holding the `workq-kafka-<topic>` lock reads it, which gives
/// consumer-group semantics without a group coordinator.
pub struct KafkaQueue {
    client: Client,
    dal: Dal,
    locker: Locker,
    partitions: Mutex<HashMap<Topic, Arc<PartitionClient>>>,
}

impl std::fmt::Debug for KafkaQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaQueue").finish_non_exhaustive()
    }
}

fn kafka_topic(topic: Topic) -> String {
    format!("registry-{topic}")
}

fn offset_key(topic: Topic) -> String {
    format!("workq-kafka-offset-{topic}")
}

impl KafkaQueue {
    /// Connect and create any missing topics.
    pub async fn connect(brokers: &[String], dal: Dal, locker: Locker) -> Result<Self, WorkQueueError> {
        let client = ClientBuilder::new(brokers.to_vec()).build().await?;
        let controller = client.controller_client()?;
        for topic in Topic::ALL {
            match controller.create_topic(kafka_topic(topic), 1, 1, 5_000).await {
                Ok(()) => tracing::info!(%topic, "created kafka topic"),
                Err(KafkaError::ServerError {
                    protocol_error: ProtocolError::TopicAlreadyExists,
                    ..
                }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Self {
            client,
            dal,
            locker,
            partitions: Mutex::new(HashMap::new()),
        })
    }

    async fn partition(&self, topic: Topic) -> Result<Arc<PartitionClient>, WorkQueueError> {
        let mut partitions = self.partitions.lock().await;
        if let Some(client) = partitions.get(&topic) {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(
            self.client
                .partition_client(kafka_topic(topic), 0, UnknownTopicHandling::Retry)
                .await?,
        );
        partitions.insert(topic, Arc::clone(&client));
        Ok(client)
    }

    async fn committed_offset(&self, topic: Topic, partition: &PartitionClient) -> Result<i64, WorkQueueError> {
        let mut conn = self.dal.acquire().await?;
        let stored = settings::get(&mut conn, &offset_key(topic)).await?;
        drop(conn);
        if let Some(offset) = stored
            .and_then(|raw| String::from_utf8(raw).ok())
            .and_then(|raw| raw.parse::<i64>().ok())
        {
            return Ok(offset);
        }
        Ok(partition.get_offset(OffsetAt::Earliest).await?)
    }

    async fn commit_offset(&self, topic: Topic, offset: i64) -> Result<(), WorkQueueError> {
        let mut conn = self.dal.acquire().await?;
        settings::set(&mut conn, &offset_key(topic), offset.to_string().as_bytes()).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl QueueBackend for KafkaQueue {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn produce(&self, topic: Topic, payload: Bytes, times: u32) -> Result<(), WorkQueueError> {
        let partition = self.partition(topic).await?;
        let record = Record {
            key: None,
            value: Some(payload.to_vec()),
            headers: BTreeMap::from([("times".to_owned(), times.to_string().into_bytes())]),
            timestamp: chrono::Utc::now(),
        };
        partition
            .produce(vec![record], Compression::NoCompression)
            .await?;
        Ok(())
    }

    async fn consume(
        self: Arc<Self>,
        handler: Handler,
        shutdown: CancellationToken,
    ) -> Result<(), WorkQueueError> {
        let topic = handler.topic();
        let lock = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            lock = async {
                loop {
                    match self
                        .locker
                        .acquire_with_renew(
                            shutdown.clone(),
                            &format!("workq-kafka-{topic}"),
                            Duration::from_secs(10),
                            Duration::from_secs(30),
                        )
                        .await
                    {
                        Ok(lock) => break Ok(lock),
                        Err(locker::LockError::Timeout(_)) => continue,
                        Err(err) => break Err(WorkQueueError::from(err)),
                    }
                }
            } => lock?,
        };

        let partition = self.partition(topic).await?;
        let mut offset = self.committed_offset(topic, &partition).await?;
        let permits = Arc::new(Semaphore::new(handler.option().concurrency));

        while !shutdown.is_cancelled() && !lock.is_lost() {
            let fetched = tokio::select! {
                _ = shutdown.cancelled() => break,
                fetched = partition.fetch_records(offset, 1..FETCH_MAX_BYTES, FETCH_MAX_WAIT_MS) => fetched,
            };
            let records = match fetched {
                Ok((records, _high_watermark)) => records,
                Err(error) => {
                    tracing::warn!(%error, offset, "fetching records failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if records.is_empty() {
                continue;
            }

            // a batch is committed only once every record in it settled
            let mut batch = JoinSet::new();
            let mut next = offset;
            for item in records {
                next = next.max(item.offset + 1);
                let Some(value) = item.record.value else { continue };
                let times = item
                    .record
                    .headers
                    .get("times")
                    .and_then(|raw| std::str::from_utf8(raw).ok())
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(0);
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    return Err(WorkQueueError::Closed(topic));
                };
                let queue = Arc::clone(&self);
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                batch.spawn(async move {
                    let _permit = permit;
                    let payload = Bytes::from(value);
                    match handler.run(payload.clone(), times, &shutdown).await {
                        Outcome::Done | Outcome::Failed => true,
                        Outcome::Retry => {
                            if let Err(error) = queue.produce(topic, payload, times + 1).await {
                                tracing::error!(%error, "could not requeue job");
                            }
                            true
                        }
                        Outcome::Interrupted => false,
                    }
                });
            }

            let mut settled = true;
            while let Some(result) = batch.join_next().await {
                settled &= result.unwrap_or(false);
            }
            if !settled {
                // redelivered from `offset` after restart
                break;
            }
            offset = next;
            self.commit_offset(topic, offset).await?;
        }

        lock.unlock().await;
        Ok(())
    }
}

use std::sync::Arc;

use bytes::Bytes;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{Handler, Outcome, QueueBackend, Topic, WorkQueueError};

const GROUP: &str = "registry";
const BLOCK_MS: usize = 1000;

/// A Redis stream per topic, read through one consumer group shared by
/// every replica.
#[derive(Clone)]
pub struct RedisQueue {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
    consumer: String,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("prefix", &self.prefix)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    /// Connect to `url`; stream keys are `<prefix>:<topic>`.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, WorkQueueError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            prefix: prefix.to_owned(),
            consumer: uuid::Uuid::new_v4().to_string(),
        })
    }

    fn key(&self, topic: Topic) -> String {
        format!("{}:{topic}", self.prefix)
    }

    async fn ensure_group(&self, key: &str) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        let created: Result<(), RedisError> = conn.xgroup_create_mkstream(key, GROUP, "$").await;
        match created {
            Err(err) if err.code() != Some("BUSYGROUP") => Err(err),
            _ => Ok(()),
        }
    }

    async fn ack(&self, key: &str, id: &str) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.xack(key, GROUP, &[id]).await?;
        let _: i64 = conn.xdel(key, &[id]).await?;
        Ok(())
    }

    async fn read(
        &self,
        reader: &mut MultiplexedConnection,
        key: &str,
        count: usize,
    ) -> Result<Vec<StreamId>, RedisError> {
        let options = StreamReadOptions::default()
            .group(GROUP, &self.consumer)
            .count(count)
            .block(BLOCK_MS);
        let reply: Option<StreamReadReply> = reader.xread_options(&[key], &[">"], &options).await?;
        Ok(reply
            .map(|reply| reply.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }
}

fn decode(entry: &StreamId) -> Option<(Bytes, u32)> {
    let payload: Vec<u8> = entry.get("payload")?;
    let times: u32 = entry.get("times").unwrap_or(0);
    Some((Bytes::from(payload), times))
}

#[async_trait::async_trait]
impl QueueBackend for RedisQueue {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn produce(&self, topic: Topic, payload: Bytes, times: u32) -> Result<(), WorkQueueError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(self.key(topic))
            .arg("*")
            .arg("payload")
            .arg(&payload[..])
            .arg("times")
            .arg(times)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn consume(
        self: Arc<Self>,
        handler: Handler,
        shutdown: CancellationToken,
    ) -> Result<(), WorkQueueError> {
        let topic = handler.topic();
        let key = self.key(topic);
        self.ensure_group(&key).await?;
        // blocking reads get their own connection so they never stall producers
        let mut reader = self.client.get_multiplexed_async_connection().await?;
        let permits = Arc::new(Semaphore::new(handler.option().concurrency));
        let mut inflight = JoinSet::new();

        while !shutdown.is_cancelled() {
            while inflight.try_join_next().is_some() {}
            let available = permits.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = inflight.join_next() => continue,
                }
            }

            let entries = tokio::select! {
                _ = shutdown.cancelled() => break,
                entries = self.read(&mut reader, &key, available) => entries,
            };
            let entries = match entries {
                Ok(entries) => entries,
                Err(error) => {
                    tracing::warn!(%error, "reading stream failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            for entry in entries {
                let Some((payload, times)) = decode(&entry) else {
                    tracing::warn!(id = %entry.id, "dropping malformed stream entry");
                    self.ack(&key, &entry.id).await?;
                    continue;
                };
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    return Err(WorkQueueError::Closed(topic));
                };
                let queue = Arc::clone(&self);
                let handler = handler.clone();
                let shutdown = shutdown.clone();
                let key = key.clone();
                inflight.spawn(async move {
                    let _permit = permit;
                    let outcome = handler.run(payload.clone(), times, &shutdown).await;
                    let requeue = match outcome {
                        Outcome::Done | Outcome::Failed => None,
                        Outcome::Retry => Some(times + 1),
                        Outcome::Interrupted => Some(times),
                    };
                    let result = async {
                        if let Some(times) = requeue {
                            queue.produce(topic, payload, times).await?;
                        }
                        queue.ack(&key, &entry.id).await?;
                        Ok::<_, WorkQueueError>(())
                    }
                    .await;
                    if let Err(error) = result {
                        tracing::error!(%error, id = %entry.id, "could not settle stream entry");
                    }
                });
            }
        }

        while inflight.join_next().await.is_some() {}
        Ok(())
    }
}

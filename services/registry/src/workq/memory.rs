use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{Handler, Outcome, QueueBackend, Topic, WorkQueueError};

#[derive(Debug)]
struct Message {
    payload: Bytes,
    times: u32,
}

/// One bounded channel per topic, living as long as the process.
#[derive(Debug)]
pub struct MemoryQueue {
    senders: HashMap<Topic, mpsc::Sender<Message>>,
    receivers: Mutex<HashMap<Topic, mpsc::Receiver<Message>>>,
}

impl MemoryQueue {
    /// Channels buffering `capacity` jobs each.
    pub fn new(capacity: usize) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for topic in Topic::ALL {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.insert(topic, tx);
            receivers.insert(topic, rx);
        }
        Self {
            senders,
            receivers: Mutex::new(receivers),
        }
    }
}

#[async_trait::async_trait]
impl QueueBackend for MemoryQueue {
    fn name(&self) -> &'static str {
        "inmemory"
    }

    /// Never waits for room: a full channel hands the send to a task, so a
    /// request publishing a job is not held up by a busy consumer.
    async fn produce(&self, topic: Topic, payload: Bytes, times: u32) -> Result<(), WorkQueueError> {
        let sender = self.senders.get(&topic).ok_or(WorkQueueError::Closed(topic))?;
        match sender.try_send(Message { payload, times }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    if sender.send(message).await.is_err() {
                        tracing::warn!(%topic, "queue closed before a buffered job was delivered");
                    }
                });
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(WorkQueueError::Closed(topic)),
        }
    }

    async fn consume(
        self: Arc<Self>,
        handler: Handler,
        shutdown: CancellationToken,
    ) -> Result<(), WorkQueueError> {
        let topic = handler.topic();
        let mut receiver = self
            .receivers
            .lock()
            .remove(&topic)
            .ok_or(WorkQueueError::AlreadyConsuming(topic))?;
        let permits = Arc::new(Semaphore::new(handler.option().concurrency));
        let mut inflight = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                message = receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            while inflight.try_join_next().is_some() {}

            let queue = Arc::clone(&self);
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            inflight.spawn(async move {
                let _permit = permit;
                let outcome = handler
                    .run(message.payload.clone(), message.times, &shutdown)
                    .await;
                let times = match outcome {
                    Outcome::Done | Outcome::Failed => return,
                    Outcome::Retry => message.times + 1,
                    // Nothing outlives the process here; a shutdown loses the job.
                    Outcome::Interrupted => return,
                };
                if let Err(error) = queue.produce(topic, message.payload, times).await {
                    tracing::error!(%error, "could not requeue job");
                }
            });
        }

        while inflight.join_next().await.is_some() {}
        // hand the receiver back so the queue can be consumed again
        self.receivers.lock().insert(topic, receiver);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::workq::testing::{Recorder, eventually};
    use crate::workq::{ConsumerOption, TopicRegistry, WorkQueue};

    #[tokio::test]
    async fn retries_go_back_through_the_channel() {
        let queue = WorkQueue::new(MemoryQueue::new(1));
        let recorder = Recorder::failing(1);
        let mut registry = TopicRegistry::new();
        registry.register(
            Topic::ArtifactPushed,
            recorder.clone(),
            ConsumerOption {
                concurrency: 1,
                max_retry: 2,
                timeout: Duration::from_secs(5),
            },
        );

        // produced before anyone consumes; overflow is parked, not refused
        let producer = queue.producer();
        for n in 0..3 {
            producer
                .produce(Topic::ArtifactPushed, &n, None)
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let mut tasks = queue.start(registry, shutdown.clone());
        assert!(eventually(|| recorder.seen.lock().len() == 3).await);
        assert_eq!(recorder.attempts(), 4);

        shutdown.cancel();
        while tasks.join_next().await.is_some() {}
    }

    #[tokio::test]
    async fn a_topic_has_one_consumer_at_a_time() {
        let queue = Arc::new(MemoryQueue::new(4));
        let recorder = Recorder::failing(0);
        let mut registry = TopicRegistry::new();
        registry.register(Topic::GcTag, recorder, ConsumerOption::default());
        let handler = registry.handlers.remove(&Topic::GcTag).unwrap();

        let shutdown = CancellationToken::new();
        let first = tokio::spawn(Arc::clone(&queue).consume(handler.clone(), shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = Arc::clone(&queue)
            .consume(handler.clone(), shutdown.clone())
            .await;
        assert!(matches!(second, Err(WorkQueueError::AlreadyConsuming(Topic::GcTag))));

        shutdown.cancel();
        first.await.unwrap().unwrap();
    }
}

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{Handler, Outcome, QueueBackend, Topic, WorkQueueError};
use crate::dal::work_queue::{self, Job, JobStatus};
use crate::dal::{Dal, DalResult, ms_ago};

/// Jobs stored as `work_queues` rows and polled.
#[derive(Debug, Clone)]
pub struct DatabaseQueue {
    dal: Dal,
    poll_interval: Duration,
}

impl DatabaseQueue {
    /// Poll `dal` every `poll_interval`.
    pub fn new(dal: Dal, poll_interval: Duration) -> Self {
        Self {
            dal,
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        }
    }

    /// Recover stale rows, then claim up to `limit` pending ones. The
    /// connection is released before any handler runs.
    async fn claim_batch(
        &self,
        handler: &Handler,
        limit: usize,
    ) -> DalResult<Vec<(Job, String)>> {
        let topic = handler.topic().as_str();
        let mut conn = self.dal.acquire().await?;

        let stale_before = ms_ago(handler.option().timeout.saturating_mul(2));
        let recovered = work_queue::recover_stale(&mut conn, topic, stale_before).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "returned stale jobs to pending");
        }

        let mut claimed = Vec::new();
        if limit == 0 {
            return Ok(claimed);
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        for job in work_queue::pending(&mut conn, topic, limit).await? {
            if let Some(version) = work_queue::claim(&mut conn, job.id, &job.version).await? {
                claimed.push((job, version));
            }
        }
        Ok(claimed)
    }
}

async fn settle(dal: &Dal, job: &Job, version: &str, outcome: Outcome) -> DalResult<bool> {
    let (status, times) = match outcome {
        Outcome::Done => (JobStatus::Success, job.times + 1),
        Outcome::Retry => (JobStatus::Pending, job.times + 1),
        Outcome::Failed => (JobStatus::Failed, job.times + 1),
        Outcome::Interrupted => (JobStatus::Pending, job.times),
    };
    let mut conn = dal.acquire().await?;
    work_queue::finish(&mut conn, job.id, version, status, times).await
}

#[async_trait::async_trait]
impl QueueBackend for DatabaseQueue {
    fn name(&self) -> &'static str {
        "database"
    }

    fn in_database(&self) -> bool {
        true
    }

    async fn produce(&self, topic: Topic, payload: Bytes, times: u32) -> Result<(), WorkQueueError> {
        let mut conn = self.dal.acquire().await.map_err(WorkQueueError::from)?;
        work_queue::insert(&mut conn, topic.as_str(), &payload, i64::from(times)).await?;
        Ok(())
    }

    async fn consume(
        self: Arc<Self>,
        handler: Handler,
        shutdown: CancellationToken,
    ) -> Result<(), WorkQueueError> {
        let permits = Arc::new(Semaphore::new(handler.option().concurrency));
        let mut inflight = JoinSet::new();
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            while inflight.try_join_next().is_some() {}

            let claimed = match self.claim_batch(&handler, permits.available_permits()).await {
                Ok(claimed) => claimed,
                Err(error) => {
                    tracing::warn!(%error, "polling work queue failed");
                    continue;
                }
            };

            for (job, version) in claimed {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    return Err(WorkQueueError::Closed(handler.topic()));
                };
                let handler = handler.clone();
                let dal = self.dal.clone();
                let shutdown = shutdown.clone();
                let span = tracing::debug_span!("job_row", id = job.id);
                inflight.spawn(
                    async move {
                        let _permit = permit;
                        let times = u32::try_from(job.times).unwrap_or(u32::MAX);
                        let payload = Bytes::from(job.payload.clone());
                        let outcome = handler.run(payload, times, &shutdown).await;
                        match settle(&dal, &job, &version, outcome).await {
                            Ok(true) => {}
                            Ok(false) => tracing::warn!("job was recovered by another consumer"),
                            Err(error) => tracing::error!(%error, "could not record job outcome"),
                        }
                    }
                    .instrument(span),
                );
            }
        }

        while inflight.join_next().await.is_some() {}
        Ok(())
    }
}

//! Follow-up work for pushes.
//!
//! The push path already refreshes counters inside its own transaction;
//! these consumers redo it once the dust settles, since concurrent pushes
//! into one repository can each commit a count that misses the other's
//! rows. They also turn pushes into webhook events.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::webhook::{self, Event, events};
use crate::app::App;
use crate::dal::{DalError, namespaces, repositories};
use crate::workq::{Consumer, ConsumerOption, Topic, TopicRegistry};

/// Payload of [`Topic::ArtifactPushed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPushed {
    pub namespace_id: i64,
    pub repository_id: i64,
    pub artifact_id: i64,
    pub repository: String,
    pub digest: String,
    /// Tag the manifest was pushed under, if any.
    pub tag: Option<String>,
    /// False when the digest was already present.
    pub created: bool,
}

/// Payload of [`Topic::TagPushed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagPushed {
    pub namespace_id: i64,
    pub repository_id: i64,
    pub artifact_id: i64,
    pub repository: String,
    pub tag: String,
    pub digest: String,
    /// False when an existing tag was moved.
    pub created: bool,
}

fn action(created: bool) -> &'static str {
    if created { "create" } else { "update" }
}

pub(super) fn register(registry: &mut TopicRegistry, app: &App) {
    let option = ConsumerOption {
        concurrency: 4,
        max_retry: 3,
        timeout: Duration::from_secs(30),
    };
    registry
        .register(
            Topic::ArtifactPushed,
            Arc::new(ArtifactReconciler { app: app.clone() }),
            option,
        )
        .register(
            Topic::TagPushed,
            Arc::new(TagReconciler { app: app.clone() }),
            option,
        );
}

/// Refresh the counters of a repository and its namespace, then queue
/// `event`. Nothing happens if the repository is gone.
async fn refresh_and_emit(
    app: &App,
    namespace_id: i64,
    repository_id: i64,
    event: Event,
) -> eyre::Result<()> {
    let mut tx = app.dal().begin().await?;
    match repositories::refresh_counters(tx.conn(), repository_id).await {
        Ok(_) => {}
        Err(DalError::NotFound(_)) => {
            tracing::debug!(repository_id, "repository deleted before reconciliation");
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    }
    namespaces::refresh_counters(tx.conn(), namespace_id).await?;
    webhook::emit(app, event, Some(&mut tx)).await?;
    tx.commit().await?;
    Ok(())
}

/// Consumes [`Topic::ArtifactPushed`].
#[derive(Debug)]
pub struct ArtifactReconciler {
    app: App,
}

#[async_trait::async_trait]
impl Consumer for ArtifactReconciler {
    async fn handle(&self, _ctx: CancellationToken, payload: Bytes) -> eyre::Result<()> {
        let pushed: ArtifactPushed =
            serde_json::from_slice(&payload).wrap_err("decode artifact_pushed")?;
        tracing::debug!(repository = %pushed.repository, digest = %pushed.digest, "reconciling artifact push");
        let event = Event::new(
            events::ARTIFACT,
            action(pushed.created),
            Some(pushed.namespace_id),
            &pushed,
        );
        refresh_and_emit(&self.app, pushed.namespace_id, pushed.repository_id, event).await
    }
}

/// Consumes [`Topic::TagPushed`].
#[derive(Debug)]
pub struct TagReconciler {
    app: App,
}

#[async_trait::async_trait]
impl Consumer for TagReconciler {
    async fn handle(&self, _ctx: CancellationToken, payload: Bytes) -> eyre::Result<()> {
        let pushed: TagPushed = serde_json::from_slice(&payload).wrap_err("decode tag_pushed")?;
        tracing::debug!(repository = %pushed.repository, tag = %pushed.tag, "reconciling tag push");
        let event = Event::new(
            events::TAG,
            action(pushed.created),
            Some(pushed.namespace_id),
            &pushed,
        );
        refresh_and_emit(&self.app, pushed.namespace_id, pushed.repository_id, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing;
    use crate::dal::artifacts::fixtures;
    use crate::dal::{artifacts, tags};

    #[tokio::test]
    async fn counters_follow_the_rows() {
        let (app, _dir) = testing::app().await;
        let (repo, artifact) = {
            let mut conn = app.dal().acquire().await.unwrap();
            let (repo, blob_id) = fixtures::repo(&mut conn).await;
            let (artifact, _) = artifacts::upsert(&mut conn, &fixtures::new(repo.id, "sha256:aa", None))
                .await
                .unwrap();
            artifacts::link_blobs(&mut conn, artifact.id, &[blob_id]).await.unwrap();
            tags::upsert(&mut conn, repo.id, artifact.id, "v1").await.unwrap();
            (repo, artifact)
        };

        let pushed = TagPushed {
            namespace_id: repo.namespace_id,
            repository_id: repo.id,
            artifact_id: artifact.id,
            repository: repo.name.clone(),
            tag: "v1".into(),
            digest: artifact.digest.clone(),
            created: true,
        };
        TagReconciler { app: app.clone() }
            .handle(
                CancellationToken::new(),
                Bytes::from(serde_json::to_vec(&pushed).unwrap()),
            )
            .await
            .unwrap();

        let mut conn = app.dal().acquire().await.unwrap();
        let repo = repositories::get(&mut conn, repo.id).await.unwrap();
        assert_eq!(repo.tag_count, 1);
        assert_eq!(repo.size, 4);
        let ns = namespaces::get(&mut conn, repo.namespace_id).await.unwrap();
        assert_eq!(ns.tag_count, 1);
        assert_eq!(ns.size, 4);
    }

    #[tokio::test]
    async fn deleted_repositories_are_skipped() {
        let (app, _dir) = testing::app().await;
        let pushed = ArtifactPushed {
            namespace_id: 1,
            repository_id: 4242,
            artifact_id: 1,
            repository: "library/gone".into(),
            digest: "sha256:aa".into(),
            tag: None,
            created: true,
        };
        ArtifactReconciler { app }
            .handle(
                CancellationToken::new(),
                Bytes::from(serde_json::to_vec(&pushed).unwrap()),
            )
            .await
            .unwrap();
    }
}

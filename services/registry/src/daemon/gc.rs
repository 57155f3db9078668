//! Garbage collection.
//!
//! A run collects one [`Resource`] and is tracked by a runner row. Phases
//! are meant to run in the order tags, artifacts, blobs, repositories: each
//! one only removes what the previous ones left unreferenced. A cascading
//! run queues the next phase when the current one succeeds.
//!
//! Every deletion is its own transaction and writes an audit record in the
//! same transaction. A phase holds the lock `gc-<resource>-<namespace|all>`
//! for its whole duration, renewed in the background.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use eyre::WrapErr;
use futures::{StreamExt, TryStreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use storage::paths;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::webhook::{self, Event, events};
use crate::app::App;
use crate::dal::artifacts::{self, Artifact};
use crate::dal::blobs::{self, Blob};
use crate::dal::gc::{self as runs, Resource, RetentionRule, RuleKind, RunStatus, Runner};
use crate::dal::repositories::{self, Repository};
use crate::dal::tags::{self, TaggedDigest};
use crate::dal::{DalError, ms_ago, namespaces, now_ms, uploads};
use crate::digest::Digest;
use crate::workq::{Consumer, ConsumerOption, Topic, TopicRegistry};

/// Rows fetched per page.
const PAGE: i64 = 1000;
/// Capacity of each artifact sweep channel.
const CHANNEL_SIZE: usize = 100;
/// Stale uploads reaped per query.
const UPLOAD_PAGE: i64 = 100;
const LOCK_EXPIRE: Duration = Duration::from_secs(30);
const LOCK_WAIT: Duration = Duration::from_secs(5);
const DAY_MS: i64 = 24 * 3600 * 1000;

/// Payload of the four GC topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcJob {
    pub runner_id: i64,
}

/// The topic that runs `resource`.
pub fn topic(resource: Resource) -> Topic {
    match resource {
        Resource::Tag => Topic::GcTag,
        Resource::Artifact => Topic::GcArtifact,
        Resource::Blob => Topic::GcBlob,
        Resource::Repository => Topic::GcRepository,
    }
}

/// Queue a run of `resource`, optionally limited to one namespace, and
/// return the runner id.
pub async fn trigger(
    app: &App,
    resource: Resource,
    namespace: Option<&str>,
    cascade: bool,
    operate_type: &str,
) -> eyre::Result<i64> {
    let namespace_id = resolve_namespace(app, namespace).await?;
    enqueue(app, resource, namespace_id, cascade, operate_type).await
}

/// Run `resource` in the calling task without going through the queue,
/// followed by the later phases when `cascade` is set and each succeeds.
/// Returns the finished runners in order.
pub async fn run_now(
    app: &App,
    resource: Resource,
    namespace: Option<&str>,
    cascade: bool,
    operate_type: &str,
) -> eyre::Result<Vec<Runner>> {
    let namespace_id = resolve_namespace(app, namespace).await?;
    let ctx = CancellationToken::new();
    let mut finished = Vec::new();
    let mut next = Some(resource);
    while let Some(resource) = next {
        let runner = {
            let mut conn = app.dal().acquire().await?;
            runs::create_runner(&mut conn, resource, namespace_id, cascade, operate_type).await?
        };
        let Some(runner) = execute(app, runner.id, &ctx).await? else {
            break;
        };
        next = if runner.cascades() && runner.status == RunStatus::Success.as_str() {
            resource.next()
        } else {
            None
        };
        finished.push(runner);
    }
    Ok(finished)
}

async fn resolve_namespace(app: &App, namespace: Option<&str>) -> eyre::Result<Option<i64>> {
    let Some(name) = namespace else {
        return Ok(None);
    };
    let mut conn = app.dal().acquire().await?;
    let ns = namespaces::find_by_name(&mut conn, name)
        .await?
        .ok_or_else(|| DalError::NotFound(format!("namespace {name}")))?;
    Ok(Some(ns.id))
}

async fn enqueue(
    app: &App,
    resource: Resource,
    namespace_id: Option<i64>,
    cascade: bool,
    operate_type: &str,
) -> eyre::Result<i64> {
    let mut tx = app.dal().begin().await?;
    let runner =
        runs::create_runner(tx.conn(), resource, namespace_id, cascade, operate_type).await?;
    app.producer()
        .produce(topic(resource), &GcJob { runner_id: runner.id }, Some(&mut tx))
        .await?;
    tx.commit().await?;
    tracing::info!(runner_id = runner.id, resource = resource.as_str(), "gc run queued");
    Ok(runner.id)
}

fn lock_key(resource: Resource, namespace_id: Option<i64>) -> String {
    match namespace_id {
        Some(id) => format!("gc-{}-{id}", resource.as_str()),
        None => format!("gc-{}-all", resource.as_str()),
    }
}

#[derive(Debug, Default)]
struct Tally {
    success: AtomicI64,
    failed: AtomicI64,
}

/// Run a runner to completion. `None` if it had already finished, which
/// happens when a job is delivered twice.
#[tracing::instrument(skip(app, ctx))]
async fn execute(app: &App, runner_id: i64, ctx: &CancellationToken) -> eyre::Result<Option<Runner>> {
    let runner = {
        let mut conn = app.dal().acquire().await?;
        runs::get_runner(&mut conn, runner_id).await?
    };
    if runner.status == RunStatus::Success.as_str() || runner.status == RunStatus::Failed.as_str() {
        tracing::debug!(status = %runner.status, "runner already finished");
        return Ok(None);
    }
    let resource = runner.resource()?;
    let tally = Tally::default();

    let key = lock_key(resource, runner.namespace_id);
    let lock = match app
        .locker()
        .acquire_with_renew(ctx.clone(), &key, LOCK_EXPIRE, LOCK_WAIT)
        .await
    {
        Ok(lock) => lock,
        Err(error) => {
            tracing::warn!(%key, %error, "another collection holds the lock");
            let message = format!("lock {key}: {error}");
            return finish(app, runner_id, RunStatus::Failed, &tally, Some(&message))
                .await
                .map(Some);
        }
    };

    {
        let mut conn = app.dal().acquire().await?;
        runs::start_runner(&mut conn, runner_id).await?;
    }
    tracing::info!(resource = resource.as_str(), namespace_id = ?runner.namespace_id, "gc phase started");

    let config = &app.config().daemon.gc;
    let phase = Phase {
        app: app.clone(),
        runner_id,
        namespace_id: runner.namespace_id,
        cutoff: ms_ago(config.retention),
        workers: config.workers.max(1),
        tally: Arc::new(tally),
        ctx: ctx.clone(),
    };
    let result = match resource {
        Resource::Tag => phase.sweep_tags().await,
        Resource::Artifact => ArtifactSweep::new(phase.clone()).run().await,
        Resource::Blob => phase.sweep_blobs().await,
        Resource::Repository => phase.sweep_repositories().await,
    };
    let lost = lock.is_lost();
    lock.unlock().await;

    let (status, message) = match result {
        Ok(()) if lost => (RunStatus::Failed, Some(format!("lock {key} was lost"))),
        Ok(()) => (RunStatus::Success, None),
        Err(error) => (RunStatus::Failed, Some(format!("{error:#}"))),
    };
    finish(app, runner_id, status, &phase.tally, message.as_deref())
        .await
        .map(Some)
}

async fn finish(
    app: &App,
    runner_id: i64,
    status: RunStatus,
    tally: &Tally,
    message: Option<&str>,
) -> eyre::Result<Runner> {
    let success = tally.success.load(Ordering::SeqCst);
    let failed = tally.failed.load(Ordering::SeqCst);
    let runner = {
        let mut conn = app.dal().acquire().await?;
        runs::finish_runner(&mut conn, runner_id, status, success, failed, message).await?;
        runs::get_runner(&mut conn, runner_id).await?
    };
    tracing::info!(status = status.as_str(), success, failed, "gc phase finished");

    let event = Event::new(events::DAEMON_GC, "finish", runner.namespace_id, &runner);
    if let Err(error) = webhook::emit(app, event, None).await {
        tracing::warn!(%error, "could not queue gc webhook event");
    }
    Ok(runner)
}

pub(super) fn register(registry: &mut TopicRegistry, app: &App) {
    let option = ConsumerOption {
        concurrency: 1,
        max_retry: 1,
        timeout: Duration::from_secs(6 * 3600),
    };
    for resource in [
        Resource::Tag,
        Resource::Artifact,
        Resource::Blob,
        Resource::Repository,
    ] {
        registry.register(
            topic(resource),
            Arc::new(Collector {
                app: app.clone(),
                resource,
            }),
            option,
        );
    }
}

/// Queue a cascading collection of everything every `interval`. Replicas
/// share the `gc-schedule` lock so only one of them fires per interval.
pub(super) async fn schedule(app: App, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        // held until it expires
        if let Err(error) = app
            .locker()
            .acquire("gc-schedule", interval / 2, Duration::ZERO)
            .await
        {
            tracing::debug!(%error, "scheduled gc skipped");
            continue;
        }
        match trigger(&app, Resource::Tag, None, true, "periodic").await {
            Ok(runner_id) => tracing::info!(runner_id, "scheduled gc queued"),
            Err(error) => tracing::warn!(error = %format!("{error:#}"), "could not queue scheduled gc"),
        }
    }
}

/// Consumes one of the GC topics.
#[derive(Debug)]
pub struct Collector {
    app: App,
    resource: Resource,
}

#[async_trait::async_trait]
impl Consumer for Collector {
    async fn handle(&self, ctx: CancellationToken, payload: Bytes) -> eyre::Result<()> {
        let job: GcJob = serde_json::from_slice(&payload).wrap_err("decode gc job")?;
        let span = tracing::info_span!("gc", runner_id = job.runner_id, resource = self.resource.as_str());
        let Some(runner) = execute(&self.app, job.runner_id, &ctx).instrument(span).await? else {
            return Ok(());
        };
        if runner.cascades() && runner.status == RunStatus::Success.as_str() {
            if let Some(next) = self.resource.next() {
                enqueue(&self.app, next, runner.namespace_id, true, &runner.operate_type).await?;
            }
        }
        Ok(())
    }
}

/// State shared by the workers of one phase.
#[derive(Debug, Clone)]
struct Phase {
    app: App,
    runner_id: i64,
    namespace_id: Option<i64>,
    /// Epoch ms; anything pulled since is kept.
    cutoff: i64,
    workers: usize,
    tally: Arc<Tally>,
    ctx: CancellationToken,
}

impl Phase {
    fn check_cancelled(&self) -> eyre::Result<()> {
        if self.ctx.is_cancelled() {
            eyre::bail!("collection interrupted");
        }
        Ok(())
    }

    /// Count a deletion attempt. Successful deletions wrote their record in
    /// their own transaction; failures get one here.
    async fn settle(
        &self,
        resource: Resource,
        subject: &str,
        digest: Option<&str>,
        result: eyre::Result<usize>,
    ) -> eyre::Result<()> {
        match result {
            Ok(deleted) => {
                self.tally.success.fetch_add(deleted as i64, Ordering::SeqCst);
            }
            Err(error) => {
                let message = format!("{error:#}");
                tracing::warn!(%subject, error = %message, "gc deletion failed");
                self.tally.failed.fetch_add(1, Ordering::SeqCst);
                let mut conn = self.app.dal().acquire().await?;
                runs::insert_record(
                    &mut conn,
                    resource,
                    self.runner_id,
                    subject,
                    digest,
                    RunStatus::Failed,
                    Some(&message),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// One page of namespace ids in scope after `after`.
    async fn namespace_page(&self, after: i64) -> eyre::Result<Vec<i64>> {
        if let Some(id) = self.namespace_id {
            return Ok(if after < id { vec![id] } else { Vec::new() });
        }
        let mut conn = self.app.dal().acquire().await?;
        Ok(namespaces::list_after(&mut conn, after, PAGE)
            .await?
            .into_iter()
            .map(|ns| ns.id)
            .collect())
    }

    async fn repository_page(&self, namespace_id: i64, after: i64) -> eyre::Result<Vec<Repository>> {
        let mut conn = self.app.dal().acquire().await?;
        Ok(repositories::list_after(&mut conn, Some(namespace_id), after, PAGE).await?)
    }

    async fn sweep_tags(&self) -> eyre::Result<()> {
        let mut after_ns = 0;
        loop {
            let page = self.namespace_page(after_ns).await?;
            let Some(&last) = page.last() else {
                break;
            };
            after_ns = last;
            for namespace_id in page {
                let rules = {
                    let mut conn = self.app.dal().acquire().await?;
                    runs::rules_for(&mut conn, namespace_id).await?
                };
                if rules.is_empty() {
                    continue;
                }
                let rules = rules
                    .iter()
                    .map(Retention::compile)
                    .collect::<eyre::Result<Vec<_>>>()?;
                self.sweep_namespace_tags(namespace_id, &rules).await?;
            }
        }
        Ok(())
    }

    async fn sweep_namespace_tags(&self, namespace_id: i64, rules: &[Retention]) -> eyre::Result<()> {
        let mut after = 0;
        loop {
            self.check_cancelled()?;
            let page = self.repository_page(namespace_id, after).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.id;
            for repo in &page {
                let listed = {
                    let mut conn = self.app.dal().acquire().await?;
                    tags::list_with_digests(&mut conn, repo.id).await?
                };
                let doomed = condemned(rules, &listed, now_ms());
                if doomed.is_empty() {
                    continue;
                }
                for tag in doomed {
                    let subject = format!("{}:{}", repo.name, tag.name);
                    let result = self.delete_tag(repo, tag, &subject).await;
                    self.settle(Resource::Tag, &subject, Some(&tag.digest), result)
                        .await?;
                }
                let mut conn = self.app.dal().acquire().await?;
                repositories::refresh_counters(&mut conn, repo.id).await?;
                namespaces::refresh_counters(&mut conn, namespace_id).await?;
            }
        }
        Ok(())
    }

    async fn delete_tag(&self, repo: &Repository, tag: &TaggedDigest, subject: &str) -> eyre::Result<usize> {
        let mut tx = self.app.dal().begin().await?;
        tags::delete(tx.conn(), tag.id).await?;
        runs::insert_record(
            tx.conn(),
            Resource::Tag,
            self.runner_id,
            subject,
            Some(&tag.digest),
            RunStatus::Success,
            None,
        )
        .await?;
        tx.commit().await?;
        tracing::debug!(repository = %repo.name, tag = %tag.name, "tag collected");
        Ok(1)
    }

    /// Blobs are global, so the namespace scope does not apply here. Stale
    /// upload sessions are reaped first.
    async fn sweep_blobs(&self) -> eyre::Result<()> {
        self.reap_uploads().await?;

        let mut after = 0;
        loop {
            self.check_cancelled()?;
            let (page, referenced) = {
                let mut conn = self.app.dal().acquire().await?;
                let page = blobs::list_stale_after(&mut conn, self.cutoff, after, PAGE).await?;
                let ids: Vec<i64> = page.iter().map(|blob| blob.id).collect();
                let referenced = blobs::referenced_ids(&mut conn, &ids).await?;
                (page, referenced)
            };
            let Some(last) = page.last() else {
                break;
            };
            after = last.id;

            futures::stream::iter(page.into_iter().filter(|blob| !referenced.contains(&blob.id)))
                .map(|blob| async move {
                    let result = self.delete_blob(&blob).await;
                    self.settle(Resource::Blob, &blob.digest, Some(&blob.digest), result)
                        .await
                })
                .buffer_unordered(self.workers)
                .try_collect::<Vec<()>>()
                .await?;
        }
        Ok(())
    }

    async fn delete_blob(&self, blob: &Blob) -> eyre::Result<usize> {
        let path = blob.digest.parse::<Digest>()?.blob_path();
        let mut tx = self.app.dal().begin().await?;
        if blobs::is_referenced(tx.conn(), blob.id).await? {
            return Ok(0);
        }
        // a push that re-uploaded the blob after the page was read wins
        if !blobs::delete_stale(tx.conn(), blob.id, self.cutoff).await? {
            return Ok(0);
        }
        // the object goes before the row commits, so a concurrent push waits
        // for this transaction and then finds no object to dedup against
        self.app.storage().delete(&path).await?;
        runs::insert_record(
            tx.conn(),
            Resource::Blob,
            self.runner_id,
            &blob.digest,
            Some(&blob.digest),
            RunStatus::Success,
            None,
        )
        .await?;
        tx.commit().await?;
        tracing::debug!(digest = %blob.digest, "blob collected");
        Ok(1)
    }

    async fn reap_uploads(&self) -> eyre::Result<()> {
        let before = ms_ago(self.app.config().daemon.gc.upload_staleness);
        loop {
            let stale = {
                let mut conn = self.app.dal().acquire().await?;
                uploads::list_stale(&mut conn, before, UPLOAD_PAGE).await?
            };
            if stale.is_empty() {
                return Ok(());
            }
            for upload in stale {
                let path = paths::upload(&upload.upload_id);
                if let Err(error) = self
                    .app
                    .storage()
                    .abort_upload(&path, &upload.driver_upload_id)
                    .await
                {
                    tracing::debug!(upload_id = %upload.upload_id, %error, "abort of stale upload failed");
                }
                if let Err(error) = self.app.storage().delete(&path).await {
                    tracing::debug!(upload_id = %upload.upload_id, %error, "delete of stale upload failed");
                }
                let mut conn = self.app.dal().acquire().await?;
                uploads::finish(&mut conn, upload.id, uploads::ABORTED).await?;
                tracing::info!(upload_id = %upload.upload_id, repository = %upload.repository, "stale upload reaped");
            }
        }
    }

    async fn sweep_repositories(&self) -> eyre::Result<()> {
        let mut after = 0;
        loop {
            self.check_cancelled()?;
            let page = {
                let mut conn = self.app.dal().acquire().await?;
                repositories::list_empty_after(&mut conn, self.namespace_id, after, PAGE).await?
            };
            let Some(last) = page.last() else {
                break;
            };
            after = last.id;
            for repo in page {
                let result = self.delete_repository(&repo).await;
                self.settle(Resource::Repository, &repo.name, None, result)
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_repository(&self, repo: &Repository) -> eyre::Result<usize> {
        let mut tx = self.app.dal().begin().await?;
        if !repositories::is_empty(tx.conn(), repo.id).await? {
            return Ok(0);
        }
        repositories::delete(tx.conn(), repo.id).await?;
        runs::insert_record(
            tx.conn(),
            Resource::Repository,
            self.runner_id,
            &repo.name,
            None,
            RunStatus::Success,
            None,
        )
        .await?;
        namespaces::refresh_counters(tx.conn(), repo.namespace_id).await?;
        tx.commit().await?;
        tracing::debug!(repository = %repo.name, "repository collected");
        Ok(1)
    }

    /// Whether nothing but staleness keeps `artifact` alive.
    async fn unclaimed(
        &self,
        conn: &mut sqlx::AnyConnection,
        artifact: &Artifact,
    ) -> eyre::Result<bool> {
        Ok(artifact.last_pull < self.cutoff
            && !artifacts::is_tagged(conn, artifact.id).await?
            && !artifacts::has_parent(conn, artifact.id).await?)
    }
}

/// A retention rule ready to apply.
#[derive(Debug)]
struct Retention {
    kind: RuleKind,
    amount: i64,
    pattern: Option<Regex>,
}

impl Retention {
    fn compile(rule: &RetentionRule) -> eyre::Result<Self> {
        let pattern = rule
            .pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .wrap_err_with(|| format!("retention rule {} pattern", rule.id))?;
        Ok(Self {
            kind: rule.kind()?,
            amount: rule.amount.max(0),
            pattern,
        })
    }
}

/// Tags that some rule wants gone. `tags` is ordered newest push first.
fn condemned<'a>(rules: &[Retention], tags: &'a [TaggedDigest], now: i64) -> Vec<&'a TaggedDigest> {
    let mut doomed = HashSet::new();
    for rule in rules {
        let matching = tags.iter().filter(|tag| {
            rule.pattern
                .as_ref()
                .is_none_or(|pattern| pattern.is_match(&tag.name))
        });
        match rule.kind {
            RuleKind::Quantity => {
                doomed.extend(matching.skip(rule.amount as usize).map(|tag| tag.id));
            }
            RuleKind::Day => {
                let cutoff = now - rule.amount * DAY_MS;
                doomed.extend(
                    matching
                        .filter(|tag| tag.pushed_at < cutoff)
                        .map(|tag| tag.id),
                );
            }
        }
    }
    tags.iter().filter(|tag| doomed.contains(&tag.id)).collect()
}

/// A stale artifact found while listing a repository.
#[derive(Debug)]
struct Candidate {
    repository: Repository,
    artifact: Artifact,
}

/// Artifacts deleted together: the referrers of the last one, deepest
/// first, then the artifact itself.
#[derive(Debug)]
struct Unit {
    repository: Repository,
    artifacts: Vec<Artifact>,
}

/// The artifact phase of one run: namespaces go in, stale artifacts are
/// listed, checked, and deleted by a pool of workers. The channels belong
/// to the run and are bounded, so a slow stage holds back the ones before
/// it.
#[derive(Debug)]
struct ArtifactSweep {
    phase: Phase,
    namespaces: (mpsc::Sender<i64>, mpsc::Receiver<i64>),
    candidates: (mpsc::Sender<Candidate>, mpsc::Receiver<Candidate>),
    deletions: (mpsc::Sender<Unit>, mpsc::Receiver<Unit>),
}

impl ArtifactSweep {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            namespaces: mpsc::channel(CHANNEL_SIZE),
            candidates: mpsc::channel(CHANNEL_SIZE),
            deletions: mpsc::channel(CHANNEL_SIZE),
        }
    }

    async fn run(self) -> eyre::Result<()> {
        let Self {
            phase,
            namespaces: (namespaces_tx, namespaces_rx),
            candidates: (candidates_tx, candidates_rx),
            deletions: (deletions_tx, deletions_rx),
        } = self;

        let mut workers: JoinSet<eyre::Result<()>> = JoinSet::new();
        workers.spawn(
            phase
                .clone()
                .list_candidates(namespaces_rx, candidates_tx)
                .in_current_span(),
        );
        workers.spawn(
            phase
                .clone()
                .check_candidates(candidates_rx, deletions_tx)
                .in_current_span(),
        );
        let deletions_rx = Arc::new(Mutex::new(deletions_rx));
        for _ in 0..phase.workers {
            workers.spawn(
                phase
                    .clone()
                    .delete_units(Arc::clone(&deletions_rx))
                    .in_current_span(),
            );
        }

        let mut result = phase.feed_namespaces(namespaces_tx).await;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.map_err(eyre::Report::from).and_then(|done| done);
            match (&result, outcome) {
                (Ok(()), Err(error)) => result = Err(error),
                (Err(_), Err(error)) => tracing::debug!(error = %format!("{error:#}"), "further sweep failure"),
                (_, Ok(())) => {}
            }
        }
        result
    }
}

impl Phase {
    async fn feed_namespaces(&self, tx: mpsc::Sender<i64>) -> eyre::Result<()> {
        let mut after = 0;
        loop {
            let page = self.namespace_page(after).await?;
            let Some(&last) = page.last() else {
                return Ok(());
            };
            after = last;
            for namespace_id in page {
                if tx.send(namespace_id).await.is_err() {
                    // a later stage failed and reports why
                    return Ok(());
                }
            }
        }
    }

    async fn list_candidates(
        self,
        mut namespaces_rx: mpsc::Receiver<i64>,
        tx: mpsc::Sender<Candidate>,
    ) -> eyre::Result<()> {
        while let Some(namespace_id) = namespaces_rx.recv().await {
            let mut after_repo = 0;
            loop {
                self.check_cancelled()?;
                let repos = self.repository_page(namespace_id, after_repo).await?;
                let Some(last) = repos.last() else {
                    break;
                };
                after_repo = last.id;
                for repo in repos {
                    let mut after = 0;
                    loop {
                        let page = {
                            let mut conn = self.app.dal().acquire().await?;
                            artifacts::list_stale_after(&mut conn, repo.id, self.cutoff, after, PAGE)
                                .await?
                        };
                        let Some(last) = page.last() else {
                            break;
                        };
                        after = last.id;
                        for artifact in page {
                            let candidate = Candidate {
                                repository: repo.clone(),
                                artifact,
                            };
                            if tx.send(candidate).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn check_candidates(
        self,
        mut rx: mpsc::Receiver<Candidate>,
        tx: mpsc::Sender<Unit>,
    ) -> eyre::Result<()> {
        while let Some(Candidate {
            repository,
            artifact,
        }) = rx.recv().await
        {
            let subject = format!("{}@{}", repository.name, artifact.digest);
            let digest = artifact.digest.clone();
            match self.deletion_unit(artifact).await {
                Ok(Some(artifacts)) => {
                    let unit = Unit {
                        repository,
                        artifacts,
                    };
                    if tx.send(unit).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    self.settle(Resource::Artifact, &subject, Some(&digest), Err(error))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// The artifacts to delete for `artifact`, or `None` to keep it.
    ///
    /// An artifact linked to a subject lives and dies with that subject.
    /// Anything else goes together with all its referrers, unless one of
    /// them is still in use.
    async fn deletion_unit(&self, artifact: Artifact) -> eyre::Result<Option<Vec<Artifact>>> {
        if artifact.referrer_id.is_some() {
            return Ok(None);
        }
        let mut conn = self.app.dal().acquire().await?;
        if !self.unclaimed(&mut conn, &artifact).await? {
            return Ok(None);
        }

        let mut seen = HashSet::from([artifact.id]);
        let mut unit = vec![artifact];
        let mut next = 0;
        while next < unit.len() {
            let id = unit[next].id;
            next += 1;
            for referrer_id in artifacts::referrer_ids(&mut conn, id).await? {
                if !seen.insert(referrer_id) {
                    continue;
                }
                let referrer = artifacts::get(&mut conn, referrer_id).await?;
                if !self.unclaimed(&mut conn, &referrer).await? {
                    return Ok(None);
                }
                unit.push(referrer);
            }
        }
        // breadth first order reversed puts the deepest referrers first
        unit.reverse();
        Ok(Some(unit))
    }

    async fn delete_units(self, rx: Arc<Mutex<mpsc::Receiver<Unit>>>) -> eyre::Result<()> {
        loop {
            let unit = rx.lock().await.recv().await;
            let Some(unit) = unit else {
                return Ok(());
            };
            let Some(root) = unit.artifacts.last() else {
                continue;
            };
            let subject = format!("{}@{}", unit.repository.name, root.digest);
            let digest = root.digest.clone();
            let result = self.delete_unit(&unit).await;
            self.settle(Resource::Artifact, &subject, Some(&digest), result)
                .await?;
        }
    }

    /// Delete a unit in one transaction, checking again that nothing
    /// claimed its artifacts since they were listed.
    async fn delete_unit(&self, unit: &Unit) -> eyre::Result<usize> {
        let mut tx = self.app.dal().begin().await?;
        let mut deleted = 0;
        for listed in &unit.artifacts {
            let current = match artifacts::get(tx.conn(), listed.id).await {
                Ok(current) => current,
                Err(DalError::NotFound(_)) => continue,
                Err(error) => return Err(error.into()),
            };
            if !self.unclaimed(tx.conn(), &current).await? {
                tracing::debug!(digest = %current.digest, "artifact claimed during collection");
                return Ok(0);
            }
            artifacts::delete(tx.conn(), current.id).await?;
            runs::insert_record(
                tx.conn(),
                Resource::Artifact,
                self.runner_id,
                &format!("{}@{}", unit.repository.name, current.digest),
                Some(&current.digest),
                RunStatus::Success,
                None,
            )
            .await?;
            deleted += 1;
        }
        repositories::refresh_counters(tx.conn(), unit.repository.id).await?;
        namespaces::refresh_counters(tx.conn(), unit.repository.namespace_id).await?;
        tx.commit().await?;
        tracing::debug!(repository = %unit.repository.name, deleted, "artifacts collected");
        Ok(deleted)
    }
}

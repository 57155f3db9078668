//! Manifest push, pull and delete.

use std::collections::HashSet;

use axum::body::Body;
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};

use super::{Action, CONTENT_DIGEST, Request, validate_tag};
use crate::daemon::reconcile::{ArtifactPushed, TagPushed};
use crate::daemon::webhook::{self, Event, events};
use crate::dal::artifacts::{self, Artifact, NewArtifact};
use crate::dal::{blobs, namespaces, repositories, tags};
use crate::digest::{Digest, Digester};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest;
use crate::quota;
use crate::workq::Topic;

/// Largest manifest accepted.
const MAX_MANIFEST_SIZE: usize = 4 * 1024 * 1024;

const OCI_SUBJECT: HeaderName = HeaderName::from_static("oci-subject");

/// A reference is either a digest or a tag.
enum Reference {
    Digest(Digest),
    Tag(String),
}

impl Reference {
    fn parse(reference: &str) -> RegistryResult<Self> {
        if Digest::is_digest_reference(reference) {
            Ok(Reference::Digest(reference.parse()?))
        } else {
            validate_tag(reference)?;
            Ok(Reference::Tag(reference.to_owned()))
        }
    }
}

/// `PUT /v2/<name>/manifests/<reference>`
///
/// Everything the manifest references must already be in the registry. The
/// artifact, its links, the tag and the `artifact_pushed` job are written in
/// one transaction.
pub(super) async fn put(request: Request, reference: &str, body: Body) -> RegistryResult<Response> {
    request.authorize(Action::Push).await?;
    let name = request.name.as_str();
    let Some((namespace_name, _)) = name.split_once('/') else {
        return Err(RegistryError::ManifestWithNamespace(name.to_owned()));
    };
    let reference = Reference::parse(reference)?;

    let raw = axum::body::to_bytes(body, MAX_MANIFEST_SIZE)
        .await
        .map_err(|err| RegistryError::ManifestInvalid(format!("read manifest: {err}")))?;
    let content_type = request
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());
    let parsed = manifest::parse(content_type, &raw)?;

    let digest = match &reference {
        Reference::Digest(declared) => {
            let mut digester = Digester::new(declared.algorithm());
            digester.update(&raw);
            let actual = digester.finish();
            if &actual != declared {
                return Err(RegistryError::DigestInvalid(format!(
                    "manifest hashes to {actual}, not {declared}"
                )));
            }
            actual
        }
        Reference::Tag(_) => Digest::sha256(&raw),
    };
    let digest_str = digest.to_string();

    let app = &request.app;
    let settings = &app.config().namespace;
    let mut tx = app.dal().begin().await?;

    let ns = match namespaces::find_by_name(tx.conn(), namespace_name).await? {
        Some(ns) => ns,
        None if settings.auto_create => {
            namespaces::get_or_create(tx.conn(), namespace_name, settings.visibility).await?
        }
        None => return Err(RegistryError::NameUnknown(namespace_name.to_owned())),
    };
    // Counters and limits are read under the row locks, namespace first.
    let ns = namespaces::lock(tx.conn(), ns.id).await?;
    let repo = match repositories::find_by_name(tx.conn(), name).await? {
        Some(repo) => repositories::lock(tx.conn(), repo.id).await?,
        None => {
            let count = repositories::count_in_namespace(tx.conn(), ns.id).await?;
            quota::check_count("namespace", &ns.name, "repository", count, ns.repository_limit)?;
            repositories::get_or_create(tx.conn(), &ns, name, settings.visibility)
                .await?
                .0
        }
    };

    let wanted: Vec<String> = parsed.blobs.iter().map(ToString::to_string).collect();
    let found = blobs::find_many(tx.conn(), &wanted).await?;
    if let Some(missing) = missing(&wanted, found.iter().map(|b| b.digest.as_str())) {
        return Err(RegistryError::ManifestBlobUnknown(missing));
    }

    let wanted_children: Vec<String> = parsed.children.iter().map(ToString::to_string).collect();
    let children = artifacts::find_many(tx.conn(), repo.id, &wanted_children).await?;
    if let Some(missing) = missing(&wanted_children, children.iter().map(|a| a.digest.as_str())) {
        return Err(RegistryError::ManifestBlobUnknown(missing));
    }

    let blob_ids: Vec<i64> = found.iter().map(|b| b.id).collect();
    let referenced = repositories::referenced_blob_ids(tx.conn(), repo.id, &blob_ids).await?;
    let increase: i64 = found
        .iter()
        .filter(|b| !referenced.contains(&b.id))
        .map(|b| b.size)
        .sum();
    quota::check_size("repository", &repo.name, repo.size, repo.size_limit, increase)?;
    quota::check_size("namespace", &ns.name, ns.size, ns.size_limit, increase)?;

    let subject = parsed.subject.as_ref().map(ToString::to_string);
    let (artifact, created) = artifacts::upsert(
        tx.conn(),
        &NewArtifact {
            repository_id: repo.id,
            digest: &digest_str,
            blobs_size: found.iter().map(|b| b.size).sum(),
            content_type: &parsed.media_type,
            raw: &raw,
            artifact_type: parsed.kind.as_str(),
            declared_type: parsed.artifact_type.as_deref(),
            config_media_type: parsed.config.as_ref().map(|c| c.media_type.as_str()),
            subject_digest: subject.as_deref(),
        },
    )
    .await?;
    if created {
        artifacts::link_blobs(tx.conn(), artifact.id, &blob_ids).await?;
        let child_ids: Vec<i64> = children.iter().map(|a| a.id).collect();
        artifacts::link_children(tx.conn(), artifact.id, &child_ids).await?;
    }

    let tag = match &reference {
        Reference::Tag(tag) => {
            if tags::find(tx.conn(), repo.id, tag).await?.is_none() {
                let count = tags::count_in_repository(tx.conn(), repo.id).await?;
                quota::check_count("repository", &repo.name, "tag", count, repo.tag_limit)?;
                let count = tags::count_in_namespace(tx.conn(), ns.id).await?;
                quota::check_count("namespace", &ns.name, "tag", count, ns.tag_limit)?;
            }
            Some(tags::upsert(tx.conn(), repo.id, artifact.id, tag).await?)
        }
        Reference::Digest(_) => None,
    };

    repositories::refresh_counters(tx.conn(), repo.id).await?;
    namespaces::refresh_counters(tx.conn(), ns.id).await?;

    let producer = app.producer().clone();
    producer
        .produce(
            Topic::ArtifactPushed,
            &ArtifactPushed {
                namespace_id: ns.id,
                repository_id: repo.id,
                artifact_id: artifact.id,
                repository: repo.name.clone(),
                digest: digest_str.clone(),
                tag: tag.as_ref().map(|(t, _)| t.name.clone()),
                created,
            },
            Some(&mut tx),
        )
        .await?;
    if let Some((tag, tag_created)) = &tag {
        producer
            .produce(
                Topic::TagPushed,
                &TagPushed {
                    namespace_id: ns.id,
                    repository_id: repo.id,
                    artifact_id: artifact.id,
                    repository: repo.name.clone(),
                    tag: tag.name.clone(),
                    digest: digest_str.clone(),
                    created: *tag_created,
                },
                Some(&mut tx),
            )
            .await?;
    }
    tx.commit().await?;

    tracing::info!(
        repository = name,
        digest = %digest_str,
        kind = parsed.kind.as_str(),
        created,
        "manifest pushed"
    );

    let mut response = (
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/manifests/{digest_str}")),
            (CONTENT_DIGEST, digest_str),
        ],
    )
        .into_response();
    if let Some(subject) = subject.and_then(|s| s.parse().ok()) {
        response.headers_mut().insert(OCI_SUBJECT, subject);
    }
    Ok(response)
}

/// First of `wanted` not among `found`.
fn missing<'a>(wanted: &[String], found: impl Iterator<Item = &'a str>) -> Option<String> {
    let found: HashSet<&str> = found.collect();
    wanted.iter().find(|d| !found.contains(d.as_str())).cloned()
}

/// Resolve `reference` to an artifact of the repository.
async fn resolve(
    request: &Request,
    reference: &Reference,
    record_pull: bool,
) -> RegistryResult<Artifact> {
    let mut conn = request.app.dal().acquire().await?;
    let repo = repositories::find_by_name(&mut conn, &request.name)
        .await?
        .ok_or_else(|| RegistryError::NameUnknown(request.name.clone()))?;
    let artifact = match reference {
        Reference::Digest(digest) => {
            artifacts::find_by_digest(&mut conn, repo.id, &digest.to_string()).await?
        }
        Reference::Tag(name) => match tags::find(&mut conn, repo.id, name).await? {
            Some(tag) => {
                if record_pull {
                    tags::touch_pull(&mut conn, tag.id).await?;
                }
                Some(artifacts::get(&mut conn, tag.artifact_id).await?)
            }
            None => None,
        },
    };
    let artifact = artifact.ok_or_else(|| {
        RegistryError::ManifestUnknown(format!("{}:{}", request.name, reference_str(reference)))
    })?;
    if record_pull {
        artifacts::touch_pull(&mut conn, artifact.id).await?;
    }
    Ok(artifact)
}

fn reference_str(reference: &Reference) -> String {
    match reference {
        Reference::Digest(digest) => digest.to_string(),
        Reference::Tag(tag) => tag.clone(),
    }
}

/// `GET`/`HEAD /v2/<name>/manifests/<reference>`: the bytes exactly as pushed.
pub(super) async fn get(request: Request, reference: &str, with_body: bool) -> RegistryResult<Response> {
    request.authorize(Action::Pull).await?;
    let reference = Reference::parse(reference)?;
    let artifact = resolve(&request, &reference, with_body).await?;

    let headers = [
        (header::CONTENT_TYPE, artifact.content_type.clone()),
        (header::CONTENT_LENGTH, artifact.raw.len().to_string()),
        (CONTENT_DIGEST, artifact.digest.clone()),
    ];
    if with_body {
        Ok((StatusCode::OK, headers, artifact.raw).into_response())
    } else {
        Ok((StatusCode::OK, headers).into_response())
    }
}

/// `DELETE /v2/<name>/manifests/<reference>`
///
/// By tag only the tag goes; by digest the artifact goes with every tag
/// pointing at it. Blobs are left for garbage collection.
pub(super) async fn delete(request: Request, reference: &str) -> RegistryResult<Response> {
    request.authorize(Action::Delete).await?;
    let reference = Reference::parse(reference)?;
    let app = &request.app;

    let mut tx = app.dal().begin().await?;
    let repo = repositories::find_by_name(tx.conn(), &request.name)
        .await?
        .ok_or_else(|| RegistryError::NameUnknown(request.name.clone()))?;
    let unknown =
        || RegistryError::ManifestUnknown(format!("{}:{}", request.name, reference_str(&reference)));

    match &reference {
        Reference::Tag(name) => {
            let tag = tags::find(tx.conn(), repo.id, name)
                .await?
                .ok_or_else(unknown)?;
            tags::delete(tx.conn(), tag.id).await?;
            let payload = serde_json::json!({ "repository": repo.name, "tag": tag.name });
            let event = Event::new(events::TAG, "delete", Some(repo.namespace_id), payload);
            webhook::emit(app, event, Some(&mut tx)).await?;
        }
        Reference::Digest(digest) => {
            let artifact = artifacts::find_by_digest(tx.conn(), repo.id, &digest.to_string())
                .await?
                .ok_or_else(unknown)?;
            let removed = tags::delete_by_artifact(tx.conn(), artifact.id).await?;
            artifacts::delete(tx.conn(), artifact.id).await?;
            tracing::debug!(tags = ?removed, "tags removed with artifact");
            let payload = serde_json::json!({
                "repository": repo.name,
                "digest": artifact.digest,
                "tags": removed,
            });
            let event = Event::new(events::ARTIFACT, "delete", Some(repo.namespace_id), payload);
            webhook::emit(app, event, Some(&mut tx)).await?;
        }
    }
    repositories::refresh_counters(tx.conn(), repo.id).await?;
    namespaces::refresh_counters(tx.conn(), repo.namespace_id).await?;
    tx.commit().await?;

    tracing::info!(repository = %request.name, reference = %reference_str(&reference), "manifest deleted");
    Ok(StatusCode::ACCEPTED.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_reports_the_first_absent_digest() {
        let wanted = vec!["a".to_owned(), "b".to_owned(), "c".to_owned()];
        assert_eq!(missing(&wanted, ["a", "c"].into_iter()), Some("b".into()));
        assert_eq!(missing(&wanted, ["c", "b", "a"].into_iter()), None);
    }

    #[test]
    fn references_are_digests_or_tags() {
        assert!(matches!(Reference::parse("latest"), Ok(Reference::Tag(_))));
        let digest = Digest::sha256(b"x").to_string();
        assert!(matches!(Reference::parse(&digest), Ok(Reference::Digest(_))));
        assert_eq!(
            Reference::parse("sha256:zz").err().map(|e| e.error_code()),
            Some("DIGEST_INVALID")
        );
    }
}

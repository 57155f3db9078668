use axum::Json;
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use super::{Action, Request};
use crate::dal::artifacts::{self, Artifact};
use crate::dal::repositories;
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{self, Descriptor, OCI_INDEX};

const FILTERS_APPLIED: HeaderName = HeaderName::from_static("oci-filters-applied");

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Index {
    schema_version: u32,
    media_type: &'static str,
    manifests: Vec<Descriptor>,
}

fn descriptor(artifact: &Artifact) -> Descriptor {
    let annotations = manifest::parse(Some(&artifact.content_type), &artifact.raw)
        .ok()
        .and_then(|parsed| parsed.annotations);
    Descriptor {
        media_type: artifact.content_type.clone(),
        digest: artifact.digest.clone(),
        size: artifact.size,
        artifact_type: artifact
            .declared_type
            .clone()
            .or_else(|| artifact.config_media_type.clone()),
        annotations,
        platform: None,
    }
}

/// `GET /v2/<name>/referrers/<digest>?artifactType=<type>`: an image index of
/// the manifests whose `subject` is `digest`. The subject itself need not
/// exist.
pub(super) async fn list(request: Request, digest: &str) -> RegistryResult<Response> {
    request.authorize(Action::Pull).await?;
    let digest: Digest = digest.parse()?;
    let filter = request.params.get("artifactType");

    let mut conn = request.app.dal().acquire().await?;
    let repo = repositories::find_by_name(&mut conn, &request.name)
        .await?
        .ok_or_else(|| RegistryError::NameUnknown(request.name.clone()))?;
    let manifests: Vec<Descriptor> = artifacts::referrers(&mut conn, repo.id, &digest.to_string())
        .await?
        .iter()
        .map(descriptor)
        .filter(|d| filter.is_none_or(|wanted| d.artifact_type.as_deref() == Some(wanted)))
        .collect();

    let body = Json(Index {
        schema_version: 2,
        media_type: OCI_INDEX,
        manifests,
    });
    let mut response = (StatusCode::OK, [(header::CONTENT_TYPE, OCI_INDEX)], body).into_response();
    if filter.is_some() {
        response
            .headers_mut()
            .insert(FILTERS_APPLIED, header::HeaderValue::from_static("artifactType"));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_prefers_the_declared_type() {
        let config = Digest::sha256(b"config");
        let subject = Digest::sha256(b"subject");
        let raw = manifest::fixtures::image(&config, &[], Some(&subject));
        let artifact = Artifact {
            id: 1,
            repository_id: 1,
            digest: Digest::sha256(&raw).to_string(),
            size: raw.len() as i64,
            blobs_size: 0,
            content_type: manifest::OCI_MANIFEST.into(),
            raw,
            artifact_type: "unknown".into(),
            declared_type: Some("application/vnd.example.sbom".into()),
            config_media_type: Some("application/vnd.oci.image.config.v1+json".into()),
            subject_digest: Some(subject.to_string()),
            referrer_id: None,
            pushed_at: 0,
            last_pull: 0,
            pull_times: 0,
            created_at: 0,
            updated_at: 0,
        };
        let d = descriptor(&artifact);
        assert_eq!(d.artifact_type.as_deref(), Some("application/vnd.example.sbom"));
        assert_eq!(d.size, artifact.size);
    }
}

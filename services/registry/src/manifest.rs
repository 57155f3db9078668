//! Manifest parsing and classification.
//!
//! The raw bytes are always stored exactly as received; parsing only pulls
//! out what the registry needs to link rows: the config and layer blobs, the
//! child manifests of an index, and the `subject` of a referrer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// Docker image manifest, schema 2.
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

const DOCKER_SCHEMA1: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v1+json",
    "application/vnd.docker.distribution.manifest.v1+prettyjws",
];

/// What kind of thing a manifest describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactType {
    /// A container image.
    Image,
    /// A multi-platform index.
    ImageIndex,
    /// A Helm chart.
    Chart,
    /// A CNAB bundle.
    Cnab,
    /// A WebAssembly module.
    Wasm,
    /// In-toto / SLSA attestations and SBOM envelopes.
    Provenance,
    /// A cosign signature.
    Cosign,
    /// A Singularity image.
    Sif,
    /// Anything else.
    Unknown,
}

impl ArtifactType {
    /// Stored column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactType::Image => "image",
            ArtifactType::ImageIndex => "imageIndex",
            ArtifactType::Chart => "chart",
            ArtifactType::Cnab => "cnab",
            ArtifactType::Wasm => "wasm",
            ArtifactType::Provenance => "provenance",
            ArtifactType::Cosign => "cosign",
            ArtifactType::Sif => "sif",
            ArtifactType::Unknown => "unknown",
        }
    }

    fn classify(kind: &str) -> Option<Self> {
        let kind = kind.to_ascii_lowercase();
        let found = if kind.contains("helm") {
            ArtifactType::Chart
        } else if kind.contains("cnab") {
            ArtifactType::Cnab
        } else if kind.contains("wasm") {
            ArtifactType::Wasm
        } else if kind.contains("cosign") {
            ArtifactType::Cosign
        } else if kind.contains("in-toto") || kind.contains("dsse") || kind.contains("provenance")
        {
            ArtifactType::Provenance
        } else if kind.contains("sif") {
            ArtifactType::Sif
        } else if kind == "application/vnd.docker.container.image.v1+json"
            || kind == "application/vnd.oci.image.config.v1+json"
        {
            ArtifactType::Image
        } else {
            return None;
        };
        Some(found)
    }
}

/// A content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the referenced content.
    pub digest: String,
    /// Size in bytes.
    pub size: i64,
    /// Artifact type, for referrer descriptors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    /// Free-form annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    /// Platform of an index entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    schema_version: Option<u32>,
    media_type: Option<String>,
    artifact_type: Option<String>,
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
    subject: Option<Descriptor>,
    annotations: Option<BTreeMap<String, String>>,
}

/// The parts of a manifest the registry links.
#[derive(Debug, Clone)]
pub struct ParsedManifest {
    /// Media type the manifest is stored and served with.
    pub media_type: String,
    /// Classification.
    pub kind: ArtifactType,
    /// `artifactType` as declared, or the config media type.
    pub artifact_type: Option<String>,
    /// Config descriptor, for image manifests.
    pub config: Option<Descriptor>,
    /// Every blob the manifest references (config then layers), deduplicated.
    pub blobs: Vec<Digest>,
    /// Child manifests, for an index.
    pub children: Vec<Digest>,
    /// The manifest this one refers to.
    pub subject: Option<Digest>,
    /// Top-level annotations.
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ParsedManifest {
    /// Whether this is an index of other manifests.
    pub fn is_index(&self) -> bool {
        self.kind == ArtifactType::ImageIndex
    }
}

fn is_generic(content_type: &str) -> bool {
    matches!(
        content_type,
        "" | "application/json" | "application/octet-stream"
    )
}

fn parse_digest(value: &str, what: &str) -> RegistryResult<Digest> {
    value
        .parse()
        .map_err(|_| RegistryError::ManifestInvalid(format!("{what} has invalid digest {value}")))
}

/// Parse `bytes` received with `content_type`.
pub fn parse(content_type: Option<&str>, bytes: &[u8]) -> RegistryResult<ParsedManifest> {
    let raw: RawManifest = serde_json::from_slice(bytes)
        .map_err(|err| RegistryError::ManifestInvalid(err.to_string()))?;

    if raw.schema_version == Some(1) {
        return Err(RegistryError::ManifestInvalid(
            "schema 1 manifests are not supported".into(),
        ));
    }

    let header = content_type
        .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
        .filter(|ct| !is_generic(ct));
    let media_type = match (header, raw.media_type.as_deref()) {
        (Some(header), Some(body)) if header != body => {
            return Err(RegistryError::ManifestInvalid(format!(
                "content type {header} does not match mediaType {body}"
            )));
        }
        (Some(mt), _) | (None, Some(mt)) => mt.to_owned(),
        (None, None) if !raw.manifests.is_empty() => OCI_INDEX.to_owned(),
        (None, None) => OCI_MANIFEST.to_owned(),
    };
    if DOCKER_SCHEMA1.contains(&media_type.as_str()) {
        return Err(RegistryError::ManifestInvalid(
            "schema 1 manifests are not supported".into(),
        ));
    }

    let index = media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST;
    if !index && raw.config.is_none() {
        return Err(RegistryError::ManifestInvalid(
            "image manifest is missing its config".into(),
        ));
    }

    let mut blobs = Vec::new();
    if let Some(config) = &raw.config {
        blobs.push(parse_digest(&config.digest, "config")?);
    }
    for layer in &raw.layers {
        let digest = parse_digest(&layer.digest, "layer")?;
        if !blobs.contains(&digest) {
            blobs.push(digest);
        }
    }

    let children = raw
        .manifests
        .iter()
        .map(|child| parse_digest(&child.digest, "manifest"))
        .collect::<RegistryResult<Vec<_>>>()?;

    let subject = raw
        .subject
        .as_ref()
        .map(|subject| parse_digest(&subject.digest, "subject"))
        .transpose()?;

    let artifact_type = raw
        .artifact_type
        .clone()
        .or_else(|| raw.config.as_ref().map(|c| c.media_type.clone()));

    let kind = if index {
        ArtifactType::ImageIndex
    } else {
        raw.artifact_type
            .as_deref()
            .and_then(ArtifactType::classify)
            .or_else(|| {
                raw.config
                    .as_ref()
                    .and_then(|c| ArtifactType::classify(&c.media_type))
            })
            .or_else(|| {
                raw.layers
                    .iter()
                    .find_map(|layer| ArtifactType::classify(&layer.media_type))
            })
            .unwrap_or(ArtifactType::Unknown)
    };

    Ok(ParsedManifest {
        media_type,
        kind,
        artifact_type,
        config: raw.config,
        blobs,
        children,
        subject,
        annotations: raw.annotations,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::digest::Digest;

    /// An OCI image manifest over `config` and `layers`.
    pub fn image(config: &Digest, layers: &[&Digest], subject: Option<&Digest>) -> Vec<u8> {
        let layers: Vec<_> = layers
            .iter()
            .map(|d| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": d.to_string(),
                    "size": 4,
                })
            })
            .collect();
        let mut manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": super::OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config.to_string(),
                "size": 2,
            },
            "layers": layers,
        });
        if let Some(subject) = subject {
            manifest["subject"] = serde_json::json!({
                "mediaType": super::OCI_MANIFEST,
                "digest": subject.to_string(),
                "size": 100,
            });
            manifest["artifactType"] = "application/vnd.example.sbom.v1+json".into();
        }
        serde_json::to_vec(&manifest).unwrap()
    }

    /// An OCI index over `children`.
    pub fn index(children: &[&Digest]) -> Vec<u8> {
        let manifests: Vec<_> = children
            .iter()
            .map(|d| {
                serde_json::json!({
                    "mediaType": super::OCI_MANIFEST,
                    "digest": d.to_string(),
                    "size": 300,
                    "platform": {"architecture": "amd64", "os": "linux"},
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": super::OCI_INDEX,
            "manifests": manifests,
        }))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_manifest_lists_config_then_layers() {
        let config = Digest::sha256(b"{}");
        let layer = Digest::sha256(b"abcd");
        let bytes = fixtures::image(&config, &[&layer, &layer], None);

        let parsed = parse(Some(OCI_MANIFEST), &bytes).unwrap();
        assert_eq!(parsed.kind, ArtifactType::Image);
        assert_eq!(parsed.blobs, vec![config, layer]);
        assert!(parsed.children.is_empty());
        assert!(parsed.subject.is_none());
    }

    #[test]
    fn index_lists_children() {
        let a = Digest::sha256(b"a");
        let b = Digest::sha256(b"b");
        let parsed = parse(None, &fixtures::index(&[&a, &b])).unwrap();
        assert!(parsed.is_index());
        assert_eq!(parsed.children, vec![a, b]);
        assert!(parsed.blobs.is_empty());
    }

    #[test]
    fn referrer_carries_subject() {
        let config = Digest::sha256(b"{}");
        let subject = Digest::sha256(b"subject");
        let parsed = parse(
            Some("application/json"),
            &fixtures::image(&config, &[], Some(&subject)),
        )
        .unwrap();
        assert_eq!(parsed.subject, Some(subject));
        assert_eq!(
            parsed.artifact_type.as_deref(),
            Some("application/vnd.example.sbom.v1+json")
        );
    }

    #[test]
    fn classifies_charts_and_signatures() {
        let chart = serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.cncf.helm.config.v1+json",
                "digest": Digest::sha256(b"c").to_string(),
                "size": 1
            },
            "layers": []
        });
        let parsed = parse(None, &serde_json::to_vec(&chart).unwrap()).unwrap();
        assert_eq!(parsed.kind, ArtifactType::Chart);

        let sig = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": Digest::sha256(b"c").to_string(),
                "size": 1
            },
            "layers": [{
                "mediaType": "application/vnd.dev.cosign.simplesigning.v1+json",
                "digest": Digest::sha256(b"s").to_string(),
                "size": 1
            }]
        });
        let parsed = parse(None, &serde_json::to_vec(&sig).unwrap()).unwrap();
        assert_eq!(parsed.kind, ArtifactType::Image);
    }

    #[test]
    fn rejects_broken_manifests() {
        assert!(parse(None, b"not json").is_err());
        assert!(parse(None, br#"{"schemaVersion":1}"#).is_err());
        assert!(parse(Some(OCI_MANIFEST), br#"{"schemaVersion":2,"layers":[]}"#).is_err());

        let mismatched = fixtures::index(&[]);
        assert!(parse(Some(OCI_MANIFEST), &mismatched).is_err());
    }
}

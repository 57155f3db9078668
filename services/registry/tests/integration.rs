//! End-to-end tests of the `/v2` API on in-process backends.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cacher::MemoryCache;
use locker::{EmbeddedLockBackend, Locker};
use registry::config::{AuthConfig, Config, Visibility};
use registry::daemon::gc;
use registry::dal::gc::Resource;
use registry::dal::{Dal, namespaces, uploads};
use registry::workq::{MemoryQueue, WorkQueue};
use registry::{App, AppBuilder};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use storage::MemoryStorage;
use tower::ServiceExt;

const ABCD_DIGEST: &str = "sha256:88d4266fd4e6338d13b845fcf289579d209c897823b9217da3e161936f031589";
const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

struct Harness {
    app: App,
    router: Router,
    _dir: tempfile::TempDir,
}

async fn harness_with(config: Config) -> Harness {
    harness_on(config, MemoryStorage::new()).await
}

async fn harness_on(config: Config, storage: MemoryStorage) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let locks = EmbeddedLockBackend::open(dir.path().join("locks.redb")).unwrap();
    let app = AppBuilder::new(config)
        .storage(storage)
        .dal(Dal::memory().await.unwrap())
        .locker(Locker::new(locks, "test"))
        .workqueue(WorkQueue::new(MemoryQueue::new(16)))
        .cache(Arc::new(MemoryCache::new(64)))
        .build()
        .await
        .unwrap();
    Harness {
        router: app.router(),
        app,
        _dir: dir,
    }
}

fn open_config() -> Config {
    Config {
        auth: AuthConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn harness() -> Harness {
    harness_with(open_config()).await
}

fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

async fn body_bytes(response: Response<Body>) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn error_code(response: Response<Body>) -> String {
    body_json(response).await["errors"][0]["code"]
        .as_str()
        .unwrap()
        .to_owned()
}

fn location(response: &Response<Body>) -> String {
    response.headers()[header::LOCATION]
        .to_str()
        .unwrap()
        .to_owned()
}

impl Harness {
    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn get(&self, uri: &str) -> Response<Body> {
        self.send(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    /// Push `data` monolithically into `name` and return its digest.
    async fn push_blob(&self, name: &str, data: &[u8]) -> String {
        let digest = sha256(data);
        let response = self
            .send(
                Request::post(format!("/v2/{name}/blobs/uploads/?digest={digest}"))
                    .body(Body::from(data.to_vec()))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED, "push blob {digest}");
        digest
    }

    /// Push an image manifest over freshly pushed config and layer blobs.
    async fn push_image(&self, name: &str, reference: &str, layer: &[u8]) -> (String, Vec<u8>) {
        let config = self.push_blob(name, b"{}").await;
        let layer_digest = self.push_blob(name, layer).await;
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config,
                "size": 2,
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": layer_digest,
                "size": layer.len(),
            }],
        }))
        .unwrap();
        let digest = self.put_manifest(name, reference, &manifest).await;
        (digest, manifest)
    }

    async fn put_manifest(&self, name: &str, reference: &str, manifest: &[u8]) -> String {
        let response = self
            .send(
                Request::put(format!("/v2/{name}/manifests/{reference}"))
                    .header(header::CONTENT_TYPE, OCI_MANIFEST)
                    .body(Body::from(manifest.to_vec()))
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let digest = response.headers()["docker-content-digest"]
            .to_str()
            .unwrap()
            .to_owned();
        assert_eq!(digest, sha256(manifest));
        digest
    }

    /// Open an upload session in `name` and return its location.
    async fn open_session(&self, name: &str) -> String {
        let response = self
            .send(
                Request::post(format!("/v2/{name}/blobs/uploads/"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        location(&response)
    }

    async fn patch(&self, session: &str, range: &str, chunk: &'static [u8]) -> Response<Body> {
        self.send(
            Request::patch(session)
                .header(header::CONTENT_RANGE, range)
                .body(Body::from(chunk))
                .unwrap(),
        )
        .await
    }

    async fn limit_namespace(&self, name: &str, size_limit: i64) {
        let mut conn = self.app.dal().acquire().await.unwrap();
        let ns = namespaces::get_or_create(&mut conn, name, Visibility::Private)
            .await
            .unwrap();
        namespaces::update_limits(&mut conn, ns.id, size_limit, 0, 0)
            .await
            .unwrap();
    }

    /// Make every blob look like it was last pulled at the epoch.
    async fn age_blobs(&self) {
        sqlx::query("UPDATE blobs SET last_pull = $1")
            .bind(0_i64)
            .execute(self.app.dal().pool())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn api_version_check() {
    let h = harness().await;
    let response = h.get("/v2/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-distribution-api-version"],
        "registry/2.0"
    );
}

#[tokio::test]
async fn chunked_push_then_pull() {
    let h = harness().await;

    let response = h
        .send(
            Request::post("/v2/library/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let session = location(&response);

    let response = h
        .send(
            Request::patch(&session)
                .header(header::CONTENT_RANGE, "0-1")
                .body(Body::from("ab"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()[header::RANGE], "0-1");

    let response = h.get(&session).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()[header::RANGE], "0-1");

    let response = h
        .send(
            Request::put(format!("{session}?digest={ABCD_DIGEST}"))
                .body(Body::from("cd"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        location(&response),
        format!("/v2/library/app/blobs/{ABCD_DIGEST}")
    );

    let response = h.get(&format!("/v2/library/app/blobs/{ABCD_DIGEST}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["docker-content-digest"], ABCD_DIGEST);
    assert_eq!(&body_bytes(response).await[..], b"abcd");

    let response = h
        .send(
            Request::head(format!("/v2/library/app/blobs/{ABCD_DIGEST}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "4");
}

#[tokio::test]
async fn out_of_order_chunks_are_refused() {
    let h = harness().await;
    let response = h
        .send(
            Request::post("/v2/library/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let session = location(&response);

    let response = h
        .send(
            Request::patch(&session)
                .header(header::CONTENT_RANGE, "2-3")
                .body(Body::from("cd"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "RANGE_INVALID");
}

#[tokio::test]
async fn chunks_must_fill_their_content_range() {
    let h = harness().await;
    let session = h.open_session("library/app").await;

    let response = h.patch(&session, "0-99", b"abcd").await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(error_code(response).await, "RANGE_INVALID");

    let response = h.patch(&session, "0-1", b"abcd").await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

    // neither refused chunk advanced the session
    let response = h.patch(&session, "0-3", b"abcd").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers()[header::RANGE], "0-3");
}

#[tokio::test]
async fn short_chunks_are_joined_into_full_parts() {
    let h = harness_on(open_config(), MemoryStorage::with_min_part_size(4)).await;
    let session = h.open_session("library/app").await;

    for (range, chunk, held) in [
        ("0-1", &b"ab"[..], "0-1"),
        ("2-3", &b"cd"[..], "0-3"),
        ("4-5", &b"ef"[..], "0-5"),
    ] {
        let response = h.patch(&session, range, chunk).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED, "{range}");
        assert_eq!(response.headers()[header::RANGE], held);
    }
    let response = h.get(&session).await;
    assert_eq!(response.headers()[header::RANGE], "0-5");

    let digest = sha256(b"abcdefg");
    let response = h
        .send(
            Request::put(format!("{session}?digest={digest}"))
                .body(Body::from("g"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = h.get(&format!("/v2/library/app/blobs/{digest}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"abcdefg");
}

#[tokio::test]
async fn digest_mismatch_stores_nothing() {
    let h = harness().await;
    let wrong = sha256(b"something else");
    let response = h
        .send(
            Request::post(format!("/v2/library/app/blobs/uploads/?digest={wrong}"))
                .body(Body::from("abcd"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    for digest in [wrong.as_str(), ABCD_DIGEST] {
        let response = h.get(&format!("/v2/library/app/blobs/{digest}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(response).await, "BLOB_UNKNOWN");
    }
}

#[tokio::test]
async fn manifests_need_a_namespace() {
    let h = harness().await;
    let response = h
        .send(
            Request::put("/v2/nginx/manifests/latest")
                .header(header::CONTENT_TYPE, OCI_MANIFEST)
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "MANIFEST_WITH_NAMESPACE");
}

#[tokio::test]
async fn manifest_lifecycle() {
    let h = harness().await;
    let (digest, manifest) = h.push_image("library/app", "v1", b"layer").await;

    for reference in ["v1", digest.as_str()] {
        let response = h
            .get(&format!("/v2/library/app/manifests/{reference}"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], OCI_MANIFEST);
        assert_eq!(response.headers()["docker-content-digest"], digest.as_str());
        assert_eq!(body_bytes(response).await.to_vec(), manifest);
    }

    let response = h
        .send(
            Request::head("/v2/library/app/manifests/v1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_LENGTH],
        manifest.len().to_string().as_str()
    );

    // untag: the artifact stays reachable by digest
    let response = h
        .send(
            Request::delete("/v2/library/app/manifests/v1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let response = h.get("/v2/library/app/manifests/v1").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "MANIFEST_UNKNOWN");
    let response = h.get(&format!("/v2/library/app/manifests/{digest}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = h
        .send(
            Request::delete(format!("/v2/library/app/manifests/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let response = h.get(&format!("/v2/library/app/manifests/{digest}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn manifests_must_reference_known_blobs() {
    let h = harness().await;
    let manifest = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": sha256(b"never pushed"),
            "size": 12,
        },
        "layers": [],
    }))
    .unwrap();
    let response = h
        .send(
            Request::put("/v2/library/app/manifests/latest")
                .header(header::CONTENT_TYPE, OCI_MANIFEST)
                .body(Body::from(manifest))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "MANIFEST_BLOB_UNKNOWN");
}

#[tokio::test]
async fn tags_are_paginated() {
    let h = harness().await;
    let (digest, manifest) = h.push_image("library/app", "a", b"layer").await;
    for tag in ["b", "c"] {
        assert_eq!(h.put_manifest("library/app", tag, &manifest).await, digest);
    }

    let response = h.get("/v2/library/app/tags/list?n=2").await;
    assert_eq!(response.status(), StatusCode::OK);
    let link = response.headers()[header::LINK].to_str().unwrap().to_owned();
    assert!(link.contains("last=b"), "{link}");
    assert!(link.contains(r#"rel="next""#), "{link}");
    let page = body_json(response).await;
    assert_eq!(page["name"], "library/app");
    assert_eq!(page["tags"], json!(["a", "b"]));

    let response = h.get("/v2/library/app/tags/list?n=2&last=b").await;
    assert!(response.headers().get(header::LINK).is_none());
    assert_eq!(body_json(response).await["tags"], json!(["c"]));

    let response = h.get("/v2/library/app/tags/list?n=0").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "PAGINATION_NUMBER_INVALID");
}

#[tokio::test]
async fn referrers_list_and_filter() {
    let h = harness().await;
    let (subject, _) = h.push_image("library/app", "v1", b"layer").await;

    let config = h.push_blob("library/app", b"{}").await;
    let sbom = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "artifactType": "application/vnd.example.sbom.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.empty.v1+json",
            "digest": config,
            "size": 2,
        },
        "layers": [],
        "subject": {
            "mediaType": OCI_MANIFEST,
            "digest": subject,
            "size": 100,
        },
    }))
    .unwrap();
    let sbom_digest = h.put_manifest("library/app", &sha256(&sbom), &sbom).await;

    let response = h.get(&format!("/v2/library/app/referrers/{subject}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let index = body_json(response).await;
    assert_eq!(index["manifests"][0]["digest"], sbom_digest.as_str());
    assert_eq!(
        index["manifests"][0]["artifactType"],
        "application/vnd.example.sbom.v1+json"
    );

    let response = h
        .get(&format!(
            "/v2/library/app/referrers/{subject}?artifactType=application/vnd.example.other"
        ))
        .await;
    assert_eq!(response.headers()["oci-filters-applied"], "artifactType");
    assert_eq!(body_json(response).await["manifests"], json!([]));
}

#[tokio::test]
async fn mount_links_an_existing_blob() {
    let h = harness().await;
    let (_, manifest) = h.push_image("library/app", "v1", b"abcd").await;
    let manifest: Value = serde_json::from_slice(&manifest).unwrap();
    let digest = manifest["layers"][0]["digest"].as_str().unwrap().to_owned();

    let response = h
        .send(
            Request::post(format!(
                "/v2/library/other/blobs/uploads/?mount={digest}&from=library/app"
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        location(&response),
        format!("/v2/library/other/blobs/{digest}")
    );
}

#[tokio::test]
async fn mounts_need_the_blob_in_the_source_repository() {
    let h = harness().await;
    h.push_image("library/app", "v1", b"abcd").await;
    h.push_image("library/unrelated", "v1", b"other layer").await;
    let digest = sha256(b"abcd");

    for from in ["library/unrelated", "library/missing"] {
        let response = h
            .send(
                Request::post(format!(
                    "/v2/library/other/blobs/uploads/?mount={digest}&from={from}"
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED, "{from}");
        assert!(location(&response).starts_with("/v2/library/other/blobs/uploads/"));
    }
}

#[tokio::test]
async fn blob_deletion_is_unsupported() {
    let h = harness().await;
    let digest = h.push_blob("library/app", b"abcd").await;
    let response = h
        .send(
            Request::delete(format!("/v2/library/app/blobs/{digest}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(error_code(response).await, "UNSUPPORTED");
}

#[tokio::test]
async fn cancelled_uploads_are_gone() {
    let h = harness().await;
    let response = h
        .send(
            Request::post("/v2/library/app/blobs/uploads/")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    let session = location(&response);

    let response = h
        .send(Request::delete(&session).body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = h.get(&session).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");
}

#[tokio::test]
async fn namespace_size_quota_is_enforced() {
    let h = harness().await;
    {
        let mut conn = h.app.dal().acquire().await.unwrap();
        let ns = namespaces::get_or_create(&mut conn, "small", Visibility::Private)
            .await
            .unwrap();
        namespaces::update_limits(&mut conn, ns.id, 3, 0, 0)
            .await
            .unwrap();
    }

    let digest = sha256(b"abcd");
    let response = h
        .send(
            Request::post(format!("/v2/small/app/blobs/uploads/?digest={digest}"))
                .body(Body::from("abcd"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "DENIED");
    let message = body["errors"][0]["message"].as_str().unwrap();
    assert!(message.contains("namespace small size quota exceeded"), "{message}");
}

#[tokio::test]
async fn open_sessions_share_the_namespace_quota() {
    let h = harness().await;
    h.limit_namespace("small", 6).await;

    let first = h.open_session("small/app").await;
    let response = h.patch(&first, "0-3", b"abcd").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let second = h.open_session("small/web").await;
    let response = h.patch(&second, "0-3", b"efgh").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "DENIED");

    let response = h
        .send(
            Request::put(format!("{first}?digest={ABCD_DIGEST}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn commit_rechecks_the_quota() {
    let h = harness().await;
    h.limit_namespace("small", 6).await;

    let session = h.open_session("small/app").await;
    let response = h.patch(&session, "0-3", b"abcd").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // another replica grows a second session after this one's last chunk
    {
        let mut conn = h.app.dal().acquire().await.unwrap();
        let other = uploads::create(&mut conn, "elsewhere", "small/web", "mem-x")
            .await
            .unwrap();
        assert!(uploads::append_part(&mut conn, &other, 1, "etag", 0, 3).await.unwrap());
    }

    let response = h
        .send(
            Request::put(format!("{session}?digest={ABCD_DIGEST}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "DENIED");
    let message = body["errors"][0]["message"].as_str().unwrap();
    assert!(message.contains("namespace small size quota exceeded"), "{message}");

    let response = h.get(&session).await;
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");
    let response = h.get(&format!("/v2/small/app/blobs/{ABCD_DIGEST}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bearer_tokens_unlock_the_api() {
    let h = harness_with(Config::default()).await;

    let response = h.get("/v2/").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response.headers()[header::WWW_AUTHENTICATE]
        .to_str()
        .unwrap()
        .to_owned();
    assert!(challenge.starts_with(r#"Bearer realm=""#), "{challenge}");
    assert!(challenge.contains("/v2/token"), "{challenge}");

    let response = h
        .send(
            Request::get("/v2/token")
                .header(
                    header::AUTHORIZATION,
                    format!("Basic {}", STANDARD.encode("admin:wrong")),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = h
        .send(
            Request::get("/v2/token")
                .header(
                    header::AUTHORIZATION,
                    format!("Basic {}", STANDARD.encode("admin:Admin@123")),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let token = body_json(response).await["token"]
        .as_str()
        .unwrap()
        .to_owned();

    let response = h
        .send(
            Request::get("/v2/")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn gc_collects_unreferenced_blobs_only() {
    let mut config = Config::default();
    config.auth.enabled = false;
    config.daemon.gc.retention = Duration::from_secs(3600);
    let h = harness_with(config).await;

    let (_, manifest) = h.push_image("library/app", "v1", b"kept layer").await;
    let manifest: Value = serde_json::from_slice(&manifest).unwrap();
    let kept_layer = manifest["layers"][0]["digest"].as_str().unwrap().to_owned();
    let orphan = h.push_blob("library/app", b"orphan").await;
    h.age_blobs().await;

    let runners = gc::run_now(&h.app, Resource::Blob, None, false, "manual")
        .await
        .unwrap();
    assert_eq!(runners.len(), 1);
    assert_eq!(runners[0].status, "success");
    assert_eq!(runners[0].success_count, 1);

    let response = h.get(&format!("/v2/library/app/blobs/{orphan}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = h.get(&format!("/v2/library/app/blobs/{kept_layer}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(&body_bytes(response).await[..], b"kept layer");
}

#[tokio::test]
async fn gc_keeps_recently_pulled_blobs() {
    let mut config = Config::default();
    config.auth.enabled = false;
    config.daemon.gc.retention = Duration::from_secs(3600);
    let h = harness_with(config).await;

    let orphan = h.push_blob("library/app", b"fresh orphan").await;
    let runners = gc::run_now(&h.app, Resource::Blob, None, false, "manual")
        .await
        .unwrap();
    assert_eq!(runners[0].status, "success");
    assert_eq!(runners[0].success_count, 0);

    let response = h.get(&format!("/v2/library/app/blobs/{orphan}")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

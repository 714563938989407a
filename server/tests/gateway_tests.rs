//! HTTP front door tests against an in-memory rule set and a fake image
//! store that writes manifests into a temporary directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, IF_MODIFIED_SINCE, LAST_MODIFIED, RANGE};
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use jitreg_core::{
    EventEmitter, GatewayError, ImageResource, ImageSpec, Mutation, Result, RuleSet,
};
use jitreg_runtime::{DynamicRules, ImageStore, MemoryRuleSource, RuleSource};
use jitreg_server::error::ResponseBody;
use jitreg_server::handler::{API_VERSION_HEADER, CONTENT_DIGEST_HEADER, FALLBACK_MEDIA_TYPE};
use jitreg_server::{Gateway, GatewayServer};

const MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const DIGEST: &str = "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

fn manifest_json() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": DIGEST,
            "size": 3
        },
        "layers": []
    }))
    .unwrap()
}

/// Image store that writes a fixed manifest for each successful build.
struct FakeStore {
    root: TempDir,
    builds: AtomicUsize,
    delay: Duration,
    fail: bool,
    seen: Mutex<Vec<(String, Mutation)>>,
}

impl FakeStore {
    fn new() -> Self {
        Self::with(Duration::ZERO, false)
    }

    fn with(delay: Duration, fail: bool) -> Self {
        Self {
            root: TempDir::new().unwrap(),
            builds: AtomicUsize::new(0),
            delay,
            fail,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn put_blob(&self, digest: &str, data: &[u8]) {
        let path = self.blob_path(digest);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn put_manifest(&self, repository: &str, tag: &str, data: &[u8]) {
        let path = self.manifest_path(repository, tag);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }
}

#[async_trait]
impl ImageStore for FakeStore {
    async fn build(&self, reference: &str, mutation: &Mutation) -> Result<()> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .push((reference.to_string(), mutation.clone()));
        tokio::time::sleep(self.delay).await;

        if self.fail {
            return Err(GatewayError::BuildError {
                reference: reference.to_string(),
                message: "upstream unavailable".to_string(),
            });
        }

        let (repository, tag) = reference.rsplit_once(':').unwrap();
        let path = self.manifest_path(repository, tag);
        tokio::fs::create_dir_all(path.parent().unwrap()).await?;
        tokio::fs::write(&path, manifest_json()).await?;
        Ok(())
    }

    fn manifest_path(&self, repository: &str, tag: &str) -> PathBuf {
        self.root.path().join("manifests").join(repository).join(tag)
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.path().join("blobs").join(digest.replace(':', "/"))
    }
}

fn spec(pattern: &str, base_image: &str) -> ImageSpec {
    ImageSpec {
        pattern: pattern.to_string(),
        base_image: base_image.to_string(),
        labels: Default::default(),
        annotations: Default::default(),
        env: Vec::new(),
    }
}

fn gateway(store: Arc<FakeStore>, specs: &[ImageSpec]) -> Arc<Gateway> {
    let rules = Arc::new(DynamicRules::static_only(RuleSet::from_specs(specs).unwrap()));
    Arc::new(Gateway::new(store, rules, EventEmitter::default()))
}

fn request(method: Method, path: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

async fn get(gateway: &Gateway, path: &str) -> Response<ResponseBody> {
    gateway.handle(request(Method::GET, path)).await
}

async fn body_bytes(response: Response<ResponseBody>) -> Vec<u8> {
    hyper::body::to_bytes(response.into_body())
        .await
        .unwrap()
        .to_vec()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_ping() {
    let gateway = gateway(Arc::new(FakeStore::new()), &[]);
    let response = get(&gateway, "/v2/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[API_VERSION_HEADER], "registry/2.0");
    assert_eq!(body_bytes(response).await, b"ok");
}

#[tokio::test]
async fn test_other_methods_not_allowed() {
    let store = Arc::new(FakeStore::new());
    let gateway = gateway(store.clone(), &[spec("*", "busybox")]);
    for method in [Method::POST, Method::PUT, Method::DELETE] {
        let response = gateway
            .handle(request(method, "/v2/app/foo/manifests/v1"))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[API_VERSION_HEADER], "registry/2.0");
    }
    assert_eq!(store.builds(), 0);
}

#[tokio::test]
async fn test_unroutable_paths_not_found() {
    let store = Arc::new(FakeStore::new());
    let gateway = gateway(store.clone(), &[spec("*", "busybox")]);
    for path in [
        "/",
        "/healthz",
        "/v2",
        "/v2/app",
        "/v2/app/foo/tags/list",
        "/v2/../../etc/manifests/passwd",
        "/v2/app/foo/manifests/..",
    ] {
        let response = get(&gateway, path).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", path);
        assert_eq!(response.headers()[API_VERSION_HEADER], "registry/2.0");
    }
    assert_eq!(store.builds(), 0);
}

// ============================================================================
// Manifests
// ============================================================================

#[tokio::test]
async fn test_manifest_built_on_first_pull() {
    let store = Arc::new(FakeStore::new());
    let mut rule = spec("app/*", "busybox:1.36");
    rule.labels.insert("team".to_string(), "platform".to_string());
    rule.env.push("MODE=prod".to_string());
    let gateway = gateway(store.clone(), &[rule]);

    let response = get(&gateway, "/v2/app/foo/manifests/v1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], MEDIA_TYPE);

    let expected_digest = format!("sha256:{}", hex::encode(Sha256::digest(manifest_json())));
    assert_eq!(
        response.headers()[CONTENT_DIGEST_HEADER],
        expected_digest.as_str()
    );
    assert_eq!(body_bytes(response).await, manifest_json());

    let seen = store.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    let (reference, mutation) = &seen[0];
    assert_eq!(reference, "app/foo:v1");
    assert_eq!(mutation.base_image, "busybox:1.36");
    assert_eq!(mutation.labels["team"], "platform");
    assert_eq!(mutation.env, vec!["MODE=prod".to_string()]);
}

#[tokio::test]
async fn test_existing_manifest_is_not_rebuilt() {
    let store = Arc::new(FakeStore::new());
    let gateway = gateway(store.clone(), &[spec("app/*", "busybox")]);

    assert_eq!(get(&gateway, "/v2/app/foo/manifests/v1").await.status(), StatusCode::OK);
    assert_eq!(get(&gateway, "/v2/app/foo/manifests/v1").await.status(), StatusCode::OK);
    assert_eq!(store.builds(), 1);
}

#[tokio::test]
async fn test_head_manifest() {
    let store = Arc::new(FakeStore::new());
    let gateway = gateway(store.clone(), &[spec("app/*", "busybox")]);

    let response = gateway
        .handle(request(Method::HEAD, "/v2/app/foo/manifests/v1"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], MEDIA_TYPE);
    assert_eq!(
        response.headers()[CONTENT_LENGTH],
        manifest_json().len().to_string().as_str()
    );
    assert!(body_bytes(response).await.is_empty());
    assert_eq!(store.builds(), 1);
}

#[tokio::test]
async fn test_manifest_without_media_type_ignores_tag_extension() {
    let store = Arc::new(FakeStore::new());
    store.put_manifest("app/foo", "v1.html", br#"{"schemaVersion":2}"#);
    let gateway = gateway(store.clone(), &[spec("app/*", "busybox")]);

    let response = get(&gateway, "/v2/app/foo/manifests/v1.html").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], FALLBACK_MEDIA_TYPE);
    assert_eq!(body_bytes(response).await, br#"{"schemaVersion":2}"#);
    assert_eq!(store.builds(), 0);
}

#[tokio::test]
async fn test_unmatched_reference_not_found() {
    let store = Arc::new(FakeStore::new());
    let gateway = gateway(store.clone(), &[spec("app/*", "busybox")]);

    let response = get(&gateway, "/v2/other/foo/manifests/v1").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(store.builds(), 0);
}

#[tokio::test]
async fn test_manifest_by_digest_never_builds() {
    let store = Arc::new(FakeStore::new());
    let gateway = gateway(store.clone(), &[spec("*", "busybox")]);

    let missing = get(&gateway, &format!("/v2/app/foo/manifests/{}", DIGEST)).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    store.put_blob(DIGEST, &manifest_json());
    let response = get(&gateway, &format!("/v2/app/foo/manifests/{}", DIGEST)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], MEDIA_TYPE);
    assert_eq!(store.builds(), 0);
}

#[tokio::test]
async fn test_undecodable_manifest_is_server_error() {
    let store = Arc::new(FakeStore::new());
    store.put_manifest("app/foo", "v1", b"not json");
    let gateway = gateway(store.clone(), &[spec("app/*", "busybox")]);

    let response = get(&gateway, "/v2/app/foo/manifests/v1").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(store.builds(), 0);
}

#[tokio::test]
async fn test_build_failure_is_server_error() {
    let store = Arc::new(FakeStore::with(Duration::ZERO, true));
    let gateway = gateway(store.clone(), &[spec("app/*", "busybox")]);

    let response = get(&gateway, "/v2/app/foo/manifests/v1").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("upstream unavailable"));

    // failures are not remembered
    get(&gateway, "/v2/app/foo/manifests/v1").await;
    assert_eq!(store.builds(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_build_reaches_builder_only() {
    let store = Arc::new(FakeStore::with(Duration::from_millis(300), true));
    let gateway = gateway(store.clone(), &[spec("app/*", "busybox")]);

    let builder = {
        let gateway = gateway.clone();
        tokio::spawn(async move { get(&gateway, "/v2/app/foo/manifests/v1").await.status() })
    };
    wait_until(|| gateway.coordinator().in_flight() == 1).await;

    let waiter = {
        let gateway = gateway.clone();
        tokio::spawn(async move { get(&gateway, "/v2/app/foo/manifests/v1").await.status() })
    };

    assert_eq!(builder.await.unwrap(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(waiter.await.unwrap(), StatusCode::NOT_FOUND);
    assert_eq!(store.builds(), 1);
    assert_eq!(gateway.coordinator().in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pulls_build_once() {
    let store = Arc::new(FakeStore::with(Duration::from_millis(200), false));
    let gateway = gateway(store.clone(), &[spec("app/*", "busybox")]);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            get(&gateway, "/v2/app/foo/manifests/v1").await.status()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }
    assert_eq!(store.builds(), 1);
}

// ============================================================================
// Blobs
// ============================================================================

#[tokio::test]
async fn test_blob_served_from_store() {
    let store = Arc::new(FakeStore::new());
    store.put_blob(DIGEST, b"foo");
    let gateway = gateway(store.clone(), &[]);

    let response = get(&gateway, &format!("/v2/app/foo/blobs/{}", DIGEST)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"foo");

    let missing = get(
        &gateway,
        "/v2/app/foo/blobs/sha256:0000000000000000000000000000000000000000000000000000000000000000",
    )
    .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(store.builds(), 0);
}

#[tokio::test]
async fn test_blob_range_request() {
    let store = Arc::new(FakeStore::new());
    store.put_blob(DIGEST, b"0123456789");
    let gateway = gateway(store, &[]);

    let req = Request::get(format!("/v2/app/blobs/{}", DIGEST))
        .header(RANGE, "bytes=2-5")
        .body(Body::empty())
        .unwrap();
    let response = gateway.handle(req).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_bytes(response).await, b"2345");
}

#[tokio::test]
async fn test_blob_conditional_request() {
    let store = Arc::new(FakeStore::new());
    store.put_blob(DIGEST, b"foo");
    let gateway = gateway(store, &[]);
    let path = format!("/v2/app/blobs/{}", DIGEST);

    let first = get(&gateway, &path).await;
    let last_modified = first.headers()[LAST_MODIFIED]
        .to_str()
        .unwrap()
        .to_string();

    let req = Request::get(path.as_str())
        .header(IF_MODIFIED_SINCE, last_modified)
        .body(Body::empty())
        .unwrap();
    let response = gateway.handle(req).await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
}

// ============================================================================
// Server lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_start_and_shutdown() {
    let store = Arc::new(FakeStore::new());
    let gateway = gateway(store, &[spec("app/*", "busybox")]);
    let server = GatewayServer::new("127.0.0.1:0".parse().unwrap(), gateway)
        .start()
        .unwrap();

    let client = Client::new();
    let uri = format!("http://{}/v2/app/foo/manifests/v1", server.local_addr())
        .parse()
        .unwrap();
    let response = client.get(uri).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], MEDIA_TYPE);
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_picks_up_dynamic_rules() {
    let store = Arc::new(FakeStore::new());
    let source = Arc::new(MemoryRuleSource::new());
    let rules = Arc::new(DynamicRules::new(
        RuleSet::default(),
        Some(source.clone() as Arc<dyn RuleSource>),
        EventEmitter::default(),
    ));
    let gateway = Arc::new(Gateway::new(store.clone(), rules.clone(), EventEmitter::default()));
    let server = GatewayServer::new("127.0.0.1:0".parse().unwrap(), gateway)
        .start()
        .unwrap();

    let client = Client::new();
    let uri: hyper::Uri = format!("http://{}/v2/lib/x/manifests/1", server.local_addr())
        .parse()
        .unwrap();

    let response = client.get(uri.clone()).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(rules.is_cached());

    source.apply(ImageResource::new("lib", spec("lib/*", "alpine")));
    wait_until(|| !rules.is_cached()).await;

    let response = client.get(uri).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.builds(), 1);
    assert_eq!(store.seen.lock()[0].1.base_image, "alpine");
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .unwrap()
        .unwrap();
}

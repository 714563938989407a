//! Request handling for the pull API.

use std::path::Path;
use std::sync::Arc;

use http_body::Body as _;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Request, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use jitreg_core::EventEmitter;
use jitreg_runtime::{BuildCoordinator, DynamicRules, ImageStore};

use crate::error::{gateway_error_to_response, text_response, ResponseBody};
use crate::route::{route, ManifestRef, Route, RouteError};

/// `Docker-Distribution-API-Version` response header.
pub const API_VERSION_HEADER: &str = "docker-distribution-api-version";
/// `Docker-Content-Digest` response header.
pub const CONTENT_DIGEST_HEADER: &str = "docker-content-digest";

const API_VERSION: &str = "registry/2.0";

/// `Content-Type` of a manifest that does not declare a media type.
pub const FALLBACK_MEDIA_TYPE: &str = "application/octet-stream";

/// Only the media type is read from a stored manifest.
#[derive(Deserialize)]
struct ManifestMediaType {
    #[serde(rename = "mediaType", default)]
    media_type: String,
}

/// The HTTP front door: routes pull requests, builds on demand and serves
/// from the image store.
pub struct Gateway {
    store: Arc<dyn ImageStore>,
    rules: Arc<DynamicRules>,
    coordinator: BuildCoordinator,
}

impl Gateway {
    pub fn new(store: Arc<dyn ImageStore>, rules: Arc<DynamicRules>, events: EventEmitter) -> Self {
        let coordinator = BuildCoordinator::new(rules.clone(), store.clone(), events);
        Self {
            store,
            rules,
            coordinator,
        }
    }

    pub fn rules(&self) -> &Arc<DynamicRules> {
        &self.rules
    }

    pub fn coordinator(&self) -> &BuildCoordinator {
        &self.coordinator
    }

    /// Handle one request.
    pub async fn handle(&self, req: Request<Body>) -> Response<ResponseBody> {
        let mut response = match route(req.method(), req.uri().path()) {
            Ok(Route::Ping) => text_response(StatusCode::OK, "ok"),
            Ok(Route::Blob { digest, .. }) => serve_file(req, &self.store.blob_path(&digest)).await,
            Ok(Route::Manifest {
                reference: ManifestRef::Digest(digest),
                ..
            }) => serve_manifest(req, &self.store.blob_path(&digest)).await,
            Ok(Route::Manifest {
                repository,
                reference: ManifestRef::Tag(tag),
            }) => self.manifest_by_tag(req, &repository, &tag).await,
            Err(RouteError::MethodNotAllowed) => {
                text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
            }
            Err(RouteError::NotFound) => text_response(StatusCode::NOT_FOUND, "not found"),
        };

        response
            .headers_mut()
            .insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
        response
    }

    async fn manifest_by_tag(
        &self,
        req: Request<Body>,
        repository: &str,
        tag: &str,
    ) -> Response<ResponseBody> {
        let path = self.store.manifest_path(repository, tag);
        if tokio::fs::metadata(&path).await.is_err() {
            if let Err(e) = self.coordinator.ensure_built(repository, tag).await {
                tracing::error!(
                    repository,
                    tag,
                    error = %e,
                    "Failed to build manifest"
                );
                return gateway_error_to_response(&e);
            }
        }
        serve_manifest(req, &path).await
    }
}

/// Serve a manifest with its own media type as `Content-Type`.
async fn serve_manifest(req: Request<Body>, path: &Path) -> Response<ResponseBody> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Manifest not available");
            return text_response(StatusCode::NOT_FOUND, "not found");
        }
    };

    let manifest: ManifestMediaType = match serde_json::from_slice(&data) {
        Ok(manifest) => manifest,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to decode manifest");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(&data)));

    let mut response = serve_file(req, path).await;
    if response.status().is_success() {
        let headers = response.headers_mut();
        // ServeFile guesses from the extension, which here is the client's tag
        let content_type = HeaderValue::from_str(&manifest.media_type)
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| HeaderValue::from_static(FALLBACK_MEDIA_TYPE));
        headers.insert(CONTENT_TYPE, content_type);
        if let Ok(value) = HeaderValue::from_str(&digest) {
            headers.insert(CONTENT_DIGEST_HEADER, value);
        }
    }
    response
}

/// Stream a file with range and conditional request handling.
async fn serve_file(req: Request<Body>, path: &Path) -> Response<ResponseBody> {
    match ServeFile::new(path).oneshot(req).await {
        Ok(response) => response.map(|body| body.boxed_unsync()),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Failed to serve file");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

//! Request path routing for the OCI Distribution pull API.
//!
//! `/v2/<repository...>/<kind>/<value>`: everything between the `/v2/`
//! prefix and the final two segments is the repository, so repository
//! names may contain slashes.

use hyper::Method;
use jitreg_core::is_digest;

/// API prefix every request path must start with.
pub const API_PREFIX: &str = "/v2/";

/// Maximum tag length in the OCI tag grammar.
const MAX_TAG_LEN: usize = 128;

/// How a manifest is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestRef {
    Tag(String),
    Digest(String),
}

/// A routed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/v2/` liveness check
    Ping,
    Blob {
        repository: String,
        digest: String,
    },
    Manifest {
        repository: String,
        reference: ManifestRef,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    MethodNotAllowed,
    NotFound,
}

/// Route a request by method and path.
pub fn route(method: &Method, path: &str) -> Result<Route, RouteError> {
    if method != Method::GET && method != Method::HEAD {
        return Err(RouteError::MethodNotAllowed);
    }
    if !path.starts_with(API_PREFIX) {
        return Err(RouteError::NotFound);
    }
    if path == API_PREFIX {
        return Ok(Route::Ping);
    }

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < 4 {
        return Err(RouteError::NotFound);
    }

    let repository = parts[2..parts.len() - 2].join("/");
    if !is_repository(&repository) {
        return Err(RouteError::NotFound);
    }

    let kind = parts[parts.len() - 2];
    let value = parts[parts.len() - 1];
    match kind {
        "blobs" if is_digest(value) => Ok(Route::Blob {
            repository,
            digest: value.to_string(),
        }),
        "manifests" if is_digest(value) => Ok(Route::Manifest {
            repository,
            reference: ManifestRef::Digest(value.to_string()),
        }),
        "manifests" if is_tag(value) => Ok(Route::Manifest {
            repository,
            reference: ManifestRef::Tag(value.to_string()),
        }),
        _ => Err(RouteError::NotFound),
    }
}

/// Slash-separated components, each starting with an alphanumeric.
fn is_repository(repository: &str) -> bool {
    !repository.is_empty()
        && repository.split('/').all(|component| {
            let mut chars = component.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
                && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        })
}

fn is_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    tag.len() <= MAX_TAG_LEN
        && matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

//! Disk-based cache of materialized images.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/
//! ├── manifests/<repository>/_tags/<tag>   (manifest by tag)
//! ├── blobs/<algorithm>/<encoded>          (blobs and manifests by digest)
//! └── tmp/                                 (in-progress writes)
//! ```
//!
//! Repository components always start with an alphanumeric character, so
//! the `_tags` directory can never collide with a nested repository name.
//! Files are written to `tmp/` first and renamed into place, so readers
//! never observe a partially written manifest or blob.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jitreg_core::error::{GatewayError, Result};
use jitreg_core::{is_digest, Mutation};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest};
use oci_distribution::Reference;

use crate::mutate::{mutate_config, mutate_manifest, sha256_digest};
use crate::registry::{RegistryAuth, RegistryPuller, Upstream};

/// Materializes images and locates their cached files.
///
/// `build` is only ever called by one task at a time per reference.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Materialize `reference` (`repository:tag`) by applying `mutation`.
    async fn build(&self, reference: &str, mutation: &Mutation) -> Result<()>;

    /// Where the manifest for `repository:tag` lives once built.
    fn manifest_path(&self, repository: &str, tag: &str) -> PathBuf;

    /// Where the content-addressed blob `digest` lives.
    fn blob_path(&self, digest: &str) -> PathBuf;
}

/// Image store that derives images from upstream base images.
pub struct DiskImageStore {
    root: PathBuf,
    upstream: Arc<dyn Upstream>,
    temp_seq: AtomicU64,
}

impl DiskImageStore {
    /// Create a store rooted at `root` that pulls from public registries.
    pub fn new(root: &Path, auth: RegistryAuth) -> Result<Self> {
        Self::with_upstream(root, Arc::new(RegistryPuller::with_auth(auth)))
    }

    /// Create a store rooted at `root`, creating its directories.
    pub fn with_upstream(root: &Path, upstream: Arc<dyn Upstream>) -> Result<Self> {
        for dir in ["manifests", "blobs", "tmp"] {
            let path = root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| {
                GatewayError::ConfigError(format!(
                    "Failed to create cache directory {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            upstream,
            temp_seq: AtomicU64::new(0),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn temp_path(&self) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("tmp")
            .join(format!("{}-{}.partial", std::process::id(), seq))
    }

    /// Atomically place `data` at `target`.
    async fn write_file(&self, target: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.temp_path();
        let result = match tokio::fs::write(&tmp, data).await {
            Ok(()) => tokio::fs::rename(&tmp, target).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        Ok(result?)
    }

    async fn write_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let target = self.blob_path(digest);
        if tokio::fs::metadata(&target).await.is_ok() {
            return Ok(());
        }
        self.write_file(&target, data).await
    }

    async fn materialize(
        &self,
        repository: &str,
        tag: &str,
        mutation: &Mutation,
    ) -> Result<String> {
        let base = RegistryPuller::parse_reference(&mutation.base_image)?;
        let manifest = self.upstream.pull_manifest(&base).await?;
        for descriptor in std::iter::once(&manifest.config).chain(&manifest.layers) {
            check_descriptor(&base, descriptor)?;
        }

        for layer in &manifest.layers {
            self.fetch_layer(&base, layer).await?;
        }
        let config = self.upstream.pull_blob(&base, &manifest.config).await?;

        self.place(repository, tag, &manifest, &config, mutation)
            .await
    }

    /// Stream a layer into the blob store unless it is already there.
    async fn fetch_layer(&self, base: &Reference, layer: &OciDescriptor) -> Result<()> {
        let target = self.blob_path(&layer.digest);
        if tokio::fs::metadata(&target).await.is_ok() {
            tracing::debug!(digest = %layer.digest, "Layer already cached");
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
        let tmp = self.temp_path();
        let result = match self.upstream.pull_blob_to_file(base, layer, &tmp).await {
            Ok(()) => tokio::fs::rename(&tmp, &target).await.map_err(GatewayError::from),
            Err(e) => Err(e),
        };
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        result
    }

    /// Write the mutated config and manifest for a pulled base image.
    ///
    /// The manifest lands both under its digest and under `repository:tag`;
    /// the tag file is written last. Returns the manifest digest.
    async fn place(
        &self,
        repository: &str,
        tag: &str,
        manifest: &OciImageManifest,
        config: &[u8],
        mutation: &Mutation,
    ) -> Result<String> {
        let config = mutate_config(config, mutation)?;
        let config_digest = sha256_digest(&config);
        self.write_blob(&config_digest, &config).await?;

        let mut document = serde_json::to_value(manifest)?;
        mutate_manifest(&mut document, &config_digest, config.len(), mutation)?;
        let bytes = serde_json::to_vec_pretty(&document)?;
        let digest = sha256_digest(&bytes);

        self.write_blob(&digest, &bytes).await?;
        self.write_file(&self.manifest_path(repository, tag), &bytes)
            .await?;

        Ok(digest)
    }
}

/// Upstream digests become file names, so they must be well formed.
fn check_descriptor(base: &Reference, descriptor: &OciDescriptor) -> Result<()> {
    if is_digest(&descriptor.digest) {
        return Ok(());
    }
    Err(GatewayError::RegistryError {
        registry: base.registry().to_string(),
        message: format!("{} returned invalid digest '{}'", base, descriptor.digest),
    })
}

#[async_trait]
impl ImageStore for DiskImageStore {
    async fn build(&self, reference: &str, mutation: &Mutation) -> Result<()> {
        let (repository, tag) = reference.rsplit_once(':').ok_or_else(|| {
            GatewayError::BuildError {
                reference: reference.to_string(),
                message: "reference has no tag".to_string(),
            }
        })?;

        tracing::info!(
            reference = %reference,
            base = %mutation.base_image,
            "Materializing image"
        );

        let digest = self
            .materialize(repository, tag, mutation)
            .await
            .map_err(|e| GatewayError::BuildError {
                reference: reference.to_string(),
                message: e.to_string(),
            })?;

        tracing::info!(reference = %reference, digest = %digest, "Image materialized");
        Ok(())
    }

    fn manifest_path(&self, repository: &str, tag: &str) -> PathBuf {
        let mut path = self.root.join("manifests");
        for component in repository.split('/') {
            path.push(component);
        }
        path.join("_tags").join(tag)
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        let blobs = self.root.join("blobs");
        match digest.split_once(':') {
            Some((algorithm, encoded)) => blobs.join(algorithm).join(encoded),
            None => blobs.join(digest),
        }
    }
}

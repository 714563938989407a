//! Upstream registry access for base images.

use std::path::Path;

use async_trait::async_trait;
use jitreg_core::error::{GatewayError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use tokio::io::AsyncWriteExt;

/// Credentials presented to upstream registries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RegistryAuth {
    #[default]
    Anonymous,
    Basic { username: String, password: String },
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::Anonymous
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `REGISTRY_USERNAME` + `REGISTRY_PASSWORD`, or anonymous unless both are set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME"),
            std::env::var("REGISTRY_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) => Self::basic(username, password),
            _ => Self::Anonymous,
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match self {
            Self::Anonymous => OciRegistryAuth::Anonymous,
            Self::Basic { username, password } => {
                OciRegistryAuth::Basic(username.clone(), password.clone())
            }
        }
    }
}

/// Where base image content comes from.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Image manifest of `image`, resolved to a single platform.
    async fn pull_manifest(&self, image: &Reference) -> Result<OciImageManifest>;

    /// A small blob, read into memory.
    async fn pull_blob(&self, image: &Reference, descriptor: &OciDescriptor) -> Result<Vec<u8>>;

    /// A blob streamed into `target`.
    async fn pull_blob_to_file(
        &self,
        image: &Reference,
        descriptor: &OciDescriptor,
        target: &Path,
    ) -> Result<()>;
}

/// [`Upstream`] over the OCI Distribution API.
pub struct RegistryPuller {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryPuller {
    pub fn with_auth(auth: RegistryAuth) -> Self {
        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(host_platform_resolver)),
            ..Default::default()
        });
        Self { client, auth }
    }

    /// Parse an image string such as `docker.io/library/nginx:1.25`.
    pub fn parse_reference(image: &str) -> Result<Reference> {
        image
            .parse::<Reference>()
            .map_err(|e| GatewayError::RegistryError {
                registry: image.to_string(),
                message: format!("Invalid image reference: {}", e),
            })
    }

    fn blob_error(
        image: &Reference,
        descriptor: &OciDescriptor,
        e: impl std::fmt::Display,
    ) -> GatewayError {
        GatewayError::RegistryError {
            registry: image.registry().to_string(),
            message: format!("Failed to pull blob {}: {}", descriptor.digest, e),
        }
    }
}

#[async_trait]
impl Upstream for RegistryPuller {
    async fn pull_manifest(&self, image: &Reference) -> Result<OciImageManifest> {
        let (manifest, digest) = self
            .client
            .pull_image_manifest(image, &self.auth.to_oci_auth())
            .await
            .map_err(|e| GatewayError::RegistryError {
                registry: image.registry().to_string(),
                message: format!("Failed to pull manifest for {}: {}", image, e),
            })?;

        tracing::debug!(image = %image, digest = %digest, "Pulled base manifest");
        Ok(manifest)
    }

    async fn pull_blob(&self, image: &Reference, descriptor: &OciDescriptor) -> Result<Vec<u8>> {
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(image, descriptor, &mut data)
            .await
            .map_err(|e| Self::blob_error(image, descriptor, e))?;
        Ok(data)
    }

    async fn pull_blob_to_file(
        &self,
        image: &Reference,
        descriptor: &OciDescriptor,
        target: &Path,
    ) -> Result<()> {
        let mut file = tokio::fs::File::create(target).await?;
        self.client
            .pull_blob(image, descriptor, &mut file)
            .await
            .map_err(|e| Self::blob_error(image, descriptor, e))?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// GOARCH spelling of a Rust target architecture.
fn go_arch(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}

/// Index entry for linux on the host architecture.
fn host_platform_resolver(entries: &[ImageIndexEntry]) -> Option<String> {
    let arch = go_arch(std::env::consts::ARCH);
    entries
        .iter()
        .find(|entry| {
            matches!(&entry.platform, Some(p) if p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

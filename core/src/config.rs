use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{GatewayError, Result};

/// API version accepted for control-plane `Image` objects
pub const IMAGE_API_VERSION: &str = "jitreg.io/v1alpha1";

/// Kind accepted for control-plane `Image` objects
pub const IMAGE_KIND: &str = "Image";

/// Gateway configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Statically configured image rules
    #[serde(default)]
    pub images: Vec<ImageSpec>,
}

impl GatewayConfig {
    /// Parse a configuration document
    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Load a configuration file from disk
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml(&data).map_err(|e| {
            GatewayError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }
}

/// A match-mutate rule as it appears in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSpec {
    /// Pattern matched against `repository:tag`
    #[serde(rename = "match")]
    pub pattern: String,

    /// Upstream image the result is derived from; may use `{capture}`s
    pub base_image: String,

    /// Labels set on the image config
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations set on the manifest
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// `KEY=VALUE` entries set in the image config environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

/// Object metadata of a control-plane resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
}

/// An `Image` object published by the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResource {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: ImageSpec,
}

impl ImageResource {
    /// Wrap a spec into a named resource
    pub fn new(name: impl Into<String>, spec: ImageSpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta { name: name.into() },
            spec,
        }
    }

    /// Parse a resource document, rejecting foreign kinds
    pub fn from_yaml(data: &str) -> Result<Self> {
        let resource: Self = serde_yaml::from_str(data)?;
        if resource.kind != IMAGE_KIND {
            return Err(GatewayError::ConfigError(format!(
                "unexpected kind '{}', expected '{}'",
                resource.kind, IMAGE_KIND
            )));
        }
        Ok(resource)
    }
}

fn default_api_version() -> String {
    IMAGE_API_VERSION.to_string()
}

fn default_kind() -> String {
    IMAGE_KIND.to_string()
}

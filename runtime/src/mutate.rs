//! Applying a [`Mutation`] to an image's config and manifest documents.
//!
//! Both documents are edited as untyped JSON so fields this crate does not
//! model survive the rewrite unchanged.

use jitreg_core::error::{GatewayError, Result};
use jitreg_core::Mutation;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Media type written when the base manifest does not declare one.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Apply labels and environment to an image config blob.
pub fn mutate_config(config: &[u8], mutation: &Mutation) -> Result<Vec<u8>> {
    let mut doc: Value = serde_json::from_slice(config)?;
    let root = doc.as_object_mut().ok_or_else(|| {
        GatewayError::SerializationError("image config is not a JSON object".to_string())
    })?;
    let exec = object_entry(root, "config")?;

    if !mutation.labels.is_empty() {
        let labels = object_entry(exec, "Labels")?;
        for (key, value) in &mutation.labels {
            labels.insert(key.clone(), Value::String(value.clone()));
        }
    }

    if !mutation.env.is_empty() {
        let env = exec.entry("Env").or_insert(Value::Null);
        if env.is_null() {
            *env = Value::Array(Vec::new());
        }
        let env = env.as_array_mut().ok_or_else(|| {
            GatewayError::SerializationError("config.Env is not an array".to_string())
        })?;
        for entry in &mutation.env {
            let key = entry.split('=').next().unwrap_or(entry);
            let prefix = format!("{}=", key);
            env.retain(|existing| !existing.as_str().map_or(false, |s| s.starts_with(&prefix)));
            env.push(Value::String(entry.clone()));
        }
    }

    Ok(serde_json::to_vec(&doc)?)
}

/// Point a manifest at the rewritten config and apply annotations.
pub fn mutate_manifest(
    manifest: &mut Value,
    config_digest: &str,
    config_size: usize,
    mutation: &Mutation,
) -> Result<()> {
    let root = manifest.as_object_mut().ok_or_else(|| {
        GatewayError::SerializationError("manifest is not a JSON object".to_string())
    })?;

    let config = object_entry(root, "config")?;
    config.insert("digest".to_string(), Value::String(config_digest.to_string()));
    config.insert("size".to_string(), Value::from(config_size as u64));

    if !mutation.annotations.is_empty() {
        let annotations = object_entry(root, "annotations")?;
        for (key, value) in &mutation.annotations {
            annotations.insert(key.clone(), Value::String(value.clone()));
        }
    }

    let declared = root
        .get("mediaType")
        .and_then(Value::as_str)
        .map_or(false, |s| !s.is_empty());
    if !declared {
        root.insert(
            "mediaType".to_string(),
            Value::String(OCI_MANIFEST_MEDIA_TYPE.to_string()),
        );
    }

    Ok(())
}

/// Get `map[key]` as an object, creating it when missing or null.
fn object_entry<'a>(
    map: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Map<String, Value>> {
    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if slot.is_null() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut().ok_or_else(|| {
        GatewayError::SerializationError(format!("'{}' is not a JSON object", key))
    })
}

//! The OCI image-layout document model.
//!
//! These structs define the on-disk JSON contract (`oci-layout`,
//! `index.json`, manifest bodies) that external tools read directly, so the
//! field names and optionality here are part of the wire format.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Media type of an OCI image manifest.
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Annotation key carrying the human-readable tag of a manifest.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// File name of the layout marker inside a repository.
pub const IMAGE_LAYOUT_FILE: &str = "oci-layout";

/// The only layout version this store reads or writes.
pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

/// `schemaVersion` required in `index.json` and manifest bodies.
pub const SCHEMA_VERSION: u32 = 2;

/// Contents of the `oci-layout` marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageLayout {
    #[serde(rename = "imageLayoutVersion")]
    pub version: String,
}

impl ImageLayout {
    pub fn current() -> Self {
        Self {
            version: IMAGE_LAYOUT_VERSION.to_string(),
        }
    }
}

/// Contents of a repository's `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            manifests: Vec::new(),
        }
    }
}

/// A reference to one object by media type, size and digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// The `ref.name` annotation, if present.
    pub fn tag(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_REF_NAME))
            .map(String::as_str)
    }
}

/// Target platform of a manifest descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Platform {
    /// The constant default written on new descriptors (kept for
    /// bit-compatibility with existing repositories).
    pub fn linux_amd64() -> Self {
        Self {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
        }
    }
}

/// An image manifest body: config plus ordered layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

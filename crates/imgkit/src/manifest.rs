//! Registry manifest model.
//!
//! A partial implementation of the Docker manifest v2 schema 2 / OCI image
//! manifest document: just the fields this library produces and consumes,
//! serialized deterministically so that identical images yield identical
//! manifest bytes (and therefore identical manifest digests).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::layer::sha256_digest;

/// Media type of the manifest document itself.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// OCI equivalent of [`MANIFEST_MEDIA_TYPE`]; accepted when resolving.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of the config blob.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// Media type of a gzip-compressed layer blob.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Annotation key naming the tag an image was published under.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// A content-addressed link to a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub size: u64,
    pub digest: String,
}

/// An image manifest: the config blob plus the ordered compressed layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Manifest {
    /// Serialize and return `(bytes, digest)`. The digest of these bytes is
    /// the image's registry identifier.
    pub fn to_bytes(&self) -> crate::error::Result<(Vec<u8>, String)> {
        let bytes = serde_json::to_vec(self)?;
        let digest = sha256_digest(&bytes);
        Ok((bytes, digest))
    }
}

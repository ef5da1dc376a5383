//! Registry backend: publish images to an OCI registry.
//!
//! The HTTP transport is an external collaborator reached through the
//! [`RegistryClient`] trait (blob and manifest CRUD); credentials come from
//! an injected [`Keychain`]. This module owns the push protocol on top of
//! them:
//!
//! 1. for each layer, skip the upload when the destination already has the
//!    blob (HEAD), else try a cross-repo mount when the source repository
//!    lives on the same registry, else upload the gzip blob
//! 2. PUT the normalized config blob
//! 3. PUT the manifest under each name, accumulating per-name failures
//!
//! The manifest is published only after every referenced blob is durably
//! stored. The identifier is the manifest digest, so two bit-identical
//! manifests always share an identifier.

use std::io::Read;

use flate2::read::GzDecoder;

use crate::backend::{Backend, Platform, ResolvedImage, ResolvedLayer, SaveRequest};
use crate::config::ConfigFile;
use crate::error::{ImageError, Result, SaveError, TagFailure};
use crate::layer::{Provenance, sha256_digest};
use crate::manifest::{
    CONFIG_MEDIA_TYPE, Descriptor, LAYER_MEDIA_TYPE, MANIFEST_MEDIA_TYPE, Manifest,
};
use crate::reference::ImageReference;
use crate::store::LayerStore;

/// Resolved credentials for one registry host.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    authorization: Option<String>,
}

impl Authenticator {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn with_authorization(header: &str) -> Self {
        Self {
            authorization: Some(header.to_string()),
        }
    }

    /// Basic authentication with a username and password.
    pub fn basic(username: &str, password: &str) -> Self {
        use base64::Engine;
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        Self {
            authorization: Some(format!("Basic {}", credentials)),
        }
    }

    /// The HTTP `Authorization` header value, if any.
    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }
}

/// External contract for credential resolution.
pub trait Keychain {
    fn resolve(&self, registry: &str) -> Result<Authenticator>;
}

/// External contract for registry blob/manifest CRUD over HTTPS.
pub trait RegistryClient {
    fn head_blob(
        &self,
        auth: &Authenticator,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<bool>;

    /// Attempt a cross-repo blob mount; returns whether the registry
    /// honored it.
    fn mount_blob(
        &self,
        auth: &Authenticator,
        registry: &str,
        repository: &str,
        from_repository: &str,
        digest: &str,
    ) -> Result<bool>;

    fn put_blob(
        &self,
        auth: &Authenticator,
        registry: &str,
        repository: &str,
        digest: &str,
        content: &mut dyn Read,
    ) -> Result<()>;

    /// `Ok(None)` when the blob does not exist.
    fn get_blob(
        &self,
        auth: &Authenticator,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<Option<Box<dyn Read>>>;

    /// `Ok(None)` when no manifest exists under `reference` (a tag or
    /// digest). On success returns the raw bytes and their digest.
    fn get_manifest(
        &self,
        auth: &Authenticator,
        registry: &str,
        repository: &str,
        reference: &str,
    ) -> Result<Option<(Vec<u8>, String)>>;

    #[allow(clippy::too_many_arguments)]
    fn put_manifest(
        &self,
        auth: &Authenticator,
        registry: &str,
        repository: &str,
        reference: &str,
        media_type: &str,
        payload: &[u8],
    ) -> Result<()>;

    /// Returns whether anything was deleted.
    fn delete_manifest(
        &self,
        auth: &Authenticator,
        registry: &str,
        repository: &str,
        reference: &str,
    ) -> Result<bool>;
}

/// How one layer blob reaches the destination repository.
struct BlobPlan {
    diff_id: String,
    digest: String,
    size: u64,
    /// Repository the blob can be mounted or fetched from, when the layer
    /// was not appended locally.
    source: Option<ImageReference>,
    reused: bool,
}

/// Backend committing images through a [`RegistryClient`].
pub struct RegistryBackend<C: RegistryClient, K: Keychain> {
    client: C,
    keychain: K,
    store: LayerStore,
}

impl<C: RegistryClient, K: Keychain> RegistryBackend<C, K> {
    pub fn new(client: C, keychain: K) -> Result<Self> {
        Ok(Self {
            client,
            keychain,
            store: LayerStore::temp()?,
        })
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Work out digest, size, and transfer source for every layer. Added
    /// layers are hashed into the layer store here; inherited and reused
    /// layers already know their digests from resolution, or are looked up
    /// in their source image by name.
    fn plan_blobs(&self, request: &SaveRequest<'_>) -> Result<Vec<BlobPlan>> {
        let mut plans = Vec::with_capacity(request.layers.len());
        for layer in request.layers {
            let plan = match &layer.provenance {
                Provenance::Added { path } => {
                    let hashes = self.store.put(path)?;
                    BlobPlan {
                        diff_id: hashes.diff_id,
                        digest: hashes.digest,
                        size: hashes.compressed_size,
                        source: None,
                        reused: false,
                    }
                }
                Provenance::Base { source } | Provenance::Reused { source } => {
                    let reused = matches!(layer.provenance, Provenance::Reused { .. });
                    let (digest, size) = match (&layer.digest, layer.size) {
                        (Some(digest), Some(size)) => (digest.clone(), size),
                        _ => self.lookup_layer(source, &layer.diff_id, reused)?,
                    };
                    BlobPlan {
                        diff_id: layer.diff_id.clone(),
                        digest,
                        size,
                        source: Some(source.clone()),
                        reused,
                    }
                }
            };
            plans.push(plan);
        }
        Ok(plans)
    }

    /// Find a layer's digest and size in its source image, by name at save
    /// time.
    fn lookup_layer(
        &self,
        source: &ImageReference,
        diff_id: &str,
        reused: bool,
    ) -> Result<(String, u64)> {
        let missing = || {
            if reused {
                ImageError::ReuseMissingLayer(diff_id.to_string())
            } else {
                ImageError::Transport(format!(
                    "layer {} not found in image {}",
                    diff_id, source
                ))
            }
        };

        let resolved = self.resolve(source)?.ok_or_else(missing)?;
        let layer = resolved
            .layers
            .into_iter()
            .find(|layer| layer.diff_id == diff_id)
            .ok_or_else(missing)?;

        match (layer.digest, layer.size) {
            (Some(digest), Some(size)) => Ok((digest, size)),
            _ => Err(missing()),
        }
    }

    /// Make every blob referenced by the manifest durable in the target
    /// repository, then PUT the manifest.
    fn push_to(
        &self,
        target: &ImageReference,
        plans: &[BlobPlan],
        config_bytes: &[u8],
        config_digest: &str,
        manifest_bytes: &[u8],
    ) -> Result<()> {
        let auth = self.keychain.resolve(target.registry())?;

        for plan in plans {
            if self
                .client
                .head_blob(&auth, target.registry(), target.repository(), &plan.digest)?
            {
                continue;
            }

            if let Some(source) = &plan.source {
                if source.registry() == target.registry()
                    && source.repository() != target.repository()
                    && self.client.mount_blob(
                        &auth,
                        target.registry(),
                        target.repository(),
                        source.repository(),
                        &plan.digest,
                    )?
                {
                    tracing::debug!(digest = %plan.digest, from = %source, "mounted blob cross-repo");
                    continue;
                }
            }

            let mut content: Box<dyn Read> = match &plan.source {
                None => Box::new(self.store.open_blob(&plan.digest)?),
                Some(source) => {
                    let source_auth = self.keychain.resolve(source.registry())?;
                    match self.client.get_blob(
                        &source_auth,
                        source.registry(),
                        source.repository(),
                        &plan.digest,
                    )? {
                        Some(reader) => reader,
                        None if plan.reused => {
                            return Err(ImageError::ReuseMissingLayer(plan.diff_id.clone()));
                        }
                        None => {
                            return Err(ImageError::Transport(format!(
                                "blob {} not found in {}",
                                plan.digest, source
                            )));
                        }
                    }
                }
            };
            tracing::debug!(digest = %plan.digest, repository = %target.repository(), "uploading blob");
            self.client.put_blob(
                &auth,
                target.registry(),
                target.repository(),
                &plan.digest,
                &mut content,
            )?;
        }

        if !self
            .client
            .head_blob(&auth, target.registry(), target.repository(), config_digest)?
        {
            self.client.put_blob(
                &auth,
                target.registry(),
                target.repository(),
                config_digest,
                &mut &config_bytes[..],
            )?;
        }

        self.client.put_manifest(
            &auth,
            target.registry(),
            target.repository(),
            target.identifier(),
            MANIFEST_MEDIA_TYPE,
            manifest_bytes,
        )
    }
}

impl<C: RegistryClient, K: Keychain> Backend for RegistryBackend<C, K> {
    fn default_platform(&self) -> Result<Platform> {
        Ok(Platform {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            os_version: None,
        })
    }

    fn resolve(&self, reference: &ImageReference) -> Result<Option<ResolvedImage>> {
        let auth = self.keychain.resolve(reference.registry())?;
        let Some((manifest_bytes, manifest_digest)) = self.client.get_manifest(
            &auth,
            reference.registry(),
            reference.repository(),
            reference.identifier(),
        )?
        else {
            return Ok(None);
        };

        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;

        let mut config_reader = self
            .client
            .get_blob(
                &auth,
                reference.registry(),
                reference.repository(),
                &manifest.config.digest,
            )?
            .ok_or_else(|| {
                ImageError::Transport(format!(
                    "config blob {} missing for image {}",
                    manifest.config.digest, reference
                ))
            })?;
        let mut config_bytes = Vec::new();
        config_reader.read_to_end(&mut config_bytes)?;
        let config: ConfigFile = serde_json::from_slice(&config_bytes)?;

        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(ImageError::Transport(format!(
                "image {} has {} diff IDs but {} manifest layers",
                reference,
                config.rootfs.diff_ids.len(),
                manifest.layers.len()
            )));
        }

        let layers = config
            .rootfs
            .diff_ids
            .iter()
            .zip(&manifest.layers)
            .map(|(diff_id, descriptor)| ResolvedLayer {
                diff_id: diff_id.clone(),
                digest: Some(descriptor.digest.clone()),
                size: Some(descriptor.size),
            })
            .collect();

        Ok(Some(ResolvedImage {
            identifier: manifest_digest,
            config,
            layers,
        }))
    }

    fn save(&self, request: &SaveRequest<'_>, names: &[String]) -> Result<String> {
        let plans = self.plan_blobs(request)?;
        let diff_ids: Vec<String> = plans.iter().map(|p| p.diff_id.clone()).collect();

        let config_bytes = serde_json::to_vec(&request.config.normalized(&diff_ids))?;
        let config_digest = sha256_digest(&config_bytes);

        let manifest = Manifest {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config: Descriptor {
                media_type: CONFIG_MEDIA_TYPE.to_string(),
                size: config_bytes.len() as u64,
                digest: config_digest.clone(),
            },
            layers: plans
                .iter()
                .map(|plan| Descriptor {
                    media_type: LAYER_MEDIA_TYPE.to_string(),
                    size: plan.size,
                    digest: plan.digest.clone(),
                })
                .collect(),
            annotations: if request.annotations.is_empty() {
                None
            } else {
                Some(request.annotations.clone())
            },
        };
        let (manifest_bytes, identifier) = manifest.to_bytes()?;

        let mut failures = Vec::new();
        for name in names {
            let outcome = ImageReference::parse(name).and_then(|target| {
                self.push_to(&target, &plans, &config_bytes, &config_digest, &manifest_bytes)
            });
            if let Err(cause) = outcome {
                failures.push(TagFailure {
                    image_name: name.clone(),
                    cause: Box::new(cause),
                });
            }
        }

        if !failures.is_empty() {
            return Err(SaveError { errors: failures }.into());
        }
        Ok(identifier)
    }

    fn delete(&self, reference: &ImageReference, _identifier: Option<&str>) -> Result<()> {
        let auth = self.keychain.resolve(reference.registry())?;
        self.client.delete_manifest(
            &auth,
            reference.registry(),
            reference.repository(),
            reference.identifier(),
        )?;
        Ok(())
    }

    fn open_layer(&self, reference: &ImageReference, diff_id: &str) -> Result<Box<dyn Read>> {
        let Some(resolved) = self.resolve(reference)? else {
            return Err(ImageError::ImageNotFound(reference.as_str().to_string()));
        };

        let layer = resolved
            .layers
            .iter()
            .find(|layer| layer.diff_id == diff_id)
            .ok_or_else(|| ImageError::LayerNotFound {
                name: reference.as_str().to_string(),
                diff_id: diff_id.to_string(),
            })?;

        let digest = layer.digest.clone().ok_or_else(|| {
            ImageError::BlobNotFound(diff_id.to_string())
        })?;

        let auth = self.keychain.resolve(reference.registry())?;
        let blob = self
            .client
            .get_blob(&auth, reference.registry(), reference.repository(), &digest)?
            .ok_or(ImageError::BlobNotFound(digest))?;

        Ok(Box::new(GzDecoder::new(blob)))
    }
}

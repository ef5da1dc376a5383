//! The image handle: mutation tracking, rebase, and save orchestration.
//!
//! An [`Image`] reconciles a base-image snapshot with pending mutations. The
//! constructor captures the base config and layer list; mutations edit the
//! in-memory config or append layer descriptors; [`save`](Image::save) hands
//! the reconciled state to the backend, which normalizes and commits it.
//!
//! Handles are single-writer values. Methods that touch the backend
//! (construction with a base, `save`, `delete`, `get_layer`, `reuse_layer`,
//! `found`) may block on I/O; everything else is pure in-memory.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::backend::{Backend, SaveRequest};
use crate::config::{ConfigFile, normalized_date_time};
use crate::error::{ImageError, Result};
use crate::layer::{LayerEntry, Provenance, diff_id_of};
use crate::manifest::REF_NAME_ANNOTATION;
use crate::reference::ImageReference;

/// Constructor options for [`Image::new`].
#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    /// Populate the initial config and layer list from this image. A
    /// missing base is not an error; construction starts empty.
    pub base_image: Option<String>,
    /// Record a previous image to enable [`Image::reuse_layer`].
    pub previous_image: Option<String>,
}

/// A mutable handle over an image in a backend.
pub struct Image<B: Backend> {
    backend: B,
    name: ImageReference,
    base: Option<ImageReference>,
    previous: Option<ImageReference>,
    config: ConfigFile,
    layers: Vec<LayerEntry>,
    /// Index separating inherited layers from appended ones; frozen at
    /// construction, rewritten only by rebase.
    base_layer_count: usize,
    annotations: BTreeMap<String, String>,
    resolved_id: Option<String>,
}

impl<B: Backend> Image<B> {
    /// Create an image handle named `name` over `backend`.
    ///
    /// With `base_image` set and resolvable, the handle starts from the
    /// base's config and layers; otherwise it starts empty with the
    /// backend's platform defaults.
    pub fn new(name: &str, backend: B, options: ImageOptions) -> Result<Self> {
        let name = ImageReference::parse(name)?;

        let platform = backend.default_platform()?;
        let mut config = ConfigFile::with_platform(
            &platform.os,
            &platform.architecture,
            platform.os_version.as_deref(),
        );
        let mut layers = Vec::new();
        let mut resolved_id = None;

        let base = match &options.base_image {
            Some(base_name) => {
                let base_ref = ImageReference::parse(base_name)?;
                if let Some(resolved) = backend.resolve(&base_ref)? {
                    config = resolved.config;
                    layers = resolved
                        .layers
                        .into_iter()
                        .map(|layer| LayerEntry {
                            diff_id: layer.diff_id,
                            digest: layer.digest,
                            size: layer.size,
                            provenance: Provenance::Base {
                                source: base_ref.clone(),
                            },
                        })
                        .collect();
                    resolved_id = Some(resolved.identifier);
                }
                Some(base_ref)
            }
            None => None,
        };

        let previous = match &options.previous_image {
            Some(previous_name) => Some(ImageReference::parse(previous_name)?),
            None => None,
        };

        let base_layer_count = layers.len();
        Ok(Self {
            backend,
            name,
            base,
            previous,
            config,
            layers,
            base_layer_count,
            annotations: BTreeMap::new(),
            resolved_id,
        })
    }

    /// The name this handle was created with, verbatim.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn reference(&self) -> &ImageReference {
        &self.name
    }

    /// The base image this handle was populated from (or rebased onto).
    pub fn base_reference(&self) -> Option<&ImageReference> {
        self.base.as_ref()
    }

    /// Whether the image (or the base it was loaded from) exists in the
    /// backend.
    pub fn found(&self) -> bool {
        if self.resolved_id.is_some() {
            return true;
        }
        matches!(self.backend.resolve(&self.name), Ok(Some(_)))
    }

    /// The backend identifier: the daemon image ID or the registry manifest
    /// digest of the last save (or of the resolved base when nothing has
    /// been saved yet).
    pub fn identifier(&self) -> Result<String> {
        if let Some(id) = &self.resolved_id {
            return Ok(id.clone());
        }
        match self.backend.resolve(&self.name)? {
            Some(resolved) => Ok(resolved.identifier),
            None => Err(ImageError::ImageNotFound(self.name.as_str().to_string())),
        }
    }

    /// The config's `created` timestamp; the normalized constant after any
    /// reproducible save.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.config.created.unwrap_or_else(normalized_date_time)
    }

    pub fn os(&self) -> &str {
        &self.config.os
    }

    pub fn os_version(&self) -> Option<&str> {
        self.config.os_version.as_deref()
    }

    pub fn architecture(&self) -> &str {
        &self.config.architecture
    }

    /// Label value, or the empty string when absent.
    pub fn label(&self, key: &str) -> String {
        self.config.label(key).unwrap_or_default().to_string()
    }

    /// Environment variable value, or the empty string when absent.
    pub fn env(&self, key: &str) -> String {
        self.config.env(key).unwrap_or_default().to_string()
    }

    pub fn entrypoint(&self) -> Vec<String> {
        self.config.config.entrypoint.clone().unwrap_or_default()
    }

    pub fn working_dir(&self) -> String {
        self.config.config.working_dir.clone().unwrap_or_default()
    }

    /// Read access to the in-memory config.
    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.config.set_label(key, value);
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.config.set_env(key, value);
    }

    pub fn set_entrypoint(&mut self, parts: &[&str]) {
        self.config.set_entrypoint(parts);
    }

    pub fn set_cmd(&mut self, parts: &[&str]) {
        self.config.set_cmd(parts);
    }

    pub fn set_working_dir(&mut self, dir: &str) {
        self.config.set_working_dir(dir);
    }

    /// Record the tag this image will be referenced by, under the
    /// `org.opencontainers.image.ref.name` annotation.
    pub fn annotate_ref_name(&mut self, tag: &str) {
        self.annotations
            .insert(REF_NAME_ANNOTATION.to_string(), tag.to_string());
    }

    pub fn annotate_ref_name_value(&self) -> Option<&str> {
        self.annotations.get(REF_NAME_ANNOTATION).map(String::as_str)
    }

    /// Append a layer from an uncompressed tar on disk. The file is
    /// borrowed until the next save completes.
    pub fn add_layer(&mut self, path: &Path) -> Result<()> {
        let diff_id = diff_id_of(path)?;
        self.add_layer_with_diff_id(path, &diff_id);
        Ok(())
    }

    /// Append a layer the caller has already hashed.
    pub fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) {
        self.layers.push(LayerEntry {
            diff_id: diff_id.to_string(),
            digest: None,
            size: None,
            provenance: Provenance::Added {
                path: path.to_path_buf(),
            },
        });
    }

    /// Adopt a layer from the previous image by diff ID. The bytes stay in
    /// the backend; save resolves them by name without re-downloading when
    /// the previous image is still present.
    pub fn reuse_layer(&mut self, diff_id: &str) -> Result<()> {
        let previous = self
            .previous
            .clone()
            .ok_or_else(|| ImageError::ReuseMissingLayer(diff_id.to_string()))?;

        let resolved = self
            .backend
            .resolve(&previous)?
            .ok_or_else(|| ImageError::ReuseMissingLayer(diff_id.to_string()))?;

        let layer = resolved
            .layers
            .into_iter()
            .find(|layer| layer.diff_id == diff_id)
            .ok_or_else(|| ImageError::ReuseMissingLayer(diff_id.to_string()))?;

        self.layers.push(LayerEntry {
            diff_id: layer.diff_id,
            digest: layer.digest,
            size: layer.size,
            provenance: Provenance::Reused { source: previous },
        });
        Ok(())
    }

    /// The digest of the last layer in the current list: the distribution
    /// digest when known, the diff ID for daemon-resolved layers.
    pub fn top_layer(&self) -> Result<String> {
        match self.layers.last() {
            Some(layer) => Ok(layer
                .digest
                .clone()
                .unwrap_or_else(|| layer.diff_id.clone())),
            None => Err(ImageError::NoLayers(self.name.as_str().to_string())),
        }
    }

    /// Stream a published layer's uncompressed tar from the backend.
    pub fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read>> {
        self.backend.open_layer(&self.name, diff_id)
    }

    /// Swap the base-layer prefix for `new_base`'s layers, preserving the
    /// application-layer suffix bit-for-bit.
    ///
    /// `old_top_layer` is the digest (or diff ID) of the old base's top
    /// layer within this image's current layer list.
    pub fn rebase(&mut self, old_top_layer: &str, new_base: &Image<B>) -> Result<()> {
        let index = self
            .layers
            .iter()
            .position(|layer| {
                layer.diff_id == old_top_layer || layer.digest.as_deref() == Some(old_top_layer)
            })
            .ok_or_else(|| ImageError::RebaseMissingLayer(old_top_layer.to_string()))?;

        let suffix: Vec<LayerEntry> = self.layers[index + 1..].to_vec();
        let mut layers = new_base.layers.clone();
        let new_base_count = layers.len();
        layers.extend(suffix);

        self.layers = layers;
        self.base_layer_count = new_base_count;
        self.base = Some(new_base.name.clone());

        // Base platform moves with the new base; the application config
        // (env, labels, entrypoint, cmd, working dir) stays. rootfs and
        // history are regenerated by the save-time normalization pass.
        self.config.os = new_base.config.os.clone();
        self.config.os_version = new_base.config.os_version.clone();
        self.config.architecture = new_base.config.architecture.clone();

        tracing::debug!(
            image = %self.name,
            new_base = %new_base.name,
            preserved = self.layers.len() - self.base_layer_count,
            "rebased image"
        );
        Ok(())
    }

    /// Number of layers inherited from the (possibly rebased) base.
    pub fn base_layer_count(&self) -> usize {
        self.base_layer_count
    }

    /// Diff IDs of the current layer list, in order.
    pub fn layer_diff_ids(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.diff_id.clone()).collect()
    }

    /// Commit all pending mutations under this image's name plus
    /// `additional_names`.
    ///
    /// Every prior mutation is visible in the published image and no later
    /// mutation appears. Per-name failures surface as
    /// [`SaveError`](crate::error::SaveError) while the remaining names are
    /// still published.
    pub fn save(&mut self, additional_names: &[&str]) -> Result<()> {
        let mut names = Vec::with_capacity(1 + additional_names.len());
        names.push(self.name.as_str().to_string());
        names.extend(additional_names.iter().map(|s| s.to_string()));

        let request = SaveRequest {
            name: &self.name,
            config: &self.config,
            layers: &self.layers,
            annotations: &self.annotations,
        };

        let identifier = self.backend.save(&request, &names)?;
        tracing::info!(image = %self.name, identifier = %identifier, "saved image");
        self.resolved_id = Some(identifier);
        Ok(())
    }

    /// Remove the image and all tags reachable from its name. Missing
    /// images succeed silently; calling this twice is fine.
    pub fn delete(&mut self) -> Result<()> {
        self.backend
            .delete(&self.name, self.resolved_id.as_deref())?;
        self.resolved_id = None;
        Ok(())
    }

    /// Scan every added layer tar for `path`, returning the tar that
    /// contains it. The error lists the contents of every added layer.
    pub fn find_layer_with_path(&self, path: &str) -> Result<PathBuf> {
        let mut blocks = Vec::new();

        for entry in &self.layers {
            let Provenance::Added { path: layer_path } = &entry.provenance else {
                continue;
            };

            let file = std::fs::File::open(layer_path)?;
            let mut archive = tar::Archive::new(file);
            let mut lines = Vec::new();
            let mut found = false;

            for archived in archive.entries()? {
                let archived = archived?;
                let name = archived.path()?.display().to_string();
                if name == path {
                    found = true;
                }
                let kind = if archived.header().entry_type().is_dir() {
                    "D"
                } else {
                    "F"
                };
                lines.push(format!("  - [{}] {}", kind, name));
            }

            if found {
                return Ok(layer_path.clone());
            }

            let basename = layer_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let body = if lines.is_empty() {
                "  (empty)".to_string()
            } else {
                lines.join("\n")
            };
            blocks.push(format!("{}\n{}\n", basename, body));
        }

        Err(ImageError::LayerFileNotFound {
            path: path.to_string(),
            listing: blocks.join("\n"),
        })
    }

    /// The backend this handle commits through.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

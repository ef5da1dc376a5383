//! Daemon backend: publish images to a local container daemon.
//!
//! The daemon itself is an external collaborator reached through the
//! [`DaemonClient`] trait (inspect, load, tag, remove, history, export).
//! This module owns the save pipeline on top of it: materialize the
//! post-mutation image as a single tar in the daemon load format, stream it
//! into the load endpoint, then tag the resulting image ID under every
//! additional name, accumulating per-name failures.
//!
//! # Load format
//!
//! `manifest.json` at the tar root references the config JSON (named by its
//! digest) and one uncompressed tar per layer (named by diff ID). All entry
//! timestamps are zeroed so the stream itself is reproducible.
//!
//! Base and reused layers are adopted from the daemon through `image_export`
//! (the daemon's save stream) into the layer store the first time they are
//! needed; images whose layers are all appended never export anything.

use std::collections::HashMap;
use std::io::{Read, Seek, Write};

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, Platform, ResolvedImage, ResolvedLayer, SaveRequest};
use crate::config::ConfigFile;
use crate::error::{ImageError, Result, SaveError, TagFailure};
use crate::layer::{Provenance, digest_hex, sha256_digest};
use crate::reference::ImageReference;
use crate::store::LayerStore;
use crate::windows::WindowsLayerWriter;

/// Daemon host details, from the daemon's info endpoint.
#[derive(Debug, Clone)]
pub struct DaemonInfo {
    /// Operating system the daemon builds for (`linux` or `windows`).
    pub os: String,
    pub os_version: Option<String>,
}

/// A published image as inspected from the daemon.
#[derive(Debug, Clone)]
pub struct DaemonImage {
    /// The daemon's image ID (config digest).
    pub id: String,
    pub config: ConfigFile,
}

/// One line of `image_history` output.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Creation time in seconds since the Unix epoch.
    pub created: i64,
    pub created_by: String,
}

/// External contract for a container daemon.
///
/// Errors surface the daemon's own message text: a missing image reads
/// `No such image: <name>`, a rejected tag reads `invalid reference format`,
/// and a failed load carries the daemon response.
pub trait DaemonClient {
    fn info(&self) -> Result<DaemonInfo>;

    /// Inspect an image by name or ID; `Ok(None)` when it does not exist.
    fn image_inspect(&self, name_or_id: &str) -> Result<Option<DaemonImage>>;

    /// Stream a tar in the load format into the daemon; returns the loaded
    /// image ID.
    fn image_load(&self, tar: &mut dyn Read) -> Result<String>;

    fn image_tag(&self, name_or_id: &str, tag: &str) -> Result<()>;

    /// Remove an image (and with `force`, every tag pointing at it).
    /// Returns whether anything was removed.
    fn image_remove(&self, name_or_id: &str, force: bool) -> Result<bool>;

    fn image_history(&self, name_or_id: &str) -> Result<Vec<HistoryEntry>>;

    /// Stream the image out in the daemon save format.
    fn image_export(&self, name_or_id: &str) -> Result<Box<dyn Read>>;
}

/// The `manifest.json` entry of a daemon load/save tar.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LoadManifestEntry {
    pub config: String,
    pub repo_tags: Option<Vec<String>>,
    pub layers: Vec<String>,
}

/// Backend committing images through a [`DaemonClient`].
pub struct DaemonBackend<C: DaemonClient> {
    client: C,
    store: LayerStore,
}

impl<C: DaemonClient> DaemonBackend<C> {
    /// Create a backend with a scratch layer store that lives as long as
    /// the backend.
    pub fn new(client: C) -> Result<Self> {
        Ok(Self {
            client,
            store: LayerStore::temp()?,
        })
    }

    pub fn with_store(client: C, store: LayerStore) -> Self {
        Self { client, store }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Make sure the uncompressed tar for `diff_id` is in the layer store,
    /// adopting every layer of `source` from the daemon's export stream on
    /// a miss.
    fn ensure_layer(&self, source: &ImageReference, diff_id: &str) -> Result<()> {
        if self.store.has(diff_id) {
            return Ok(());
        }

        tracing::debug!(image = %source, diff_id = %diff_id, "exporting layers from daemon");
        let mut export = self.client.image_export(source.as_str())?;
        let mut bytes = Vec::new();
        export.read_to_end(&mut bytes)?;

        let files = collect_tar_files(&bytes)?;
        let manifest_bytes = files.get("manifest.json").ok_or_else(|| {
            ImageError::Transport("daemon export stream has no manifest.json".to_string())
        })?;
        let manifest: Vec<LoadManifestEntry> = serde_json::from_slice(manifest_bytes)?;
        let entry = manifest.first().ok_or_else(|| {
            ImageError::Transport("daemon export stream has an empty manifest".to_string())
        })?;

        for layer_name in &entry.layers {
            let layer_bytes = files.get(layer_name).ok_or_else(|| {
                ImageError::Transport(format!(
                    "daemon export stream is missing layer {}",
                    layer_name
                ))
            })?;
            self.store.put_uncompressed(&mut layer_bytes.as_slice())?;
        }

        if self.store.has(diff_id) {
            Ok(())
        } else {
            Err(ImageError::BlobNotFound(diff_id.to_string()))
        }
    }

    /// Write the load-format tar for `request` into an anonymous temp file
    /// and return it rewound, ready to stream into the daemon.
    fn materialize(
        &self,
        request: &SaveRequest<'_>,
        primary_name: &str,
    ) -> Result<std::fs::File> {
        // Resolve every layer to an uncompressed tar before writing: added
        // layers straight from the caller's files, inherited and reused
        // layers through the store.
        let mut diff_ids: Vec<String> = Vec::new();
        let mut sources: Vec<(String, LayerSource)> = Vec::new();
        for layer in request.layers {
            diff_ids.push(layer.diff_id.clone());
            let source = match &layer.provenance {
                Provenance::Added { path } => LayerSource::File(path.clone()),
                Provenance::Base { source } | Provenance::Reused { source } => {
                    self.ensure_layer(source, &layer.diff_id)?;
                    LayerSource::Store
                }
            };
            sources.push((layer.diff_id.clone(), source));
        }

        // A Windows daemon refuses images with no layers at all; synthesize
        // a single empty layer with the required Files/Hives prefix.
        let mut synthesized: Option<(String, Vec<u8>)> = None;
        if request.config.os == "windows" && sources.is_empty() {
            let writer = WindowsLayerWriter::new(Vec::new());
            let bytes = writer.finish()?;
            let diff_id = sha256_digest(&bytes);
            diff_ids.push(diff_id.clone());
            synthesized = Some((diff_id, bytes));
        }

        let config_bytes = serde_json::to_vec(&request.config.normalized(&diff_ids))?;
        let config_name = format!("{}.json", digest_hex(&sha256_digest(&config_bytes)));

        let mut tarball = tempfile::tempfile()?;
        {
            let mut builder = tar::Builder::new(&mut tarball);

            append_entry(&mut builder, &config_name, &mut &config_bytes[..], config_bytes.len() as u64)?;

            let mut written: Vec<String> = Vec::new();
            let mut layer_names: Vec<String> = Vec::new();
            for (diff_id, source) in &sources {
                let name = format!("{}.tar", digest_hex(diff_id));
                layer_names.push(name.clone());
                if written.contains(&name) {
                    continue;
                }
                match source {
                    LayerSource::File(path) => {
                        let mut file = std::fs::File::open(path)?;
                        let size = file.metadata()?.len();
                        append_entry(&mut builder, &name, &mut file, size)?;
                    }
                    LayerSource::Store => {
                        let mut file = self.store.open_diff(diff_id)?;
                        let size = file.metadata()?.len();
                        append_entry(&mut builder, &name, &mut file, size)?;
                    }
                }
                written.push(name);
            }
            if let Some((diff_id, bytes)) = &synthesized {
                let name = format!("{}.tar", digest_hex(diff_id));
                append_entry(&mut builder, &name, &mut bytes.as_slice(), bytes.len() as u64)?;
                layer_names.push(name);
            }

            let manifest = vec![LoadManifestEntry {
                config: config_name,
                repo_tags: Some(vec![primary_name.to_string()]),
                layers: layer_names,
            }];
            let manifest_bytes = serde_json::to_vec(&manifest)?;
            append_entry(
                &mut builder,
                "manifest.json",
                &mut &manifest_bytes[..],
                manifest_bytes.len() as u64,
            )?;

            builder.finish()?;
        }

        tarball.rewind()?;
        Ok(tarball)
    }
}

enum LayerSource {
    File(std::path::PathBuf),
    Store,
}

/// Append one entry with a zeroed timestamp.
pub(crate) fn append_entry<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &mut R,
    size: u64,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

/// Read a whole tar stream into a name -> bytes map.
pub(crate) fn collect_tar_files(bytes: &[u8]) -> Result<HashMap<String, Vec<u8>>> {
    let mut archive = tar::Archive::new(bytes);
    let mut files = HashMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.display().to_string();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        files.insert(name, contents);
    }
    Ok(files)
}

impl<C: DaemonClient> Backend for DaemonBackend<C> {
    fn default_platform(&self) -> Result<Platform> {
        let info = self.client.info()?;
        Ok(Platform {
            os: info.os,
            architecture: "amd64".to_string(),
            os_version: info.os_version,
        })
    }

    fn resolve(&self, reference: &ImageReference) -> Result<Option<ResolvedImage>> {
        let Some(image) = self.client.image_inspect(reference.as_str())? else {
            return Ok(None);
        };

        // The daemon addresses layers by diff ID only.
        let layers = image
            .config
            .rootfs
            .diff_ids
            .iter()
            .map(|diff_id| ResolvedLayer {
                diff_id: diff_id.clone(),
                digest: None,
                size: None,
            })
            .collect();

        Ok(Some(ResolvedImage {
            identifier: image.id,
            config: image.config,
            layers,
        }))
    }

    fn save(&self, request: &SaveRequest<'_>, names: &[String]) -> Result<String> {
        let mut tarball = self.materialize(request, &names[0])?;

        let id = match self.client.image_load(&mut tarball) {
            Ok(id) => id,
            Err(cause) => {
                // The load carries every name; none of them were written.
                let message = cause.to_string();
                return Err(SaveError {
                    errors: names
                        .iter()
                        .map(|name| TagFailure {
                            image_name: name.clone(),
                            cause: Box::new(ImageError::Transport(message.clone())),
                        })
                        .collect(),
                }
                .into());
            }
        };

        let mut failures = Vec::new();
        for name in &names[1..] {
            if let Err(cause) = self.client.image_tag(&id, name) {
                failures.push(TagFailure {
                    image_name: name.clone(),
                    cause: Box::new(cause),
                });
            }
        }
        if !failures.is_empty() {
            return Err(SaveError { errors: failures }.into());
        }
        Ok(id)
    }

    fn delete(&self, reference: &ImageReference, identifier: Option<&str>) -> Result<()> {
        let target = identifier.unwrap_or(reference.as_str());
        self.client.image_remove(target, true)?;
        Ok(())
    }

    fn open_layer(&self, reference: &ImageReference, diff_id: &str) -> Result<Box<dyn Read>> {
        let Some(image) = self.client.image_inspect(reference.as_str())? else {
            return Err(ImageError::Transport(format!(
                "No such image: {}",
                reference
            )));
        };

        if !image.config.rootfs.diff_ids.iter().any(|d| d == diff_id) {
            return Err(ImageError::LayerNotFound {
                name: reference.as_str().to_string(),
                diff_id: diff_id.to_string(),
            });
        }

        self.ensure_layer(reference, diff_id)?;
        Ok(Box::new(self.store.open_diff(diff_id)?))
    }
}

//! In-memory test doubles.
//!
//! [`FakeBackend`] is a full [`Backend`] that records what was saved so
//! tests can assert on names, annotations, and the normalized config
//! without a daemon or registry.
//!
//! [`FakeDaemonClient`] and [`FakeRegistryClient`] implement the external
//! transport contracts in memory, so the real daemon and registry backends
//! are exercised end-to-end: the daemon fake parses load tars, re-serves
//! them through export, and rejects malformed layers and tags with the
//! daemon's message text; the registry fake keeps per-repository blob and
//! manifest maps and honors cross-repo mounts.
//!
//! All fakes are cheaply clonable; clones share state, so a test can hand
//! one clone to an image handle and keep another for assertions.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, Platform, ResolvedImage, ResolvedLayer, SaveRequest};
use crate::config::ConfigFile;
use crate::daemon::{
    DaemonClient, DaemonImage, DaemonInfo, HistoryEntry, LoadManifestEntry, append_entry,
    collect_tar_files,
};
use crate::error::{ImageError, Result, SaveError, TagFailure};
use crate::layer::{Provenance, digest_hex, distribution_hashes, sha256_digest};
use crate::reference::ImageReference;
use crate::registry::{Authenticator, Keychain, RegistryClient};

/// A recording backend holding published images in memory.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    images: HashMap<String, FakeImage>,
    saved_names: Vec<String>,
    saved_annotations: BTreeMap<String, String>,
    last_config: Option<ConfigFile>,
}

#[derive(Clone)]
struct FakeImage {
    identifier: String,
    config: ConfigFile,
    layers: Vec<FakeLayer>,
}

#[derive(Clone)]
struct FakeLayer {
    diff_id: String,
    digest: String,
    size: u64,
    bytes: Vec<u8>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every name that was successfully published, in save order.
    pub fn saved_names(&self) -> Vec<String> {
        self.state.lock().expect("fake backend poisoned").saved_names.clone()
    }

    /// The annotation map recorded by the most recent save.
    pub fn saved_annotations(&self) -> BTreeMap<String, String> {
        self.state
            .lock()
            .expect("fake backend poisoned")
            .saved_annotations
            .clone()
    }

    /// The normalized config written by the most recent save.
    pub fn saved_config(&self) -> Option<ConfigFile> {
        self.state.lock().expect("fake backend poisoned").last_config.clone()
    }
}

impl Backend for FakeBackend {
    fn default_platform(&self) -> Result<Platform> {
        Ok(Platform {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            os_version: None,
        })
    }

    fn resolve(&self, reference: &ImageReference) -> Result<Option<ResolvedImage>> {
        let state = self.state.lock().expect("fake backend poisoned");
        Ok(state.images.get(&reference.canonical()).map(|image| ResolvedImage {
            identifier: image.identifier.clone(),
            config: image.config.clone(),
            layers: image
                .layers
                .iter()
                .map(|layer| ResolvedLayer {
                    diff_id: layer.diff_id.clone(),
                    digest: Some(layer.digest.clone()),
                    size: Some(layer.size),
                })
                .collect(),
        }))
    }

    fn save(&self, request: &SaveRequest<'_>, names: &[String]) -> Result<String> {
        let mut state = self.state.lock().expect("fake backend poisoned");

        let mut layers = Vec::with_capacity(request.layers.len());
        for layer in request.layers {
            let reused = matches!(layer.provenance, Provenance::Reused { .. });
            let bytes = match &layer.provenance {
                Provenance::Added { path } => std::fs::read(path)?,
                Provenance::Base { source } | Provenance::Reused { source } => {
                    let missing = || {
                        if reused {
                            ImageError::ReuseMissingLayer(layer.diff_id.clone())
                        } else {
                            ImageError::Transport(format!(
                                "layer {} not found in image {}",
                                layer.diff_id, source
                            ))
                        }
                    };
                    let image = state.images.get(&source.canonical()).ok_or_else(missing)?;
                    image
                        .layers
                        .iter()
                        .find(|l| l.diff_id == layer.diff_id)
                        .ok_or_else(missing)?
                        .bytes
                        .clone()
                }
            };

            let mut blob = Vec::new();
            let hashes = distribution_hashes(&bytes[..], &mut blob)?;
            layers.push(FakeLayer {
                diff_id: hashes.diff_id,
                digest: hashes.digest,
                size: hashes.compressed_size,
                bytes,
            });
        }

        let diff_ids: Vec<String> = layers.iter().map(|l| l.diff_id.clone()).collect();
        let config = request.config.normalized(&diff_ids);
        let config_bytes = serde_json::to_vec(&config)?;
        let identifier = sha256_digest(&config_bytes);

        let image = FakeImage {
            identifier: identifier.clone(),
            config: config.clone(),
            layers,
        };

        state.saved_annotations = request.annotations.clone();
        state.last_config = Some(config);

        let mut failures = Vec::new();
        for name in names {
            match ImageReference::parse(name) {
                Ok(reference) => {
                    state.images.insert(reference.canonical(), image.clone());
                    state.saved_names.push(name.clone());
                }
                Err(cause) => failures.push(TagFailure {
                    image_name: name.clone(),
                    cause: Box::new(cause),
                }),
            }
        }

        if !failures.is_empty() {
            return Err(SaveError { errors: failures }.into());
        }
        Ok(identifier)
    }

    fn delete(&self, reference: &ImageReference, _identifier: Option<&str>) -> Result<()> {
        self.state
            .lock()
            .expect("fake backend poisoned")
            .images
            .remove(&reference.canonical());
        Ok(())
    }

    fn open_layer(&self, reference: &ImageReference, diff_id: &str) -> Result<Box<dyn Read>> {
        let state = self.state.lock().expect("fake backend poisoned");
        let image = state
            .images
            .get(&reference.canonical())
            .ok_or_else(|| ImageError::ImageNotFound(reference.as_str().to_string()))?;
        let layer = image
            .layers
            .iter()
            .find(|layer| layer.diff_id == diff_id)
            .ok_or_else(|| ImageError::LayerNotFound {
                name: reference.as_str().to_string(),
                diff_id: diff_id.to_string(),
            })?;
        Ok(Box::new(Cursor::new(layer.bytes.clone())))
    }
}

/// An in-memory daemon implementing the [`DaemonClient`] contract.
#[derive(Clone)]
pub struct FakeDaemonClient {
    state: Arc<Mutex<DaemonState>>,
}

struct DaemonState {
    os: String,
    os_version: Option<String>,
    images: HashMap<String, StoredDaemonImage>,
    tags: HashMap<String, String>,
}

#[derive(Clone)]
struct StoredDaemonImage {
    id: String,
    config_bytes: Vec<u8>,
    config: ConfigFile,
    layers: Vec<(String, Vec<u8>)>,
}

impl FakeDaemonClient {
    pub fn new() -> Self {
        Self::with_os("linux", None)
    }

    pub fn with_os(os: &str, os_version: Option<&str>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DaemonState {
                os: os.to_string(),
                os_version: os_version.map(String::from),
                images: HashMap::new(),
                tags: HashMap::new(),
            })),
        }
    }

    /// Number of images currently loaded.
    pub fn image_count(&self) -> usize {
        self.state.lock().expect("fake daemon poisoned").images.len()
    }

    fn lookup_id(state: &DaemonState, name_or_id: &str) -> Option<String> {
        if state.images.contains_key(name_or_id) {
            return Some(name_or_id.to_string());
        }
        let prefixed = format!("sha256:{}", name_or_id);
        if state.images.contains_key(&prefixed) {
            return Some(prefixed);
        }
        ImageReference::parse(name_or_id)
            .ok()
            .and_then(|reference| state.tags.get(&reference.canonical()).cloned())
    }
}

impl Default for FakeDaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonClient for FakeDaemonClient {
    fn info(&self) -> Result<DaemonInfo> {
        let state = self.state.lock().expect("fake daemon poisoned");
        Ok(DaemonInfo {
            os: state.os.clone(),
            os_version: state.os_version.clone(),
        })
    }

    fn image_inspect(&self, name_or_id: &str) -> Result<Option<DaemonImage>> {
        let state = self.state.lock().expect("fake daemon poisoned");
        Ok(Self::lookup_id(&state, name_or_id).map(|id| {
            let image = &state.images[&id];
            DaemonImage {
                id: image.id.clone(),
                config: image.config.clone(),
            }
        }))
    }

    fn image_load(&self, tar: &mut dyn Read) -> Result<String> {
        let daemon_response =
            |detail: String| ImageError::Transport(format!("daemon response: {}", detail));

        let mut bytes = Vec::new();
        tar.read_to_end(&mut bytes)?;
        let files =
            collect_tar_files(&bytes).map_err(|e| daemon_response(format!("bad load tar: {}", e)))?;

        let manifest_bytes = files
            .get("manifest.json")
            .ok_or_else(|| daemon_response("load tar has no manifest.json".to_string()))?;
        let manifest: Vec<LoadManifestEntry> = serde_json::from_slice(manifest_bytes)
            .map_err(|e| daemon_response(format!("bad manifest.json: {}", e)))?;
        let entry = manifest
            .first()
            .ok_or_else(|| daemon_response("empty manifest.json".to_string()))?;

        let config_bytes = files
            .get(&entry.config)
            .ok_or_else(|| daemon_response(format!("missing config {}", entry.config)))?;
        let config: ConfigFile = serde_json::from_slice(config_bytes)
            .map_err(|e| daemon_response(format!("bad config: {}", e)))?;

        let mut layers = Vec::with_capacity(entry.layers.len());
        for (i, layer_name) in entry.layers.iter().enumerate() {
            let layer_bytes = files
                .get(layer_name)
                .ok_or_else(|| daemon_response(format!("missing layer {}", layer_name)))?;

            // The daemon rejects layers that are not valid tar streams.
            let mut archive = tar::Archive::new(layer_bytes.as_slice());
            for archived in archive
                .entries()
                .map_err(|e| daemon_response(format!("invalid layer tar: {}", e)))?
            {
                archived.map_err(|e| daemon_response(format!("invalid layer tar: {}", e)))?;
            }

            let diff_id = sha256_digest(layer_bytes);
            if config.rootfs.diff_ids.get(i) != Some(&diff_id) {
                return Err(daemon_response(format!(
                    "layer {} does not match config diff ID",
                    layer_name
                )));
            }
            layers.push((diff_id, layer_bytes.clone()));
        }

        let id = sha256_digest(config_bytes);

        // Validate every tag before committing anything.
        let mut tag_keys = Vec::new();
        if let Some(repo_tags) = &entry.repo_tags {
            for tag in repo_tags {
                let reference = ImageReference::parse(tag)
                    .map_err(|_| ImageError::Transport("invalid reference format".to_string()))?;
                tag_keys.push(reference.canonical());
            }
        }

        let mut state = self.state.lock().expect("fake daemon poisoned");
        state.images.insert(
            id.clone(),
            StoredDaemonImage {
                id: id.clone(),
                config_bytes: config_bytes.clone(),
                config,
                layers,
            },
        );
        for key in tag_keys {
            state.tags.insert(key, id.clone());
        }
        Ok(id)
    }

    fn image_tag(&self, name_or_id: &str, tag: &str) -> Result<()> {
        let mut state = self.state.lock().expect("fake daemon poisoned");
        let id = Self::lookup_id(&state, name_or_id)
            .ok_or_else(|| ImageError::Transport(format!("No such image: {}", name_or_id)))?;
        let reference = ImageReference::parse(tag)
            .map_err(|_| ImageError::Transport("invalid reference format".to_string()))?;
        state.tags.insert(reference.canonical(), id);
        Ok(())
    }

    fn image_remove(&self, name_or_id: &str, force: bool) -> Result<bool> {
        let mut state = self.state.lock().expect("fake daemon poisoned");
        let Some(id) = Self::lookup_id(&state, name_or_id) else {
            return Ok(false);
        };

        // Removing by tag without force only unties that tag while other
        // tags still point at the image.
        if !force {
            let by_tag = ImageReference::parse(name_or_id)
                .map(|reference| reference.canonical())
                .ok()
                .filter(|key| state.tags.contains_key(key));
            if let Some(key) = by_tag {
                let others = state.tags.iter().any(|(k, tagged)| tagged == &id && k != &key);
                if others {
                    state.tags.remove(&key);
                    return Ok(true);
                }
            }
        }

        state.images.remove(&id);
        state.tags.retain(|_, tagged| tagged != &id);
        Ok(true)
    }

    fn image_history(&self, name_or_id: &str) -> Result<Vec<HistoryEntry>> {
        let state = self.state.lock().expect("fake daemon poisoned");
        let id = Self::lookup_id(&state, name_or_id)
            .ok_or_else(|| ImageError::Transport(format!("No such image: {}", name_or_id)))?;
        Ok(state.images[&id]
            .config
            .history
            .iter()
            .map(|entry| HistoryEntry {
                created: entry.created.map(|t| t.timestamp()).unwrap_or_default(),
                created_by: entry.created_by.clone().unwrap_or_default(),
            })
            .collect())
    }

    fn image_export(&self, name_or_id: &str) -> Result<Box<dyn Read>> {
        let state = self.state.lock().expect("fake daemon poisoned");
        let id = Self::lookup_id(&state, name_or_id)
            .ok_or_else(|| ImageError::Transport(format!("No such image: {}", name_or_id)))?;
        let image = &state.images[&id];

        let mut builder = tar::Builder::new(Vec::new());
        let config_name = format!("{}.json", digest_hex(&image.id));
        append_entry(
            &mut builder,
            &config_name,
            &mut image.config_bytes.as_slice(),
            image.config_bytes.len() as u64,
        )?;

        let mut layer_names = Vec::new();
        for (diff_id, bytes) in &image.layers {
            let name = format!("{}.tar", digest_hex(diff_id));
            append_entry(&mut builder, &name, &mut bytes.as_slice(), bytes.len() as u64)?;
            layer_names.push(name);
        }

        let manifest = vec![LoadManifestEntry {
            config: config_name,
            repo_tags: None,
            layers: layer_names,
        }];
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        append_entry(
            &mut builder,
            "manifest.json",
            &mut &manifest_bytes[..],
            manifest_bytes.len() as u64,
        )?;

        let bytes = builder.into_inner()?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

/// An in-memory registry implementing the [`RegistryClient`] contract.
#[derive(Clone, Default)]
pub struct FakeRegistryClient {
    state: Arc<Mutex<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    /// `registry/repository` -> digest -> blob bytes.
    blobs: HashMap<String, HashMap<String, Vec<u8>>>,
    /// `registry/repository@reference` -> (manifest bytes, digest).
    manifests: HashMap<String, (Vec<u8>, String)>,
    /// Recorded cross-repo mounts: (to repository, from repository, digest).
    mounts: Vec<(String, String, String)>,
}

fn repo_key(registry: &str, repository: &str) -> String {
    format!("{}/{}", registry, repository)
}

fn manifest_key(registry: &str, repository: &str, reference: &str) -> String {
    format!("{}/{}@{}", registry, repository, reference)
}

impl FakeRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cross-repo mounts the registry has honored, for assertions.
    pub fn mounts(&self) -> Vec<(String, String, String)> {
        self.state.lock().expect("fake registry poisoned").mounts.clone()
    }

    /// Number of blobs stored for a repository.
    pub fn blob_count(&self, registry: &str, repository: &str) -> usize {
        self.state
            .lock()
            .expect("fake registry poisoned")
            .blobs
            .get(&repo_key(registry, repository))
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Drop a blob, simulating registry garbage collection.
    pub fn remove_blob(&self, registry: &str, repository: &str, digest: &str) {
        let mut state = self.state.lock().expect("fake registry poisoned");
        if let Some(repo) = state.blobs.get_mut(&repo_key(registry, repository)) {
            repo.remove(digest);
        }
    }
}

impl RegistryClient for FakeRegistryClient {
    fn head_blob(
        &self,
        _auth: &Authenticator,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<bool> {
        let state = self.state.lock().expect("fake registry poisoned");
        Ok(state
            .blobs
            .get(&repo_key(registry, repository))
            .is_some_and(|repo| repo.contains_key(digest)))
    }

    fn mount_blob(
        &self,
        _auth: &Authenticator,
        registry: &str,
        repository: &str,
        from_repository: &str,
        digest: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().expect("fake registry poisoned");
        let Some(bytes) = state
            .blobs
            .get(&repo_key(registry, from_repository))
            .and_then(|repo| repo.get(digest))
            .cloned()
        else {
            return Ok(false);
        };
        state
            .blobs
            .entry(repo_key(registry, repository))
            .or_default()
            .insert(digest.to_string(), bytes);
        state.mounts.push((
            repository.to_string(),
            from_repository.to_string(),
            digest.to_string(),
        ));
        Ok(true)
    }

    fn put_blob(
        &self,
        _auth: &Authenticator,
        registry: &str,
        repository: &str,
        digest: &str,
        content: &mut dyn Read,
    ) -> Result<()> {
        let mut bytes = Vec::new();
        content.read_to_end(&mut bytes)?;
        if sha256_digest(&bytes) != digest {
            return Err(ImageError::Transport(format!(
                "blob digest mismatch for {}",
                digest
            )));
        }
        let mut state = self.state.lock().expect("fake registry poisoned");
        state
            .blobs
            .entry(repo_key(registry, repository))
            .or_default()
            .insert(digest.to_string(), bytes);
        Ok(())
    }

    fn get_blob(
        &self,
        _auth: &Authenticator,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<Option<Box<dyn Read>>> {
        let state = self.state.lock().expect("fake registry poisoned");
        Ok(state
            .blobs
            .get(&repo_key(registry, repository))
            .and_then(|repo| repo.get(digest))
            .cloned()
            .map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn Read>))
    }

    fn get_manifest(
        &self,
        _auth: &Authenticator,
        registry: &str,
        repository: &str,
        reference: &str,
    ) -> Result<Option<(Vec<u8>, String)>> {
        let state = self.state.lock().expect("fake registry poisoned");
        Ok(state
            .manifests
            .get(&manifest_key(registry, repository, reference))
            .cloned())
    }

    fn put_manifest(
        &self,
        _auth: &Authenticator,
        registry: &str,
        repository: &str,
        reference: &str,
        _media_type: &str,
        payload: &[u8],
    ) -> Result<()> {
        let digest = sha256_digest(payload);
        let mut state = self.state.lock().expect("fake registry poisoned");
        state.manifests.insert(
            manifest_key(registry, repository, reference),
            (payload.to_vec(), digest.clone()),
        );
        state.manifests.insert(
            manifest_key(registry, repository, &digest),
            (payload.to_vec(), digest),
        );
        Ok(())
    }

    fn delete_manifest(
        &self,
        _auth: &Authenticator,
        registry: &str,
        repository: &str,
        reference: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().expect("fake registry poisoned");
        Ok(state
            .manifests
            .remove(&manifest_key(registry, repository, reference))
            .is_some())
    }
}

/// A keychain resolving fixed Authorization headers per registry,
/// anonymous for everything else.
#[derive(Clone, Default)]
pub struct StaticKeychain {
    tokens: HashMap<String, String>,
}

impl StaticKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, registry: &str, header: &str) -> Self {
        self.tokens.insert(registry.to_string(), header.to_string());
        self
    }
}

impl Keychain for StaticKeychain {
    fn resolve(&self, registry: &str) -> Result<Authenticator> {
        Ok(self
            .tokens
            .get(registry)
            .map(|header| Authenticator::with_authorization(header))
            .unwrap_or_else(Authenticator::anonymous))
    }
}

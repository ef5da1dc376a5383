//! Backend capability interface.
//!
//! An [`Image`](crate::image::Image) handle is a value parameterized by a
//! backend capability: the daemon backend, the registry backend, and the
//! in-memory fake all implement [`Backend`], and the mutation engine never
//! needs to know which one it is talking to. The trait is coarse on purpose:
//! `save` is the transactional commit point, and everything before it is
//! read-only resolution.

use std::collections::BTreeMap;
use std::io::Read;

use crate::config::ConfigFile;
use crate::error::Result;
use crate::layer::LayerEntry;
use crate::reference::ImageReference;

/// The platform a backend builds images for by default, used to seed the
/// config of images constructed without a base.
#[derive(Debug, Clone)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub os_version: Option<String>,
}

/// One layer of a published image as seen by a backend.
///
/// Daemon-resolved layers carry only a diff ID; registry-resolved layers
/// also know their compressed digest and size.
#[derive(Debug, Clone)]
pub struct ResolvedLayer {
    pub diff_id: String,
    pub digest: Option<String>,
    pub size: Option<u64>,
}

/// A published image resolved from a backend by name.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// Backend identifier: the daemon image ID or the registry manifest
    /// digest.
    pub identifier: String,
    pub config: ConfigFile,
    pub layers: Vec<ResolvedLayer>,
}

/// The post-mutation image state handed to a backend at save time.
///
/// The config is not yet normalized; the backend applies the
/// reproducibility pass to its own copy.
pub struct SaveRequest<'a> {
    pub name: &'a ImageReference,
    pub config: &'a ConfigFile,
    pub layers: &'a [LayerEntry],
    pub annotations: &'a BTreeMap<String, String>,
}

/// Capability interface shared by the daemon, registry, and fake backends.
pub trait Backend {
    /// Platform defaults for images built without a base.
    fn default_platform(&self) -> Result<Platform>;

    /// Look up a published image by reference. `Ok(None)` means the image
    /// does not exist; that is never an error here (constructors tolerate
    /// missing bases).
    fn resolve(&self, reference: &ImageReference) -> Result<Option<ResolvedImage>>;

    /// Commit the image under every name in `names` (unparsed, exactly as
    /// the caller supplied them) and return the backend identifier.
    ///
    /// Per-name failures accumulate into a
    /// [`SaveError`](crate::error::SaveError); names that are not listed in
    /// it were published.
    fn save(&self, request: &SaveRequest<'_>, names: &[String]) -> Result<String>;

    /// Remove the image. `identifier` is the last known backend identifier,
    /// which the daemon backend prefers over the name so a re-tagged image
    /// can still be deleted. Deleting a missing image succeeds.
    fn delete(&self, reference: &ImageReference, identifier: Option<&str>) -> Result<()>;

    /// Stream a published layer's uncompressed tar by diff ID.
    fn open_layer(&self, reference: &ImageReference, diff_id: &str) -> Result<Box<dyn Read>>;
}

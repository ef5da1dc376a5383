#![forbid(unsafe_code)]
//! Uniform construction, mutation, and publishing of container images.
//!
//! This library exposes one abstract image handle with identical semantics
//! over two backends: a local container daemon (via its load/tag/inspect
//! API) and an OCI registry (via blob upload and manifest PUT), plus an
//! in-memory fake for tests. Layer appends, layer reuse by diff ID, rebase
//! onto a new base, and config edits all behave the same regardless of where
//! the image ends up.
//!
//! # Overview
//!
//! - [`image::Image`] tracks pending mutations over a base-image snapshot
//!   and hands the reconciled state to a [`backend::Backend`] on save
//! - [`daemon::DaemonBackend`] materializes a daemon-loadable tar and tags
//!   the result; [`registry::RegistryBackend`] uploads missing blobs
//!   (mounting cross-repo where possible) and PUTs the manifest
//! - [`store::LayerStore`] is the content-addressed layer cache shared by
//!   both save pipelines
//! - [`windows::WindowsLayerWriter`] produces the `Files/`/`Hives/` layer
//!   layout with `MSWINDOWS.rawsd` security descriptors
//!
//! The daemon and registry transports themselves are external: backends
//! talk to injected [`daemon::DaemonClient`] and
//! [`registry::RegistryClient`] implementations, with credentials from a
//! [`registry::Keychain`]. The [`fake`] module ships in-memory versions of
//! all three.
//!
//! # Reproducibility
//!
//! Saves are byte-reproducible: the config's `created` field and all
//! history timestamps are pinned to [`config::normalized_date_time`],
//! daemon-specific fields are cleared, and gzip streams carry no
//! timestamps. Building the same mutations over the same base twice yields
//! byte-identical configs and manifests, and therefore identical image
//! identifiers.
//!
//! # Example
//!
//! ```no_run
//! use imgkit::{FakeBackend, Image, ImageOptions};
//!
//! let mut image = Image::new("example.com/app:latest", FakeBackend::new(), ImageOptions {
//!     base_image: Some("example.com/base:latest".to_string()),
//!     ..ImageOptions::default()
//! })?;
//!
//! image.add_layer(std::path::Path::new("/tmp/app-layer.tar"))?;
//! image.set_label("org.example.version", "1.2.3");
//! image.set_env("PORT", "8080");
//! image.set_entrypoint(&["/bin/app"]);
//! image.save(&["example.com/app:1.2.3"])?;
//! # Ok::<(), imgkit::ImageError>(())
//! ```

pub mod backend;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fake;
pub mod image;
pub mod layer;
pub mod manifest;
pub mod reference;
pub mod registry;
pub mod store;
pub mod windows;

pub use backend::{Backend, Platform, ResolvedImage, ResolvedLayer, SaveRequest};
pub use config::{Config, ConfigFile, History, RootFs, normalized_date_time};
pub use daemon::{DaemonBackend, DaemonClient, DaemonImage, DaemonInfo, HistoryEntry};
pub use error::{ImageError, Result, SaveError, TagFailure};
pub use fake::{FakeBackend, FakeDaemonClient, FakeRegistryClient, StaticKeychain};
pub use image::{Image, ImageOptions};
pub use layer::{LayerEntry, LayerHashes, Provenance, diff_id_of, sha256_digest};
pub use manifest::{Descriptor, Manifest, REF_NAME_ANNOTATION};
pub use reference::ImageReference;
pub use registry::{Authenticator, Keychain, RegistryBackend, RegistryClient};
pub use store::LayerStore;
pub use windows::{
    ADMINISTRATOR_OWNER_AND_GROUP_SID, USER_OWNER_AND_GROUP_SID, WindowsLayerWriter,
};

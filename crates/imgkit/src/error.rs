//! Error types for the imgkit library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, ImageError>`. The error enum covers every failure class the
//! image facade can produce:
//!
//! - **Reference errors**: [`InvalidReference`]
//! - **Layer lookup errors**: [`LayerNotFound`], [`ReuseMissingLayer`],
//!   [`RebaseMissingLayer`], [`NoLayers`], [`BlobNotFound`]
//! - **Layer writing errors**: [`InvalidLayerName`]
//! - **Backend errors**: [`ImageNotFound`], [`Transport`], [`Save`]
//! - **System errors**: [`Io`], [`Json`]
//!
//! [`InvalidReference`]: ImageError::InvalidReference
//! [`LayerNotFound`]: ImageError::LayerNotFound
//! [`ReuseMissingLayer`]: ImageError::ReuseMissingLayer
//! [`RebaseMissingLayer`]: ImageError::RebaseMissingLayer
//! [`NoLayers`]: ImageError::NoLayers
//! [`BlobNotFound`]: ImageError::BlobNotFound
//! [`InvalidLayerName`]: ImageError::InvalidLayerName
//! [`ImageNotFound`]: ImageError::ImageNotFound
//! [`Transport`]: ImageError::Transport
//! [`Save`]: ImageError::Save
//! [`Io`]: ImageError::Io
//! [`Json`]: ImageError::Json
//!
//! # Multi-tag saves
//!
//! `save` publishes an image under one or more names and does not abort on
//! the first bad name. Per-name failures accumulate into a [`SaveError`],
//! which carries one [`TagFailure`] per name that could not be written while
//! the remaining names are still published.

use std::fmt;

/// Result type alias for operations that may return an [`ImageError`].
pub type Result<T> = std::result::Result<T, ImageError>;

/// Error types for image operations.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// An image reference could not be parsed.
    #[error("could not parse reference: {0}")]
    InvalidReference(String),

    /// A layer-writer header name was not an absolute POSIX path.
    #[error("invalid header name: must be absolute, posix path: {0}")]
    InvalidLayerName(String),

    /// `top_layer` was called on an image with no layers.
    #[error("image '{0}' has no layers")]
    NoLayers(String),

    /// `reuse_layer` could not find the diff ID in the previous image.
    #[error("no previous image layer matching diff ID {0}")]
    ReuseMissingLayer(String),

    /// `rebase` could not find the old top layer in the current image.
    #[error("could not find layer with digest {0}")]
    RebaseMissingLayer(String),

    /// A published image does not contain the requested layer.
    #[error("image '{name}' does not contain layer with diff ID '{diff_id}'")]
    LayerNotFound { name: String, diff_id: String },

    /// A layer file could not be located in any added layer.
    #[error("could not find '{path}' in any layer.\n\nLayers\n-------\n{listing}")]
    LayerFileNotFound { path: String, listing: String },

    /// A layer blob is missing from the local layer store.
    #[error("layer with diff ID {0} not present in the layer store")]
    BlobNotFound(String),

    /// A referenced image does not exist in the backend.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// A daemon or registry I/O failure, surfaced with the transport's own
    /// message text.
    #[error("{0}")]
    Transport(String),

    /// One or more tags failed during a multi-name save.
    #[error(transparent)]
    Save(#[from] SaveError),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A single tag that failed during a multi-name save.
#[derive(Debug)]
pub struct TagFailure {
    /// The name as requested by the caller.
    pub image_name: String,
    /// Why publishing under that name failed.
    pub cause: Box<ImageError>,
}

/// Composite error carrying every tag that failed during `save`.
///
/// Names that are not listed here were published successfully.
#[derive(Debug)]
pub struct SaveError {
    pub errors: Vec<TagFailure>,
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failures: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.image_name, e.cause))
            .collect();
        write!(
            f,
            "failed to write image to the following tags: [{}]",
            failures.join(",")
        )
    }
}

impl std::error::Error for SaveError {}

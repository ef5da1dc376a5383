//! Content-addressed layer store.
//!
//! A keyed cache of layer content with two indexes: `diff/<hex>` holds
//! uncompressed layer tars by diff ID, `blobs/<hex>` holds the gzip blobs by
//! distribution digest. Backends use it to avoid re-reading caller tars, to
//! adopt layers exported from a daemon, and to serve `get_layer` reads.
//!
//! All file access goes through cap-std `Dir` handles opened at the store
//! root, and every write lands via a temp file renamed into place, so a
//! half-written blob is never observable under its content address.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use cap_std::ambient_authority;
use cap_std::fs::Dir;

use crate::error::{ImageError, Result};
use crate::layer::{LayerHashes, digest_hex, distribution_hashes};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Disk-backed cache of layer blobs, addressed by diff ID and by compressed
/// digest.
pub struct LayerStore {
    diff: Dir,
    blobs: Dir,
    /// diff ID -> distribution digest, for blobs this store has seen.
    digests: Mutex<HashMap<String, String>>,
    /// Keeps a scratch directory alive for stores created with [`temp`].
    ///
    /// [`temp`]: LayerStore::temp
    _scratch: Option<tempfile::TempDir>,
}

impl LayerStore {
    /// Open (or create) a layer store rooted at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let root = Dir::open_ambient_dir(path, ambient_authority())?;

        for sub in ["diff", "blobs"] {
            match root.create_dir(sub) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(ImageError::Io(e)),
            }
        }

        Ok(Self {
            diff: root.open_dir("diff")?,
            blobs: root.open_dir("blobs")?,
            digests: Mutex::new(HashMap::new()),
            _scratch: None,
        })
    }

    /// Create a store over a scratch directory that is removed when the
    /// store is dropped.
    pub fn temp() -> Result<Self> {
        let scratch = tempfile::TempDir::new()?;
        let mut store = Self::open(scratch.path())?;
        store._scratch = Some(scratch);
        Ok(store)
    }

    /// Ingest an uncompressed layer tar from disk, producing both content
    /// addresses in a single streaming pass. The source file is borrowed;
    /// the store keeps its own copy.
    pub fn put(&self, path: &Path) -> Result<LayerHashes> {
        let mut src = std::fs::File::open(path)?;
        self.put_uncompressed(&mut src)
    }

    /// Ingest an uncompressed layer tar from a stream.
    pub fn put_uncompressed(&self, src: &mut dyn Read) -> Result<LayerHashes> {
        let tmp_diff = temp_name();
        let tmp_blob = temp_name();

        let diff_out = self.diff.create(&tmp_diff)?;
        let blob_out = self.blobs.create(&tmp_blob)?;

        let hashes = distribution_hashes(
            TeeReader {
                inner: src,
                copy: diff_out,
            },
            blob_out,
        )?;

        self.diff
            .rename(&tmp_diff, &self.diff, digest_hex(&hashes.diff_id))?;
        self.blobs
            .rename(&tmp_blob, &self.blobs, digest_hex(&hashes.digest))?;

        self.digests
            .lock()
            .expect("layer store index poisoned")
            .insert(hashes.diff_id.clone(), hashes.digest.clone());

        tracing::debug!(diff_id = %hashes.diff_id, digest = %hashes.digest, "stored layer");
        Ok(hashes)
    }

    /// Whether the uncompressed tar for `diff_id` is present.
    pub fn has(&self, diff_id: &str) -> bool {
        self.diff.try_exists(digest_hex(diff_id)).unwrap_or(false)
    }

    /// Whether the gzip blob for `digest` is present.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.blobs.try_exists(digest_hex(digest)).unwrap_or(false)
    }

    /// Open the uncompressed tar for `diff_id`.
    pub fn open_diff(&self, diff_id: &str) -> Result<std::fs::File> {
        match self.diff.open(digest_hex(diff_id)) {
            Ok(file) => Ok(file.into_std()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ImageError::BlobNotFound(diff_id.to_string()))
            }
            Err(e) => Err(ImageError::Io(e)),
        }
    }

    /// Open the gzip blob for `digest`.
    pub fn open_blob(&self, digest: &str) -> Result<std::fs::File> {
        match self.blobs.open(digest_hex(digest)) {
            Ok(file) => Ok(file.into_std()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ImageError::BlobNotFound(digest.to_string()))
            }
            Err(e) => Err(ImageError::Io(e)),
        }
    }

    /// The distribution digest recorded for `diff_id`, if this store has
    /// hashed it.
    pub fn digest_for(&self, diff_id: &str) -> Option<String> {
        self.digests
            .lock()
            .expect("layer store index poisoned")
            .get(diff_id)
            .cloned()
    }

    /// Size in bytes of the uncompressed tar for `diff_id`.
    pub fn diff_size(&self, diff_id: &str) -> Result<u64> {
        Ok(self.diff.metadata(digest_hex(diff_id))?.len())
    }

    /// Adopt a layer from another store without going through a backend.
    pub fn copy_from(&self, other: &LayerStore, diff_id: &str) -> Result<()> {
        if self.has(diff_id) {
            return Ok(());
        }
        let mut src = other.open_diff(diff_id)?;
        let hashes = self.put_uncompressed(&mut src)?;
        debug_assert_eq!(hashes.diff_id, diff_id);
        Ok(())
    }
}

/// Copies everything read through it into a secondary writer.
struct TeeReader<R: Read, W: Write> {
    inner: R,
    copy: W,
}

impl<R: Read, W: Write> Read for TeeReader<R, W> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.copy.write_all(&buf[..n])?;
        Ok(n)
    }
}

fn temp_name() -> String {
    format!(
        ".tmp-{}-{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

//! Layer descriptors and content hashing.
//!
//! A layer is addressed two ways: by *diff ID* (SHA-256 of the uncompressed
//! tar) and by *digest* (SHA-256 of the gzip blob as sent on the wire). Both
//! are computed in a single streaming pass by [`distribution_hashes`], which
//! tees the input through a gzip encoder while hashing both forms.
//!
//! [`Provenance`] records where a pending layer's bytes come from, as an
//! explicit tagged sum so `save` never has to guess: layers inherited from
//! the base image and layers reused from a previous image carry the source
//! reference (looked up by name at save time), added layers carry the
//! caller's tar path, which is borrowed until the save completes.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::reference::ImageReference;

/// Where a pending layer's bytes come from.
#[derive(Debug, Clone)]
pub enum Provenance {
    /// Inherited from the base image; bytes resolve from `source` at save
    /// time.
    Base { source: ImageReference },
    /// Appended by the caller; `path` points at an uncompressed tar that
    /// must outlive the save.
    Added { path: PathBuf },
    /// Adopted from a previous image by diff ID without rematerializing.
    Reused { source: ImageReference },
}

/// A layer in an image's pending layer list.
#[derive(Debug, Clone)]
pub struct LayerEntry {
    /// SHA-256 of the uncompressed tar, `sha256:`-prefixed.
    pub diff_id: String,
    /// SHA-256 of the gzip blob, when known. Layers resolved from a daemon
    /// carry none; the daemon addresses layers by diff ID only.
    pub digest: Option<String>,
    /// Compressed size in bytes, when known.
    pub size: Option<u64>,
    pub provenance: Provenance,
}

/// Digests and sizes computed from one pass over a layer tar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerHashes {
    pub diff_id: String,
    pub digest: String,
    pub size: u64,
    pub compressed_size: u64,
}

/// SHA-256 of a byte slice, `sha256:`-prefixed.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// The hex portion of a `sha256:`-prefixed digest.
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Compute the diff ID of an uncompressed layer tar on disk.
pub fn diff_id_of(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

/// Stream an uncompressed tar through a gzip encoder into `blob_out`,
/// hashing both the uncompressed and the compressed form simultaneously.
///
/// The gzip stream is written with a zeroed header timestamp and a fixed
/// compression level, so identical inputs produce identical blobs.
pub fn distribution_hashes<R: Read, W: Write>(mut src: R, blob_out: W) -> Result<LayerHashes> {
    let mut diff_hasher = Sha256::new();
    let mut size = 0u64;
    let mut encoder = GzEncoder::new(HashingWriter::new(blob_out), Compression::default());

    let mut buf = [0u8; 8192];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        diff_hasher.update(&buf[..n]);
        encoder.write_all(&buf[..n])?;
        size += n as u64;
    }

    let sink = encoder.finish()?;
    let (digest, compressed_size) = sink.finish();

    Ok(LayerHashes {
        diff_id: format!("sha256:{:x}", diff_hasher.finalize()),
        digest,
        size,
        compressed_size,
    })
}

/// A writer that hashes and counts everything passing through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn finish(self) -> (String, u64) {
        (format!("sha256:{:x}", self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

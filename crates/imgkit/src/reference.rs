//! Image reference parsing and validation.
//!
//! Parses references like `ghcr.io/org/app:v1.2` into structured components
//! with docker-style defaulting: a bare `app` becomes
//! `docker.io/library/app:latest`, the first path component is treated as a
//! registry only when it contains a dot, a colon, or is `localhost`.
//!
//! Validation is strict enough that malformed tags are rejected before they
//! reach a backend: repository components are lowercase alphanumerics joined
//! by `.`, `_`, or `-`, and tags are limited to 128 characters of
//! `[A-Za-z0-9._-]` starting with a word character.

use std::fmt;

use crate::error::{ImageError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither a tag nor a digest is specified.
const DEFAULT_TAG: &str = "latest";

/// A parsed image reference.
///
/// Keeps the original string around: error messages and daemon calls echo the
/// name exactly as the caller wrote it, while [`canonical`](Self::canonical)
/// provides the fully-qualified form for keying and comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    raw: String,
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// # Errors
    ///
    /// Returns [`ImageError::InvalidReference`] when the reference is empty
    /// or any component fails validation.
    pub fn parse(reference: &str) -> Result<Self> {
        let raw = reference;
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ImageError::InvalidReference(raw.to_string()));
        }

        // Split off the digest first (@ separator).
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at) => {
                let digest = &reference[at + 1..];
                if !is_valid_digest(digest) {
                    return Err(ImageError::InvalidReference(raw.to_string()));
                }
                (&reference[..at], Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // Split the tag on the last colon after the last slash. A colon in
        // the first component followed by digits is a registry port.
        let (name, tag) = split_tag(name_tag);

        if let Some(tag) = &tag {
            if !is_valid_tag(tag) {
                return Err(ImageError::InvalidReference(raw.to_string()));
            }
        }

        let (registry, repository) = split_registry_repository(name)
            .ok_or_else(|| ImageError::InvalidReference(raw.to_string()))?;

        if !is_valid_registry(&registry) || !is_valid_repository(&repository) {
            return Err(ImageError::InvalidReference(raw.to_string()));
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            raw: raw.to_string(),
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The reference exactly as the caller wrote it.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Registry hostname, including any port.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The tag or digest used to address a manifest in a registry.
    pub fn identifier(&self) -> &str {
        match &self.digest {
            Some(d) => d,
            None => self.tag.as_deref().unwrap_or(DEFAULT_TAG),
        }
    }

    /// The fully-qualified reference string, suitable as a map key.
    pub fn canonical(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_tag(name_tag: &str) -> (&str, Option<String>) {
    match name_tag.rfind('/') {
        Some(slash) => {
            let after = &name_tag[slash + 1..];
            match after.rfind(':') {
                Some(colon) => (
                    &name_tag[..slash + 1 + colon],
                    Some(after[colon + 1..].to_string()),
                ),
                None => (name_tag, None),
            }
        }
        None => match name_tag.rfind(':') {
            Some(colon) => {
                let after = &name_tag[colon + 1..];
                if after.chars().all(|c| c.is_ascii_digit()) && !after.is_empty() {
                    // Registry port, not a tag.
                    (name_tag, None)
                } else {
                    (&name_tag[..colon], Some(after.to_string()))
                }
            }
            None => (name_tag, None),
        },
    }
}

fn split_registry_repository(name: &str) -> Option<(String, String)> {
    if name.is_empty() {
        return None;
    }

    if let Some(slash) = name.find('/') {
        let first = &name[..slash];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let repository = &name[slash + 1..];
            if repository.is_empty() {
                return None;
            }
            return Some((first.to_string(), repository.to_string()));
        }
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };

    Some((DEFAULT_REGISTRY.to_string(), repository))
}

fn is_valid_registry(registry: &str) -> bool {
    !registry.is_empty()
        && registry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
}

fn is_valid_repository(repository: &str) -> bool {
    repository.split('/').all(|component| {
        !component.is_empty()
            && component.starts_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && component.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit())
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
    })
}

fn is_valid_tag(tag: &str) -> bool {
    if tag.is_empty() || tag.len() > 128 {
        return false;
    }
    let mut chars = tag.chars();
    let first = chars.next().unwrap_or(' ');
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn is_valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && algorithm
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                && hex.len() >= 32
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

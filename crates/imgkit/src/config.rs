//! Image configuration model and reproducibility normalization.
//!
//! [`ConfigFile`] is a Docker-compatible superset of the OCI image config: it
//! carries the daemon-only fields (`container`, `docker_version`,
//! `Config.Image`) that the normalization pass must clear, and preserves any
//! field it does not model through a flattened map so a base image's config
//! round-trips untouched.
//!
//! # Reproducibility
//!
//! Two saves of the same mutation sequence over the same base must produce
//! byte-identical config JSON. [`ConfigFile::normalized`] is the single pass
//! that makes this hold, applied by every backend to a defensive copy of the
//! config just before hashing and publishing:
//!
//! - `created` is pinned to the normalized date-time constant
//!   ([`normalized_date_time`], 1980-01-01T00:00:01Z)
//! - `container`, `docker_version`, and `Config.Image` are cleared
//! - `rootfs.diff_ids` is regenerated from the layer list
//! - `history` is regenerated with one entry per layer at the normalized
//!   instant
//!
//! Labels are kept in a `BTreeMap` so they serialize sorted; env is an
//! ordered list where [`ConfigFile::set_env`] replaces the first entry whose
//! key matches and appends otherwise.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch for 1980-01-01T00:00:01Z.
const NORMALIZED_EPOCH_SECS: i64 = 315_532_801;

/// The fixed UTC instant written into `created` and history entries on every
/// save, making identical builds byte-identical.
pub fn normalized_date_time() -> DateTime<Utc> {
    DateTime::from_timestamp(NORMALIZED_EPOCH_SECS, 0)
        .expect("normalized epoch is representable")
}

/// An image configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub architecture: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_version: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,

    #[serde(default)]
    pub os: String,

    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,

    #[serde(default)]
    pub rootfs: RootFs,

    #[serde(default)]
    pub config: Config,

    /// Fields this model does not know about, preserved on round-trip.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The runtime configuration section of an image config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "User", default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(rename = "Labels", default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(rename = "Image", default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The rootfs section: an ordered list of uncompressed layer digests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,

    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One history entry per layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

impl ConfigFile {
    /// Create a config for the given platform with an empty layer list.
    pub fn with_platform(os: &str, architecture: &str, os_version: Option<&str>) -> Self {
        Self {
            architecture: architecture.to_string(),
            os: os.to_string(),
            os_version: os_version.map(String::from),
            ..Self::default()
        }
    }

    /// Look up a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config
            .labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.config
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
    }

    /// Look up an environment variable by key.
    pub fn env(&self, key: &str) -> Option<&str> {
        self.config.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Set an environment variable, replacing the first entry whose key
    /// matches and appending otherwise.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let encoded = format!("{}={}", key, value);
        let existing = self
            .config
            .env
            .iter()
            .position(|entry| entry.split_once('=').map(|(k, _)| k) == Some(key));
        match existing {
            Some(i) => self.config.env[i] = encoded,
            None => self.config.env.push(encoded),
        }
    }

    pub fn set_entrypoint(&mut self, parts: &[&str]) {
        self.config.entrypoint = Some(parts.iter().map(|s| s.to_string()).collect());
    }

    pub fn set_cmd(&mut self, parts: &[&str]) {
        self.config.cmd = Some(parts.iter().map(|s| s.to_string()).collect());
    }

    pub fn set_working_dir(&mut self, dir: &str) {
        self.config.working_dir = Some(dir.to_string());
    }

    /// Produce the reproducible form of this config for the given layer
    /// list. Always operates on a copy; the in-memory config a caller reads
    /// back keeps whatever it set.
    pub fn normalized(&self, diff_ids: &[String]) -> ConfigFile {
        let mut normalized = self.clone();
        normalized.created = Some(normalized_date_time());
        normalized.container = None;
        normalized.docker_version = None;
        normalized.config.image = None;
        normalized.rootfs = RootFs {
            fs_type: "layers".to_string(),
            diff_ids: diff_ids.to_vec(),
        };
        normalized.history = diff_ids
            .iter()
            .map(|_| History {
                created: Some(normalized_date_time()),
                ..History::default()
            })
            .collect();
        normalized
    }
}

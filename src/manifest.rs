use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::error::FlashError;

/// A contiguous binary blob and the absolute flash address it is written to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub source_path: String,
    pub flash_offset: u32,
}

impl Segment {
    pub fn new(source_path: impl Into<String>, flash_offset: u32) -> Self {
        Self {
            source_path: source_path.into(),
            flash_offset,
        }
    }

    /// Last path component of the source, used in log lines.
    pub fn file_name(&self) -> &str {
        self.source_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.source_path)
    }
}

/// A named firmware image. Segment order is write order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareManifestEntry {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub segments: Vec<Segment>,
}

#[derive(Deserialize)]
struct ManifestDocument {
    name: String,
    version: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    builds: Vec<BuildDocument>,
}

#[derive(Deserialize)]
struct BuildDocument {
    #[serde(default)]
    parts: Vec<PartDocument>,
}

#[derive(Deserialize)]
struct PartDocument {
    path: String,
    offset: u32,
}

impl From<ManifestDocument> for FirmwareManifestEntry {
    fn from(doc: ManifestDocument) -> Self {
        // Only the first build is flashed; it describes the default chip family.
        let segments = doc
            .builds
            .into_iter()
            .next()
            .map(|build| {
                build
                    .parts
                    .into_iter()
                    .map(|part| Segment::new(part.path, part.offset))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: doc.name,
            version: doc.version,
            description: doc.description,
            segments,
        }
    }
}

/// Resolves selection keys to firmware manifest entries.
#[derive(Clone, Debug, Default)]
pub struct ManifestCatalog {
    entries: BTreeMap<String, FirmwareManifestEntry>,
}

impl ManifestCatalog {
    /// Parses a JSON object mapping selection keys to manifests in the
    /// `{ name, version, description, builds: [{ parts: [{ path, offset }] }] }`
    /// layout used by web flashing tools.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON or does not match the layout.
    pub fn from_json(json: &str) -> Result<Self> {
        let docs: BTreeMap<String, ManifestDocument> =
            serde_json::from_str(json).context("parse firmware manifest")?;

        let entries: BTreeMap<String, FirmwareManifestEntry> = docs
            .into_iter()
            .map(|(key, doc)| (key, doc.into()))
            .collect();
        debug!(entries = entries.len(), "Loaded firmware manifest");

        Ok(Self { entries })
    }

    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read firmware manifest {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("load {}", path.display()))
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: FirmwareManifestEntry) {
        self.entries.insert(key.into(), entry);
    }

    /// Looks up a selection key.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::InvalidSelection`] if no entry has that key.
    pub fn resolve(&self, key: &str) -> Result<&FirmwareManifestEntry, FlashError> {
        self.entries
            .get(key)
            .ok_or_else(|| FlashError::InvalidSelection(format!("no firmware named '{key}'")))
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FirmwareManifestEntry)> {
        self.entries.iter().map(|(key, entry)| (key.as_str(), entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

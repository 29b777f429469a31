use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::{HASH_FILE_NAME, MAPPING_FILE_NAME};
use crate::storage::{write_atomic, StorageError};

/// Extracted identifiers of one batch and the targets they belong to.
///
/// Identical targets produce identical identifiers, so one identifier may
/// map to several targets. The hash file lists each identifier once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashManifest {
    order: Vec<String>,
    targets: BTreeMap<String, Vec<String>>,
}

impl HashManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identifier: impl Into<String>, target_id: impl Into<String>) {
        let identifier = identifier.into();
        let target_id = target_id.into();

        let ids = self.targets.entry(identifier.clone()).or_insert_with(|| {
            self.order.push(identifier);
            Vec::new()
        });
        if !ids.contains(&target_id) {
            ids.push(target_id);
        }
    }

    /// Targets that produced `identifier`, if any.
    pub fn lookup(&self, identifier: &str) -> Option<&[String]> {
        self.targets.get(identifier).map(Vec::as_slice)
    }

    /// Distinct identifiers in insertion order.
    pub fn identifiers(&self) -> &[String] {
        &self.order
    }

    pub fn target_ids(&self) -> impl Iterator<Item = &str> {
        self.targets.values().flatten().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn hash_file(dir: &Path) -> PathBuf {
        dir.join(HASH_FILE_NAME)
    }

    pub fn mapping_file(dir: &Path) -> PathBuf {
        dir.join(MAPPING_FILE_NAME)
    }

    /// Writes the hash file and the mapping into `dir`.
    pub fn write(&self, dir: &Path) -> Result<(), StorageError> {
        let mut hashes = self.order.join("\n");
        hashes.push('\n');
        write_atomic(&Self::hash_file(dir), hashes.as_bytes())?;

        let mapping = serde_json::to_vec_pretty(&self.targets)?;
        write_atomic(&Self::mapping_file(dir), &mapping)?;

        debug!(dir = %dir.display(), identifiers = self.len(), "Manifest written");
        Ok(())
    }

    /// Loads a manifest written by [`write`](Self::write), if one exists.
    pub fn load(dir: &Path) -> Result<Option<Self>, StorageError> {
        let mapping_path = Self::mapping_file(dir);
        let hash_path = Self::hash_file(dir);
        if !mapping_path.exists() || !hash_path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&mapping_path).map_err(|e| StorageError::io(&mapping_path, e))?;
        let targets: BTreeMap<String, Vec<String>> = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::corrupt(&mapping_path, e))?;

        let hashes = fs::read_to_string(&hash_path).map_err(|e| StorageError::io(&hash_path, e))?;
        let order: Vec<String> = hashes
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        if order.len() != targets.len() || order.iter().any(|id| !targets.contains_key(id)) {
            return Err(StorageError::corrupt(
                &mapping_path,
                "hash file and mapping disagree",
            ));
        }

        Ok(Some(Self { order, targets }))
    }
}

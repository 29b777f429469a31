//! Targets are the files a batch works on.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DEFAULT_TARGET_EXTENSIONS;

/// A single file to recover a secret for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Stable identifier derived from the storage path
    pub id: String,
    pub path: PathBuf,
}

impl Target {
    /// Creates a target whose id is a UUIDv5 of its path.
    ///
    /// The same path always yields the same id, so a rescan of the same
    /// directory produces a target set a prior session can be matched against.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, path.to_string_lossy().as_bytes());
        Self {
            id: id.to_string(),
            path,
        }
    }

    /// Name of the directory holding the target (often the owning record's id).
    pub fn parent_name(&self) -> Option<&str> {
        self.path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
    }
}

/// Finds targets under `root`.
///
/// `root` may be a single file or a directory. Files are matched by
/// extension (case-insensitive) and returned sorted by path.
pub fn discover_targets(root: &Path, extensions: &[String]) -> Vec<Target> {
    let matches = |path: &Path| {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    };

    if root.is_file() {
        return if matches(root) {
            vec![Target::from_path(root)]
        } else {
            Vec::new()
        };
    }

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .build();

    let mut paths: Vec<PathBuf> = walker
        .flatten()
        .map(|entry| entry.into_path())
        .filter(|path| path.is_file() && matches(path))
        .collect();

    paths.sort();
    paths.into_iter().map(Target::from_path).collect()
}

/// Default keystore-like extensions as owned strings.
pub fn default_extensions() -> Vec<String> {
    DEFAULT_TARGET_EXTENSIONS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_id_is_stable_per_path() {
        let a = Target::from_path("/certs/one/apk.keystore");
        let b = Target::from_path("/certs/one/apk.keystore");
        let c = Target::from_path("/certs/two/apk.keystore");

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.parent_name(), Some("one"));
    }

    #[test]
    fn test_discover_filters_and_sorts() {
        let temp = TempDir::new().unwrap();
        for dir in ["b", "a", "c"] {
            fs::create_dir_all(temp.path().join(dir)).unwrap();
        }
        fs::write(temp.path().join("b/apk.keystore"), b"x").unwrap();
        fs::write(temp.path().join("a/release.JKS"), b"x").unwrap();
        fs::write(temp.path().join("c/notes.txt"), b"x").unwrap();

        let targets = discover_targets(temp.path(), &default_extensions());
        let names: Vec<_> = targets
            .iter()
            .map(|t| t.parent_name().unwrap().to_string())
            .collect();

        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_discover_single_file() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("store.p12");
        fs::write(&file, b"x").unwrap();

        let targets = discover_targets(&file, &default_extensions());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].path, file);
    }
}

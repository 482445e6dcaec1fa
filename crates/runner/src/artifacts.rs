#![forbid(unsafe_code)]

use cx_core::{ArtifactRef, ArtifactStore};
use std::path::{Path, PathBuf};

/// Checks artifacts on the local filesystem. Relative refs resolve against
/// `root`; remote URLs are assumed reachable.
#[derive(Clone, Debug, Default)]
pub(crate) struct FsArtifactStore {
    root: Option<PathBuf>,
}

impl FsArtifactStore {
    pub(crate) fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn is_retrievable(&self, artifact: &ArtifactRef) -> bool {
        let raw = artifact.as_str().trim();
        if raw.is_empty() {
            return false;
        }
        if raw.starts_with("https://") || raw.starts_with("http://") {
            return true;
        }
        let raw = raw.strip_prefix("file://").unwrap_or(raw);
        std::fs::metadata(self.resolve(raw))
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    }
}

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_STORE_DIRNAME: &str = ".cx";
pub(crate) const DEFAULT_CONFIG_FILENAME: &str = "cx.toml";

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let git = current.join(".git");
        if git.exists() {
            return Some(current);
        }
        if !current.pop() {
            return None;
        }
    }
}

fn project_root(start: &Path) -> PathBuf {
    find_repo_root(start).unwrap_or_else(|| start.to_path_buf())
}

/// Store location when neither `--storage-dir` nor `CX_STORAGE_DIR` is given:
/// the repository root, never the subdirectory the runner was started from.
pub(crate) fn default_storage_dir_from_start(start: &Path) -> PathBuf {
    project_root(start).join(DEFAULT_STORE_DIRNAME)
}

/// `cx.toml` at the project root, if present.
pub(crate) fn default_config_from_start(start: &Path) -> Option<PathBuf> {
    let candidate = project_root(start).join(DEFAULT_CONFIG_FILENAME);
    candidate.is_file().then_some(candidate)
}

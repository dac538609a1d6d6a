//! Jail directories: one isolated filesystem root per worker, under a shared
//! child root. The master only links documents in and out of them and removes
//! them on shutdown; building them is the broker's job.

use std::io;
use std::path::{Component, Path, PathBuf};

/// Where documents live inside a jail.
pub const JAIL_DOCUMENT_DIR: &str = "/user/docs";

/// Subdirectory of the document dir that receives inserted files.
pub const INSERT_FILE_DIR: &str = "insertfile";

const FILE_URL_PREFIX: &str = "file://";

#[derive(Debug, thiserror::Error)]
pub enum JailError {
    #[error("invalid path component: {0:?}")]
    InvalidComponent(String),
    #[error("not a local file url: {0}")]
    NotLocal(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Accepts a single plain path component (no separators, no `..`).
pub fn safe_component(name: &str) -> Result<&str, JailError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(JailError::InvalidComponent(name.to_string())),
    }
}

/// Root directory holding all worker jails.
#[derive(Debug, Clone)]
pub struct Jail {
    root: PathBuf,
}

impl Jail {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<root>/<worker-id>`
    pub fn worker_root(&self, worker_id: &str) -> Result<PathBuf, JailError> {
        Ok(self.root.join(safe_component(worker_id)?))
    }

    /// `<root>/<worker-id>/user/docs`
    pub fn document_dir(&self, worker_id: &str) -> Result<PathBuf, JailError> {
        Ok(self
            .worker_root(worker_id)?
            .join(JAIL_DOCUMENT_DIR.trim_start_matches('/')))
    }

    /// Make a host file visible inside a worker's jail.
    ///
    /// Hard-links the file into the jail's document dir (copying when the
    /// link fails, e.g. across filesystems) and returns the jail-relative url.
    pub fn localize(&self, worker_id: &str, host_path: &Path) -> Result<String, JailError> {
        let name = host_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| JailError::InvalidComponent(host_path.display().to_string()))?;

        let dir = self.document_dir(worker_id)?;
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(name);
        if target.exists() {
            std::fs::remove_file(&target)?;
        }
        if let Err(e) = std::fs::hard_link(host_path, &target) {
            tracing::debug!(error = %e, path = %host_path.display(), "hard link failed, copying");
            std::fs::copy(host_path, &target)?;
        }

        Ok(format!(
            "{FILE_URL_PREFIX}{JAIL_DOCUMENT_DIR}/{}",
            urlencoding::encode(name)
        ))
    }

    /// Translate a jail-relative `file://` url back to a host path.
    pub fn resolve_url(&self, worker_id: &str, url: &str) -> Result<PathBuf, JailError> {
        let encoded = url
            .strip_prefix(FILE_URL_PREFIX)
            .ok_or_else(|| JailError::NotLocal(url.to_string()))?;
        let path = urlencoding::decode(encoded)
            .map_err(|_| JailError::InvalidComponent(encoded.to_string()))?;

        let mut resolved = self.worker_root(worker_id)?;
        for component in Path::new(path.as_ref()).components() {
            match component {
                Component::RootDir => {}
                Component::Normal(part) => resolved.push(part),
                _ => return Err(JailError::InvalidComponent(path.to_string())),
            }
        }
        Ok(resolved)
    }

    /// Move a staged upload to `<root>/<child-id>/user/docs/insertfile/<name>`.
    pub fn insert_file(
        &self,
        child_id: &str,
        name: &str,
        staged: &Path,
    ) -> Result<PathBuf, JailError> {
        let dir = self.document_dir(child_id)?.join(INSERT_FILE_DIR);
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(safe_component(name)?);
        if std::fs::rename(staged, &target).is_err() {
            std::fs::copy(staged, &target)?;
            std::fs::remove_file(staged)?;
        }
        Ok(target)
    }

    /// Directory and file path for a download request.
    pub fn download_paths(
        &self,
        worker_id: &str,
        dir: &str,
        file_name: &str,
    ) -> Result<(PathBuf, PathBuf), JailError> {
        let dir_path = self.document_dir(worker_id)?.join(safe_component(dir)?);
        let file_path = dir_path.join(safe_component(file_name)?);
        Ok((dir_path, file_path))
    }

    /// Remove every jail below the root. Returns how many entries were removed.
    pub fn clean_all(&self) -> usize {
        tracing::info!(root = %self.root.display(), "Cleaning up child root directory");
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(root = %self.root.display(), error = %e, "Cannot list child root");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            tracing::info!(jail = %path.display(), "Removing jail");
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(jail = %path.display(), error = %e, "Failed to remove jail")
                }
            }
        }
        removed
    }
}

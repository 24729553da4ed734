//! Project-scoped file access.
//!
//! Every project owns a root directory and callers address files by a path
//! relative to that root. [`ProjectFileGuard`] turns the relative path into an
//! absolute one and refuses anything that would land outside the root, either
//! lexically (`..`, absolute paths) or through a symlink. A refused path and a
//! missing file both come back as [`FileGuardError::NotFound`] so callers
//! cannot probe the layout around a project.

use std::{
    ffi::OsStr,
    io,
    path::{Component, Path, PathBuf},
};

use tokio::fs;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FileGuardError {
    #[error("file not found")]
    NotFound,
    #[error("project file i/o failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug)]
pub struct ProjectFileGuard {
    root: PathBuf,
}

impl ProjectFileGuard {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root directory. Returns true when it did not exist yet,
    /// which makes the project the owner of the directory.
    pub async fn create_root(&self) -> Result<bool, FileGuardError> {
        let existed = fs::try_exists(&self.root).await?;
        fs::create_dir_all(&self.root).await?;
        Ok(!existed)
    }

    /// Resolves `requested` below the project root.
    ///
    /// The target does not need to exist, but its deepest existing ancestor
    /// must canonicalize to a location inside the root.
    pub async fn resolve(&self, requested: &str) -> Result<PathBuf, FileGuardError> {
        let relative = normalize_relative(requested).ok_or(FileGuardError::NotFound)?;
        let root = fs::canonicalize(&self.root)
            .await
            .map_err(|_| FileGuardError::NotFound)?;
        let candidate = root.join(&relative);

        let mut existing = candidate.as_path();
        while fs::symlink_metadata(existing).await.is_err() {
            existing = existing.parent().ok_or(FileGuardError::NotFound)?;
        }
        let anchored = fs::canonicalize(existing)
            .await
            .map_err(|_| FileGuardError::NotFound)?;
        if !anchored.starts_with(&root) {
            debug!(
                "rejected project path escaping root requested={requested} root={}",
                root.display()
            );
            return Err(FileGuardError::NotFound);
        }
        let remainder = candidate
            .strip_prefix(existing)
            .map_err(|_| FileGuardError::NotFound)?;
        Ok(anchored.join(remainder))
    }

    pub async fn read(&self, requested: &str) -> Result<Vec<u8>, FileGuardError> {
        let path = self.resolve(requested).await?;
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Err(FileGuardError::NotFound),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(FileGuardError::NotFound);
            }
            Err(err) => return Err(err.into()),
        }
        fs::read(&path).await.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => FileGuardError::NotFound,
            _ => FileGuardError::Io(err),
        })
    }

    /// Creates or replaces the file, creating missing parent directories.
    /// The project root itself is never created here.
    pub async fn write(&self, requested: &str, contents: &[u8]) -> Result<(), FileGuardError> {
        let path = self.resolve(requested).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, contents).await?;
        Ok(())
    }
}

fn normalize_relative(requested: &str) -> Option<PathBuf> {
    if requested.is_empty() || requested.contains('\0') {
        return None;
    }
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in Path::new(requested).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.into_iter().collect())
}

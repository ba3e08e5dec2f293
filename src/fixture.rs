//! Fixture storage.
//!
//! Resolves a file name against a base directory and returns the file's
//! content verbatim. Files are read fresh on every call since the test
//! harness may rewrite them between requests.

use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Errors produced while reading a fixture.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// No file with that name exists in the base directory.
    #[error("fixture not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// The file exists but could not be read as text.
    #[error("failed to read fixture {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The name escapes the base directory or is empty.
    #[error("invalid fixture name: {name:?}")]
    InvalidName { name: String },
}

/// Read-only view over a directory of fixture files.
#[derive(Debug, Clone)]
pub struct FixtureStore {
    base_dir: PathBuf,
}

impl FixtureStore {
    /// Create a store rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Read the entire content of `name`.
    pub async fn read(&self, name: &str) -> Result<String, FixtureError> {
        let path = self.resolve(name)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(FixtureError::NotFound { path }),
            Err(source) => Err(FixtureError::Io { path, source }),
        }
    }

    /// Join `name` onto the base directory, refusing anything that is not
    /// a plain relative path.
    fn resolve(&self, name: &str) -> Result<PathBuf, FixtureError> {
        let relative = Path::new(name);
        let plain = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !plain {
            return Err(FixtureError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(self.base_dir.join(relative))
    }
}

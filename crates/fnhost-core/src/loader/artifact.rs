//! Artifact files: versions and openers.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::UNIX_EPOCH;

use parking_lot::RwLock;
use serde::Serialize;

use super::types::ModuleImage;
use crate::error::{Error, Result};

/// Version marker of an artifact: its modification time in milliseconds.
///
/// Two writes within the same millisecond are indistinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ArtifactVersion(u64);

impl ArtifactVersion {
    /// Read the current version of the artifact at `path`.
    ///
    /// Fails with [`Error::ArtifactNotFound`] if the path is missing, runs
    /// through a non-directory, or is not a regular file. Other I/O failures
    /// come back as [`Error::Io`].
    pub fn read(path: &Path) -> Result<Self> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                return Err(Error::ArtifactNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        if !meta.is_file() {
            return Err(Error::ArtifactNotFound(path.to_path_buf()));
        }
        let millis = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self(millis))
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

/// Turns an artifact file into a module image.
///
/// Implementations must return a fresh, independent image on every call:
/// two loaders opened from the same path must not share mutable state.
pub trait ArtifactOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<ModuleImage>;

    /// Short name used in logs.
    fn kind(&self) -> &'static str {
        "artifact"
    }
}

/// Modules compiled into the host binary, addressed by artifact path.
///
/// The file on disk still has to exist; it supplies the version used for
/// staleness checks. Useful for built-in functions and for tests.
#[derive(Default)]
pub struct RegistryOpener {
    modules: RwLock<HashMap<PathBuf, ModuleImage>>,
    opens: AtomicUsize,
}

impl RegistryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(self, path: impl Into<PathBuf>, image: ModuleImage) -> Self {
        self.register(path, image);
        self
    }

    /// Register (or replace) the image served for `path`.
    pub fn register(&self, path: impl Into<PathBuf>, image: ModuleImage) {
        self.modules.write().insert(path.into(), image);
    }

    pub fn unregister(&self, path: &Path) -> Option<ModuleImage> {
        self.modules.write().remove(path)
    }

    /// Number of successful `open` calls so far.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

impl ArtifactOpener for RegistryOpener {
    fn open(&self, path: &Path) -> Result<ModuleImage> {
        if !path.is_file() {
            return Err(Error::ArtifactNotFound(path.to_path_buf()));
        }
        let image = self.modules.read().get(path).cloned().ok_or_else(|| {
            Error::Configuration(format!("no module registered for {}", path.display()))
        })?;
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(image)
    }

    fn kind(&self) -> &'static str {
        "registry"
    }
}

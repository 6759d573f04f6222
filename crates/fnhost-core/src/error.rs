//! Error types for fnhost-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::execute::FailureClass;

/// Result type for fnhost-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fnhost-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Artifact file does not exist or is not a regular file.
    #[error("artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    /// Invalid runtime or artifact configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Entry type is neither in the artifact nor in the host context.
    #[error("type not found: {0}")]
    TypeNotFound(String),

    /// Type was found but could not be resolved (missing interface, cycle, reserved namespace).
    #[error("cannot resolve {name}: {message}")]
    Resolution { name: String, message: String },

    /// Entry type does not implement the function contract.
    #[error("{name} does not implement {contract}")]
    ContractMismatch { name: String, contract: String },

    /// Entry type has no default constructor.
    #[error("{0} has no default constructor")]
    NoDefaultConstructor(String),

    /// Constructor ran and failed.
    #[error("failed to instantiate {name}: {message}")]
    Instantiation { name: String, message: String },

    /// Loader was closed before or during use.
    #[error("loader for {} is closed", .0.display())]
    LoaderClosed(PathBuf),

    /// Failed to load dynamic library.
    #[error("failed to load library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// Artifact was built against another ABI version.
    #[error("artifact ABI version {found} does not match host ABI version {expected}")]
    AbiMismatch { expected: u32, found: u32 },

    /// Artifact manifest could not be read or decoded.
    #[error("invalid artifact manifest: {0}")]
    Manifest(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Component is shut down and accepts no more work.
    #[error("runtime is shut down")]
    ShutDown,

    /// Invocation was cancelled before it started.
    #[error("execution aborted")]
    Aborted,
}

impl Error {
    /// Map this error onto the execution failure taxonomy.
    ///
    /// Returns the failure class and the kebab-case kind reported in
    /// execution results.
    pub fn classify(&self) -> (FailureClass, &'static str) {
        match self {
            Error::ArtifactNotFound(_) => (FailureClass::Configuration, "artifact-not-found"),
            Error::Configuration(_) => (FailureClass::Configuration, "configuration"),
            Error::ContractMismatch { .. } => (FailureClass::Configuration, "contract-mismatch"),
            Error::AbiMismatch { .. } => (FailureClass::Configuration, "abi-mismatch"),
            Error::Manifest(_) => (FailureClass::Configuration, "invalid-manifest"),
            Error::LibraryLoad(_) => (FailureClass::Configuration, "artifact-unloadable"),
            Error::TypeNotFound(_) => (FailureClass::Resolution, "type-not-found"),
            Error::Resolution { .. } => (FailureClass::Resolution, "resolution-failed"),
            Error::NoDefaultConstructor(_) => {
                (FailureClass::Instantiation, "no-default-constructor")
            }
            Error::Instantiation { .. } => (FailureClass::Instantiation, "constructor-failed"),
            Error::LoaderClosed(_) => (FailureClass::Infrastructure, "loader-closed"),
            Error::Io(_) => (FailureClass::Infrastructure, "io"),
            Error::ShutDown => (FailureClass::Infrastructure, "shut-down"),
            Error::Aborted => (FailureClass::Infrastructure, "cancelled"),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

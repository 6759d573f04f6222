//! Isolated loaders: one private symbol namespace per artifact.
//!
//! # Resolution order
//!
//! [`IsolatedLoader::resolve`] walks an explicit chain and stops at the first
//! tier that answers:
//!
//! 1. names this loader already resolved (cache)
//! 2. contract namespace, always from the [`HostContext`]
//! 3. platform namespaces, always from the host
//! 4. shared marshaling namespaces, always from the host
//! 5. the loader's own artifact image
//! 6. the host, as a fallback for libraries the artifact does not bundle
//!
//! Tiers 2-4 never consult the artifact, so an artifact cannot shadow the
//! function contract with a private copy.
//!
//! # Module Structure
//!
//! - `artifact` - artifact versions and the `ArtifactOpener` trait
//! - `dylib` - native artifacts via libloading
//! - `host` - the shared parent context and namespace policy
//! - `types` - declared and resolved types

mod artifact;
mod dylib;
mod host;
mod types;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fnhost_guest::FUNCTION_CONTRACT;
use parking_lot::Mutex;

pub use artifact::{ArtifactOpener, ArtifactVersion, RegistryOpener};
pub use dylib::DylibOpener;
pub use host::{HostContext, HostContextBuilder, Namespace, NamespacePolicy};
pub use types::{Constructor, LoaderId, ModuleImage, TypeDef, TypeOrigin, TypeRef};

use crate::error::{Error, Result};

static NEXT_LOADER_ID: AtomicU64 = AtomicU64::new(1);

/// Tier of the resolution chain that answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Cache,
    Contract,
    Platform,
    Shared,
    Artifact,
    Parent,
}

struct LoaderState {
    /// `None` once closed.
    image: Option<ModuleImage>,
    cache: HashMap<String, TypeRef>,
}

/// Private resolution context for one artifact.
///
/// All resolution on one loader is serialized by a single lock held across
/// the whole lookup, so resolving the same name twice yields the identical
/// [`TypeRef`] even under concurrent first access.
pub struct IsolatedLoader {
    id: LoaderId,
    artifact_path: PathBuf,
    host: Arc<HostContext>,
    state: Mutex<LoaderState>,
    closed: AtomicBool,
}

impl IsolatedLoader {
    /// Open the artifact at `path` and wrap it in a new loader.
    pub fn open(
        path: impl Into<PathBuf>,
        opener: &dyn ArtifactOpener,
        host: Arc<HostContext>,
    ) -> Result<Self> {
        let path = path.into();
        let image = opener.open(&path)?;
        let loader = Self::from_image(path, image, host);
        tracing::debug!(
            "Opened {} ({} artifact, {} types) as {}",
            loader.artifact_path.display(),
            opener.kind(),
            loader.state.lock().image.as_ref().map_or(0, ModuleImage::len),
            loader.id
        );
        Ok(loader)
    }

    /// Wrap an already opened image.
    pub fn from_image(path: impl Into<PathBuf>, image: ModuleImage, host: Arc<HostContext>) -> Self {
        Self {
            id: LoaderId(NEXT_LOADER_ID.fetch_add(1, Ordering::Relaxed)),
            artifact_path: path.into(),
            host,
            state: Mutex::new(LoaderState {
                image: Some(image),
                cache: HashMap::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve a fully qualified type name.
    pub fn resolve(&self, name: &str) -> Result<TypeRef> {
        self.resolve_with_source(name).map(|(ty, _)| ty)
    }

    /// Resolve a name and report which tier answered.
    pub fn resolve_with_source(&self, name: &str) -> Result<(TypeRef, ResolutionSource)> {
        let mut state = self.state.lock();
        if state.image.is_none() {
            return Err(Error::LoaderClosed(self.artifact_path.clone()));
        }
        let mut visiting = Vec::new();
        let resolved = self.resolve_locked(&mut state, name, &mut visiting)?;
        tracing::debug!("{} resolved {} via {:?}", self.id, name, resolved.1);
        Ok(resolved)
    }

    /// The function contract as seen through this loader.
    ///
    /// Always the host's canonical type.
    pub fn function_contract(&self) -> Result<TypeRef> {
        self.resolve(FUNCTION_CONTRACT)
    }

    /// Names the artifact itself declares, sorted.
    pub fn declared_types(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        let image = state
            .image
            .as_ref()
            .ok_or_else(|| Error::LoaderClosed(self.artifact_path.clone()))?;
        Ok(image.type_names().into_iter().map(String::from).collect())
    }

    /// Release the artifact image and drop the resolution cache.
    ///
    /// Idempotent. Instances created earlier stay valid: they keep their own
    /// reference to whatever backs their code.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        state.image = None;
        state.cache.clear();
        tracing::debug!("Closed {} for {}", self.id, self.artifact_path.display());
    }

    fn resolve_locked(
        &self,
        state: &mut LoaderState,
        name: &str,
        visiting: &mut Vec<String>,
    ) -> Result<(TypeRef, ResolutionSource)> {
        if let Some(ty) = state.cache.get(name) {
            return Ok((ty.clone(), ResolutionSource::Cache));
        }

        let delegated = match self.host.policy().classify(name) {
            Namespace::Contract => Some(ResolutionSource::Contract),
            Namespace::Platform => Some(ResolutionSource::Platform),
            Namespace::Shared => Some(ResolutionSource::Shared),
            Namespace::Private => None,
        };
        if let Some(source) = delegated {
            let ty = self
                .host
                .lookup(name)
                .ok_or_else(|| Error::TypeNotFound(name.to_string()))?;
            state.cache.insert(name.to_string(), ty.clone());
            return Ok((ty, source));
        }

        let def = state.image.as_ref().and_then(|image| image.get(name)).cloned();
        if let Some(def) = def {
            if visiting.iter().any(|v| v == name) {
                return Err(Error::Resolution {
                    name: name.to_string(),
                    message: format!("circular interface chain: {}", visiting.join(" -> ")),
                });
            }
            visiting.push(name.to_string());
            let mut interfaces = Vec::with_capacity(def.interfaces().len());
            for interface in def.interfaces() {
                let resolved = self
                    .resolve_locked(state, interface, visiting)
                    .map_err(|e| match e {
                        Error::TypeNotFound(missing) => Error::Resolution {
                            name: name.to_string(),
                            message: format!("interface {missing} not found"),
                        },
                        other => other,
                    })?;
                interfaces.push(resolved.0);
            }
            visiting.pop();

            let ty = TypeRef::define(
                name,
                TypeOrigin::Artifact(self.id),
                interfaces,
                def.constructor(),
            );
            state.cache.insert(name.to_string(), ty.clone());
            return Ok((ty, ResolutionSource::Artifact));
        }

        let ty = self
            .host
            .lookup(name)
            .ok_or_else(|| Error::TypeNotFound(name.to_string()))?;
        state.cache.insert(name.to_string(), ty.clone());
        Ok((ty, ResolutionSource::Parent))
    }
}

impl fmt::Debug for IsolatedLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedLoader")
            .field("id", &self.id)
            .field("artifact_path", &self.artifact_path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Value, handler_fn};
    use std::thread;

    fn image() -> ModuleImage {
        ModuleImage::new()
            .with_type(TypeDef::function("hello.Hello", || {
                handler_fn(|_input, _ctx| Ok(Value::from("hi")))
            }))
            .with_type(TypeDef::new("hello.Helper"))
            // A private look-alike of the contract; never consulted.
            .with_type(TypeDef::new(FUNCTION_CONTRACT))
            .with_type(TypeDef::new("std.String"))
            .with_type(TypeDef::new("loop.A").implements("loop.B"))
            .with_type(TypeDef::new("loop.B").implements("loop.A"))
            .with_type(TypeDef::new("broken.Type").implements("broken.Missing"))
    }

    fn host() -> Arc<HostContext> {
        Arc::new(
            HostContext::builder()
                .provide(TypeDef::new("host.Greeter"))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_same_name_twice_is_same_type() {
        let loader = IsolatedLoader::from_image("/fn/hello.pkg", image(), host());
        let (first, source) = loader.resolve_with_source("hello.Hello").unwrap();
        assert_eq!(source, ResolutionSource::Artifact);
        let (second, source) = loader.resolve_with_source("hello.Hello").unwrap();
        assert_eq!(source, ResolutionSource::Cache);
        assert!(first.is_same(&second));
        assert_eq!(first.origin(), TypeOrigin::Artifact(loader.id()));
    }

    #[test]
    fn test_two_loaders_yield_distinct_private_types() {
        let host = host();
        let a = IsolatedLoader::from_image("/fn/hello.pkg", image(), host.clone());
        let b = IsolatedLoader::from_image("/fn/hello.pkg", image(), host.clone());
        assert_ne!(a.id(), b.id());

        let ta = a.resolve("hello.Hello").unwrap();
        let tb = b.resolve("hello.Hello").unwrap();
        assert!(!ta.is_same(&tb));

        // The contract is shared across the boundary.
        let ca = a.function_contract().unwrap();
        let cb = b.function_contract().unwrap();
        assert!(ca.is_same(&cb));
        assert!(ca.is_same(host.function_contract()));
        assert!(ta.implements(&ca));
        assert!(tb.implements(&ca));
    }

    #[test]
    fn test_reserved_namespaces_delegate_to_host() {
        let loader = IsolatedLoader::from_image("/fn/hello.pkg", image(), host());
        let (contract, source) = loader.resolve_with_source(FUNCTION_CONTRACT).unwrap();
        assert_eq!(source, ResolutionSource::Contract);
        assert_eq!(contract.origin(), TypeOrigin::Contract);

        // Declared by the artifact, but platform names never resolve there.
        assert!(matches!(
            loader.resolve("std.String"),
            Err(Error::TypeNotFound(_))
        ));
    }

    #[test]
    fn test_parent_fallback_and_not_found() {
        let loader = IsolatedLoader::from_image("/fn/hello.pkg", image(), host());
        let (greeter, source) = loader.resolve_with_source("host.Greeter").unwrap();
        assert_eq!(source, ResolutionSource::Parent);
        assert_eq!(greeter.origin(), TypeOrigin::Host);

        assert!(matches!(
            loader.resolve("hello.Missing"),
            Err(Error::TypeNotFound(name)) if name == "hello.Missing"
        ));
    }

    #[test]
    fn test_interface_failures() {
        let loader = IsolatedLoader::from_image("/fn/hello.pkg", image(), host());
        assert!(matches!(
            loader.resolve("loop.A"),
            Err(Error::Resolution { .. })
        ));
        match loader.resolve("broken.Type") {
            Err(Error::Resolution { message, .. }) => assert!(message.contains("broken.Missing")),
            other => panic!("unexpected: {other:?}"),
        }
        // A failed resolution leaves the loader usable.
        assert!(loader.resolve("hello.Helper").is_ok());
    }

    #[test]
    fn test_close_forbids_resolution() {
        let loader = IsolatedLoader::from_image("/fn/hello.pkg", image(), host());
        loader.resolve("hello.Hello").unwrap();
        loader.close();
        loader.close();
        assert!(loader.is_closed());
        assert!(matches!(
            loader.resolve("hello.Hello"),
            Err(Error::LoaderClosed(_))
        ));
        assert!(matches!(loader.declared_types(), Err(Error::LoaderClosed(_))));
    }

    #[test]
    fn test_concurrent_first_resolution_converges() {
        let loader = Arc::new(IsolatedLoader::from_image("/fn/hello.pkg", image(), host()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let loader = loader.clone();
                thread::spawn(move || loader.resolve("hello.Hello").unwrap())
            })
            .collect();
        let types: Vec<TypeRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(types.windows(2).all(|w| w[0].is_same(&w[1])));
    }
}

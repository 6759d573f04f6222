//! Native function artifacts loaded via libloading.
//!
//! An artifact is a cdylib built with `fnhost_guest::export_functions!`.
//! `dlopen` hands back the already-loaded handle when the same file is opened
//! twice, which would make two loaders share one symbol namespace. Every open
//! therefore loads a uniquely named shadow copy of the artifact instead:
//!
//! 1. Copy the artifact to `<scratch>/<stem>-<uuid>.<ext>`
//! 2. Load the copy, check the ABI version, read the manifest
//! 3. Delete the copy once the library is unloaded
//!
//! This also lets a deployment overwrite the original file while older
//! versions are still executing.

use std::any::Any;
use std::ffi::c_void;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use fnhost_guest::abi::{
    AbiVersionFn, DropFn, FreeFn, HandleFn, ManifestFn, NewFn, ResultCode, SYM_ABI_VERSION,
    SYM_DROP, SYM_FREE, SYM_HANDLE, SYM_MANIFEST, SYM_NEW,
};
use fnhost_guest::{ABI_VERSION, GuestError, Manifest, WireContext};
use libloading::{Library, Symbol};
use uuid::Uuid;

use super::artifact::ArtifactOpener;
use super::types::{ModuleImage, TypeDef};
use crate::context::{ExecutionContext, FunctionHandler, HandlerError, Input, Value};
use crate::error::{Error, Result};

/// Opens native artifacts from shadow copies under a scratch directory.
#[derive(Debug, Clone)]
pub struct DylibOpener {
    scratch_dir: PathBuf,
}

impl DylibOpener {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }
}

impl Default for DylibOpener {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("fnhost-shadow"))
    }
}

impl ArtifactOpener for DylibOpener {
    fn open(&self, path: &Path) -> Result<ModuleImage> {
        if !path.is_file() {
            return Err(Error::ArtifactNotFound(path.to_path_buf()));
        }

        let shadow = ShadowCopy::create(&self.scratch_dir, path)?;
        let library = unsafe { Library::new(&shadow.path) }?;
        let module = Arc::new(DylibModule::bind(library, shadow)?);
        let manifest = module.manifest()?;

        if manifest.abi_version != ABI_VERSION {
            return Err(Error::AbiMismatch {
                expected: ABI_VERSION,
                found: manifest.abi_version,
            });
        }

        let mut image = ModuleImage::new();
        for declared in manifest.types {
            let mut def = TypeDef::new(&declared.name);
            for interface in declared.interfaces {
                def = def.implements(interface);
            }
            let module = module.clone();
            let index = declared.index;
            def = def.with_constructor(move || {
                let ptr = unsafe { (module.new_fn)(index) };
                if ptr.is_null() {
                    return Err(format!("artifact constructor #{index} returned null"));
                }
                Ok(Box::new(DylibInstance {
                    module: module.clone(),
                    ptr,
                }) as Box<dyn FunctionHandler>)
            });
            image.insert(def);
        }

        tracing::debug!(
            "Loaded {} from shadow copy {} ({} types)",
            path.display(),
            module.shadow.path.display(),
            image.len()
        );

        Ok(image.with_resource(module as Arc<dyn Any + Send + Sync>))
    }

    fn kind(&self) -> &'static str {
        "dylib"
    }
}

/// Uniquely named copy of an artifact, removed on drop.
struct ShadowCopy {
    path: PathBuf,
}

impl ShadowCopy {
    fn create(scratch_dir: &Path, original: &Path) -> io::Result<Self> {
        fs::create_dir_all(scratch_dir)?;

        let stem = original
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("artifact");
        let file_name = match original.extension().and_then(|s| s.to_str()) {
            Some(ext) => format!("{}-{}.{}", stem, Uuid::new_v4(), ext),
            None => format!("{}-{}", stem, Uuid::new_v4()),
        };
        let path = scratch_dir.join(file_name);
        fs::copy(original, &path)?;
        Ok(Self { path })
    }
}

impl Drop for ShadowCopy {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::debug!("Failed to remove shadow copy {}: {}", self.path.display(), e);
        }
    }
}

/// A loaded artifact and its ABI entry points.
///
/// Field order matters: the library is unloaded before the shadow copy is
/// deleted.
struct DylibModule {
    manifest_fn: ManifestFn,
    new_fn: NewFn,
    handle_fn: HandleFn,
    drop_fn: DropFn,
    free_fn: FreeFn,
    _library: Library,
    shadow: ShadowCopy,
}

impl DylibModule {
    fn bind(library: Library, shadow: ShadowCopy) -> Result<Self> {
        // SAFETY: the symbol types are the ABI published by fnhost-guest. The
        // copied fn pointers stay valid while `_library` is alive, which is
        // as long as this struct.
        unsafe {
            let found = {
                let abi_version: Symbol<AbiVersionFn> = library.get(SYM_ABI_VERSION)?;
                abi_version()
            };
            if found != ABI_VERSION {
                return Err(Error::AbiMismatch {
                    expected: ABI_VERSION,
                    found,
                });
            }

            let manifest_fn = *library.get::<ManifestFn>(SYM_MANIFEST)?;
            let new_fn = *library.get::<NewFn>(SYM_NEW)?;
            let handle_fn = *library.get::<HandleFn>(SYM_HANDLE)?;
            let drop_fn = *library.get::<DropFn>(SYM_DROP)?;
            let free_fn = *library.get::<FreeFn>(SYM_FREE)?;

            Ok(Self {
                manifest_fn,
                new_fn,
                handle_fn,
                drop_fn,
                free_fn,
                _library: library,
                shadow,
            })
        }
    }

    fn manifest(&self) -> Result<Manifest> {
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let code = unsafe { (self.manifest_fn)(&mut out_ptr, &mut out_len) };
        let out = FfiBuffer::new(out_ptr, out_len, self.free_fn);

        if ResultCode::from(code) != ResultCode::Success {
            return Err(Error::Manifest(out.lossy()));
        }
        serde_json::from_slice(out.as_slice()).map_err(|e| Error::Manifest(e.to_string()))
    }
}

/// RAII guard for buffers allocated by the guest.
///
/// Ensures `fnhost_free` is called even if decoding panics.
struct FfiBuffer {
    ptr: *mut u8,
    len: usize,
    free: FreeFn,
}

impl FfiBuffer {
    fn new(ptr: *mut u8, len: usize, free: FreeFn) -> Self {
        Self { ptr, len, free }
    }

    fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }
    }

    fn lossy(&self) -> String {
        String::from_utf8_lossy(self.as_slice()).into_owned()
    }
}

impl Drop for FfiBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { (self.free)(self.ptr, self.len) };
        }
    }
}

/// One guest instance. Holds the module so the code outlives a loader close.
struct DylibInstance {
    module: Arc<DylibModule>,
    ptr: *mut c_void,
}

// SAFETY: the instance pointer is only ever used by the thread that owns the
// `DylibInstance`; guest types are `Send` by the `GuestFunction` bound.
unsafe impl Send for DylibInstance {}

impl FunctionHandler for DylibInstance {
    fn handle(
        &mut self,
        input: Input,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Value, HandlerError> {
        let input_bytes = serde_json::to_vec(&input)
            .map_err(|e| HandlerError::new("encode", format!("cannot encode input: {e}")))?;
        let wire = WireContext {
            request_id: ctx.request_id().to_string(),
            timeout_ms: ctx.timeout().as_millis() as u64,
        };
        let ctx_bytes = serde_json::to_vec(&wire)
            .map_err(|e| HandlerError::new("encode", format!("cannot encode context: {e}")))?;
        let cancel: *const AtomicBool = ctx.abort_handle().flag();

        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: usize = 0;
        let code = unsafe {
            (self.module.handle_fn)(
                self.ptr,
                input_bytes.as_ptr(),
                input_bytes.len(),
                ctx_bytes.as_ptr(),
                ctx_bytes.len(),
                cancel,
                &mut out_ptr,
                &mut out_len,
            )
        };
        let out = FfiBuffer::new(out_ptr, out_len, self.module.free_fn);

        match ResultCode::from(code) {
            ResultCode::Success => serde_json::from_slice(out.as_slice())
                .map_err(|e| HandlerError::new("decode", format!("cannot decode result: {e}"))),
            ResultCode::HandlerError => Err(serde_json::from_slice::<GuestError>(out.as_slice())
                .map(HandlerError::from)
                .unwrap_or_else(|_| HandlerError::new("guest-error", out.lossy()))),
            ResultCode::Panic => Err(HandlerError::new("panic", out.lossy())),
            ResultCode::DecodeError => Err(HandlerError::new("abi-decode", out.lossy())),
            ResultCode::EncodeError => Err(HandlerError::new("abi-encode", out.lossy())),
            ResultCode::BadInstance => Err(HandlerError::new("bad-instance", out.lossy())),
        }
    }
}

impl Drop for DylibInstance {
    fn drop(&mut self) {
        unsafe { (self.module.drop_fn)(self.ptr) };
    }
}

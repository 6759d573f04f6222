//! Runtime support for [`export_functions!`](crate::export_functions).
//!
//! Everything here runs inside the guest artifact. Panics never cross the
//! `extern "C"` boundary: each entry point catches them and reports a code.

use std::any::Any;
use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::AtomicBool;

use crate::abi::ResultCode;
use crate::{
    ABI_VERSION, FUNCTION_CONTRACT, GuestContext, GuestFunction, Input, Manifest, ManifestType,
    WireContext,
};

/// Instance representation behind the opaque pointer.
type Instance = Box<dyn GuestFunction>;

/// Generate the C ABI for a list of function types.
///
/// Each type must implement [`GuestFunction`] and `Default`. Types are
/// indexed in declaration order.
#[macro_export]
macro_rules! export_functions {
    ($($name:literal => $ty:ty),+ $(,)?) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn fnhost_abi_version() -> u32 {
            $crate::ABI_VERSION
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn fnhost_manifest(out_ptr: *mut *mut u8, out_len: *mut usize) -> i32 {
            unsafe { $crate::__private::write_manifest(&[$($name),+], out_ptr, out_len) }
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn fnhost_new(index: u32) -> *mut ::std::ffi::c_void {
            let constructors: &[fn() -> *mut ::std::ffi::c_void] =
                &[$($crate::__private::construct::<$ty>),+];
            match constructors.get(index as usize) {
                Some(construct) => construct(),
                None => ::std::ptr::null_mut(),
            }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn fnhost_handle(
            instance: *mut ::std::ffi::c_void,
            input_ptr: *const u8,
            input_len: usize,
            ctx_ptr: *const u8,
            ctx_len: usize,
            cancel: *const ::std::sync::atomic::AtomicBool,
            out_ptr: *mut *mut u8,
            out_len: *mut usize,
        ) -> i32 {
            unsafe {
                $crate::__private::handle(
                    instance, input_ptr, input_len, ctx_ptr, ctx_len, cancel, out_ptr, out_len,
                )
            }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn fnhost_drop(instance: *mut ::std::ffi::c_void) {
            unsafe { $crate::__private::drop_instance(instance) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn fnhost_free(ptr: *mut u8, len: usize) {
            unsafe { $crate::__private::free_buffer(ptr, len) }
        }
    };
}

/// Build the manifest for the exported names.
pub fn manifest(names: &[&str]) -> Manifest {
    Manifest {
        abi_version: ABI_VERSION,
        types: names
            .iter()
            .enumerate()
            .map(|(index, name)| ManifestType {
                name: (*name).to_string(),
                index: index as u32,
                interfaces: vec![FUNCTION_CONTRACT.to_string()],
            })
            .collect(),
    }
}

/// # Safety
/// `out_ptr` and `out_len` must be valid for writes.
pub unsafe fn write_manifest(names: &[&str], out_ptr: *mut *mut u8, out_len: *mut usize) -> i32 {
    match serde_json::to_vec(&manifest(names)) {
        Ok(bytes) => {
            unsafe { write_buffer(bytes, out_ptr, out_len) };
            ResultCode::Success as i32
        }
        Err(e) => {
            unsafe { write_buffer(e.to_string().into_bytes(), out_ptr, out_len) };
            ResultCode::EncodeError as i32
        }
    }
}

/// Construct a fresh instance of `T`; null if `T::default` panicked.
pub fn construct<T: GuestFunction + Default + 'static>() -> *mut c_void {
    match catch_unwind(T::default) {
        Ok(function) => {
            let instance: Instance = Box::new(function);
            Box::into_raw(Box::new(instance)) as *mut c_void
        }
        Err(_) => std::ptr::null_mut(),
    }
}

/// # Safety
/// `instance` must come from [`construct`] and not be dropped yet. Input and
/// context pointers must be valid for their lengths. `cancel` is null or valid
/// for the duration of the call. `out_ptr`/`out_len` must be valid for writes.
#[allow(clippy::too_many_arguments)]
pub unsafe fn handle(
    instance: *mut c_void,
    input_ptr: *const u8,
    input_len: usize,
    ctx_ptr: *const u8,
    ctx_len: usize,
    cancel: *const AtomicBool,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    if instance.is_null() {
        unsafe { write_buffer(b"null instance".to_vec(), out_ptr, out_len) };
        return ResultCode::BadInstance as i32;
    }

    let input_bytes = unsafe { bytes_from_raw(input_ptr, input_len) };
    let ctx_bytes = unsafe { bytes_from_raw(ctx_ptr, ctx_len) };

    let input: Input = match serde_json::from_slice(input_bytes) {
        Ok(input) => input,
        Err(e) => {
            let message = format!("invalid input: {e}");
            unsafe { write_buffer(message.into_bytes(), out_ptr, out_len) };
            return ResultCode::DecodeError as i32;
        }
    };
    let wire: WireContext = match serde_json::from_slice(ctx_bytes) {
        Ok(wire) => wire,
        Err(e) => {
            let message = format!("invalid context: {e}");
            unsafe { write_buffer(message.into_bytes(), out_ptr, out_len) };
            return ResultCode::DecodeError as i32;
        }
    };

    let cancel = if cancel.is_null() {
        None
    } else {
        Some(unsafe { &*cancel })
    };
    let ctx = GuestContext::new(wire, cancel);
    let function = unsafe { &mut *(instance as *mut Instance) };

    let (code, bytes) = match catch_unwind(AssertUnwindSafe(|| function.handle(input, &ctx))) {
        Ok(Ok(value)) => match serde_json::to_vec(&value) {
            Ok(bytes) => (ResultCode::Success, bytes),
            Err(e) => (ResultCode::EncodeError, e.to_string().into_bytes()),
        },
        Ok(Err(error)) => match serde_json::to_vec(&error) {
            Ok(bytes) => (ResultCode::HandlerError, bytes),
            Err(e) => (ResultCode::EncodeError, e.to_string().into_bytes()),
        },
        Err(payload) => (ResultCode::Panic, panic_message(payload.as_ref()).into_bytes()),
    };

    unsafe { write_buffer(bytes, out_ptr, out_len) };
    code as i32
}

/// # Safety
/// `instance` is null or came from [`construct`] and was not dropped yet.
pub unsafe fn drop_instance(instance: *mut c_void) {
    if instance.is_null() {
        return;
    }
    let boxed = unsafe { Box::from_raw(instance as *mut Instance) };
    let _ = catch_unwind(AssertUnwindSafe(move || drop(boxed)));
}

/// # Safety
/// `ptr`/`len` must come from a buffer written by this module, freed once.
pub unsafe fn free_buffer(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)) });
}

unsafe fn write_buffer(bytes: Vec<u8>, out_ptr: *mut *mut u8, out_len: *mut usize) {
    let boxed = bytes.into_boxed_slice();
    let len = boxed.len();
    let ptr = Box::into_raw(boxed) as *mut u8;
    unsafe {
        *out_ptr = ptr;
        *out_len = len;
    }
}

unsafe fn bytes_from_raw<'a>(ptr: *const u8, len: usize) -> &'a [u8] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GuestError, Value};

    #[derive(Default)]
    struct Echo;

    impl GuestFunction for Echo {
        fn handle(&mut self, input: Input, ctx: &GuestContext<'_>) -> Result<Value, GuestError> {
            match input.get("fail").and_then(Value::as_str) {
                Some("error") => Err(GuestError::new("validation", "asked to fail")),
                Some("panic") => panic!("asked to panic"),
                _ => Ok(serde_json::json!({ "input": input, "request": ctx.request_id() })),
            }
        }
    }

    fn call(instance: *mut c_void, input: &str) -> (ResultCode, Vec<u8>) {
        let ctx = serde_json::to_vec(&WireContext {
            request_id: "r-1".to_string(),
            timeout_ms: 100,
        })
        .unwrap();
        let mut out_ptr = std::ptr::null_mut();
        let mut out_len = 0usize;
        let code = unsafe {
            handle(
                instance,
                input.as_ptr(),
                input.len(),
                ctx.as_ptr(),
                ctx.len(),
                std::ptr::null(),
                &mut out_ptr,
                &mut out_len,
            )
        };
        let bytes = unsafe { std::slice::from_raw_parts(out_ptr, out_len) }.to_vec();
        unsafe { free_buffer(out_ptr, out_len) };
        (ResultCode::from(code), bytes)
    }

    #[test]
    fn test_manifest_lists_types_in_order() {
        let manifest = manifest(&["a.One", "a.Two"]);
        assert_eq!(manifest.abi_version, ABI_VERSION);
        assert_eq!(manifest.types.len(), 2);
        assert_eq!(manifest.types[1].name, "a.Two");
        assert_eq!(manifest.types[1].index, 1);
        assert_eq!(manifest.types[0].interfaces, vec![FUNCTION_CONTRACT.to_string()]);
    }

    #[test]
    fn test_handle_success_error_and_panic() {
        let instance = construct::<Echo>();
        assert!(!instance.is_null());

        let (code, bytes) = call(instance, r#"{"name":"x"}"#);
        assert_eq!(code, ResultCode::Success);
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["input"]["name"], "x");
        assert_eq!(value["request"], "r-1");

        let (code, bytes) = call(instance, r#"{"fail":"error"}"#);
        assert_eq!(code, ResultCode::HandlerError);
        let error: GuestError = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(error.kind, "validation");

        let (code, bytes) = call(instance, r#"{"fail":"panic"}"#);
        assert_eq!(code, ResultCode::Panic);
        assert_eq!(String::from_utf8(bytes).unwrap(), "asked to panic");

        unsafe { drop_instance(instance) };
    }

    #[test]
    fn test_handle_rejects_bad_input_and_null_instance() {
        let instance = construct::<Echo>();
        let (code, _) = call(instance, "not json");
        assert_eq!(code, ResultCode::DecodeError);
        unsafe { drop_instance(instance) };

        let (code, _) = call(std::ptr::null_mut(), "{}");
        assert_eq!(code, ResultCode::BadInstance);
    }
}

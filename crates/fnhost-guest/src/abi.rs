//! C ABI shared by host and guest.
//!
//! Every buffer a guest hands to the host (`out_ptr`/`out_len`) is owned by the
//! guest allocator and must be returned through `fnhost_free`.

use std::ffi::c_void;
use std::sync::atomic::AtomicBool;

pub const SYM_ABI_VERSION: &[u8] = b"fnhost_abi_version";
pub const SYM_MANIFEST: &[u8] = b"fnhost_manifest";
pub const SYM_NEW: &[u8] = b"fnhost_new";
pub const SYM_HANDLE: &[u8] = b"fnhost_handle";
pub const SYM_DROP: &[u8] = b"fnhost_drop";
pub const SYM_FREE: &[u8] = b"fnhost_free";

/// `fnhost_abi_version() -> u32`
pub type AbiVersionFn = unsafe extern "C" fn() -> u32;

/// `fnhost_manifest(out_ptr, out_len) -> code`; writes the JSON manifest.
pub type ManifestFn = unsafe extern "C" fn(*mut *mut u8, *mut usize) -> i32;

/// `fnhost_new(index) -> instance`; null when construction failed.
pub type NewFn = unsafe extern "C" fn(u32) -> *mut c_void;

/// Invoke an instance.
pub type HandleFn = unsafe extern "C" fn(
    *mut c_void,       // instance
    *const u8, usize,  // input JSON
    *const u8, usize,  // context JSON
    *const AtomicBool, // cancel flag (may be null)
    *mut *mut u8, *mut usize,
) -> i32;

/// `fnhost_drop(instance)`
pub type DropFn = unsafe extern "C" fn(*mut c_void);

/// `fnhost_free(ptr, len)`
pub type FreeFn = unsafe extern "C" fn(*mut u8, usize);

/// Result code returned by `fnhost_manifest` and `fnhost_handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    /// Output buffer holds the JSON result.
    Success = 0,
    /// Input or context could not be decoded.
    DecodeError = -1,
    /// Output buffer holds a JSON `GuestError`.
    HandlerError = -2,
    /// Result could not be encoded.
    EncodeError = -3,
    /// Output buffer holds the panic message (UTF-8).
    Panic = -4,
    /// Instance pointer was null.
    BadInstance = -5,
}

impl From<i32> for ResultCode {
    fn from(code: i32) -> Self {
        match code {
            0 => Self::Success,
            -1 => Self::DecodeError,
            -2 => Self::HandlerError,
            -3 => Self::EncodeError,
            -4 => Self::Panic,
            -5 => Self::BadInstance,
            _ => Self::HandlerError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_from_i32() {
        assert_eq!(ResultCode::from(0), ResultCode::Success);
        assert_eq!(ResultCode::from(-1), ResultCode::DecodeError);
        assert_eq!(ResultCode::from(-2), ResultCode::HandlerError);
        assert_eq!(ResultCode::from(-3), ResultCode::EncodeError);
        assert_eq!(ResultCode::from(-4), ResultCode::Panic);
        assert_eq!(ResultCode::from(-5), ResultCode::BadInstance);
        assert_eq!(ResultCode::from(-42), ResultCode::HandlerError);
    }
}

//! Calling-convention identifiers.
//!
//! The engine validates ABI values at interface-preparation time; anything
//! outside the platform's supported range surfaces as `Error::BadAbi`.

use libffi::raw;

/// Calling-convention identifier accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abi(raw::ffi_abi);

impl Abi {
    /// The platform's native default calling convention.
    pub const DEFAULT: Self = Self(raw::ffi_abi_FFI_DEFAULT_ABI);

    /// Wrap a raw engine ABI value (e.g. a platform-specific stdcall id).
    #[inline]
    pub const fn from_raw(value: raw::ffi_abi) -> Self {
        Self(value)
    }

    /// The raw engine value.
    #[inline]
    pub const fn as_raw(self) -> raw::ffi_abi {
        self.0
    }
}

impl Default for Abi {
    #[inline]
    fn default() -> Self {
        Self::DEFAULT
    }
}

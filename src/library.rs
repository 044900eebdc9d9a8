//! Dynamic library loading and symbol resolution.
//!
//! Platform-agnostic wrapper around dlopen/LoadLibrary. The rest of the
//! crate consumes this as an opaque "resolve symbol → address" service.

use core::ffi::c_void;
use core::ptr::NonNull;
use std::ffi::CString;

use crate::call::FnAddr;
use crate::error::Error;

/// Handle to a dynamically loaded library.
pub struct Library {
    handle: NonNull<c_void>,
}

impl core::fmt::Debug for Library {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Library").field("handle", &self.handle).finish()
    }
}

impl Library {
    /// Load a library by name, searching the platform's standard paths.
    /// Use `open_path` for absolute paths.
    pub fn open(name: &str) -> Result<Self, LoadError> {
        Self::open_impl(name)
    }

    /// Load a library from an explicit path.
    pub fn open_path(path: &str) -> Result<Self, LoadError> {
        Self::open_impl(path)
    }

    #[cfg(unix)]
    fn open_impl(name: &str) -> Result<Self, LoadError> {
        let cname = CString::new(name).map_err(|_| LoadError::InvalidName)?;
        unsafe {
            let handle = libc::dlopen(cname.as_ptr(), libc::RTLD_NOW);
            NonNull::new(handle).map(|handle| Self { handle }).ok_or_else(|| {
                LoadError::LoadFailed(last_dl_error().unwrap_or_else(|| "unknown error".into()))
            })
        }
    }

    #[cfg(windows)]
    fn open_impl(name: &str) -> Result<Self, LoadError> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;

        extern "system" {
            fn LoadLibraryW(filename: *const u16) -> *mut c_void;
            fn GetLastError() -> u32;
        }

        let wide: Vec<u16> = OsStr::new(name).encode_wide().chain(Some(0)).collect();
        unsafe {
            let handle = LoadLibraryW(wide.as_ptr());
            NonNull::new(handle).map(|handle| Self { handle }).ok_or_else(|| {
                LoadError::LoadFailed(format!("error code {}", GetLastError()))
            })
        }
    }

    /// Resolve an exported symbol to an opaque function address.
    pub fn symbol(&self, name: &str) -> Result<FnAddr, SymbolError> {
        let addr = self.symbol_impl(name)?;
        tracing::debug!(target: "library", symbol = name, "resolved symbol");
        Ok(addr)
    }

    #[cfg(unix)]
    fn symbol_impl(&self, name: &str) -> Result<FnAddr, SymbolError> {
        let cname = CString::new(name).map_err(|_| SymbolError::InvalidName)?;
        unsafe {
            // Clear any stale error state so a null result is conclusive.
            libc::dlerror();
            let ptr = libc::dlsym(self.handle.as_ptr(), cname.as_ptr());
            if ptr.is_null() {
                Err(SymbolError::NotFound(name.to_owned()))
            } else {
                Ok(FnAddr::new(ptr as *const c_void))
            }
        }
    }

    #[cfg(windows)]
    fn symbol_impl(&self, name: &str) -> Result<FnAddr, SymbolError> {
        extern "system" {
            fn GetProcAddress(module: *mut c_void, name: *const u8) -> *mut c_void;
        }

        let cname = CString::new(name).map_err(|_| SymbolError::InvalidName)?;
        unsafe {
            let ptr = GetProcAddress(self.handle.as_ptr(), cname.as_ptr() as *const u8);
            if ptr.is_null() {
                Err(SymbolError::NotFound(name.to_owned()))
            } else {
                Ok(FnAddr::new(ptr as *const c_void))
            }
        }
    }
}

impl Drop for Library {
    #[cfg(unix)]
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }

    #[cfg(windows)]
    fn drop(&mut self) {
        extern "system" {
            fn FreeLibrary(module: *mut c_void) -> i32;
        }
        unsafe {
            FreeLibrary(self.handle.as_ptr());
        }
    }
}

unsafe impl Send for Library {}
unsafe impl Sync for Library {}

#[cfg(unix)]
fn last_dl_error() -> Option<String> {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            None
        } else {
            Some(std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned())
        }
    }
}

/// Library loading errors.
#[derive(Debug)]
pub enum LoadError {
    InvalidName,
    LoadFailed(String),
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidName => write!(f, "invalid library name"),
            Self::LoadFailed(msg) => write!(f, "failed to load library: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}

/// Symbol lookup errors.
#[derive(Debug)]
pub enum SymbolError {
    InvalidName,
    NotFound(String),
}

impl core::fmt::Display for SymbolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidName => write!(f, "invalid symbol name"),
            Self::NotFound(name) => write!(f, "symbol not found: {}", name),
        }
    }
}

impl std::error::Error for SymbolError {}

impl From<SymbolError> for Error {
    fn from(err: SymbolError) -> Self {
        match err {
            SymbolError::InvalidName => Error::SymbolNotFound { name: String::new() },
            SymbolError::NotFound(name) => Error::SymbolNotFound { name },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_reports_the_loader_error() {
        let err = Library::open("no-such-library-dynacall-test").unwrap_err();
        assert!(matches!(err, LoadError::LoadFailed(_)));
    }

    #[test]
    fn interior_nul_is_an_invalid_name() {
        let err = Library::open("bad\0name").unwrap_err();
        assert!(matches!(err, LoadError::InvalidName));
    }
}

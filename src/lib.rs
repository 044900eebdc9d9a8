//! dynacall — dynamic native call interface for managed runtimes.
//!
//! Describes the calling convention of an arbitrary native function at
//! runtime and invokes it by address, marshalling values between the
//! managed representation and native memory on each call; the inverse
//! direction exposes a managed function as a native callable pointer.
//!
//! Architecture:
//! - `types` - descriptor resolution into ABI-accurate layouts (cached)
//! - `cif` - validated, reusable call interfaces over the engine
//! - `call` - blocking and worker-pool invocation with per-call frames
//! - `callback` - native-callable pointers backed by managed functions
//! - `variadic` - memoized interfaces per trailing-type combination
//! - `exec` - the managed execution context and cross-thread funnel
//! - `marshal` - the value <-> native-memory contract
//! - `library` - dlopen/dlsym symbol resolution collaborator
//!
//! The actual register/stack mechanics are delegated to libffi; this crate
//! is the layer that prepares and drives that engine correctly and safely.

pub mod abi;
pub mod call;
pub mod callback;
pub mod cif;
pub mod error;
pub mod exec;
pub mod library;
pub mod logging;
pub mod marshal;
pub mod types;
pub mod variadic;

pub use abi::Abi;
pub use call::{FnAddr, Invoker};
pub use callback::CallbackHandle;
pub use cif::CallInterface;
pub use error::Error;
pub use exec::RuntimeContext;
pub use library::Library;
pub use marshal::{MarshalError, Value};
pub use types::{resolve, LayoutKind, Primitive, TypeDesc, TypeLayout};
pub use variadic::VariadicFunction;

/// Initialize the interop subsystem (logging only; everything else is lazy).
pub fn init() {
    logging::init_logging();
}

#[cfg(test)]
mod tests;

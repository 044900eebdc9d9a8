//! Prepared call interfaces over the native calling-convention engine.
//!
//! A `CallInterface` is the validated, reusable description of one function
//! signature. The boxed engine descriptor and the argument type array it
//! points into are owned by the interface and never relocated or reused for
//! a different signature, so every invoker and callback built from the
//! interface can rely on them for its whole lifetime.

use core::mem;
use std::sync::Arc;

use libffi::raw;

use crate::abi::Abi;
use crate::error::Error;
use crate::marshal::RETURN_REGISTER_SIZE;
use crate::types::{resolve, TypeDesc, TypeLayout};

pub struct CallInterface {
    cif: Box<raw::ffi_cif>,
    ret: Arc<TypeLayout>,
    args: Vec<Arc<TypeLayout>>,
    /// Stable `ffi_type*` array the prepared descriptor points into.
    _arg_types: Box<[*mut raw::ffi_type]>,
    abi: Abi,
    fixed_args: Option<usize>,
    ret_slot: usize,
}

unsafe impl Send for CallInterface {}
unsafe impl Sync for CallInterface {}

impl core::fmt::Debug for CallInterface {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallInterface")
            .field("abi", &self.abi)
            .field("fixed_args", &self.fixed_args)
            .field("arg_count", &self.args.len())
            .field("ret_slot", &self.ret_slot)
            .finish_non_exhaustive()
    }
}

impl CallInterface {
    /// Build a fixed-arity call interface. `abi` defaults to the platform's
    /// native convention.
    pub fn build(
        ret: &TypeDesc,
        args: &[TypeDesc],
        abi: Option<Abi>,
    ) -> Result<Arc<Self>, Error> {
        Self::prepare(ret, args, None, abi)
    }

    /// Build a variadic call interface. The leading `fixed_args` of `args`
    /// are the always-present portion; the rest are the per-call trailing
    /// types. The engine shapes the stack differently for variadic
    /// conventions, so the split must be threaded through here.
    pub fn build_variadic(
        ret: &TypeDesc,
        args: &[TypeDesc],
        fixed_args: usize,
        abi: Option<Abi>,
    ) -> Result<Arc<Self>, Error> {
        if fixed_args > args.len() {
            return Err(Error::InvalidTypeDescriptor {
                reason: format!(
                    "fixed argument count {} exceeds total argument count {}",
                    fixed_args,
                    args.len()
                ),
            });
        }
        Self::prepare(ret, args, Some(fixed_args), abi)
    }

    fn prepare(
        ret: &TypeDesc,
        args: &[TypeDesc],
        fixed_args: Option<usize>,
        abi: Option<Abi>,
    ) -> Result<Arc<Self>, Error> {
        let ret_layout = resolve(ret)?;
        let arg_layouts = args.iter().map(resolve).collect::<Result<Vec<_>, _>>()?;

        let mut arg_types: Box<[*mut raw::ffi_type]> =
            arg_layouts.iter().map(|l| l.engine_type()).collect();
        let abi = abi.unwrap_or_default();
        let mut cif: Box<raw::ffi_cif> = Box::new(unsafe { mem::zeroed() });

        let status = unsafe {
            match fixed_args {
                None => raw::ffi_prep_cif(
                    &mut *cif,
                    abi.as_raw(),
                    arg_types.len() as u32,
                    ret_layout.engine_type(),
                    arg_types.as_mut_ptr(),
                ),
                Some(fixed) => raw::ffi_prep_cif_var(
                    &mut *cif,
                    abi.as_raw(),
                    fixed as u32,
                    arg_types.len() as u32,
                    ret_layout.engine_type(),
                    arg_types.as_mut_ptr(),
                ),
            }
        };
        engine_status(status, abi)?;

        tracing::debug!(
            target: "cif",
            arity = arg_layouts.len(),
            variadic = fixed_args.is_some(),
            "prepared call interface"
        );

        // The engine writes sub-register integral results through a
        // register-width slot, so the return storage is never smaller.
        let ret_slot = ret_layout.size().max(RETURN_REGISTER_SIZE);

        Ok(Arc::new(Self {
            cif,
            ret: ret_layout,
            args: arg_layouts,
            _arg_types: arg_types,
            abi,
            fixed_args,
            ret_slot,
        }))
    }

    #[inline]
    pub fn return_layout(&self) -> &Arc<TypeLayout> {
        &self.ret
    }

    #[inline]
    pub fn arg_layouts(&self) -> &[Arc<TypeLayout>] {
        &self.args
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    #[inline]
    pub fn abi(&self) -> Abi {
        self.abi
    }

    /// Count of always-present leading arguments; `None` for fixed-arity
    /// interfaces.
    #[inline]
    pub fn fixed_arg_count(&self) -> Option<usize> {
        self.fixed_args
    }

    /// Size of the return slot a call frame must provide.
    #[inline]
    pub(crate) fn ret_slot_size(&self) -> usize {
        self.ret_slot
    }

    pub(crate) fn cif_ptr(&self) -> *mut raw::ffi_cif {
        &*self.cif as *const raw::ffi_cif as *mut raw::ffi_cif
    }
}

fn engine_status(status: raw::ffi_status, abi: Abi) -> Result<(), Error> {
    match status {
        raw::ffi_status_FFI_OK => Ok(()),
        raw::ffi_status_FFI_BAD_ABI => Err(Error::BadAbi { abi: abi.as_raw() as u32 }),
        other => Err(Error::BadTypeDef { status: other as u32 }),
    }
}

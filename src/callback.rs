//! Native-callable bridges over managed functions.
//!
//! A `CallbackHandle` owns an engine closure whose code pointer native code
//! may call like any C function. Each invocation is funneled onto the
//! runtime context's home thread, where the incoming arguments are
//! unmarshalled, the managed function runs, and its result is marshalled
//! into the native return slot. Foreign callers block until that hand-off
//! completes, because they expect a return value.
//!
//! Managed-side failures never unwind through the native frame: they are
//! reported through the context's error sink and the native caller sees a
//! zeroed result for that invocation.

use core::ptr;
use core::slice;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libffi::low;
use libffi::raw;

use crate::call::FnAddr;
use crate::cif::CallInterface;
use crate::error::Error;
use crate::exec::{ContextShared, RuntimeContext};
use crate::marshal::{self, Value};

/// A managed function exposed to native code. Always executed on the
/// context's home thread, never concurrently with itself.
pub type ManagedFn = Box<dyn Fn(&[Value]) -> Result<Value, Error> + Send + Sync + 'static>;

struct CallbackInfo {
    iface: Arc<CallInterface>,
    func: ManagedFn,
    ctx: Arc<ContextShared>,
    /// Cleared on drop; checked by the trampoline so a stale pointer is
    /// reported instead of silently running freed state. Best effort only —
    /// invoking the pointer after the closure is freed remains undefined.
    live: AtomicBool,
}

/// Owner of a native-callable function pointer backed by a managed function.
///
/// The handle is the sole owner of the closure resource it vends; the
/// pointer from `code_ptr` is valid exactly as long as the handle is alive.
pub struct CallbackHandle {
    info: Box<CallbackInfo>,
    closure: *mut raw::ffi_closure,
    code: FnAddr,
}

unsafe impl Send for CallbackHandle {}
unsafe impl Sync for CallbackHandle {}

impl CallbackHandle {
    pub fn new(
        ctx: &RuntimeContext,
        iface: Arc<CallInterface>,
        func: impl Fn(&[Value]) -> Result<Value, Error> + Send + Sync + 'static,
    ) -> Result<Self, Error> {
        let (closure, code) = low::closure_alloc();
        if closure.is_null() {
            return Err(Error::ClosureAlloc);
        }

        let info = Box::new(CallbackInfo {
            iface: iface.clone(),
            func: Box::new(func),
            ctx: ctx.shared(),
            live: AtomicBool::new(true),
        });

        let status = unsafe {
            raw::ffi_prep_closure_loc(
                closure,
                iface.cif_ptr(),
                Some(trampoline),
                &*info as *const CallbackInfo as *mut c_void,
                code.as_mut_ptr(),
            )
        };
        if status != raw::ffi_status_FFI_OK {
            unsafe { low::closure_free(closure) };
            return Err(match status {
                raw::ffi_status_FFI_BAD_ABI => {
                    Error::BadAbi { abi: iface.abi().as_raw() as u32 }
                }
                other => Error::BadTypeDef { status: other as u32 },
            });
        }

        tracing::debug!(target: "callback", arity = iface.arity(), "prepared native callback");
        Ok(Self { info, closure, code: FnAddr::new(code.as_ptr()) })
    }

    /// The native function pointer backed by the managed function.
    #[inline]
    pub fn code_ptr(&self) -> FnAddr {
        self.code
    }

    #[inline]
    pub fn interface(&self) -> &Arc<CallInterface> {
        &self.info.iface
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.info.live.store(false, Ordering::Release);
        unsafe { low::closure_free(self.closure) };
    }
}

/// Raw pointer that may cross the funnel. The foreign caller blocks until
/// the home thread is done with it, so the pointee outlives the transfer.
#[derive(Clone, Copy)]
struct FramePtr<T>(*mut T);

unsafe impl<T> Send for FramePtr<T> {}

unsafe extern "C" fn trampoline(
    _cif: *mut raw::ffi_cif,
    ret: *mut c_void,
    params: *mut *mut c_void,
    user_data: *mut c_void,
) {
    let info = &*(user_data as *const CallbackInfo);

    if !info.live.load(Ordering::Acquire) {
        zero_return(info, ret as *mut u8);
        info.ctx.report_error(Error::CallbackGone);
        return;
    }

    let info_ptr = FramePtr(user_data as *mut CallbackInfo);
    let ret_ptr = FramePtr(ret as *mut u8);
    let params_ptr = FramePtr(params);
    info.ctx.run_blocking(move || {
        // Capture the whole `FramePtr` wrappers (which are `Send`), not their
        // individual raw-pointer fields via disjoint closure captures.
        let info_ptr = info_ptr;
        let ret_ptr = ret_ptr;
        let params_ptr = params_ptr;
        let info = unsafe { &*(info_ptr.0 as *const CallbackInfo) };
        dispatch(info, ret_ptr.0, params_ptr.0);
    });
}

fn zero_return(info: &CallbackInfo, ret: *mut u8) {
    let region = marshal::return_region_len(info.iface.return_layout());
    if region > 0 {
        unsafe { ptr::write_bytes(ret, 0, region) };
    }
}

/// Runs on the context's home thread: unmarshal, invoke, marshal back.
fn dispatch(info: &CallbackInfo, ret: *mut u8, params: *mut *mut c_void) {
    zero_return(info, ret);

    let layouts = info.iface.arg_layouts();
    let mut args = Vec::with_capacity(layouts.len());
    for (index, layout) in layouts.iter().enumerate() {
        let src = unsafe { *params.add(index) } as *const u8;
        let buf = unsafe { slice::from_raw_parts(src, layout.size().max(1)) };
        match marshal::read_value(buf, layout) {
            Ok(value) => args.push(value),
            Err(cause) => {
                info.ctx.report_error(Error::CallbackFailure {
                    cause: Box::new(Error::ArgumentMarshal { index, cause }),
                });
                return;
            }
        }
    }

    match (info.func)(&args) {
        Ok(result) => {
            let region = marshal::return_region_len(info.iface.return_layout());
            if region == 0 {
                return;
            }
            let out = unsafe { slice::from_raw_parts_mut(ret, region) };
            if let Err(cause) =
                marshal::write_return_slot(&result, info.iface.return_layout(), out)
            {
                zero_return(info, ret);
                info.ctx.report_error(Error::CallbackFailure {
                    cause: Box::new(Error::ReturnMarshal { cause }),
                });
            }
        }
        Err(err) => {
            info.ctx.report_error(Error::CallbackFailure { cause: Box::new(err) });
        }
    }
}

//! Function invocation: argument frames, blocking and non-blocking calls.
//!
//! Every invocation owns a `CallFrame` — the marshalled argument storage,
//! the argument pointer array, and the return slot. Frames are never shared
//! or reused, so concurrent calls against one shared interface cannot alias
//! each other's buffers.

use std::ffi::c_void;
use std::sync::Arc;

use libffi::low::CodePtr;
use libffi::raw;
use smallvec::SmallVec;

use crate::cif::CallInterface;
use crate::error::Error;
use crate::exec::RuntimeContext;
use crate::marshal::{self, Value};

/// Opaque native function address, as handed back by the symbol-resolution
/// collaborator. Just bits; dereferencing only ever happens inside the
/// engine's call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FnAddr(*const c_void);

unsafe impl Send for FnAddr {}
unsafe impl Sync for FnAddr {}

impl FnAddr {
    #[inline]
    pub fn new(ptr: *const c_void) -> Self {
        Self(ptr)
    }

    #[inline]
    pub fn as_ptr(self) -> *const c_void {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// 8-byte-aligned owned byte buffer. Argument and return storage must meet
/// the alignment of any supported scalar.
struct AlignedBuf {
    words: Box<[u64]>,
    len: usize,
}

impl AlignedBuf {
    fn zeroed(len: usize) -> Self {
        let words = len.div_ceil(8).max(1);
        Self { words: vec![0u64; words].into_boxed_slice(), len }
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }

    #[inline]
    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr() as *mut u8
    }
}

/// Per-invocation buffers: marshalled arguments, the `void**` array handed
/// to the engine, aux storage for by-reference payloads, and the return
/// slot. Exclusively owned by one invocation.
pub(crate) struct CallFrame {
    args: Vec<AlignedBuf>,
    arg_ptrs: SmallVec<[*mut c_void; 8]>,
    _aux: Vec<Box<[u8]>>,
    ret: AlignedBuf,
}

unsafe impl Send for CallFrame {}

impl CallFrame {
    /// Marshal `values` against the interface's argument layouts. The first
    /// failing argument aborts the frame before any native transfer.
    pub(crate) fn marshal(iface: &CallInterface, values: &[Value]) -> Result<Self, Error> {
        let mut args = Vec::with_capacity(values.len());
        let mut aux = Vec::new();
        for (index, (value, layout)) in values.iter().zip(iface.arg_layouts()).enumerate() {
            let mut buf = AlignedBuf::zeroed(layout.size().max(1));
            marshal::write_arg(value, layout, buf.as_mut_slice(), &mut aux)
                .map_err(|cause| Error::ArgumentMarshal { index, cause })?;
            args.push(buf);
        }
        let arg_ptrs = args.iter_mut().map(|buf| buf.as_mut_ptr() as *mut c_void).collect();
        let ret = AlignedBuf::zeroed(iface.ret_slot_size().max(1));
        Ok(Self { args, arg_ptrs, _aux: aux, ret })
    }

    fn read_return(&self, iface: &CallInterface) -> Result<Value, Error> {
        marshal::read_return(self.ret.as_slice(), iface.return_layout())
            .map_err(|cause| Error::ReturnMarshal { cause })
    }
}

/// Executes calls through one prepared interface and one function address.
///
/// The interface is read-only during calls and freely shared; the invoker
/// keeps it alive for as long as the invoker itself exists.
pub struct Invoker {
    iface: Arc<CallInterface>,
    addr: FnAddr,
}

impl Invoker {
    pub fn new(iface: Arc<CallInterface>, addr: FnAddr) -> Self {
        Self { iface, addr }
    }

    #[inline]
    pub fn interface(&self) -> &Arc<CallInterface> {
        &self.iface
    }

    #[inline]
    pub fn address(&self) -> FnAddr {
        self.addr
    }

    fn check_arity(&self, got: usize) -> Result<(), Error> {
        let expected = self.iface.arity();
        if got != expected {
            return Err(Error::ArityMismatch { expected, got });
        }
        Ok(())
    }

    /// Blocking call on the current thread.
    pub fn call(&self, args: &[Value]) -> Result<Value, Error> {
        self.check_arity(args.len())?;
        let mut frame = CallFrame::marshal(&self.iface, args)?;
        tracing::trace!(target: "call", addr = ?self.addr.as_ptr(), arity = args.len(), "native call");
        unsafe { dispatch(&self.iface, self.addr, &mut frame) };
        frame.read_return(&self.iface)
    }

    /// Non-blocking call: arity and marshalling are checked synchronously,
    /// before any work is handed off. An arity mismatch fails the call
    /// immediately; a marshalling failure is delivered to `completion`
    /// through the context's queue without ever reaching the native call.
    /// Otherwise the native call runs on a worker and `completion` fires
    /// exactly once from the context's pump with the result or error.
    pub fn call_async(
        &self,
        ctx: &RuntimeContext,
        args: &[Value],
        completion: impl FnOnce(Result<Value, Error>) + Send + 'static,
    ) -> Result<(), Error> {
        self.check_arity(args.len())?;
        let shared = ctx.shared();
        let frame = match CallFrame::marshal(&self.iface, args) {
            Ok(frame) => frame,
            Err(err) => {
                shared.enqueue(move || completion(Err(err)));
                return Ok(());
            }
        };

        let iface = self.iface.clone();
        let addr = self.addr;
        ctx.spawn_native(move || {
            let mut frame = frame;
            unsafe { dispatch(&iface, addr, &mut frame) };
            let result = frame.read_return(&iface);
            // The frame and interface ride along until the completion has
            // actually been delivered; nothing backing the call is freed
            // before then.
            shared.enqueue(move || {
                let _frame = frame;
                let _iface = iface;
                completion(result);
            });
        });
        Ok(())
    }
}

unsafe fn dispatch(iface: &CallInterface, addr: FnAddr, frame: &mut CallFrame) {
    let code = CodePtr::from_ptr(addr.as_ptr());
    raw::ffi_call(
        iface.cif_ptr(),
        Some(*code.as_fun()),
        frame.ret.as_mut_ptr() as *mut c_void,
        frame.arg_ptrs.as_mut_ptr(),
    );
}

//! Scenario tests exercising the full call pipeline end to end.

use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::abi::Abi;
use crate::call::{FnAddr, Invoker};
use crate::callback::CallbackHandle;
use crate::cif::CallInterface;
use crate::error::Error;
use crate::exec::RuntimeContext;
use crate::marshal::{MarshalError, Value};
use crate::types::{Primitive, TypeDesc};
use crate::variadic::VariadicFunction;

// Native fixtures

extern "C" fn native_abs(v: i32) -> i32 {
    v.wrapping_abs()
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dims {
    width: i32,
    height: i32,
}

extern "C" fn double_dims(d: Dims) -> Dims {
    Dims { width: d.width * 2, height: d.height * 2 }
}

static NATIVE_HIT: AtomicBool = AtomicBool::new(false);

extern "C" fn record_hit(v: i8) -> i8 {
    NATIVE_HIT.store(true, Ordering::SeqCst);
    v
}

fn abs_addr() -> FnAddr {
    let f: extern "C" fn(i32) -> i32 = native_abs;
    FnAddr::new(f as usize as *const c_void)
}

fn i32_desc() -> TypeDesc {
    TypeDesc::primitive(Primitive::I32)
}

fn dims_desc() -> TypeDesc {
    TypeDesc::structure(vec![i32_desc(), i32_desc()])
}

fn dims_bytes(d: Dims) -> Vec<u8> {
    let mut bytes = vec![0u8; 8];
    bytes[..4].copy_from_slice(&d.width.to_ne_bytes());
    bytes[4..].copy_from_slice(&d.height.to_ne_bytes());
    bytes
}

fn dims_from_bytes(bytes: &[u8]) -> Dims {
    let mut w = [0u8; 4];
    let mut h = [0u8; 4];
    w.copy_from_slice(&bytes[..4]);
    h.copy_from_slice(&bytes[4..8]);
    Dims { width: i32::from_ne_bytes(w), height: i32::from_ne_bytes(h) }
}

fn pump_until<T>(
    ctx: &RuntimeContext,
    slot: &Arc<Mutex<Option<T>>>,
) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = slot.lock().take() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for completion");
        ctx.pump_wait(Duration::from_millis(10));
    }
}

#[test]
fn blocking_call_returns_absolute_value() {
    let iface = CallInterface::build(&i32_desc(), &[i32_desc()], None).unwrap();
    let invoker = Invoker::new(iface, abs_addr());
    let out = invoker.call(&[Value::I32(-1234)]).unwrap();
    assert_eq!(out.as_i64(), Some(1234));
}

#[test]
fn arity_mismatch_never_reaches_the_native_call() {
    let i8_desc = TypeDesc::primitive(Primitive::I8);
    let f: extern "C" fn(i8) -> i8 = record_hit;
    let iface = CallInterface::build(&i8_desc, &[i8_desc.clone()], None).unwrap();
    let invoker = Invoker::new(iface, FnAddr::new(f as usize as *const c_void));

    NATIVE_HIT.store(false, Ordering::SeqCst);
    let err = invoker.call(&[]).unwrap_err();
    assert!(matches!(err, Error::ArityMismatch { expected: 1, got: 0 }));
    let err = invoker.call(&[Value::I8(1), Value::I8(2)]).unwrap_err();
    assert!(matches!(err, Error::ArityMismatch { expected: 1, got: 2 }));
    assert!(!NATIVE_HIT.load(Ordering::SeqCst));
}

#[test]
fn struct_passes_and_returns_by_value() {
    let f: extern "C" fn(Dims) -> Dims = double_dims;
    let iface = CallInterface::build(&dims_desc(), &[dims_desc()], None).unwrap();
    let invoker = Invoker::new(iface, FnAddr::new(f as usize as *const c_void));

    let input = dims_bytes(Dims { width: 4, height: 5 });
    let out = invoker.call(&[Value::Bytes(input.clone())]).unwrap();
    let out = out.as_bytes().expect("struct return should be a byte image");
    assert_eq!(dims_from_bytes(out), Dims { width: 8, height: 10 });
    // Pass-by-value: the caller's struct image is untouched.
    assert_eq!(dims_from_bytes(&input), Dims { width: 4, height: 5 });
}

#[test]
fn callback_wrapped_in_an_invoker_round_trips() {
    let ctx = RuntimeContext::new();
    let iface = CallInterface::build(&i32_desc(), &[i32_desc()], None).unwrap();
    let handle = CallbackHandle::new(&ctx, iface.clone(), |args| {
        let v = args[0].as_i64().ok_or(Error::ArgumentMarshal {
            index: 0,
            cause: MarshalError::TypeMismatch { expected: "int32", got: "non-integer" },
        })?;
        Ok(Value::I32((v as i32).wrapping_abs()))
    })
    .unwrap();

    let invoker = Invoker::new(iface, handle.code_ptr());
    let out = invoker.call(&[Value::I32(-9999)]).unwrap();
    assert_eq!(out.as_i64(), Some(9999));
}

#[test]
fn async_call_delivers_the_result_on_the_pump() {
    let ctx = RuntimeContext::new();
    let iface = CallInterface::build(&i32_desc(), &[i32_desc()], None).unwrap();
    let invoker = Invoker::new(iface, abs_addr());

    let slot = Arc::new(Mutex::new(None));
    let out = slot.clone();
    invoker
        .call_async(&ctx, &[Value::I32(-7)], move |result| {
            *out.lock() = Some(result);
        })
        .unwrap();

    let result = pump_until(&ctx, &slot);
    assert_eq!(result.unwrap().as_i64(), Some(7));
}

#[test]
fn async_marshal_failure_skips_the_native_call() {
    let ctx = RuntimeContext::new();
    let i8_desc = TypeDesc::primitive(Primitive::I8);
    let f: extern "C" fn(i8) -> i8 = record_hit;
    let iface = CallInterface::build(&i8_desc, &[i8_desc.clone()], None).unwrap();
    let invoker = Invoker::new(iface, FnAddr::new(f as usize as *const c_void));

    NATIVE_HIT.store(false, Ordering::SeqCst);
    let slot = Arc::new(Mutex::new(None));
    let out = slot.clone();
    // 4096 cannot marshal into int8: the completion gets the error for
    // argument index 0 and the native function is never entered.
    invoker
        .call_async(&ctx, &[Value::I32(4096)], move |result| {
            *out.lock() = Some(result);
        })
        .unwrap();

    let result = pump_until(&ctx, &slot);
    let err = result.unwrap_err();
    assert!(matches!(err, Error::ArgumentMarshal { index: 0, .. }));
    assert!(err.to_string().contains("argument 1"));
    assert!(!NATIVE_HIT.load(Ordering::SeqCst));
}

#[test]
fn async_arity_mismatch_fails_synchronously() {
    let ctx = RuntimeContext::new();
    let iface = CallInterface::build(&i32_desc(), &[i32_desc()], None).unwrap();
    let invoker = Invoker::new(iface, abs_addr());
    let err = invoker.call_async(&ctx, &[], |_| {}).unwrap_err();
    assert!(matches!(err, Error::ArityMismatch { expected: 1, got: 0 }));
}

#[test]
fn callback_from_a_foreign_thread_runs_on_the_context() {
    let ctx = RuntimeContext::new();
    let iface = CallInterface::build(&i32_desc(), &[i32_desc()], None).unwrap();
    let handle = CallbackHandle::new(&ctx, iface, |args| {
        Ok(Value::I32(args[0].as_i64().unwrap() as i32 + 1))
    })
    .unwrap();

    let code = handle.code_ptr();
    let caller = std::thread::spawn(move || {
        let f: extern "C" fn(i32) -> i32 =
            unsafe { std::mem::transmute(code.as_ptr()) };
        f(41)
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    while !caller.is_finished() {
        assert!(Instant::now() < deadline, "timed out waiting for foreign caller");
        ctx.pump_wait(Duration::from_millis(10));
    }
    assert_eq!(caller.join().unwrap(), 42);
}

#[test]
fn callback_failure_is_reported_and_returns_zero() {
    let ctx = RuntimeContext::new();
    let reported: Arc<Mutex<Vec<Error>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();
    ctx.set_error_sink(move |err| sink.lock().push(err));

    let iface = CallInterface::build(&i32_desc(), &[i32_desc()], None).unwrap();
    let handle = CallbackHandle::new(&ctx, iface, |_args| {
        Err(Error::InvalidTypeDescriptor { reason: "managed failure".into() })
    })
    .unwrap();

    let f: extern "C" fn(i32) -> i32 =
        unsafe { std::mem::transmute(handle.code_ptr().as_ptr()) };
    assert_eq!(f(5), 0);

    let reported = reported.lock();
    assert_eq!(reported.len(), 1);
    assert!(matches!(&reported[0], Error::CallbackFailure { .. }));
}

#[test]
fn variadic_cache_collapses_structurally_equal_signatures() {
    let var = VariadicFunction::new(abs_addr(), i32_desc(), vec![i32_desc()], None);

    // Distinct descriptor instances, same structure: the identical invoker.
    let a = var.bind(&[TypeDesc::primitive(Primitive::I32)]).unwrap();
    let b = var.bind(&[TypeDesc::primitive(Primitive::I32)]).unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    // A different trailing list gets its own entry.
    let c = var.bind(&[TypeDesc::primitive(Primitive::F64)]).unwrap();
    assert!(!Arc::ptr_eq(&a, &c));

    // A different return type gets its own entry too.
    let d = var
        .bind_returning(&TypeDesc::primitive(Primitive::I64), &[TypeDesc::primitive(Primitive::I32)])
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &d));
}

#[cfg(all(unix, target_pointer_width = "64"))]
#[test]
fn variadic_call_formats_through_snprintf() {
    let f: unsafe extern "C" fn(
        *mut libc::c_char,
        libc::size_t,
        *const libc::c_char,
        ...
    ) -> libc::c_int = libc::snprintf;
    let var = VariadicFunction::new(
        FnAddr::new(f as usize as *const c_void),
        i32_desc(),
        vec![
            TypeDesc::primitive(Primitive::Pointer),
            TypeDesc::primitive(Primitive::U64),
            TypeDesc::primitive(Primitive::Pointer),
        ],
        None,
    );

    let bound = var.bind(&[i32_desc()]).unwrap();
    let mut buf = vec![0u8; 64];
    let out = bound
        .call(&[
            Value::Ptr(buf.as_mut_ptr() as *const c_void),
            Value::U64(buf.len() as u64),
            Value::string("%d").unwrap(),
            Value::I32(42),
        ])
        .unwrap();
    assert_eq!(out.as_i64(), Some(2));
    assert_eq!(&buf[..3], b"42\0");
}

#[test]
fn unknown_abi_is_rejected_at_preparation() {
    let err = CallInterface::build(&i32_desc(), &[], Some(Abi::from_raw(0x7fff_0000)))
        .unwrap_err();
    assert!(matches!(err, Error::BadAbi { .. }));
}

#[test]
fn argument_errors_render_one_based_positions() {
    let iface = CallInterface::build(&i32_desc(), &[i32_desc()], None).unwrap();
    let invoker = Invoker::new(iface, abs_addr());
    let err = invoker.call(&[Value::F64(1.5)]).unwrap_err();
    assert!(matches!(err, Error::ArgumentMarshal { index: 0, .. }));
    assert!(err.to_string().starts_with("error setting argument 1"));
}

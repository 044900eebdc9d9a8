//! Value marshalling between managed values and native memory.
//!
//! This is the contract the invoker and callback bridge both consume: write a
//! managed value into a region laid out per a `TypeLayout`, or read one back
//! out. Numeric writes are range-checked; by-reference payloads (strings,
//! fixed arrays) are parked in per-call aux storage and travel as addresses.

use std::ffi::{c_void, CString};

use libffi::raw;

use crate::types::{LayoutKind, Primitive, TypeLayout};

/// Width of the engine's integer return register slot. Results narrower than
/// this are written through a slot of this size by the engine.
pub(crate) const RETURN_REGISTER_SIZE: usize = core::mem::size_of::<raw::ffi_arg>();

/// A managed-side value crossing the native boundary.
///
/// Pointer variants carry opaque addresses; the core never dereferences them
/// on the managed side, so the value is plain data for threading purposes.
#[derive(Debug, Clone)]
pub enum Value {
    Void,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Ptr(*const c_void),
    Str(CString),
    Bytes(Vec<u8>),
}

unsafe impl Send for Value {}
unsafe impl Sync for Value {}

impl Value {
    /// Build a string value, rejecting interior NUL bytes.
    pub fn string(s: &str) -> Result<Self, MarshalError> {
        CString::new(s).map(Self::Str).map_err(|_| MarshalError::InteriorNul)
    }

    /// The value as a signed 128-bit integer, if it is integral.
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            Self::I8(v) => Some(v as i128),
            Self::I16(v) => Some(v as i128),
            Self::I32(v) => Some(v as i128),
            Self::I64(v) => Some(v as i128),
            Self::U8(v) => Some(v as i128),
            Self::U16(v) => Some(v as i128),
            Self::U32(v) => Some(v as i128),
            Self::U64(v) => Some(v as i128),
            _ => None,
        }
    }

    /// Narrowing accessor for integral values that fit an i64.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().and_then(|v| i64::try_from(v).ok())
    }

    /// The value as a double, accepting any numeric variant.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::F32(v) => Some(v as f64),
            Self::F64(v) => Some(v),
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    pub fn as_ptr(&self) -> Option<*const c_void> {
        match *self {
            Self::Ptr(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Variant name for error messages.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool(_) => "bool",
            Self::I8(_) => "int8",
            Self::I16(_) => "int16",
            Self::I32(_) => "int32",
            Self::I64(_) => "int64",
            Self::U8(_) => "uint8",
            Self::U16(_) => "uint16",
            Self::U32(_) => "uint32",
            Self::U64(_) => "uint64",
            Self::F32(_) => "float",
            Self::F64(_) => "double",
            Self::Ptr(_) => "pointer",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }
}

/// Why a single value failed to marshal.
#[derive(Debug)]
pub enum MarshalError {
    OutOfRange { value: String, target: &'static str },
    TypeMismatch { expected: &'static str, got: &'static str },
    BufferTooSmall { needed: usize, got: usize },
    InteriorNul,
    VoidValue,
}

impl core::fmt::Display for MarshalError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfRange { value, target } => {
                write!(f, "value {} is out of range for {}", value, target)
            }
            Self::TypeMismatch { expected, got } => {
                write!(f, "expected a {} value, got {}", expected, got)
            }
            Self::BufferTooSmall { needed, got } => {
                write!(f, "buffer of {} bytes is too small for {}-byte layout", got, needed)
            }
            Self::InteriorNul => write!(f, "string contains an interior NUL byte"),
            Self::VoidValue => write!(f, "void cannot be used as an argument value"),
        }
    }
}

impl std::error::Error for MarshalError {}

const fn int_bounds(p: Primitive) -> (i128, i128) {
    match p {
        Primitive::I8 => (i8::MIN as i128, i8::MAX as i128),
        Primitive::I16 => (i16::MIN as i128, i16::MAX as i128),
        Primitive::I32 => (i32::MIN as i128, i32::MAX as i128),
        Primitive::I64 => (i64::MIN as i128, i64::MAX as i128),
        Primitive::U8 => (0, u8::MAX as i128),
        Primitive::U16 => (0, u16::MAX as i128),
        Primitive::U32 => (0, u32::MAX as i128),
        Primitive::U64 => (0, u64::MAX as i128),
        _ => (0, 0),
    }
}

fn checked_int(value: &Value, p: Primitive) -> Result<i128, MarshalError> {
    let v = value
        .as_i128()
        .ok_or(MarshalError::TypeMismatch { expected: p.name(), got: value.type_name() })?;
    let (lo, hi) = int_bounds(p);
    if v < lo || v > hi {
        return Err(MarshalError::OutOfRange { value: v.to_string(), target: p.name() });
    }
    Ok(v)
}

fn write_int(buf: &mut [u8], p: Primitive, v: i128) {
    match p {
        Primitive::I8 => buf[..1].copy_from_slice(&(v as i8).to_ne_bytes()),
        Primitive::I16 => buf[..2].copy_from_slice(&(v as i16).to_ne_bytes()),
        Primitive::I32 => buf[..4].copy_from_slice(&(v as i32).to_ne_bytes()),
        Primitive::I64 => buf[..8].copy_from_slice(&(v as i64).to_ne_bytes()),
        Primitive::U8 => buf[..1].copy_from_slice(&(v as u8).to_ne_bytes()),
        Primitive::U16 => buf[..2].copy_from_slice(&(v as u16).to_ne_bytes()),
        Primitive::U32 => buf[..4].copy_from_slice(&(v as u32).to_ne_bytes()),
        Primitive::U64 => buf[..8].copy_from_slice(&(v as u64).to_ne_bytes()),
        _ => unreachable!("write_int called for non-integral primitive"),
    }
}

fn write_pointer(
    value: &Value,
    buf: &mut [u8],
    aux: &mut Vec<Box<[u8]>>,
) -> Result<(), MarshalError> {
    let addr: usize = match value {
        Value::Ptr(p) => *p as usize,
        Value::Str(s) => {
            // The NUL-terminated image lives in the frame's aux storage for
            // the duration of the call.
            let owned: Box<[u8]> = s.as_bytes_with_nul().to_vec().into_boxed_slice();
            let addr = owned.as_ptr() as usize;
            aux.push(owned);
            addr
        }
        Value::Bytes(b) => {
            let owned: Box<[u8]> = b.clone().into_boxed_slice();
            let addr = owned.as_ptr() as usize;
            aux.push(owned);
            addr
        }
        other => {
            let v = other.as_i128().ok_or(MarshalError::TypeMismatch {
                expected: "pointer",
                got: other.type_name(),
            })?;
            if v < 0 || v > usize::MAX as i128 {
                return Err(MarshalError::OutOfRange {
                    value: v.to_string(),
                    target: "pointer",
                });
            }
            v as usize
        }
    };
    buf[..core::mem::size_of::<usize>()].copy_from_slice(&addr.to_ne_bytes());
    Ok(())
}

/// Write a managed value into native argument storage laid out per `layout`.
///
/// `buf` must be at least `layout.size()` bytes. By-reference payloads are
/// appended to `aux`, which the caller keeps alive for the whole call.
pub fn write_arg(
    value: &Value,
    layout: &TypeLayout,
    buf: &mut [u8],
    aux: &mut Vec<Box<[u8]>>,
) -> Result<(), MarshalError> {
    match layout.kind() {
        LayoutKind::Primitive(Primitive::Void) => Err(MarshalError::VoidValue),
        LayoutKind::Primitive(Primitive::Bool) => {
            let truth = match value {
                Value::Bool(b) => *b,
                other => {
                    other.as_i128().ok_or(MarshalError::TypeMismatch {
                        expected: "bool",
                        got: other.type_name(),
                    })? != 0
                }
            };
            buf[0] = truth as u8;
            Ok(())
        }
        LayoutKind::Primitive(p) if p.is_integral() => {
            let v = checked_int(value, p)?;
            write_int(buf, p, v);
            Ok(())
        }
        LayoutKind::Primitive(Primitive::F32) => {
            let v = value.as_f64().ok_or(MarshalError::TypeMismatch {
                expected: "float",
                got: value.type_name(),
            })?;
            buf[..4].copy_from_slice(&(v as f32).to_ne_bytes());
            Ok(())
        }
        LayoutKind::Primitive(Primitive::F64) => {
            let v = value.as_f64().ok_or(MarshalError::TypeMismatch {
                expected: "double",
                got: value.type_name(),
            })?;
            buf[..8].copy_from_slice(&v.to_ne_bytes());
            Ok(())
        }
        LayoutKind::Primitive(Primitive::Pointer) | LayoutKind::Pointer => {
            write_pointer(value, buf, aux)
        }
        LayoutKind::Struct => match value {
            Value::Bytes(bytes) => {
                if bytes.len() < layout.size() {
                    return Err(MarshalError::BufferTooSmall {
                        needed: layout.size(),
                        got: bytes.len(),
                    });
                }
                buf[..layout.size()].copy_from_slice(&bytes[..layout.size()]);
                Ok(())
            }
            other => Err(MarshalError::TypeMismatch {
                expected: "bytes (struct image)",
                got: other.type_name(),
            }),
        },
        LayoutKind::FixedArray => match value {
            // C array arguments travel by reference.
            Value::Bytes(bytes) => {
                if bytes.len() < layout.size() {
                    return Err(MarshalError::BufferTooSmall {
                        needed: layout.size(),
                        got: bytes.len(),
                    });
                }
                let owned: Box<[u8]> = bytes[..layout.size()].to_vec().into_boxed_slice();
                let addr = owned.as_ptr() as usize;
                aux.push(owned);
                buf[..core::mem::size_of::<usize>()].copy_from_slice(&addr.to_ne_bytes());
                Ok(())
            }
            Value::Ptr(_) => write_pointer(value, buf, aux),
            other => Err(MarshalError::TypeMismatch {
                expected: "bytes or pointer (array payload)",
                got: other.type_name(),
            }),
        },
        LayoutKind::Primitive(_) => unreachable!("scalar kinds are covered above"),
    }
}

macro_rules! read_ne {
    ($buf:expr, $ty:ty) => {{
        let mut raw = [0u8; core::mem::size_of::<$ty>()];
        raw.copy_from_slice(&$buf[..core::mem::size_of::<$ty>()]);
        <$ty>::from_ne_bytes(raw)
    }};
}

/// Read a managed value out of native storage laid out per `layout`.
pub fn read_value(buf: &[u8], layout: &TypeLayout) -> Result<Value, MarshalError> {
    if buf.len() < layout.size() {
        return Err(MarshalError::BufferTooSmall { needed: layout.size(), got: buf.len() });
    }
    let value = match layout.kind() {
        LayoutKind::Primitive(Primitive::Void) => Value::Void,
        LayoutKind::Primitive(Primitive::Bool) => Value::Bool(buf[0] != 0),
        LayoutKind::Primitive(Primitive::I8) => Value::I8(read_ne!(buf, i8)),
        LayoutKind::Primitive(Primitive::I16) => Value::I16(read_ne!(buf, i16)),
        LayoutKind::Primitive(Primitive::I32) => Value::I32(read_ne!(buf, i32)),
        LayoutKind::Primitive(Primitive::I64) => Value::I64(read_ne!(buf, i64)),
        LayoutKind::Primitive(Primitive::U8) => Value::U8(read_ne!(buf, u8)),
        LayoutKind::Primitive(Primitive::U16) => Value::U16(read_ne!(buf, u16)),
        LayoutKind::Primitive(Primitive::U32) => Value::U32(read_ne!(buf, u32)),
        LayoutKind::Primitive(Primitive::U64) => Value::U64(read_ne!(buf, u64)),
        LayoutKind::Primitive(Primitive::F32) => Value::F32(read_ne!(buf, f32)),
        LayoutKind::Primitive(Primitive::F64) => Value::F64(read_ne!(buf, f64)),
        LayoutKind::Primitive(Primitive::Pointer) | LayoutKind::Pointer => {
            Value::Ptr(read_ne!(buf, usize) as *const c_void)
        }
        LayoutKind::Struct | LayoutKind::FixedArray => {
            Value::Bytes(buf[..layout.size()].to_vec())
        }
    };
    Ok(value)
}

/// Whether results of this layout are widened to the register slot.
#[inline]
fn widens_to_register(layout: &TypeLayout) -> bool {
    match layout.kind() {
        LayoutKind::Primitive(p) => {
            (p.is_integral() || p == Primitive::Bool) && layout.size() < RETURN_REGISTER_SIZE
        }
        _ => false,
    }
}

/// Bytes of the native return region for this layout: the full register slot
/// for sub-register integral results, the layout size otherwise.
pub(crate) fn return_region_len(layout: &TypeLayout) -> usize {
    if widens_to_register(layout) {
        RETURN_REGISTER_SIZE
    } else {
        layout.size()
    }
}

fn read_register(buf: &[u8]) -> u64 {
    if RETURN_REGISTER_SIZE == 4 {
        read_ne!(buf, u32) as u64
    } else {
        read_ne!(buf, u64)
    }
}

fn write_register(buf: &mut [u8], v: u64) {
    if RETURN_REGISTER_SIZE == 4 {
        buf[..4].copy_from_slice(&(v as u32).to_ne_bytes());
    } else {
        buf[..8].copy_from_slice(&v.to_ne_bytes());
    }
}

/// Read a native return value. The engine writes integral results narrower
/// than the register width through a register-width slot, so those are read
/// from the full slot and truncated to the logical type.
pub fn read_return(buf: &[u8], layout: &TypeLayout) -> Result<Value, MarshalError> {
    if !widens_to_register(layout) {
        return read_value(buf, layout);
    }
    if buf.len() < RETURN_REGISTER_SIZE {
        return Err(MarshalError::BufferTooSmall {
            needed: RETURN_REGISTER_SIZE,
            got: buf.len(),
        });
    }
    let slot = read_register(buf);
    let value = match layout.kind() {
        LayoutKind::Primitive(Primitive::Bool) => Value::Bool(slot as u8 != 0),
        LayoutKind::Primitive(Primitive::I8) => Value::I8(slot as i8),
        LayoutKind::Primitive(Primitive::I16) => Value::I16(slot as i16),
        LayoutKind::Primitive(Primitive::I32) => Value::I32(slot as i32),
        LayoutKind::Primitive(Primitive::U8) => Value::U8(slot as u8),
        LayoutKind::Primitive(Primitive::U16) => Value::U16(slot as u16),
        LayoutKind::Primitive(Primitive::U32) => Value::U32(slot as u32),
        _ => unreachable!("only sub-register integrals widen"),
    };
    Ok(value)
}

/// Write a managed result into a native return slot, the callback-side
/// inverse of `read_return`: sub-register integral results fill the whole
/// register slot, sign- or zero-extended per the logical type.
pub fn write_return_slot(
    value: &Value,
    layout: &TypeLayout,
    buf: &mut [u8],
) -> Result<(), MarshalError> {
    if matches!(layout.kind(), LayoutKind::Primitive(Primitive::Void)) {
        return Ok(());
    }
    if widens_to_register(layout) {
        let (p, signed) = match layout.kind() {
            LayoutKind::Primitive(p) => (p, p.is_signed()),
            _ => unreachable!(),
        };
        let v = if p == Primitive::Bool {
            match value {
                Value::Bool(b) => *b as i128,
                other => {
                    (other.as_i128().ok_or(MarshalError::TypeMismatch {
                        expected: "bool",
                        got: other.type_name(),
                    })? != 0) as i128
                }
            }
        } else {
            checked_int(value, p)?
        };
        let widened = if signed { (v as i64) as u64 } else { v as u64 };
        write_register(buf, widened);
        return Ok(());
    }
    match layout.kind() {
        LayoutKind::FixedArray => Err(MarshalError::TypeMismatch {
            expected: "scalar, pointer, or struct return",
            got: value.type_name(),
        }),
        _ => {
            let mut aux = Vec::new();
            write_arg(value, layout, buf, &mut aux)?;
            if !aux.is_empty() {
                // An owned payload would dangle the moment this frame returns.
                return Err(MarshalError::TypeMismatch {
                    expected: "non-owned pointer return",
                    got: value.type_name(),
                });
            }
            Ok(())
        }
    }
}

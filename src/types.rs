//! Type descriptors and native layout resolution.
//!
//! Descriptors are the abstract schema objects a managed runtime hands us;
//! layouts are what the calling-convention engine reasons about: size,
//! alignment, kind, and (for aggregates) a flat member list. Resolution is a
//! pure function of the descriptor and results are cached for the process
//! lifetime, keyed by a content hash of the descriptor so structurally equal
//! schema objects collapse to one layout.

use core::fmt;
use core::mem;
use core::ptr;
use std::sync::Arc;

use dashmap::DashMap;
use libffi::raw;
use once_cell::sync::Lazy;

use crate::error::Error;

/// Leaf scalar types known to the primitive registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Primitive {
    Void,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Pointer,
}

impl Primitive {
    pub const ALL: [Self; 13] = [
        Self::Void,
        Self::Bool,
        Self::I8,
        Self::U8,
        Self::I16,
        Self::U16,
        Self::I32,
        Self::U32,
        Self::I64,
        Self::U64,
        Self::F32,
        Self::F64,
        Self::Pointer,
    ];

    /// Size of the type in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Void => 0,
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Pointer => mem::size_of::<*const ()>(),
        }
    }

    /// Alignment requirement in bytes.
    #[inline]
    pub const fn alignment(self) -> usize {
        match self {
            Self::Void => 1,
            other => other.size(),
        }
    }

    /// Registry name, used in error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::Bool => "bool",
            Self::I8 => "int8",
            Self::U8 => "uint8",
            Self::I16 => "int16",
            Self::U16 => "uint16",
            Self::I32 => "int32",
            Self::U32 => "uint32",
            Self::I64 => "int64",
            Self::U64 => "uint64",
            Self::F32 => "float",
            Self::F64 => "double",
            Self::Pointer => "pointer",
        }
    }

    #[inline]
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            Self::I8
                | Self::U8
                | Self::I16
                | Self::U16
                | Self::I32
                | Self::U32
                | Self::I64
                | Self::U64
        )
    }

    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// The engine's built-in `ffi_type` for this scalar.
    ///
    /// The engine has no bool type; it travels as uint8, matching its
    /// 1-byte registry layout.
    fn engine_type(self) -> *mut raw::ffi_type {
        unsafe {
            match self {
                Self::Void => ptr::addr_of_mut!(raw::ffi_type_void),
                Self::Bool | Self::U8 => ptr::addr_of_mut!(raw::ffi_type_uint8),
                Self::I8 => ptr::addr_of_mut!(raw::ffi_type_sint8),
                Self::U16 => ptr::addr_of_mut!(raw::ffi_type_uint16),
                Self::I16 => ptr::addr_of_mut!(raw::ffi_type_sint16),
                Self::U32 => ptr::addr_of_mut!(raw::ffi_type_uint32),
                Self::I32 => ptr::addr_of_mut!(raw::ffi_type_sint32),
                Self::U64 => ptr::addr_of_mut!(raw::ffi_type_uint64),
                Self::I64 => ptr::addr_of_mut!(raw::ffi_type_sint64),
                Self::F32 => ptr::addr_of_mut!(raw::ffi_type_float),
                Self::F64 => ptr::addr_of_mut!(raw::ffi_type_double),
                Self::Pointer => ptr::addr_of_mut!(raw::ffi_type_pointer),
            }
        }
    }
}

/// Shape of an abstract type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DescKind {
    Primitive(Primitive),
    /// Member descriptors in declaration order.
    Struct(Vec<TypeDesc>),
    /// Fixed-length array of a single element type.
    Array { elem: Box<TypeDesc>, len: usize },
}

/// Abstract type descriptor handed in by the managed runtime.
///
/// `indirection` is the pointer depth: 1 is the value type itself, 2 is a
/// pointer to it, and so on. The engine always reasons about at least depth
/// 1; a depth of 0 is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDesc {
    pub kind: DescKind,
    pub indirection: u32,
}

impl TypeDesc {
    #[inline]
    pub fn primitive(p: Primitive) -> Self {
        Self { kind: DescKind::Primitive(p), indirection: 1 }
    }

    pub fn structure(members: impl Into<Vec<TypeDesc>>) -> Self {
        Self { kind: DescKind::Struct(members.into()), indirection: 1 }
    }

    pub fn array(elem: TypeDesc, len: usize) -> Self {
        Self { kind: DescKind::Array { elem: Box::new(elem), len }, indirection: 1 }
    }

    /// A descriptor one pointer level deeper than this one.
    pub fn pointer_to(&self) -> Self {
        Self { kind: self.kind.clone(), indirection: self.indirection + 1 }
    }

    /// Content-based identity token: a structural hash of the canonical
    /// encoding, stable across processes and descriptor instances.
    pub(crate) fn cache_key(&self) -> [u8; 32] {
        let mut buf = Vec::with_capacity(16);
        self.encode(&mut buf);
        *blake3::hash(&buf).as_bytes()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.indirection.to_le_bytes());
        match &self.kind {
            DescKind::Primitive(p) => {
                out.push(0);
                out.push(*p as u8);
            }
            DescKind::Struct(members) => {
                out.push(1);
                out.extend_from_slice(&(members.len() as u32).to_le_bytes());
                for member in members {
                    member.encode(out);
                }
            }
            DescKind::Array { elem, len } => {
                out.push(2);
                out.extend_from_slice(&(*len as u32).to_le_bytes());
                elem.encode(out);
            }
        }
    }
}

/// Kind tag of a resolved layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    Primitive(Primitive),
    Pointer,
    Struct,
    FixedArray,
}

/// Storage backing the engine's view of a type. Scalar and pointer types
/// reference the engine's built-in statics; struct types own their
/// `ffi_type` and the null-terminated member pointer array it references.
enum EngineType {
    Static(*mut raw::ffi_type),
    Struct {
        ty: Box<raw::ffi_type>,
        _elements: Box<[*mut raw::ffi_type]>,
    },
}

/// Resolved native layout of a type.
///
/// Immutable after construction and shared via `Arc`; the engine type
/// storage is never relocated while the layout is alive.
pub struct TypeLayout {
    kind: LayoutKind,
    size: usize,
    alignment: usize,
    indirection: u32,
    /// Struct members flattened in declaration order (a fixed-length array
    /// member contributes `len` repeated element entries), or the repeated
    /// element of a fixed array.
    elements: Vec<Arc<TypeLayout>>,
    /// Byte offset of each flattened struct element.
    element_offsets: Vec<usize>,
    engine: EngineType,
}

unsafe impl Send for TypeLayout {}
unsafe impl Sync for TypeLayout {}

impl TypeLayout {
    #[inline]
    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    pub fn indirection(&self) -> u32 {
        self.indirection
    }

    #[inline]
    pub fn elements(&self) -> &[Arc<TypeLayout>] {
        &self.elements
    }

    #[inline]
    pub fn element_offsets(&self) -> &[usize] {
        &self.element_offsets
    }

    /// The engine descriptor for this type.
    pub(crate) fn engine_type(&self) -> *mut raw::ffi_type {
        match &self.engine {
            EngineType::Static(ty) => *ty,
            EngineType::Struct { ty, .. } => &**ty as *const raw::ffi_type as *mut raw::ffi_type,
        }
    }
}

impl PartialEq for TypeLayout {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.size == other.size
            && self.alignment == other.alignment
            && self.indirection == other.indirection
            && self.element_offsets == other.element_offsets
            && self.elements.len() == other.elements.len()
            && self.elements.iter().zip(&other.elements).all(|(a, b)| **a == **b)
    }
}

impl fmt::Debug for TypeLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeLayout")
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("indirection", &self.indirection)
            .field("elements", &self.elements.len())
            .finish()
    }
}

/// Process-lifetime layout cache keyed by descriptor content.
static LAYOUT_CACHE: Lazy<DashMap<[u8; 32], Arc<TypeLayout>>> = Lazy::new(DashMap::new);

/// Resolve a descriptor to its native layout.
///
/// Structurally equal descriptors return the identical cached `Arc`, so
/// repeated resolution of the same schema object never rebuilds layout.
pub fn resolve(desc: &TypeDesc) -> Result<Arc<TypeLayout>, Error> {
    if desc.indirection < 1 {
        return Err(Error::InvalidTypeDescriptor {
            reason: "indirection must be at least 1".into(),
        });
    }

    let key = desc.cache_key();
    if let Some(hit) = LAYOUT_CACHE.get(&key) {
        tracing::trace!(target: "types", "layout cache hit");
        return Ok(hit.clone());
    }

    let built = Arc::new(build_layout(desc)?);
    let entry = LAYOUT_CACHE.entry(key).or_insert(built);
    Ok(entry.value().clone())
}

fn build_layout(desc: &TypeDesc) -> Result<TypeLayout, Error> {
    // Multi-level indirection always marshals as "pass an address".
    if desc.indirection > 1 {
        return Ok(pointer_layout(desc.indirection));
    }

    match &desc.kind {
        DescKind::Primitive(p) => Ok(primitive_layout(*p)),
        DescKind::Array { elem, len } => array_layout(elem, *len),
        DescKind::Struct(members) => struct_layout(members),
    }
}

fn primitive_layout(p: Primitive) -> TypeLayout {
    let kind = if p == Primitive::Pointer { LayoutKind::Pointer } else { LayoutKind::Primitive(p) };
    TypeLayout {
        kind,
        size: p.size(),
        alignment: p.alignment(),
        indirection: 1,
        elements: Vec::new(),
        element_offsets: Vec::new(),
        engine: EngineType::Static(p.engine_type()),
    }
}

fn pointer_layout(indirection: u32) -> TypeLayout {
    TypeLayout {
        kind: LayoutKind::Pointer,
        size: Primitive::Pointer.size(),
        alignment: Primitive::Pointer.alignment(),
        indirection,
        elements: Vec::new(),
        element_offsets: Vec::new(),
        engine: EngineType::Static(Primitive::Pointer.engine_type()),
    }
}

/// A fixed-length array resolves to its own layout, but as a call argument
/// it travels by reference like any C array.
fn array_layout(elem: &TypeDesc, len: usize) -> Result<TypeLayout, Error> {
    if len == 0 {
        return Err(Error::InvalidTypeDescriptor {
            reason: "fixed array length must be non-zero".into(),
        });
    }
    let elem_layout = resolve(elem)?;
    if elem_layout.size() == 0 {
        return Err(Error::InvalidTypeDescriptor {
            reason: "fixed array of a zero-sized element".into(),
        });
    }
    Ok(TypeLayout {
        kind: LayoutKind::FixedArray,
        size: elem_layout.size() * len,
        alignment: elem_layout.alignment(),
        indirection: 1,
        elements: vec![elem_layout; len],
        element_offsets: Vec::new(),
        engine: EngineType::Static(Primitive::Pointer.engine_type()),
    })
}

fn struct_layout(members: &[TypeDesc]) -> Result<TypeLayout, Error> {
    if members.is_empty() {
        return Err(Error::InvalidTypeDescriptor {
            reason: "struct must declare at least one member".into(),
        });
    }

    // The engine represents a struct as a flat, null-terminated list of
    // member type pointers; a fixed-length array member contributes one
    // entry per element rather than a single combined entry.
    let mut flattened: Vec<Arc<TypeLayout>> = Vec::with_capacity(members.len());
    for member in members {
        let layout = resolve(member)?;
        match layout.kind() {
            LayoutKind::FixedArray => {
                for elem in layout.elements() {
                    flattened.push(elem.clone());
                }
            }
            LayoutKind::Primitive(Primitive::Void) => {
                return Err(Error::InvalidTypeDescriptor {
                    reason: "struct member cannot be void".into(),
                });
            }
            _ => flattened.push(layout),
        }
    }

    let mut elements: Vec<*mut raw::ffi_type> = Vec::with_capacity(flattened.len() + 1);
    elements.extend(flattened.iter().map(|l| l.engine_type()));
    elements.push(ptr::null_mut());
    let mut elements = elements.into_boxed_slice();

    let mut ty = Box::new(raw::ffi_type {
        size: 0,
        alignment: 0,
        type_: raw::FFI_TYPE_STRUCT as u16,
        elements: elements.as_mut_ptr(),
    });

    // Aggregate size, alignment, and element offsets are the engine's call:
    // it applies the target ABI's padding rules directly to our member list.
    let mut offsets = vec![0usize; flattened.len()];
    let status = unsafe {
        raw::ffi_get_struct_offsets(
            raw::ffi_abi_FFI_DEFAULT_ABI,
            &mut *ty,
            offsets.as_mut_ptr(),
        )
    };
    if status != raw::ffi_status_FFI_OK {
        return Err(Error::InvalidTypeDescriptor {
            reason: format!("engine rejected struct layout (status {})", status),
        });
    }

    Ok(TypeLayout {
        kind: LayoutKind::Struct,
        size: ty.size,
        alignment: ty.alignment as usize,
        indirection: 1,
        elements: flattened,
        element_offsets: offsets,
        engine: EngineType::Struct { ty, _elements: elements },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_layouts_have_nonzero_size() {
        for p in Primitive::ALL {
            if p == Primitive::Void {
                continue;
            }
            let layout = resolve(&TypeDesc::primitive(p)).unwrap();
            assert!(layout.size() > 0, "{} has zero size", p.name());
            assert!(layout.alignment() > 0);
        }
    }

    #[test]
    fn zero_indirection_is_rejected() {
        let mut desc = TypeDesc::primitive(Primitive::I32);
        desc.indirection = 0;
        assert!(matches!(resolve(&desc), Err(Error::InvalidTypeDescriptor { .. })));
    }

    #[test]
    fn multi_level_indirection_is_a_flat_pointer() {
        let desc = TypeDesc::structure(vec![TypeDesc::primitive(Primitive::F64)])
            .pointer_to()
            .pointer_to();
        let layout = resolve(&desc).unwrap();
        assert_eq!(layout.kind(), LayoutKind::Pointer);
        assert_eq!(layout.size(), core::mem::size_of::<*const ()>());
        assert!(layout.elements().is_empty());
    }

    #[test]
    fn struct_flattens_fixed_arrays_into_repeated_elements() {
        // 3 members, one a fixed array of length 4: (3 - 1) + 4 elements.
        let desc = TypeDesc::structure(vec![
            TypeDesc::primitive(Primitive::I32),
            TypeDesc::array(TypeDesc::primitive(Primitive::I16), 4),
            TypeDesc::primitive(Primitive::F64),
        ]);
        let layout = resolve(&desc).unwrap();
        assert_eq!(layout.kind(), LayoutKind::Struct);
        assert_eq!(layout.elements().len(), 6);
        assert_eq!(layout.element_offsets().len(), 6);
        // i32, 4 x i16 (offset 4..), f64 aligned to 8: C layout says 24.
        assert_eq!(layout.size(), 24);
        assert_eq!(layout.alignment(), 8);
    }

    #[test]
    fn struct_layout_matches_repr_c() {
        #[repr(C)]
        struct Mixed {
            a: u8,
            b: u32,
            c: u16,
        }
        let desc = TypeDesc::structure(vec![
            TypeDesc::primitive(Primitive::U8),
            TypeDesc::primitive(Primitive::U32),
            TypeDesc::primitive(Primitive::U16),
        ]);
        let layout = resolve(&desc).unwrap();
        assert_eq!(layout.size(), core::mem::size_of::<Mixed>());
        assert_eq!(layout.alignment(), core::mem::align_of::<Mixed>());
        assert_eq!(layout.element_offsets(), &[0, 4, 8]);
    }

    #[test]
    fn resolution_is_idempotent_and_cached() {
        let a = TypeDesc::structure(vec![
            TypeDesc::primitive(Primitive::I32),
            TypeDesc::primitive(Primitive::I32),
        ]);
        // A structurally equal descriptor built from scratch.
        let b = TypeDesc::structure(vec![
            TypeDesc::primitive(Primitive::I32),
            TypeDesc::primitive(Primitive::I32),
        ]);
        let la = resolve(&a).unwrap();
        let lb = resolve(&b).unwrap();
        assert!(Arc::ptr_eq(&la, &lb));
        assert_eq!(*la, *lb);
    }

    #[test]
    fn empty_struct_is_rejected() {
        let desc = TypeDesc::structure(Vec::new());
        assert!(matches!(resolve(&desc), Err(Error::InvalidTypeDescriptor { .. })));
    }

    #[test]
    fn top_level_array_passes_by_reference() {
        let desc = TypeDesc::array(TypeDesc::primitive(Primitive::F32), 8);
        let layout = resolve(&desc).unwrap();
        assert_eq!(layout.kind(), LayoutKind::FixedArray);
        assert_eq!(layout.size(), 32);
        assert_eq!(layout.elements().len(), 8);
    }
}

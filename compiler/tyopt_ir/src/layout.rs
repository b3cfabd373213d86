//! Data layout service.
//!
//! Answers the two questions the layout optimizer asks about memory:
//! how many bytes a type occupies, and at which byte offset a struct field
//! starts. The optimizer reads offsets of the *original* types, so a layout
//! must be computable for any node in the pool, old or new.
//!
//! Byte-layout structs are laid out in sequence like any other struct. The
//! overlap they permit comes from reading their storage through pointers of
//! other types, not from sharing field offsets.

use std::cell::RefCell;

use rustc_hash::FxHashMap;

use crate::pool::TypePool;
use crate::ty::{TypeId, TypeKind};

/// Size and offset queries over a [`TypePool`].
pub trait DataLayout {
    /// Allocation size of `ty` in bytes, including tail padding.
    fn alloc_size(&self, pool: &TypePool, ty: TypeId) -> u64;

    /// Byte offset of field `index` within struct `st`.
    fn field_offset(&self, pool: &TypePool, st: TypeId, index: usize) -> u64;
}

/// Computed layout of one struct.
#[derive(Clone, Debug, PartialEq, Eq)]
struct StructLayout {
    offsets: Vec<u64>,
    size: u64,
    align: u64,
}

/// Natural-alignment layout for a target with a configurable pointer width.
///
/// Integers round up to a power-of-two byte size and align to it (capped at
/// 8), floats are 4 or 8 bytes, packed structs get no padding.
///
/// # Interior Mutability
///
/// Struct layouts are cached in a `RefCell` so that queries can take `&self`.
/// The cache is never borrowed across a recursive layout computation.
#[derive(Debug)]
pub struct TargetLayout {
    pointer_bytes: u64,
    structs: RefCell<FxHashMap<TypeId, StructLayout>>,
}

impl Default for TargetLayout {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TargetLayout {
    /// Create a layout with `pointer_bytes`-wide pointers.
    pub fn new(pointer_bytes: u64) -> Self {
        Self {
            pointer_bytes,
            structs: RefCell::new(FxHashMap::default()),
        }
    }

    #[inline]
    pub fn pointer_bytes(&self) -> u64 {
        self.pointer_bytes
    }

    /// Preferred alignment of `ty` in bytes.
    pub fn align_of(&self, pool: &TypePool, ty: TypeId) -> u64 {
        match pool.kind(ty) {
            TypeKind::Void | TypeKind::Function { .. } => 1,
            TypeKind::Int { bits } => int_bytes(*bits).min(8),
            TypeKind::Float { bits } => u64::from(*bits / 8),
            TypeKind::Pointer { .. } => self.pointer_bytes,
            TypeKind::Array { elem, .. } => self.align_of(pool, *elem),
            TypeKind::Struct(_) => self.struct_layout(pool, ty).align,
        }
    }

    fn struct_layout(&self, pool: &TypePool, st: TypeId) -> StructLayout {
        if let Some(cached) = self.structs.borrow().get(&st) {
            return cached.clone();
        }
        let Some(s) = pool.as_struct(st) else {
            return StructLayout {
                offsets: Vec::new(),
                size: 0,
                align: 1,
            };
        };
        let packed = s.is_packed();
        let mut offsets = Vec::with_capacity(s.fields().len());
        let mut offset = 0u64;
        let mut align = 1u64;
        for &field in s.fields() {
            let field_align = if packed { 1 } else { self.align_of(pool, field) };
            offset = round_up(offset, field_align);
            offsets.push(offset);
            offset += self.alloc_size(pool, field);
            align = align.max(field_align);
        }
        let layout = StructLayout {
            offsets,
            size: round_up(offset, align),
            align,
        };
        self.structs.borrow_mut().insert(st, layout.clone());
        layout
    }
}

impl DataLayout for TargetLayout {
    fn alloc_size(&self, pool: &TypePool, ty: TypeId) -> u64 {
        match pool.kind(ty) {
            TypeKind::Void | TypeKind::Function { .. } => 0,
            TypeKind::Int { bits } => int_bytes(*bits),
            TypeKind::Float { bits } => u64::from(*bits / 8),
            TypeKind::Pointer { .. } => self.pointer_bytes,
            TypeKind::Array { elem, len } => self.alloc_size(pool, *elem) * len,
            TypeKind::Struct(_) => self.struct_layout(pool, ty).size,
        }
    }

    fn field_offset(&self, pool: &TypePool, st: TypeId, index: usize) -> u64 {
        self.struct_layout(pool, st)
            .offsets
            .get(index)
            .copied()
            .unwrap_or_else(|| {
                panic!(
                    "field {index} out of range for struct `{}`",
                    pool.display(st)
                )
            })
    }
}

/// Storage bytes of an integer: whole bytes rounded up to a power of two.
fn int_bytes(bits: u32) -> u64 {
    u64::from(bits.div_ceil(8)).next_power_of_two()
}

fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

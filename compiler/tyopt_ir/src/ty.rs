//! Type handles and type node shapes.
//!
//! `TypeId` is the only way the rest of the optimizer refers to a type.
//! Types live in a [`TypePool`](crate::TypePool) and are compared by index.
//!
//! # Identity
//!
//! - Scalars, pointers, arrays and function types are structurally interned:
//!   building `ptr(i32)` twice yields the same `TypeId`.
//! - Structs are nominal: every struct created through the pool is a fresh
//!   node, even when its body matches an existing one. This is what lets a
//!   struct refer to itself through a pointer field.

use std::fmt;

use bitflags::bitflags;

/// A 32-bit index into the type pool.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TypeId(u32);

impl TypeId {
    // === Pre-interned scalars (indices 0-7) ===

    /// The `void` type. Only valid as a function return type.
    pub const VOID: Self = Self(0);
    /// 1-bit integer (booleans).
    pub const I1: Self = Self(1);
    /// 8-bit integer.
    pub const I8: Self = Self(2);
    /// 16-bit integer.
    pub const I16: Self = Self(3);
    /// 32-bit integer.
    pub const I32: Self = Self(4);
    /// 64-bit integer.
    pub const I64: Self = Self(5);
    /// 32-bit float.
    pub const F32: Self = Self(6);
    /// 64-bit float.
    pub const F64: Self = Self(7);

    /// Number of pre-interned scalar types.
    pub const PREINTERNED: u32 = 8;

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Check if this is one of the pre-interned scalars.
    #[inline]
    pub const fn is_preinterned(self) -> bool {
        self.0 < Self::PREINTERNED
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::VOID => write!(f, "TypeId(void)"),
            Self::I1 => write!(f, "TypeId(i1)"),
            Self::I8 => write!(f, "TypeId(i8)"),
            Self::I16 => write!(f, "TypeId(i16)"),
            Self::I32 => write!(f, "TypeId(i32)"),
            Self::I64 => write!(f, "TypeId(i64)"),
            Self::F32 => write!(f, "TypeId(f32)"),
            Self::F64 => write!(f, "TypeId(f64)"),
            Self(raw) => write!(f, "TypeId({raw})"),
        }
    }
}

bitflags! {
    /// Attributes a struct node carries.
    ///
    /// Every struct-specific transformation rule matches on this set instead
    /// of on loose booleans spread across the struct node.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
    pub struct StructAttrs: u8 {
        /// Storage reinterpreted through views of other types (union
        /// semantics). Fields are laid out in sequence like any struct, but
        /// byte offsets of every field are meaningful and fields are never
        /// reordered.
        const BYTE_LAYOUT = 1 << 0;
        /// Opaque low-level allocation region. Fields are rewritten one by
        /// one but never merged and the struct never collapses.
        const RAW_MEMORY = 1 << 1;
        /// Laid out without padding.
        const PACKED = 1 << 2;
        /// Host-provided object type. Never rewritten.
        const CLIENT = 1 << 3;
        /// Visible to the host under its own name. Never collapsed.
        const EXPORTED = 1 << 4;
    }
}

/// A struct type node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StructType {
    /// Optional display name.
    pub name: Option<String>,
    /// Field types. `None` for an opaque struct whose body was never set.
    pub body: Option<Vec<TypeId>>,
    /// Single-inheritance parent. The base's fields are a prefix of ours.
    pub direct_base: Option<TypeId>,
    pub attrs: StructAttrs,
}

impl StructType {
    /// Field types, empty for opaque structs.
    #[inline]
    pub fn fields(&self) -> &[TypeId] {
        self.body.as_deref().unwrap_or(&[])
    }

    #[inline]
    pub fn is_opaque(&self) -> bool {
        self.body.is_none()
    }

    #[inline]
    pub fn has_byte_layout(&self) -> bool {
        self.attrs.contains(StructAttrs::BYTE_LAYOUT)
    }

    #[inline]
    pub fn is_raw_memory(&self) -> bool {
        self.attrs.contains(StructAttrs::RAW_MEMORY)
    }

    #[inline]
    pub fn is_packed(&self) -> bool {
        self.attrs.contains(StructAttrs::PACKED)
    }
}

/// The shape of a type node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Int {
        bits: u32,
    },
    Float {
        bits: u32,
    },
    Pointer {
        pointee: TypeId,
    },
    Array {
        elem: TypeId,
        len: u64,
    },
    Function {
        ret: TypeId,
        params: Vec<TypeId>,
        variadic: bool,
    },
    Struct(StructType),
}

impl TypeKind {
    /// Short tag used in diagnostics.
    pub fn tag_name(&self) -> &'static str {
        match self {
            TypeKind::Void => "void",
            TypeKind::Int { .. } => "int",
            TypeKind::Float { .. } => "float",
            TypeKind::Pointer { .. } => "pointer",
            TypeKind::Array { .. } => "array",
            TypeKind::Function { .. } => "function",
            TypeKind::Struct(_) => "struct",
        }
    }
}

#[cfg(test)]
mod tests;

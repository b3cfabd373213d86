//! The type pool.
//!
//! Stores every type node of a program and hands out [`TypeId`] handles.
//! Nodes are append-only: once created a node is never changed, except that
//! an opaque struct may receive its body exactly once.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::ty::{StructAttrs, StructType, TypeId, TypeKind};

/// Arena of type nodes with structural interning for non-struct types.
#[derive(Clone, Debug)]
pub struct TypePool {
    nodes: Vec<TypeKind>,
    interned: FxHashMap<TypeKind, TypeId>,
}

impl Default for TypePool {
    fn default() -> Self {
        Self::new()
    }
}

impl TypePool {
    /// Create a pool with the scalar types pre-interned at their fixed indices.
    pub fn new() -> Self {
        let mut pool = Self {
            nodes: Vec::with_capacity(64),
            interned: FxHashMap::default(),
        };
        let scalars = [
            (TypeKind::Void, TypeId::VOID),
            (TypeKind::Int { bits: 1 }, TypeId::I1),
            (TypeKind::Int { bits: 8 }, TypeId::I8),
            (TypeKind::Int { bits: 16 }, TypeId::I16),
            (TypeKind::Int { bits: 32 }, TypeId::I32),
            (TypeKind::Int { bits: 64 }, TypeId::I64),
            (TypeKind::Float { bits: 32 }, TypeId::F32),
            (TypeKind::Float { bits: 64 }, TypeId::F64),
        ];
        for (kind, expected) in scalars {
            let id = pool.intern(kind);
            debug_assert_eq!(id, expected);
        }
        pool
    }

    /// Number of type nodes in the pool.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, kind: TypeKind) -> TypeId {
        let id = TypeId::from_raw(
            u32::try_from(self.nodes.len())
                .unwrap_or_else(|_| panic!("type count exceeds u32::MAX")),
        );
        self.nodes.push(kind);
        id
    }

    fn intern(&mut self, kind: TypeKind) -> TypeId {
        debug_assert!(
            !matches!(kind, TypeKind::Struct(_)),
            "structs are nominal and never interned"
        );
        if let Some(&id) = self.interned.get(&kind) {
            return id;
        }
        let id = self.push(kind.clone());
        self.interned.insert(kind, id);
        id
    }

    // === Constructors ===

    /// Integer type of the given width.
    pub fn int(&mut self, bits: u32) -> TypeId {
        self.intern(TypeKind::Int { bits })
    }

    /// Floating point type of the given width (32 or 64).
    pub fn float(&mut self, bits: u32) -> TypeId {
        self.intern(TypeKind::Float { bits })
    }

    /// Pointer to `pointee`.
    pub fn pointer(&mut self, pointee: TypeId) -> TypeId {
        self.intern(TypeKind::Pointer { pointee })
    }

    /// Array of `len` elements of type `elem`.
    pub fn array(&mut self, elem: TypeId, len: u64) -> TypeId {
        self.intern(TypeKind::Array { elem, len })
    }

    /// Function type `ret (params...)`.
    pub fn function(&mut self, ret: TypeId, params: &[TypeId], variadic: bool) -> TypeId {
        self.intern(TypeKind::Function {
            ret,
            params: params.to_vec(),
            variadic,
        })
    }

    /// Create a fresh opaque struct. Give it a body with
    /// [`set_struct_body`](Self::set_struct_body).
    pub fn create_struct(&mut self, name: Option<&str>, attrs: StructAttrs) -> TypeId {
        self.push(TypeKind::Struct(StructType {
            name: name.map(str::to_owned),
            body: None,
            direct_base: None,
            attrs,
        }))
    }

    /// Set the body of a struct created by [`create_struct`](Self::create_struct).
    ///
    /// # Panics
    ///
    /// Panics if `st` is not a struct or already has a body.
    pub fn set_struct_body(&mut self, st: TypeId, fields: Vec<TypeId>, direct_base: Option<TypeId>) {
        match &mut self.nodes[st.index()] {
            TypeKind::Struct(s) => {
                assert!(s.body.is_none(), "struct {} already has a body", st.raw());
                s.body = Some(fields);
                s.direct_base = direct_base;
            }
            other => panic!("set_struct_body on non-struct type `{}`", other.tag_name()),
        }
    }

    /// Create a struct with the given fields in one step.
    pub fn struct_type(&mut self, name: Option<&str>, fields: &[TypeId], attrs: StructAttrs) -> TypeId {
        let st = self.create_struct(name, attrs);
        self.set_struct_body(st, fields.to_vec(), None);
        st
    }

    /// Create a struct whose leading fields are inherited from `base`.
    ///
    /// `fields` is the complete field list, base prefix included.
    pub fn derived_struct(
        &mut self,
        name: Option<&str>,
        base: TypeId,
        fields: &[TypeId],
        attrs: StructAttrs,
    ) -> TypeId {
        debug_assert!(
            self.struct_fields(base).len() <= fields.len()
                && self.struct_fields(base) == &fields[..self.struct_fields(base).len()],
            "derived struct must start with its base's fields"
        );
        let st = self.create_struct(name, attrs);
        self.set_struct_body(st, fields.to_vec(), Some(base));
        st
    }

    // === Queries ===

    #[inline]
    pub fn kind(&self, ty: TypeId) -> &TypeKind {
        &self.nodes[ty.index()]
    }

    #[inline]
    pub fn as_struct(&self, ty: TypeId) -> Option<&StructType> {
        match self.kind(ty) {
            TypeKind::Struct(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn is_struct(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Struct(_))
    }

    #[inline]
    pub fn is_array(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Array { .. })
    }

    #[inline]
    pub fn is_pointer(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Pointer { .. })
    }

    #[inline]
    pub fn is_int(&self, ty: TypeId) -> bool {
        matches!(self.kind(ty), TypeKind::Int { .. })
    }

    /// Width of an integer type.
    pub fn int_bits(&self, ty: TypeId) -> Option<u32> {
        match self.kind(ty) {
            TypeKind::Int { bits } => Some(*bits),
            _ => None,
        }
    }

    pub fn pointee(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Pointer { pointee } => Some(*pointee),
            _ => None,
        }
    }

    pub fn array_elem(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Array { elem, .. } => Some(*elem),
            _ => None,
        }
    }

    pub fn array_len(&self, ty: TypeId) -> Option<u64> {
        match self.kind(ty) {
            TypeKind::Array { len, .. } => Some(*len),
            _ => None,
        }
    }

    /// Element type for pointer or array stepping.
    pub fn sequential_elem(&self, ty: TypeId) -> Option<TypeId> {
        match self.kind(ty) {
            TypeKind::Pointer { pointee } => Some(*pointee),
            TypeKind::Array { elem, .. } => Some(*elem),
            _ => None,
        }
    }

    /// Field types of a struct; empty for non-structs and opaque structs.
    pub fn struct_fields(&self, ty: TypeId) -> &[TypeId] {
        self.as_struct(ty).map_or(&[], StructType::fields)
    }

    pub fn struct_field(&self, ty: TypeId, index: usize) -> Option<TypeId> {
        self.struct_fields(ty).get(index).copied()
    }

    pub fn direct_base(&self, ty: TypeId) -> Option<TypeId> {
        self.as_struct(ty).and_then(|s| s.direct_base)
    }

    pub fn struct_attrs(&self, ty: TypeId) -> StructAttrs {
        self.as_struct(ty).map_or(StructAttrs::empty(), |s| s.attrs)
    }

    /// Return type, parameter types and variadic flag of a function type.
    pub fn function_sig(&self, ty: TypeId) -> Option<(TypeId, &[TypeId], bool)> {
        match self.kind(ty) {
            TypeKind::Function {
                ret,
                params,
                variadic,
            } => Some((*ret, params.as_slice(), *variadic)),
            _ => None,
        }
    }

    /// All struct type ids in creation order.
    pub fn structs(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.nodes.iter().enumerate().filter_map(|(i, k)| {
            matches!(k, TypeKind::Struct(_)).then(|| TypeId::from_raw(i as u32))
        })
    }

    /// The type reached by walking `steps` from `ty`.
    ///
    /// Each step is a field index for structs or an element index for arrays
    /// and pointers; `None` marks a non-constant index, which is only valid
    /// for arrays and pointers. Returns `None` when a step does not apply.
    pub fn walk_indices(
        &self,
        ty: TypeId,
        steps: impl IntoIterator<Item = Option<u64>>,
    ) -> Option<TypeId> {
        let mut cur = ty;
        for step in steps {
            cur = match self.kind(cur) {
                TypeKind::Struct(s) => *s.fields().get(usize::try_from(step?).ok()?)?,
                TypeKind::Array { elem, .. } => *elem,
                TypeKind::Pointer { pointee } => *pointee,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// Render a type for diagnostics.
    pub fn display(&self, ty: TypeId) -> TypeDisplay<'_> {
        TypeDisplay { pool: self, ty }
    }
}

/// Display adapter returned by [`TypePool::display`].
pub struct TypeDisplay<'a> {
    pool: &'a TypePool,
    ty: TypeId,
}

impl fmt::Display for TypeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = self.pool;
        match pool.kind(self.ty) {
            TypeKind::Void => write!(f, "void"),
            TypeKind::Int { bits } => write!(f, "i{bits}"),
            TypeKind::Float { bits: 32 } => write!(f, "float"),
            TypeKind::Float { bits } => write!(f, "f{bits}"),
            TypeKind::Pointer { pointee } => write!(f, "{}*", pool.display(*pointee)),
            TypeKind::Array { elem, len } => write!(f, "[{len} x {}]", pool.display(*elem)),
            TypeKind::Function {
                ret,
                params,
                variadic,
            } => {
                write!(f, "{} (", pool.display(*ret))?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", pool.display(*p))?;
                }
                if *variadic {
                    write!(f, "{}...", if params.is_empty() { "" } else { ", " })?;
                }
                write!(f, ")")
            }
            // Structs print by name only; bodies may be recursive.
            TypeKind::Struct(s) => match &s.name {
                Some(name) => write!(f, "%{name}"),
                None => write!(f, "%struct.{}", self.ty.raw()),
            },
        }
    }
}

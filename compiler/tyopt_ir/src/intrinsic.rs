//! Built-in intrinsic catalogue.
//!
//! Intrinsics are function declarations the backend understands natively.
//! Most of them are overloaded on one or more of their signature types; the
//! declaration name encodes those types, so a declaration whose operand
//! types change must be replaced by a differently named variant.

use smallvec::{smallvec, SmallVec};

use crate::pool::TypePool;
use crate::ty::{TypeId, TypeKind};

/// A built-in function understood by the backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Intrinsic {
    /// `ret downcast(src, offset)`: narrow a base pointer to a derived one.
    Downcast,
    /// `ret virtualcast(src, index)`: narrow through a virtual base.
    VirtualCast,
    /// `ret upcast_collapsed(src)`: widen to a base that may have collapsed.
    UpcastCollapsed,
    CastUser,
    Reallocate,
    MakeCompleteObject,
    DowncastCurrent,
    GetArrayLen,
    Deallocate,
    PointerKind,
    LifetimeStart,
    LifetimeEnd,
    Allocate,
    AllocateArray,
    CreateClosure,
    /// `memcpy(dst, src, len)`: copies a whole aggregate.
    Memcpy,
    /// `memmove(dst, src, len)`: copies a whole aggregate.
    Memmove,
    /// `memset(dst, byte, len)`.
    Memset,
}

impl Intrinsic {
    /// Unmangled declaration name.
    pub fn base_name(self) -> &'static str {
        match self {
            Intrinsic::Downcast => "tyopt.downcast",
            Intrinsic::VirtualCast => "tyopt.virtualcast",
            Intrinsic::UpcastCollapsed => "tyopt.upcast.collapsed",
            Intrinsic::CastUser => "tyopt.cast.user",
            Intrinsic::Reallocate => "tyopt.reallocate",
            Intrinsic::MakeCompleteObject => "tyopt.make.complete.object",
            Intrinsic::DowncastCurrent => "tyopt.downcast.current",
            Intrinsic::GetArrayLen => "tyopt.get.array.len",
            Intrinsic::Deallocate => "tyopt.deallocate",
            Intrinsic::PointerKind => "tyopt.pointer.kind",
            Intrinsic::LifetimeStart => "tyopt.lifetime.start",
            Intrinsic::LifetimeEnd => "tyopt.lifetime.end",
            Intrinsic::Allocate => "tyopt.allocate",
            Intrinsic::AllocateArray => "tyopt.allocate.array",
            Intrinsic::CreateClosure => "tyopt.create.closure",
            Intrinsic::Memcpy => "tyopt.memcpy",
            Intrinsic::Memmove => "tyopt.memmove",
            Intrinsic::Memset => "tyopt.memset",
        }
    }

    /// Whether this intrinsic copies whole aggregates between its operands.
    pub fn copies_aggregates(self) -> bool {
        matches!(self, Intrinsic::Memcpy | Intrinsic::Memmove)
    }

    /// Pick the overloaded types out of a function type of this intrinsic.
    ///
    /// Returns an empty list if `fn_ty` is not a function type or lacks
    /// the parameters this intrinsic overloads on.
    pub fn overloaded_types(self, pool: &TypePool, fn_ty: TypeId) -> SmallVec<[TypeId; 3]> {
        let Some((ret, params, _)) = pool.function_sig(fn_ty) else {
            return SmallVec::new();
        };
        let param = |i: usize| params.get(i).copied();
        let picked: Option<SmallVec<[TypeId; 3]>> = match self {
            Intrinsic::UpcastCollapsed
            | Intrinsic::CastUser
            | Intrinsic::Downcast
            | Intrinsic::VirtualCast
            | Intrinsic::Reallocate
            | Intrinsic::MakeCompleteObject => param(0).map(|p0| smallvec![ret, p0]),
            Intrinsic::DowncastCurrent
            | Intrinsic::GetArrayLen
            | Intrinsic::Deallocate
            | Intrinsic::PointerKind => param(0).map(|p0| smallvec![p0]),
            Intrinsic::LifetimeStart | Intrinsic::LifetimeEnd => param(1).map(|p1| smallvec![p1]),
            Intrinsic::Allocate | Intrinsic::AllocateArray => Some(smallvec![ret]),
            Intrinsic::CreateClosure => match (param(0), param(1)) {
                (Some(p0), Some(p1)) => Some(smallvec![ret, p0, p1]),
                _ => None,
            },
            Intrinsic::Memcpy | Intrinsic::Memmove => match (param(0), param(1), param(2)) {
                (Some(p0), Some(p1), Some(p2)) => Some(smallvec![p0, p1, p2]),
                _ => None,
            },
            Intrinsic::Memset => match (param(0), param(2)) {
                (Some(p0), Some(p2)) => Some(smallvec![p0, p2]),
                _ => None,
            },
        };
        picked.unwrap_or_default()
    }

    /// Declaration name for the given overloaded types.
    pub fn mangled_name(self, pool: &TypePool, tys: &[TypeId]) -> String {
        let mut name = String::from(self.base_name());
        for &ty in tys {
            name.push('.');
            mangle_type(pool, ty, &mut name);
        }
        name
    }

    /// Build the function type of this intrinsic for the given overloaded types.
    ///
    /// Inverse of [`overloaded_types`](Self::overloaded_types).
    pub fn signature(self, pool: &mut TypePool, tys: &[TypeId]) -> TypeId {
        let ty = |i: usize| tys.get(i).copied().unwrap_or(TypeId::VOID);
        let (ret, params): (TypeId, SmallVec<[TypeId; 5]>) = match self {
            Intrinsic::Downcast | Intrinsic::VirtualCast | Intrinsic::Reallocate => {
                (ty(0), smallvec![ty(1), TypeId::I32])
            }
            Intrinsic::UpcastCollapsed | Intrinsic::CastUser | Intrinsic::MakeCompleteObject => {
                (ty(0), smallvec![ty(1)])
            }
            Intrinsic::DowncastCurrent | Intrinsic::GetArrayLen | Intrinsic::PointerKind => {
                (TypeId::I32, smallvec![ty(0)])
            }
            Intrinsic::Deallocate => (TypeId::VOID, smallvec![ty(0)]),
            Intrinsic::LifetimeStart | Intrinsic::LifetimeEnd => {
                (TypeId::VOID, smallvec![TypeId::I64, ty(0)])
            }
            Intrinsic::Allocate | Intrinsic::AllocateArray => (ty(0), smallvec![TypeId::I32]),
            Intrinsic::CreateClosure => (ty(0), smallvec![ty(1), ty(2)]),
            Intrinsic::Memcpy | Intrinsic::Memmove => (TypeId::VOID, smallvec![ty(0), ty(1), ty(2)]),
            Intrinsic::Memset => (TypeId::VOID, smallvec![ty(0), TypeId::I8, ty(1)]),
        };
        pool.function(ret, &params, false)
    }
}

fn mangle_type(pool: &TypePool, ty: TypeId, out: &mut String) {
    match pool.kind(ty) {
        TypeKind::Void => out.push_str("isVoid"),
        TypeKind::Int { bits } => out.push_str(&format!("i{bits}")),
        TypeKind::Float { bits } => out.push_str(&format!("f{bits}")),
        TypeKind::Pointer { pointee } => {
            out.push_str("p0");
            mangle_type(pool, *pointee, out);
        }
        TypeKind::Array { elem, len } => {
            out.push_str(&format!("a{len}"));
            mangle_type(pool, *elem, out);
        }
        TypeKind::Function { ret, params, .. } => {
            out.push_str("f_");
            mangle_type(pool, *ret, out);
            for &p in params {
                mangle_type(pool, p, out);
            }
            out.push_str("f");
        }
        // Struct names are not unique; the raw id is.
        TypeKind::Struct(s) => match &s.name {
            Some(name) => out.push_str(&format!("s_{name}.{}", ty.raw())),
            None => out.push_str(&format!("sl_{}", ty.raw())),
        },
    }
}

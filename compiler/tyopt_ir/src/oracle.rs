//! Pointer-kind queries.
//!
//! The layout optimizer only needs one answer from the pointer-kind
//! analysis of the surrounding pipeline: whether a struct is a host-provided
//! (client) object. Client objects keep their layout, and a wrapper whose
//! only field points to one may always collapse.

use crate::pool::TypePool;
use crate::ty::{StructAttrs, TypeId};

/// Answers pointer-kind questions about struct types.
pub trait PointerKindOracle {
    /// Whether `ty` is a host-provided object type.
    fn is_client(&self, pool: &TypePool, ty: TypeId) -> bool;
}

/// Oracle that reads the [`StructAttrs::CLIENT`] attribute.
#[derive(Clone, Copy, Debug, Default)]
pub struct AttributeOracle;

impl PointerKindOracle for AttributeOracle {
    fn is_client(&self, pool: &TypePool, ty: TypeId) -> bool {
        pool.struct_attrs(ty).contains(StructAttrs::CLIENT)
    }
}

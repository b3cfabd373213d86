//! Type-layout optimization for the backend.
//!
//! Rewrites the aggregate types of a [`Module`] into simpler, cheaper
//! equivalents and retargets every value to them:
//!
//! - **Collapsing**: a struct with a single remaining field becomes that
//!   field, when no downcast or address identity depends on the wrapper.
//! - **Byte-layout flattening**: a union-like struct whose every view
//!   agrees on one scalar leaf type becomes an array of that leaf.
//! - **Member merging**: adjacent array members of the same element type
//!   are concatenated into one array.
//! - **Bit-packing**: small non-escaping integer fields share one word.
//! - **Array flattening**: arrays of arrays become one flat array, and
//!   pointers to an array become pointers to its first element.
//!
//! # Pipeline
//!
//! 1. [`LayoutFacts::gather`] reads the original module once.
//! 2. [`TypeMap`] computes a [`TypeMappingInfo`] for every type on demand.
//! 3. [`rewrite_address`] and [`rewrite_constant`] translate address
//!    computations and constants between the layouts.
//! 4. [`ValueRewriter`] drives the whole-module rewrite.
//!
//! [`optimize_types`] runs all of it.
//!
//! # Crate Dependencies
//!
//! Operates on `tyopt_ir` modules in place. Struct types are never mutated:
//! every new layout is a fresh struct in the same [`TypePool`].

pub mod address;
pub mod analyze;
mod config;
pub mod constant;
mod error;
pub mod rewrite;
mod stack;
pub mod type_map;

#[cfg(test)]
mod test_helpers;

use rustc_hash::FxHashMap;
use tracing::debug;
use tyopt_ir::{Constant, DataLayout, Module, PointerKindOracle, TypeId};

pub use address::{rewrite_address, ConstFold, IndexArith, RewrittenAddress};
pub use analyze::{DowncastSafety, LayoutFacts};
pub use config::{ByValCopyPolicy, TypeOptimizerConfig};
pub use constant::rewrite_constant;
pub use error::LayoutError;
pub use rewrite::{RewriteStats, ValueRewriter};
pub use type_map::{MappingKind, MemberMapping, TypeMap, TypeMappingInfo};

/// Everything [`optimize_types`] decided, for inspection and testing.
#[derive(Clone, Debug, Default)]
pub struct LayoutRewrite {
    /// Mapping of every old type the rewrite resolved. Unlisted types are
    /// identical to themselves.
    pub type_mapping: FxHashMap<TypeId, TypeMappingInfo>,
    /// Old struct to the new position of each of its fields.
    pub member_mappings: FxHashMap<TypeId, Vec<MemberMapping>>,
    /// Constant that replaced each global's uses, indexed by global.
    pub global_mapping: Vec<Constant>,
    pub stats: RewriteStats,
}

impl LayoutRewrite {
    /// New type of `ty`, or `ty` itself if it was never remapped.
    pub fn mapped(&self, ty: TypeId) -> TypeId {
        self.type_mapping.get(&ty).map_or(ty, |info| info.mapped)
    }

    pub fn kind(&self, ty: TypeId) -> MappingKind {
        self.type_mapping
            .get(&ty)
            .map_or(MappingKind::Identical, |info| info.kind)
    }
}

/// Run the type-layout optimization over `module`.
///
/// Gathers facts from the original module, then rewrites every global and
/// function to the optimized types. The module is modified in place; new
/// struct types are appended to its pool.
///
/// # Errors
///
/// Returns a [`LayoutError`] when the module violates an assumption of the
/// rewrite. The module is then partially rewritten and must be discarded.
pub fn optimize_types(
    module: &mut Module,
    layout: &dyn DataLayout,
    oracle: &dyn PointerKindOracle,
    config: &TypeOptimizerConfig,
) -> Result<LayoutRewrite, LayoutError> {
    let facts = LayoutFacts::gather(module);
    let map = TypeMap::new(&facts, layout, oracle, config.packing_word_bits);
    let (map, global_mapping, stats) = ValueRewriter::new(module, map, *config).run()?;

    let type_mapping: FxHashMap<TypeId, TypeMappingInfo> = map.resolved().collect();
    let changed = type_mapping
        .iter()
        .filter(|(ty, info)| info.mapped != **ty)
        .count();
    debug!(
        resolved = type_mapping.len(),
        changed,
        types = module.types.len(),
        "type layout optimization finished"
    );

    Ok(LayoutRewrite {
        type_mapping,
        member_mappings: map.member_mappings().clone(),
        global_mapping,
        stats,
    })
}

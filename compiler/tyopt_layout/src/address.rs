//! Address index rewriting.
//!
//! An address computation walks a list of indices from a base type down to
//! a target type. Once the types along the way have been remapped, the
//! same location is reached by a different index list:
//!
//! | Level mapping                | Output                                     |
//! |------------------------------|--------------------------------------------|
//! | identical                    | the index, unchanged                       |
//! | collapsed                    | nothing                                    |
//! | byte layout to array         | one flat element index for all that is left|
//! | flattened / pointer from array | index scaled by the element-size ratio, next index added to it |
//! | merged members               | the mapped member, plus its element offset; packed integers report a bit offset instead |
//!
//! Index arithmetic goes through [`IndexArith`], so the same walk serves
//! constant expressions ([`ConstFold`]) and instruction sequences.

use tyopt_ir::{Constant, Operand, TypeId, TypeKind, TypePool};

use crate::error::LayoutError;
use crate::type_map::{MappingKind, TypeMap};

/// Arithmetic on address indices.
pub trait IndexArith {
    fn add(&mut self, pool: &mut TypePool, lhs: Operand, rhs: Operand) -> Result<Operand, LayoutError>;

    fn mul(&mut self, pool: &mut TypePool, value: Operand, factor: u64) -> Result<Operand, LayoutError>;
}

/// Index arithmetic over integer constants.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstFold;

impl IndexArith for ConstFold {
    fn add(&mut self, pool: &mut TypePool, lhs: Operand, rhs: Operand) -> Result<Operand, LayoutError> {
        match (&lhs, &rhs) {
            (Operand::Const(Constant::Int { ty, value: a }), Operand::Const(Constant::Int { value: b, .. })) => {
                Ok(Constant::int(pool, *ty, a.wrapping_add(*b)).into())
            }
            _ => Err(LayoutError::UnexpectedConstant {
                what: format!("non-constant address index in constant address ({lhs:?} + {rhs:?})"),
            }),
        }
    }

    fn mul(&mut self, pool: &mut TypePool, value: Operand, factor: u64) -> Result<Operand, LayoutError> {
        match value {
            Operand::Const(Constant::Int { ty, value }) => {
                Ok(Constant::int(pool, ty, value.wrapping_mul(factor)).into())
            }
            other => Err(LayoutError::UnexpectedConstant {
                what: format!("non-constant address index in constant address ({other:?})"),
            }),
        }
    }
}

/// Result of [`rewrite_address`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewrittenAddress {
    pub indices: Vec<Operand>,
    /// Bit offset of a packed integer within the addressed word. Applied by
    /// the consuming load or store, never by address arithmetic.
    pub bit_offset: u32,
}

/// Output index list under construction.
struct IndexList<'x> {
    indices: Vec<Operand>,
    /// The next index is added to the last one instead of appended.
    add_to_last: bool,
    arith: &'x mut dyn IndexArith,
}

impl IndexList<'_> {
    fn push(&mut self, pool: &mut TypePool, index: Operand) -> Result<(), LayoutError> {
        if std::mem::take(&mut self.add_to_last) {
            if let Some(last) = self.indices.pop() {
                let sum = if index.as_const_int() == Some(0) {
                    last
                } else if last.as_const_int() == Some(0) {
                    index
                } else {
                    self.arith.add(pool, last, index)?
                };
                self.indices.push(sum);
                return Ok(());
            }
        }
        self.indices.push(index);
        Ok(())
    }

    fn push_scaled(&mut self, pool: &mut TypePool, index: Operand, factor: u64) -> Result<(), LayoutError> {
        let scaled = if factor == 1 {
            index
        } else {
            self.arith.mul(pool, index, factor)?
        };
        self.push(pool, scaled)
    }
}

/// Recompute `indices`, applied to a value of old type `base_ty`, against
/// the new layout. `target` is the new type the old address pointed to.
///
/// # Errors
///
/// Fails when an index does not resolve against the old types, when a
/// mapping the walk relies on is missing, or when the walk does not end at
/// `target`.
pub fn rewrite_address(
    map: &mut TypeMap<'_>,
    pool: &mut TypePool,
    base_ty: TypeId,
    indices: &[Operand],
    target: TypeId,
    arith: &mut dyn IndexArith,
) -> Result<RewrittenAddress, LayoutError> {
    let layout = map.layout();
    let mut out = IndexList {
        indices: Vec::with_capacity(indices.len()),
        add_to_last: false,
        arith,
    };
    let mut bit_offset = 0;
    let mut cur = base_ty;
    let mut position = 0;

    while position < indices.len() {
        let index = &indices[position];
        let info = map.rewrite(pool, cur);
        match info.kind {
            MappingKind::Identical => out.push(pool, index.clone())?,
            MappingKind::Collapsed => {}
            MappingKind::ByteLayoutToArray => {
                if info.mapped == target {
                    if pool.is_array(target) {
                        out.push(pool, Operand::i32(0))?;
                    }
                    return Ok(RewrittenAddress {
                        indices: out.indices,
                        bit_offset,
                    });
                }
                // A single leaf: nothing left to select.
                let Some(leaf) = pool.array_elem(info.mapped) else {
                    return Ok(RewrittenAddress {
                        indices: out.indices,
                        bit_offset,
                    });
                };
                let leaf_size = layout.alloc_size(pool, leaf).max(1);
                // Every remaining level folds into one element index.
                while position < indices.len() {
                    let index = &indices[position];
                    if pool.is_struct(cur) {
                        let field = struct_index(pool, cur, index)?;
                        if pool.struct_field(cur, field).is_none() {
                            return Err(unresolved(pool, cur, position));
                        }
                        let offset = layout.field_offset(pool, cur, field);
                        out.push(pool, Operand::i32((offset / leaf_size) as u32))?;
                    } else {
                        let elem = pool
                            .sequential_elem(cur)
                            .ok_or_else(|| unresolved(pool, cur, position))?;
                        let elem_size = layout.alloc_size(pool, elem);
                        out.push_scaled(pool, index.clone(), elem_size / leaf_size)?;
                    }
                    cur = step(pool, cur, index, position)?;
                    out.add_to_last = true;
                    position += 1;
                }
                return finish(map, pool, out, cur, target, bit_offset);
            }
            MappingKind::PointerFromArray | MappingKind::FlattenedArray => {
                let old_elem = pool
                    .sequential_elem(cur)
                    .ok_or_else(|| unresolved(pool, cur, position))?;
                let old_elem = map.mapped(pool, old_elem);
                let new_elem = pool
                    .sequential_elem(info.mapped)
                    .ok_or_else(|| unresolved(pool, info.mapped, position))?;
                let factor = layout.alloc_size(pool, old_elem) / layout.alloc_size(pool, new_elem).max(1);
                out.push_scaled(pool, index.clone(), factor)?;
                out.add_to_last = true;
            }
            MappingKind::MergedMemberArrays | MappingKind::MergedMemberArraysAndCollapsed => {
                let field = struct_index(pool, cur, index)?;
                let member = map
                    .member_mapping(cur, field)
                    .ok_or_else(|| LayoutError::MissingMemberMapping {
                        ty: pool.display(cur).to_string(),
                        field,
                    })?;
                if info.kind == MappingKind::MergedMemberArrays {
                    out.push(pool, Operand::i32(member.index))?;
                }
                let field_ty = pool
                    .struct_field(cur, field)
                    .ok_or_else(|| unresolved(pool, cur, position))?;
                let mapped_field = map.mapped(pool, field_ty);
                if pool.is_int(mapped_field) {
                    bit_offset += member.offset;
                } else if member.offset != 0 {
                    out.push(pool, Operand::i32(member.offset))?;
                    out.add_to_last = true;
                }
            }
            MappingKind::Collapsing | MappingKind::CollapsingButUsed => {
                return Err(LayoutError::TransientMapping {
                    ty: pool.display(cur).to_string(),
                });
            }
        }
        cur = step(pool, cur, index, position)?;
        position += 1;
    }

    finish(map, pool, out, cur, target, bit_offset)
}

fn finish(
    map: &mut TypeMap<'_>,
    pool: &mut TypePool,
    mut out: IndexList<'_>,
    reached: TypeId,
    target: TypeId,
    bit_offset: u32,
) -> Result<RewrittenAddress, LayoutError> {
    let reached = map.mapped(pool, reached);
    if reached != target {
        return Err(LayoutError::TargetMismatch {
            expected: pool.display(target).to_string(),
            found: pool.display(reached).to_string(),
        });
    }
    // Pointers to arrays become pointers to their first element.
    if pool.is_array(target) {
        out.push(pool, Operand::i32(0))?;
    }
    Ok(RewrittenAddress {
        indices: out.indices,
        bit_offset,
    })
}

/// The old type one index below `cur`.
fn step(pool: &TypePool, cur: TypeId, index: &Operand, position: usize) -> Result<TypeId, LayoutError> {
    match *pool.kind(cur) {
        TypeKind::Struct(_) => {
            let field = struct_index(pool, cur, index)?;
            pool.struct_field(cur, field)
                .ok_or_else(|| unresolved(pool, cur, position))
        }
        TypeKind::Array { elem, .. } => Ok(elem),
        TypeKind::Pointer { pointee } => Ok(pointee),
        _ => Err(unresolved(pool, cur, position)),
    }
}

fn struct_index(pool: &TypePool, st: TypeId, index: &Operand) -> Result<usize, LayoutError> {
    index
        .as_const_int()
        .and_then(|i| usize::try_from(i).ok())
        .ok_or_else(|| LayoutError::NonConstantStructIndex {
            ty: pool.display(st).to_string(),
        })
}

fn unresolved(pool: &TypePool, ty: TypeId, position: usize) -> LayoutError {
    LayoutError::UnresolvedIndex {
        ty: pool.display(ty).to_string(),
        position,
    }
}

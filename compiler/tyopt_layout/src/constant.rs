//! Constant rewriting.
//!
//! Rebuilds constants bottom-up against the new types. Aggregates follow
//! the same member mappings as address rewriting: merged array members are
//! concatenated, packed integer members are OR-combined at their bit
//! offset, flattened arrays are spliced, and byte-layout structs become an
//! array of their leaf values.

use smallvec::SmallVec;
use tyopt_ir::{Constant, Operand, TypeId, TypeKind, TypePool};

use crate::address::{rewrite_address, ConstFold};
use crate::error::LayoutError;
use crate::stack::ensure_sufficient_stack;
use crate::type_map::{MappingKind, TypeMap};

/// Rewrite `c` against the new types.
///
/// `globals[g]` is the constant that replaces every use of global `g`.
/// Returns the new constant and, for constant addresses of packed integer
/// members, the bit offset of the member in the addressed word.
///
/// # Errors
///
/// Fails when a constant address does not resolve, or when an aggregate
/// does not fit the mapping of its type.
pub fn rewrite_constant(
    map: &mut TypeMap<'_>,
    pool: &mut TypePool,
    globals: &[Constant],
    c: &Constant,
) -> Result<(Constant, u32), LayoutError> {
    ensure_sufficient_stack(|| rewrite_inner(map, pool, globals, c))
}

/// [`rewrite_constant`] for operands that must not address a packed member.
pub(crate) fn rewrite_plain(
    map: &mut TypeMap<'_>,
    pool: &mut TypePool,
    globals: &[Constant],
    c: &Constant,
) -> Result<Constant, LayoutError> {
    rewrite_constant(map, pool, globals, c).map(|(c, _)| c)
}

fn rewrite_inner(
    map: &mut TypeMap<'_>,
    pool: &mut TypePool,
    globals: &[Constant],
    c: &Constant,
) -> Result<(Constant, u32), LayoutError> {
    let ty = match c {
        Constant::Global(g) => {
            let mapped = globals.get(g.index()).cloned().unwrap_or_else(|| c.clone());
            return Ok((mapped, 0));
        }
        Constant::Function(_) => return Ok((c.clone(), 0)),
        Constant::Gep {
            ty,
            elem_ty,
            base,
            indices,
        } => return rewrite_gep(map, pool, globals, *ty, *elem_ty, base, indices),
        Constant::BitCast { ty, value } => {
            let value = rewrite_plain(map, pool, globals, value)?;
            let ty = map.mapped(pool, *ty);
            return Ok((
                Constant::BitCast {
                    ty,
                    value: Box::new(value),
                },
                0,
            ));
        }
        Constant::IntToPtr { ty, value } => {
            let ty = map.mapped(pool, *ty);
            return Ok((
                Constant::IntToPtr {
                    ty,
                    value: value.clone(),
                },
                0,
            ));
        }
        Constant::Int { ty, .. }
        | Constant::Float { ty, .. }
        | Constant::Null(ty)
        | Constant::Undef(ty)
        | Constant::Zero(ty)
        | Constant::Struct { ty, .. }
        | Constant::Array { ty, .. } => *ty,
    };

    let info = map.rewrite(pool, ty);
    let rewritten = match c {
        Constant::Zero(_) => Constant::Zero(info.mapped),
        Constant::Null(_) => Constant::Null(info.mapped),
        Constant::Undef(_) => Constant::Undef(info.mapped),
        Constant::Struct { fields, .. } => rewrite_struct(map, pool, globals, ty, fields)?,
        Constant::Array { elems, .. } => {
            let mut new_elems = Vec::with_capacity(elems.len());
            for elem in elems {
                let elem = rewrite_plain(map, pool, globals, elem)?;
                if info.kind == MappingKind::FlattenedArray {
                    new_elems.extend(array_elements(pool, elem)?);
                } else {
                    new_elems.push(elem);
                }
            }
            Constant::Array {
                ty: info.mapped,
                elems: new_elems,
            }
        }
        // Scalars never change type.
        _ => c.clone(),
    };
    Ok((rewritten, 0))
}

fn rewrite_gep(
    map: &mut TypeMap<'_>,
    pool: &mut TypePool,
    globals: &[Constant],
    ty: TypeId,
    elem_ty: TypeId,
    base: &Constant,
    indices: &[Constant],
) -> Result<(Constant, u32), LayoutError> {
    let new_base = rewrite_plain(map, pool, globals, base)?;
    let old_target = pool
        .pointee(ty)
        .ok_or_else(|| unexpected(pool, "constant address of non-pointer type", ty))?;
    let target = map.mapped(pool, old_target);
    let base_ty = pool.pointer(elem_ty);
    let operands: SmallVec<[Operand; 4]> = indices.iter().cloned().map(Operand::Const).collect();
    let address = rewrite_address(map, pool, base_ty, &operands, target, &mut ConstFold)?;
    if address.indices.is_empty() {
        return Ok((new_base, address.bit_offset));
    }

    let new_base_ty = map.mapped(pool, base_ty);
    let new_elem = pool
        .pointee(new_base_ty)
        .ok_or_else(|| unexpected(pool, "constant address over non-pointer base", new_base_ty))?;
    let mut new_indices = Vec::with_capacity(address.indices.len());
    for index in address.indices {
        match index {
            Operand::Const(c) => new_indices.push(c),
            Operand::Local(v) => {
                return Err(LayoutError::UnexpectedConstant {
                    what: format!("local value %{} in a constant address", v.raw()),
                });
            }
        }
    }
    let reached = pool
        .walk_indices(new_elem, new_indices.iter().skip(1).map(Constant::as_int))
        .ok_or_else(|| LayoutError::UnresolvedIndex {
            ty: pool.display(new_elem).to_string(),
            position: new_indices.len(),
        })?;
    let new_ty = pool.pointer(reached);
    Ok((
        Constant::Gep {
            ty: new_ty,
            elem_ty: new_elem,
            base: Box::new(new_base),
            indices: new_indices,
        },
        address.bit_offset,
    ))
}

fn rewrite_struct(
    map: &mut TypeMap<'_>,
    pool: &mut TypePool,
    globals: &[Constant],
    st: TypeId,
    fields: &[Constant],
) -> Result<Constant, LayoutError> {
    let info = map.rewrite(pool, st);
    match info.kind {
        MappingKind::ByteLayoutToArray => {
            let leaf = pool.array_elem(info.mapped).unwrap_or(info.mapped);
            let mut leaves = Vec::new();
            for field in fields {
                push_leaves(pool, field, leaf, &mut leaves)?;
            }
            let mut new_elems = Vec::with_capacity(leaves.len());
            for value in &leaves {
                new_elems.push(rewrite_plain(map, pool, globals, value)?);
            }
            if new_elems.len() == 1 {
                if let Some(only) = new_elems.pop() {
                    return Ok(only);
                }
            }
            let ty = pool.array(leaf, new_elems.len() as u64);
            Ok(Constant::Array {
                ty,
                elems: new_elems,
            })
        }
        MappingKind::Collapsed => {
            let [field] = fields else {
                return Err(unexpected(pool, "collapsed struct constant without exactly one field", st));
            };
            rewrite_plain(map, pool, globals, field)
        }
        MappingKind::Identical
        | MappingKind::MergedMemberArrays
        | MappingKind::MergedMemberArraysAndCollapsed => {
            let merged = info.kind != MappingKind::Identical;
            let mut new_elems: Vec<Constant> = Vec::with_capacity(fields.len());
            for (i, field) in fields.iter().enumerate() {
                let value = rewrite_plain(map, pool, globals, field)?;
                if merged {
                    let member = map
                        .member_mapping(st, i)
                        .ok_or_else(|| LayoutError::MissingMemberMapping {
                            ty: pool.display(st).to_string(),
                            field: i,
                        })?;
                    let slot = member.index as usize;
                    if slot != new_elems.len() {
                        let word_ty = if info.kind == MappingKind::MergedMemberArraysAndCollapsed {
                            info.mapped
                        } else {
                            pool.struct_field(info.mapped, slot).unwrap_or(info.mapped)
                        };
                        let prev = new_elems.get_mut(slot).ok_or_else(|| {
                            LayoutError::MissingMemberMapping {
                                ty: pool.display(st).to_string(),
                                field: i,
                            }
                        })?;
                        let old = std::mem::replace(prev, Constant::Undef(word_ty));
                        *prev = merge_member(pool, old, value, member.offset, word_ty)?;
                        continue;
                    }
                }
                new_elems.push(value);
            }
            if info.kind == MappingKind::MergedMemberArraysAndCollapsed {
                return match <[Constant; 1]>::try_from(new_elems) {
                    Ok([only]) => Ok(only),
                    Err(_) => Err(unexpected(pool, "merged and collapsed struct constant", st)),
                };
            }
            Ok(Constant::Struct {
                ty: info.mapped,
                fields: new_elems,
            })
        }
        MappingKind::PointerFromArray
        | MappingKind::FlattenedArray
        | MappingKind::Collapsing
        | MappingKind::CollapsingButUsed => Err(LayoutError::TransientMapping {
            ty: pool.display(st).to_string(),
        }),
    }
}

/// Fold `value` into the member already holding `old`.
fn merge_member(
    pool: &mut TypePool,
    old: Constant,
    value: Constant,
    offset: u32,
    word_ty: TypeId,
) -> Result<Constant, LayoutError> {
    if pool.is_int(word_ty) {
        let old_bits = int_payload(&old);
        let new_bits = int_payload(&value).checked_shl(offset).unwrap_or(0);
        return Ok(Constant::int(pool, word_ty, old_bits | new_bits));
    }
    let Some(elem) = pool.array_elem(word_ty) else {
        return Err(unexpected(pool, "merged member that is neither array nor integer", word_ty));
    };
    let mut elems = array_elements(pool, old)?;
    elems.extend(array_elements(pool, value)?);
    let ty = pool.array(elem, elems.len() as u64);
    Ok(Constant::Array { ty, elems })
}

fn int_payload(c: &Constant) -> u64 {
    match c {
        Constant::Int { value, .. } => *value,
        _ => 0,
    }
}

/// Elements of an array constant; zero and undef arrays are expanded.
fn array_elements(pool: &TypePool, array: Constant) -> Result<Vec<Constant>, LayoutError> {
    let (ty, zero) = match array {
        Constant::Array { elems, .. } => return Ok(elems),
        Constant::Zero(ty) => (ty, true),
        Constant::Undef(ty) => (ty, false),
        other => {
            return Err(LayoutError::UnexpectedConstant {
                what: format!("expected an array constant, found {other:?}"),
            });
        }
    };
    let TypeKind::Array { elem, len } = *pool.kind(ty) else {
        return Err(unexpected(pool, "aggregate filler of non-array type", ty));
    };
    let fill = if zero {
        Constant::Zero(elem)
    } else {
        Constant::Undef(elem)
    };
    Ok(vec![fill; len as usize])
}

/// Collect every scalar of `c`, which must all be of type `leaf`.
fn push_leaves(
    pool: &TypePool,
    c: &Constant,
    leaf: TypeId,
    out: &mut Vec<Constant>,
) -> Result<(), LayoutError> {
    match c {
        Constant::Struct { fields: items, .. } | Constant::Array { elems: items, .. } => {
            for item in items {
                push_leaves(pool, item, leaf, out)?;
            }
            Ok(())
        }
        Constant::Zero(ty) | Constant::Undef(ty) if *ty != leaf => {
            let filler = |t: TypeId| {
                if matches!(c, Constant::Zero(_)) {
                    Constant::Zero(t)
                } else {
                    Constant::Undef(t)
                }
            };
            match *pool.kind(*ty) {
                TypeKind::Array { elem, len } => {
                    for _ in 0..len {
                        push_leaves(pool, &filler(elem), leaf, out)?;
                    }
                    Ok(())
                }
                TypeKind::Struct(_) => {
                    for &field in pool.struct_fields(*ty) {
                        push_leaves(pool, &filler(field), leaf, out)?;
                    }
                    Ok(())
                }
                _ => Err(unexpected(pool, "scalar of a different type in a flattened union", *ty)),
            }
        }
        _ => {
            out.push(c.clone());
            Ok(())
        }
    }
}

fn unexpected(pool: &TypePool, what: &str, ty: TypeId) -> LayoutError {
    LayoutError::UnexpectedConstant {
        what: format!("{what} (`{}`)", pool.display(ty)),
    }
}

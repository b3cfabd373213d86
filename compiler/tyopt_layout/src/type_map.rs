//! Memoized old-type to new-type mapping.
//!
//! [`TypeMap::rewrite`] is total: every type has a mapping, and asking
//! twice returns the same answer. Struct resolution may recurse into the
//! struct itself through pointers, so the memo table carries two in-flight
//! states besides resolved entries:
//!
//! - `Pending` while a struct's fields are being rewritten. A re-entrant
//!   lookup gets the (lazily created) replacement struct, which then
//!   receives its body once the fields are known.
//! - `Collapsing` while a single-field struct tries to disappear into its
//!   field. A re-entrant lookup that cannot be forwarded to another struct
//!   marks the attempt as used, and the attempt is abandoned.
//!
//! An abandoned attempt may have cached mappings derived from the
//! tentative collapse. Every memo insertion is logged, and abandoning rolls
//! the table back to the state before the attempt.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::trace;
use tyopt_ir::{DataLayout, PointerKindOracle, StructAttrs, TypeId, TypeKind, TypePool};

use crate::analyze::{field_owner, DowncastSafety, LayoutFacts};
use crate::stack::ensure_sufficient_stack;

/// How an old type relates to its replacement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MappingKind {
    /// Same shape; the type itself or its components may still be new.
    Identical,
    /// Single-field struct replaced by its (rewritten) field.
    Collapsed,
    /// Union-like struct replaced by an array of its leaf type, or by the
    /// leaf itself when exactly one fits.
    ByteLayoutToArray,
    /// Pointer whose pointee became an array; now points to the element.
    PointerFromArray,
    /// Array of arrays flattened into one array.
    FlattenedArray,
    /// Struct whose member arrays were concatenated or whose small integers
    /// were packed into shared words.
    MergedMemberArrays,
    /// Merged down to a single member, then collapsed into it.
    MergedMemberArraysAndCollapsed,
    /// Collapse attempt in progress. Only seen during resolution.
    Collapsing,
    /// Collapse attempt that was re-entered. Only seen during resolution.
    CollapsingButUsed,
}

impl MappingKind {
    /// Whether the struct no longer exists as a wrapper.
    #[inline]
    pub fn is_collapsed(self) -> bool {
        matches!(
            self,
            MappingKind::Collapsed | MappingKind::MergedMemberArraysAndCollapsed
        )
    }

    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(self, MappingKind::Collapsing | MappingKind::CollapsingButUsed)
    }
}

/// Replacement of an old type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeMappingInfo {
    pub mapped: TypeId,
    pub kind: MappingKind,
}

impl TypeMappingInfo {
    #[inline]
    pub fn identical(ty: TypeId) -> Self {
        Self {
            mapped: ty,
            kind: MappingKind::Identical,
        }
    }
}

/// Where an old field of a merged struct lives in the new struct.
///
/// `offset` is an element offset when the field was appended to an array
/// member, and a bit offset when it was packed into an integer member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemberMapping {
    pub index: u32,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug)]
enum MemoEntry {
    Resolved(TypeMappingInfo),
    /// Fields being rewritten. `wrapper` is created on first re-entrant use.
    Pending { wrapper: Option<TypeId> },
    Collapsing { candidate: TypeId, used: bool },
}

/// The memoizing type rewriter for one pass invocation.
pub struct TypeMap<'a> {
    facts: &'a LayoutFacts,
    layout: &'a dyn DataLayout,
    oracle: &'a dyn PointerKindOracle,
    word_bits: u32,
    memo: FxHashMap<TypeId, MemoEntry>,
    /// Keys in memo insertion order, for rollback.
    log: Vec<TypeId>,
    members: FxHashMap<TypeId, Vec<MemberMapping>>,
    /// Structs created by this map. They are already in final form.
    fresh: FxHashSet<TypeId>,
}

impl<'a> TypeMap<'a> {
    pub fn new(
        facts: &'a LayoutFacts,
        layout: &'a dyn DataLayout,
        oracle: &'a dyn PointerKindOracle,
        word_bits: u32,
    ) -> Self {
        Self {
            facts,
            layout,
            oracle,
            word_bits,
            memo: FxHashMap::default(),
            log: Vec::new(),
            members: FxHashMap::default(),
            fresh: FxHashSet::default(),
        }
    }

    #[inline]
    pub fn layout(&self) -> &'a dyn DataLayout {
        self.layout
    }

    #[inline]
    pub fn facts(&self) -> &'a LayoutFacts {
        self.facts
    }

    /// Map `ty` to its replacement.
    ///
    /// Outside of a recursive resolution the result is never transient.
    pub fn rewrite(&mut self, pool: &mut TypePool, ty: TypeId) -> TypeMappingInfo {
        ensure_sufficient_stack(|| self.rewrite_inner(pool, ty))
    }

    /// Shorthand for `rewrite(ty).mapped`.
    #[inline]
    pub fn mapped(&mut self, pool: &mut TypePool, ty: TypeId) -> TypeId {
        self.rewrite(pool, ty).mapped
    }

    /// New location of field `field` of merged struct `st`.
    pub fn member_mapping(&self, st: TypeId, field: usize) -> Option<MemberMapping> {
        self.members.get(&st).and_then(|m| m.get(field).copied())
    }

    /// Member mappings of every merged struct.
    pub fn member_mappings(&self) -> &FxHashMap<TypeId, Vec<MemberMapping>> {
        &self.members
    }

    /// Every resolved mapping of an old type.
    pub fn resolved(&self) -> impl Iterator<Item = (TypeId, TypeMappingInfo)> + '_ {
        self.memo.iter().filter_map(|(&ty, entry)| match entry {
            MemoEntry::Resolved(info) => Some((ty, *info)),
            _ => None,
        })
    }

    /// Whether `ty` is a struct created by this map.
    #[inline]
    pub fn is_fresh(&self, ty: TypeId) -> bool {
        self.fresh.contains(&ty)
    }

    // Memo bookkeeping

    fn insert(&mut self, ty: TypeId, entry: MemoEntry) {
        if self.memo.insert(ty, entry).is_none() {
            self.log.push(ty);
        }
    }

    fn resolve(&mut self, pool: &TypePool, ty: TypeId, info: TypeMappingInfo) -> TypeMappingInfo {
        trace!(
            ty = %pool.display(ty),
            mapped = %pool.display(info.mapped),
            kind = ?info.kind,
            "type mapping"
        );
        self.insert(ty, MemoEntry::Resolved(info));
        info
    }

    /// Forget every entry inserted since `mark`.
    fn rollback(&mut self, mark: usize) {
        for ty in self.log.drain(mark..) {
            self.memo.remove(&ty);
            self.members.remove(&ty);
        }
    }

    fn wrapper_taken(&self, st: TypeId) -> bool {
        matches!(
            self.memo.get(&st),
            Some(MemoEntry::Pending {
                wrapper: Some(_)
            })
        )
    }

    /// The replacement struct of pending `st`, created on first request.
    fn wrapper(&mut self, pool: &mut TypePool, st: TypeId) -> TypeId {
        if let Some(MemoEntry::Pending {
            wrapper: Some(wrapper),
        }) = self.memo.get(&st)
        {
            return *wrapper;
        }
        let (name, attrs) = pool
            .as_struct(st)
            .map_or((None, StructAttrs::empty()), |s| (s.name.clone(), s.attrs));
        let wrapper = pool.create_struct(name.as_deref(), attrs);
        self.fresh.insert(wrapper);
        self.insert(
            st,
            MemoEntry::Pending {
                wrapper: Some(wrapper),
            },
        );
        wrapper
    }

    // Resolution

    fn rewrite_inner(&mut self, pool: &mut TypePool, ty: TypeId) -> TypeMappingInfo {
        if self.fresh.contains(&ty) {
            return TypeMappingInfo::identical(ty);
        }
        match self.memo.get(&ty).copied() {
            Some(MemoEntry::Resolved(info)) => return info,
            Some(MemoEntry::Pending { .. }) => {
                return TypeMappingInfo::identical(self.wrapper(pool, ty));
            }
            Some(MemoEntry::Collapsing { candidate, .. }) => {
                // Struct candidates resolve on their own; anything else
                // would need the collapsed type before it exists.
                if pool.is_struct(candidate) {
                    return self.rewrite(pool, candidate);
                }
                self.memo.insert(
                    ty,
                    MemoEntry::Collapsing {
                        candidate,
                        used: true,
                    },
                );
                return TypeMappingInfo {
                    mapped: candidate,
                    kind: MappingKind::CollapsingButUsed,
                };
            }
            None => {}
        }

        match *pool.kind(ty) {
            TypeKind::Struct(_) => self.rewrite_struct(pool, ty),
            TypeKind::Function { .. } => self.rewrite_function_type(pool, ty),
            TypeKind::Pointer { pointee } => {
                let new_pointee = self.rewrite(pool, pointee).mapped;
                let info = if let Some(elem) = pool.array_elem(new_pointee) {
                    TypeMappingInfo {
                        mapped: pool.pointer(elem),
                        kind: MappingKind::PointerFromArray,
                    }
                } else if new_pointee == pointee {
                    TypeMappingInfo::identical(ty)
                } else {
                    TypeMappingInfo::identical(pool.pointer(new_pointee))
                };
                self.resolve(pool, ty, info)
            }
            TypeKind::Array { elem, len } => {
                let new_elem = self.rewrite(pool, elem).mapped;
                let info = match *pool.kind(new_elem) {
                    TypeKind::Array {
                        elem: inner,
                        len: inner_len,
                    } => TypeMappingInfo {
                        mapped: pool.array(inner, len * inner_len),
                        kind: MappingKind::FlattenedArray,
                    },
                    _ if new_elem == elem => TypeMappingInfo::identical(ty),
                    _ => TypeMappingInfo::identical(pool.array(new_elem, len)),
                };
                self.resolve(pool, ty, info)
            }
            TypeKind::Void | TypeKind::Int { .. } | TypeKind::Float { .. } => {
                self.resolve(pool, ty, TypeMappingInfo::identical(ty))
            }
        }
    }

    fn rewrite_function_type(&mut self, pool: &mut TypePool, ty: TypeId) -> TypeMappingInfo {
        let Some((ret, params, variadic)) = pool.function_sig(ty) else {
            return self.resolve(pool, ty, TypeMappingInfo::identical(ty));
        };
        let params: SmallVec<[TypeId; 8]> = params.iter().copied().collect();
        let new_ret = self.rewrite(pool, ret).mapped;
        let new_params: SmallVec<[TypeId; 8]> =
            params.iter().map(|&p| self.rewrite(pool, p).mapped).collect();
        let mapped = if new_ret == ret && new_params == params {
            ty
        } else {
            pool.function(new_ret, &new_params, variadic)
        };
        self.resolve(pool, ty, TypeMappingInfo::identical(mapped))
    }

    fn rewrite_struct(&mut self, pool: &mut TypePool, st: TypeId) -> TypeMappingInfo {
        let Some(info) = pool.as_struct(st) else {
            return self.resolve(pool, st, TypeMappingInfo::identical(st));
        };
        let attrs = info.attrs;
        if info.is_opaque() || self.oracle.is_client(pool, st) {
            return self.resolve(pool, st, TypeMappingInfo::identical(st));
        }
        let fields: SmallVec<[TypeId; 8]> = info.fields().iter().copied().collect();
        let direct_base = info.direct_base;

        self.insert(st, MemoEntry::Pending { wrapper: None });

        if attrs.contains(StructAttrs::BYTE_LAYOUT) {
            if let Some(flat) = self.flatten_byte_layout(pool, st, &fields) {
                if !self.wrapper_taken(st) {
                    return self.resolve(pool, st, flat);
                }
            }
        }

        let mut kind = MappingKind::Identical;
        let mut new_fields: Vec<TypeId>;
        let raw_memory = attrs.contains(StructAttrs::RAW_MEMORY);
        if raw_memory {
            new_fields = fields.iter().map(|&f| self.rewrite(pool, f).mapped).collect();
        } else if fields.len() > 1 {
            let (merged_fields, members) = self.merge_fields(pool, st, &fields, attrs);
            new_fields = merged_fields;
            if let Some(members) = members {
                self.members.insert(st, members);
                kind = MappingKind::MergedMemberArrays;
            }
        } else {
            new_fields = fields.to_vec();
        }

        if new_fields.len() == 1 && !raw_memory {
            let merged = kind == MappingKind::MergedMemberArrays;
            if let Some(info) = self.try_collapse(pool, st, new_fields[0], attrs, merged) {
                return info;
            }
            if !merged {
                new_fields[0] = self.rewrite(pool, new_fields[0]).mapped;
            }
        }

        let new_base = direct_base
            .map(|base| self.rewrite(pool, base).mapped)
            .filter(|&base| pool.is_struct(base));
        let new_st = self.wrapper(pool, st);
        pool.set_struct_body(new_st, new_fields, new_base);
        self.resolve(
            pool,
            st,
            TypeMappingInfo {
                mapped: new_st,
                kind,
            },
        )
    }

    /// Replacement of a byte-layout struct by its uniform leaf type.
    fn flatten_byte_layout(
        &mut self,
        pool: &mut TypePool,
        st: TypeId,
        fields: &[TypeId],
    ) -> Option<TypeMappingInfo> {
        let leaf = self.facts.leaf_type(st)?;
        let struct_size = self.layout.alloc_size(pool, st);
        let leaf_size = self.layout.alloc_size(pool, leaf);
        if leaf_size == 0 || struct_size % leaf_size != 0 {
            return None;
        }
        for &field in fields {
            if !pool.is_struct(field) {
                continue;
            }
            if !pool.struct_attrs(field).contains(StructAttrs::BYTE_LAYOUT)
                || self.rewrite(pool, field).kind != MappingKind::ByteLayoutToArray
            {
                return None;
            }
        }
        let leaf = self.rewrite(pool, leaf).mapped;
        let count = struct_size / leaf_size;
        let mapped = if count == 1 {
            leaf
        } else {
            pool.array(leaf, count)
        };
        Some(TypeMappingInfo {
            mapped,
            kind: MappingKind::ByteLayoutToArray,
        })
    }

    /// Rewrite and merge the fields of a multi-field struct.
    ///
    /// Returns the new field list and, if anything merged, the member
    /// mapping of every old field. Merging restarts at each base boundary.
    fn merge_fields(
        &mut self,
        pool: &mut TypePool,
        st: TypeId,
        fields: &[TypeId],
        attrs: StructAttrs,
    ) -> (Vec<TypeId>, Option<Vec<MemberMapping>>) {
        let byte_layout = attrs.contains(StructAttrs::BYTE_LAYOUT);
        let word_bits = self.word_bits;
        let mut new_fields: Vec<TypeId> = Vec::with_capacity(fields.len());
        let mut members: Vec<MemberMapping> = Vec::with_capacity(fields.len());
        // Array element type to the new field holding arrays of it.
        let mut arrays: FxHashMap<TypeId, usize> = FxHashMap::default();
        // Integer members with room left: (new field, free bits).
        let mut open_words: SmallVec<[(usize, u32); 4]> = SmallVec::new();
        let mut segment_end = 0;
        let mut segment_owner = st;
        let mut merged = false;

        for (i, &field) in fields.iter().enumerate() {
            if i == segment_end {
                arrays.clear();
                open_words.clear();
                segment_owner = field_owner(pool, st, i as u32);
                segment_end = pool.struct_fields(segment_owner).len();
            }
            let rewritten = self.rewrite(pool, field).mapped;
            // Overlapping fields keep their positions.
            if byte_layout {
                new_fields.push(rewritten);
                continue;
            }
            match *pool.kind(rewritten) {
                TypeKind::Array { elem, len } => {
                    if let Some(&slot) = arrays.get(&elem) {
                        let prev_len = pool.array_len(new_fields[slot]).unwrap_or(0);
                        new_fields[slot] = pool.array(elem, prev_len + len);
                        members.push(MemberMapping {
                            index: slot as u32,
                            offset: prev_len as u32,
                        });
                        merged = true;
                        continue;
                    }
                    arrays.insert(elem, new_fields.len());
                }
                TypeKind::Int { bits }
                    if bits < word_bits && !self.facts.is_escaping(segment_owner, i as u32) =>
                {
                    if let Some(pos) = open_words.iter().position(|&(_, free)| free >= bits) {
                        let (slot, free) = open_words[pos];
                        let old_bits = pool.int_bits(new_fields[slot]).unwrap_or(0);
                        new_fields[slot] = pool.int(old_bits + bits);
                        members.push(MemberMapping {
                            index: slot as u32,
                            offset: word_bits - free,
                        });
                        if free == bits {
                            open_words.remove(pos);
                        } else {
                            open_words[pos].1 = free - bits;
                        }
                        merged = true;
                        continue;
                    }
                    open_words.push((new_fields.len(), word_bits - bits));
                }
                _ => {}
            }
            members.push(MemberMapping {
                index: new_fields.len() as u32,
                offset: 0,
            });
            new_fields.push(rewritten);
        }

        (new_fields, merged.then_some(members))
    }

    /// Try to replace `st` by its only remaining member `candidate`.
    fn try_collapse(
        &mut self,
        pool: &mut TypePool,
        st: TypeId,
        candidate: TypeId,
        attrs: StructAttrs,
        merged: bool,
    ) -> Option<TypeMappingInfo> {
        // An `i8` member may be the placeholder of an empty base that
        // derived types fill with something else.
        let client_pointer = pool
            .pointee(candidate)
            .is_some_and(|p| pool.is_struct(p) && self.oracle.is_client(pool, p));
        let plain_member = candidate != TypeId::I8
            && !pool.is_pointer(candidate)
            && !attrs.intersects(StructAttrs::EXPORTED | StructAttrs::BYTE_LAYOUT);
        if !(client_pointer || plain_member) {
            return None;
        }
        if self.is_unsafe_downcast_source(pool, st) || self.wrapper_taken(st) {
            return None;
        }

        let mark = self.log.len();
        self.memo.insert(
            st,
            MemoEntry::Collapsing {
                candidate,
                used: false,
            },
        );
        let collapsed = self.rewrite(pool, candidate);
        if let Some(MemoEntry::Collapsing { used: false, .. }) = self.memo.get(&st) {
            let kind = if merged {
                MappingKind::MergedMemberArraysAndCollapsed
            } else {
                MappingKind::Collapsed
            };
            return Some(self.resolve(
                pool,
                st,
                TypeMappingInfo {
                    mapped: collapsed.mapped,
                    kind,
                },
            ));
        }

        trace!(ty = %pool.display(st), "collapse abandoned, keeping wrapper");
        self.rollback(mark);
        self.memo.insert(st, MemoEntry::Pending { wrapper: None });
        None
    }

    /// Whether collapsing `st` would break a zero-offset downcast from it.
    fn is_unsafe_downcast_source(&mut self, pool: &mut TypePool, st: TypeId) -> bool {
        let facts = self.facts;
        match facts.downcast_safety(st) {
            None => false,
            Some(DowncastSafety::Unsafe) => true,
            Some(DowncastSafety::ZeroOffset(dests)) => dests
                .iter()
                .any(|&dest| self.rewrite(pool, dest).kind != MappingKind::Collapsed),
        }
    }
}

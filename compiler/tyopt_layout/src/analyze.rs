//! Whole-module fact gathering.
//!
//! [`LayoutFacts::gather`] runs once, before any type is rewritten, and
//! records what the type mapping cannot discover on its own:
//!
//! - **Escaping fields**: struct fields whose address is used for anything
//!   other than a plain load or store. These are never bit-packed.
//! - **Byte-layout leaf types**: for every byte-layout struct, the single
//!   scalar type all of its views agree on, or none.
//! - **Downcast safety**: for every struct used as a downcast or virtual
//!   cast source, whether it may still collapse.
//!
//! Analysis reads only original types. Interleaving it with rewriting would
//! observe half-rewritten types.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::debug;
use tyopt_ir::{
    Callee, Constant, Function, Instr, Intrinsic, Module, Operand, TypeId, TypeKind, TypePool,
    ValueId,
};

/// What is known about a struct used as a downcast source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DowncastSafety {
    /// Downcast with a nonzero or unknown offset, or virtual-cast source.
    /// The struct never collapses.
    Unsafe,
    /// Only zero-offset downcasts to these destinations. The source may
    /// collapse if every destination collapses.
    ZeroOffset(SmallVec<[TypeId; 2]>),
}

/// Facts gathered from the original module.
#[derive(Clone, Debug, Default)]
pub struct LayoutFacts {
    /// `(struct, field)` pairs, normalized to the most basic struct that
    /// still contains the field.
    escaping: FxHashSet<(TypeId, u32)>,
    /// Byte-layout struct to its uniform leaf type; `None` when views
    /// disagree.
    leaf_types: FxHashMap<TypeId, Option<TypeId>>,
    downcasts: FxHashMap<TypeId, DowncastSafety>,
}

impl LayoutFacts {
    /// Gather facts from every function body and every constant of `module`.
    pub fn gather(module: &Module) -> Self {
        let mut facts = Self::default();
        let pool = &module.types;

        // Every byte-layout struct is a view of itself.
        for st in pool.structs() {
            if pool.as_struct(st).is_some_and(|s| s.has_byte_layout()) {
                facts.add_view(pool, st, st);
            }
        }

        for func in &module.functions {
            facts.gather_function(module, func);
        }
        for global in &module.globals {
            if let Some(init) = &global.init {
                facts.gather_constant(pool, module, init, false);
            }
        }

        debug!(
            escaping = facts.escaping.len(),
            byte_layout = facts.leaf_types.len(),
            downcast_sources = facts.downcasts.len(),
            "gathered layout facts"
        );
        facts
    }

    /// Whether field `field` of `st` escapes. `st` must already be
    /// normalized to the struct that introduces the field.
    pub fn is_escaping(&self, st: TypeId, field: u32) -> bool {
        self.escaping.contains(&(st, field))
    }

    /// Uniform leaf type of a byte-layout struct.
    pub fn leaf_type(&self, st: TypeId) -> Option<TypeId> {
        self.leaf_types.get(&st).copied().flatten()
    }

    pub fn downcast_safety(&self, st: TypeId) -> Option<&DowncastSafety> {
        self.downcasts.get(&st)
    }

    // Gathering

    fn gather_function(&mut self, module: &Module, func: &Function) {
        let pool = &module.types;
        let non_mem_uses = non_memory_uses(func);

        for block in &func.blocks {
            for instr in &block.body {
                match instr {
                    Instr::Call {
                        dst: Some(dst),
                        callee: Callee::Direct(callee),
                        args,
                        ..
                    } => {
                        let intrinsic = module.functions.get(callee.index()).and_then(|f| f.intrinsic);
                        match intrinsic {
                            Some(Intrinsic::Downcast) => {
                                self.record_downcast(module, func, *dst, args);
                            }
                            Some(Intrinsic::VirtualCast) => {
                                if let Some(src) = args.first().and_then(|a| source_struct(module, func, a)) {
                                    self.downcasts.insert(src, DowncastSafety::Unsafe);
                                }
                            }
                            _ => {}
                        }
                    }
                    Instr::BitCast { dst, value } => {
                        let src_ty = module.operand_type(func, value);
                        let dst_ty = func.value_type(*dst);
                        self.record_bitcast(pool, src_ty, dst_ty);
                    }
                    Instr::Gep {
                        dst,
                        elem_ty,
                        indices,
                        ..
                    } => {
                        if non_mem_uses.contains(dst) {
                            self.record_escape(pool, *elem_ty, indices.iter().map(Operand::as_const_int));
                        }
                    }
                    _ => {}
                }

                // Constant expressions in operand position.
                match instr {
                    Instr::Load { ptr, .. } => self.gather_operand(module, ptr, true),
                    Instr::Store { value, ptr } => {
                        self.gather_operand(module, value, false);
                        self.gather_operand(module, ptr, true);
                    }
                    _ => instr.for_each_operand(|op| self.gather_operand(module, op, false)),
                }
            }
            block
                .terminator
                .for_each_operand(|op| self.gather_operand(module, op, false));
        }
    }

    fn gather_operand(&mut self, module: &Module, op: &Operand, memory_access: bool) {
        if let Operand::Const(c) = op {
            self.gather_constant(&module.types, module, c, memory_access);
        }
    }

    /// Record constant address computations. The outermost constant is
    /// only a plain access when `memory_access` is set; nested ones never are.
    fn gather_constant(&mut self, pool: &TypePool, module: &Module, c: &Constant, memory_access: bool) {
        let mut outermost = true;
        c.walk(&mut |c| {
            let plain = outermost && memory_access;
            outermost = false;
            match c {
                Constant::Gep {
                    elem_ty, indices, ..
                } if !plain => {
                    self.record_escape(pool, *elem_ty, indices.iter().map(Constant::as_int));
                }
                Constant::BitCast { ty, value } => {
                    self.record_bitcast(pool, value.ty(module), *ty);
                }
                _ => {}
            }
        });
    }

    fn record_downcast(&mut self, module: &Module, func: &Function, dst: ValueId, args: &[Operand]) {
        let Some(src) = args.first().and_then(|a| source_struct(module, func, a)) else {
            return;
        };
        let zero_offset = args.get(1).and_then(Operand::as_const_int) == Some(0);
        if !zero_offset {
            self.downcasts.insert(src, DowncastSafety::Unsafe);
            return;
        }
        let pool = &module.types;
        let Some(dest) = pool
            .pointee(func.value_type(dst))
            .filter(|&d| pool.is_struct(d))
        else {
            return;
        };
        match self
            .downcasts
            .entry(src)
            .or_insert_with(|| DowncastSafety::ZeroOffset(SmallVec::new()))
        {
            DowncastSafety::Unsafe => {}
            DowncastSafety::ZeroOffset(dests) => {
                if !dests.contains(&dest) {
                    dests.push(dest);
                }
            }
        }
    }

    fn record_bitcast(&mut self, pool: &TypePool, src_ty: TypeId, dst_ty: TypeId) {
        let Some(st) = pool.pointee(src_ty) else {
            return;
        };
        if !pool.as_struct(st).is_some_and(|s| s.has_byte_layout()) {
            return;
        }
        if let Some(view) = pool.pointee(dst_ty) {
            self.add_view(pool, st, view);
        }
    }

    /// Narrow the leaf type of byte-layout struct `st` by every scalar
    /// reachable by value from `view`.
    fn add_view(&mut self, pool: &TypePool, st: TypeId, view: TypeId) {
        match pool.kind(view) {
            TypeKind::Array { elem, .. } => self.add_view(pool, st, *elem),
            TypeKind::Struct(s) => {
                for &field in s.fields() {
                    self.add_view(pool, st, field);
                }
            }
            _ => match self.leaf_types.get_mut(&st) {
                None => {
                    self.leaf_types.insert(st, Some(view));
                }
                Some(leaf) => {
                    if *leaf != Some(view) {
                        *leaf = None;
                    }
                }
            },
        }
    }

    /// Record the field addressed by the last index of an escaping address
    /// computation over `elem_ty`.
    fn record_escape(
        &mut self,
        pool: &TypePool,
        elem_ty: TypeId,
        indices: impl ExactSizeIterator<Item = Option<u64>>,
    ) {
        let indices: SmallVec<[Option<u64>; 4]> = indices.collect();
        if indices.len() < 2 {
            return;
        }
        let (last, middle) = (indices[indices.len() - 1], &indices[1..indices.len() - 1]);
        let Some(container) = pool.walk_indices(elem_ty, middle.iter().copied()) else {
            return;
        };
        if !pool.is_struct(container) {
            return;
        }
        let Some(field) = last.and_then(|f| u32::try_from(f).ok()) else {
            return;
        };
        let st = field_owner(pool, container, field);
        self.escaping.insert((st, field));
    }
}

/// The most basic struct in the inheritance chain of `st` that still
/// contains field `field`.
pub(crate) fn field_owner(pool: &TypePool, st: TypeId, field: u32) -> TypeId {
    let mut owner = st;
    while let Some(base) = pool.direct_base(owner) {
        if pool.struct_fields(base).len() <= field as usize {
            break;
        }
        owner = base;
    }
    owner
}

/// Pointee of a cast operand, if it is a struct.
fn source_struct(module: &Module, func: &Function, op: &Operand) -> Option<TypeId> {
    let pool = &module.types;
    pool.pointee(module.operand_type(func, op))
        .filter(|&st| pool.is_struct(st))
}

/// Values used by something other than the pointer operand of a load or
/// store.
fn non_memory_uses(func: &Function) -> FxHashSet<ValueId> {
    let mut uses = FxHashSet::default();
    let mut note = |op: &Operand| {
        if let Some(v) = op.local() {
            uses.insert(v);
        }
    };
    for block in &func.blocks {
        for instr in &block.body {
            match instr {
                Instr::Load { .. } => {}
                Instr::Store { value, .. } => note(value),
                _ => instr.for_each_operand(&mut note),
            }
        }
        block.terminator.for_each_operand(&mut note);
    }
    uses
}

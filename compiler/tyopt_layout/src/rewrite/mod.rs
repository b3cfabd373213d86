//! Whole-module value rewriting.
//!
//! [`ValueRewriter`] retargets a module to the types chosen by the
//! [`TypeMap`]:
//!
//! 1. Globals get their new types. A global whose value type became an
//!    array is used through a `[0, 0]` address constant from then on.
//! 2. Functions are drained from a pending set until it is empty. Rewriting
//!    one function may declare new intrinsic variants, which join the set.
//! 3. Global initializers are rebuilt once every function is done.
//! 4. Intrinsic declarations left without callers are removed.
//!
//! # Function bodies
//!
//! Blocks are visited entry first, then in discovery order, so a value is
//! always rewritten before its ordinary uses. Phi operands are patched in a
//! second sweep. Values keep their ids: when one instruction becomes a
//! sequence, the last instruction of the sequence defines the original
//! value. A value whose address computation vanished entirely is redirected
//! to its base, and a pointer into a packed word carries its bit offset to
//! the consuming load or store.

mod byval;
mod intrinsics;
mod packed;

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};
use tyopt_ir::graph::reachable_order;
use tyopt_ir::{
    BinOp, Block, BlockId, Callee, Constant, FuncId, GlobalId, Instr, Intrinsic, Module, Operand,
    Terminator, TypeId, TypePool, ValueId,
};

use crate::address::{rewrite_address, ConstFold, IndexArith};
use crate::config::TypeOptimizerConfig;
use crate::constant::rewrite_constant;
use crate::error::LayoutError;
use crate::type_map::{MappingKind, TypeMap};

/// Counters reported by [`ValueRewriter::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub functions_rewritten: usize,
    pub globals_decayed: usize,
    pub intrinsics_redirected: usize,
    pub intrinsics_removed: usize,
    pub byval_copies: usize,
}

/// Retargets every value of a module to the new types.
pub struct ValueRewriter<'m, 'a> {
    module: &'m mut Module,
    map: TypeMap<'a>,
    config: TypeOptimizerConfig,
    /// Replacement constant for every use of each global.
    globals: Vec<Constant>,
    orig_global_ptr_ty: Vec<TypeId>,
    /// Pointer-to-function types before rewriting.
    orig_func_ty: Vec<TypeId>,
    pending: BTreeSet<FuncId>,
    stats: RewriteStats,
}

impl<'m, 'a> ValueRewriter<'m, 'a> {
    pub fn new(module: &'m mut Module, map: TypeMap<'a>, config: TypeOptimizerConfig) -> Self {
        let orig_global_ptr_ty = module.globals.iter().map(|g| g.ptr_ty).collect();
        let orig_func_ty = module.functions.iter().map(|f| f.ty).collect();
        Self {
            module,
            map,
            config,
            globals: Vec::new(),
            orig_global_ptr_ty,
            orig_func_ty,
            pending: BTreeSet::new(),
            stats: RewriteStats::default(),
        }
    }

    /// Rewrite the whole module.
    ///
    /// Returns the type map (with every mapping it resolved), the
    /// replacement constant of each global, and counters.
    ///
    /// # Errors
    ///
    /// Any [`LayoutError`] aborts the rewrite; the module is then partially
    /// rewritten and must be discarded.
    pub fn run(mut self) -> Result<(TypeMap<'a>, Vec<Constant>, RewriteStats), LayoutError> {
        self.rewrite_globals();

        self.pending = self.module.function_ids().collect();
        while let Some(id) = self.pending.pop_first() {
            self.rewrite_function(id)?;
        }

        self.rewrite_initializers()?;
        self.remove_unused_intrinsics();

        debug!(
            functions = self.stats.functions_rewritten,
            globals_decayed = self.stats.globals_decayed,
            intrinsics_redirected = self.stats.intrinsics_redirected,
            intrinsics_removed = self.stats.intrinsics_removed,
            byval_copies = self.stats.byval_copies,
            "layout rewrite complete"
        );
        Ok((self.map, self.globals, self.stats))
    }

    // Globals

    fn rewrite_globals(&mut self) {
        let pool = &mut self.module.types;
        let mut replacements = Vec::with_capacity(self.module.globals.len());
        for (index, global) in self.module.globals.iter_mut().enumerate() {
            let id = GlobalId::new(index as u32);
            let info = self.map.rewrite(pool, global.ptr_ty);
            let new_value_ty = self.map.mapped(pool, global.value_ty);
            global.value_ty = new_value_ty;
            if info.kind == MappingKind::PointerFromArray {
                // The global keeps its array; every use decays to the first element.
                global.ptr_ty = pool.pointer(new_value_ty);
                replacements.push(Constant::Gep {
                    ty: info.mapped,
                    elem_ty: new_value_ty,
                    base: Box::new(Constant::Global(id)),
                    indices: vec![Constant::i32(0), Constant::i32(0)],
                });
                self.stats.globals_decayed += 1;
                trace!(global = %global.name, "global decays to its first element");
            } else {
                global.ptr_ty = info.mapped;
                replacements.push(Constant::Global(id));
            }
        }
        self.globals = replacements;
    }

    fn rewrite_initializers(&mut self) -> Result<(), LayoutError> {
        for index in 0..self.module.globals.len() {
            let Some(init) = self.module.globals[index].init.take() else {
                continue;
            };
            let (init, _) = rewrite_constant(&mut self.map, &mut self.module.types, &self.globals, &init)?;
            self.module.globals[index].init = Some(init);
        }
        Ok(())
    }

    // Functions

    fn orig_func_ty(&self, id: FuncId) -> TypeId {
        self.orig_func_ty
            .get(id.index())
            .copied()
            .unwrap_or_else(|| self.module.function(id).ty)
    }

    /// Type of a constant before rewriting.
    fn orig_const_ty(&self, c: &Constant) -> TypeId {
        match c {
            Constant::Global(g) => self.orig_global_ptr_ty[g.index()],
            Constant::Function(f) => self.orig_func_ty(*f),
            other => other.ty(self.module),
        }
    }

    /// Register a function created during the rewrite.
    fn schedule_new(&mut self, id: FuncId) {
        while self.orig_func_ty.len() <= id.index() {
            let next = FuncId::new(self.orig_func_ty.len() as u32);
            self.orig_func_ty.push(self.module.function(next).ty);
        }
        self.pending.insert(id);
    }

    fn rewrite_function(&mut self, id: FuncId) -> Result<(), LayoutError> {
        if id.index() >= self.module.functions.len() {
            return Err(LayoutError::UnknownFunction { id: id.raw() });
        }
        self.pending.remove(&id);

        let old_ptr_ty = self.module.function(id).ty;
        let old_fn_ty = self.module.function(id).fn_type(&self.module.types);
        let orig_types = self.module.function(id).value_types.clone();
        let new_ptr_ty = self.map.mapped(&mut self.module.types, old_ptr_ty);

        if new_ptr_ty != old_ptr_ty {
            let new_fn_ty = self.module.types.pointee(new_ptr_ty).unwrap_or(new_ptr_ty);
            match self.module.function(id).intrinsic {
                Some(intrinsic) => self.rewrite_intrinsic(id, intrinsic, new_fn_ty)?,
                None => self.module.function_mut(id).ty = new_ptr_ty,
            }
            self.retype_params(id, new_fn_ty);
        }
        self.strip_byval_params(id, old_fn_ty);

        if self.module.function(id).is_declaration() {
            return Ok(());
        }
        trace!(function = %self.module.function(id).name, "rewriting body");

        let order = reachable_order(self.module.function(id));
        let func = self.module.function_mut(id);
        let blocks = std::mem::take(&mut func.blocks);
        let value_types = std::mem::take(&mut func.value_types);

        let mut body = BodyRewriter {
            rw: self,
            value_types,
            orig_types,
            mapped: FxHashMap::default(),
            out: Vec::new(),
        };
        let blocks = body.rewrite_blocks(blocks, &order)?;
        let value_types = body.value_types;

        let func = self.module.function_mut(id);
        func.blocks = blocks;
        func.value_types = value_types;
        self.stats.functions_rewritten += 1;
        Ok(())
    }

    fn retype_params(&mut self, id: FuncId, new_fn_ty: TypeId) {
        let Some((_, params, _)) = self.module.types.function_sig(new_fn_ty) else {
            return;
        };
        let params: SmallVec<[TypeId; 8]> = params.iter().copied().collect();
        let func = self.module.function_mut(id);
        for (param, ty) in func.params.iter().zip(params) {
            if let Some(slot) = func.value_types.get_mut(param.value.index()) {
                *slot = ty;
            }
        }
    }
}

// ── Function bodies ─────────────────────────────────────────────────

/// Per-function rewriting state.
struct BodyRewriter<'r, 'm, 'a> {
    rw: &'r mut ValueRewriter<'m, 'a>,
    /// Types of the function's values, updated as values are rewritten.
    value_types: Vec<TypeId>,
    /// Types of the function's values before rewriting.
    orig_types: Vec<TypeId>,
    /// Values replaced by another operand, with the bit offset of a packed
    /// member they point into.
    mapped: FxHashMap<ValueId, (Operand, u32)>,
    /// Instructions of the block being rewritten.
    out: Vec<Instr>,
}

impl BodyRewriter<'_, '_, '_> {
    /// Rewrite `blocks` visiting them in `order`, which lists every block.
    fn rewrite_blocks(&mut self, blocks: Vec<Block>, order: &[BlockId]) -> Result<Vec<Block>, LayoutError> {
        let mut old_blocks: Vec<Option<Block>> = blocks.into_iter().map(Some).collect();
        let mut new_blocks: Vec<Option<Block>> = vec![None; old_blocks.len()];

        for &block_id in order {
            let Some(block) = old_blocks.get_mut(block_id.index()).and_then(Option::take) else {
                continue;
            };
            for instr in block.body {
                self.rewrite_instr(instr)?;
            }
            let mut terminator = block.terminator;
            self.rewrite_terminator(&mut terminator)?;
            new_blocks[block_id.index()] = Some(Block {
                id: block.id,
                body: std::mem::take(&mut self.out),
                terminator,
            });
        }

        // Phi operands may be defined later in rewrite order.
        let mut blocks: Vec<Block> = new_blocks.into_iter().flatten().collect();
        for block in &mut blocks {
            for instr in &mut block.body {
                if let Instr::Phi { incoming, .. } = instr {
                    for (op, _) in incoming {
                        if let Operand::Local(v) = op {
                            if let Some((mapped, _)) = self.mapped.get(v) {
                                *op = mapped.clone();
                            }
                        }
                    }
                }
            }
        }
        Ok(blocks)
    }

    // Helpers

    fn pool(&mut self) -> &mut TypePool {
        &mut self.rw.module.types
    }

    fn mapped_ty(&mut self, ty: TypeId) -> TypeId {
        self.rw.map.mapped(&mut self.rw.module.types, ty)
    }

    fn fresh(&mut self, ty: TypeId) -> ValueId {
        fresh_value(&mut self.value_types, ty)
    }

    fn retype(&mut self, dst: ValueId) {
        let old = self.orig_type(dst);
        let new = self.mapped_ty(old);
        if let Some(slot) = self.value_types.get_mut(dst.index()) {
            *slot = new;
        }
    }

    fn orig_type(&self, v: ValueId) -> TypeId {
        self.orig_types
            .get(v.index())
            .or_else(|| self.value_types.get(v.index()))
            .copied()
            .unwrap_or(TypeId::VOID)
    }

    fn orig_operand_type(&self, op: &Operand) -> TypeId {
        match op {
            Operand::Local(v) => self.orig_type(*v),
            Operand::Const(c) => self.rw.orig_const_ty(c),
        }
    }

    /// Type of an already rewritten operand.
    fn new_operand_type(&self, op: &Operand) -> TypeId {
        match op {
            Operand::Local(v) => self.value_types.get(v.index()).copied().unwrap_or(TypeId::VOID),
            Operand::Const(c) => c.ty(self.rw.module),
        }
    }

    /// The rewritten operand and the bit offset it carries.
    fn map_operand(&mut self, op: &Operand) -> Result<(Operand, u32), LayoutError> {
        match op {
            Operand::Local(v) => Ok(self
                .mapped
                .get(v)
                .cloned()
                .unwrap_or((Operand::Local(*v), 0))),
            Operand::Const(c) => {
                let rw = &mut *self.rw;
                let (c, offset) = rewrite_constant(&mut rw.map, &mut rw.module.types, &rw.globals, c)?;
                Ok((Operand::Const(c), offset))
            }
        }
    }

    fn map_plain(&mut self, op: &Operand) -> Result<Operand, LayoutError> {
        self.map_operand(op).map(|(op, _)| op)
    }

    fn map_operands_in_place(&mut self, instr: &mut Instr) -> Result<(), LayoutError> {
        let mut result = Ok(());
        let mut ops: SmallVec<[Operand; 4]> = SmallVec::new();
        instr.for_each_operand(|op| ops.push(op.clone()));
        let mut mapped: SmallVec<[Operand; 4]> = SmallVec::with_capacity(ops.len());
        for op in &ops {
            match self.map_plain(op) {
                Ok(op) => mapped.push(op),
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        result?;
        let mut mapped = mapped.into_iter();
        instr.for_each_operand_mut(|op| {
            if let Some(new) = mapped.next() {
                *op = new;
            }
        });
        Ok(())
    }

    // Instructions

    fn rewrite_instr(&mut self, mut instr: Instr) -> Result<(), LayoutError> {
        match instr {
            Instr::Gep {
                dst,
                elem_ty,
                ref base,
                ref indices,
                inbounds,
            } => {
                let base = base.clone();
                let indices = indices.clone();
                return self.rewrite_gep(dst, elem_ty, &base, &indices, inbounds);
            }
            Instr::Load { dst, ref ptr } => {
                let ptr = ptr.clone();
                return self.rewrite_load(dst, &ptr);
            }
            Instr::Store {
                ref value,
                ref ptr,
            } => {
                let (value, ptr) = (value.clone(), ptr.clone());
                return self.rewrite_store(&value, &ptr);
            }
            Instr::Alloca { dst, allocated } => return self.rewrite_alloca(dst, allocated),
            Instr::Call {
                dst: Some(dst),
                callee: Callee::Direct(callee),
                ref args,
                ..
            } if self.rw.module.function(callee).intrinsic == Some(Intrinsic::UpcastCollapsed) => {
                if let Some(src) = args.first().cloned() {
                    if self.rewrite_upcast(dst, &src)? {
                        return Ok(());
                    }
                }
                return self.rewrite_call(instr);
            }
            Instr::Call { .. } => return self.rewrite_call(instr),
            Instr::Phi {
                ref mut incoming, ..
            } => {
                // Locals are patched once every block is rewritten.
                for (op, _) in incoming.iter_mut() {
                    if let Operand::Const(_) = op {
                        *op = self.map_plain(op)?;
                    }
                }
                if let Some(dst) = instr.defined_value() {
                    self.retype(dst);
                }
                self.out.push(instr);
                return Ok(());
            }
            _ => {}
        }

        self.map_operands_in_place(&mut instr)?;
        if let Some(dst) = instr.defined_value() {
            self.retype(dst);
        }
        self.out.push(instr);
        Ok(())
    }

    fn rewrite_terminator(&mut self, terminator: &mut Terminator) -> Result<(), LayoutError> {
        let mut ops: SmallVec<[Operand; 1]> = SmallVec::new();
        terminator.for_each_operand(|op| ops.push(op.clone()));
        let mut mapped: SmallVec<[Operand; 1]> = SmallVec::new();
        for op in &ops {
            mapped.push(self.map_plain(op)?);
        }
        let mut mapped = mapped.into_iter();
        terminator.for_each_operand_mut(|op| {
            if let Some(new) = mapped.next() {
                *op = new;
            }
        });
        Ok(())
    }

    fn rewrite_gep(
        &mut self,
        dst: ValueId,
        elem_ty: TypeId,
        base: &Operand,
        indices: &[Operand],
        inbounds: bool,
    ) -> Result<(), LayoutError> {
        let base_ty = self.pool().pointer(elem_ty);
        let old_result = self.orig_type(dst);
        let new_base_ty = self.mapped_ty(base_ty);
        let new_result = self.mapped_ty(old_result);

        let new_base = self.map_plain(base)?;
        let mut new_indices = Vec::with_capacity(indices.len());
        for index in indices {
            new_indices.push(self.map_plain(index)?);
        }

        if new_base_ty == base_ty && new_result == old_result {
            self.out.push(Instr::Gep {
                dst,
                elem_ty,
                base: new_base,
                indices: new_indices,
                inbounds,
            });
            return Ok(());
        }

        let old_target = self.rw.module.types.pointee(old_result).unwrap_or(old_result);
        let target = self.mapped_ty(old_target);
        let rw = &mut *self.rw;
        let mut arith = EmitArith {
            out: &mut self.out,
            value_types: &mut self.value_types,
        };
        let address = rewrite_address(
            &mut rw.map,
            &mut rw.module.types,
            base_ty,
            &new_indices,
            target,
            &mut arith,
        )?;

        if address.indices.is_empty() {
            // Every level collapsed away.
            if let Some(slot) = self.value_types.get_mut(dst.index()) {
                *slot = new_result;
            }
            self.mapped.insert(dst, (new_base, address.bit_offset));
            return Ok(());
        }

        let pool = &mut self.rw.module.types;
        let new_elem = pool.pointee(new_base_ty).unwrap_or(new_base_ty);
        let reached = pool
            .walk_indices(new_elem, address.indices.iter().skip(1).map(Operand::as_const_int))
            .ok_or_else(|| LayoutError::UnresolvedIndex {
                ty: pool.display(new_elem).to_string(),
                position: address.indices.len(),
            })?;
        let result_ty = pool.pointer(reached);
        if let Some(slot) = self.value_types.get_mut(dst.index()) {
            *slot = result_ty;
        }
        self.out.push(Instr::Gep {
            dst,
            elem_ty: new_elem,
            base: new_base,
            indices: address.indices,
            inbounds,
        });
        if address.bit_offset != 0 {
            self.mapped
                .insert(dst, (Operand::Local(dst), address.bit_offset));
        }
        Ok(())
    }

    fn rewrite_alloca(&mut self, dst: ValueId, allocated: TypeId) -> Result<(), LayoutError> {
        let old_ptr = self.orig_type(dst);
        let info = self.rw.map.rewrite(&mut self.rw.module.types, old_ptr);
        let new_allocated = self.mapped_ty(allocated);
        if info.kind == MappingKind::PointerFromArray {
            // Allocate the array, hand out a pointer to its first element.
            let array_ptr = self.pool().pointer(new_allocated);
            let storage = self.fresh(array_ptr);
            self.out.push(Instr::Alloca {
                dst: storage,
                allocated: new_allocated,
            });
            self.out.push(Instr::Gep {
                dst,
                elem_ty: new_allocated,
                base: Operand::Local(storage),
                indices: vec![Operand::i32(0), Operand::i32(0)],
                inbounds: true,
            });
        } else {
            self.out.push(Instr::Alloca {
                dst,
                allocated: new_allocated,
            });
        }
        if let Some(slot) = self.value_types.get_mut(dst.index()) {
            *slot = info.mapped;
        }
        Ok(())
    }

    /// Replace an upcast whose target collapsed, while its source did not,
    /// by an address computation of the first member.
    fn rewrite_upcast(&mut self, dst: ValueId, src: &Operand) -> Result<bool, LayoutError> {
        let pool = &self.rw.module.types;
        let (Some(src_pointee), Some(dst_pointee)) = (
            pool.pointee(self.orig_operand_type(src)),
            pool.pointee(self.orig_type(dst)),
        ) else {
            return Ok(false);
        };
        let rw = &mut *self.rw;
        let ret_info = rw.map.rewrite(&mut rw.module.types, dst_pointee);
        let src_info = rw.map.rewrite(&mut rw.module.types, src_pointee);
        if !ret_info.kind.is_collapsed() || src_info.kind.is_collapsed() {
            return Ok(false);
        }

        let base = self.map_plain(src)?;
        let base_ty = self.new_operand_type(&base);
        let pool = self.pool();
        let elem_ty = pool.pointee(base_ty).unwrap_or(base_ty);
        let mut indices = vec![Operand::i32(0), Operand::i32(0)];
        if pool
            .walk_indices(elem_ty, [Some(0)])
            .is_some_and(|first| pool.is_array(first))
        {
            indices.push(Operand::i32(0));
        }
        let reached = pool
            .walk_indices(elem_ty, indices.iter().skip(1).map(Operand::as_const_int))
            .ok_or_else(|| LayoutError::UnresolvedIndex {
                ty: pool.display(elem_ty).to_string(),
                position: 1,
            })?;
        let result_ty = pool.pointer(reached);
        if let Some(slot) = self.value_types.get_mut(dst.index()) {
            *slot = result_ty;
        }
        self.out.push(Instr::Gep {
            dst,
            elem_ty,
            base,
            indices,
            inbounds: true,
        });
        Ok(true)
    }

    fn rewrite_call(&mut self, mut instr: Instr) -> Result<(), LayoutError> {
        self.copy_byval_args(&mut instr)?;
        if let Instr::Call { callee, args, .. } = &mut instr {
            if let Callee::Indirect(target) = callee {
                *target = self.map_plain(target)?;
            }
            for arg in args.iter_mut() {
                *arg = self.map_plain(arg)?;
            }
        }
        if let Some(dst) = instr.defined_value() {
            self.retype(dst);
        }
        self.out.push(instr);
        Ok(())
    }
}

fn fresh_value(value_types: &mut Vec<TypeId>, ty: TypeId) -> ValueId {
    let id = ValueId::new(value_types.len() as u32);
    value_types.push(ty);
    id
}

/// Index arithmetic that emits instructions for non-constant operands.
struct EmitArith<'x> {
    out: &'x mut Vec<Instr>,
    value_types: &'x mut Vec<TypeId>,
}

impl EmitArith<'_> {
    fn operand_type(&self, op: &Operand) -> TypeId {
        match op {
            Operand::Local(v) => self.value_types.get(v.index()).copied().unwrap_or(TypeId::I32),
            Operand::Const(Constant::Int { ty, .. }) => *ty,
            Operand::Const(_) => TypeId::I32,
        }
    }

    /// `rhs` converted to the type of `lhs` when it is an integer constant.
    fn coerce(pool: &TypePool, rhs: Operand, ty: TypeId) -> Operand {
        match rhs {
            Operand::Const(Constant::Int { value, .. }) => Constant::int(pool, ty, value).into(),
            other => other,
        }
    }
}

impl IndexArith for EmitArith<'_> {
    fn add(&mut self, pool: &mut TypePool, lhs: Operand, rhs: Operand) -> Result<Operand, LayoutError> {
        if lhs.as_const_int().is_some() && rhs.as_const_int().is_some() {
            return ConstFold.add(pool, lhs, rhs);
        }
        // Keep the local on the left so the result takes its type.
        let (lhs, rhs) = if lhs.local().is_none() { (rhs, lhs) } else { (lhs, rhs) };
        let ty = self.operand_type(&lhs);
        let rhs = Self::coerce(pool, rhs, ty);
        let dst = fresh_value(self.value_types, ty);
        self.out.push(Instr::Binary {
            dst,
            op: BinOp::Add,
            lhs,
            rhs,
        });
        Ok(Operand::Local(dst))
    }

    fn mul(&mut self, pool: &mut TypePool, value: Operand, factor: u64) -> Result<Operand, LayoutError> {
        if value.as_const_int().is_some() {
            return ConstFold.mul(pool, value, factor);
        }
        let ty = self.operand_type(&value);
        let dst = fresh_value(self.value_types, ty);
        self.out.push(Instr::Binary {
            dst,
            op: BinOp::Mul,
            lhs: value,
            rhs: Constant::int(pool, ty, factor).into(),
        });
        Ok(Operand::Local(dst))
    }
}

#[cfg(test)]
mod tests;

//! Intrinsic declarations whose overloaded types changed.
//!
//! The name of an intrinsic declaration encodes its overloaded types, so a
//! declaration cannot simply be retyped when those types change. Callers
//! are redirected to the variant named for the new types, and the old
//! declaration is removed once nothing calls it.

use rustc_hash::FxHashSet;
use tracing::{debug, trace};
use tyopt_ir::{Callee, Constant, FuncId, Instr, Intrinsic, Operand, TypeId};

use super::ValueRewriter;
use crate::error::LayoutError;

impl ValueRewriter<'_, '_> {
    pub(super) fn rewrite_intrinsic(
        &mut self,
        id: FuncId,
        intrinsic: Intrinsic,
        new_fn_ty: TypeId,
    ) -> Result<(), LayoutError> {
        let tys = intrinsic.overloaded_types(&self.module.types, new_fn_ty);
        let name = intrinsic.mangled_name(&self.module.types, &tys);
        if name == self.module.function(id).name {
            self.module.function_mut(id).ty = self.module.types.pointer(new_fn_ty);
            return Ok(());
        }

        let target = match self.module.find_function(&name) {
            Some(existing) => {
                // Its own rewrite may not have happened yet.
                if self.pending.contains(&existing) {
                    self.rewrite_function(existing)?;
                }
                existing
            }
            None => {
                let (created, _) = self.module.get_or_insert_intrinsic(intrinsic, &tys);
                self.schedule_new(created);
                created
            }
        };

        let redirected = self.redirect_calls(id, target);
        self.stats.intrinsics_redirected += 1;
        trace!(
            from = %self.module.function(id).name,
            to = %name,
            calls = redirected,
            "redirected intrinsic"
        );
        Ok(())
    }

    /// Point every direct call of `from` at `to`. Returns the number of
    /// calls changed.
    fn redirect_calls(&mut self, from: FuncId, to: FuncId) -> usize {
        let mut count = 0;
        for func in &mut self.module.functions {
            for block in &mut func.blocks {
                for instr in &mut block.body {
                    if let Instr::Call {
                        callee: Callee::Direct(callee),
                        ..
                    } = instr
                    {
                        if *callee == from {
                            *callee = to;
                            count += 1;
                        }
                    }
                }
            }
        }
        count
    }

    /// Remove intrinsic declarations that are neither called nor referenced
    /// by a constant.
    pub(super) fn remove_unused_intrinsics(&mut self) {
        let mut used: FxHashSet<FuncId> = FxHashSet::default();
        for func in &self.module.functions {
            for block in &func.blocks {
                for instr in &block.body {
                    if let Instr::Call {
                        callee: Callee::Direct(callee),
                        ..
                    } = instr
                    {
                        used.insert(*callee);
                    }
                    instr.for_each_operand(|op| {
                        if let Operand::Const(c) = op {
                            note_constant(c, &mut used);
                        }
                    });
                }
                block.terminator.for_each_operand(|op| {
                    if let Operand::Const(c) = op {
                        note_constant(c, &mut used);
                    }
                });
            }
        }
        for global in &self.module.globals {
            if let Some(init) = &global.init {
                note_constant(init, &mut used);
            }
        }

        let removed = self.module.remove_functions(|id, func| {
            func.intrinsic.is_some() && func.is_declaration() && !used.contains(&id)
        });
        if removed > 0 {
            debug!(removed, "removed unused intrinsic declarations");
        }
        self.stats.intrinsics_removed = removed;
    }
}

fn note_constant(c: &Constant, used: &mut FxHashSet<FuncId>) {
    c.walk(&mut |c| {
        if let Constant::Function(f) = c {
            used.insert(*f);
        }
    });
}

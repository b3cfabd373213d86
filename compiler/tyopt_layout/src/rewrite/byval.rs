//! By-value arguments whose pointee became an array.
//!
//! An array cannot be passed by value, so the flag is dropped and the
//! caller makes the copy itself: a stack array, a `memcpy` into it, and a
//! pointer to its first element passed instead. The copy is skipped when
//! the callee is known not to write through the argument.

use smallvec::SmallVec;
use tyopt_ir::{Callee, FuncId, Instr, Intrinsic, Operand, TypeId};

use super::{BodyRewriter, ValueRewriter};
use crate::config::ByValCopyPolicy;
use crate::error::LayoutError;

impl ValueRewriter<'_, '_> {
    /// Drop the by-value flag of parameters whose pointee became an array.
    pub(super) fn strip_byval_params(&mut self, id: FuncId, old_fn_ty: TypeId) {
        let Some((_, old_params, _)) = self.module.types.function_sig(old_fn_ty) else {
            return;
        };
        let old_params: Vec<TypeId> = old_params.to_vec();
        for (i, old_ty) in old_params.into_iter().enumerate() {
            let byval = self.module.function(id).params.get(i).is_some_and(|p| p.byval);
            if !byval || !self.pointee_becomes_array(old_ty) {
                continue;
            }
            if let Some(param) = self.module.function_mut(id).params.get_mut(i) {
                param.byval = false;
            }
        }
    }

    fn pointee_becomes_array(&mut self, ptr_ty: TypeId) -> bool {
        let pool = &mut self.module.types;
        let Some(pointee) = pool.pointee(ptr_ty) else {
            return false;
        };
        let mapped = self.map.mapped(pool, pointee);
        pool.is_array(mapped)
    }
}

impl BodyRewriter<'_, '_, '_> {
    /// Rewrite the by-value arguments of `call`, copying where needed.
    /// Arguments are left in their original form for the caller to map.
    pub(super) fn copy_byval_args(&mut self, call: &mut Instr) -> Result<(), LayoutError> {
        let Instr::Call {
            callee,
            args,
            byval_args,
            ..
        } = call
        else {
            return Ok(());
        };

        let mut kept = byval_args.clone();
        kept.clear();
        for &position in byval_args.iter() {
            let Some(arg) = args.get(position as usize).cloned() else {
                continue;
            };
            let old_ty = self.orig_operand_type(&arg);
            if !self.rw.pointee_becomes_array(old_ty) {
                kept.push(position);
                continue;
            }
            if self.needs_copy(callee, position) {
                let copy = self.emit_copy(&arg, old_ty)?;
                args[position as usize] = copy;
            }
        }
        *byval_args = kept;
        Ok(())
    }

    fn needs_copy(&self, callee: &Callee, position: u32) -> bool {
        if self.rw.config.byval_copy == ByValCopyPolicy::Always {
            return true;
        }
        let Callee::Direct(id) = callee else {
            return true;
        };
        let func = self.rw.module.function(*id);
        let readonly = func.reads_only
            || func
                .params
                .get(position as usize)
                .is_some_and(|p| p.readonly);
        !readonly
    }

    /// Copy the array behind `arg` into a fresh stack slot. Returns a
    /// pointer to the first element of the copy.
    fn emit_copy(&mut self, arg: &Operand, old_ty: TypeId) -> Result<Operand, LayoutError> {
        let source = self.map_plain(arg)?;
        let pointee = self.rw.module.types.pointee(old_ty).unwrap_or(old_ty);
        let array = self.mapped_ty(pointee);
        let pool = &mut self.rw.module.types;
        let Some(elem) = pool.array_elem(array) else {
            return Err(LayoutError::UnexpectedConstant {
                what: format!("by-value argument of type `{}` is not an array", pool.display(array)),
            });
        };
        let size = self.rw.map.layout().alloc_size(pool, array);
        let array_ptr = pool.pointer(array);
        let elem_ptr = pool.pointer(elem);

        let storage = self.fresh(array_ptr);
        self.out.push(Instr::Alloca {
            dst: storage,
            allocated: array,
        });
        let first = self.fresh(elem_ptr);
        self.out.push(Instr::Gep {
            dst: first,
            elem_ty: array,
            base: Operand::Local(storage),
            indices: vec![Operand::i32(0), Operand::i32(0)],
            inbounds: true,
        });

        let (memcpy, created) = self
            .rw
            .module
            .get_or_insert_intrinsic(Intrinsic::Memcpy, &[elem_ptr, elem_ptr, TypeId::I32]);
        if created {
            self.rw.schedule_new(memcpy);
        }
        self.out.push(Instr::Call {
            dst: None,
            callee: Callee::Direct(memcpy),
            args: vec![
                Operand::Local(first),
                source,
                Operand::i32(u32::try_from(size).unwrap_or(u32::MAX)),
            ],
            byval_args: SmallVec::new(),
        });
        self.rw.stats.byval_copies += 1;
        Ok(Operand::Local(first))
    }
}

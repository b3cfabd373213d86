//! Loads and stores of bit-packed integer members.
//!
//! A pointer into a packed member points at the containing word and carries
//! the member's bit offset. A load extracts the member from the word, a
//! store merges it back in:
//!
//! ```text
//! load:  v = trunc((word >> offset))
//! store: word = (word & !(mask << offset)) | (zext(v) << offset)
//! ```

use tyopt_ir::{BinOp, CastOp, Constant, Instr, Operand, TypeId, ValueId};

use super::BodyRewriter;
use crate::error::LayoutError;

impl BodyRewriter<'_, '_, '_> {
    /// The word type behind `ptr` when an integer of type `value_ty` is
    /// packed into it.
    fn packed_word(&self, ptr: &Operand, bit_offset: u32, value_ty: TypeId) -> Option<TypeId> {
        let pool = &self.rw.module.types;
        if !pool.is_int(value_ty) {
            return None;
        }
        let word = pool.pointee(self.new_operand_type(ptr))?;
        (bit_offset != 0 || word != value_ty).then_some(word)
    }

    pub(super) fn rewrite_load(&mut self, dst: ValueId, ptr: &Operand) -> Result<(), LayoutError> {
        let (ptr, bit_offset) = self.map_operand(ptr)?;
        let value_ty = self.orig_type(dst);

        let Some(word_ty) = self.packed_word(&ptr, bit_offset, value_ty) else {
            self.out.push(Instr::Load { dst, ptr });
            self.retype(dst);
            return Ok(());
        };

        let word = self.fresh(word_ty);
        self.out.push(Instr::Load {
            dst: word,
            ptr,
        });
        let mut bits = Operand::Local(word);
        if bit_offset != 0 {
            let shifted = self.fresh(word_ty);
            let amount = Constant::int(&self.rw.module.types, word_ty, u64::from(bit_offset));
            self.out.push(Instr::Binary {
                dst: shifted,
                op: BinOp::LShr,
                lhs: bits,
                rhs: amount.into(),
            });
            bits = Operand::Local(shifted);
        }
        self.out.push(Instr::Cast {
            dst,
            op: CastOp::Trunc,
            value: bits,
        });
        Ok(())
    }

    pub(super) fn rewrite_store(&mut self, value: &Operand, ptr: &Operand) -> Result<(), LayoutError> {
        let value_ty = self.orig_operand_type(value);
        let new_value = self.map_plain(value)?;
        let (ptr, bit_offset) = self.map_operand(ptr)?;

        let Some(word_ty) = self.packed_word(&ptr, bit_offset, value_ty) else {
            self.out.push(Instr::Store {
                value: new_value,
                ptr,
            });
            return Ok(());
        };

        let pool = &self.rw.module.types;
        let value_bits = pool.int_bits(value_ty).unwrap_or(0);
        let word_bits = pool.int_bits(word_ty).unwrap_or(0);
        let keep = !(low_mask(value_bits) << bit_offset) & low_mask(word_bits);
        let keep = Constant::int(pool, word_ty, keep);
        let amount = Constant::int(pool, word_ty, u64::from(bit_offset));

        let word = self.fresh(word_ty);
        self.out.push(Instr::Load {
            dst: word,
            ptr: ptr.clone(),
        });
        let cleared = self.fresh(word_ty);
        self.out.push(Instr::Binary {
            dst: cleared,
            op: BinOp::And,
            lhs: Operand::Local(word),
            rhs: keep.into(),
        });
        let widened = self.fresh(word_ty);
        self.out.push(Instr::Cast {
            dst: widened,
            op: CastOp::ZExt,
            value: new_value,
        });
        let mut member = Operand::Local(widened);
        if bit_offset != 0 {
            let shifted = self.fresh(word_ty);
            self.out.push(Instr::Binary {
                dst: shifted,
                op: BinOp::Shl,
                lhs: member,
                rhs: amount.into(),
            });
            member = Operand::Local(shifted);
        }
        let merged = self.fresh(word_ty);
        self.out.push(Instr::Binary {
            dst: merged,
            op: BinOp::Or,
            lhs: Operand::Local(cleared),
            rhs: member,
        });
        self.out.push(Instr::Store {
            value: Operand::Local(merged),
            ptr,
        });
        Ok(())
    }
}

/// The lowest `bits` bits set.
fn low_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

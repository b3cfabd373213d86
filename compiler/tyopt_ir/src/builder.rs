//! Function builder.
//!
//! Follows the "position at a block, emit instructions, terminate" pattern:
//! the builder owns the in-progress blocks and value table, borrows the
//! [`Module`] for type construction, and registers the finished function
//! with [`finish`](FunctionBuilder::finish).

use smallvec::SmallVec;

use crate::ir::{
    BinOp, Block, BlockId, Callee, CastOp, FuncId, Function, Instr, Module, Operand, Terminator,
    ValueId,
};
use crate::ty::TypeId;

/// In-progress basic block.
struct BlockBuilder {
    id: BlockId,
    body: Vec<Instr>,
    terminator: Option<Terminator>,
}

impl BlockBuilder {
    fn new(id: BlockId) -> Self {
        Self {
            id,
            body: Vec::new(),
            terminator: None,
        }
    }
}

/// Builder for one function body.
pub struct FunctionBuilder<'m> {
    module: &'m mut Module,
    func: Function,
    blocks: Vec<BlockBuilder>,
    current_block: BlockId,
}

impl<'m> FunctionBuilder<'m> {
    /// Start a function of function type `fn_ty` with an empty entry block.
    ///
    /// # Panics
    ///
    /// Panics if `fn_ty` is not a function type.
    pub fn new(module: &'m mut Module, name: impl Into<String>, fn_ty: TypeId) -> Self {
        let ptr = module.types.pointer(fn_ty);
        let func = Function::declaration(&module.types, name, ptr);
        Self {
            module,
            func,
            blocks: vec![BlockBuilder::new(BlockId::new(0))],
            current_block: BlockId::new(0),
        }
    }

    /// The module the function is being built in.
    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    /// Value bound to parameter `index`.
    pub fn param(&self, index: usize) -> ValueId {
        self.func.params[index].value
    }

    /// Mark parameter `index` as passed by value.
    pub fn set_param_byval(&mut self, index: usize) {
        self.func.params[index].byval = true;
    }

    /// Mark parameter `index` as only read through.
    pub fn set_param_readonly(&mut self, index: usize) {
        self.func.params[index].readonly = true;
    }

    /// Mark the whole function as never writing memory.
    pub fn set_reads_only(&mut self) {
        self.func.reads_only = true;
    }

    // Block management

    /// Allocate a new empty block and return its ID.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId::new(self.blocks.len() as u32);
        self.blocks.push(BlockBuilder::new(id));
        id
    }

    /// Set the current insertion point to the given block.
    pub fn position_at(&mut self, block: BlockId) {
        debug_assert!(
            block.index() < self.blocks.len(),
            "BlockId {} out of bounds (have {} blocks)",
            block.raw(),
            self.blocks.len(),
        );
        self.current_block = block;
    }

    #[inline]
    pub fn current_block(&self) -> BlockId {
        self.current_block
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.blocks[self.current_block.index()].terminator.is_some()
    }

    // Values

    /// Type of an operand as seen from this function.
    pub fn operand_type(&self, op: &Operand) -> TypeId {
        match op {
            Operand::Local(v) => self.func.value_type(*v),
            Operand::Const(c) => c.ty(self.module),
        }
    }

    fn fresh(&mut self, ty: TypeId) -> ValueId {
        self.func.fresh_value(ty)
    }

    fn push(&mut self, instr: Instr) {
        let block = &mut self.blocks[self.current_block.index()];
        debug_assert!(
            block.terminator.is_none(),
            "emitting into terminated block {}",
            self.current_block.raw()
        );
        block.body.push(instr);
    }

    fn pointee_of(&self, ptr: &Operand) -> TypeId {
        let ty = self.operand_type(ptr);
        self.module.types.pointee(ty).unwrap_or_else(|| {
            panic!(
                "expected a pointer operand, got `{}`",
                self.module.types.display(ty)
            )
        })
    }

    // Instruction emission

    pub fn alloca(&mut self, allocated: TypeId) -> ValueId {
        let ptr = self.module.types.pointer(allocated);
        let dst = self.fresh(ptr);
        self.push(Instr::Alloca { dst, allocated });
        dst
    }

    pub fn load(&mut self, ptr: impl Into<Operand>) -> ValueId {
        let ptr = ptr.into();
        let ty = self.pointee_of(&ptr);
        let dst = self.fresh(ty);
        self.push(Instr::Load { dst, ptr });
        dst
    }

    pub fn store(&mut self, value: impl Into<Operand>, ptr: impl Into<Operand>) {
        self.push(Instr::Store {
            value: value.into(),
            ptr: ptr.into(),
        });
    }

    /// Emit an inbounds address computation over `elem_ty`.
    ///
    /// # Panics
    ///
    /// Panics if the indices do not resolve against `elem_ty` (struct
    /// steps must be constant).
    pub fn gep(&mut self, elem_ty: TypeId, base: impl Into<Operand>, indices: Vec<Operand>) -> ValueId {
        let steps = indices.iter().skip(1).map(Operand::as_const_int);
        let target = self
            .module
            .types
            .walk_indices(elem_ty, steps)
            .unwrap_or_else(|| {
                panic!(
                    "address indices do not resolve against `{}`",
                    self.module.types.display(elem_ty)
                )
            });
        let ty = self.module.types.pointer(target);
        let dst = self.fresh(ty);
        self.push(Instr::Gep {
            dst,
            elem_ty,
            base: base.into(),
            indices,
            inbounds: true,
        });
        dst
    }

    /// Constant `i32` field path shorthand for [`gep`](Self::gep).
    pub fn gep_const(&mut self, elem_ty: TypeId, base: impl Into<Operand>, path: &[u32]) -> ValueId {
        let indices = path.iter().map(|&i| Operand::i32(i)).collect();
        self.gep(elem_ty, base, indices)
    }

    pub fn bitcast(&mut self, value: impl Into<Operand>, ty: TypeId) -> ValueId {
        let dst = self.fresh(ty);
        self.push(Instr::BitCast {
            dst,
            value: value.into(),
        });
        dst
    }

    pub fn int_to_ptr(&mut self, value: impl Into<Operand>, ty: TypeId) -> ValueId {
        let dst = self.fresh(ty);
        self.push(Instr::IntToPtr {
            dst,
            value: value.into(),
        });
        dst
    }

    /// Binary operation; the result has the type of `lhs`.
    pub fn binary(&mut self, op: BinOp, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        let lhs = lhs.into();
        let ty = self.operand_type(&lhs);
        let dst = self.fresh(ty);
        self.push(Instr::Binary {
            dst,
            op,
            lhs,
            rhs: rhs.into(),
        });
        dst
    }

    pub fn cast(&mut self, op: CastOp, value: impl Into<Operand>, ty: TypeId) -> ValueId {
        let dst = self.fresh(ty);
        self.push(Instr::Cast {
            dst,
            op,
            value: value.into(),
        });
        dst
    }

    /// Direct call. Returns `None` for `void` callees.
    pub fn call(&mut self, callee: FuncId, args: Vec<Operand>) -> Option<ValueId> {
        self.call_with_byval(callee, args, &[])
    }

    /// Direct call passing the arguments at `byval` positions by value.
    pub fn call_with_byval(
        &mut self,
        callee: FuncId,
        args: Vec<Operand>,
        byval: &[u32],
    ) -> Option<ValueId> {
        let fn_ty = self.module.function(callee).fn_type(&self.module.types);
        let ret = self
            .module
            .types
            .function_sig(fn_ty)
            .map_or(TypeId::VOID, |(ret, _, _)| ret);
        let dst = (ret != TypeId::VOID).then(|| self.fresh(ret));
        self.push(Instr::Call {
            dst,
            callee: Callee::Direct(callee),
            args,
            byval_args: byval.iter().copied().collect::<SmallVec<[u32; 2]>>(),
        });
        dst
    }

    pub fn phi(&mut self, ty: TypeId, incoming: Vec<(Operand, BlockId)>) -> ValueId {
        let dst = self.fresh(ty);
        self.push(Instr::Phi { dst, incoming });
        dst
    }

    pub fn select(
        &mut self,
        cond: impl Into<Operand>,
        then_value: impl Into<Operand>,
        else_value: impl Into<Operand>,
    ) -> ValueId {
        let then_value = then_value.into();
        let ty = self.operand_type(&then_value);
        let dst = self.fresh(ty);
        self.push(Instr::Select {
            dst,
            cond: cond.into(),
            then_value,
            else_value: else_value.into(),
        });
        dst
    }

    // Terminators

    fn terminate(&mut self, terminator: Terminator) {
        let block = &mut self.blocks[self.current_block.index()];
        debug_assert!(
            block.terminator.is_none(),
            "block {} already terminated",
            self.current_block.raw()
        );
        block.terminator = Some(terminator);
    }

    pub fn ret(&mut self, value: impl Into<Operand>) {
        self.terminate(Terminator::Ret {
            value: Some(value.into()),
        });
    }

    pub fn ret_void(&mut self) {
        self.terminate(Terminator::Ret { value: None });
    }

    pub fn br(&mut self, target: BlockId) {
        self.terminate(Terminator::Br { target });
    }

    pub fn cond_br(&mut self, cond: impl Into<Operand>, then_block: BlockId, else_block: BlockId) {
        self.terminate(Terminator::CondBr {
            cond: cond.into(),
            then_block,
            else_block,
        });
    }

    pub fn switch(&mut self, value: impl Into<Operand>, cases: Vec<(u64, BlockId)>, default: BlockId) {
        self.terminate(Terminator::Switch {
            value: value.into(),
            cases,
            default,
        });
    }

    pub fn unreachable(&mut self) {
        self.terminate(Terminator::Unreachable);
    }

    // Finalization

    /// Consume the builder and add the finished function to the module.
    ///
    /// Unterminated blocks get `Unreachable` (with a tracing warning).
    pub fn finish(self) -> FuncId {
        let Self {
            module,
            mut func,
            blocks,
            ..
        } = self;
        func.blocks = blocks
            .into_iter()
            .map(|bb| {
                let terminator = bb.terminator.unwrap_or_else(|| {
                    tracing::warn!(
                        function = %func.name,
                        block = bb.id.raw(),
                        "unterminated block, adding Unreachable"
                    );
                    Terminator::Unreachable
                });
                Block {
                    id: bb.id,
                    body: bb.body,
                    terminator,
                }
            })
            .collect();
        module.add_function(func)
    }
}

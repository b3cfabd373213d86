//! Typed SSA program representation.
//!
//! The layout optimizer rewrites programs expressed in this IR:
//!
//! - **[`Module`]**: type pool, globals, functions
//! - **[`Function`]**: parameters, basic blocks, per-value types
//! - **[`Block`]**: sequential [`Instr`]uctions plus one [`Terminator`]
//! - **[`Operand`]**: either a local SSA value or a [`Constant`]
//!
//! Every SSA value produced inside a function is named by a [`ValueId`];
//! its type is recorded in [`Function::value_types`]. Pointers are typed
//! (`T*`), and address computations ([`Instr::Gep`], [`Constant::Gep`])
//! carry the element type their indices are applied against.

use smallvec::SmallVec;

use crate::intrinsic::Intrinsic;
use crate::pool::TypePool;
use crate::ty::TypeId;

// ── ID newtypes ─────────────────────────────────────────────────────

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            #[inline]
            pub const fn raw(self) -> u32 {
                self.0
            }

            #[inline]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_id!(
    /// SSA value within one [`Function`]. Parameters come first.
    ValueId
);
define_id!(
    /// Basic block within one [`Function`].
    BlockId
);
define_id!(
    /// Global variable within a [`Module`].
    GlobalId
);
define_id!(
    /// Function within a [`Module`].
    FuncId
);

fn id_from_len(len: usize, what: &str) -> u32 {
    u32::try_from(len).unwrap_or_else(|_| panic!("{what} count exceeds u32::MAX"))
}

// ── Constants ───────────────────────────────────────────────────────

/// A compile-time constant.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Constant {
    /// Integer of type `ty`. Only the low `bits(ty)` bits are meaningful.
    Int { ty: TypeId, value: u64 },
    /// Float of type `ty`, stored as raw IEEE bits.
    Float { ty: TypeId, bits: u64 },
    /// Null pointer of pointer type `ty`.
    Null(TypeId),
    Undef(TypeId),
    /// All-zero value of any sized type.
    Zero(TypeId),
    Struct {
        ty: TypeId,
        fields: Vec<Constant>,
    },
    Array {
        ty: TypeId,
        elems: Vec<Constant>,
    },
    /// Address of a global variable.
    Global(GlobalId),
    /// Address of a function.
    Function(FuncId),
    /// Constant address computation. `ty` is the resulting pointer type,
    /// `elem_ty` the type the first index steps over.
    Gep {
        ty: TypeId,
        elem_ty: TypeId,
        base: Box<Constant>,
        indices: Vec<Constant>,
    },
    BitCast {
        ty: TypeId,
        value: Box<Constant>,
    },
    IntToPtr {
        ty: TypeId,
        value: Box<Constant>,
    },
}

impl Constant {
    /// Shorthand for an `i32` constant.
    #[inline]
    pub fn i32(value: u32) -> Self {
        Constant::Int {
            ty: TypeId::I32,
            value: u64::from(value),
        }
    }

    /// Integer constant truncated to the width of `ty`.
    pub fn int(pool: &TypePool, ty: TypeId, value: u64) -> Self {
        let value = match pool.int_bits(ty) {
            Some(bits) if bits < 64 => value & ((1u64 << bits) - 1),
            _ => value,
        };
        Constant::Int { ty, value }
    }

    /// The constant's type.
    pub fn ty(&self, module: &Module) -> TypeId {
        match self {
            Constant::Int { ty, .. }
            | Constant::Float { ty, .. }
            | Constant::Null(ty)
            | Constant::Undef(ty)
            | Constant::Zero(ty)
            | Constant::Struct { ty, .. }
            | Constant::Array { ty, .. }
            | Constant::Gep { ty, .. }
            | Constant::BitCast { ty, .. }
            | Constant::IntToPtr { ty, .. } => *ty,
            Constant::Global(g) => module.global(*g).ptr_ty,
            Constant::Function(f) => module.function(*f).ty,
        }
    }

    /// Integer payload, if this is an integer constant.
    #[inline]
    pub fn as_int(&self) -> Option<u64> {
        match self {
            Constant::Int { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Whether this is a constant expression (address arithmetic or cast).
    pub fn is_expr(&self) -> bool {
        matches!(
            self,
            Constant::Gep { .. } | Constant::BitCast { .. } | Constant::IntToPtr { .. }
        )
    }

    /// Visit this constant and every nested constant, outermost first.
    pub fn walk(&self, f: &mut impl FnMut(&Constant)) {
        f(self);
        match self {
            Constant::Struct { fields: items, .. } | Constant::Array { elems: items, .. } => {
                for c in items {
                    c.walk(f);
                }
            }
            Constant::Gep { base, indices, .. } => {
                base.walk(f);
                for c in indices {
                    c.walk(f);
                }
            }
            Constant::BitCast { value, .. } | Constant::IntToPtr { value, .. } => value.walk(f),
            _ => {}
        }
    }

    fn walk_mut(&mut self, f: &mut impl FnMut(&mut Constant)) {
        f(self);
        match self {
            Constant::Struct { fields: items, .. } | Constant::Array { elems: items, .. } => {
                for c in items {
                    c.walk_mut(f);
                }
            }
            Constant::Gep { base, indices, .. } => {
                base.walk_mut(f);
                for c in indices {
                    c.walk_mut(f);
                }
            }
            Constant::BitCast { value, .. } | Constant::IntToPtr { value, .. } => {
                value.walk_mut(f);
            }
            _ => {}
        }
    }
}

// ── Operands ────────────────────────────────────────────────────────

/// An instruction operand.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operand {
    Local(ValueId),
    Const(Constant),
}

impl Operand {
    #[inline]
    pub fn local(&self) -> Option<ValueId> {
        match self {
            Operand::Local(v) => Some(*v),
            Operand::Const(_) => None,
        }
    }

    /// Integer payload of a constant integer operand.
    #[inline]
    pub fn as_const_int(&self) -> Option<u64> {
        match self {
            Operand::Const(c) => c.as_int(),
            Operand::Local(_) => None,
        }
    }

    /// Shorthand for an `i32` constant operand.
    #[inline]
    pub fn i32(value: u32) -> Self {
        Operand::Const(Constant::i32(value))
    }
}

impl From<ValueId> for Operand {
    fn from(v: ValueId) -> Self {
        Operand::Local(v)
    }
}

impl From<Constant> for Operand {
    fn from(c: Constant) -> Self {
        Operand::Const(c)
    }
}

// ── Instructions ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
}

/// Call target.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Callee {
    Direct(FuncId),
    Indirect(Operand),
}

/// A single instruction. Result types live in [`Function::value_types`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Instr {
    /// Stack allocation of one `allocated`; result is `allocated*`.
    Alloca { dst: ValueId, allocated: TypeId },

    Load { dst: ValueId, ptr: Operand },

    Store { value: Operand, ptr: Operand },

    /// Address computation. The first index steps over `elem_ty` values
    /// behind `base`, the following ones step into `elem_ty`.
    Gep {
        dst: ValueId,
        elem_ty: TypeId,
        base: Operand,
        indices: Vec<Operand>,
        inbounds: bool,
    },

    BitCast { dst: ValueId, value: Operand },

    IntToPtr { dst: ValueId, value: Operand },

    Binary {
        dst: ValueId,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },

    Cast {
        dst: ValueId,
        op: CastOp,
        value: Operand,
    },

    /// Call. `byval_args` lists argument positions passed by value: the
    /// pointee is copied for the callee.
    Call {
        dst: Option<ValueId>,
        callee: Callee,
        args: Vec<Operand>,
        byval_args: SmallVec<[u32; 2]>,
    },

    Phi {
        dst: ValueId,
        incoming: Vec<(Operand, BlockId)>,
    },

    Select {
        dst: ValueId,
        cond: Operand,
        then_value: Operand,
        else_value: Operand,
    },
}

impl Instr {
    /// The value this instruction defines, if any.
    pub fn defined_value(&self) -> Option<ValueId> {
        match self {
            Instr::Alloca { dst, .. }
            | Instr::Load { dst, .. }
            | Instr::Gep { dst, .. }
            | Instr::BitCast { dst, .. }
            | Instr::IntToPtr { dst, .. }
            | Instr::Binary { dst, .. }
            | Instr::Cast { dst, .. }
            | Instr::Phi { dst, .. }
            | Instr::Select { dst, .. } => Some(*dst),
            Instr::Call { dst, .. } => *dst,
            Instr::Store { .. } => None,
        }
    }

    /// Visit every operand in read position.
    pub fn for_each_operand(&self, mut f: impl FnMut(&Operand)) {
        match self {
            Instr::Alloca { .. } => {}
            Instr::Load { ptr, .. } => f(ptr),
            Instr::Store { value, ptr } => {
                f(value);
                f(ptr);
            }
            Instr::Gep { base, indices, .. } => {
                f(base);
                indices.iter().for_each(f);
            }
            Instr::BitCast { value, .. }
            | Instr::IntToPtr { value, .. }
            | Instr::Cast { value, .. } => f(value),
            Instr::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Instr::Call { callee, args, .. } => {
                if let Callee::Indirect(target) = callee {
                    f(target);
                }
                args.iter().for_each(f);
            }
            Instr::Phi { incoming, .. } => {
                for (op, _) in incoming {
                    f(op);
                }
            }
            Instr::Select {
                cond,
                then_value,
                else_value,
                ..
            } => {
                f(cond);
                f(then_value);
                f(else_value);
            }
        }
    }

    /// Visit every operand in read position, mutably.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Operand)) {
        match self {
            Instr::Alloca { .. } => {}
            Instr::Load { ptr, .. } => f(ptr),
            Instr::Store { value, ptr } => {
                f(value);
                f(ptr);
            }
            Instr::Gep { base, indices, .. } => {
                f(base);
                indices.iter_mut().for_each(f);
            }
            Instr::BitCast { value, .. }
            | Instr::IntToPtr { value, .. }
            | Instr::Cast { value, .. } => f(value),
            Instr::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Instr::Call { callee, args, .. } => {
                if let Callee::Indirect(target) = callee {
                    f(target);
                }
                args.iter_mut().for_each(f);
            }
            Instr::Phi { incoming, .. } => {
                for (op, _) in incoming {
                    f(op);
                }
            }
            Instr::Select {
                cond,
                then_value,
                else_value,
                ..
            } => {
                f(cond);
                f(then_value);
                f(else_value);
            }
        }
    }
}

// ── Terminators ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Terminator {
    Ret {
        value: Option<Operand>,
    },
    Br {
        target: BlockId,
    },
    CondBr {
        cond: Operand,
        then_block: BlockId,
        else_block: BlockId,
    },
    Switch {
        value: Operand,
        cases: Vec<(u64, BlockId)>,
        default: BlockId,
    },
    Unreachable,
}

impl Terminator {
    /// Successor blocks in operand order (duplicates preserved).
    pub fn successors(&self) -> SmallVec<[BlockId; 4]> {
        match self {
            Terminator::Ret { .. } | Terminator::Unreachable => SmallVec::new(),
            Terminator::Br { target } => smallvec::smallvec![*target],
            Terminator::CondBr {
                then_block,
                else_block,
                ..
            } => smallvec::smallvec![*then_block, *else_block],
            Terminator::Switch { cases, default, .. } => {
                let mut targets: SmallVec<[BlockId; 4]> = cases.iter().map(|&(_, b)| b).collect();
                targets.push(*default);
                targets
            }
        }
    }

    pub fn for_each_operand(&self, mut f: impl FnMut(&Operand)) {
        match self {
            Terminator::Ret { value: Some(v) } => f(v),
            Terminator::CondBr { cond: v, .. } | Terminator::Switch { value: v, .. } => f(v),
            Terminator::Ret { value: None } | Terminator::Br { .. } | Terminator::Unreachable => {}
        }
    }

    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Operand)) {
        match self {
            Terminator::Ret { value: Some(v) } => f(v),
            Terminator::CondBr { cond: v, .. } | Terminator::Switch { value: v, .. } => f(v),
            Terminator::Ret { value: None } | Terminator::Br { .. } | Terminator::Unreachable => {}
        }
    }
}

// ── Blocks and functions ────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    pub id: BlockId,
    pub body: Vec<Instr>,
    pub terminator: Terminator,
}

/// A function parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Param {
    pub value: ValueId,
    /// The pointee is passed by value (copied for the callee).
    pub byval: bool,
    /// The callee only reads through this parameter.
    pub readonly: bool,
}

/// A function definition or declaration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Function {
    pub name: String,
    /// Pointer-to-function type.
    pub ty: TypeId,
    pub params: Vec<Param>,
    /// Empty for declarations. `blocks[entry.index()]` is the entry.
    pub blocks: Vec<Block>,
    pub entry: BlockId,
    /// Type of each value, indexed by [`ValueId::index`].
    pub value_types: Vec<TypeId>,
    pub intrinsic: Option<Intrinsic>,
    /// The function never writes memory.
    pub reads_only: bool,
}

impl Function {
    /// Create a declaration with one parameter value per function parameter.
    ///
    /// # Panics
    ///
    /// Panics if `ty` is not a pointer to a function type.
    pub fn declaration(pool: &TypePool, name: impl Into<String>, ty: TypeId) -> Self {
        let fn_ty = pool
            .pointee(ty)
            .unwrap_or_else(|| panic!("function type must be a pointer, got `{}`", pool.display(ty)));
        let Some((_, param_tys, _)) = pool.function_sig(fn_ty) else {
            panic!("`{}` is not a function type", pool.display(fn_ty));
        };
        let params = (0..param_tys.len())
            .map(|i| Param {
                value: ValueId::new(i as u32),
                byval: false,
                readonly: false,
            })
            .collect();
        Self {
            name: name.into(),
            ty,
            params,
            blocks: Vec::new(),
            entry: BlockId::new(0),
            value_types: param_tys.to_vec(),
            intrinsic: None,
            reads_only: false,
        }
    }

    #[inline]
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The function type behind [`ty`](Self::ty).
    pub fn fn_type(&self, pool: &TypePool) -> TypeId {
        pool.pointee(self.ty).unwrap_or(self.ty)
    }

    /// Look up the type of a value.
    #[inline]
    pub fn value_type(&self, value: ValueId) -> TypeId {
        debug_assert!(
            value.index() < self.value_types.len(),
            "ValueId {} out of bounds (have {} values)",
            value.raw(),
            self.value_types.len(),
        );
        self.value_types[value.index()]
    }

    /// Allocate a fresh value of the given type.
    pub fn fresh_value(&mut self, ty: TypeId) -> ValueId {
        let id = ValueId::new(id_from_len(self.value_types.len(), "value"));
        self.value_types.push(ty);
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }
}

// ── Globals and modules ─────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Global {
    pub name: String,
    /// Type of the stored value.
    pub value_ty: TypeId,
    /// Type of the global used as a value (`value_ty*`).
    pub ptr_ty: TypeId,
    pub init: Option<Constant>,
}

/// A whole program.
#[derive(Clone, Debug, Default)]
pub struct Module {
    pub types: TypePool,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        value_ty: TypeId,
        init: Option<Constant>,
    ) -> GlobalId {
        let id = GlobalId::new(id_from_len(self.globals.len(), "global"));
        let ptr_ty = self.types.pointer(value_ty);
        self.globals.push(Global {
            name: name.into(),
            value_ty,
            ptr_ty,
            init,
        });
        id
    }

    pub fn add_function(&mut self, func: Function) -> FuncId {
        let id = FuncId::new(id_from_len(self.functions.len(), "function"));
        self.functions.push(func);
        id
    }

    /// Declare a function of function type `fn_ty`.
    pub fn declare(&mut self, name: impl Into<String>, fn_ty: TypeId) -> FuncId {
        let ptr = self.types.pointer(fn_ty);
        let decl = Function::declaration(&self.types, name, ptr);
        self.add_function(decl)
    }

    #[inline]
    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.index()]
    }

    #[inline]
    pub fn global_mut(&mut self, id: GlobalId) -> &mut Global {
        &mut self.globals[id.index()]
    }

    #[inline]
    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    #[inline]
    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn function_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len()).map(|i| FuncId::new(i as u32))
    }

    pub fn global_ids(&self) -> impl Iterator<Item = GlobalId> {
        (0..self.globals.len()).map(|i| GlobalId::new(i as u32))
    }

    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId::new(i as u32))
    }

    /// Find or declare the variant of `intrinsic` overloaded on `tys`.
    ///
    /// Returns the id and whether a new declaration was created.
    pub fn get_or_insert_intrinsic(&mut self, intrinsic: Intrinsic, tys: &[TypeId]) -> (FuncId, bool) {
        let name = intrinsic.mangled_name(&self.types, tys);
        if let Some(id) = self.find_function(&name) {
            return (id, false);
        }
        let fn_ty = intrinsic.signature(&mut self.types, tys);
        let id = self.declare(name, fn_ty);
        self.function_mut(id).intrinsic = Some(intrinsic);
        (id, true)
    }

    /// Type of an operand used inside `func`.
    pub fn operand_type(&self, func: &Function, op: &Operand) -> TypeId {
        match op {
            Operand::Local(v) => func.value_type(*v),
            Operand::Const(c) => c.ty(self),
        }
    }

    /// Remove every function for which `remove` returns true and renumber
    /// all remaining references.
    ///
    /// Removed functions must be unreferenced. Returns the number removed.
    pub fn remove_functions(&mut self, mut remove: impl FnMut(FuncId, &Function) -> bool) -> usize {
        let mut remap: Vec<Option<FuncId>> = Vec::with_capacity(self.functions.len());
        let mut next = 0u32;
        for (i, f) in self.functions.iter().enumerate() {
            if remove(FuncId::new(i as u32), f) {
                remap.push(None);
            } else {
                remap.push(Some(FuncId::new(next)));
                next += 1;
            }
        }
        let removed = self.functions.len() - next as usize;
        if removed == 0 {
            return 0;
        }

        let mut index = 0;
        self.functions.retain(|_| {
            let keep = remap[index].is_some();
            index += 1;
            keep
        });

        let fix = |id: &mut FuncId| {
            *id = remap[id.index()]
                .unwrap_or_else(|| panic!("removed function {} is still referenced", id.raw()));
        };
        let fix_constant = |c: &mut Constant| {
            c.walk_mut(&mut |c| {
                if let Constant::Function(id) = c {
                    fix(id);
                }
            });
        };
        let fix_operand = |op: &mut Operand| {
            if let Operand::Const(c) = op {
                fix_constant(c);
            }
        };
        for func in &mut self.functions {
            for block in &mut func.blocks {
                for instr in &mut block.body {
                    if let Instr::Call {
                        callee: Callee::Direct(id),
                        ..
                    } = instr
                    {
                        fix(id);
                    }
                    instr.for_each_operand_mut(fix_operand);
                }
                block.terminator.for_each_operand_mut(fix_operand);
            }
        }
        for global in &mut self.globals {
            if let Some(init) = &mut global.init {
                fix_constant(init);
            }
        }
        removed
    }
}

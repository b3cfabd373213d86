//! Shared test utilities for the layout passes.
//!
//! Besides a few type factories, this provides [`Machine`], a byte-level
//! interpreter for the IR. Running a function before and after the rewrite
//! and comparing results checks that a new layout preserves behavior
//! without pinning the exact instruction sequence. Only compiled in test
//! builds.

use tyopt_ir::{
    AttributeOracle, BinOp, BlockId, Callee, CastOp, Constant, DataLayout, FuncId, Function, Instr,
    Intrinsic, Module, Operand, StructAttrs, TargetLayout, Terminator, TypeId, TypeKind, TypePool,
};

use crate::{optimize_types, LayoutFacts, LayoutRewrite, TypeMap, TypeOptimizerConfig};

/// Function pointers are encoded as `FN_BASE + id`.
const FN_BASE: u64 = 0x8000_0000;

/// Upper bound on executed instructions per run.
const STEP_LIMIT: usize = 100_000;

/// Struct with the given fields and no attributes.
pub(crate) fn plain_struct(module: &mut Module, name: &str, fields: &[TypeId]) -> TypeId {
    module
        .types
        .struct_type(Some(name), fields, StructAttrs::empty())
}

/// Union-like struct whose storage may be read through other views.
pub(crate) fn byte_layout_struct(module: &mut Module, name: &str, fields: &[TypeId]) -> TypeId {
    module
        .types
        .struct_type(Some(name), fields, StructAttrs::BYTE_LAYOUT)
}

/// Run `f` against a fresh type map over facts gathered from `module`.
pub(crate) fn with_map<R>(
    module: &mut Module,
    f: impl FnOnce(&mut TypeMap<'_>, &mut TypePool) -> R,
) -> R {
    let facts = LayoutFacts::gather(module);
    let layout = TargetLayout::default();
    let mut map = TypeMap::new(&facts, &layout, &AttributeOracle, 32);
    f(&mut map, &mut module.types)
}

/// Run the pass with the default layout and configuration.
pub(crate) fn optimize(module: &mut Module) -> LayoutRewrite {
    optimize_with(module, &TypeOptimizerConfig::default())
}

pub(crate) fn optimize_with(module: &mut Module, config: &TypeOptimizerConfig) -> LayoutRewrite {
    let layout = TargetLayout::default();
    optimize_types(module, &layout, &AttributeOracle, config).unwrap()
}

/// Run `name` with `args` on the module as is.
pub(crate) fn run(module: &Module, name: &str, args: &[u64]) -> u64 {
    let layout = TargetLayout::default();
    let mut machine = Machine::new(module, &layout);
    let id = module
        .find_function(name)
        .unwrap_or_else(|| panic!("no function `{name}`"));
    machine
        .call(id, args)
        .unwrap_or_else(|err| panic!("`{name}` failed: {err}"))
}

/// Run `name` before and after optimizing, assert both agree, and return
/// the rewrite.
pub(crate) fn assert_preserved(module: &mut Module, name: &str, args: &[u64]) -> LayoutRewrite {
    let before = run(module, name, args);
    let rewrite = optimize(module);
    let after = run(module, name, args);
    assert_eq!(before, after, "`{name}` changed behavior after layout rewrite");
    rewrite
}

/// Byte-addressed interpreter over a module.
pub(crate) struct Machine<'m> {
    module: &'m Module,
    layout: &'m TargetLayout,
    mem: Vec<u8>,
    globals: Vec<u64>,
    steps: usize,
}

impl<'m> Machine<'m> {
    pub(crate) fn new(module: &'m Module, layout: &'m TargetLayout) -> Self {
        let mut machine = Self {
            module,
            layout,
            // Address zero stays unused.
            mem: vec![0; 16],
            globals: Vec::new(),
            steps: 0,
        };
        for global in &module.globals {
            let size = machine.size(global.value_ty);
            let addr = machine.alloc(size);
            machine.globals.push(addr);
        }
        for (index, global) in module.globals.iter().enumerate() {
            if let Some(init) = &global.init {
                let addr = machine.globals[index];
                machine
                    .write_constant(addr, init)
                    .unwrap_or_else(|err| panic!("initializer of `{}`: {err}", global.name));
            }
        }
        machine
    }

    fn size(&self, ty: TypeId) -> u64 {
        self.layout.alloc_size(&self.module.types, ty)
    }

    fn alloc(&mut self, size: u64) -> u64 {
        let addr = (self.mem.len() as u64).div_ceil(8) * 8;
        self.mem.resize((addr + size.max(1)) as usize, 0);
        addr
    }

    // Memory

    fn read_bytes(&self, addr: u64, len: u64) -> Result<u64, String> {
        let start = addr as usize;
        let end = start + len as usize;
        let bytes = self
            .mem
            .get(start..end)
            .ok_or_else(|| format!("read of {len} bytes at {addr:#x} out of bounds"))?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    fn write_bytes(&mut self, addr: u64, len: u64, value: u64) -> Result<(), String> {
        let start = addr as usize;
        let end = start + len as usize;
        let bytes = self
            .mem
            .get_mut(start..end)
            .ok_or_else(|| format!("write of {len} bytes at {addr:#x} out of bounds"))?;
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (value >> (8 * i)) as u8;
        }
        Ok(())
    }

    /// Bytes a scalar of type `ty` occupies, or an error for aggregates.
    fn scalar_width(&self, ty: TypeId) -> Result<u64, String> {
        match self.module.types.kind(ty) {
            TypeKind::Int { .. } | TypeKind::Float { .. } | TypeKind::Pointer { .. } => {
                Ok(self.size(ty).min(8))
            }
            _ => Err(format!(
                "memory access of non-scalar `{}`",
                self.module.types.display(ty)
            )),
        }
    }

    fn read(&self, addr: u64, ty: TypeId) -> Result<u64, String> {
        let width = self.scalar_width(ty)?;
        Ok(self.mask(ty, self.read_bytes(addr, width)?))
    }

    fn write(&mut self, addr: u64, ty: TypeId, value: u64) -> Result<(), String> {
        let width = self.scalar_width(ty)?;
        let value = self.mask(ty, value);
        self.write_bytes(addr, width, value)
    }

    fn mask(&self, ty: TypeId, value: u64) -> u64 {
        match self.module.types.int_bits(ty) {
            Some(bits) if bits < 64 => value & ((1u64 << bits) - 1),
            _ => value,
        }
    }

    fn write_constant(&mut self, addr: u64, c: &Constant) -> Result<(), String> {
        let module = self.module;
        let pool = &module.types;
        match c {
            Constant::Struct { ty, fields } => {
                let offsets: Vec<u64> = (0..fields.len())
                    .map(|i| self.layout.field_offset(pool, *ty, i))
                    .collect();
                for (field, offset) in fields.iter().zip(offsets) {
                    self.write_constant(addr + offset, field)?;
                }
                Ok(())
            }
            Constant::Array { ty, elems } => {
                let elem = pool
                    .array_elem(*ty)
                    .ok_or_else(|| "array constant of non-array type".to_owned())?;
                let stride = self.size(elem);
                for (i, item) in elems.iter().enumerate() {
                    self.write_constant(addr + stride * i as u64, item)?;
                }
                Ok(())
            }
            // Fresh memory is already zero.
            Constant::Zero(_) | Constant::Undef(_) => Ok(()),
            scalar => {
                let ty = scalar.ty(self.module);
                let value = self.constant(scalar)?;
                self.write(addr, ty, value)
            }
        }
    }

    // Evaluation

    fn constant(&self, c: &Constant) -> Result<u64, String> {
        match c {
            Constant::Int { value, .. } => Ok(*value),
            Constant::Float { bits, .. } => Ok(*bits),
            Constant::Null(_) | Constant::Zero(_) | Constant::Undef(_) => Ok(0),
            Constant::Global(g) => Ok(self.globals[g.index()]),
            Constant::Function(f) => Ok(FN_BASE + u64::from(f.raw())),
            Constant::Gep {
                elem_ty,
                base,
                indices,
                ..
            } => {
                let base = self.constant(base)?;
                let indices = indices
                    .iter()
                    .map(|i| self.constant(i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(base.wrapping_add(self.offset(*elem_ty, &indices)?))
            }
            Constant::BitCast { value, .. } | Constant::IntToPtr { value, .. } => {
                self.constant(value)
            }
            Constant::Struct { .. } | Constant::Array { .. } => {
                Err("aggregate constant used as an operand".to_owned())
            }
        }
    }

    /// Byte offset of an address computation over `elem_ty`.
    fn offset(&self, elem_ty: TypeId, indices: &[u64]) -> Result<u64, String> {
        let module = self.module;
        let pool = &module.types;
        let Some((&first, rest)) = indices.split_first() else {
            return Ok(0);
        };
        let mut offset = first.wrapping_mul(self.size(elem_ty));
        let mut cur = elem_ty;
        for &index in rest {
            match pool.kind(cur) {
                TypeKind::Struct(s) => {
                    let field = *s
                        .fields()
                        .get(index as usize)
                        .ok_or_else(|| format!("field {index} out of range"))?;
                    offset += self.layout.field_offset(pool, cur, index as usize);
                    cur = field;
                }
                TypeKind::Array { elem, .. } => {
                    offset = offset.wrapping_add(index.wrapping_mul(self.size(*elem)));
                    cur = *elem;
                }
                _ => {
                    return Err(format!(
                        "cannot index into `{}`",
                        pool.display(cur)
                    ))
                }
            }
        }
        Ok(offset)
    }

    fn operand(&self, vals: &[u64], op: &Operand) -> Result<u64, String> {
        match op {
            Operand::Local(v) => vals
                .get(v.index())
                .copied()
                .ok_or_else(|| format!("undefined value %{}", v.raw())),
            Operand::Const(c) => self.constant(c),
        }
    }

    pub(crate) fn call(&mut self, id: FuncId, args: &[u64]) -> Result<u64, String> {
        let module = self.module;
        let func = module.function(id);
        if func.is_declaration() {
            return match func.intrinsic {
                Some(Intrinsic::Memcpy | Intrinsic::Memmove) => {
                    let (dst, src, len) = (args[0], args[1], args[2]);
                    let bytes: Vec<u8> = self.mem[src as usize..(src + len) as usize].to_vec();
                    self.mem[dst as usize..(dst + len) as usize].copy_from_slice(&bytes);
                    Ok(0)
                }
                // The first member sits at the start of the object.
                Some(Intrinsic::UpcastCollapsed) => Ok(args[0]),
                _ => Err(format!("call of declaration `{}`", func.name)),
            };
        }

        let mut vals = vec![0u64; func.value_types.len()];
        for (param, &arg) in func.params.iter().zip(args) {
            vals[param.value.index()] = arg;
        }
        let mut block = func.entry;
        let mut prev = None;
        loop {
            let body = func.block(block);
            for instr in &body.body {
                self.steps += 1;
                if self.steps > STEP_LIMIT {
                    return Err("step limit exceeded".to_owned());
                }
                self.exec(func, &mut vals, instr, prev)?;
            }
            let next = match &body.terminator {
                Terminator::Ret { value } => {
                    return value
                        .as_ref()
                        .map_or(Ok(0), |v| self.operand(&vals, v));
                }
                Terminator::Br { target } => *target,
                Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                } => {
                    if self.operand(&vals, cond)? & 1 == 1 {
                        *then_block
                    } else {
                        *else_block
                    }
                }
                Terminator::Switch {
                    value,
                    cases,
                    default,
                } => {
                    let value = self.operand(&vals, value)?;
                    cases
                        .iter()
                        .find(|(case, _)| *case == value)
                        .map_or(*default, |(_, target)| *target)
                }
                Terminator::Unreachable => return Err("reached unreachable".to_owned()),
            };
            prev = Some(block);
            block = next;
        }
    }

    fn exec(
        &mut self,
        func: &Function,
        vals: &mut [u64],
        instr: &Instr,
        prev: Option<BlockId>,
    ) -> Result<(), String> {
        let module = self.module;
        let pool = &module.types;
        match instr {
            Instr::Alloca { dst, allocated } => {
                let size = self.size(*allocated);
                vals[dst.index()] = self.alloc(size);
            }
            Instr::Load { dst, ptr } => {
                let addr = self.operand(vals, ptr)?;
                vals[dst.index()] = self.read(addr, func.value_type(*dst))?;
            }
            Instr::Store { value, ptr } => {
                let ty = module.operand_type(func, value);
                let value = self.operand(vals, value)?;
                let addr = self.operand(vals, ptr)?;
                self.write(addr, ty, value)?;
            }
            Instr::Gep {
                dst,
                elem_ty,
                base,
                indices,
                ..
            } => {
                let base = self.operand(vals, base)?;
                let indices = indices
                    .iter()
                    .map(|i| self.operand(vals, i))
                    .collect::<Result<Vec<_>, _>>()?;
                vals[dst.index()] = base.wrapping_add(self.offset(*elem_ty, &indices)?);
            }
            Instr::BitCast { dst, value } | Instr::IntToPtr { dst, value } => {
                vals[dst.index()] = self.operand(vals, value)?;
            }
            Instr::Binary { dst, op, lhs, rhs } => {
                let (a, b) = (self.operand(vals, lhs)?, self.operand(vals, rhs)?);
                let result = match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::And => a & b,
                    BinOp::Or => a | b,
                    BinOp::Xor => a ^ b,
                    BinOp::Shl => a.wrapping_shl(b as u32),
                    BinOp::LShr => a.wrapping_shr(b as u32),
                    BinOp::AShr => {
                        let bits = pool.int_bits(func.value_type(*dst)).unwrap_or(64);
                        (sign_extend(a, bits) as i64).wrapping_shr(b as u32) as u64
                    }
                };
                vals[dst.index()] = self.mask(func.value_type(*dst), result);
            }
            Instr::Cast { dst, op, value } => {
                let src_ty = module.operand_type(func, value);
                let v = self.operand(vals, value)?;
                let result = match op {
                    CastOp::Trunc | CastOp::ZExt => v,
                    CastOp::SExt => sign_extend(v, pool.int_bits(src_ty).unwrap_or(64)),
                };
                vals[dst.index()] = self.mask(func.value_type(*dst), result);
            }
            Instr::Call {
                dst,
                callee,
                args,
                byval_args,
            } => {
                let target = match callee {
                    Callee::Direct(f) => *f,
                    Callee::Indirect(op) => {
                        let raw = self.operand(vals, op)?;
                        FuncId::new(u32::try_from(raw - FN_BASE).map_err(|e| e.to_string())?)
                    }
                };
                let mut values = args
                    .iter()
                    .map(|a| self.operand(vals, a))
                    .collect::<Result<Vec<_>, _>>()?;
                for &position in byval_args {
                    let arg = &args[position as usize];
                    let ty = module.operand_type(func, arg);
                    let pointee = pool
                        .pointee(ty)
                        .ok_or_else(|| "by-value argument is not a pointer".to_owned())?;
                    let size = self.size(pointee);
                    let copy = self.alloc(size);
                    let src = values[position as usize];
                    let bytes: Vec<u8> = self.mem[src as usize..(src + size) as usize].to_vec();
                    self.mem[copy as usize..(copy + size) as usize].copy_from_slice(&bytes);
                    values[position as usize] = copy;
                }
                let result = self.call(target, &values)?;
                if let Some(dst) = dst {
                    vals[dst.index()] = result;
                }
            }
            Instr::Phi { dst, incoming } => {
                let from = prev.ok_or_else(|| "phi in entry block".to_owned())?;
                let (op, _) = incoming
                    .iter()
                    .find(|(_, block)| *block == from)
                    .ok_or_else(|| "phi has no incoming value for predecessor".to_owned())?;
                vals[dst.index()] = self.operand(vals, op)?;
            }
            Instr::Select {
                dst,
                cond,
                then_value,
                else_value,
            } => {
                let chosen = if self.operand(vals, cond)? & 1 == 1 {
                    then_value
                } else {
                    else_value
                };
                vals[dst.index()] = self.operand(vals, chosen)?;
            }
        }
        Ok(())
    }
}

fn sign_extend(value: u64, bits: u32) -> u64 {
    if bits >= 64 || bits == 0 {
        return value;
    }
    let shift = 64 - bits;
    (((value << shift) as i64) >> shift) as u64
}

use pretty_assertions::assert_eq;
use tyopt_ir::{
    BinOp, BlockId, CastOp, Constant, FuncId, FunctionBuilder, Instr, Intrinsic, Module, Operand,
    StructAttrs, TypeId, ValueId,
};

use crate::config::{ByValCopyPolicy, TypeOptimizerConfig};
use crate::test_helpers::{assert_preserved, optimize_with, plain_struct, run};
use crate::type_map::MappingKind;

fn i8(value: u64) -> Operand {
    Constant::Int {
        ty: TypeId::I8,
        value,
    }
    .into()
}

/// Append an incoming edge to the phi defining `phi` in `func`.
fn add_incoming(module: &mut Module, func: FuncId, phi: ValueId, value: ValueId, from: BlockId) {
    for block in &mut module.function_mut(func).blocks {
        for instr in &mut block.body {
            if let Instr::Phi { dst, incoming } = instr {
                if *dst == phi {
                    incoming.push((Operand::Local(value), from));
                    return;
                }
            }
        }
    }
    panic!("no phi defines %{}", phi.raw());
}

#[test]
fn packed_members_keep_their_values() {
    let mut module = Module::new();
    let flags = plain_struct(&mut module, "Flags", &[TypeId::I8, TypeId::I8, TypeId::I32]);
    let fn_ty = module.types.function(TypeId::I32, &[], false);

    let mut b = FunctionBuilder::new(&mut module, "f", fn_ty);
    let slot = b.alloca(flags);
    let f0 = b.gep_const(flags, slot, &[0, 0]);
    let f1 = b.gep_const(flags, slot, &[0, 1]);
    let f2 = b.gep_const(flags, slot, &[0, 2]);
    // The second store must not clobber the first member of the word.
    b.store(i8(5), f1);
    b.store(i8(3), f0);
    b.store(Operand::i32(100), f2);
    let lo = b.load(f0);
    let hi = b.load(f1);
    let rest = b.load(f2);
    let lo = b.cast(CastOp::ZExt, lo, TypeId::I32);
    let hi = b.cast(CastOp::ZExt, hi, TypeId::I32);
    let hi = b.binary(BinOp::Shl, hi, Operand::i32(8));
    let word = b.binary(BinOp::Or, lo, hi);
    let sum = b.binary(BinOp::Add, word, rest);
    b.ret(sum);
    b.finish();

    assert_eq!(run(&module, "f", &[]), 0x503 + 100);
    let rewrite = assert_preserved(&mut module, "f", &[]);
    let new_flags = rewrite.mapped(flags);
    assert_eq!(module.types.struct_fields(new_flags), &[TypeId::I16, TypeId::I32]);
}

#[test]
fn packed_member_sign_extends_after_extraction() {
    let mut module = Module::new();
    let flags = plain_struct(&mut module, "Flags", &[TypeId::I8, TypeId::I8]);
    let fn_ty = module.types.function(TypeId::I32, &[], false);

    let mut b = FunctionBuilder::new(&mut module, "f", fn_ty);
    let slot = b.alloca(flags);
    let f0 = b.gep_const(flags, slot, &[0, 0]);
    let f1 = b.gep_const(flags, slot, &[0, 1]);
    b.store(i8(1), f0);
    b.store(i8(0xfe), f1);
    let v = b.load(f1);
    let v = b.cast(CastOp::SExt, v, TypeId::I32);
    b.ret(v);
    b.finish();

    assert_eq!(run(&module, "f", &[]), 0xffff_fffe);
    assert_preserved(&mut module, "f", &[]);
}

#[test]
fn merged_arrays_with_dynamic_index() {
    let mut module = Module::new();
    let four = module.types.array(TypeId::I32, 4);
    let s = plain_struct(&mut module, "S", &[four, four]);
    let fn_ty = module.types.function(TypeId::I32, &[TypeId::I32], false);

    let mut b = FunctionBuilder::new(&mut module, "f", fn_ty);
    let i = b.param(0);
    let slot = b.alloca(s);
    let second = b.gep(s, slot, vec![Operand::i32(0), Operand::i32(1), i.into()]);
    b.store(Operand::i32(7), second);
    let first = b.gep(s, slot, vec![Operand::i32(0), Operand::i32(0), i.into()]);
    b.store(Operand::i32(3), first);
    let a = b.load(second);
    let c = b.load(first);
    let sum = b.binary(BinOp::Add, a, c);
    b.ret(sum);
    b.finish();

    let rewrite = assert_preserved(&mut module, "f", &[2]);
    assert_eq!(rewrite.kind(s), MappingKind::MergedMemberArraysAndCollapsed);
    for i in 0..4 {
        assert_eq!(run(&module, "f", &[i]), 10);
    }
}

#[test]
fn nested_array_alloca_is_flattened() {
    let mut module = Module::new();
    let row = module.types.array(TypeId::I32, 3);
    let grid = module.types.array(row, 2);
    let fn_ty = module.types.function(TypeId::I32, &[TypeId::I32, TypeId::I32], false);

    let mut b = FunctionBuilder::new(&mut module, "f", fn_ty);
    let (i, j) = (b.param(0), b.param(1));
    let slot = b.alloca(grid);
    for k in 0..6u32 {
        let cell = b.gep_const(grid, slot, &[0, k / 3, k % 3]);
        b.store(Operand::i32(k * 10), cell);
    }
    let cell = b.gep(grid, slot, vec![Operand::i32(0), i.into(), j.into()]);
    let v = b.load(cell);
    b.ret(v);
    b.finish();

    let rewrite = assert_preserved(&mut module, "f", &[1, 2]);
    assert_eq!(rewrite.kind(grid), MappingKind::FlattenedArray);
    assert_eq!(run(&module, "f", &[0, 1]), 10);
}

#[test]
fn pointer_phi_walks_rewritten_array() {
    let mut module = Module::new();
    let pair = plain_struct(&mut module, "Pair", &[TypeId::I32, TypeId::I32]);
    let pairs = module.types.array(pair, 3);
    let ptr_pair = module.types.pointer(pair);
    let fn_ty = module.types.function(TypeId::I32, &[], false);

    let mut b = FunctionBuilder::new(&mut module, "sum", fn_ty);
    let entry = b.current_block();
    let header = b.new_block();
    let exit = b.new_block();
    let slot = b.alloca(pairs);
    for k in 0..3u32 {
        let tag = b.gep_const(pairs, slot, &[0, k, 0]);
        b.store(Operand::i32(100), tag);
        let value = b.gep_const(pairs, slot, &[0, k, 1]);
        b.store(Operand::i32(k + 1), value);
    }
    let start = b.gep_const(pairs, slot, &[0, 0]);
    b.br(header);

    b.position_at(header);
    let p = b.phi(ptr_pair, vec![(start.into(), entry)]);
    let acc = b.phi(TypeId::I32, vec![(Operand::i32(0), entry)]);
    let i = b.phi(TypeId::I32, vec![(Operand::i32(0), entry)]);
    let field = b.gep_const(pair, p, &[0, 1]);
    let v = b.load(field);
    let acc_next = b.binary(BinOp::Add, acc, v);
    let p_next = b.gep(pair, p, vec![Operand::i32(1)]);
    let i_next = b.binary(BinOp::Add, i, Operand::i32(1));
    b.switch(i_next, vec![(3, exit)], header);

    b.position_at(exit);
    b.ret(acc_next);
    let id = b.finish();
    add_incoming(&mut module, id, p, p_next, header);
    add_incoming(&mut module, id, acc, acc_next, header);
    add_incoming(&mut module, id, i, i_next, header);

    assert_eq!(run(&module, "sum", &[]), 6);
    let rewrite = assert_preserved(&mut module, "sum", &[]);
    let new_ptr = module.types.pointer(rewrite.mapped(pair));
    assert_eq!(module.function(id).value_type(p), new_ptr);
}

#[test]
fn global_array_uses_decay_to_first_element() {
    let mut module = Module::new();
    let four = module.types.array(TypeId::I32, 4);
    let init = Constant::Array {
        ty: four,
        elems: (1..=4).map(|k| Constant::i32(k * 10)).collect(),
    };
    let table = module.add_global("table", four, Some(init));
    let fn_ty = module.types.function(TypeId::I32, &[TypeId::I32], false);

    let mut b = FunctionBuilder::new(&mut module, "lookup", fn_ty);
    let i = b.param(0);
    let cell = b.gep(four, Constant::Global(table), vec![Operand::i32(0), i.into()]);
    let v = b.load(cell);
    b.ret(v);
    b.finish();

    let rewrite = assert_preserved(&mut module, "lookup", &[3]);
    assert_eq!(rewrite.stats.globals_decayed, 1);
    assert!(matches!(rewrite.global_mapping[0], Constant::Gep { .. }));
    let ptr_i32 = module.types.pointer(TypeId::I32);
    assert_eq!(rewrite.global_mapping[0].ty(&module), ptr_i32);
    assert_eq!(run(&module, "lookup", &[0]), 10);
}

/// `caller` passes a `Buf { [4 x i32] }` by value to `callee`, which
/// writes to its copy unless `readonly`.
fn byval_module(readonly: bool) -> (Module, TypeId) {
    let mut module = Module::new();
    let four = module.types.array(TypeId::I32, 4);
    let buf = plain_struct(&mut module, "Buf", &[four]);
    let ptr_buf = module.types.pointer(buf);
    let callee_ty = module.types.function(TypeId::I32, &[ptr_buf], false);

    let mut b = FunctionBuilder::new(&mut module, "callee", callee_ty);
    b.set_param_byval(0);
    let p = b.param(0);
    let e0 = b.gep_const(buf, p, &[0, 0, 0]);
    let e1 = b.gep_const(buf, p, &[0, 0, 1]);
    let v = b.load(e1);
    if readonly {
        b.set_param_readonly(0);
        b.ret(v);
    } else {
        // Scribble over the copy the caller handed in.
        b.store(Operand::i32(9), e0);
        let w = b.load(e0);
        let sum = b.binary(BinOp::Add, v, w);
        b.ret(sum);
    }
    let callee = b.finish();

    let fn_ty = module.types.function(TypeId::I32, &[], false);
    let mut b = FunctionBuilder::new(&mut module, "caller", fn_ty);
    let slot = b.alloca(buf);
    let e0 = b.gep_const(buf, slot, &[0, 0, 0]);
    let e1 = b.gep_const(buf, slot, &[0, 0, 1]);
    b.store(Operand::i32(1), e0);
    b.store(Operand::i32(5), e1);
    let r = b.call_with_byval(callee, vec![slot.into()], &[0]).unwrap();
    let scaled = b.binary(BinOp::Mul, r, Operand::i32(100));
    let own = b.load(e0);
    let result = b.binary(BinOp::Add, scaled, own);
    b.ret(result);
    b.finish();
    (module, buf)
}

fn caller_byval_args(module: &Module) -> Vec<u32> {
    let caller = module.find_function("caller").unwrap();
    module
        .function(caller)
        .blocks
        .iter()
        .flat_map(|block| &block.body)
        .find_map(|instr| match instr {
            Instr::Call {
                byval_args, args, ..
            } if args.len() == 1 => Some(byval_args.to_vec()),
            _ => None,
        })
        .unwrap()
}

#[test]
fn byval_array_is_copied_by_the_caller() {
    let (mut module, buf) = byval_module(false);
    assert_eq!(run(&module, "caller", &[]), 1401);

    let rewrite = assert_preserved(&mut module, "caller", &[]);
    assert_eq!(rewrite.kind(buf), MappingKind::Collapsed);
    assert_eq!(rewrite.stats.byval_copies, 1);
    let callee = module.find_function("callee").unwrap();
    assert!(!module.function(callee).params[0].byval);
    assert_eq!(caller_byval_args(&module), Vec::<u32>::new());
    assert!(module
        .functions
        .iter()
        .any(|f| f.intrinsic == Some(Intrinsic::Memcpy)));
}

#[test]
fn readonly_callee_skips_the_copy() {
    let (mut module, _) = byval_module(true);
    let rewrite = assert_preserved(&mut module, "caller", &[]);
    assert_eq!(rewrite.stats.byval_copies, 0);
    assert_eq!(caller_byval_args(&module), Vec::<u32>::new());
    assert_eq!(run(&module, "caller", &[]), 501);
}

#[test]
fn copy_policy_always_copies() {
    let (mut module, _) = byval_module(true);
    let config = TypeOptimizerConfig {
        byval_copy: ByValCopyPolicy::Always,
        ..TypeOptimizerConfig::default()
    };
    let rewrite = optimize_with(&mut module, &config);
    assert_eq!(rewrite.stats.byval_copies, 1);
    assert_eq!(run(&module, "caller", &[]), 501);
}

#[test]
fn retyped_intrinsic_is_redirected_and_old_declaration_removed() {
    let mut module = Module::new();
    let cell = plain_struct(&mut module, "Cell", &[TypeId::I32]);
    let ptr_cell = module.types.pointer(cell);
    let (memcpy, _) = module.get_or_insert_intrinsic(Intrinsic::Memcpy, &[ptr_cell, ptr_cell, TypeId::I32]);
    let old_name = module.function(memcpy).name.clone();
    let fn_ty = module.types.function(TypeId::I32, &[], false);

    let mut b = FunctionBuilder::new(&mut module, "f", fn_ty);
    let src = b.alloca(cell);
    let dst = b.alloca(cell);
    let src_value = b.gep_const(cell, src, &[0, 0]);
    b.store(Operand::i32(42), src_value);
    b.call(memcpy, vec![dst.into(), src.into(), Operand::i32(4)]);
    let dst_value = b.gep_const(cell, dst, &[0, 0]);
    let v = b.load(dst_value);
    b.ret(v);
    b.finish();

    let rewrite = assert_preserved(&mut module, "f", &[]);
    assert_eq!(rewrite.stats.intrinsics_redirected, 1);
    assert_eq!(rewrite.stats.intrinsics_removed, 1);
    assert_eq!(module.find_function(&old_name), None);
    let ptr_i32 = module.types.pointer(TypeId::I32);
    let new_name = Intrinsic::Memcpy.mangled_name(&module.types, &[ptr_i32, ptr_i32, TypeId::I32]);
    assert!(module.find_function(&new_name).is_some());
}

#[test]
fn upcast_to_collapsed_base_becomes_address() {
    let mut module = Module::new();
    let base = plain_struct(&mut module, "Base", &[TypeId::I32]);
    let derived = module.types.derived_struct(
        Some("Derived"),
        base,
        &[TypeId::I32, TypeId::I32],
        StructAttrs::empty(),
    );
    let ptr_base = module.types.pointer(base);
    let ptr_derived = module.types.pointer(derived);
    let (upcast, _) = module.get_or_insert_intrinsic(Intrinsic::UpcastCollapsed, &[ptr_base, ptr_derived]);
    let fn_ty = module.types.function(TypeId::I32, &[], false);

    let mut b = FunctionBuilder::new(&mut module, "f", fn_ty);
    let obj = b.alloca(derived);
    let first = b.gep_const(derived, obj, &[0, 0]);
    let second = b.gep_const(derived, obj, &[0, 1]);
    b.store(Operand::i32(11), first);
    b.store(Operand::i32(22), second);
    let as_base = b.call(upcast, vec![obj.into()]).unwrap();
    let member = b.gep_const(base, as_base, &[0, 0]);
    let v = b.load(member);
    b.ret(v);
    b.finish();

    let rewrite = assert_preserved(&mut module, "f", &[]);
    assert_eq!(rewrite.kind(base), MappingKind::Collapsed);
    assert_eq!(rewrite.kind(derived), MappingKind::Identical);
    // The call became an address computation and its declarations went away.
    assert!(module
        .functions
        .iter()
        .all(|f| f.intrinsic != Some(Intrinsic::UpcastCollapsed)));
}

#[test]
fn declarations_take_mapped_signatures() {
    let mut module = Module::new();
    let inner = plain_struct(&mut module, "Inner", &[TypeId::I32]);
    let ptr_inner = module.types.pointer(inner);
    let ext_ty = module.types.function(TypeId::VOID, &[ptr_inner], false);
    let ext = module.declare("ext", ext_ty);

    let config = TypeOptimizerConfig::default();
    optimize_with(&mut module, &config);

    let ptr_i32 = module.types.pointer(TypeId::I32);
    let expected = module.types.function(TypeId::VOID, &[ptr_i32], false);
    assert_eq!(module.function(ext).fn_type(&module.types), expected);
    let param = module.function(ext).params[0].value;
    assert_eq!(module.function(ext).value_type(param), ptr_i32);
}

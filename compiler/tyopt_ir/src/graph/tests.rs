use pretty_assertions::assert_eq;

use crate::ir::{Block, Module, Operand};
use crate::ty::TypeId;

use super::*;

fn b(n: u32) -> BlockId {
    BlockId::new(n)
}

fn block(id: u32, terminator: Terminator) -> Block {
    Block {
        id: b(id),
        body: vec![],
        terminator,
    }
}

fn func_with(blocks: Vec<Block>) -> Function {
    let mut module = Module::new();
    let fn_ty = module.types.function(TypeId::VOID, &[TypeId::I1], false);
    let ptr = module.types.pointer(fn_ty);
    let mut func = Function::declaration(&module.types, "f", ptr);
    func.blocks = blocks;
    func
}

fn cond(then_block: u32, else_block: u32) -> Terminator {
    Terminator::CondBr {
        cond: Operand::Local(crate::ir::ValueId::new(0)),
        then_block: b(then_block),
        else_block: b(else_block),
    }
}

#[test]
fn declaration_has_no_order() {
    assert!(reachable_order(&func_with(vec![])).is_empty());
}

#[test]
fn diamond_lists_both_arms_before_join() {
    // B0 -> B1, B0 -> B2, B1 -> B3, B2 -> B3
    let func = func_with(vec![
        block(0, cond(1, 2)),
        block(1, Terminator::Br { target: b(3) }),
        block(2, Terminator::Br { target: b(3) }),
        block(3, Terminator::Ret { value: None }),
    ]);
    assert_eq!(reachable_order(&func), vec![b(0), b(1), b(2), b(3)]);
}

#[test]
fn discovery_follows_the_discovering_block() {
    // B0 -> B3, B0 -> B1, B3 -> B2
    let func = func_with(vec![
        block(0, cond(3, 1)),
        block(1, Terminator::Ret { value: None }),
        block(2, Terminator::Ret { value: None }),
        block(3, Terminator::Br { target: b(2) }),
    ]);
    assert_eq!(reachable_order(&func), vec![b(0), b(3), b(1), b(2)]);
}

#[test]
fn unreachable_blocks_come_last() {
    let func = func_with(vec![
        block(0, Terminator::Br { target: b(2) }),
        block(1, Terminator::Br { target: b(2) }),
        block(2, Terminator::Ret { value: None }),
        block(3, Terminator::Unreachable),
    ]);
    assert_eq!(reachable_order(&func), vec![b(0), b(2), b(1), b(3)]);
    assert_eq!(reachable_mask(&func), vec![true, false, true, false]);
}

#[test]
fn loops_visit_each_block_once() {
    // B0 -> B1 <-> B2, B1 -> B3
    let func = func_with(vec![
        block(0, Terminator::Br { target: b(1) }),
        block(1, cond(2, 3)),
        block(2, Terminator::Br { target: b(1) }),
        block(3, Terminator::Ret { value: None }),
    ]);
    assert_eq!(reachable_order(&func), vec![b(0), b(1), b(2), b(3)]);
}

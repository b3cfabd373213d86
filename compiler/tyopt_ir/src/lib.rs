//! Program model for the type-layout optimizer.
//!
//! This crate provides:
//!
//! - **Types** ([`TypeId`], [`TypeKind`], [`TypePool`]): an append-only
//!   arena of type nodes. Non-struct types are structurally interned,
//!   structs are nominal and may be recursive. Struct properties live in a
//!   single [`StructAttrs`] set.
//!
//! - **Data layout** ([`DataLayout`], [`TargetLayout`]): allocation sizes and
//!   field byte offsets.
//!
//! - **SSA IR** ([`Module`], [`Function`], [`Block`], [`Instr`],
//!   [`Terminator`], [`Constant`]): typed pointers, address computations
//!   over an explicit element type, and a catalogue of backend
//!   [`Intrinsic`]s.
//!
//! - **Construction and traversal** ([`FunctionBuilder`],
//!   [`graph::reachable_order`]).
//!
//! # Crate Dependencies
//!
//! No dependency on the optimizer itself. `tyopt_layout` consumes this crate
//! and produces a rewritten [`Module`] over the same [`TypePool`].

mod builder;
pub mod graph;
mod intrinsic;
pub mod ir;
mod layout;
mod oracle;
mod pool;
mod ty;

pub use builder::FunctionBuilder;
pub use intrinsic::Intrinsic;
pub use ir::{
    BinOp, Block, BlockId, Callee, CastOp, Constant, FuncId, Function, Global, GlobalId, Instr,
    Module, Operand, Param, Terminator, ValueId,
};
pub use layout::{DataLayout, TargetLayout};
pub use oracle::{AttributeOracle, PointerKindOracle};
pub use pool::{TypeDisplay, TypePool};
pub use ty::{StructAttrs, StructType, TypeId, TypeKind};

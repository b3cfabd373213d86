//! CFG traversal helpers.
//!
//! The layout rewriter visits blocks so that every value is rewritten
//! before its ordinary uses: entry first, then successors in discovery
//! order, then whatever the walk never reached.

use smallvec::SmallVec;

use crate::ir::{BlockId, Function, Terminator};

/// Successor blocks of a terminator.
#[inline]
pub fn successor_block_ids(terminator: &Terminator) -> SmallVec<[BlockId; 4]> {
    terminator.successors()
}

/// Blocks of `func` in rewrite order.
///
/// The entry block comes first. Each listed block then appends its not yet
/// listed successors, left to right, so a block always follows the block
/// that discovered it (and therefore all of its dominators). Unreachable
/// blocks follow in index order. Every block appears exactly once.
/// Declarations yield an empty list.
pub fn reachable_order(func: &Function) -> Vec<BlockId> {
    let num_blocks = func.blocks.len();
    let mut order: Vec<BlockId> = Vec::with_capacity(num_blocks);
    if num_blocks == 0 {
        return order;
    }
    let mut listed = vec![false; num_blocks];
    listed[func.entry.index()] = true;
    order.push(func.blocks[func.entry.index()].id);

    // The list grows while it is walked.
    let mut cursor = 0;
    while cursor < order.len() {
        let block = &func.blocks[order[cursor].index()];
        for succ in successor_block_ids(&block.terminator) {
            let succ_idx = succ.index();
            if succ_idx < num_blocks && !listed[succ_idx] {
                listed[succ_idx] = true;
                order.push(succ);
            }
        }
        cursor += 1;
    }

    for (block_idx, seen) in listed.iter().enumerate() {
        if !seen {
            order.push(func.blocks[block_idx].id);
        }
    }
    order
}

/// Whether each block is reachable from the entry, indexed by block index.
pub fn reachable_mask(func: &Function) -> Vec<bool> {
    let mut mask = vec![false; func.blocks.len()];
    let mut stack = vec![func.entry.index()];
    while let Some(idx) = stack.pop() {
        if idx >= mask.len() || mask[idx] {
            continue;
        }
        mask[idx] = true;
        stack.extend(
            successor_block_ids(&func.blocks[idx].terminator)
                .iter()
                .map(|b| b.index()),
        );
    }
    mask
}

#[cfg(test)]
mod tests;

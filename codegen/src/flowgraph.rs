//! A control flow graph represented as mappings of basic blocks to their
//! predecessors and successors.
//!
//! Successors are read off each block's terminator; predecessors are the
//! reverse relation. Construction walks the blocks reachable from the
//! entry, so unreachable blocks end up with empty edge lists; deleting them
//! from the layout is the caller's responsibility (see
//! [`ControlFlowGraph::unreachable_blocks`]).

use crate::ir::{Block, Function};
use carve_entity::{EntitySet, SecondaryMap};

/// Incoming and outgoing edges of one block.
#[derive(Clone, Default)]
struct CfgNode {
    predecessors: Vec<Block>,
    successors: Vec<Block>,
}

/// The control flow graph of one function.
pub struct ControlFlowGraph {
    data: SecondaryMap<Block, CfgNode>,
    reachable: EntitySet<Block>,
    /// Post-order of the reachable blocks; the entry is last.
    postorder: Vec<Block>,
    valid: bool,
}

impl ControlFlowGraph {
    /// Allocate a new blank control flow graph.
    pub fn new() -> Self {
        Self {
            data: SecondaryMap::new(),
            reachable: EntitySet::new(),
            postorder: Vec::new(),
            valid: false,
        }
    }

    /// Allocate and compute the control flow graph of `func`.
    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::new();
        cfg.compute(func);
        cfg
    }

    /// Compute the control flow graph of `func`, replacing any previous
    /// contents.
    pub fn compute(&mut self, func: &Function) {
        self.clear();

        // Depth-first walk from the entry. A block is pushed once (SEEN),
        // then revisited after its successors to record the post-order.
        enum Visit {
            First(Block),
            Again(Block),
        }
        let mut stack = vec![Visit::First(func.entry_block())];
        self.reachable.insert(func.entry_block());

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::First(block) => {
                    stack.push(Visit::Again(block));
                    for succ in func.successors(block) {
                        self.add_edge(block, succ);
                        if self.reachable.insert(succ) {
                            stack.push(Visit::First(succ));
                        }
                    }
                }
                Visit::Again(block) => self.postorder.push(block),
            }
        }

        self.valid = true;
    }

    /// Clear all data structures in this control flow graph.
    pub fn clear(&mut self) {
        self.data.clear();
        self.reachable.clear();
        self.postorder.clear();
        self.valid = false;
    }

    fn add_edge(&mut self, from: Block, to: Block) {
        let succs = &mut self.data[from].successors;
        // A branch with both arms on the same block contributes one edge.
        if !succs.contains(&to) {
            succs.push(to);
        }
        let preds = &mut self.data[to].predecessors;
        if !preds.contains(&from) {
            preds.push(from);
        }
    }

    /// The predecessors of `block`.
    pub fn preds(&self, block: Block) -> &[Block] {
        &self.data[block].predecessors
    }

    /// The successors of `block`.
    pub fn succs(&self, block: Block) -> &[Block] {
        &self.data[block].successors
    }

    /// Is `block` reachable from the entry?
    pub fn is_reachable(&self, block: Block) -> bool {
        self.reachable.contains(block)
    }

    /// Post-order of the reachable blocks. The entry block is last, so
    /// iterating in reverse gives a reverse post-order.
    pub fn postorder(&self) -> &[Block] {
        debug_assert!(self.valid);
        &self.postorder
    }

    /// Blocks present in the layout of `func` but not reachable from its
    /// entry. The caller decides when to delete them.
    pub fn unreachable_blocks(&self, func: &Function) -> Vec<Block> {
        func.layout
            .blocks()
            .filter(|&b| !self.is_reachable(b))
            .collect()
    }

    /// Check if the CFG is in a valid state. This only tracks whether
    /// `compute()` has run since the last `clear()`.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ControlFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, Function, IntCC, Operand, Signature};

    #[test]
    fn branches_and_jumps() {
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let block0 = func.entry_block();
        let block1 = func.add_block();
        let block2 = func.add_block();
        let cond = func.params[0];

        let c = func.icmp(block0, IntCC::NotEqual, cond, Operand::Imm32(0));
        func.branch(block0, c, block2, block1);
        func.jump(block1, block2);
        func.ret(block2, Some(Operand::Imm32(0)));

        let cfg = ControlFlowGraph::with_function(&func);

        assert_eq!(cfg.preds(block0), &[]);
        assert_eq!(cfg.succs(block0), &[block2, block1]);
        assert_eq!(cfg.preds(block1), &[block0]);
        assert_eq!(cfg.preds(block2), &[block0, block1]);
        assert_eq!(cfg.succs(block2), &[]);
        assert_eq!(cfg.postorder().last(), Some(&block0));
    }

    #[test]
    fn unreachable_blocks_reported() {
        let mut func = Function::with_name_signature("g", Signature::new(vec![], I32));
        let block0 = func.entry_block();
        let dead = func.add_block();
        func.ret(block0, Some(Operand::Imm32(1)));
        func.ret(dead, Some(Operand::Imm32(2)));

        let cfg = ControlFlowGraph::with_function(&func);
        assert!(cfg.is_reachable(block0));
        assert!(!cfg.is_reachable(dead));
        assert_eq!(cfg.unreachable_blocks(&func), vec![dead]);
    }

    #[test]
    fn duplicate_edges_collapse() {
        let mut func = Function::with_name_signature("h", Signature::new(vec![I32], I32));
        let block0 = func.entry_block();
        let block1 = func.add_block();
        let c = func.params[0];
        // Both arms target the same block.
        func.branch(block0, c, block1, block1);
        func.ret(block1, Some(Operand::Imm32(0)));

        let cfg = ControlFlowGraph::with_function(&func);
        assert_eq!(cfg.succs(block0), &[block1]);
        assert_eq!(cfg.preds(block1), &[block0]);
    }
}

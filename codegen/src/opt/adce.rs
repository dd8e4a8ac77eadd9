//! Aggressive dead code elimination.
//!
//! Instead of proving instructions dead, this pass proves them live.
//! Stores, calls, and returns seed the live set; liveness then spreads to
//! the definitions of operands, to the terminators of φ-predecessors, and
//! — through the post-dominance frontier — to the conditional branches the
//! live code is control dependent on. Whatever remains unmarked is
//! deleted, and a block whose conditional branch turned out dead jumps
//! straight to its immediate post-dominator.

use crate::dominance::PostDominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::fx::{FxHashMap, FxHashSet};
use crate::ir::{Block, Function, Inst, InstructionData, Operand, ValueDef};
use crate::opt::prune_phi_incomings;

/// Perform ADCE on `func`. Returns whether anything was removed.
pub fn do_adce(func: &mut Function, cfg: &ControlFlowGraph, pdt: &PostDominatorTree) -> bool {
    let mut live: FxHashSet<Inst> = FxHashSet::default();
    let mut worklist: Vec<Inst> = Vec::new();
    let inst_block: FxHashMap<Inst, Block> = crate::opt::inst_blocks(func);

    let mut mark = |inst: Inst, live: &mut FxHashSet<Inst>, worklist: &mut Vec<Inst>| {
        if live.insert(inst) {
            worklist.push(inst);
        }
    };

    // Seeds: effects the program must keep. Terminators of blocks outside
    // the post-dominance relation (infinite loops) can't be reasoned
    // about, so they stay too.
    for &block in cfg.postorder() {
        if !pdt.is_reachable(block) {
            mark(func.terminator(block), &mut live, &mut worklist);
        }
        for &inst in func.block_insts(block) {
            if matches!(
                func.dfg[inst],
                InstructionData::Store { .. }
                    | InstructionData::Call { .. }
                    | InstructionData::Return { .. }
            ) {
                mark(inst, &mut live, &mut worklist);
            }
        }
    }

    while let Some(inst) = worklist.pop() {
        let block = inst_block[&inst];

        // Definitions feeding a live instruction are live.
        match &func.dfg[inst] {
            InstructionData::Phi { args } => {
                for &(pred, op) in args {
                    if let Operand::Value(v) = op {
                        if let ValueDef::Inst(def) = func.dfg.value_def(v) {
                            if inst_block.contains_key(&def) {
                                mark(def, &mut live, &mut worklist);
                            }
                        }
                    }
                    // The merge is only meaningful if the edge is taken, so
                    // the predecessor's terminator matters.
                    if cfg.is_reachable(pred) {
                        mark(func.terminator(pred), &mut live, &mut worklist);
                    }
                }
            }
            data => {
                for op in data.arguments() {
                    if let Operand::Value(v) = op {
                        if let ValueDef::Inst(def) = func.dfg.value_def(v) {
                            if inst_block.contains_key(&def) {
                                mark(def, &mut live, &mut worklist);
                            }
                        }
                    }
                }
            }
        }

        // Control dependence: the branches deciding whether `block` runs.
        for cd in pdt.frontier(block) {
            if cfg.is_reachable(cd) {
                mark(func.terminator(cd), &mut live, &mut worklist);
            }
        }
    }

    // Sweep.
    let mut changed = false;
    for &block in cfg.postorder() {
        let dead: Vec<Inst> = func
            .block_insts(block)
            .iter()
            .copied()
            .filter(|&inst| !live.contains(&inst) && !func.dfg[inst].is_terminator())
            .collect();
        for inst in dead {
            log::trace!("{}: adce removes {}", func.name, func.dfg.display_inst(inst));
            func.remove_inst(block, inst);
            changed = true;
        }
    }

    // Dead conditional branches fall through to the nearest
    // post-dominator.
    for &block in cfg.postorder() {
        let term = func.terminator(block);
        if live.contains(&term) {
            continue;
        }
        if !matches!(func.dfg[term], InstructionData::Branch { .. }) {
            continue;
        }
        let Some(target) = pdt.ipdom(block) else {
            continue;
        };
        log::debug!(
            "{}: rewriting dead branch in {block} to jump {target}",
            func.name
        );
        func.remove_inst(block, term);
        func.jump(block, target);
        changed = true;
    }

    if changed {
        let cfg = ControlFlowGraph::with_function(func);
        prune_phi_incomings(func, &cfg);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, IntCC, Opcode, Signature};
    use crate::opt::remove_unreachable_blocks;
    use crate::verifier::verify_function;

    fn analyses(func: &Function) -> (ControlFlowGraph, PostDominatorTree) {
        let cfg = ControlFlowGraph::with_function(func);
        let pdt = PostDominatorTree::with_function(func, &cfg);
        (cfg, pdt)
    }

    #[test]
    fn removes_dead_computation() {
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let a = func.params[0];
        let dead = func.binary(b0, Opcode::Imul, I32, a, a);
        let _ = dead;
        func.ret(b0, Some(Operand::Value(a)));

        let (cfg, pdt) = analyses(&func);
        assert!(do_adce(&mut func, &cfg, &pdt));
        assert_eq!(func.block_insts(b0).len(), 1);
        assert_eq!(verify_function(&func), Ok(()));
    }

    #[test]
    fn folds_branch_that_guards_nothing() {
        // Both arms are empty of effects; the diamond collapses into a
        // straight jump to the join.
        let mut func = Function::with_name_signature("g", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        let c = func.icmp(b0, IntCC::NotEqual, func.params[0], Operand::Imm32(0));
        func.branch(b0, c, b1, b2);
        let x = func.binary(b1, Opcode::Iadd, I32, func.params[0], Operand::Imm32(1));
        let _ = x;
        func.jump(b1, b3);
        func.jump(b2, b3);
        func.ret(b3, Some(Operand::Imm32(9)));

        let (cfg, pdt) = analyses(&func);
        assert!(do_adce(&mut func, &cfg, &pdt));
        assert!(remove_unreachable_blocks(&mut func));
        assert_eq!(verify_function(&func), Ok(()));
        assert!(matches!(
            func.dfg[func.terminator(b0)],
            InstructionData::Jump { dest } if dest == b3
        ));
    }

    #[test]
    fn keeps_branch_guarding_store() {
        let mut func = Function::with_name_signature("h", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let slot = func.stack_alloc(b0, I32, 1);
        let c = func.icmp(b0, IntCC::NotEqual, func.params[0], Operand::Imm32(0));
        func.branch(b0, c, b1, b2);
        func.store(b1, Operand::Imm32(1), slot);
        func.jump(b1, b2);
        let out = func.load(b2, I32, slot);
        func.ret(b2, Some(Operand::Value(out)));

        let (cfg, pdt) = analyses(&func);
        do_adce(&mut func, &cfg, &pdt);
        assert_eq!(verify_function(&func), Ok(()));
        // The branch guards the store and must survive.
        assert!(matches!(
            func.dfg[func.terminator(b0)],
            InstructionData::Branch { .. }
        ));
    }

    #[test]
    fn phi_feeding_return_stays() {
        let mut func = Function::with_name_signature("p", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        let c = func.icmp(b0, IntCC::NotEqual, func.params[0], Operand::Imm32(0));
        func.branch(b0, c, b1, b2);
        func.jump(b1, b3);
        func.jump(b2, b3);
        let p = func.phi(b3, I32, [(b1, Operand::Imm32(1)), (b2, Operand::Imm32(2))]);
        func.ret(b3, Some(Operand::Value(p)));

        let (cfg, pdt) = analyses(&func);
        let changed = do_adce(&mut func, &cfg, &pdt);
        assert_eq!(verify_function(&func), Ok(()));
        // The φ distinguishes the arms, so the branch stays live and the
        // CFG is untouched.
        assert!(!changed);
        assert!(matches!(
            func.dfg[func.terminator(b0)],
            InstructionData::Branch { .. }
        ));
    }
}

//! IR verifier.
//!
//! Checks the structural invariants every pass relies on and every pass
//! must re-establish:
//!
//! - every block in the layout is non-empty, ends with exactly one
//!   terminator, and has no terminator in the middle;
//! - φ-instructions precede all non-φ instructions;
//! - the entry block has no predecessors;
//! - branch targets are blocks in the layout;
//! - every instruction is linked into at most one block, and every value
//!   has exactly one definition;
//! - the φ-incoming labels of a block equal its predecessor set;
//! - every use is dominated by its definition (through the paired
//!   predecessor for φ-incomings).
//!
//! Passes assume their inputs are valid and may skip checks in release
//! builds; the test suite runs the verifier after every pass instead.

use crate::dominance::DominatorTree;
use crate::flowgraph::ControlFlowGraph;
use crate::fx::FxHashMap;
use crate::ir::{Block, Function, InstructionData, Operand, Value, ValueDef};
use crate::result::{CodegenError, CodegenResult};

macro_rules! verify {
    ($cond:expr, $($fmt:tt)*) => {
        if !$cond {
            return Err(CodegenError::Verifier(format!($($fmt)*)));
        }
    };
}

/// Verify `func`, reporting the first violated invariant.
pub fn verify_function(func: &Function) -> CodegenResult<()> {
    verify!(
        func.layout.num_blocks() > 0,
        "function {} has no blocks",
        func.name
    );

    let mut inst_home: FxHashMap<crate::ir::Inst, Block> = FxHashMap::default();

    for block in func.layout.blocks() {
        let insts = func.block_insts(block);
        verify!(!insts.is_empty(), "{}: {block} is empty", func.name);

        let mut seen_non_phi = false;
        for (i, &inst) in insts.iter().enumerate() {
            let data = &func.dfg[inst];
            let last = i == insts.len() - 1;
            verify!(
                data.is_terminator() == last,
                "{}: {block} has a misplaced terminator or non-terminator tail: {}",
                func.name,
                func.dfg.display_inst(inst)
            );
            if data.is_phi() {
                verify!(
                    !seen_non_phi,
                    "{}: φ after non-φ in {block}",
                    func.name
                );
            } else {
                seen_non_phi = true;
            }
            verify!(
                inst_home.insert(inst, block).is_none(),
                "{}: {inst} linked into two blocks",
                func.name
            );
            for dest in data.branch_targets() {
                verify!(
                    func.layout.is_inserted(dest),
                    "{}: {block} branches to {dest} which is not in the layout",
                    func.name
                );
            }
        }
    }

    // Value definitions point back at a linked instruction or a parameter.
    for inst in func.dfg.insts() {
        if let Some(result) = func.dfg.inst_result(inst) {
            if inst_home.contains_key(&inst) {
                verify!(
                    func.dfg.value_def(result) == ValueDef::Inst(inst),
                    "{}: result of {inst} has a foreign definition",
                    func.name
                );
            }
        }
    }

    let cfg = ControlFlowGraph::with_function(func);
    let domtree = DominatorTree::with_function(func, &cfg);

    verify!(
        cfg.preds(func.entry_block()).is_empty(),
        "{}: entry block has predecessors",
        func.name
    );

    // φ-incomings cover exactly the predecessor set.
    for block in func.layout.blocks() {
        if !cfg.is_reachable(block) {
            continue;
        }
        let mut preds: Vec<Block> = cfg.preds(block).to_vec();
        preds.sort();
        for &phi in func.phis(block) {
            if let InstructionData::Phi { args } = &func.dfg[phi] {
                let mut labels: Vec<Block> = args.iter().map(|(b, _)| *b).collect();
                labels.sort();
                verify!(
                    labels == preds,
                    "{}: φ {} in {block} does not cover the predecessor set",
                    func.name,
                    func.dfg.display_inst(phi)
                );
            }
        }
    }

    // Dominance of uses.
    let def_location = |value: Value| -> Option<(Block, usize)> {
        match func.dfg.value_def(value) {
            ValueDef::Param(_) => None,
            ValueDef::Inst(inst) => {
                let block = *inst_home.get(&inst)?;
                let pos = func
                    .block_insts(block)
                    .iter()
                    .position(|&i| i == inst)
                    .unwrap();
                Some((block, pos))
            }
        }
    };

    for block in func.layout.blocks() {
        if !cfg.is_reachable(block) {
            continue;
        }
        for (use_pos, &inst) in func.block_insts(block).iter().enumerate() {
            let data = &func.dfg[inst];
            if let InstructionData::Phi { args } = data {
                for &(pred, op) in args {
                    let Some(value) = op.as_value() else { continue };
                    let Some((def_block, _)) = def_location(value) else {
                        continue;
                    };
                    verify!(
                        domtree.dominates(def_block, pred),
                        "{}: φ-incoming {value} from {pred} is not dominated by its def in {def_block}",
                        func.name
                    );
                }
                continue;
            }
            for op in data.arguments() {
                let Operand::Value(value) = op else { continue };
                let Some((def_block, def_pos)) = def_location(value) else {
                    // Parameters dominate everything; unlinked defs are
                    // caught above.
                    continue;
                };
                if def_block == block {
                    verify!(
                        def_pos < use_pos,
                        "{}: {value} used before its definition in {block}",
                        func.name
                    );
                } else {
                    verify!(
                        domtree.dominates(def_block, block),
                        "{}: use of {value} in {block} is not dominated by its def in {def_block}",
                        func.name
                    );
                }
            }
        }
    }

    Ok(())
}

/// Verify every defined function in `module`.
pub fn verify_module(module: &crate::ir::Module) -> CodegenResult<()> {
    for fr in module.defined_functions().collect::<Vec<_>>() {
        verify_function(module.functions[fr].body().unwrap())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, IntCC, Signature};

    #[test]
    fn accepts_well_formed() {
        let mut func = Function::with_name_signature("ok", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let c = func.icmp(b0, IntCC::NotEqual, func.params[0], Operand::Imm32(0));
        func.branch(b0, c, b1, b2);
        func.ret(b1, Some(Operand::Imm32(1)));
        func.ret(b2, Some(Operand::Imm32(2)));
        assert_eq!(verify_function(&func), Ok(()));
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut func = Function::with_name_signature("bad", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let _ = func.binary(b0, crate::ir::Opcode::Iadd, I32, func.params[0], Operand::Imm32(1));
        assert!(verify_function(&func).is_err());
    }

    #[test]
    fn rejects_use_before_def() {
        let mut func = Function::with_name_signature("ubd", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        // Build a + 1 then swap it before its own operand's def by hand.
        let x = func.binary(b0, crate::ir::Opcode::Iadd, I32, func.params[0], Operand::Imm32(1));
        let y = func.binary(b0, crate::ir::Opcode::Iadd, I32, x, Operand::Imm32(2));
        func.ret(b0, Some(Operand::Value(y)));
        let mut insts = func.block_insts(b0).to_vec();
        insts.swap(0, 1);
        func.set_block_insts(b0, insts);
        assert!(verify_function(&func).is_err());
    }

    #[test]
    fn rejects_phi_pred_mismatch() {
        let mut func = Function::with_name_signature("pm", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let c = func.icmp(b0, IntCC::NotEqual, func.params[0], Operand::Imm32(0));
        func.branch(b0, c, b1, b2);
        func.jump(b1, b2);
        // φ only mentions b1, but b2's predecessors are {b0, b1}.
        let p = func.phi(b2, I32, [(b1, Operand::Imm32(1))]);
        func.ret(b2, Some(Operand::Value(p)));
        assert!(verify_function(&func).is_err());
    }
}

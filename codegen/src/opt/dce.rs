//! Dead code elimination.
//!
//! Dead code here means instructions that have no side effects and whose
//! result value has no remaining uses. Deleting one instruction can kill
//! the uses feeding it, so the pass iterates to a fixpoint.

use crate::ir::{Block, Function, Inst};
use crate::opt::use_counts;

/// Perform DCE on `func`. Returns whether anything was removed.
pub fn do_dce(func: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let counts = use_counts(func);
        let mut any = false;
        let blocks: Vec<Block> = func.layout.blocks().collect();
        for block in blocks {
            let dead: Vec<Inst> = func
                .block_insts(block)
                .iter()
                .copied()
                .filter(|&inst| {
                    let data = &func.dfg[inst];
                    if data.has_side_effects() {
                        return false;
                    }
                    match func.dfg.inst_result(inst) {
                        Some(result) => counts[result] == 0,
                        None => false,
                    }
                })
                .collect();
            for inst in dead {
                log::trace!("{}: dce removes {}", func.name, func.dfg.display_inst(inst));
                func.remove_inst(block, inst);
                any = true;
            }
        }
        if !any {
            break;
        }
        changed = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, Function, Opcode, Operand, Signature};
    use crate::verifier::verify_function;

    #[test]
    fn removes_chains_of_dead_code() {
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let a = func.params[0];
        // x feeds only y; y feeds nothing. Both must go, in one run.
        let x = func.binary(b0, Opcode::Iadd, I32, a, Operand::Imm32(1));
        let _y = func.binary(b0, Opcode::Imul, I32, x, Operand::Imm32(2));
        let kept = func.binary(b0, Opcode::Isub, I32, a, Operand::Imm32(3));
        func.ret(b0, Some(Operand::Value(kept)));

        assert!(do_dce(&mut func));
        assert_eq!(func.block_insts(b0).len(), 2);
        assert_eq!(verify_function(&func), Ok(()));
    }

    #[test]
    fn keeps_side_effects() {
        let mut func = Function::with_name_signature("g", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let slot = func.stack_alloc(b0, I32, 1);
        func.store(b0, Operand::Imm32(7), slot);
        func.ret(b0, Some(Operand::Imm32(0)));

        // The store keeps itself and the alloca alive.
        assert!(!do_dce(&mut func));
        assert_eq!(func.block_insts(b0).len(), 3);
    }

    #[test]
    fn idempotent() {
        let mut func = Function::with_name_signature("h", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let a = func.params[0];
        let _dead = func.binary(b0, Opcode::Iadd, I32, a, a);
        func.ret(b0, Some(Operand::Value(a)));

        assert!(do_dce(&mut func));
        let after_first: Vec<_> = func.block_insts(b0).to_vec();
        assert!(!do_dce(&mut func));
        assert_eq!(func.block_insts(b0), &after_first[..]);
    }
}

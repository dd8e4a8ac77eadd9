//! Control flow simplification.
//!
//! Removes forwarding blocks: a non-entry block whose single instruction is
//! an unconditional jump can be deleted once every branch that targeted it
//! is redirected to its destination. A forwarding block is kept when a φ in
//! the destination names it, since that φ distinguishes the edge. Repeats
//! to a fixpoint.

use crate::ir::{Block, Function, InstructionData};

/// Perform control flow simplification on `func`. Returns whether any
/// block was removed.
pub fn do_simplify_cfg(func: &mut Function) -> bool {
    let mut changed = false;
    loop {
        let Some((block, dest)) = find_forwarding_block(func) else {
            break;
        };
        log::debug!("{}: forwarding {block} into {dest}", func.name);

        let blocks: Vec<Block> = func.layout.blocks().collect();
        for b in blocks {
            let term = func.terminator(b);
            func.dfg[term].map_branch_targets(|t| if t == block { dest } else { t });
        }
        func.layout.remove_block(block);
        changed = true;
    }
    changed
}

fn find_forwarding_block(func: &Function) -> Option<(Block, Block)> {
    for block in func.layout.blocks() {
        if block == func.entry_block() {
            continue;
        }
        let insts = func.block_insts(block);
        if insts.len() != 1 {
            continue;
        }
        let InstructionData::Jump { dest } = func.dfg[insts[0]] else {
            continue;
        };
        if dest == block {
            continue;
        }
        let phi_refers_block = func.phis(dest).iter().any(|&phi| {
            match &func.dfg[phi] {
                InstructionData::Phi { args } => args.iter().any(|&(pred, _)| pred == block),
                _ => false,
            }
        });
        if !phi_refers_block {
            return Some((block, dest));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{types::I32, Function, IntCC, Operand, Signature};
    use crate::verifier::verify_function;

    #[test]
    fn removes_forwarding_chain() {
        // b0 -> b1 -> b2 -> ret; b1 and b2 forward.
        let mut func = Function::with_name_signature("f", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        let b3 = func.add_block();
        func.jump(b0, b1);
        func.jump(b1, b2);
        func.jump(b2, b3);
        func.ret(b3, Some(Operand::Imm32(0)));

        assert!(do_simplify_cfg(&mut func));
        assert_eq!(func.layout.num_blocks(), 2);
        assert_eq!(func.successors(b0).as_slice(), &[b3]);
        assert_eq!(verify_function(&func), Ok(()));
    }

    #[test]
    fn keeps_blocks_named_by_phis() {
        // A diamond whose arms only jump; the φ in the join still needs to
        // tell the edges apart, so neither arm may be removed.
        let mut func = Function::with_name_signature("g", Signature::new(vec![I32], I32));
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

        assert!(!do_simplify_cfg(&mut func));
        assert_eq!(func.layout.num_blocks(), 4);
    }

    #[test]
    fn idempotent() {
        let mut func = Function::with_name_signature("h", Signature::new(vec![I32], I32));
        let b0 = func.entry_block();
        let b1 = func.add_block();
        let b2 = func.add_block();
        func.jump(b0, b1);
        func.jump(b1, b2);
        func.ret(b2, Some(Operand::Imm32(0)));

        assert!(do_simplify_cfg(&mut func));
        assert!(!do_simplify_cfg(&mut func));
        assert_eq!(verify_function(&func), Ok(()));
    }
}
